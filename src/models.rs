//! Persisted directory and ledger records.
//!
//! All of these are CBOR encoded. Records that reference each other do so
//! through bech32 ids, never by embedding.
use crate::choices::{
    AllocationStatus, AllocationUserStatus, AttributeType, ProjectRemovalStatus,
    ProjectStatus, ProjectUserRole, ProjectUserStatus,
};
use crate::cbor_record;
use crate::types::{ServiceUnits, TimeStamp};

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub id: String, // user_
    #[n(1)]
    pub username: String,
    #[n(2)]
    pub email: String,
    #[n(3)]
    pub first_name: String,
    #[n(4)]
    pub last_name: String,
    #[n(5)]
    pub is_superuser: bool,
}
cbor_record!(User, "user", "User");

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Project {
    #[n(0)]
    pub id: String, // proj_
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub status: ProjectStatus,
}
cbor_record!(Project, "project", "Project");

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ProjectUser {
    #[n(0)]
    pub id: String, // pu_
    #[n(1)]
    pub project_id: String,
    #[n(2)]
    pub user_id: String,
    #[n(3)]
    pub role: ProjectUserRole,
    #[n(4)]
    pub status: ProjectUserStatus,
}
cbor_record!(ProjectUser, "project-user", "ProjectUser");

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ProjectUserRemovalRequest {
    #[n(0)]
    pub id: String, // rm_
    #[n(1)]
    pub project_user_id: String,
    #[n(2)]
    pub requester_id: String,
    #[n(3)]
    pub status: ProjectRemovalStatus,
    #[n(4)]
    pub request_time: TimeStamp,
    #[n(5)]
    pub completion_time: Option<TimeStamp>,
}
cbor_record!(ProjectUserRemovalRequest, "removal-request", "ProjectUserRemovalRequest");

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Allocation {
    #[n(0)]
    pub id: String, // alloc_
    #[n(1)]
    pub project_id: String,
    #[n(2)]
    pub status: AllocationStatus,
    #[n(3)]
    pub resources: Vec<String>,
    #[n(4)]
    pub start_date: Option<TimeStamp>,
    #[n(5)]
    pub end_date: Option<TimeStamp>,
}
cbor_record!(Allocation, "allocation", "Allocation");

impl Allocation {
    pub fn has_resource(&self, resource: &str) -> bool {
        self.resources.iter().any(|r| r == resource)
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AllocationUser {
    #[n(0)]
    pub id: String, // au_
    #[n(1)]
    pub allocation_id: String,
    #[n(2)]
    pub user_id: String,
    #[n(3)]
    pub status: AllocationUserStatus,
}
cbor_record!(AllocationUser, "allocation-user", "AllocationUser");

/// A typed value attached to an Allocation. Numeric values are decimal
/// strings.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AllocationAttribute {
    #[n(0)]
    pub id: String, // aa_
    #[n(1)]
    pub allocation_id: String,
    #[n(2)]
    pub attribute_type: AttributeType,
    #[n(3)]
    pub value: String,
}
cbor_record!(AllocationAttribute, "allocation-attribute", "AllocationAttribute");

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AllocationUserAttribute {
    #[n(0)]
    pub id: String, // aua_
    #[n(1)]
    pub allocation_user_id: String,
    #[n(2)]
    pub allocation_id: String,
    #[n(3)]
    pub attribute_type: AttributeType,
    #[n(4)]
    pub value: String,
}
cbor_record!(AllocationUserAttribute, "allocation-user-attribute", "AllocationUserAttribute");

// Usage rows share the id of the numeric attribute they belong to, so there
// can only ever be one per attribute.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AllocationAttributeUsage {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub value: ServiceUnits,
}
cbor_record!(AllocationAttributeUsage, "allocation-attribute-usage", "AllocationAttributeUsage");

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AllocationUserAttributeUsage {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub value: ServiceUnits,
}
cbor_record!(
    AllocationUserAttributeUsage,
    "allocation-user-attribute-usage",
    "AllocationUserAttributeUsage"
);

/// Append-only record of a project allowance change.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ProjectTransaction {
    #[n(0)]
    pub id: String, // ptx_
    #[n(1)]
    pub project_id: String,
    #[n(2)]
    pub date_time: TimeStamp,
    #[n(3)]
    pub allocation: ServiceUnits,
}
cbor_record!(ProjectTransaction, "project-transaction", "ProjectTransaction");

/// Append-only record of a project user allowance change.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ProjectUserTransaction {
    #[n(0)]
    pub id: String, // putx_
    #[n(1)]
    pub project_user_id: String,
    #[n(2)]
    pub date_time: TimeStamp,
    #[n(3)]
    pub allocation: ServiceUnits,
}
cbor_record!(ProjectUserTransaction, "project-user-transaction", "ProjectUserTransaction");

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum HistoryKind {
    #[n(0)]
    Allowance,
    #[n(1)]
    Usage,
}

/// Audit trail entry for any allowance or usage write. `target` is the id of
/// the attribute or usage record that changed.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerHistory {
    #[n(0)]
    pub id: String, // hist_
    #[n(1)]
    pub target: String,
    #[n(2)]
    pub kind: HistoryKind,
    #[n(3)]
    pub value: ServiceUnits,
    #[n(4)]
    pub date_time: TimeStamp,
    #[n(5)]
    pub change_reason: Option<String>,
}
cbor_record!(LedgerHistory, "ledger-history", "LedgerHistory");

//! Closed, named choice sets for statuses, roles and reasons.
//!
//! Every set serializes as its display name, both in CBOR ledger records and
//! in JSON request documents, and a lookup by an unknown name fails with
//! `Object with name=<X> does not exist.`

macro_rules! choice {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn from_name(name: &str) -> $crate::error::Result<Self> {
                match name {
                    $($label => Ok($name::$variant),)+
                    _ => Err($crate::error::LedgerError::choice_not_found(name)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::from_name(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = <String as serde::Deserialize>::deserialize(deserializer)?;
                $name::from_name(&name).map_err(serde::de::Error::custom)
            }
        }

        impl<C> minicbor::Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(
                &self,
                e: &mut minicbor::Encoder<W>,
                _: &mut C,
            ) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.str(self.name())?.ok()
            }
        }

        impl<'b, C> minicbor::Decode<'b, C> for $name {
            fn decode(
                d: &mut minicbor::Decoder<'b>,
                _: &mut C,
            ) -> Result<Self, minicbor::decode::Error> {
                let name = d.str()?;
                $name::from_name(name)
                    .map_err(|_| minicbor::decode::Error::message("unknown choice name"))
            }
        }
    };
}

choice! {
    pub enum ProjectStatus {
        New => "New",
        Active => "Active",
        Inactive => "Inactive",
        Archived => "Archived",
        Denied => "Denied",
    }
}

choice! {
    pub enum ProjectUserStatus {
        Active => "Active",
        PendingAdd => "Pending - Add",
        PendingRemove => "Pending - Remove",
        Denied => "Denied",
        Removed => "Removed",
    }
}

choice! {
    pub enum ProjectUserRole {
        User => "User",
        Manager => "Manager",
        PrincipalInvestigator => "Principal Investigator",
    }
}

choice! {
    pub enum ProjectRemovalStatus {
        Pending => "Pending",
        Processing => "Processing",
        Complete => "Complete",
    }
}

choice! {
    pub enum AllocationStatus {
        New => "New",
        Active => "Active",
        Denied => "Denied",
        Expired => "Expired",
        Inactive => "Inactive",
        RenewalRequested => "Renewal Requested",
    }
}

choice! {
    pub enum AllocationUserStatus {
        Active => "Active",
        Error => "Error",
        Removed => "Removed",
        PendingRemove => "Pending - Remove",
    }
}

choice! {
    /// Named types of ledger attributes.
    pub enum AttributeType {
        ServiceUnits => "Service Units",
        ClusterAccountStatus => "Cluster Account Status",
        ClusterDirectoryAccess => "Cluster Directory Access",
    }
}

choice! {
    /// String values of the "Cluster Account Status" attribute.
    pub enum ClusterAccountStatus {
        PendingAdd => "Pending - Add",
        Processing => "Processing",
        Active => "Active",
        Denied => "Denied",
        PendingDelete => "Pending - Delete",
        Removed => "Removed",
    }
}

choice! {
    pub enum DeletionStatus {
        Queued => "Queued",
        Ready => "Ready",
        Processing => "Processing",
        Complete => "Complete",
        Cancelled => "Cancelled",
    }
}

choice! {
    /// Who or what asked for a deletion. The accepted subset depends on the
    /// deletion kind.
    pub enum DeletionReason {
        Admin => "Admin",
        User => "User",
        Pi => "PI",
        LastProject => "LastProject",
        BadPid => "BadPID",
        System => "System",
    }
}

choice! {
    pub enum SecureDirRequestStatus {
        UnderReview => "Under Review",
        ApprovedProcessing => "Approved - Processing",
        ApprovedComplete => "Approved - Complete",
        Denied => "Denied",
    }
}

choice! {
    pub enum SecureDirUserRequestStatus {
        Pending => "Pending",
        Processing => "Processing",
        Complete => "Complete",
        Denied => "Denied",
    }
}

choice! {
    /// Status of one step inside a request `state` document.
    pub enum StepStatus {
        Pending => "Pending",
        Approved => "Approved",
        Complete => "Complete",
        Completed => "Completed",
        Denied => "Denied",
    }
}

impl DeletionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeletionStatus::Complete | DeletionStatus::Cancelled)
    }
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
    pub fn is_cancellable(&self) -> bool {
        matches!(self, DeletionStatus::Queued | DeletionStatus::Ready)
    }
    /// Allowed moves of the deletion state machine.
    pub fn can_transition_to(&self, next: DeletionStatus) -> bool {
        use DeletionStatus::*;
        matches!(
            (self, next),
            (Queued, Ready)
                | (Ready, Processing)
                | (Processing, Complete)
                | (Queued, Cancelled)
                | (Ready, Cancelled)
        )
    }
}

impl DeletionReason {
    pub fn is_system_initiated(&self) -> bool {
        matches!(
            self,
            DeletionReason::LastProject | DeletionReason::BadPid | DeletionReason::System
        )
    }
}

impl SecureDirRequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SecureDirRequestStatus::ApprovedComplete | SecureDirRequestStatus::Denied
        )
    }
}

impl SecureDirUserRequestStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SecureDirUserRequestStatus::Pending | SecureDirUserRequestStatus::Processing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_round_trips() {
        for status in SecureDirRequestStatus::ALL {
            assert_eq!(SecureDirRequestStatus::from_name(status.name()).unwrap(), *status);
        }
    }

    #[test]
    fn unknown_name_is_not_found() {
        let err = DeletionStatus::from_name("Invalid").unwrap_err();
        assert_eq!(err.to_string(), "Object with name=Invalid does not exist.");
    }

    #[test]
    fn choices_serialize_as_names() {
        let json = serde_json::to_string(&SecureDirRequestStatus::ApprovedProcessing).unwrap();
        assert_eq!(json, "\"Approved - Processing\"");
    }

    #[test]
    fn deletion_transitions() {
        assert!(DeletionStatus::Queued.can_transition_to(DeletionStatus::Ready));
        assert!(!DeletionStatus::Processing.can_transition_to(DeletionStatus::Cancelled));
        assert!(!DeletionStatus::Complete.can_transition_to(DeletionStatus::Queued));
    }
}

//! Request entities.
//!
//! Status fields are private. They change only through the methods here,
//! which either validate a state-machine move (deletions) or recompute the
//! status from the state document (secure directories), so stored status
//! and state cannot drift apart.
use crate::choices::{
    DeletionReason, DeletionStatus, SecureDirRequestStatus, SecureDirUserRequestStatus,
    StepStatus,
};
use crate::error::{LedgerError, Result};
use crate::json_record;
use crate::state::{
    derive_secure_dir_status, DeletionState, DeletionStep, DenialReason, OtherState,
    SecureDirState, SecureDirStep, StepState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which deletion workflow a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionKind {
    Account,
    ClusterAccount,
}

impl DeletionKind {
    pub fn family(&self) -> &'static str {
        match self {
            DeletionKind::Account => "account-deletion",
            DeletionKind::ClusterAccount => "cluster-account-deletion",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeletionKind::Account => "account deletion",
            DeletionKind::ClusterAccount => "cluster account deletion",
        }
    }

    pub fn allows(&self, reason: DeletionReason) -> bool {
        use DeletionReason::*;
        match self {
            DeletionKind::Account => matches!(reason, Admin | User | LastProject | BadPid),
            DeletionKind::ClusterAccount => matches!(reason, User | Pi | System),
        }
    }
}

/// Key guarding "one active request per user and family".
pub fn active_request_key(family: &str, user_id: &str) -> String {
    format!("index/active-request/{family}/{user_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub id: String,
    pub kind: DeletionKind,
    pub user_id: String,
    pub requester_id: String,
    pub reason: DeletionReason,
    status: DeletionStatus,
    pub expiration: DateTime<Utc>,
    state: DeletionState,
    pub request_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
}
json_record!(DeletionRequest, "deletion-request", "DeletionRequest");

impl DeletionRequest {
    pub fn new(
        id: String,
        kind: DeletionKind,
        user_id: &str,
        requester_id: &str,
        reason: DeletionReason,
        expiration: DateTime<Utc>,
    ) -> Result<Self> {
        if !kind.allows(reason) {
            return Err(LedgerError::InvalidArgument(format!(
                "{reason} is not a valid reason for a {} request.",
                kind.label()
            )));
        }
        Ok(Self {
            id,
            kind,
            user_id: user_id.to_string(),
            requester_id: requester_id.to_string(),
            reason,
            status: DeletionStatus::Queued,
            expiration,
            state: DeletionState::default(),
            request_time: Utc::now(),
            completion_time: None,
        })
    }

    pub fn status(&self) -> DeletionStatus {
        self.status
    }
    pub fn state(&self) -> &DeletionState {
        &self.state
    }
    pub fn is_system_initiated(&self) -> bool {
        self.reason.is_system_initiated()
    }
    pub fn active_key(&self) -> String {
        active_request_key(self.kind.family(), &self.user_id)
    }

    pub(crate) fn transition(&mut self, next: DeletionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::PreconditionFailed(format!(
                "Cannot move {} request {} from {} to {next}.",
                self.kind.label(),
                self.id,
                self.status
            )));
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn set_step(
        &mut self,
        step: DeletionStep,
        status: StepStatus,
        justification: &str,
        timestamp: &str,
    ) -> Result<()> {
        if self.status != DeletionStatus::Processing {
            return Err(LedgerError::PreconditionFailed(format!(
                "Request {} is {}; steps can only change while Processing.",
                self.id, self.status
            )));
        }
        if !matches!(status, StepStatus::Pending | StepStatus::Complete) {
            return Err(LedgerError::InvalidArgument(format!(
                "{status} is not a valid status for {}.",
                step.key()
            )));
        }
        if !self.state.is_actionable(step) {
            return Err(LedgerError::PreconditionFailed(format!(
                "{} cannot be updated before the prior steps are complete.",
                step.task()
            )));
        }
        *self.state.step_mut(step) = StepState::new(status, justification, timestamp);
        Ok(())
    }

    pub(crate) fn cancel(&mut self, justification: &str, timestamp: &str) -> Result<()> {
        self.transition(DeletionStatus::Cancelled)?;
        self.state.other = OtherState {
            justification: justification.to_string(),
            timestamp: timestamp.to_string(),
        };
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.state.account_deletion.is(StepStatus::Complete) {
            return Err(LedgerError::PreconditionFailed(format!(
                "Request {} cannot be completed before the cluster account is deleted.",
                self.id
            )));
        }
        self.transition(DeletionStatus::Complete)?;
        self.completion_time = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureDirRequest {
    pub id: String,
    pub requester_id: String,
    pub pi_id: String,
    pub project_id: String,
    pub directory_name: String,
    pub department: Option<String>,
    pub data_description: String,
    status: SecureDirRequestStatus,
    state: SecureDirState,
    pub request_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
}
json_record!(SecureDirRequest, "secure-dir-request", "SecureDirRequest");

impl SecureDirRequest {
    pub fn new(
        id: String,
        requester_id: &str,
        pi_id: &str,
        project_id: &str,
        directory_name: &str,
        data_description: &str,
    ) -> Self {
        let state = SecureDirState::default();
        Self {
            id,
            requester_id: requester_id.to_string(),
            pi_id: pi_id.to_string(),
            project_id: project_id.to_string(),
            directory_name: directory_name.to_string(),
            department: None,
            data_description: data_description.to_string(),
            status: derive_secure_dir_status(&state),
            state,
            request_time: Utc::now(),
            completion_time: None,
        }
    }

    pub fn status(&self) -> SecureDirRequestStatus {
        self.status
    }
    pub fn state(&self) -> &SecureDirState {
        &self.state
    }
    pub fn denial_reason(&self) -> Result<DenialReason> {
        if self.status != SecureDirRequestStatus::Denied {
            return Err(LedgerError::PreconditionFailed(format!(
                "Provided request has unexpected status {}.",
                self.status
            )));
        }
        self.state.denial_reason().ok_or_else(|| {
            LedgerError::PreconditionFailed("Provided request has an unexpected state.".into())
        })
    }
    pub fn latest_update_timestamp(&self) -> String {
        self.state.latest_update_timestamp()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LedgerError::PreconditionFailed(format!(
                "Secure directory request {} is {}.",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn rederive(&mut self) {
        self.status = derive_secure_dir_status(&self.state);
    }

    pub(crate) fn set_step(
        &mut self,
        step: SecureDirStep,
        status: StepStatus,
        justification: &str,
        timestamp: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        if !step.accepts(status) {
            return Err(LedgerError::InvalidArgument(format!(
                "{status} is not a valid status for {}.",
                step.key()
            )));
        }
        if !self.state.is_actionable(step) {
            return Err(LedgerError::PreconditionFailed(format!(
                "{} cannot be updated before the prior steps are complete.",
                step.task()
            )));
        }
        self.state.set_step(step, status, justification, timestamp);
        self.rederive();
        Ok(())
    }

    pub(crate) fn deny(&mut self, justification: &str, timestamp: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.other = OtherState {
            justification: justification.to_string(),
            timestamp: timestamp.to_string(),
        };
        self.rederive();
        Ok(())
    }

    pub(crate) fn undeny(&mut self) -> Result<()> {
        if self.status != SecureDirRequestStatus::Denied {
            return Err(LedgerError::PreconditionFailed(format!(
                "Secure directory request {} is not denied.",
                self.id
            )));
        }
        self.state.undeny();
        self.rederive();
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != SecureDirRequestStatus::ApprovedProcessing {
            return Err(LedgerError::PreconditionFailed(format!(
                "Secure directory request {} is {}, not Approved - Processing.",
                self.id, self.status
            )));
        }
        if !self.state.setup.is(StepStatus::Completed) {
            return Err(LedgerError::PreconditionFailed(
                "The directory has not been set up on the cluster.".into(),
            ));
        }
        self.status = SecureDirRequestStatus::ApprovedComplete;
        self.completion_time = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecureDirUserAction {
    Add,
    Remove,
}

impl SecureDirUserAction {
    pub fn verb(&self) -> &'static str {
        match self {
            SecureDirUserAction::Add => "add",
            SecureDirUserAction::Remove => "remove",
        }
    }
    pub fn noun(&self) -> &'static str {
        match self {
            SecureDirUserAction::Add => "addition",
            SecureDirUserAction::Remove => "removal",
        }
    }
    pub fn preposition(&self) -> &'static str {
        match self {
            SecureDirUserAction::Add => "to",
            SecureDirUserAction::Remove => "from",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureDirUserRequest {
    pub id: String,
    pub action: SecureDirUserAction,
    pub user_id: String,
    pub requester_id: String,
    pub allocation_id: String,
    pub directory: String,
    status: SecureDirUserRequestStatus,
    pub other: OtherState,
    pub request_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
}
json_record!(SecureDirUserRequest, "secure-dir-user-request", "SecureDirUserRequest");

impl SecureDirUserRequest {
    pub fn new(
        id: String,
        action: SecureDirUserAction,
        user_id: &str,
        requester_id: &str,
        allocation_id: &str,
        directory: &str,
    ) -> Self {
        Self {
            id,
            action,
            user_id: user_id.to_string(),
            requester_id: requester_id.to_string(),
            allocation_id: allocation_id.to_string(),
            directory: directory.to_string(),
            status: SecureDirUserRequestStatus::Pending,
            other: OtherState::default(),
            request_time: Utc::now(),
            completion_time: None,
        }
    }

    pub fn status(&self) -> SecureDirUserRequestStatus {
        self.status
    }

    /// Key guarding "one pending request per user and directory".
    pub fn pending_key(&self) -> String {
        format!("index/pending-dir-user/{}/{}", self.allocation_id, self.user_id)
    }

    fn ensure_pending(&self) -> Result<()> {
        if !self.status.is_pending() {
            return Err(LedgerError::PreconditionFailed(format!(
                "Request {} is already {}.",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub(crate) fn start_processing(&mut self) -> Result<()> {
        self.ensure_pending()?;
        self.status = SecureDirUserRequestStatus::Processing;
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = SecureDirUserRequestStatus::Complete;
        self.completion_time = Some(now);
        Ok(())
    }

    pub(crate) fn deny(&mut self, justification: &str, timestamp: &str) -> Result<()> {
        self.ensure_pending()?;
        self.status = SecureDirUserRequestStatus::Denied;
        self.other = OtherState {
            justification: justification.to_string(),
            timestamp: timestamp.to_string(),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;

    fn deletion(reason: DeletionReason) -> Result<DeletionRequest> {
        DeletionRequest::new(
            "del_1".into(),
            DeletionKind::Account,
            "user_1",
            "user_1",
            reason,
            Utc::now(),
        )
    }

    #[test]
    fn reasons_depend_on_kind() {
        assert!(deletion(DeletionReason::LastProject).is_ok());
        assert!(deletion(DeletionReason::Pi).is_err());
        assert!(DeletionKind::ClusterAccount.allows(DeletionReason::Pi));
    }

    #[test]
    fn deletion_cannot_skip_processing() {
        let mut request = deletion(DeletionReason::User).unwrap();
        request.transition(DeletionStatus::Ready).unwrap();
        assert!(request.transition(DeletionStatus::Complete).is_err());
        assert_eq!(request.status(), DeletionStatus::Ready);
    }

    #[test]
    fn state_document_keeps_its_keys() {
        let request = deletion(DeletionReason::User).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&request.to_bytes().unwrap()).unwrap();

        assert_eq!(json["status"], "Queued");
        assert_eq!(json["state"]["account_deletion"]["status"], "Pending");
        assert_eq!(json["state"]["other"]["justification"], "");
    }

    #[test]
    fn secure_dir_status_follows_steps() {
        let mut request = SecureDirRequest::new("sd_1".into(), "u", "u", "p", "pl1_x", "data");
        let ts = "2024-01-01T00:00:00+00:00";
        assert_eq!(request.status(), SecureDirRequestStatus::UnderReview);

        request.set_step(SecureDirStep::RdmConsultation, StepStatus::Approved, "", ts).unwrap();
        request.set_step(SecureDirStep::Notified, StepStatus::Complete, "", ts).unwrap();
        request.set_step(SecureDirStep::Mou, StepStatus::Approved, "", ts).unwrap();
        assert_eq!(request.status(), SecureDirRequestStatus::ApprovedProcessing);

        assert!(request.complete(Utc::now()).is_err());
        request.set_step(SecureDirStep::Setup, StepStatus::Completed, "", ts).unwrap();
        request.complete(Utc::now()).unwrap();
        assert_eq!(request.status(), SecureDirRequestStatus::ApprovedComplete);
        assert!(request.set_step(SecureDirStep::Setup, StepStatus::Pending, "", ts).is_err());
    }

    #[test]
    fn mou_is_gated_on_notification() {
        let mut request = SecureDirRequest::new("sd_1".into(), "u", "u", "p", "pl1_x", "data");
        let err = request
            .set_step(SecureDirStep::Mou, StepStatus::Approved, "", "2024-01-01T00:00:00+00:00")
            .unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionFailed(_)));
    }
}

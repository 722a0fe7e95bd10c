//! Request `state` documents.
//!
//! Each request family keeps a fixed set of named steps. The serialized
//! shape is `{"<step>": {"status", "justification", "timestamp"}, ...}`,
//! with timestamps as ISO-8601 strings or `""`. Overall status for secure
//! directory requests is a pure function of this document, and checklists
//! are computed from it on read.
use crate::choices::{SecureDirRequestStatus, StepStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub justification: String,
    pub timestamp: String,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            justification: String::new(),
            timestamp: String::new(),
        }
    }
}

impl StepState {
    pub fn new(status: StepStatus, justification: &str, timestamp: &str) -> Self {
        Self {
            status,
            justification: justification.to_string(),
            timestamp: timestamp.to_string(),
        }
    }
    pub fn is(&self, status: StepStatus) -> bool {
        self.status == status
    }
}

/// The `notified` step carries no justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedState {
    pub status: StepStatus,
    pub timestamp: String,
}

impl Default for NotifiedState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            timestamp: String::new(),
        }
    }
}

/// The `other` entry has no status; a non-empty timestamp marks it as set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherState {
    pub justification: String,
    pub timestamp: String,
}

impl OtherState {
    pub fn is_set(&self) -> bool {
        !self.timestamp.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureDirState {
    pub rdm_consultation: StepState,
    pub notified: NotifiedState,
    pub mou: StepState,
    pub setup: StepState,
    pub other: OtherState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionState {
    pub project_removal: StepState,
    pub data_deletion: StepState,
    pub account_deletion: StepState,
    pub other: OtherState,
}

/// Named steps of a secure directory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecureDirStep {
    RdmConsultation,
    Notified,
    Mou,
    Setup,
}

impl SecureDirStep {
    pub const ALL: [SecureDirStep; 4] = [
        SecureDirStep::RdmConsultation,
        SecureDirStep::Notified,
        SecureDirStep::Mou,
        SecureDirStep::Setup,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SecureDirStep::RdmConsultation => "rdm_consultation",
            SecureDirStep::Notified => "notified",
            SecureDirStep::Mou => "mou",
            SecureDirStep::Setup => "setup",
        }
    }

    pub fn task(&self) -> &'static str {
        match self {
            SecureDirStep::RdmConsultation => "Consult with RDM",
            SecureDirStep::Notified => "Notify PI of MOU",
            SecureDirStep::Mou => "Memorandum of Understanding",
            SecureDirStep::Setup => "Set Up on Cluster",
        }
    }

    /// Status values a reviewer may put this step into.
    pub fn accepts(&self, status: StepStatus) -> bool {
        use StepStatus::*;
        match self {
            SecureDirStep::RdmConsultation | SecureDirStep::Mou => {
                matches!(status, Pending | Approved | Denied)
            }
            SecureDirStep::Notified => matches!(status, Pending | Complete),
            SecureDirStep::Setup => matches!(status, Pending | Completed | Denied),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionStep {
    ProjectRemoval,
    DataDeletion,
    AccountDeletion,
}

impl DeletionStep {
    pub const ALL: [DeletionStep; 3] = [
        DeletionStep::ProjectRemoval,
        DeletionStep::DataDeletion,
        DeletionStep::AccountDeletion,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            DeletionStep::ProjectRemoval => "project_removal",
            DeletionStep::DataDeletion => "data_deletion",
            DeletionStep::AccountDeletion => "account_deletion",
        }
    }

    pub fn task(&self) -> &'static str {
        match self {
            DeletionStep::ProjectRemoval => "Remove User from Projects",
            DeletionStep::DataDeletion => "Delete User Data",
            DeletionStep::AccountDeletion => "Delete Cluster Account",
        }
    }
}

impl DeletionState {
    pub fn step(&self, step: DeletionStep) -> &StepState {
        match step {
            DeletionStep::ProjectRemoval => &self.project_removal,
            DeletionStep::DataDeletion => &self.data_deletion,
            DeletionStep::AccountDeletion => &self.account_deletion,
        }
    }
    pub fn step_mut(&mut self, step: DeletionStep) -> &mut StepState {
        match step {
            DeletionStep::ProjectRemoval => &mut self.project_removal,
            DeletionStep::DataDeletion => &mut self.data_deletion,
            DeletionStep::AccountDeletion => &mut self.account_deletion,
        }
    }

    /// Account deletion waits on both earlier steps.
    pub fn is_actionable(&self, step: DeletionStep) -> bool {
        match step {
            DeletionStep::ProjectRemoval | DeletionStep::DataDeletion => true,
            DeletionStep::AccountDeletion => {
                self.project_removal.is(StepStatus::Complete)
                    && self.data_deletion.is(StepStatus::Complete)
            }
        }
    }

    pub fn checklist(&self, action_base_url: &str) -> Vec<ChecklistItem> {
        DeletionStep::ALL
            .iter()
            .map(|step| {
                let state = self.step(*step);
                ChecklistItem {
                    task: step.task().to_string(),
                    status: state.status.name().to_string(),
                    timestamp: state.timestamp.clone(),
                    is_actionable: self.is_actionable(*step),
                    action_url: format!("{action_base_url}/{}", step.key()),
                }
            })
            .collect()
    }

    pub fn latest_update_timestamp(&self) -> String {
        latest([
            &self.project_removal.timestamp,
            &self.data_deletion.timestamp,
            &self.account_deletion.timestamp,
            &self.other.timestamp,
        ])
    }
}

/// One line of a review checklist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistItem {
    pub task: String,
    pub status: String,
    pub timestamp: String,
    pub is_actionable: bool,
    pub action_url: String,
}

/// Why a request was denied, derived from its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenialReason {
    pub category: String,
    pub justification: String,
    pub timestamp: String,
}

// ISO-8601 strings in one offset order lexically, and "" sorts first
fn latest<'a>(timestamps: impl IntoIterator<Item = &'a String>) -> String {
    timestamps
        .into_iter()
        .max()
        .cloned()
        .unwrap_or_default()
}

/// Overall status of a secure directory request as a function of its steps.
///
/// Any required step Denied, or an `other` denial recorded, gives Denied.
/// Otherwise a Pending consultation or agreement keeps the request Under
/// Review, and once both are settled it is Approved - Processing.
pub fn derive_secure_dir_status(state: &SecureDirState) -> SecureDirRequestStatus {
    let required = [&state.rdm_consultation, &state.mou, &state.setup];
    if required.iter().any(|s| s.is(StepStatus::Denied)) || state.other.is_set() {
        SecureDirRequestStatus::Denied
    } else if state.rdm_consultation.is(StepStatus::Pending) || state.mou.is(StepStatus::Pending) {
        SecureDirRequestStatus::UnderReview
    } else {
        SecureDirRequestStatus::ApprovedProcessing
    }
}

impl SecureDirState {
    pub fn step(&self, step: SecureDirStep) -> StepStatus {
        match step {
            SecureDirStep::RdmConsultation => self.rdm_consultation.status,
            SecureDirStep::Notified => self.notified.status,
            SecureDirStep::Mou => self.mou.status,
            SecureDirStep::Setup => self.setup.status,
        }
    }

    pub fn step_timestamp(&self, step: SecureDirStep) -> &str {
        match step {
            SecureDirStep::RdmConsultation => &self.rdm_consultation.timestamp,
            SecureDirStep::Notified => &self.notified.timestamp,
            SecureDirStep::Mou => &self.mou.timestamp,
            SecureDirStep::Setup => &self.setup.timestamp,
        }
    }

    pub(crate) fn set_step(
        &mut self,
        step: SecureDirStep,
        status: StepStatus,
        justification: &str,
        timestamp: &str,
    ) {
        match step {
            SecureDirStep::RdmConsultation => {
                self.rdm_consultation = StepState::new(status, justification, timestamp)
            }
            SecureDirStep::Notified => {
                self.notified = NotifiedState {
                    status,
                    timestamp: timestamp.to_string(),
                }
            }
            SecureDirStep::Mou => self.mou = StepState::new(status, justification, timestamp),
            SecureDirStep::Setup => self.setup = StepState::new(status, justification, timestamp),
        }
    }

    /// Whether a reviewer may act on `step` yet.
    pub fn is_actionable(&self, step: SecureDirStep) -> bool {
        match step {
            SecureDirStep::RdmConsultation | SecureDirStep::Notified => true,
            SecureDirStep::Mou => self.notified.status == StepStatus::Complete,
            SecureDirStep::Setup => {
                self.rdm_consultation.is(StepStatus::Approved)
                    && self.notified.status == StepStatus::Complete
                    && self.mou.is(StepStatus::Approved)
            }
        }
    }

    pub fn checklist(&self, action_base_url: &str) -> Vec<ChecklistItem> {
        let setup_blocked =
            self.rdm_consultation.is(StepStatus::Denied) || self.mou.is(StepStatus::Denied);
        SecureDirStep::ALL
            .iter()
            .map(|step| {
                let status = if *step == SecureDirStep::Setup && setup_blocked {
                    "N/A".to_string()
                } else {
                    self.step(*step).name().to_string()
                };
                ChecklistItem {
                    task: step.task().to_string(),
                    status,
                    timestamp: self.step_timestamp(*step).to_string(),
                    is_actionable: self.is_actionable(*step),
                    action_url: format!("{action_base_url}/{}", step.key()),
                }
            })
            .collect()
    }

    /// The first denied step in review order, else the `other` entry.
    pub fn denial_reason(&self) -> Option<DenialReason> {
        let reason = |category: &str, justification: &str, timestamp: &str| DenialReason {
            category: category.to_string(),
            justification: justification.to_string(),
            timestamp: timestamp.to_string(),
        };
        let steps = [
            ("RDM Consultation", &self.rdm_consultation),
            ("Memorandum of Understanding", &self.mou),
            ("Cluster Setup", &self.setup),
        ];
        steps
            .iter()
            .find(|(_, s)| s.is(StepStatus::Denied))
            .map(|(category, s)| reason(category, &s.justification, &s.timestamp))
            .or_else(|| {
                self.other
                    .is_set()
                    .then(|| reason("Other", &self.other.justification, &self.other.timestamp))
            })
    }

    pub fn latest_update_timestamp(&self) -> String {
        latest([
            &self.rdm_consultation.timestamp,
            &self.notified.timestamp,
            &self.mou.timestamp,
            &self.setup.timestamp,
            &self.other.timestamp,
        ])
    }

    /// Put every Denied step back to Pending and clear `other`; approved
    /// steps keep their decision.
    pub(crate) fn undeny(&mut self) {
        for step in [&mut self.rdm_consultation, &mut self.mou, &mut self.setup] {
            if step.is(StepStatus::Denied) {
                *step = StepState::default();
            }
        }
        self.other = OtherState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_shape_is_stable() {
        let json = serde_json::to_value(SecureDirState::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "rdm_consultation": {"status": "Pending", "justification": "", "timestamp": ""},
                "notified": {"status": "Pending", "timestamp": ""},
                "mou": {"status": "Pending", "justification": "", "timestamp": ""},
                "setup": {"status": "Pending", "justification": "", "timestamp": ""},
                "other": {"justification": "", "timestamp": ""}
            })
        );
    }

    #[test]
    fn derivation_orders_denial_first() {
        let mut state = SecureDirState::default();
        assert_eq!(derive_secure_dir_status(&state), SecureDirRequestStatus::UnderReview);

        state.rdm_consultation.status = StepStatus::Approved;
        state.mou.status = StepStatus::Approved;
        assert_eq!(derive_secure_dir_status(&state), SecureDirRequestStatus::ApprovedProcessing);

        state.setup.status = StepStatus::Denied;
        assert_eq!(derive_secure_dir_status(&state), SecureDirRequestStatus::Denied);
    }

    #[test]
    fn setup_waits_for_prior_steps() {
        let mut state = SecureDirState::default();
        state.rdm_consultation.status = StepStatus::Approved;
        assert!(!state.is_actionable(SecureDirStep::Mou));
        assert!(!state.is_actionable(SecureDirStep::Setup));

        state.notified.status = StepStatus::Complete;
        state.mou.status = StepStatus::Approved;
        assert!(state.is_actionable(SecureDirStep::Setup));
    }

    #[test]
    fn checklist_marks_blocked_setup() {
        let mut state = SecureDirState::default();
        state.mou.status = StepStatus::Denied;

        let checklist = state.checklist("/secure-dir/1");
        assert_eq!(checklist.len(), 4);
        assert_eq!(checklist[3].status, "N/A");
        assert_eq!(checklist[3].action_url, "/secure-dir/1/setup");
    }

    #[test]
    fn undeny_keeps_approvals() {
        let mut state = SecureDirState::default();
        state.rdm_consultation = StepState::new(StepStatus::Approved, "ok", "2024-01-01T00:00:00+00:00");
        state.mou = StepState::new(StepStatus::Denied, "unsigned", "2024-01-02T00:00:00+00:00");

        state.undeny();
        assert_eq!(state.rdm_consultation.status, StepStatus::Approved);
        assert_eq!(state.mou, StepState::default());
        assert_eq!(derive_secure_dir_status(&state), SecureDirRequestStatus::UnderReview);
    }

    #[test]
    fn denial_reason_and_latest_timestamp() {
        let mut state = SecureDirState::default();
        state.rdm_consultation = StepState::new(StepStatus::Approved, "", "2024-01-01T00:00:00+00:00");
        state.other = OtherState {
            justification: "Duplicate request.".into(),
            timestamp: "2024-03-01T00:00:00+00:00".into(),
        };

        let reason = state.denial_reason().unwrap();
        assert_eq!(reason.category, "Other");
        assert_eq!(state.latest_update_timestamp(), "2024-03-01T00:00:00+00:00");
        assert!(SecureDirState::default().denial_reason().is_none());
    }

    #[test]
    fn account_deletion_step_is_gated() {
        let mut state = DeletionState::default();
        assert!(!state.is_actionable(DeletionStep::AccountDeletion));
        state.project_removal.status = StepStatus::Complete;
        state.data_deletion.status = StepStatus::Complete;
        assert!(state.is_actionable(DeletionStep::AccountDeletion));
        assert!(state.checklist("/deletion/1")[2].is_actionable);
    }
}

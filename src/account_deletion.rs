//! Account and cluster-account deletion workflows.
//!
//! Requests move `Queued -> Ready -> Processing -> Complete`, or to
//! `Cancelled` from Queued/Ready. A user has at most one active request per
//! kind, which is enforced inside the creating transaction.
use crate::accounting::{cluster_status_key, set_cluster_account_status_in};
use crate::choices::{
    AllocationUserStatus, ClusterAccountStatus, DeletionReason, DeletionStatus,
    ProjectRemovalStatus, ProjectUserRole, ProjectUserStatus, StepStatus,
};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::models::{AllocationUser, AllocationUserAttribute, ProjectUser, ProjectUserRemovalRequest, User};
use crate::notification::Email;
use crate::requests::{DeletionKind, DeletionRequest};
use crate::runner::{base_email, Messages, Runner, Transition};
use crate::state::DeletionStep;
use crate::store::{abort, Tx, TxResult};
use crate::types::TimeStamp;
use crate::utils::{new_uuid_to_bech32, utc_now_iso};
use chrono::{DateTime, Duration, Utc};

/// Allocation users of `user_id` whose cluster account status is `status`,
/// with the id of that status attribute.
fn cluster_accounts_in(
    ledger: &Ledger,
    user_id: &str,
    status: ClusterAccountStatus,
) -> Result<Vec<(AllocationUser, String)>> {
    let store = ledger.store();
    let mut found = vec![];
    for au in store.filter(|au: &AllocationUser| au.user_id == user_id)? {
        if let Some(attribute_id) = store.index_value(&cluster_status_key(&au.id))? {
            let attribute: AllocationUserAttribute = store.fetch(&attribute_id)?;
            if attribute.value == status.name() {
                found.push((au, attribute_id));
            }
        }
    }
    Ok(found)
}

fn set_cluster_statuses(
    tx: &Tx<'_>,
    accounts: &[(AllocationUser, String)],
    status: ClusterAccountStatus,
) -> TxResult<()> {
    for (au, attribute_id) in accounts {
        set_cluster_account_status_in(tx, au, status, attribute_id)?;
    }
    Ok(())
}

fn full_name(user: &User) -> String {
    format!("{} {}", user.first_name, user.last_name)
}

/// Open a deletion request for a user.
pub struct CreateDeletionRequest {
    kind: DeletionKind,
    reason: DeletionReason,
    user: User,
    requester: User,
    request: DeletionRequest,
    cluster_accounts: Vec<(AllocationUser, String)>,
    removals: Vec<ProjectUserRemovalRequest>,
}

impl CreateDeletionRequest {
    pub fn new(
        ledger: &Ledger,
        kind: DeletionKind,
        user_id: &str,
        requester_id: &str,
        reason: DeletionReason,
    ) -> Result<Self> {
        let store = ledger.store();
        let user: User = store.fetch(user_id)?;
        let requester: User = store.fetch(requester_id)?;

        let config = ledger.config();
        let days = if reason.is_system_initiated() {
            config.account_deletion_auto_queue_days
        } else {
            config.account_deletion_manual_queue_days
        };
        let expiration = Utc::now() + Duration::days(days);
        let request = DeletionRequest::new(
            new_uuid_to_bech32("del_")?,
            kind,
            user_id,
            requester_id,
            reason,
            expiration,
        )?;

        let cluster_accounts = cluster_accounts_in(ledger, user_id, ClusterAccountStatus::Active)?;

        // an administrator deleting an account also removes the user from
        // every project they are still active in
        let mut removals = vec![];
        if kind == DeletionKind::Account && reason == DeletionReason::Admin {
            for pu in ledger.directory().active_memberships(user_id)? {
                if pu.role == ProjectUserRole::PrincipalInvestigator {
                    continue;
                }
                removals.push(ProjectUserRemovalRequest {
                    id: new_uuid_to_bech32("rm_")?,
                    project_user_id: pu.id,
                    requester_id: requester_id.to_string(),
                    status: ProjectRemovalStatus::Pending,
                    request_time: TimeStamp::new(),
                    completion_time: None,
                });
            }
        }

        Ok(Self {
            kind,
            reason,
            user,
            requester,
            request,
            cluster_accounts,
            removals,
        })
    }

    fn duplicate_message(&self) -> String {
        let (label, username) = (self.kind.label(), &self.user.username);
        format!(
            "Error requesting {label} of user {username}. An active {label} request for user {username} already exists."
        )
    }
}

impl Transition for CreateDeletionRequest {
    type Output = DeletionRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let (user_id, kind) = (&self.user.id, self.kind);
        let mut ok = true;

        let active = ledger.store().exists(|r: &DeletionRequest| {
            r.user_id == *user_id && r.kind == kind && r.status().is_active()
        })?;
        if active {
            messages.error(self.duplicate_message());
            ok = false;
        }
        if !ledger.accounting().has_cluster_access(user_id)? {
            messages.error(format!(
                "Error requesting {} of user {username}. {username} does not have a cluster account.",
                kind.label(),
                username = self.user.username
            ));
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<DeletionRequest> {
        let key = self.request.active_key();
        if tx.index_get(&key)?.is_some() {
            return abort(LedgerError::PreconditionFailed(self.duplicate_message()));
        }
        tx.index_set(&key, &self.request.id)?;
        tx.put(&self.request)?;
        set_cluster_statuses(tx, &self.cluster_accounts, ClusterAccountStatus::PendingDelete)?;

        for removal in &self.removals {
            let mut pu = tx.fetch::<ProjectUser>(&removal.project_user_id)?;
            pu.status = ProjectUserStatus::PendingRemove;
            tx.put(&pu)?;
            tx.put(removal)?;
        }
        Ok(self.request.clone())
    }

    fn success_message(&self, _: &DeletionRequest) -> Option<String> {
        Some(format!(
            "Successfully created {} request for user {}.",
            self.kind.label(),
            self.user.username
        ))
    }

    fn emails(&self, ledger: &Ledger, request: &DeletionRequest) -> Result<Vec<Email>> {
        let admin = base_email(ledger, "New Account Deletion Request", "account_deletion/request_admin")
            .with("user_name", full_name(&self.user))
            .with("username", self.user.username.clone())
            .with("reason", self.reason.name())
            .with("request_id", request.id.clone())
            .to(ledger.config().email_admin_list.clone());

        let cc = if self.requester.id != self.user.id {
            vec![self.requester.email.clone()]
        } else {
            vec![]
        };
        let user = base_email(ledger, "Account Deletion Request", "account_deletion/request_user")
            .with("user_name", full_name(&self.user))
            .with("requester_name", full_name(&self.requester))
            .with("expiration", request.expiration.to_rfc3339())
            .to(vec![self.user.email.clone()])
            .cc(cc);

        Ok(vec![admin, user])
    }
}

/// Move every Queued request whose expiration has passed to Ready. Records
/// that fail are logged and skipped. Returns the ids that moved.
pub fn dequeue_expired(ledger: &Ledger, now: DateTime<Utc>) -> Result<Vec<String>> {
    let due = ledger.store().filter(|r: &DeletionRequest| {
        r.status() == DeletionStatus::Queued && r.expiration <= now
    })?;

    let mut moved = vec![];
    for request in due {
        let result = ledger.store().transaction(|tx| {
            let mut current = tx.fetch::<DeletionRequest>(&request.id)?;
            current.transition(DeletionStatus::Ready).or_else(abort)?;
            tx.put(&current)
        });
        match result {
            Ok(()) => {
                tracing::info!(request_id = %request.id, "deletion request is ready");
                moved.push(request.id);
            }
            Err(e) => tracing::warn!(request_id = %request.id, error = %e, "skipping deletion request"),
        }
    }
    Ok(moved)
}

/// Start work on a Ready request.
pub struct ProcessDeletionRequest {
    request_id: String,
}

impl ProcessDeletionRequest {
    pub fn new(request_id: &str) -> Self {
        Self { request_id: request_id.to_string() }
    }
}

impl Transition for ProcessDeletionRequest {
    type Output = DeletionRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: DeletionRequest = ledger.store().fetch(&self.request_id)?;
        if request.status() != DeletionStatus::Ready {
            messages.error(format!(
                "Request {} must be Ready to be processed; it is {}.",
                request.id,
                request.status()
            ));
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<DeletionRequest> {
        let mut request = tx.fetch::<DeletionRequest>(&self.request_id)?;
        request.transition(DeletionStatus::Processing).or_else(abort)?;
        tx.put(&request)?;
        Ok(request)
    }

    fn emails(&self, _: &Ledger, _: &DeletionRequest) -> Result<Vec<Email>> {
        Ok(vec![])
    }
}

/// Mark one checklist step of a Processing request.
pub struct UpdateDeletionStep {
    request_id: String,
    step: DeletionStep,
    status: StepStatus,
    justification: String,
}

impl UpdateDeletionStep {
    pub fn new(request_id: &str, step: DeletionStep, status: StepStatus, justification: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            step,
            status,
            justification: justification.to_string(),
        }
    }
}

impl Transition for UpdateDeletionStep {
    type Output = DeletionRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: DeletionRequest = ledger.store().fetch(&self.request_id)?;
        if !request.state().is_actionable(self.step) {
            messages.error(format!(
                "{} cannot be updated before the prior steps are complete.",
                self.step.task()
            ));
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<DeletionRequest> {
        let mut request = tx.fetch::<DeletionRequest>(&self.request_id)?;
        request
            .set_step(self.step, self.status, &self.justification, &utc_now_iso())
            .or_else(abort)?;
        tx.put(&request)?;
        Ok(request)
    }

    fn success_message(&self, request: &DeletionRequest) -> Option<String> {
        Some(format!(
            "Set {} of request {} to {}.",
            self.step.key(),
            request.id,
            self.status
        ))
    }

    fn emails(&self, _: &Ledger, _: &DeletionRequest) -> Result<Vec<Email>> {
        Ok(vec![])
    }
}

/// Finish a Processing request whose cluster account has been deleted.
pub struct CompleteDeletionRequest {
    request: DeletionRequest,
    user: User,
    cluster_accounts: Vec<(AllocationUser, String)>,
    allocation_users: Vec<AllocationUser>,
}

impl CompleteDeletionRequest {
    pub fn new(ledger: &Ledger, request_id: &str) -> Result<Self> {
        let store = ledger.store();
        let request: DeletionRequest = store.fetch(request_id)?;
        let user: User = store.fetch(&request.user_id)?;
        let mut cluster_accounts = vec![];
        for status in ClusterAccountStatus::ALL {
            if *status != ClusterAccountStatus::Removed {
                cluster_accounts.extend(cluster_accounts_in(ledger, &user.id, *status)?);
            }
        }
        let allocation_users = store.filter(|au: &AllocationUser| {
            au.user_id == user.id && au.status == AllocationUserStatus::Active
        })?;
        Ok(Self {
            request,
            user,
            cluster_accounts,
            allocation_users,
        })
    }
}

impl Transition for CompleteDeletionRequest {
    type Output = DeletionRequest;

    fn check(&mut self, _: &Ledger, messages: &mut Messages) -> Result<bool> {
        let mut ok = true;
        if self.request.status() != DeletionStatus::Processing {
            messages.error(format!(
                "Request {} must be Processing to be completed; it is {}.",
                self.request.id,
                self.request.status()
            ));
            ok = false;
        }
        if !self.request.state().account_deletion.is(StepStatus::Complete) {
            messages.error("The cluster account has not been deleted yet.");
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<DeletionRequest> {
        let mut request = tx.fetch::<DeletionRequest>(&self.request.id)?;
        request.complete(Utc::now()).or_else(abort)?;
        tx.index_remove(&request.active_key())?;
        tx.put(&request)?;

        set_cluster_statuses(tx, &self.cluster_accounts, ClusterAccountStatus::Removed)?;
        for au in &self.allocation_users {
            let mut au = tx.fetch::<AllocationUser>(&au.id)?;
            au.status = AllocationUserStatus::Removed;
            tx.put(&au)?;
        }
        Ok(request)
    }

    fn success_message(&self, request: &DeletionRequest) -> Option<String> {
        Some(format!(
            "Completed {} request {} for user {}.",
            request.kind.label(),
            request.id,
            self.user.username
        ))
    }

    fn emails(&self, ledger: &Ledger, _: &DeletionRequest) -> Result<Vec<Email>> {
        Ok(vec![base_email(ledger, "Account Deletion Complete", "account_deletion/complete")
            .with("user_name", full_name(&self.user))
            .to(vec![self.user.email.clone()])])
    }
}

/// Who is cancelling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Canceller {
    User(String),
    System,
}

/// Cancel a Queued or Ready request, recording why in `state.other`.
pub struct CancelDeletionRequest {
    request: DeletionRequest,
    canceller: Option<User>,
    justification: String,
    pending_accounts: Vec<(AllocationUser, String)>,
    user: User,
}

impl CancelDeletionRequest {
    pub fn new(
        ledger: &Ledger,
        request_id: &str,
        canceller: Canceller,
        justification: &str,
    ) -> Result<Self> {
        let store = ledger.store();
        let request: DeletionRequest = store.fetch(request_id)?;
        let user: User = store.fetch(&request.user_id)?;
        let canceller = match canceller {
            Canceller::User(id) => Some(store.fetch::<User>(&id)?),
            Canceller::System => None,
        };
        let pending_accounts =
            cluster_accounts_in(ledger, &request.user_id, ClusterAccountStatus::PendingDelete)?;
        Ok(Self {
            request,
            canceller,
            justification: justification.to_string(),
            pending_accounts,
            user,
        })
    }
}

impl Transition for CancelDeletionRequest {
    type Output = DeletionRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        if !self.request.status().is_cancellable() {
            messages.error("Request must be \"Queued\" or \"Ready\" to be eligible for cancellation.");
            return Ok(false);
        }
        let Some(canceller) = &self.canceller else {
            return Ok(true);
        };

        let min = ledger.config().cancellation_justification_min_length;
        let mut ok = true;
        if self.justification.trim().chars().count() < min {
            messages.error(format!("The justification must be at least {min} characters long."));
            ok = false;
        }
        if !canceller.is_superuser {
            if canceller.id != self.request.user_id {
                messages.error("You do not have permission to cancel this request.");
                ok = false;
            } else if self.request.reason != DeletionReason::User {
                messages.error(
                    "You can only cancel account deletion requests that you initially requested.",
                );
                ok = false;
            }
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<DeletionRequest> {
        let mut request = tx.fetch::<DeletionRequest>(&self.request.id)?;
        request.cancel(&self.justification, &utc_now_iso()).or_else(abort)?;
        tx.index_remove(&request.active_key())?;
        tx.put(&request)?;
        set_cluster_statuses(tx, &self.pending_accounts, ClusterAccountStatus::Active)?;
        Ok(request)
    }

    fn success_message(&self, request: &DeletionRequest) -> Option<String> {
        Some(format!(
            "Account deletion request {} has been cancelled for the following reason: \"{}\".",
            request.id, self.justification
        ))
    }

    fn after_commit(&self, _: &Ledger, request: &DeletionRequest, _: &mut Messages) {
        if self.canceller.is_none() {
            tracing::info!(
                request_id = %request.id,
                user = %self.user.username,
                justification = %self.justification,
                "automatically cancelled deletion request"
            );
        }
    }

    fn emails(&self, ledger: &Ledger, _: &DeletionRequest) -> Result<Vec<Email>> {
        if self.canceller.is_none() {
            return Ok(vec![]);
        }
        Ok(vec![base_email(
            ledger,
            "Account Deletion Request Cancelled",
            "account_deletion/cancelled",
        )
        .with("user_name", full_name(&self.user))
        .with("justification", self.justification.clone())
        .to(vec![self.user.email.clone()])])
    }
}

/// Cancel the user's system-initiated account deletion request, if one is
/// still Queued or Ready.
pub fn cancel_system_initiated(
    ledger: &Ledger,
    user_id: &str,
    justification: &str,
) -> Result<Option<DeletionRequest>> {
    let pending = ledger.store().filter(|r: &DeletionRequest| {
        r.user_id == user_id
            && r.kind == DeletionKind::Account
            && r.is_system_initiated()
            && r.status().is_cancellable()
    })?;
    let Some(request) = pending.into_iter().next() else {
        return Ok(None);
    };

    let transition = CancelDeletionRequest::new(ledger, &request.id, Canceller::System, justification)?;
    let mut runner = Runner::new(ledger, transition);
    let cancelled = runner.run()?;
    for message in runner.get_messages().1 {
        tracing::warn!(%message, "automatic cancellation did not apply");
    }
    Ok(cancelled)
}

//! Adding users to and removing users from an existing secure directory.
use crate::accounting::allocation_user_key;
use crate::choices::{AllocationUserStatus, ProjectUserStatus};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::models::{Allocation, AllocationUser, ProjectUser, User};
use crate::notification::Email;
use crate::requests::{SecureDirUserAction, SecureDirUserRequest};
use crate::runner::{base_email, Messages, Transition};
use crate::secure_dir::{directory_path, GROUPS_DIRECTORY_RESOURCE, SCRATCH_DIRECTORY_RESOURCE};
use crate::store::{abort, Tx, TxResult};
use crate::utils::{new_uuid_to_bech32, utc_now_iso};
use chrono::Utc;

/// A secure directory allocation and its on-cluster path.
#[derive(Debug, Clone)]
pub struct SecureDirectory {
    pub allocation: Allocation,
    pub path: String,
}

impl SecureDirectory {
    pub fn load(ledger: &Ledger, allocation_id: &str) -> Result<Self> {
        let allocation: Allocation = ledger.store().fetch(allocation_id)?;
        if !allocation.has_resource(GROUPS_DIRECTORY_RESOURCE)
            && !allocation.has_resource(SCRATCH_DIRECTORY_RESOURCE)
        {
            return Err(LedgerError::InvalidArgument(format!(
                "Allocation {allocation_id} is not a secure directory."
            )));
        }
        let path = directory_path(ledger, allocation_id)?;
        Ok(Self { allocation, path })
    }

    /// Users with Active access to the directory.
    pub fn users(&self, ledger: &Ledger) -> Result<Vec<User>> {
        ledger
            .store()
            .filter(|au: &AllocationUser| {
                au.allocation_id == self.allocation.id && au.status == AllocationUserStatus::Active
            })?
            .iter()
            .map(|au| ledger.store().fetch(&au.user_id))
            .collect()
    }

    fn has_pending_request(&self, ledger: &Ledger, user_id: &str) -> Result<bool> {
        ledger.store().exists(|r: &SecureDirUserRequest| {
            r.allocation_id == self.allocation.id && r.user_id == user_id && r.status().is_pending()
        })
    }

    /// Active members of the project with cluster access who are not in the
    /// directory and have no pending request for it.
    pub fn addable_users(&self, ledger: &Ledger) -> Result<Vec<User>> {
        let current: Vec<String> = self.users(ledger)?.into_iter().map(|u| u.id).collect();
        let members = ledger.store().filter(|pu: &ProjectUser| {
            pu.project_id == self.allocation.project_id && pu.status == ProjectUserStatus::Active
        })?;
        let mut addable = vec![];
        for pu in members {
            if current.contains(&pu.user_id)
                || !ledger.accounting().has_cluster_access(&pu.user_id)?
                || self.has_pending_request(ledger, &pu.user_id)?
            {
                continue;
            }
            addable.push(ledger.store().fetch(&pu.user_id)?);
        }
        Ok(addable)
    }

    /// Directory members who are not PIs of the project and have no pending
    /// request for it.
    pub fn removable_users(&self, ledger: &Ledger) -> Result<Vec<User>> {
        let pis: Vec<String> = ledger
            .directory()
            .principal_investigators(&self.allocation.project_id)?
            .into_iter()
            .map(|u| u.id)
            .collect();
        let mut removable = vec![];
        for user in self.users(ledger)? {
            if pis.contains(&user.id) || self.has_pending_request(ledger, &user.id)? {
                continue;
            }
            removable.push(user);
        }
        Ok(removable)
    }
}

fn user_str(user: &User) -> String {
    format!("{} {} ({})", user.first_name, user.last_name, user.email)
}

/// Ask for a user to be added to or removed from a directory.
pub struct CreateSecureDirUserRequest {
    directory: SecureDirectory,
    user: User,
    request: SecureDirUserRequest,
}

impl CreateSecureDirUserRequest {
    pub fn new(
        ledger: &Ledger,
        action: SecureDirUserAction,
        allocation_id: &str,
        user_id: &str,
        requester_id: &str,
    ) -> Result<Self> {
        let directory = SecureDirectory::load(ledger, allocation_id)?;
        let user: User = ledger.store().fetch(user_id)?;
        ledger.store().fetch::<User>(requester_id)?;
        let request = SecureDirUserRequest::new(
            new_uuid_to_bech32("sdu_")?,
            action,
            user_id,
            requester_id,
            allocation_id,
            &directory.path,
        );
        Ok(Self { directory, user, request })
    }

    fn duplicate_message(&self) -> String {
        format!(
            "User {} already has a pending request for {}.",
            self.user.username, self.directory.path
        )
    }
}

impl Transition for CreateSecureDirUserRequest {
    type Output = SecureDirUserRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let action = self.request.action;
        let eligible = match action {
            SecureDirUserAction::Add => self.directory.addable_users(ledger)?,
            SecureDirUserAction::Remove => self.directory.removable_users(ledger)?,
        };
        if !eligible.iter().any(|u| u.id == self.user.id) {
            messages.error(format!(
                "User {} cannot be {} {} {}.",
                self.user.username,
                match action {
                    SecureDirUserAction::Add => "added",
                    SecureDirUserAction::Remove => "removed",
                },
                action.preposition(),
                self.directory.path
            ));
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<SecureDirUserRequest> {
        let key = self.request.pending_key();
        if tx.index_get(&key)?.is_some() {
            return abort(LedgerError::PreconditionFailed(self.duplicate_message()));
        }
        tx.index_set(&key, &self.request.id)?;
        tx.put(&self.request)?;
        Ok(self.request.clone())
    }

    fn success_message(&self, request: &SecureDirUserRequest) -> Option<String> {
        Some(format!(
            "Successfully requested the {} of {} {} {}.",
            request.action.noun(),
            self.user.username,
            request.action.preposition(),
            self.directory.path
        ))
    }

    fn emails(&self, ledger: &Ledger, request: &SecureDirUserRequest) -> Result<Vec<Email>> {
        let (subject, template) = match request.action {
            SecureDirUserAction::Add => (
                "New Secure Directory Add User Request",
                "secure_dir_request/new_add_user_request",
            ),
            SecureDirUserAction::Remove => (
                "New Secure Directory Remove User Request",
                "secure_dir_request/new_remove_user_request",
            ),
        };
        let review_url = format!(
            "{}/secure-dir/{}-users/pending",
            ledger.config().center_base_url.trim_end_matches('/'),
            request.action.verb()
        );
        Ok(vec![base_email(ledger, subject, template)
            .with("user_str", user_str(&self.user))
            .with("directory_name", self.directory.path.clone())
            .with("review_url", review_url)
            .to(ledger.config().email_admin_list.clone())])
    }
}

/// Mark a pending request as being worked on.
pub struct ProcessSecureDirUserRequest {
    request_id: String,
}

impl ProcessSecureDirUserRequest {
    pub fn new(request_id: &str) -> Self {
        Self { request_id: request_id.to_string() }
    }
}

impl Transition for ProcessSecureDirUserRequest {
    type Output = SecureDirUserRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: SecureDirUserRequest = ledger.store().fetch(&self.request_id)?;
        if request.status() != crate::choices::SecureDirUserRequestStatus::Pending {
            messages.error(format!("Request {} is {}.", request.id, request.status()));
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<SecureDirUserRequest> {
        let mut request = tx.fetch::<SecureDirUserRequest>(&self.request_id)?;
        request.start_processing().or_else(abort)?;
        tx.put(&request)?;
        Ok(request)
    }

    fn emails(&self, _: &Ledger, _: &SecureDirUserRequest) -> Result<Vec<Email>> {
        Ok(vec![])
    }
}

/// Grant or revoke access on the directory's allocation.
pub struct CompleteSecureDirUserRequest {
    request: SecureDirUserRequest,
    user: User,
    fresh_allocation_user_id: String,
}

impl CompleteSecureDirUserRequest {
    pub fn new(ledger: &Ledger, request_id: &str) -> Result<Self> {
        let request: SecureDirUserRequest = ledger.store().fetch(request_id)?;
        let user: User = ledger.store().fetch(&request.user_id)?;
        Ok(Self {
            request,
            user,
            fresh_allocation_user_id: new_uuid_to_bech32("au_")?,
        })
    }
}

impl Transition for CompleteSecureDirUserRequest {
    type Output = SecureDirUserRequest;

    fn check(&mut self, _: &Ledger, messages: &mut Messages) -> Result<bool> {
        if !self.request.status().is_pending() {
            messages.error(format!("Request {} is already {}.", self.request.id, self.request.status()));
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<SecureDirUserRequest> {
        let mut request = tx.fetch::<SecureDirUserRequest>(&self.request.id)?;
        request.complete(Utc::now()).or_else(abort)?;
        tx.index_remove(&request.pending_key())?;
        tx.put(&request)?;

        let key = allocation_user_key(&request.allocation_id, &request.user_id);
        let existing = match tx.index_get(&key)? {
            Some(id) => Some(tx.fetch::<AllocationUser>(&id)?),
            None => None,
        };
        let allocation_user = match (request.action, existing) {
            (SecureDirUserAction::Add, Some(mut au)) => {
                au.status = AllocationUserStatus::Active;
                au
            }
            (SecureDirUserAction::Add, None) => {
                tx.index_set(&key, &self.fresh_allocation_user_id)?;
                AllocationUser {
                    id: self.fresh_allocation_user_id.clone(),
                    allocation_id: request.allocation_id.clone(),
                    user_id: request.user_id.clone(),
                    status: AllocationUserStatus::Active,
                }
            }
            (SecureDirUserAction::Remove, Some(mut au)) => {
                au.status = AllocationUserStatus::Removed;
                au
            }
            (SecureDirUserAction::Remove, None) => {
                return abort(LedgerError::does_not_exist("AllocationUser"));
            }
        };
        tx.put(&allocation_user)?;
        Ok(request)
    }

    fn success_message(&self, request: &SecureDirUserRequest) -> Option<String> {
        Some(format!(
            "Completed the {} of {} {} {}.",
            request.action.noun(),
            self.user.username,
            request.action.preposition(),
            request.directory
        ))
    }

    fn emails(&self, ledger: &Ledger, request: &SecureDirUserRequest) -> Result<Vec<Email>> {
        Ok(vec![base_email(
            ledger,
            "Secure Directory User Request Complete",
            "secure_dir_request/user_request_complete",
        )
        .with("user_first_name", self.user.first_name.clone())
        .with("action", request.action.noun())
        .with("preposition", request.action.preposition())
        .with("directory", request.directory.clone())
        .to(vec![self.user.email.clone()])])
    }
}

pub struct DenySecureDirUserRequest {
    request_id: String,
    justification: String,
}

impl DenySecureDirUserRequest {
    pub fn new(request_id: &str, justification: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            justification: justification.to_string(),
        }
    }
}

impl Transition for DenySecureDirUserRequest {
    type Output = SecureDirUserRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: SecureDirUserRequest = ledger.store().fetch(&self.request_id)?;
        let mut ok = true;
        if !request.status().is_pending() {
            messages.error(format!("Request {} is already {}.", request.id, request.status()));
            ok = false;
        }
        if self.justification.trim().is_empty() {
            messages.error("A justification is required to deny a request.");
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<SecureDirUserRequest> {
        let mut request = tx.fetch::<SecureDirUserRequest>(&self.request_id)?;
        request.deny(&self.justification, &utc_now_iso()).or_else(abort)?;
        tx.index_remove(&request.pending_key())?;
        tx.put(&request)?;
        Ok(request)
    }

    fn success_message(&self, request: &SecureDirUserRequest) -> Option<String> {
        Some(format!("Denied request {}.", request.id))
    }

    fn emails(&self, ledger: &Ledger, request: &SecureDirUserRequest) -> Result<Vec<Email>> {
        let user: User = ledger.store().fetch(&request.user_id)?;
        Ok(vec![base_email(
            ledger,
            "Secure Directory User Request Denied",
            "secure_dir_request/user_request_denied",
        )
        .with("user_first_name", user.first_name)
        .with("action", request.action.noun())
        .with("directory", request.directory.clone())
        .with("reason", self.justification.clone())
        .to(vec![user.email])])
    }
}

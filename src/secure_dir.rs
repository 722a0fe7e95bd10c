//! Secure directory requests.
//!
//! A project asks for a pair of protected directories (groups and scratch).
//! Reviewers move the request through its checklist; the overall status is
//! recomputed from the checklist on every write. Approval creates one
//! Allocation per directory.
use crate::choices::{
    AllocationStatus, AttributeType, ProjectStatus, SecureDirRequestStatus, StepStatus,
};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::models::{Allocation, AllocationAttribute, Project, User};
use crate::notification::Email;
use crate::requests::SecureDirRequest;
use crate::runner::{base_email, Messages, Transition};
use crate::state::SecureDirStep;
use crate::store::{abort, Tx, TxResult};
use crate::types::TimeStamp;
use crate::utils::{new_uuid_to_bech32, utc_now_iso};
use chrono::Utc;

pub const GROUPS_DIRECTORY_RESOURCE: &str = "Groups P2/P3 Directory";
pub const SCRATCH_DIRECTORY_RESOURCE: &str = "Scratch P2/P3 Directory";

fn is_secure_dir_allocation(allocation: &Allocation) -> bool {
    allocation.has_resource(GROUPS_DIRECTORY_RESOURCE)
        || allocation.has_resource(SCRATCH_DIRECTORY_RESOURCE)
}

/// Active secure directory allocations, optionally for one project.
pub fn secure_dir_allocations(ledger: &Ledger, project_id: Option<&str>) -> Result<Vec<Allocation>> {
    ledger.store().filter(|a: &Allocation| {
        is_secure_dir_allocation(a)
            && a.status == AllocationStatus::Active
            && project_id.is_none_or(|id| a.project_id == id)
    })
}

/// The on-cluster path of a directory allocation.
pub fn directory_path(ledger: &Ledger, allocation_id: &str) -> Result<String> {
    let attribute = ledger.store().get_one(|a: &AllocationAttribute| {
        a.allocation_id == allocation_id && a.attribute_type == AttributeType::ClusterDirectoryAccess
    })?;
    Ok(attribute.value)
}

/// Why a project may not request secure directories; empty if it may.
pub fn eligibility_problems(ledger: &Ledger, project: &Project) -> Result<Vec<String>> {
    let config = ledger.config();
    let mut problems = vec![];
    if project.status != ProjectStatus::Active {
        problems.push(format!("Project {} is not active.", project.name));
    }
    let eligible_prefix = config
        .secure_dir_eligible_project_prefixes
        .iter()
        .any(|prefix| project.name.starts_with(prefix.as_str()));
    if !eligible_prefix {
        problems.push(format!(
            "Project {} does not have an eligible computing allowance.",
            project.name
        ));
    }
    if !secure_dir_allocations(ledger, Some(&project.id))?.is_empty() {
        problems.push(format!("Project {} already has secure directories.", project.name));
    }
    let open_request = ledger.store().exists(|r: &SecureDirRequest| {
        r.project_id == project.id && r.status() != SecureDirRequestStatus::Denied
    })?;
    if open_request {
        problems.push(format!(
            "Project {} already has a secure directory request.",
            project.name
        ));
    }
    Ok(problems)
}

pub fn is_project_eligible(ledger: &Ledger, project_id: &str) -> Result<bool> {
    let project: Project = ledger.store().fetch(project_id)?;
    Ok(eligibility_problems(ledger, &project)?.is_empty())
}

/// Whether `suffix` is unused by existing directories and by requests that
/// were not denied, ignoring `exclude_request_id`.
pub fn is_directory_name_suffix_available(
    ledger: &Ledger,
    suffix: &str,
    exclude_request_id: Option<&str>,
) -> Result<bool> {
    let prefix = ledger.config().secure_directory_name_prefix.as_str();
    if suffix.starts_with(prefix) {
        return Err(LedgerError::InvalidArgument(format!(
            "Directory name {suffix} must not include the prefix {prefix}."
        )));
    }
    let strip = |name: &str| name.strip_prefix(prefix).unwrap_or(name).to_string();

    let directories: Vec<String> = ledger
        .store()
        .filter(|a: &Allocation| is_secure_dir_allocation(a))?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let taken_by_directory = ledger
        .store()
        .filter(|a: &AllocationAttribute| {
            a.attribute_type == AttributeType::ClusterDirectoryAccess
                && directories.contains(&a.allocation_id)
        })?
        .iter()
        .any(|a| strip(a.value.rsplit('/').next().unwrap_or_default()) == suffix);

    let taken_by_request = ledger.store().exists(|r: &SecureDirRequest| {
        r.status() != SecureDirRequestStatus::Denied
            && Some(r.id.as_str()) != exclude_request_id
            && strip(&r.directory_name) == suffix
    })?;

    Ok(!taken_by_directory && !taken_by_request)
}

fn project_slot_key(project_id: &str) -> String {
    format!("index/active-request/secure-dir/{project_id}")
}

fn name_slot_key(directory_name: &str) -> String {
    format!("index/secure-dir-name/{directory_name}")
}

/// Hold the project's single open-request slot and the directory name for
/// `request`. Slots are held until the request is denied.
fn claim_slots(tx: &Tx<'_>, request: &SecureDirRequest) -> TxResult<()> {
    let slots = [
        (
            project_slot_key(&request.project_id),
            "The project already has a secure directory request.".to_string(),
        ),
        (
            name_slot_key(&request.directory_name),
            format!("The directory name {} is already taken.", request.directory_name),
        ),
    ];
    for (key, problem) in slots {
        match tx.index_get(&key)? {
            Some(holder) if holder != request.id => {
                return abort(LedgerError::PreconditionFailed(problem));
            }
            _ => tx.index_set(&key, &request.id)?,
        }
    }
    Ok(())
}

fn release_slots(tx: &Tx<'_>, request: &SecureDirRequest) -> TxResult<()> {
    for key in [
        project_slot_key(&request.project_id),
        name_slot_key(&request.directory_name),
    ] {
        if tx.index_get(&key)?.as_deref() == Some(request.id.as_str()) {
            tx.index_remove(&key)?;
        }
    }
    Ok(())
}

fn join_path(base: &str, name: &str) -> String {
    format!("{}/{name}", base.trim_end_matches('/'))
}

fn user_str(user: &User) -> String {
    format!("{} {} ({})", user.first_name, user.last_name, user.email)
}

/// Requester first, with the PI copied when someone else asked.
fn requester_and_pi(ledger: &Ledger, request: &SecureDirRequest) -> Result<(User, Vec<String>)> {
    let requester: User = ledger.store().fetch(&request.requester_id)?;
    let cc = if request.pi_id != request.requester_id {
        vec![ledger.store().fetch::<User>(&request.pi_id)?.email]
    } else {
        vec![]
    };
    Ok((requester, cc))
}

fn denial_email(ledger: &Ledger, request: &SecureDirRequest) -> Result<Email> {
    let (requester, cc) = requester_and_pi(ledger, request)?;
    let project: Project = ledger.store().fetch(&request.project_id)?;
    let reason = request.denial_reason()?;
    Ok(base_email(ledger, "Secure Directory Request Denied", "secure_dir_request/denied")
        .with("user_first_name", requester.first_name.clone())
        .with("user_last_name", requester.last_name.clone())
        .with("project", project.name)
        .with("reason", reason.justification)
        .to(vec![requester.email])
        .cc(cc))
}

pub struct CreateSecureDirRequest {
    request: SecureDirRequest,
    project: Project,
    suffix: String,
}

impl CreateSecureDirRequest {
    /// `directory_suffix` is the name without the configured prefix.
    pub fn new(
        ledger: &Ledger,
        requester_id: &str,
        pi_id: &str,
        project_id: &str,
        directory_suffix: &str,
        data_description: &str,
    ) -> Result<Self> {
        let store = ledger.store();
        store.fetch::<User>(requester_id)?;
        store.fetch::<User>(pi_id)?;
        let project: Project = store.fetch(project_id)?;
        let directory_name = format!(
            "{}{directory_suffix}",
            ledger.config().secure_directory_name_prefix
        );
        let request = SecureDirRequest::new(
            new_uuid_to_bech32("sdr_")?,
            requester_id,
            pi_id,
            project_id,
            &directory_name,
            data_description,
        );
        Ok(Self {
            request,
            project,
            suffix: directory_suffix.to_string(),
        })
    }

    pub fn with_department(mut self, department: &str) -> Self {
        self.request.department = Some(department.to_string());
        self
    }
}

impl Transition for CreateSecureDirRequest {
    type Output = SecureDirRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let mut ok = true;
        for problem in eligibility_problems(ledger, &self.project)? {
            messages.error(problem);
            ok = false;
        }
        let pis = ledger.directory().principal_investigators(&self.project.id)?;
        if !pis.iter().any(|pi| pi.id == self.request.pi_id) {
            messages.error(format!(
                "The selected user is not a PI of project {}.",
                self.project.name
            ));
            ok = false;
        }
        if self.suffix.is_empty() {
            messages.error("The directory name must not be empty.");
            ok = false;
        } else if !is_directory_name_suffix_available(ledger, &self.suffix, None)? {
            messages.error(format!(
                "The directory name {} is already taken.",
                self.request.directory_name
            ));
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<SecureDirRequest> {
        claim_slots(tx, &self.request)?;
        tx.put(&self.request)?;
        Ok(self.request.clone())
    }

    fn success_message(&self, _: &SecureDirRequest) -> Option<String> {
        Some(format!(
            "Your request for a secure directory for project {} was submitted for review.",
            self.project.name
        ))
    }

    fn emails(&self, ledger: &Ledger, request: &SecureDirRequest) -> Result<Vec<Email>> {
        let store = ledger.store();
        let requester: User = store.fetch(&request.requester_id)?;
        let pi: User = store.fetch(&request.pi_id)?;
        let review_url = format!(
            "{}/secure-dir/{}",
            ledger.config().center_base_url.trim_end_matches('/'),
            request.id
        );

        let mut emails = vec![base_email(ledger, "New Secure Directory Request", "secure_dir_request/new_request_admin")
            .with("pi_str", user_str(&pi))
            .with("project_name", self.project.name.clone())
            .with("requester_str", user_str(&requester))
            .with("review_url", review_url.clone())
            .to(ledger.config().email_admin_list.clone())];

        if pi.id != requester.id {
            emails.push(
                base_email(ledger, "New Secure Directory Request", "secure_dir_request/new_request_pi")
                    .with("pi_str", format!("{} {}", pi.first_name, pi.last_name))
                    .with("project_name", self.project.name.clone())
                    .with("requester_str", user_str(&requester))
                    .with("review_url", review_url)
                    .to(vec![pi.email.clone()]),
            );
        }
        Ok(emails)
    }
}

/// Outcome of a step or denial write.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub request: SecureDirRequest,
    pub newly_denied: bool,
}

/// Set one checklist step. A write that takes the request to Denied sends
/// the denial notification.
pub struct UpdateSecureDirStep {
    request_id: String,
    step: SecureDirStep,
    status: StepStatus,
    justification: String,
}

impl UpdateSecureDirStep {
    pub fn new(request_id: &str, step: SecureDirStep, status: StepStatus, justification: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            step,
            status,
            justification: justification.to_string(),
        }
    }
}

impl Transition for UpdateSecureDirStep {
    type Output = ReviewOutcome;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: SecureDirRequest = ledger.store().fetch(&self.request_id)?;
        let mut ok = true;
        if request.status().is_terminal() {
            messages.error(format!("The request is already {}.", request.status()));
            ok = false;
        }
        if !self.step.accepts(self.status) {
            messages.error(format!("{} is not a valid status for {}.", self.status, self.step.task()));
            ok = false;
        }
        if !request.state().is_actionable(self.step) {
            messages.error(format!(
                "{} cannot be updated before the prior steps are complete.",
                self.step.task()
            ));
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<ReviewOutcome> {
        let mut request = tx.fetch::<SecureDirRequest>(&self.request_id)?;
        let before = request.status();
        request
            .set_step(self.step, self.status, &self.justification, &utc_now_iso())
            .or_else(abort)?;
        tx.put(&request)?;
        let newly_denied =
            before != SecureDirRequestStatus::Denied && request.status() == SecureDirRequestStatus::Denied;
        if newly_denied {
            release_slots(tx, &request)?;
        }
        Ok(ReviewOutcome { request, newly_denied })
    }

    fn success_message(&self, outcome: &ReviewOutcome) -> Option<String> {
        Some(format!(
            "{} status set to {}. The request is {}.",
            self.step.task(),
            self.status,
            outcome.request.status()
        ))
    }

    fn emails(&self, ledger: &Ledger, outcome: &ReviewOutcome) -> Result<Vec<Email>> {
        if !outcome.newly_denied {
            return Ok(vec![]);
        }
        Ok(vec![denial_email(ledger, &outcome.request)?])
    }
}

/// Deny a request for a reason outside the checklist.
pub struct DenySecureDirRequest {
    request_id: String,
    justification: String,
}

impl DenySecureDirRequest {
    pub fn new(request_id: &str, justification: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            justification: justification.to_string(),
        }
    }
}

impl Transition for DenySecureDirRequest {
    type Output = ReviewOutcome;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: SecureDirRequest = ledger.store().fetch(&self.request_id)?;
        let mut ok = true;
        if request.status().is_terminal() {
            messages.error(format!("The request is already {}.", request.status()));
            ok = false;
        }
        if self.justification.trim().is_empty() {
            messages.error("A justification is required to deny a request.");
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<ReviewOutcome> {
        let mut request = tx.fetch::<SecureDirRequest>(&self.request_id)?;
        request.deny(&self.justification, &utc_now_iso()).or_else(abort)?;
        release_slots(tx, &request)?;
        tx.put(&request)?;
        Ok(ReviewOutcome { request, newly_denied: true })
    }

    fn success_message(&self, _: &ReviewOutcome) -> Option<String> {
        Some("Successfully denied the request.".into())
    }

    fn emails(&self, ledger: &Ledger, outcome: &ReviewOutcome) -> Result<Vec<Email>> {
        Ok(vec![denial_email(ledger, &outcome.request)?])
    }
}

/// Return a denied request to review. Denied steps go back to Pending.
pub struct UndenySecureDirRequest {
    request_id: String,
}

impl UndenySecureDirRequest {
    pub fn new(request_id: &str) -> Self {
        Self { request_id: request_id.to_string() }
    }
}

impl Transition for UndenySecureDirRequest {
    type Output = SecureDirRequest;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let request: SecureDirRequest = ledger.store().fetch(&self.request_id)?;
        if request.status() != SecureDirRequestStatus::Denied {
            messages.error(format!(
                "Only denied requests can be undenied; this request is {}.",
                request.status()
            ));
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<SecureDirRequest> {
        let mut request = tx.fetch::<SecureDirRequest>(&self.request_id)?;
        request.undeny().or_else(abort)?;
        claim_slots(tx, &request)?;
        tx.put(&request)?;
        Ok(request)
    }

    fn success_message(&self, request: &SecureDirRequest) -> Option<String> {
        Some(format!("The request is {} again.", request.status()))
    }

    fn emails(&self, _: &Ledger, _: &SecureDirRequest) -> Result<Vec<Email>> {
        Ok(vec![])
    }
}

#[derive(Debug, Clone)]
pub struct ApprovedDirectories {
    pub request: SecureDirRequest,
    pub groups: Allocation,
    pub scratch: Allocation,
    pub groups_path: String,
    pub scratch_path: String,
}

struct PlannedDirectory {
    allocation: Allocation,
    attribute: AllocationAttribute,
}

impl PlannedDirectory {
    fn new(project_id: &str, resource: &str, path: String) -> Result<Self> {
        let allocation = Allocation {
            id: new_uuid_to_bech32("alloc_")?,
            project_id: project_id.to_string(),
            status: AllocationStatus::Active,
            resources: vec![resource.to_string()],
            start_date: Some(TimeStamp::new()),
            end_date: None,
        };
        let attribute = AllocationAttribute {
            id: new_uuid_to_bech32("aa_")?,
            allocation_id: allocation.id.clone(),
            attribute_type: AttributeType::ClusterDirectoryAccess,
            value: path,
        };
        Ok(Self { allocation, attribute })
    }
}

/// Approve a request whose directories have been set up, creating the
/// groups and scratch directory allocations.
pub struct ApproveSecureDirRequest {
    request: SecureDirRequest,
    project: Project,
    groups: PlannedDirectory,
    scratch: PlannedDirectory,
}

impl ApproveSecureDirRequest {
    pub fn new(ledger: &Ledger, request_id: &str) -> Result<Self> {
        let store = ledger.store();
        let request: SecureDirRequest = store.fetch(request_id)?;
        let project: Project = store.fetch(&request.project_id)?;
        let config = ledger.config();
        let groups = PlannedDirectory::new(
            &project.id,
            GROUPS_DIRECTORY_RESOURCE,
            join_path(&config.groups_directory_path, &request.directory_name),
        )?;
        let scratch = PlannedDirectory::new(
            &project.id,
            SCRATCH_DIRECTORY_RESOURCE,
            join_path(&config.scratch_directory_path, &request.directory_name),
        )?;
        Ok(Self { request, project, groups, scratch })
    }
}

impl Transition for ApproveSecureDirRequest {
    type Output = ApprovedDirectories;

    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool> {
        let mut ok = true;
        if self.request.status() != SecureDirRequestStatus::ApprovedProcessing {
            messages.error(format!(
                "The request must be {} to be approved; it is {}.",
                SecureDirRequestStatus::ApprovedProcessing,
                self.request.status()
            ));
            ok = false;
        }
        if !self.request.state().setup.is(StepStatus::Completed) {
            messages.error("The directories have not been set up on the cluster.");
            ok = false;
        }
        if !secure_dir_allocations(ledger, Some(&self.project.id))?.is_empty() {
            messages.error(format!("Project {} already has secure directories.", self.project.name));
            ok = false;
        }
        Ok(ok)
    }

    fn apply(&self, tx: &Tx<'_>) -> TxResult<ApprovedDirectories> {
        let mut request = tx.fetch::<SecureDirRequest>(&self.request.id)?;
        request.complete(Utc::now()).or_else(abort)?;
        tx.put(&request)?;
        for planned in [&self.groups, &self.scratch] {
            tx.put(&planned.allocation)?;
            tx.put(&planned.attribute)?;
        }
        Ok(ApprovedDirectories {
            request,
            groups: self.groups.allocation.clone(),
            scratch: self.scratch.allocation.clone(),
            groups_path: self.groups.attribute.value.clone(),
            scratch_path: self.scratch.attribute.value.clone(),
        })
    }

    fn success_message(&self, _: &ApprovedDirectories) -> Option<String> {
        Some(format!(
            "Successfully approved the request and created secure directories for {}.",
            self.project.name
        ))
    }

    fn emails(&self, ledger: &Ledger, approved: &ApprovedDirectories) -> Result<Vec<Email>> {
        let (requester, cc) = requester_and_pi(ledger, &approved.request)?;
        Ok(vec![base_email(ledger, "Secure Directory Request Approved", "secure_dir_request/approved")
            .with("user_first_name", requester.first_name.clone())
            .with("user_last_name", requester.last_name.clone())
            .with("project", self.project.name.clone())
            .with("groups_dir_path", approved.groups_path.clone())
            .with("scratch_dir_path", approved.scratch_path.clone())
            .to(vec![requester.email])
            .cc(cc)])
    }

    fn failure_emails(&self, ledger: &Ledger, error: &LedgerError) -> Vec<Email> {
        vec![base_email(ledger, "Secure Directory Approval Failed", "secure_dir_request/approval_failed")
            .with("request_id", self.request.id.clone())
            .with("project", self.project.name.clone())
            .with("error", error.to_string())
            .to(ledger.config().email_admin_list.clone())]
    }
}

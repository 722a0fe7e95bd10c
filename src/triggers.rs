//! Cross-workflow reactions to membership changes.
//!
//! Handlers run synchronously after the triggering write has committed. A
//! failing handler is logged and never undoes or fails the trigger.
use crate::account_deletion::{cancel_system_initiated, CreateDeletionRequest};
use crate::choices::DeletionReason;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::models::{Project, ProjectUser, ProjectUserRemovalRequest};
use crate::requests::DeletionKind;
use crate::runner::Runner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ProjectUserCreated { project_user_id: String },
    JoinRequestCreated { project_user_id: String },
    NewProjectRequestCreated { requester_id: String, project_id: String },
    RemovalRequestCompleted { removal_request_id: String },
}

pub type Handler = fn(&Ledger, &Event) -> Result<()>;

pub struct TriggerBus {
    handlers: Vec<Handler>,
}

impl TriggerBus {
    pub fn empty() -> Self {
        Self { handlers: vec![] }
    }

    pub fn with_default_handlers() -> Self {
        let mut bus = Self::empty();
        bus.register(cancel_deletion_on_membership);
        bus.register(delete_account_after_last_project);
        bus
    }

    pub fn register(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, ledger: &Ledger, event: &Event) {
        for handler in &self.handlers {
            if let Err(e) = handler(ledger, event) {
                tracing::error!(?event, error = %e, "trigger handler failed");
            }
        }
    }
}

/// A user who joins, asks to join, or asks to create a project is no longer
/// a candidate for automatic account deletion.
fn cancel_deletion_on_membership(ledger: &Ledger, event: &Event) -> Result<()> {
    let store = ledger.store();
    let (user_id, justification) = match event {
        Event::ProjectUserCreated { project_user_id } => {
            let pu: ProjectUser = store.fetch(project_user_id)?;
            let project: Project = store.fetch(&pu.project_id)?;
            (pu.user_id, format!("User joined project {}.", project.name))
        }
        Event::JoinRequestCreated { project_user_id } => {
            let pu: ProjectUser = store.fetch(project_user_id)?;
            let project: Project = store.fetch(&pu.project_id)?;
            (pu.user_id, format!("User requested to join project {}.", project.name))
        }
        Event::NewProjectRequestCreated { requester_id, project_id } => {
            let project: Project = store.fetch(project_id)?;
            (
                requester_id.clone(),
                format!("User requested to create project {}.", project.name),
            )
        }
        Event::RemovalRequestCompleted { .. } => return Ok(()),
    };

    if let Some(request) = cancel_system_initiated(ledger, &user_id, &justification)? {
        tracing::info!(
            request_id = %request.id,
            %user_id,
            %justification,
            "cancelled system-initiated account deletion"
        );
    }
    Ok(())
}

/// Removing a user from their last active project queues their account for
/// deletion.
fn delete_account_after_last_project(ledger: &Ledger, event: &Event) -> Result<()> {
    let Event::RemovalRequestCompleted { removal_request_id } = event else {
        return Ok(());
    };
    let store = ledger.store();
    let removal: ProjectUserRemovalRequest = store.fetch(removal_request_id)?;
    let pu: ProjectUser = store.fetch(&removal.project_user_id)?;
    if !ledger.directory().active_memberships(&pu.user_id)?.is_empty() {
        return Ok(());
    }

    let transition = CreateDeletionRequest::new(
        ledger,
        DeletionKind::Account,
        &pu.user_id,
        &pu.user_id,
        DeletionReason::LastProject,
    )?;
    let mut runner = Runner::new(ledger, transition);
    if let Some(request) = runner.run()? {
        tracing::info!(request_id = %request.id, user_id = %pu.user_id, "queued account deletion after last project");
    }
    for message in runner.get_warning_messages() {
        tracing::warn!(%message, "account deletion after last project");
    }
    for message in runner.get_messages().1 {
        tracing::info!(%message, "account deletion after last project not created");
    }
    Ok(())
}

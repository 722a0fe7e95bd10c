//! Users, projects and project membership.
//!
//! Membership changes emit the trigger events that other workflows react to.
use crate::choices::{ProjectRemovalStatus, ProjectStatus, ProjectUserRole, ProjectUserStatus};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::models::{Project, ProjectUser, ProjectUserRemovalRequest, User};
use crate::store::abort;
use crate::triggers::Event;
use crate::types::TimeStamp;
use crate::utils::new_uuid_to_bech32;

pub struct Directory<'a> {
    ledger: &'a Ledger,
}

fn membership_key(project_id: &str, user_id: &str) -> String {
    format!("index/project-user/{project_id}/{user_id}")
}

impl<'a> Directory<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<User> {
        if username.is_empty() {
            return Err(LedgerError::InvalidArgument("username must not be empty".into()));
        }
        let user = User {
            id: new_uuid_to_bech32("user_")?,
            username: username.to_string(),
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            is_superuser: false,
        };
        self.ledger.store().put(&user)?;
        Ok(user)
    }

    pub fn user(&self, user_id: &str) -> Result<User> {
        self.ledger.store().fetch(user_id)
    }

    pub fn create_project(&self, name: &str, status: ProjectStatus) -> Result<Project> {
        if name.is_empty() {
            return Err(LedgerError::InvalidArgument("project name must not be empty".into()));
        }
        let project = Project {
            id: new_uuid_to_bech32("proj_")?,
            name: name.to_string(),
            status,
        };
        let key = format!("index/project-name/{name}");
        self.ledger.store().transaction(|tx| {
            if tx.index_get(&key)?.is_some() {
                return abort(LedgerError::PreconditionFailed(format!(
                    "A project named {name} already exists."
                )));
            }
            tx.index_set(&key, &project.id)?;
            tx.put(&project)
        })?;
        Ok(project)
    }

    pub fn project(&self, project_id: &str) -> Result<Project> {
        self.ledger.store().fetch(project_id)
    }

    pub fn project_by_name(&self, name: &str) -> Result<Project> {
        self.ledger.store().get_one(|p: &Project| p.name == name)
    }

    pub fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<Project> {
        self.ledger.store().transaction(|tx| {
            let mut project = tx.fetch::<Project>(project_id)?;
            project.status = status;
            tx.put(&project)?;
            Ok(project)
        })
    }

    /// A user asks to create a new project. The project starts out `New`
    /// with the requester as its PI.
    pub fn request_new_project(&self, requester_id: &str, name: &str) -> Result<Project> {
        self.user(requester_id)?;
        let project = self.create_project(name, ProjectStatus::New)?;
        self.insert_membership(
            &project.id,
            requester_id,
            ProjectUserRole::PrincipalInvestigator,
            ProjectUserStatus::Active,
        )?;
        self.ledger.emit(&Event::NewProjectRequestCreated {
            requester_id: requester_id.to_string(),
            project_id: project.id.clone(),
        });
        Ok(project)
    }

    /// Add a user to a project.
    pub fn add_project_user(
        &self,
        project_id: &str,
        user_id: &str,
        role: ProjectUserRole,
        status: ProjectUserStatus,
    ) -> Result<ProjectUser> {
        let project_user = self.insert_membership(project_id, user_id, role, status)?;
        self.ledger.emit(&Event::ProjectUserCreated {
            project_user_id: project_user.id.clone(),
        });
        Ok(project_user)
    }

    /// A user asks to join a project; membership stays `Pending - Add`
    /// until a manager approves it.
    pub fn request_to_join(&self, project_id: &str, user_id: &str) -> Result<ProjectUser> {
        let project_user = self.insert_membership(
            project_id,
            user_id,
            ProjectUserRole::User,
            ProjectUserStatus::PendingAdd,
        )?;
        self.ledger.emit(&Event::JoinRequestCreated {
            project_user_id: project_user.id.clone(),
        });
        Ok(project_user)
    }

    pub fn approve_join(&self, project_user_id: &str) -> Result<ProjectUser> {
        self.ledger.store().transaction(|tx| {
            let mut project_user = tx.fetch::<ProjectUser>(project_user_id)?;
            if project_user.status != ProjectUserStatus::PendingAdd {
                return abort(LedgerError::PreconditionFailed(format!(
                    "ProjectUser {} is not pending addition.",
                    project_user.id
                )));
            }
            project_user.status = ProjectUserStatus::Active;
            tx.put(&project_user)?;
            Ok(project_user)
        })
    }

    fn insert_membership(
        &self,
        project_id: &str,
        user_id: &str,
        role: ProjectUserRole,
        status: ProjectUserStatus,
    ) -> Result<ProjectUser> {
        self.project(project_id)?;
        self.user(user_id)?;

        let project_user = ProjectUser {
            id: new_uuid_to_bech32("pu_")?,
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            role,
            status,
        };
        let key = membership_key(project_id, user_id);
        self.ledger.store().transaction(|tx| {
            let Some(existing_id) = tx.index_get(&key)? else {
                tx.index_set(&key, &project_user.id)?;
                tx.put(&project_user)?;
                return Ok(project_user.clone());
            };
            // A former member gets their old row back.
            let mut existing = tx.fetch::<ProjectUser>(&existing_id)?;
            if !matches!(
                existing.status,
                ProjectUserStatus::Removed | ProjectUserStatus::Denied
            ) {
                return abort(LedgerError::PreconditionFailed(format!(
                    "User {user_id} is already a member of project {project_id}."
                )));
            }
            existing.role = role;
            existing.status = status;
            tx.put(&existing)?;
            Ok(existing)
        })
    }

    pub fn project_user(&self, project_id: &str, user_id: &str) -> Result<ProjectUser> {
        match self.ledger.store().index_value(&membership_key(project_id, user_id))? {
            Some(id) => self.ledger.store().fetch(&id),
            None => Err(LedgerError::does_not_exist("ProjectUser")),
        }
    }

    pub fn active_memberships(&self, user_id: &str) -> Result<Vec<ProjectUser>> {
        self.ledger.store().filter(|pu: &ProjectUser| {
            pu.user_id == user_id && pu.status == ProjectUserStatus::Active
        })
    }

    pub fn project_members(&self, project_id: &str) -> Result<Vec<ProjectUser>> {
        self.ledger
            .store()
            .filter(|pu: &ProjectUser| pu.project_id == project_id)
    }

    /// Active PIs of a project.
    pub fn principal_investigators(&self, project_id: &str) -> Result<Vec<User>> {
        self.project_members(project_id)?
            .into_iter()
            .filter(|pu| {
                pu.role == ProjectUserRole::PrincipalInvestigator
                    && pu.status == ProjectUserStatus::Active
            })
            .map(|pu| self.user(&pu.user_id))
            .collect()
    }

    pub fn request_removal(
        &self,
        project_user_id: &str,
        requester_id: &str,
    ) -> Result<ProjectUserRemovalRequest> {
        let request = ProjectUserRemovalRequest {
            id: new_uuid_to_bech32("rm_")?,
            project_user_id: project_user_id.to_string(),
            requester_id: requester_id.to_string(),
            status: ProjectRemovalStatus::Pending,
            request_time: TimeStamp::new(),
            completion_time: None,
        };
        self.ledger.store().transaction(|tx| {
            let mut project_user = tx.fetch::<ProjectUser>(project_user_id)?;
            if project_user.role == ProjectUserRole::PrincipalInvestigator {
                return abort(LedgerError::PreconditionFailed(
                    "A Principal Investigator cannot be removed from a project.".into(),
                ));
            }
            project_user.status = ProjectUserStatus::PendingRemove;
            tx.put(&project_user)?;
            tx.put(&request)
        })?;
        Ok(request)
    }

    /// Finish a removal: the membership becomes `Removed`.
    pub fn complete_removal(&self, request_id: &str) -> Result<ProjectUserRemovalRequest> {
        let now = TimeStamp::new();
        let request = self.ledger.store().transaction(|tx| {
            let mut request = tx.fetch::<ProjectUserRemovalRequest>(request_id)?;
            if request.status == ProjectRemovalStatus::Complete {
                return abort(LedgerError::PreconditionFailed(format!(
                    "ProjectUserRemovalRequest {request_id} is already complete."
                )));
            }
            let mut project_user = tx.fetch::<ProjectUser>(&request.project_user_id)?;
            project_user.status = ProjectUserStatus::Removed;
            request.status = ProjectRemovalStatus::Complete;
            request.completion_time = Some(now);
            tx.put(&project_user)?;
            tx.put(&request)?;
            Ok(request)
        })?;

        self.ledger.emit(&Event::RemovalRequestCompleted {
            removal_request_id: request.id.clone(),
        });
        Ok(request)
    }
}

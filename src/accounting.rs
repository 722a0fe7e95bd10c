//! Accounting service: allocation creation, lookups, and the allowance and
//! usage write paths.
use crate::allowance::AllowanceUsage;
use crate::choices::{
    AllocationStatus, AllocationUserStatus, AttributeType, ClusterAccountStatus, ProjectStatus,
    ProjectUserStatus,
};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::models::{
    Allocation, AllocationAttribute, AllocationAttributeUsage, AllocationUser,
    AllocationUserAttribute, AllocationUserAttributeUsage, HistoryKind, LedgerHistory, Project,
    ProjectTransaction, ProjectUser, ProjectUserTransaction,
};
use crate::store::{abort, Record, Tx, TxResult};
use crate::types::{ServiceUnits, TimeStamp};
use crate::utils::new_uuid_to_bech32;
use rust_decimal::Decimal;

/// The accounting object graph of a project, optionally scoped to one user.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingObjects {
    pub allocation: Allocation,
    pub allocation_attribute: AllocationAttribute,
    pub allocation_attribute_usage: AllocationAttributeUsage,
    pub user: Option<UserAccountingObjects>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserAccountingObjects {
    pub allocation_user: AllocationUser,
    pub allocation_user_attribute: AllocationUserAttribute,
    pub allocation_user_attribute_usage: AllocationUserAttributeUsage,
}

impl AccountingObjects {
    pub fn allowance(&self) -> Result<ServiceUnits> {
        parse_units(&self.allocation_attribute.value)
    }
    pub fn usage(&self) -> ServiceUnits {
        self.allocation_attribute_usage.value
    }
    pub fn allowance_usage(&self) -> Result<AllowanceUsage> {
        Ok(AllowanceUsage::new(self.allowance()?, self.usage()))
    }
}

/// What an allowance or usage write applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTarget {
    Project { project_id: String },
    ProjectUser { project_id: String, user_id: String },
}

impl LedgerTarget {
    pub fn project(project_id: &str) -> Self {
        LedgerTarget::Project { project_id: project_id.to_string() }
    }
    pub fn project_user(project_id: &str, user_id: &str) -> Self {
        LedgerTarget::ProjectUser {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
    fn project_id(&self) -> &str {
        match self {
            LedgerTarget::Project { project_id } | LedgerTarget::ProjectUser { project_id, .. } => {
                project_id
            }
        }
    }
    fn user_id(&self) -> Option<&str> {
        match self {
            LedgerTarget::Project { .. } => None,
            LedgerTarget::ProjectUser { user_id, .. } => Some(user_id),
        }
    }
}

impl std::fmt::Display for LedgerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerTarget::Project { project_id } => write!(f, "project {project_id}"),
            LedgerTarget::ProjectUser { project_id, user_id } => {
                write!(f, "user {user_id} in project {project_id}")
            }
        }
    }
}

/// Arguments of [`AccountingService::set_service_units`]. `None` leaves a
/// value alone.
#[derive(Debug, Clone, Default)]
pub struct ServiceUnitsUpdate {
    pub allocation_allowance: Option<Decimal>,
    pub allocation_usage: Option<Decimal>,
    pub user_allowance: Option<Decimal>,
    pub user_usage: Option<Decimal>,
    pub transaction_date_time: Option<TimeStamp>,
    pub change_reason: Option<String>,
}

fn parse_units(value: &str) -> Result<ServiceUnits> {
    value.parse().map_err(|e| {
        LedgerError::InvalidArgument(format!("{value} is not a valid number of service units: {e}"))
    })
}

fn active_compute_key(project_id: &str) -> String {
    format!("index/active-compute/{project_id}")
}

pub(crate) fn allocation_user_key(allocation_id: &str, user_id: &str) -> String {
    format!("index/allocation-user/{allocation_id}/{user_id}")
}

fn history(
    target: &str,
    kind: HistoryKind,
    value: ServiceUnits,
    date_time: TimeStamp,
    change_reason: Option<&str>,
) -> Result<LedgerHistory> {
    Ok(LedgerHistory {
        id: new_uuid_to_bech32("hist_")?,
        target: target.to_string(),
        kind,
        value,
        date_time,
        change_reason: change_reason.map(str::to_string),
    })
}

pub struct AccountingService<'a> {
    ledger: &'a Ledger,
}

impl<'a> AccountingService<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    fn check_bounds(&self, value: Decimal) -> Result<ServiceUnits> {
        let config = self.ledger.config();
        if !config.is_in_allocation_bounds(value) {
            return Err(LedgerError::InvalidArgument(format!(
                "Value {value} is not in the range [{}, {}].",
                config.allocation_min, config.allocation_max
            )));
        }
        Ok(ServiceUnits::new(value))
    }

    /// Usage may exceed the allowance but never go below zero.
    fn check_usage(value: Decimal) -> Result<ServiceUnits> {
        if value.is_sign_negative() {
            return Err(LedgerError::InvalidArgument(format!(
                "Usage {value} must not be negative."
            )));
        }
        Ok(ServiceUnits::new(value))
    }

    /// Create the project's Active compute allocation with `amount` service
    /// units. A second Active compute allocation for the same project is
    /// rejected.
    pub fn create_project_allocation(
        &self,
        project_id: &str,
        amount: Decimal,
    ) -> Result<AccountingObjects> {
        let amount = self.check_bounds(amount)?;
        let project: Project = self.ledger.store().fetch(project_id)?;
        let resource = self.ledger.config().compute_resource_for(&project.name).to_string();
        let now = TimeStamp::new();

        let allocation = Allocation {
            id: new_uuid_to_bech32("alloc_")?,
            project_id: project.id.clone(),
            status: AllocationStatus::Active,
            resources: vec![resource.clone()],
            start_date: Some(now),
            end_date: None,
        };
        let attribute = AllocationAttribute {
            id: new_uuid_to_bech32("aa_")?,
            allocation_id: allocation.id.clone(),
            attribute_type: AttributeType::ServiceUnits,
            value: amount.to_string(),
        };
        let usage = AllocationAttributeUsage {
            id: attribute.id.clone(),
            value: ServiceUnits::ZERO,
        };
        let transaction = ProjectTransaction {
            id: new_uuid_to_bech32("ptx_")?,
            project_id: project.id.clone(),
            date_time: now,
            allocation: amount,
        };
        let entry = history(&attribute.id, HistoryKind::Allowance, amount, now, None)?;
        let key = active_compute_key(&project.id);

        self.ledger.store().transaction(|tx| {
            if tx.index_get(&key)?.is_some() {
                return abort(LedgerError::PreconditionFailed(format!(
                    "Project {} already has an active allocation to {resource}.",
                    project.name
                )));
            }
            tx.index_set(&key, &allocation.id)?;
            tx.put(&allocation)?;
            tx.put(&attribute)?;
            tx.put(&usage)?;
            tx.put(&transaction)?;
            tx.put(&entry)
        })?;

        tracing::info!(project = %project.name, %amount, "created compute allocation");
        Ok(AccountingObjects {
            allocation,
            allocation_attribute: attribute,
            allocation_attribute_usage: usage,
            user: None,
        })
    }

    /// Give a project member `amount` service units on the project's compute
    /// allocation. Reuses the member's AllocationUser if one exists.
    pub fn create_user_allocation(
        &self,
        user_id: &str,
        project_id: &str,
        amount: Decimal,
    ) -> Result<AccountingObjects> {
        let amount = self.check_bounds(amount)?;
        let allocation = self.compute_allocation(project_id, true)?;
        let project_user: ProjectUser = self
            .ledger
            .store()
            .get_one(|pu: &ProjectUser| pu.project_id == project_id && pu.user_id == user_id)?;
        let now = TimeStamp::new();

        let fresh_allocation_user = AllocationUser {
            id: new_uuid_to_bech32("au_")?,
            allocation_id: allocation.id.clone(),
            user_id: user_id.to_string(),
            status: AllocationUserStatus::Active,
        };
        let fresh_attribute_id = new_uuid_to_bech32("aua_")?;
        let transaction = ProjectUserTransaction {
            id: new_uuid_to_bech32("putx_")?,
            project_user_id: project_user.id.clone(),
            date_time: now,
            allocation: amount,
        };
        let history_id = new_uuid_to_bech32("hist_")?;
        let au_key = allocation_user_key(&allocation.id, user_id);

        let user = self.ledger.store().transaction(|tx| {
            let allocation_user = match tx.index_get(&au_key)? {
                Some(id) => tx.fetch::<AllocationUser>(&id)?,
                None => {
                    tx.index_set(&au_key, &fresh_allocation_user.id)?;
                    tx.put(&fresh_allocation_user)?;
                    fresh_allocation_user.clone()
                }
            };

            let attribute_key =
                format!("index/service-units/{}", allocation_user.id);
            let (attribute, usage) = match tx.index_get(&attribute_key)? {
                Some(id) => {
                    let mut attribute = tx.fetch::<AllocationUserAttribute>(&id)?;
                    attribute.value = amount.to_string();
                    let usage = tx.fetch::<AllocationUserAttributeUsage>(&id)?;
                    (attribute, usage)
                }
                None => {
                    let attribute = AllocationUserAttribute {
                        id: fresh_attribute_id.clone(),
                        allocation_user_id: allocation_user.id.clone(),
                        allocation_id: allocation.id.clone(),
                        attribute_type: AttributeType::ServiceUnits,
                        value: amount.to_string(),
                    };
                    let usage = AllocationUserAttributeUsage {
                        id: attribute.id.clone(),
                        value: ServiceUnits::ZERO,
                    };
                    tx.index_set(&attribute_key, &attribute.id)?;
                    tx.put(&usage)?;
                    (attribute, usage)
                }
            };
            tx.put(&attribute)?;
            tx.put(&transaction)?;
            tx.put(&LedgerHistory {
                id: history_id.clone(),
                target: attribute.id.clone(),
                kind: HistoryKind::Allowance,
                value: amount,
                date_time: now,
                change_reason: None,
            })?;

            Ok(UserAccountingObjects {
                allocation_user,
                allocation_user_attribute: attribute,
                allocation_user_attribute_usage: usage,
            })
        })?;

        let mut objects = self.project_objects(allocation)?;
        objects.user = Some(user);
        Ok(objects)
    }

    /// The project's compute allocation. With `enforce_active`, only an
    /// Active one counts.
    pub fn compute_allocation(&self, project_id: &str, enforce_active: bool) -> Result<Allocation> {
        let project: Project = self.ledger.store().fetch(project_id)?;
        let resource = self.ledger.config().compute_resource_for(&project.name);
        self.ledger.store().get_one(|a: &Allocation| {
            a.project_id == project_id
                && a.has_resource(resource)
                && (!enforce_active || a.status == AllocationStatus::Active)
        })
    }

    fn project_objects(&self, allocation: Allocation) -> Result<AccountingObjects> {
        let store = self.ledger.store();
        let allocation_attribute = store.get_one(|aa: &AllocationAttribute| {
            aa.allocation_id == allocation.id && aa.attribute_type == AttributeType::ServiceUnits
        })?;
        let allocation_attribute_usage = store.fetch(&allocation_attribute.id)?;
        Ok(AccountingObjects {
            allocation,
            allocation_attribute,
            allocation_attribute_usage,
            user: None,
        })
    }

    /// Look up the accounting graph of a project, and of one of its users
    /// when `user_id` is given. With `enforce_active` every link must be
    /// Active: the project, its membership, the allocation and the
    /// allocation user.
    pub fn get_accounting_objects(
        &self,
        project_id: &str,
        user_id: Option<&str>,
        enforce_active: bool,
    ) -> Result<AccountingObjects> {
        let store = self.ledger.store();
        let project: Project = store.fetch(project_id)?;
        if enforce_active && project.status != ProjectStatus::Active {
            return Err(LedgerError::does_not_exist("Project"));
        }
        let allocation = self.compute_allocation(project_id, enforce_active)?;
        let mut objects = self.project_objects(allocation)?;

        if let Some(user_id) = user_id {
            store.get_one(|pu: &ProjectUser| {
                pu.project_id == project_id
                    && pu.user_id == user_id
                    && (!enforce_active || pu.status == ProjectUserStatus::Active)
            })?;
            let allocation_user = store.get_one(|au: &AllocationUser| {
                au.allocation_id == objects.allocation.id
                    && au.user_id == user_id
                    && (!enforce_active || au.status == AllocationUserStatus::Active)
            })?;
            let allocation_user_attribute = store.get_one(|aua: &AllocationUserAttribute| {
                aua.allocation_user_id == allocation_user.id
                    && aua.attribute_type == AttributeType::ServiceUnits
            })?;
            let allocation_user_attribute_usage = store.fetch(&allocation_user_attribute.id)?;
            objects.user = Some(UserAccountingObjects {
                allocation_user,
                allocation_user_attribute,
                allocation_user_attribute_usage,
            });
        }
        Ok(objects)
    }

    /// Set the allowance of `target` and record it.
    ///
    /// Out-of-range values are an `InvalidArgument` error. A failed lookup
    /// is logged and reported as `Ok(false)` so that bulk callers can carry
    /// on with their next record.
    pub fn set_allowance(
        &self,
        target: &LedgerTarget,
        value: Decimal,
        change_reason: Option<&str>,
    ) -> Result<bool> {
        let value = self.check_bounds(value)?;
        let objects = match self.get_accounting_objects(target.project_id(), target.user_id(), true)
        {
            Ok(objects) => objects,
            Err(e) => {
                tracing::error!(%target, error = %e, "failed to look up accounting objects; allowance not set");
                return Ok(false);
            }
        };
        self.write_allowance(&objects, value, TimeStamp::new(), change_reason)?;
        Ok(true)
    }

    fn write_allowance(
        &self,
        objects: &AccountingObjects,
        value: ServiceUnits,
        date_time: TimeStamp,
        change_reason: Option<&str>,
    ) -> Result<()> {
        let plan = self.allowance_plan(objects, value, date_time, change_reason)?;
        self.ledger.store().transaction(|tx| plan.apply(tx))
    }

    fn allowance_plan(
        &self,
        objects: &AccountingObjects,
        value: ServiceUnits,
        date_time: TimeStamp,
        change_reason: Option<&str>,
    ) -> Result<AllowanceWrite> {
        match &objects.user {
            None => Ok(AllowanceWrite::Project {
                attribute_id: objects.allocation_attribute.id.clone(),
                transaction: ProjectTransaction {
                    id: new_uuid_to_bech32("ptx_")?,
                    project_id: objects.allocation.project_id.clone(),
                    date_time,
                    allocation: value,
                },
                history: history(
                    &objects.allocation_attribute.id,
                    HistoryKind::Allowance,
                    value,
                    date_time,
                    change_reason,
                )?,
            }),
            Some(user) => {
                let project_user = self.ledger.store().get_one(|pu: &ProjectUser| {
                    pu.project_id == objects.allocation.project_id
                        && pu.user_id == user.allocation_user.user_id
                });
                let transaction = match project_user {
                    Ok(project_user) => Some(ProjectUserTransaction {
                        id: new_uuid_to_bech32("putx_")?,
                        project_user_id: project_user.id,
                        date_time,
                        allocation: value,
                    }),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                Ok(AllowanceWrite::ProjectUser {
                    attribute_id: user.allocation_user_attribute.id.clone(),
                    transaction,
                    history: history(
                        &user.allocation_user_attribute.id,
                        HistoryKind::Allowance,
                        value,
                        date_time,
                        change_reason,
                    )?,
                })
            }
        }
    }

    /// Set the usage of `target`, holding the usage row lock for the whole
    /// read-modify-write. Lookup failures behave as in `set_allowance`.
    pub fn set_usage(
        &self,
        target: &LedgerTarget,
        value: Decimal,
        change_reason: Option<&str>,
    ) -> Result<bool> {
        let value = Self::check_usage(value)?;
        let objects = match self.get_accounting_objects(target.project_id(), target.user_id(), true)
        {
            Ok(objects) => objects,
            Err(e) => {
                tracing::error!(%target, error = %e, "failed to look up accounting objects; usage not set");
                return Ok(false);
            }
        };
        let usage = UsageRow::of(&objects);
        usage.write(self.ledger, change_reason, |_| Ok(value))?;
        Ok(true)
    }

    /// Add `delta` to the current usage of `target` and return the new
    /// usage.
    pub fn increment_usage(
        &self,
        target: &LedgerTarget,
        delta: Decimal,
        change_reason: Option<&str>,
    ) -> Result<ServiceUnits> {
        let objects = self.get_accounting_objects(target.project_id(), target.user_id(), true)?;
        let delta = ServiceUnits::new(delta);
        UsageRow::of(&objects).write(self.ledger, change_reason, |current| {
            current
                .checked_add(delta)
                .ok_or_else(|| LedgerError::InvalidArgument("usage overflow".into()))
        })
    }

    /// Set any combination of the allocation's allowance and usage and every
    /// allocation user's allowance and usage, all in one transaction.
    pub fn set_service_units(
        &self,
        objects: &AccountingObjects,
        update: &ServiceUnitsUpdate,
    ) -> Result<()> {
        let bounded = |value: Option<Decimal>| value.map(|v| self.check_bounds(v)).transpose();
        let allocation_allowance = bounded(update.allocation_allowance)?;
        let usage = |value: Option<Decimal>| value.map(Self::check_usage).transpose();
        let allocation_usage = usage(update.allocation_usage)?;
        let user_allowance = bounded(update.user_allowance)?;
        let user_usage = usage(update.user_usage)?;
        let date_time = update.transaction_date_time.unwrap_or_default();
        let reason = update.change_reason.as_deref();

        let mut plans = vec![];
        let mut usage_rows = vec![];

        if let Some(value) = allocation_allowance {
            plans.push(self.allowance_plan(objects, value, date_time, reason)?);
        }
        if let Some(value) = allocation_usage {
            usage_rows.push((UsageRow::Allocation(objects.allocation_attribute_usage.id.clone()), value));
        }

        if user_allowance.is_some() || user_usage.is_some() {
            let store = self.ledger.store();
            let attributes = store.filter(|aua: &AllocationUserAttribute| {
                aua.allocation_id == objects.allocation.id
                    && aua.attribute_type == AttributeType::ServiceUnits
            })?;
            for attribute in attributes {
                let allocation_user: AllocationUser = store.fetch(&attribute.allocation_user_id)?;
                let usage: AllocationUserAttributeUsage = store.fetch(&attribute.id)?;
                if let Some(value) = user_allowance {
                    let user_objects = AccountingObjects {
                        user: Some(UserAccountingObjects {
                            allocation_user,
                            allocation_user_attribute: attribute.clone(),
                            allocation_user_attribute_usage: usage,
                        }),
                        ..objects.clone()
                    };
                    plans.push(self.allowance_plan(&user_objects, value, date_time, reason)?);
                }
                if let Some(value) = user_usage {
                    usage_rows.push((UsageRow::AllocationUser(attribute.id.clone()), value));
                }
            }
        }

        let mut usage_entries = vec![];
        for (row, value) in &usage_rows {
            usage_entries.push(history(row.id(), HistoryKind::Usage, *value, date_time, reason)?);
        }

        self.ledger.store().transaction(|tx| {
            for plan in &plans {
                plan.apply(tx)?;
            }
            for ((row, value), entry) in usage_rows.iter().zip(&usage_entries) {
                row.put(tx, *value)?;
                tx.put(entry)?;
            }
            Ok(())
        })
    }

    /// Change an allocation's status, keeping the one-active-compute-
    /// allocation index in step.
    pub fn set_allocation_status(
        &self,
        allocation_id: &str,
        status: AllocationStatus,
    ) -> Result<Allocation> {
        let allocation: Allocation = self.ledger.store().fetch(allocation_id)?;
        let project: Project = self.ledger.store().fetch(&allocation.project_id)?;
        let resource = self.ledger.config().compute_resource_for(&project.name).to_string();
        let key = active_compute_key(&project.id);

        self.ledger.store().transaction(|tx| {
            let mut allocation = tx.fetch::<Allocation>(allocation_id)?;
            if allocation.has_resource(&resource) {
                let indexed = tx.index_get(&key)?;
                match status {
                    AllocationStatus::Active => match indexed {
                        Some(id) if id != allocation.id => {
                            return abort(LedgerError::PreconditionFailed(format!(
                                "Project {} already has an active allocation to {resource}.",
                                project.name
                            )));
                        }
                        _ => tx.index_set(&key, &allocation.id)?,
                    },
                    _ if indexed.as_deref() == Some(allocation.id.as_str()) => {
                        tx.index_remove(&key)?
                    }
                    _ => {}
                }
            }
            allocation.status = status;
            tx.put(&allocation)?;
            Ok(allocation)
        })
    }

    /// The project's usage as shown in listings.
    pub fn usage_display(&self, project_id: &str) -> String {
        let objects = match self.get_accounting_objects(project_id, None, true) {
            Ok(objects) => objects,
            Err(_) => return "N/A".to_string(),
        };
        match objects.allowance_usage().and_then(|au| au.format_display()) {
            Ok(display) => display,
            Err(e) => {
                tracing::warn!(project_id, error = %e, "failed to compute usage display");
                "Failed to compute".to_string()
            }
        }
    }

    /// Create or update the "Cluster Account Status" attribute of an
    /// allocation user.
    pub fn set_cluster_account_status(
        &self,
        allocation_user_id: &str,
        status: ClusterAccountStatus,
    ) -> Result<AllocationUserAttribute> {
        let allocation_user: AllocationUser = self.ledger.store().fetch(allocation_user_id)?;
        let fresh_id = new_uuid_to_bech32("aua_")?;
        self.ledger.store().transaction(|tx| {
            set_cluster_account_status_in(tx, &allocation_user, status, &fresh_id)
        })
    }

    pub fn cluster_account_status(
        &self,
        allocation_user_id: &str,
    ) -> Result<Option<ClusterAccountStatus>> {
        let key = cluster_status_key(allocation_user_id);
        match self.ledger.store().index_value(&key)? {
            Some(id) => {
                let attribute: AllocationUserAttribute = self.ledger.store().fetch(&id)?;
                Ok(Some(ClusterAccountStatus::from_name(&attribute.value)?))
            }
            None => Ok(None),
        }
    }

    /// True if any of the user's cluster account statuses is Active.
    pub fn has_cluster_access(&self, user_id: &str) -> Result<bool> {
        let allocation_users = self
            .ledger
            .store()
            .filter(|au: &AllocationUser| au.user_id == user_id)?;
        for au in allocation_users {
            if self.cluster_account_status(&au.id)? == Some(ClusterAccountStatus::Active) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub(crate) fn cluster_status_key(allocation_user_id: &str) -> String {
    format!("index/cluster-account-status/{allocation_user_id}")
}

/// Write a cluster account status inside an open transaction. `fresh_id` is
/// used only if the attribute does not exist yet.
pub(crate) fn set_cluster_account_status_in(
    tx: &Tx<'_>,
    allocation_user: &AllocationUser,
    status: ClusterAccountStatus,
    fresh_id: &str,
) -> TxResult<AllocationUserAttribute> {
    let key = cluster_status_key(&allocation_user.id);
    let attribute = match tx.index_get(&key)? {
        Some(id) => {
            let mut attribute = tx.fetch::<AllocationUserAttribute>(&id)?;
            attribute.value = status.name().to_string();
            attribute
        }
        None => {
            tx.index_set(&key, fresh_id)?;
            AllocationUserAttribute {
                id: fresh_id.to_string(),
                allocation_user_id: allocation_user.id.clone(),
                allocation_id: allocation_user.allocation_id.clone(),
                attribute_type: AttributeType::ClusterAccountStatus,
                value: status.name().to_string(),
            }
        }
    };
    tx.put(&attribute)?;
    Ok(attribute)
}

enum AllowanceWrite {
    Project {
        attribute_id: String,
        transaction: ProjectTransaction,
        history: LedgerHistory,
    },
    ProjectUser {
        attribute_id: String,
        transaction: Option<ProjectUserTransaction>,
        history: LedgerHistory,
    },
}

impl AllowanceWrite {
    fn apply(&self, tx: &Tx<'_>) -> TxResult<()> {
        match self {
            AllowanceWrite::Project { attribute_id, transaction, history } => {
                let mut attribute = tx.fetch::<AllocationAttribute>(attribute_id)?;
                attribute.value = transaction.allocation.to_string();
                tx.put(&attribute)?;
                tx.put(transaction)?;
                tx.put(history)
            }
            AllowanceWrite::ProjectUser { attribute_id, transaction, history } => {
                let mut attribute = tx.fetch::<AllocationUserAttribute>(attribute_id)?;
                attribute.value = history.value.to_string();
                tx.put(&attribute)?;
                if let Some(transaction) = transaction {
                    tx.put(transaction)?;
                }
                tx.put(history)
            }
        }
    }
}

enum UsageRow {
    Allocation(String),
    AllocationUser(String),
}

impl UsageRow {
    fn of(objects: &AccountingObjects) -> Self {
        match &objects.user {
            None => UsageRow::Allocation(objects.allocation_attribute_usage.id.clone()),
            Some(user) => UsageRow::AllocationUser(user.allocation_user_attribute_usage.id.clone()),
        }
    }

    fn id(&self) -> &str {
        match self {
            UsageRow::Allocation(id) | UsageRow::AllocationUser(id) => id,
        }
    }

    fn lock_key(&self) -> String {
        match self {
            UsageRow::Allocation(id) => AllocationAttributeUsage::key_for(id),
            UsageRow::AllocationUser(id) => AllocationUserAttributeUsage::key_for(id),
        }
    }

    fn get(&self, tx: &Tx<'_>) -> TxResult<ServiceUnits> {
        Ok(match self {
            UsageRow::Allocation(id) => tx.fetch::<AllocationAttributeUsage>(id)?.value,
            UsageRow::AllocationUser(id) => tx.fetch::<AllocationUserAttributeUsage>(id)?.value,
        })
    }

    fn put(&self, tx: &Tx<'_>, value: ServiceUnits) -> TxResult<()> {
        match self {
            UsageRow::Allocation(id) => tx.put(&AllocationAttributeUsage { id: id.clone(), value }),
            UsageRow::AllocationUser(id) => {
                tx.put(&AllocationUserAttributeUsage { id: id.clone(), value })
            }
        }
    }

    /// Locked read-modify-write of this usage row plus its history entry.
    fn write(
        &self,
        ledger: &Ledger,
        change_reason: Option<&str>,
        next: impl Fn(ServiceUnits) -> Result<ServiceUnits>,
    ) -> Result<ServiceUnits> {
        let history_id = new_uuid_to_bech32("hist_")?;
        ledger.row_locks().with_lock(&self.lock_key(), || {
            let now = TimeStamp::new();
            ledger.store().transaction(|tx| {
                let value = next(self.get(tx)?).or_else(abort)?;
                self.put(tx, value)?;
                tx.put(&LedgerHistory {
                    id: history_id.clone(),
                    target: self.id().to_string(),
                    kind: HistoryKind::Usage,
                    value,
                    date_time: now,
                    change_reason: change_reason.map(str::to_string),
                })?;
                Ok(value)
            })
        })
    }
}

//! End-to-end scenarios across the ledger and the request workflows.

use allocation_ledger::{
    account_deletion::CreateDeletionRequest,
    accounting::{LedgerTarget, ServiceUnitsUpdate},
    choices::{
        ClusterAccountStatus, DeletionReason, DeletionStatus, ProjectStatus, ProjectUserRole,
        ProjectUserStatus, SecureDirRequestStatus, StepStatus,
    },
    config::LedgerConfig,
    models::{HistoryKind, LedgerHistory, Project, ProjectTransaction, ProjectUserTransaction, User},
    notification::{EmailStrategy, EnqueuedStrategy, MemoryOutbox},
    requests::{DeletionKind, DeletionRequest, SecureDirRequest},
    runner::Runner,
    secure_dir::{CreateSecureDirRequest, UpdateSecureDirStep},
    state::SecureDirStep,
    triggers::TriggerBus,
    types::TimeStamp,
    Ledger, LedgerError,
};
use rust_decimal::Decimal;
use sled::open;
use std::str::FromStr;
use std::sync::Arc;
use tempfile::tempdir;

struct Harness {
    _dir: tempfile::TempDir,
    ledger: Ledger,
    outbox: Arc<MemoryOutbox>,
}

// Sled locks its database file, so every test gets its own directory.
fn harness(triggers: TriggerBus) -> anyhow::Result<Harness> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempdir()?;
    let db = Arc::new(open(dir.path().join("ledger.db"))?);
    let outbox = Arc::new(MemoryOutbox::new());
    let ledger = Ledger::new(db, LedgerConfig::default(), outbox.clone())?.with_triggers(triggers);
    Ok(Harness { _dir: dir, ledger, outbox })
}

fn su(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// An active project with a compute allocation and one member who has an
/// active cluster account.
fn project_with_member(ledger: &Ledger, name: &str, username: &str) -> anyhow::Result<(Project, User)> {
    let directory = ledger.directory();
    let user = directory.create_user(username, &format!("{username}@example.org"), username, "Test")?;
    let project = directory.create_project(name, ProjectStatus::Active)?;
    directory.add_project_user(&project.id, &user.id, ProjectUserRole::User, ProjectUserStatus::Active)?;

    let accounting = ledger.accounting();
    accounting.create_project_allocation(&project.id, su("1000"))?;
    let objects = accounting.create_user_allocation(&user.id, &project.id, su("100"))?;
    let allocation_user = objects.user.expect("user objects").allocation_user;
    accounting.set_cluster_account_status(&allocation_user.id, ClusterAccountStatus::Active)?;
    Ok((project, user))
}

/// Remove the only member of a fresh project, which queues a LastProject
/// account deletion for them.
fn queued_last_project_deletion(
    ledger: &Ledger,
    name: &str,
    username: &str,
) -> anyhow::Result<(Project, User, DeletionRequest)> {
    let (project, user) = project_with_member(ledger, name, username)?;
    let directory = ledger.directory();
    let manager = directory.create_user(&format!("{username}_mgr"), "mgr@example.org", "Mgr", "M")?;

    let membership = directory.project_user(&project.id, &user.id)?;
    let removal = directory.request_removal(&membership.id, &manager.id)?;
    directory.complete_removal(&removal.id)?;

    let queued = ledger.store().get_one(|r: &DeletionRequest| r.user_id == user.id)?;
    assert_eq!(queued.status(), DeletionStatus::Queued);
    assert_eq!(queued.reason, DeletionReason::LastProject);
    assert!(!ledger.accounting().has_cluster_access(&user.id)?);
    Ok((project, user, queued))
}

#[test]
fn duplicate_active_deletion_is_blocked() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (_, user) = project_with_member(&h.ledger, "fc_alpha", "ada")?;

    let create = || {
        CreateDeletionRequest::new(&h.ledger, DeletionKind::ClusterAccount, &user.id, &user.id, DeletionReason::User)
    };
    let first = Runner::new(&h.ledger, create()?).run()?;
    assert!(first.is_some());

    let mut second = Runner::new(&h.ledger, create()?);
    assert!(second.run()?.is_none());
    let errors = second.get_messages().1;
    assert!(errors.iter().any(|e| e.contains(
        "An active cluster account deletion request for user ada already exists."
    )));

    let active = h
        .ledger
        .store()
        .filter(|r: &DeletionRequest| r.user_id == user.id && r.status().is_active())?;
    assert_eq!(active.len(), 1);
    Ok(())
}

#[test]
fn denied_step_sends_one_denial_email() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let directory = h.ledger.directory();
    let pi = directory.create_user("pat", "pat@example.org", "Pat", "PI")?;
    let requester = directory.create_user("ray", "ray@example.org", "Ray", "R")?;
    let project = directory.create_project("fc_beta", ProjectStatus::Active)?;
    directory.add_project_user(&project.id, &pi.id, ProjectUserRole::PrincipalInvestigator, ProjectUserStatus::Active)?;
    directory.add_project_user(&project.id, &requester.id, ProjectUserRole::Manager, ProjectUserStatus::Active)?;

    let transition = CreateSecureDirRequest::new(&h.ledger, &requester.id, &pi.id, &project.id, "beta", "scans")?;
    let request = Runner::new(&h.ledger, transition).run()?.expect("created");

    let outcome = Runner::new(
        &h.ledger,
        UpdateSecureDirStep::new(&request.id, SecureDirStep::RdmConsultation, StepStatus::Denied, "No data plan."),
    )
    .run()?
    .expect("updated");
    assert_eq!(outcome.request.status(), SecureDirRequestStatus::Denied);

    // a denied request takes no further steps
    let mut again = Runner::new(
        &h.ledger,
        UpdateSecureDirStep::new(&request.id, SecureDirStep::Notified, StepStatus::Complete, ""),
    );
    assert!(again.run()?.is_none());

    let denials = h.outbox.sent_with_template("secure_dir_request/denied");
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].recipients, vec!["ray@example.org".to_string()]);
    assert_eq!(denials[0].cc, vec!["pat@example.org".to_string()]);
    assert_eq!(denials[0].context.get("reason").map(String::as_str), Some("No data plan."));
    Ok(())
}

#[test]
fn joining_a_project_cancels_last_project_deletion() -> anyhow::Result<()> {
    let h = harness(TriggerBus::with_default_handlers())?;
    let (_, user, queued) = queued_last_project_deletion(&h.ledger, "fc_gamma", "gus")?;
    let directory = h.ledger.directory();

    let other = directory.create_project("fc_delta", ProjectStatus::Active)?;
    directory.add_project_user(&other.id, &user.id, ProjectUserRole::User, ProjectUserStatus::Active)?;

    let cancelled: DeletionRequest = h.ledger.store().fetch(&queued.id)?;
    assert_eq!(cancelled.status(), DeletionStatus::Cancelled);
    assert_eq!(cancelled.state().other.justification, "User joined project fc_delta.");
    assert!(h.ledger.accounting().has_cluster_access(&user.id)?);
    Ok(())
}

#[test]
fn rejoining_the_same_project_cancels_last_project_deletion() -> anyhow::Result<()> {
    let h = harness(TriggerBus::with_default_handlers())?;
    let (project, user, queued) = queued_last_project_deletion(&h.ledger, "fc_gamma2", "gil")?;
    let directory = h.ledger.directory();
    let before = directory.project_user(&project.id, &user.id)?;

    let readded =
        directory.add_project_user(&project.id, &user.id, ProjectUserRole::User, ProjectUserStatus::Active)?;
    assert_eq!(readded.id, before.id);
    assert_eq!(readded.status, ProjectUserStatus::Active);

    let cancelled: DeletionRequest = h.ledger.store().fetch(&queued.id)?;
    assert_eq!(cancelled.status(), DeletionStatus::Cancelled);
    assert_eq!(cancelled.state().other.justification, "User joined project fc_gamma2.");
    assert!(h.ledger.accounting().has_cluster_access(&user.id)?);
    Ok(())
}

#[test]
fn join_request_cancels_last_project_deletion() -> anyhow::Result<()> {
    let h = harness(TriggerBus::with_default_handlers())?;
    let (project, user, queued) = queued_last_project_deletion(&h.ledger, "fc_gamma3", "gwen")?;

    let pending = h.ledger.directory().request_to_join(&project.id, &user.id)?;
    assert_eq!(pending.status, ProjectUserStatus::PendingAdd);

    let cancelled: DeletionRequest = h.ledger.store().fetch(&queued.id)?;
    assert_eq!(cancelled.status(), DeletionStatus::Cancelled);
    assert_eq!(
        cancelled.state().other.justification,
        "User requested to join project fc_gamma3."
    );
    Ok(())
}

#[test]
fn new_project_request_cancels_last_project_deletion() -> anyhow::Result<()> {
    let h = harness(TriggerBus::with_default_handlers())?;
    let (_, user, queued) = queued_last_project_deletion(&h.ledger, "fc_gamma4", "gabe")?;

    let project = h.ledger.directory().request_new_project(&user.id, "fc_fresh")?;
    assert_eq!(project.status, ProjectStatus::New);

    let cancelled: DeletionRequest = h.ledger.store().fetch(&queued.id)?;
    assert_eq!(cancelled.status(), DeletionStatus::Cancelled);
    assert_eq!(
        cancelled.state().other.justification,
        "User requested to create project fc_fresh."
    );
    Ok(())
}

#[test]
fn bulk_service_units_update_writes_every_row() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (project, user) = project_with_member(&h.ledger, "fc_mu", "max")?;
    let accounting = h.ledger.accounting();
    let transactions_before = h.ledger.store().all::<ProjectTransaction>()?.len();
    let user_transactions_before = h.ledger.store().all::<ProjectUserTransaction>()?.len();

    let when = TimeStamp::new_with(2024, 6, 1, 0, 0, 0).expect("valid date");
    let update = ServiceUnitsUpdate {
        allocation_allowance: Some(su("2000")),
        allocation_usage: Some(su("150.25")),
        user_allowance: Some(su("300")),
        user_usage: Some(su("25")),
        transaction_date_time: Some(when),
        change_reason: Some("allowance renewal".into()),
    };
    let objects = accounting.get_accounting_objects(&project.id, None, true)?;
    accounting.set_service_units(&objects, &update)?;

    let objects = accounting.get_accounting_objects(&project.id, Some(&user.id), true)?;
    assert_eq!(objects.allowance()?.value(), su("2000"));
    assert_eq!(objects.usage().value(), su("150.25"));
    let member = objects.user.expect("user objects");
    assert_eq!(Decimal::from_str(&member.allocation_user_attribute.value)?, su("300"));
    assert_eq!(member.allocation_user_attribute_usage.value.value(), su("25"));

    let transactions = h.ledger.store().all::<ProjectTransaction>()?;
    assert_eq!(transactions.len(), transactions_before + 1);
    assert!(transactions.iter().any(|t| t.date_time == when && t.allocation.value() == su("2000")));
    let user_transactions = h.ledger.store().all::<ProjectUserTransaction>()?;
    assert_eq!(user_transactions.len(), user_transactions_before + 1);
    assert!(user_transactions.iter().any(|t| t.date_time == when && t.allocation.value() == su("300")));

    let history = h
        .ledger
        .store()
        .filter(|e: &LedgerHistory| e.change_reason.as_deref() == Some("allowance renewal"))?;
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|e| e.date_time == when));
    let usages = history.iter().filter(|e| e.kind == HistoryKind::Usage).count();
    assert_eq!(usages, 2);
    Ok(())
}

#[test]
fn allowance_and_usage_round_trip() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (project, user) = project_with_member(&h.ledger, "fc_epsilon", "eli")?;
    let accounting = h.ledger.accounting();

    let target = LedgerTarget::project(&project.id);
    assert!(accounting.set_allowance(&target, su("300000.00"), Some("renewal"))?);
    assert!(accounting.set_usage(&target, su("75000.00"), None)?);

    let objects = accounting.get_accounting_objects(&project.id, None, true)?;
    assert_eq!(objects.allowance()?.value(), su("300000.00"));
    assert_eq!(objects.usage().value(), su("75000.00"));
    assert_eq!(accounting.usage_display(&project.id), "75000.00/300000.00 (25.00 %)");

    let user_target = LedgerTarget::project_user(&project.id, &user.id);
    assert!(accounting.set_allowance(&user_target, su("500"), None)?);
    let objects = accounting.get_accounting_objects(&project.id, Some(&user.id), true)?;
    assert_eq!(objects.user.expect("user").allocation_user_attribute.value, "500");

    // unknown project: logged, not raised
    assert!(!accounting.set_allowance(&LedgerTarget::project("proj_missing"), su("1"), None)?);
    Ok(())
}

#[test]
fn second_compute_allocation_is_rejected() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (project, user) = project_with_member(&h.ledger, "fc_zeta", "zoe")?;
    let accounting = h.ledger.accounting();

    let err = accounting.create_project_allocation(&project.id, su("10")).unwrap_err();
    assert!(matches!(err, LedgerError::PreconditionFailed(_)));
    assert_eq!(accounting.compute_allocation(&project.id, true)?.project_id, project.id);

    // creating the user allocation again reuses the existing rows
    let first = accounting.get_accounting_objects(&project.id, Some(&user.id), true)?;
    let again = accounting.create_user_allocation(&user.id, &project.id, su("20"))?;
    assert_eq!(
        first.user.expect("user").allocation_user.id,
        again.user.expect("user").allocation_user.id
    );
    Ok(())
}

#[test]
fn allowance_writes_leave_an_audit_trail() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (project, _) = project_with_member(&h.ledger, "fc_eta", "eve")?;
    let accounting = h.ledger.accounting();

    let before = TimeStamp::new();
    accounting.set_allowance(&LedgerTarget::project(&project.id), su("4321.5"), Some("top-up"))?;
    let after = TimeStamp::new();

    let transactions = h.ledger.store().filter(|t: &ProjectTransaction| {
        t.project_id == project.id && t.allocation.value() == su("4321.50")
    })?;
    assert_eq!(transactions.len(), 1);
    assert!(before <= transactions[0].date_time && transactions[0].date_time <= after);

    let history = h
        .ledger
        .store()
        .filter(|e: &LedgerHistory| e.change_reason.as_deref() == Some("top-up"))?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].value.value(), su("4321.50"));
    Ok(())
}

#[test]
fn out_of_bounds_allowance_writes_nothing() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (project, _) = project_with_member(&h.ledger, "fc_theta", "tom")?;
    let accounting = h.ledger.accounting();
    let count = || h.ledger.store().all::<ProjectTransaction>().map(|t| t.len());
    let before = count()?;

    let too_big = h.ledger.config().allocation_max + su("0.01");
    let err = accounting
        .set_allowance(&LedgerTarget::project(&project.id), too_big, None)
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidArgument(_)));

    let update = ServiceUnitsUpdate {
        allocation_allowance: Some(su("10")),
        allocation_usage: Some(su("-1")),
        ..Default::default()
    };
    let objects = accounting.get_accounting_objects(&project.id, None, true)?;
    assert!(accounting.set_service_units(&objects, &update).is_err());

    assert_eq!(count()?, before);
    assert_eq!(accounting.get_accounting_objects(&project.id, None, true)?.allowance()?.value(), su("1000"));
    Ok(())
}

#[test]
fn concurrent_increments_are_not_lost() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (project, user) = project_with_member(&h.ledger, "fc_iota", "ivy")?;
    let target = LedgerTarget::project_user(&project.id, &user.id);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let ledger = h.ledger.clone();
            let target = target.clone();
            scope.spawn(move || {
                for _ in 0..25 {
                    ledger.accounting().increment_usage(&target, su("0.50"), None).unwrap();
                }
            });
        }
    });

    let objects = h.ledger.accounting().get_accounting_objects(&project.id, Some(&user.id), true)?;
    assert_eq!(
        objects.user.expect("user").allocation_user_attribute_usage.value.value(),
        su("100.00")
    );
    Ok(())
}

#[test]
fn racing_secure_dir_requests_leave_one_open() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let directory = h.ledger.directory();
    let pi = directory.create_user("quinn", "quinn@example.org", "Quinn", "Q")?;

    for round in 0..10 {
        let project = directory.create_project(&format!("fc_race{round}"), ProjectStatus::Active)?;
        directory.add_project_user(&project.id, &pi.id, ProjectUserRole::PrincipalInvestigator, ProjectUserStatus::Active)?;
        let barrier = std::sync::Barrier::new(2);

        let created = std::thread::scope(|scope| {
            let handles: Vec<_> = ["left", "right"]
                .into_iter()
                .map(|side| {
                    let (ledger, barrier, project, pi) = (&h.ledger, &barrier, &project, &pi);
                    scope.spawn(move || {
                        let suffix = format!("race{round}_{side}");
                        let transition =
                            CreateSecureDirRequest::new(ledger, &pi.id, &pi.id, &project.id, &suffix, "data").unwrap();
                        barrier.wait();
                        Runner::new(ledger, transition).run().unwrap().is_some()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).filter(|ok| *ok).count()
        });
        assert_eq!(created, 1);

        let open = h.ledger.store().filter(|r: &SecureDirRequest| {
            r.project_id == project.id && r.status() != SecureDirRequestStatus::Denied
        })?;
        assert_eq!(open.len(), created);
    }
    Ok(())
}

#[test]
fn enqueued_emails_are_sent_on_flush() -> anyhow::Result<()> {
    let h = harness(TriggerBus::empty())?;
    let (_, user) = project_with_member(&h.ledger, "fc_kappa", "kai")?;
    let queue = EnqueuedStrategy::new();

    let transition =
        CreateDeletionRequest::new(&h.ledger, DeletionKind::Account, &user.id, &user.id, DeletionReason::User)?;
    Runner::new(&h.ledger, transition).with_strategy(&queue).run()?;
    assert!(h.outbox.sent().is_empty());
    assert_eq!(queue.len(), 2);

    queue.flush()?;
    assert_eq!(h.outbox.sent().len(), 2);
    Ok(())
}

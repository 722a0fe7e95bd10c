//! The workflow runner skeleton shared by every request family.
//!
//! A [`Transition`] supplies the family-specific parts: precondition gates,
//! the mutation applied inside one store transaction, and the emails to
//! send. [`Runner`] owns the order of operations and the error isolation
//! around them:
//!
//! 1. `check` runs outside any transaction. Returning `false` stops the run
//!    with nothing written; the reasons are left in the message lists.
//! 2. `apply` runs inside one transaction. A `PreconditionFailed` abort is
//!    treated like a failed gate; any other error is a hard failure, which
//!    sends `failure_emails` immediately and propagates.
//! 3. After commit, `after_commit` hooks and email dispatch run. Their
//!    failures become warnings and never undo the committed mutation.
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::notification::{email_job, Email, EmailStrategy, ImmediateStrategy};
use crate::store::{Tx, TxResult};

static IMMEDIATE: ImmediateStrategy = ImmediateStrategy;

/// Human-readable outcome messages accumulated by a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Messages {
    pub success: Vec<String>,
    pub warning: Vec<String>,
    pub error: Vec<String>,
}

impl Messages {
    pub fn success(&mut self, message: impl Into<String>) {
        self.success.push(message.into());
    }
    pub fn warning(&mut self, message: impl Into<String>) {
        self.warning.push(message.into());
    }
    pub fn error(&mut self, message: impl Into<String>) {
        self.error.push(message.into());
    }
}

pub trait Transition {
    type Output;

    /// Evaluate business-rule gates. Record every failing gate in
    /// `messages.error` and return `false` to stop before any write.
    fn check(&mut self, ledger: &Ledger, messages: &mut Messages) -> Result<bool>;

    /// The mutation. May be called more than once if sled retries.
    fn apply(&self, tx: &Tx<'_>) -> TxResult<Self::Output>;

    fn emails(&self, ledger: &Ledger, output: &Self::Output) -> Result<Vec<Email>>;

    fn success_message(&self, _output: &Self::Output) -> Option<String> {
        None
    }

    /// Work that depends on the committed result, such as cascading into
    /// another workflow.
    fn after_commit(&self, _ledger: &Ledger, _output: &Self::Output, _messages: &mut Messages) {}

    /// Emails that alert someone when `apply` failed.
    fn failure_emails(&self, _ledger: &Ledger, _error: &LedgerError) -> Vec<Email> {
        vec![]
    }
}

pub struct Runner<'a, T: Transition> {
    ledger: &'a Ledger,
    transition: T,
    strategy: &'a dyn EmailStrategy,
    messages: Messages,
}

impl<'a, T: Transition> Runner<'a, T> {
    pub fn new(ledger: &'a Ledger, transition: T) -> Self {
        Self {
            ledger,
            transition,
            strategy: &IMMEDIATE,
            messages: Messages::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: &'a dyn EmailStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns `Ok(None)` when a gate stopped the run.
    pub fn run(&mut self) -> Result<Option<T::Output>> {
        if !self.transition.check(self.ledger, &mut self.messages)? {
            for message in &self.messages.error {
                tracing::debug!(%message, "runner precondition failed");
            }
            return Ok(None);
        }

        let transition = &self.transition;
        let output = match self.ledger.store().transaction(|tx| transition.apply(tx)) {
            Ok(output) => output,
            Err(LedgerError::PreconditionFailed(message)) => {
                self.messages.error(message);
                return Ok(None);
            }
            Err(e) => {
                tracing::error!(error = %e, "runner failed; nothing was committed");
                let alerts = self.transition.failure_emails(self.ledger, &e);
                self.dispatch(&IMMEDIATE, alerts);
                return Err(e);
            }
        };

        if let Some(message) = self.transition.success_message(&output) {
            self.messages.success(message);
        }
        self.transition.after_commit(self.ledger, &output, &mut self.messages);

        match self.transition.emails(self.ledger, &output) {
            Ok(emails) => {
                let strategy = self.strategy;
                self.dispatch(strategy, emails)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to prepare notification emails");
                self.messages
                    .warning(format!("Failed to prepare notification emails. Details: {e}"));
            }
        }
        Ok(Some(output))
    }

    fn dispatch(&mut self, strategy: &dyn EmailStrategy, emails: Vec<Email>) {
        let ledger = self.ledger;
        let config = ledger.config();
        if !config.email_enabled {
            tracing::debug!(count = emails.len(), "email disabled; not sending");
            return;
        }
        for mut email in emails {
            if email.sender.is_empty() {
                email.sender = config.email_sender.clone();
            }
            let subject = email.subject.clone();
            if let Err(e) = strategy.process_email(email_job(ledger.mailer(), email)) {
                let failure = LedgerError::Notification(e.to_string());
                tracing::warn!(%subject, error = %failure, "failed to send notification email");
                self.messages.warning(format!(
                    "Failed to send notification email \"{subject}\". Details: {e}"
                ));
            }
        }
    }

    /// `(success, error)` messages.
    pub fn get_messages(&self) -> (Vec<String>, Vec<String>) {
        (self.messages.success.clone(), self.messages.error.clone())
    }

    pub fn get_warning_messages(&self) -> Vec<String> {
        self.messages.warning.clone()
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }
}

/// Standard email context entries every template receives.
pub(crate) fn base_email(ledger: &Ledger, subject: &str, template_name: &str) -> Email {
    let config = ledger.config();
    Email::new(subject, template_name)
        .from_sender(&config.email_sender)
        .with("signature", config.email_signature.clone())
        .with("support_email", config.center_help_email.clone())
        .with("portal_name", config.portal_name.clone())
        .with("center_base_url", config.center_base_url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::models::User;
    use crate::notification::{EmailSender, EnqueuedStrategy, MemoryOutbox};
    use crate::store::abort;
    use crate::triggers::TriggerBus;
    use std::sync::Arc;

    struct Broken;
    impl EmailSender for Broken {
        fn send_email_template(&self, _: &Email) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    struct Rename {
        user: User,
        allowed: bool,
        fail: bool,
    }

    impl Transition for Rename {
        type Output = User;

        fn check(&mut self, _: &Ledger, messages: &mut Messages) -> Result<bool> {
            if !self.allowed {
                messages.error("renaming is not allowed");
            }
            Ok(self.allowed)
        }
        fn apply(&self, tx: &Tx<'_>) -> TxResult<User> {
            let mut user = self.user.clone();
            user.username = "renamed".into();
            tx.put(&user)?;
            if self.fail {
                return abort(LedgerError::Persistence("disk full".into()));
            }
            Ok(user)
        }
        fn emails(&self, ledger: &Ledger, user: &User) -> Result<Vec<Email>> {
            Ok(vec![base_email(ledger, "Renamed", "renamed").to(vec![user.email.clone()])])
        }
        fn failure_emails(&self, ledger: &Ledger, _: &LedgerError) -> Vec<Email> {
            vec![base_email(ledger, "Rename failed", "rename_failed").to(vec!["admin".into()])]
        }
    }

    fn ledger(sender: Arc<dyn EmailSender>) -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join("ledger.db")).unwrap());
        let ledger = Ledger::new(db, LedgerConfig::default(), sender)
            .unwrap()
            .with_triggers(TriggerBus::empty());
        (dir, ledger)
    }

    fn user() -> User {
        User {
            id: "user_1".into(),
            username: "u".into(),
            email: "u@example.org".into(),
            first_name: "U".into(),
            last_name: "S".into(),
            is_superuser: false,
        }
    }

    #[test]
    fn failed_gate_writes_nothing() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (_dir, ledger) = ledger(outbox.clone());
        let mut runner = Runner::new(&ledger, Rename { user: user(), allowed: false, fail: false });

        assert!(runner.run().unwrap().is_none());
        assert_eq!(runner.get_messages().1, vec!["renaming is not allowed".to_string()]);
        assert!(ledger.store().get::<User>("user_1").unwrap().is_none());
        assert!(outbox.sent().is_empty());
    }

    #[test]
    fn send_failure_keeps_the_commit() {
        let (_dir, ledger) = ledger(Arc::new(Broken));
        let mut runner = Runner::new(&ledger, Rename { user: user(), allowed: true, fail: false });

        assert!(runner.run().unwrap().is_some());
        assert_eq!(runner.get_warning_messages().len(), 1);
        assert_eq!(ledger.store().fetch::<User>("user_1").unwrap().username, "renamed");
    }

    #[test]
    fn apply_failure_alerts_immediately() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (_dir, ledger) = ledger(outbox.clone());
        let queue = EnqueuedStrategy::new();
        let mut runner = Runner::new(&ledger, Rename { user: user(), allowed: true, fail: true })
            .with_strategy(&queue);

        assert!(matches!(runner.run(), Err(LedgerError::Persistence(_))));
        assert!(ledger.store().get::<User>("user_1").unwrap().is_none());
        assert_eq!(outbox.sent_with_template("rename_failed").len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueued_emails_wait_for_flush() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (_dir, ledger) = ledger(outbox.clone());
        let queue = EnqueuedStrategy::new();
        let mut runner = Runner::new(&ledger, Rename { user: user(), allowed: true, fail: false })
            .with_strategy(&queue);

        runner.run().unwrap();
        assert!(outbox.sent().is_empty());
        queue.flush().unwrap();
        assert_eq!(outbox.sent_with_template("renamed").len(), 1);
    }
}

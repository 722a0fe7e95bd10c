//! Outbound email abstraction and the two delivery strategies.
//!
//! Rendering and SMTP delivery belong to whoever implements [`EmailSender`].
//! Strategies only decide *when* a send happens: right away, or once the
//! caller flushes after its transaction has committed.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub template_name: String,
    pub context: BTreeMap<String, String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
}

impl Email {
    pub fn new(subject: impl Into<String>, template_name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            template_name: template_name.into(),
            context: BTreeMap::new(),
            sender: String::new(),
            recipients: vec![],
            cc: vec![],
        }
    }
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
    pub fn from_sender(mut self, sender: &str) -> Self {
        self.sender = sender.to_string();
        self
    }
    pub fn to(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }
    pub fn cc(mut self, cc: Vec<String>) -> Self {
        self.cc = cc;
        self
    }
}

/// The `SendEmailTemplate` capability.
pub trait EmailSender: Send + Sync {
    fn send_email_template(&self, email: &Email) -> anyhow::Result<()>;
}

/// Keeps every sent email in memory.
#[derive(Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<Email>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
    pub fn sent_with_template(&self, template_name: &str) -> Vec<Email> {
        self.sent()
            .into_iter()
            .filter(|email| email.template_name == template_name)
            .collect()
    }
}

impl EmailSender for MemoryOutbox {
    fn send_email_template(&self, email: &Email) -> anyhow::Result<()> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| anyhow::anyhow!("outbox lock poisoned"))?;
        sent.push(email.clone());
        Ok(())
    }
}

pub type EmailJob = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Builds the deferred send of `email` through `sender`.
pub fn email_job(sender: Arc<dyn EmailSender>, email: Email) -> EmailJob {
    Box::new(move || sender.send_email_template(&email))
}

pub trait EmailStrategy {
    fn process_email(&self, job: EmailJob) -> anyhow::Result<()>;
    fn flush(&self) -> anyhow::Result<()>;
}

/// Sends as soon as asked, including from failure paths after a rollback.
#[derive(Default, Clone, Copy)]
pub struct ImmediateStrategy;

impl EmailStrategy for ImmediateStrategy {
    fn process_email(&self, job: EmailJob) -> anyhow::Result<()> {
        job()
    }
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Holds emails until [`EmailStrategy::flush`], which the caller runs only
/// after its own transaction has committed.
#[derive(Default)]
pub struct EnqueuedStrategy {
    queue: Mutex<VecDeque<EmailJob>>,
}

impl EnqueuedStrategy {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmailStrategy for EnqueuedStrategy {
    fn process_email(&self, job: EmailJob) -> anyhow::Result<()> {
        self.queue
            .lock()
            .map_err(|_| anyhow::anyhow!("email queue lock poisoned"))?
            .push_back(job);
        Ok(())
    }

    // every queued job is attempted; failures are logged and counted
    fn flush(&self) -> anyhow::Result<()> {
        let jobs: Vec<EmailJob> = self
            .queue
            .lock()
            .map_err(|_| anyhow::anyhow!("email queue lock poisoned"))?
            .drain(..)
            .collect();

        let mut failures = 0usize;
        for job in jobs {
            if let Err(e) = job() {
                tracing::warn!(error = %e, "failed to send queued email");
                failures += 1;
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} queued email(s) failed to send");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;
    impl EmailSender for Broken {
        fn send_email_template(&self, _: &Email) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    #[test]
    fn enqueued_sends_nothing_until_flush() {
        let outbox = Arc::new(MemoryOutbox::new());
        let strategy = EnqueuedStrategy::new();

        strategy
            .process_email(email_job(outbox.clone(), Email::new("Hi", "greeting")))
            .unwrap();
        assert!(outbox.sent().is_empty());
        assert_eq!(strategy.len(), 1);

        strategy.flush().unwrap();
        assert_eq!(outbox.sent().len(), 1);
        assert!(strategy.is_empty());
    }

    #[test]
    fn immediate_surfaces_send_errors() {
        let strategy = ImmediateStrategy;
        let result = strategy.process_email(email_job(Arc::new(Broken), Email::new("Hi", "greeting")));
        assert!(result.is_err());
    }

    #[test]
    fn flush_attempts_every_job() {
        let outbox = Arc::new(MemoryOutbox::new());
        let strategy = EnqueuedStrategy::new();
        strategy.process_email(email_job(Arc::new(Broken), Email::new("a", "t"))).unwrap();
        strategy.process_email(email_job(outbox.clone(), Email::new("b", "t"))).unwrap();

        assert!(strategy.flush().is_err());
        assert_eq!(outbox.sent().len(), 1);
    }
}

//! The `Ledger` handle: the one value callers construct and pass around.
use crate::accounting::AccountingService;
use crate::config::LedgerConfig;
use crate::directory::Directory;
use crate::error::{LedgerError, Result};
use crate::notification::EmailSender;
use crate::store::Store;
use crate::triggers::{Event, TriggerBus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct Ledger {
    store: Store,
    config: Arc<LedgerConfig>,
    mailer: Arc<dyn EmailSender>,
    locks: Arc<RowLocks>,
    triggers: Arc<TriggerBus>,
}

impl Ledger {
    pub fn new(
        instance: Arc<sled::Db>,
        config: LedgerConfig,
        mailer: Arc<dyn EmailSender>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Store::new(instance),
            config: Arc::new(config),
            mailer,
            locks: Arc::new(RowLocks::default()),
            triggers: Arc::new(TriggerBus::with_default_handlers()),
        })
    }

    /// Replace the cross-workflow handlers, e.g. with an empty bus.
    pub fn with_triggers(mut self, triggers: TriggerBus) -> Self {
        self.triggers = Arc::new(triggers);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
    pub fn mailer(&self) -> Arc<dyn EmailSender> {
        self.mailer.clone()
    }
    pub fn accounting(&self) -> AccountingService<'_> {
        AccountingService::new(self)
    }
    pub fn directory(&self) -> Directory<'_> {
        Directory::new(self)
    }

    /// Deliver `event` to every trigger handler, synchronously.
    pub fn emit(&self, event: &Event) {
        self.triggers.dispatch(self, event);
    }

    pub(crate) fn row_locks(&self) -> &RowLocks {
        &self.locks
    }
}

/// Exclusive in-process locks keyed by record key. Two writers on the same
/// usage row serialize; writers on different rows do not contend.
#[derive(Default)]
pub struct RowLocks {
    rows: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RowLocks {
    fn row(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| LedgerError::Persistence("row lock table poisoned".into()))?;
        Ok(rows.entry(key.to_string()).or_default().clone())
    }

    /// Forget the lock for `key` once no other writer holds or waits on it.
    /// Clones are only taken under the table lock, so the count is stable here.
    fn release(&self, key: &str, row: Arc<Mutex<()>>) {
        if let Ok(mut rows) = self.rows.lock() {
            if Arc::strong_count(&row) == 2 {
                rows.remove(key);
            }
        }
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let row = self.row(key)?;
        let result = {
            let _guard: MutexGuard<'_, ()> = row
                .lock()
                .map_err(|_| LedgerError::Persistence(format!("row lock for {key} poisoned")))?;
            f()
        };
        self.release(key, row);
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_row_is_exclusive() {
        let locks = Arc::new(RowLocks::default());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    locks
                        .with_lock("usage/a", || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn idle_rows_are_forgotten() {
        let locks = RowLocks::default();
        for i in 0..100 {
            locks.with_lock(&format!("usage/{i}"), || Ok(())).unwrap();
        }
        assert_eq!(locks.len(), 0);

        let err = locks
            .with_lock("usage/x", || -> Result<()> { Err(LedgerError::InvalidArgument("no".into())) })
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        assert_eq!(locks.len(), 0);
    }
}

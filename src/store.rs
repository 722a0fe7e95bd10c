//! sled-backed record store.
//!
//! Every record lives under `<prefix>/<id>` in one tree, so a single sled
//! transaction can touch any combination of records and index keys. Scans
//! (`all`, `filter`, `get_one`) run outside transactions; anything a
//! transaction must see consistently is read through [`Tx`].
use crate::error::{LedgerError, Result};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, UnabortableTransactionError,
};
use std::sync::Arc;

/// A persisted entity with a stable key prefix and its own wire encoding.
pub trait Record: Sized {
    const PREFIX: &'static str;
    const MODEL: &'static str;

    fn id(&self) -> &str;
    fn to_bytes(&self) -> Result<Vec<u8>>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    fn key_for(id: &str) -> String {
        format!("{}/{}", Self::PREFIX, id)
    }
    fn key(&self) -> String {
        Self::key_for(self.id())
    }
}

/// Implements [`Record`] for a minicbor-encoded type with an `id` field.
#[macro_export]
macro_rules! cbor_record {
    ($ty:ty, $prefix:literal, $model:literal) => {
        impl $crate::store::Record for $ty {
            const PREFIX: &'static str = $prefix;
            const MODEL: &'static str = $model;

            fn id(&self) -> &str {
                &self.id
            }
            fn to_bytes(&self) -> $crate::error::Result<Vec<u8>> {
                Ok(minicbor::to_vec(self)?)
            }
            fn from_bytes(bytes: &[u8]) -> $crate::error::Result<Self> {
                Ok(minicbor::decode(bytes)?)
            }
        }
    };
}

/// Implements [`Record`] for a serde JSON-encoded type with an `id` field.
#[macro_export]
macro_rules! json_record {
    ($ty:ty, $prefix:literal, $model:literal) => {
        impl $crate::store::Record for $ty {
            const PREFIX: &'static str = $prefix;
            const MODEL: &'static str = $model;

            fn id(&self) -> &str {
                &self.id
            }
            fn to_bytes(&self) -> $crate::error::Result<Vec<u8>> {
                Ok(serde_json::to_vec(self)?)
            }
            fn from_bytes(bytes: &[u8]) -> $crate::error::Result<Self> {
                Ok(serde_json::from_slice(bytes)?)
            }
        }
    };
}

pub type TxError = ConflictableTransactionError<LedgerError>;
pub type TxResult<T> = std::result::Result<T, TxError>;

/// Abort the enclosing transaction with the given error.
pub fn abort<T>(err: LedgerError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn storage(err: UnabortableTransactionError) -> TxError {
    err.into()
}

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }

    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        match self.instance.get(R::key_for(id))? {
            Some(bytes) => Ok(Some(R::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`Store::get`] but a missing record is a `NotFound` error.
    pub fn fetch<R: Record>(&self, id: &str) -> Result<R> {
        self.get(id)?
            .ok_or_else(|| LedgerError::does_not_exist(R::MODEL))
    }

    pub fn all<R: Record>(&self) -> Result<Vec<R>> {
        let prefix = format!("{}/", R::PREFIX);
        self.instance
            .scan_prefix(prefix.as_bytes())
            .map(|item| {
                let (_, bytes) = item?;
                R::from_bytes(&bytes)
            })
            .collect()
    }

    pub fn filter<R: Record>(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        Ok(self.all::<R>()?.into_iter().filter(|r| predicate(r)).collect())
    }

    pub fn exists<R: Record>(&self, predicate: impl Fn(&R) -> bool) -> Result<bool> {
        Ok(!self.filter(predicate)?.is_empty())
    }

    /// Exactly one record must match; zero is `NotFound`, more is `MultipleFound`.
    pub fn get_one<R: Record>(&self, predicate: impl Fn(&R) -> bool) -> Result<R> {
        let mut matches = self.filter(predicate)?;
        match matches.len() {
            0 => Err(LedgerError::does_not_exist(R::MODEL)),
            1 => Ok(matches.remove(0)),
            n => Err(LedgerError::returned_more_than_one(R::MODEL, n)),
        }
    }

    /// Insert or replace a single record outside of any workflow transaction.
    pub fn put<R: Record>(&self, record: &R) -> Result<()> {
        self.instance.insert(record.key(), record.to_bytes()?)?;
        Ok(())
    }

    pub fn index_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .instance
            .get(key)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Run `f` atomically. sled may call `f` more than once on conflict, so
    /// it must not have side effects outside the transaction.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        self.instance
            .transaction(|tree| f(&Tx { tree }))
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => LedgerError::from(e),
            })
    }

    pub fn flush(&self) -> Result<()> {
        self.instance.flush()?;
        Ok(())
    }
}

/// Typed view over a sled transaction.
pub struct Tx<'a> {
    tree: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn get<R: Record>(&self, id: &str) -> TxResult<Option<R>> {
        match self.tree.get(R::key_for(id)).map_err(storage)? {
            Some(bytes) => R::from_bytes(&bytes).map(Some).or_else(abort),
            None => Ok(None),
        }
    }

    pub fn fetch<R: Record>(&self, id: &str) -> TxResult<R> {
        match self.get::<R>(id)? {
            Some(record) => Ok(record),
            None => abort(LedgerError::does_not_exist(R::MODEL)),
        }
    }

    pub fn put<R: Record>(&self, record: &R) -> TxResult<()> {
        let bytes = record.to_bytes().or_else(abort)?;
        self.tree.insert(record.key().as_bytes(), bytes).map_err(storage)?;
        Ok(())
    }

    pub fn index_get(&self, key: &str) -> TxResult<Option<String>> {
        Ok(self
            .tree
            .get(key)
            .map_err(storage)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn index_set(&self, key: &str, value: &str) -> TxResult<()> {
        self.tree.insert(key, value.as_bytes()).map_err(storage)?;
        Ok(())
    }

    pub fn index_remove(&self, key: &str) -> TxResult<()> {
        self.tree.remove(key).map_err(storage)?;
        Ok(())
    }
}

//! Error taxonomy shared by the accounting service and the workflow runners

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    MultipleFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Persistence failure: {0}")]
    Persistence(String),
    #[error("Notification failure: {0}")]
    Notification(String),
    #[error("Failed to encode or decode a record: {0}")]
    Codec(String),
}

impl LedgerError {
    /// The error every closed choice set returns for an unknown name.
    pub fn choice_not_found(name: &str) -> Self {
        LedgerError::NotFound(format!("Object with name={name} does not exist."))
    }

    pub fn does_not_exist(model: &str) -> Self {
        LedgerError::NotFound(format!("{model} matching query does not exist."))
    }

    pub fn returned_more_than_one(model: &str, count: usize) -> Self {
        LedgerError::MultipleFound(format!(
            "get() returned more than one {model} -- it returned {count}!"
        ))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

impl From<sled::Error> for LedgerError {
    fn from(value: sled::Error) -> Self {
        LedgerError::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(value: serde_json::Error) -> Self {
        LedgerError::Codec(value.to_string())
    }
}

impl From<minicbor::decode::Error> for LedgerError {
    fn from(value: minicbor::decode::Error) -> Self {
        LedgerError::Codec(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for LedgerError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        LedgerError::Codec(value.to_string())
    }
}

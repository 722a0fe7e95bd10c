//! Allocation ledger and request workflow engine.
//!
//! [`ledger::Ledger`] is the entry point. It owns the sled-backed store, the
//! configuration and the email sender, and hands out the accounting and
//! directory services. Request workflows are [`runner::Transition`]s driven
//! by a [`runner::Runner`].

pub mod account_deletion;
pub mod accounting;
pub mod allowance;
pub mod choices;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod models;
pub mod notification;
pub mod requests;
pub mod runner;
pub mod secure_dir;
pub mod secure_dir_users;
pub mod state;
pub mod store;
pub mod triggers;
pub mod types;
pub mod utils;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;

//! Utility functions for identifiers and timestamps

use crate::error::{LedgerError, Result};
use bech32::Bech32m;
use chrono::{SecondsFormat, Utc};
use uuid7::uuid7;

// construct a unique record id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|e| LedgerError::InvalidArgument(format!("invalid id prefix {hrp}: {e}")))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| LedgerError::Codec(e.to_string()))?;
    Ok(encode)
}

/// The current time as an ISO-8601 string, the format stored in request state documents.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

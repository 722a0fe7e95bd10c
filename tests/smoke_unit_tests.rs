//! Smoke screen unit tests for the ledger's building blocks
//!
//! These span the public API in isolation from the workflow scenarios and
//! generally test the happy path.

use allocation_ledger::{
    allowance::AllowanceUsage,
    choices::{DeletionReason, ProjectUserStatus, StepStatus},
    config::LedgerConfig,
    models::User,
    state::{DeletionState, SecureDirState, SecureDirStep},
    store::{Record, Store},
    types::{ServiceUnits, TimeStamp},
    utils::new_uuid_to_bech32,
};
use chrono::{Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Ids carry their human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("proj_").unwrap();
        assert!(encoded.starts_with("proj_1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn generates_unique_ids() {
        let id1 = new_uuid_to_bech32("user_").unwrap();
        let id2 = new_uuid_to_bech32("user_").unwrap();
        assert_ne!(id1, id2);
    }
}

// TYPES MODULE TESTS
mod types_tests {
    use super::*;

    #[test]
    fn timestamp_new_with_creates_specific_time() {
        let dt = TimeStamp::new_with(2024, 6, 15, 10, 30, 0).unwrap().to_datetime_utc();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2024, 6, 15));
        assert_eq!((dt.hour(), dt.minute()), (10, 30));
        assert!(TimeStamp::new_with(2024, 2, 30, 0, 0, 0).is_none());
    }

    #[test]
    fn timestamp_cbor_roundtrip() {
        let original = TimeStamp::new();
        let encoded = minicbor::to_vec(original).unwrap();
        let decoded: TimeStamp = minicbor::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
        assert!((Utc::now() - decoded.to_datetime_utc()).num_seconds() < 1);
    }

    /// Half-way cents round to the even neighbour
    #[test]
    fn service_units_round_half_even() {
        assert_eq!(ServiceUnits::from_str("0.125").unwrap().to_string(), "0.12");
        assert_eq!(ServiceUnits::from_str("0.135").unwrap().to_string(), "0.14");
        assert_eq!(ServiceUnits::from_str("42").unwrap().value(), Decimal::from(42));
    }
}

// ALLOWANCE MODULE TESTS
mod allowance_tests {
    use super::*;

    fn pair(allowance: &str, usage: &str) -> AllowanceUsage {
        AllowanceUsage::new(allowance.parse().unwrap(), usage.parse().unwrap())
    }

    #[test]
    fn display_includes_percentage() {
        assert_eq!(pair("1000", "1").format_display().unwrap(), "1/1000 (0.10 %)");
    }

    #[test]
    fn zero_allowance_is_an_error() {
        assert!(pair("0", "5").calculate_percentage().is_err());
    }
}

// CHOICES MODULE TESTS
mod choices_tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(ProjectUserStatus::PendingRemove.name(), "Pending - Remove");
        assert_eq!(
            "Pending - Remove".parse::<ProjectUserStatus>().unwrap(),
            ProjectUserStatus::PendingRemove
        );
        assert_eq!(DeletionReason::from_name("BadPID").unwrap(), DeletionReason::BadPid);
    }

    #[test]
    fn system_reasons() {
        assert!(DeletionReason::LastProject.is_system_initiated());
        assert!(!DeletionReason::User.is_system_initiated());
    }
}

// CONFIG MODULE TESTS
mod config_tests {
    use super::*;

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(LedgerConfig::from_yaml_str("allocation_min: 10\nallocation_max: 5\n").is_err());
    }

    #[test]
    fn compute_resource_by_prefix() {
        let config = LedgerConfig::default();
        assert_eq!(config.compute_resource_for("vector_lab"), "Vector Compute");
        assert_eq!(config.compute_resource_for("fc_lab"), config.primary_compute_resource);
    }
}

// STATE MODULE TESTS
mod state_tests {
    use super::*;

    #[test]
    fn fresh_secure_dir_checklist() {
        let state = SecureDirState::default();
        let checklist = state.checklist("/review");
        let actionable: Vec<bool> = checklist.iter().map(|item| item.is_actionable).collect();
        assert_eq!(actionable, vec![true, true, false, false]);
        assert!(checklist.iter().all(|item| item.status == "Pending"));
        assert!(state.denial_reason().is_none());
        assert_eq!(state.latest_update_timestamp(), "");
    }

    #[test]
    fn mou_accepts_only_review_statuses() {
        assert!(SecureDirStep::Mou.accepts(StepStatus::Approved));
        assert!(!SecureDirStep::Mou.accepts(StepStatus::Completed));
        assert!(SecureDirStep::Setup.accepts(StepStatus::Completed));
    }

    #[test]
    fn deletion_state_has_three_steps() {
        assert_eq!(DeletionState::default().checklist("/deletion").len(), 3);
    }
}

// STORE MODULE TESTS
mod store_tests {
    use super::*;

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            username: id.into(),
            email: format!("{id}@example.org"),
            first_name: "F".into(),
            last_name: "L".into(),
            is_superuser: false,
        }
    }

    #[test]
    fn records_live_under_their_prefix() {
        assert_eq!(User::key_for("user_1"), "user/user_1");
        let decoded = User::from_bytes(&user("user_1").to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, user("user_1"));
    }

    #[test]
    fn get_one_reports_missing_and_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        store.put(&user("user_1")).unwrap();
        store.put(&user("user_2")).unwrap();

        let missing = store.get_one(|u: &User| u.username == "nobody").unwrap_err();
        assert_eq!(missing.to_string(), "User matching query does not exist.");
        assert!(store.get_one(|u: &User| u.first_name == "F").is_err());
        assert_eq!(store.get_one(|u: &User| u.id == "user_2").unwrap(), user("user_2"));
    }
}

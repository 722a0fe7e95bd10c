//! Explicit configuration handed to the ledger at construction
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub allocation_min: Decimal,
    pub allocation_max: Decimal,

    pub primary_compute_resource: String,
    // project-name prefix -> compute resource name, for projects that are not
    // on the primary cluster
    pub compute_resource_prefixes: BTreeMap<String, String>,

    pub account_deletion_manual_queue_days: i64,
    pub account_deletion_auto_queue_days: i64,
    pub cancellation_justification_min_length: usize,

    pub email_enabled: bool,
    pub email_sender: String,
    pub email_admin_list: Vec<String>,
    pub email_signature: String,
    pub center_help_email: String,
    pub portal_name: String,
    pub center_base_url: String,

    pub groups_directory_path: String,
    pub scratch_directory_path: String,
    pub secure_directory_name_prefix: String,
    pub secure_dir_eligible_project_prefixes: Vec<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            allocation_min: Decimal::ZERO,
            allocation_max: Decimal::new(100_000_000_00, 2),
            primary_compute_resource: "Savio Compute".into(),
            compute_resource_prefixes: BTreeMap::from([
                ("vector_".to_string(), "Vector Compute".to_string()),
                ("abc".to_string(), "ABC Compute".to_string()),
            ]),
            account_deletion_manual_queue_days: 14,
            account_deletion_auto_queue_days: 60,
            cancellation_justification_min_length: 10,
            email_enabled: true,
            email_sender: "noreply@example.org".into(),
            email_admin_list: vec!["admin@example.org".into()],
            email_signature: "Research IT".into(),
            center_help_email: "support@example.org".into(),
            portal_name: "MyBRC".into(),
            center_base_url: "https://mybrc.example.org".into(),
            groups_directory_path: "/global/home/groups/pl1data".into(),
            scratch_directory_path: "/global/scratch/p2p3/pl1_data".into(),
            secure_directory_name_prefix: "pl1_".into(),
            secure_dir_eligible_project_prefixes: vec!["co_".into(), "fc_".into(), "ic_".into()],
        }
    }
}

impl LedgerConfig {
    /// Parse a configuration document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: LedgerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LedgerError::InvalidArgument(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allocation_min > self.allocation_max {
            return Err(LedgerError::InvalidArgument(format!(
                "allocation_min {} exceeds allocation_max {}",
                self.allocation_min, self.allocation_max
            )));
        }
        if self.account_deletion_manual_queue_days < 0 || self.account_deletion_auto_queue_days < 0 {
            return Err(LedgerError::InvalidArgument(
                "queue days must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// Name of the compute resource a project's accounting allocation is tied to.
    pub fn compute_resource_for(&self, project_name: &str) -> &str {
        self.compute_resource_prefixes
            .iter()
            .find(|(prefix, _)| project_name.starts_with(prefix.as_str()))
            .map(|(_, resource)| resource.as_str())
            .unwrap_or(&self.primary_compute_resource)
    }

    pub fn is_in_allocation_bounds(&self, value: Decimal) -> bool {
        self.allocation_min <= value && value <= self.allocation_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_defaults() {
        let config = LedgerConfig::from_yaml_str(
            "allocation_max: 500\nemail_enabled: false\nprimary_compute_resource: Lawrencium Compute\n",
        )
        .unwrap();

        assert_eq!(config.allocation_max, Decimal::new(500, 0));
        assert!(!config.email_enabled);
        assert_eq!(config.compute_resource_for("pc_test"), "Lawrencium Compute");
        assert_eq!(config.account_deletion_auto_queue_days, 60);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(LedgerConfig::from_yaml_str("allocation_min: 10\nallocation_max: 1\n").is_err());
    }

    #[test]
    fn compute_resource_follows_prefix() {
        let config = LedgerConfig::default();
        assert_eq!(config.compute_resource_for("vector_project"), "Vector Compute");
        assert_eq!(config.compute_resource_for("fc_project"), "Savio Compute");
    }
}

//! LeftHand extra-spec mapping
//!
//! Volume types carry `hpelh:` (or legacy `hplh:`) keys that translate into
//! LeftHand volume options.

use crate::domain::ports::{BackendOptions, ExtraSpecMapper, OptionValue};
use std::collections::BTreeMap;
use tracing::warn;

pub const THIN_PROVISIONED: &str = "isThinProvisioned";
pub const ADAPTIVE_OPTIMIZATION: &str = "isAdaptiveOptimizationEnabled";
pub const DATA_PROTECTION_LEVEL: &str = "dataProtectionLevel";
pub const CLUSTER_NAME: &str = "clusterName";

/// Mapper for `hpelh:provisioning`, `hpelh:ao` and `hpelh:data_pl`
#[derive(Debug, Clone, Copy, Default)]
pub struct LeftHandSpecMapper;

impl LeftHandSpecMapper {
    pub fn new() -> Self {
        Self
    }
}

impl ExtraSpecMapper for LeftHandSpecMapper {
    fn prefixes(&self) -> &[&'static str] {
        &["hpelh:", "hplh:"]
    }

    fn map(&self, extra_specs: &BTreeMap<String, String>) -> BackendOptions {
        let mut options = BackendOptions::new();

        for (key, value) in self.filter(extra_specs) {
            match key.as_str() {
                "provisioning" => {
                    options.insert(THIN_PROVISIONED.into(), OptionValue::Bool(value == "thin"));
                }
                "ao" => match value.as_str() {
                    "true" => {
                        options.insert(ADAPTIVE_OPTIMIZATION.into(), OptionValue::Bool(true));
                    }
                    "false" => {
                        options.insert(ADAPTIVE_OPTIMIZATION.into(), OptionValue::Bool(false));
                    }
                    other => warn!("Ignoring invalid value '{}' for extra spec ao", other),
                },
                "data_pl" => match parse_protection_level(&value) {
                    Some(level) => {
                        options.insert(DATA_PROTECTION_LEVEL.into(), OptionValue::Int(level));
                    }
                    None => warn!("Ignoring invalid value '{}' for extra spec data_pl", value),
                },
                _ => {}
            }
        }

        options
    }
}

/// `r-<digit>` to the digit
fn parse_protection_level(value: &str) -> Option<i64> {
    let digits = value.strip_prefix("r-")?;
    let mut chars = digits.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => c.to_digit(10).map(i64::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extra_spec_mapping() {
        let options = LeftHandSpecMapper.map(&specs(&[
            ("hpelh:provisioning", "thin"),
            ("hpelh:ao", "true"),
            ("hpelh:data_pl", "r-0"),
        ]));

        assert_eq!(options.len(), 3);
        assert_eq!(options[THIN_PROVISIONED], OptionValue::Bool(true));
        assert_eq!(options[ADAPTIVE_OPTIMIZATION], OptionValue::Bool(true));
        assert_eq!(options[DATA_PROTECTION_LEVEL], OptionValue::Int(0));
    }

    #[test]
    fn test_legacy_prefix() {
        let options = LeftHandSpecMapper.map(&specs(&[
            ("hplh:provisioning", "full"),
            ("hplh:ao", "false"),
            ("hplh:data_pl", "r-10"),
        ]));

        assert_eq!(options[THIN_PROVISIONED], OptionValue::Bool(false));
        assert_eq!(options[ADAPTIVE_OPTIMIZATION], OptionValue::Bool(false));
        assert!(!options.contains_key(DATA_PROTECTION_LEVEL));
    }

    #[test]
    fn test_current_prefix_wins_over_legacy() {
        let options = LeftHandSpecMapper.map(&specs(&[
            ("hpelh:ao", "true"),
            ("hplh:ao", "false"),
            ("hplh:provisioning", "thin"),
        ]));

        assert_eq!(options[ADAPTIVE_OPTIMIZATION], OptionValue::Bool(true));
        assert_eq!(options[THIN_PROVISIONED], OptionValue::Bool(true));
    }

    #[test]
    fn test_extra_spec_mapping_invalid_value() {
        let options = LeftHandSpecMapper.map(&specs(&[
            ("hpelh:provisioning", "thin"),
            ("hpelh:ao", "yes"),
            ("hpelh:data_pl", "r-07"),
        ]));

        assert_eq!(options.len(), 1);
        assert_eq!(options[THIN_PROVISIONED], OptionValue::Bool(true));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let options = LeftHandSpecMapper.map(&specs(&[
            ("foo:bar", "fake"),
            ("replication_enabled", "<is> True"),
            ("hpelh:unknown", "1"),
        ]));
        assert!(options.is_empty());
    }

    #[test]
    fn test_protection_levels() {
        assert_eq!(parse_protection_level("r-5"), Some(5));
        assert_eq!(parse_protection_level("r-"), None);
        assert_eq!(parse_protection_level("5"), None);
        assert_eq!(parse_protection_level("r-a"), None);
    }
}

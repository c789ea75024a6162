//! Remote settings consulted once at window startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Setting holding the user ids exempt from window limits and main-loss closing.
pub const ALLOW_LIST_SETTING: &str = "popoutCloseWhiteList";

/// Errors fetching settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings request failed: {0}")]
    Request(String),
}

/// A settings query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    pub session: String,
    pub room_id: String,
    pub names: Vec<String>,
}

/// One fetched setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingValue {
    pub name: String,
    pub value: Value,
}

/// Where settings come from.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn fetch(&self, request: SettingsRequest) -> Result<Vec<SettingValue>, SettingsError>;
}

/// Settings fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: Vec<SettingValue>,
}

impl StaticSettings {
    pub fn new(values: Vec<SettingValue>) -> Self {
        Self { values }
    }

    /// Settings with only the allow list.
    pub fn with_allow_list(user_ids: &[&str]) -> Self {
        Self::new(vec![SettingValue {
            name: ALLOW_LIST_SETTING.to_string(),
            value: Value::from(user_ids.to_vec()),
        }])
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn fetch(&self, request: SettingsRequest) -> Result<Vec<SettingValue>, SettingsError> {
        Ok(self
            .values
            .iter()
            .filter(|v| request.names.contains(&v.name))
            .cloned()
            .collect())
    }
}

/// Extract the allow list from fetched settings.
pub fn allow_list(values: &[SettingValue]) -> Vec<String> {
    values
        .iter()
        .find(|v| v.name == ALLOW_LIST_SETTING)
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.value.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(names: &[&str]) -> SettingsRequest {
        SettingsRequest {
            session: "s".into(),
            room_id: "r".into(),
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_static_settings_filters_by_name() {
        let source = StaticSettings::with_allow_list(&["u1", "u2"]);
        let values = source.fetch(request(&[ALLOW_LIST_SETTING])).await.unwrap();
        assert_eq!(allow_list(&values), vec!["u1".to_string(), "u2".to_string()]);

        let values = source.fetch(request(&["other"])).await.unwrap();
        assert!(values.is_empty());
        assert!(allow_list(&values).is_empty());
    }

    #[test]
    fn test_malformed_allow_list_reads_empty() {
        let values = vec![SettingValue {
            name: ALLOW_LIST_SETTING.into(),
            value: Value::from(42),
        }];
        assert!(allow_list(&values).is_empty());
    }
}

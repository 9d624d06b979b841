use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::db::AccessLevel;
use crate::form::Features;

/// Web app settings, read from Rocket's figment (`Rocket.toml` and
/// `ROCKET_*` variables) next to Rocket's own keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub storage_root: PathBuf,
    pub max_sessions: i64,
    /// Run the bootstrap with the service role at launch.
    pub auto_provision: bool,
    pub features: Features,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: PathBuf::from("data/tms.sqlite"),
            storage_root: PathBuf::from("data/storage"),
            max_sessions: 5,
            auto_provision: false,
            features: Features::default(),
        }
    }
}

pub const DATABASE_PATH_VAR: &str = "TMS_DATABASE_PATH";
pub const SERVICE_ROLE_KEY_VAR: &str = "TMS_SERVICE_ROLE_KEY";
pub const STORAGE_ROOT_VAR: &str = "TMS_STORAGE_ROOT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
}

/// Settings for `tms-admin`, taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminConfig {
    pub database_path: PathBuf,
    pub storage_root: PathBuf,
    pub access: AccessLevel,
}

impl AdminConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let present = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let database_path = present(DATABASE_PATH_VAR).ok_or(ConfigError::Missing(DATABASE_PATH_VAR))?;
        let access = if present(SERVICE_ROLE_KEY_VAR).is_some() {
            AccessLevel::ServiceRole
        } else {
            AccessLevel::Anon
        };
        let storage_root = present(STORAGE_ROOT_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| AppConfig::default().storage_root);
        Ok(AdminConfig {
            database_path: PathBuf::from(database_path),
            storage_root,
            access,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn database_path_is_required() {
        assert_eq!(
            AdminConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(DATABASE_PATH_VAR))
        );
        assert_eq!(
            AdminConfig::from_lookup(lookup(&[(DATABASE_PATH_VAR, "  ")])),
            Err(ConfigError::Missing(DATABASE_PATH_VAR))
        );
    }

    #[test]
    fn service_key_selects_access_level() {
        let anon = AdminConfig::from_lookup(lookup(&[(DATABASE_PATH_VAR, "tms.sqlite")])).unwrap();
        assert_eq!(anon.access, AccessLevel::Anon);
        assert_eq!(anon.storage_root, PathBuf::from("data/storage"));

        let admin = AdminConfig::from_lookup(lookup(&[
            (DATABASE_PATH_VAR, "tms.sqlite"),
            (SERVICE_ROLE_KEY_VAR, "secret"),
            (STORAGE_ROOT_VAR, "/srv/tms"),
        ]))
        .unwrap();
        assert_eq!(admin.access, AccessLevel::ServiceRole);
        assert_eq!(admin.storage_root, PathBuf::from("/srv/tms"));
    }

    #[test]
    fn app_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"max_sessions": 3, "features": {"installments": true}}"#).unwrap();
        assert_eq!(config.max_sessions, 3);
        assert!(config.features.installments);
        assert!(config.features.require_receipt);
        assert_eq!(config.database_path, PathBuf::from("data/tms.sqlite"));
    }
}

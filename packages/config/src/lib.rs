#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Runtime settings.
//!
//! Settings are assembled in layers, later layers winning:
//!
//! 1. `[default]` of the embedded `profiles/default.toml`
//! 2. `[debug]` of the embedded file (debug profile only)
//! 3. `[default]`, then `[debug]`, of an optional user file
//! 4. `TAXI_<KEY>` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use toml::{Table, Value};

/// Settings profiles embedded at compile time.
const DEFAULT_PROFILES: &str = include_str!("../profiles/default.toml");

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TAXI_";

/// Errors that can occur while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A settings document is not valid TOML.
    #[error("Failed to parse {origin}: {source}")]
    Parse {
        /// File path or `embedded`.
        origin: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A profile entry is not a table.
    #[error("[{profile}] in {origin} is not a table")]
    InvalidProfile {
        /// Profile name.
        profile: String,
        /// File path or `embedded`.
        origin: String,
    },

    /// An environment override has the wrong type for its key.
    #[error("Invalid value for {key}: {value}")]
    InvalidOverride {
        /// Environment variable name.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// The merged settings are incomplete or mistyped.
    #[error("Invalid settings: {0}")]
    Invalid(#[from] toml::de::Error),
}

/// Named settings layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Profile {
    /// Production settings.
    #[default]
    Default,
    /// Local files, in-memory queue, short timeouts.
    Debug,
}

/// Resolved settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// AWS region for S3 and SQS.
    pub region: String,
    /// Store holding normalized fixed-width files.
    pub source: String,
    /// Raw monthly CSV source for conversion.
    pub raw_source: String,
    /// Destination for converted files.
    pub bucket: String,
    /// Statistics database file. Defaults to `data/stats.duckdb`.
    pub stat_db: Option<PathBuf>,
    /// Task queue name, or `memory`.
    pub queue: String,
    /// Target records per submitted task.
    pub records_per_task: u64,
    /// Task lease timeout in seconds.
    pub task_timeout: u64,
    /// District polygons (`GeoJSON`).
    pub districts: PathBuf,
    /// Worker sleep after an empty lease, in seconds.
    pub poll_interval: u64,
    /// Longest wait of a single lease call, in seconds.
    pub lease_wait: u64,
    /// Records parsed between cancellation checks.
    pub batch_size: usize,
    /// Guard task commits with per-task markers.
    pub idempotent_commits: bool,
}

impl Settings {
    /// Loads settings for `profile`, layering `file` (if any) and the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a layer can't be read or parsed, or the
    /// merged result is invalid.
    pub fn load(profile: Profile, file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(profile, file, |key| std::env::var(key).ok())
    }

    /// Like [`Self::load`], reading overrides through `env`.
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn load_with_env(
        profile: Profile,
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut merged = Table::new();
        apply_profiles(&mut merged, DEFAULT_PROFILES, "embedded", profile)?;

        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            apply_profiles(&mut merged, &text, &path.display().to_string(), profile)?;
            log::debug!("Loaded settings from {}", path.display());
        }

        apply_env(&mut merged, env)?;

        let settings: Self = Value::Table(merged).try_into()?;
        log::debug!("Settings ({profile}): {settings:?}");
        Ok(settings)
    }

    /// Worker idle sleep.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Lease wait.
    #[must_use]
    pub const fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.lease_wait)
    }
}

fn apply_profiles(
    merged: &mut Table,
    text: &str,
    origin: &str,
    profile: Profile,
) -> Result<(), ConfigError> {
    let document: Table = toml::from_str(text).map_err(|e| ConfigError::Parse {
        origin: origin.to_string(),
        source: e,
    })?;

    let mut layers = vec![Profile::Default];
    if profile != Profile::Default {
        layers.push(profile);
    }

    for layer in layers {
        match document.get(layer.as_ref()) {
            Some(Value::Table(table)) => {
                for (key, value) in table {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Some(_) => {
                return Err(ConfigError::InvalidProfile {
                    profile: layer.to_string(),
                    origin: origin.to_string(),
                });
            }
            None => {}
        }
    }
    Ok(())
}

/// Overrides every known key from `TAXI_<KEY>`, parsed as the type the
/// key already has (string when unset).
fn apply_env(merged: &mut Table, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    let mut keys: Vec<String> = merged.keys().cloned().collect();
    if !merged.contains_key("stat_db") {
        keys.push("stat_db".to_string());
    }

    for key in keys {
        let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
        let Some(raw) = env(&var) else {
            continue;
        };
        let invalid = || ConfigError::InvalidOverride {
            key: var.clone(),
            value: raw.clone(),
        };
        let value = match merged.get(&key) {
            Some(Value::Integer(_)) => Value::Integer(raw.trim().parse().map_err(|_| invalid())?),
            Some(Value::Boolean(_)) => Value::Boolean(raw.trim().parse().map_err(|_| invalid())?),
            _ => Value::String(raw.clone()),
        };
        log::debug!("{var} overrides {key}");
        merged.insert(key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn embedded_default_profile() {
        let settings = Settings::load_with_env(Profile::Default, None, no_env).unwrap();
        assert_eq!(settings.source, "s3://aws-nyc-taxi-data");
        assert_eq!(settings.queue, "nyc-taxi-tasks");
        assert_eq!(settings.task_timeout, 3600);
        assert_eq!(settings.stat_db, None);
        assert!(!settings.idempotent_commits);
    }

    #[test]
    fn debug_profile_layers_over_default() {
        let settings = Settings::load_with_env(Profile::Debug, None, no_env).unwrap();
        assert_eq!(settings.queue, "memory");
        assert_eq!(settings.records_per_task, 10_000);
        assert_eq!(settings.region, "us-east-1");
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn debug_districts_ship_with_the_workspace() {
        let settings = Settings::load_with_env(Profile::Debug, None, no_env).unwrap();
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        assert!(settings.districts.is_relative());
        assert!(root.join(&settings.districts).is_file());
    }

    #[test]
    fn user_file_overrides_embedded() {
        let dir = std::env::temp_dir().join("taxi_config_user_file");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("taxi.toml");
        std::fs::write(
            &path,
            "[default]\nregion = \"eu-west-1\"\nstat_db = \"/tmp/s.duckdb\"\n\n[debug]\nbatch_size = 7\n",
        )
        .unwrap();

        let default = Settings::load_with_env(Profile::Default, Some(&path), no_env).unwrap();
        assert_eq!(default.region, "eu-west-1");
        assert_eq!(default.stat_db, Some(PathBuf::from("/tmp/s.duckdb")));
        assert_eq!(default.batch_size, 10_000);

        let debug = Settings::load_with_env(Profile::Debug, Some(&path), no_env).unwrap();
        assert_eq!(debug.batch_size, 7);
        assert_eq!(debug.queue, "memory");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn environment_wins() {
        let vars: HashMap<&str, &str> = [
            ("TAXI_QUEUE", "memory"),
            ("TAXI_TASK_TIMEOUT", "90"),
            ("TAXI_IDEMPOTENT_COMMITS", "true"),
            ("TAXI_STAT_DB", "stats.duckdb"),
        ]
        .into_iter()
        .collect();
        let env = |key: &str| vars.get(key).map(ToString::to_string);

        let settings = Settings::load_with_env(Profile::Default, None, env).unwrap();
        assert_eq!(settings.queue, "memory");
        assert_eq!(settings.task_timeout, 90);
        assert!(settings.idempotent_commits);
        assert_eq!(settings.stat_db, Some(PathBuf::from("stats.duckdb")));
    }

    #[test]
    fn mistyped_override_is_rejected() {
        let env = |key: &str| (key == "TAXI_BATCH_SIZE").then(|| "lots".to_string());
        let result = Settings::load_with_env(Profile::Default, None, env);
        assert!(matches!(result, Err(ConfigError::InvalidOverride { .. })));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let dir = std::env::temp_dir().join("taxi_config_unknown_key");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("taxi.toml");
        std::fs::write(&path, "[default]\nbukcet = \"s3://x\"\n").unwrap();

        let result = Settings::load_with_env(Profile::Default, Some(&path), no_env);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn profile_names() {
        assert_eq!("debug".parse::<Profile>().unwrap(), Profile::Debug);
        assert_eq!(Profile::Default.to_string(), "default");
    }
}

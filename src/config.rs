//! Environment-driven configuration.
//!
//! Everything the orchestrator needs arrives through environment variables;
//! workers inherit them from the submission host via the cluster scheduler.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

/// Expected environment variables, with the descriptions shown when any
/// required one is missing. Optional variables are marked `*`.
pub const EXPECTED_ENV: &[(&str, &str)] = &[
    ("PG_HOST", "PostgreSQL hostname"),
    ("PG_PORT", "* PostgreSQL port [5432]"),
    ("PG_DATABASE", "PostgreSQL database name"),
    ("PG_USERNAME", "PostgreSQL username"),
    ("PG_PASSWORD", "PostgreSQL password"),
    ("LSF_CONFIG", "Path to LSF cluster configuration directory"),
    ("LSF_GROUP", "LSF Fairshare group to run under"),
    ("PREP_QUEUE", "LSF queue to use for the preparation phase"),
    ("TRANSFER_QUEUE", "LSF queue to use for the transfer phase"),
    ("IRODS_BASE", "iRODS base collection for transfer targets"),
    ("MAX_ATTEMPTS", "* Maximum attempts per transfer task [3]"),
    ("SHEPHERD_LOG", "* Logging directory [pwd]"),
    ("SHEPHERD_TEAMS", "* Path to a group:team JSON mapping for Vault rewriting"),
];

fn parse_int<T: std::str::FromStr>(variable: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        variable: variable.to_string(),
        reason: format!("{value} is not an integer"),
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("incomplete environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("{variable} is not valid: {reason}")]
    Invalid { variable: String, reason: String },
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Full orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub pg: PgConfig,
    pub lsf_config: PathBuf,
    pub lsf_group: String,
    pub prep_queue: String,
    pub transfer_queue: String,
    pub irods_base: PathBuf,
    pub max_attempts: i32,
    pub log_dir: PathBuf,
    pub teams: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup, so tests need not mutate the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut vars: HashMap<&str, String> = HashMap::new();
        let mut missing = Vec::new();

        for (name, description) in EXPECTED_ENV {
            match lookup(name) {
                Some(value) => {
                    vars.insert(name, value);
                }
                None if !description.starts_with('*') => missing.push(name.to_string()),
                None => {}
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port: u16 = match vars.get("PG_PORT") {
            Some(value) => parse_int("PG_PORT", value)?,
            None => 5432,
        };

        let max_attempts: i32 = match vars.get("MAX_ATTEMPTS") {
            Some(value) => parse_int("MAX_ATTEMPTS", value)?,
            None => 3,
        };
        if max_attempts < 1 {
            return Err(ConfigError::Invalid {
                variable: "MAX_ATTEMPTS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let log_dir = vars
            .get("SHEPHERD_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Ok(Config {
            pg: PgConfig {
                host: vars.remove("PG_HOST").unwrap_or_default(),
                port,
                database: vars.remove("PG_DATABASE").unwrap_or_default(),
                username: vars.remove("PG_USERNAME").unwrap_or_default(),
                password: vars.remove("PG_PASSWORD").unwrap_or_default(),
            },
            lsf_config: vars.remove("LSF_CONFIG").map(PathBuf::from).unwrap_or_default(),
            lsf_group: vars.remove("LSF_GROUP").unwrap_or_default(),
            prep_queue: vars.remove("PREP_QUEUE").unwrap_or_default(),
            transfer_queue: vars.remove("TRANSFER_QUEUE").unwrap_or_default(),
            irods_base: vars.remove("IRODS_BASE").map(PathBuf::from).unwrap_or_default(),
            max_attempts,
            log_dir,
            teams: vars.remove("SHEPHERD_TEAMS").map(PathBuf::from),
        })
    }
}

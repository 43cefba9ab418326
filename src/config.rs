use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use discovery::TargetGroup;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relabel::{RelabelConfig, RelabelError};

const fn default_dns_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_file_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("job_name is empty")]
    EmptyJobName,

    #[error("found multiple scrape configs with job name {0:?}")]
    DuplicateJob(String),

    #[error("job {job:?}: unsupported scheme {scheme:?}, expected http or https")]
    UnsupportedScheme { job: String, scheme: String },

    #[error("job {job:?}: dns_sd_configs[{index}]: {reason}")]
    DnsSd {
        job: String,
        index: usize,
        reason: &'static str,
    },

    #[error("job {job:?}: file_sd_configs[{index}]: {reason}")]
    FileSd {
        job: String,
        index: usize,
        reason: String,
    },

    #[error("job {job:?}: relabel_configs[{index}]: {source}")]
    Relabel {
        job: String,
        index: usize,
        source: RelabelError,
    },
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum QueryType {
    #[default]
    SRV,
    A,
    AAAA,
}

/// DNS based service discovery, the names are resolved periodically.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DnsSdConfig {
    /// A list of DNS domain names to be queried
    pub names: Vec<String>,

    /// The time after which the provided names are refreshed
    #[serde(
        default = "default_dns_refresh_interval",
        with = "humanize::duration::serde"
    )]
    pub refresh_interval: Duration,

    /// The type of DNS query to perform.
    #[serde(default, rename = "type")]
    pub query_type: QueryType,

    /// The port number used if the query type is not SRV
    #[serde(default)]
    pub port: u16,
}

/// File based service discovery, files contain a list of target groups
/// in JSON or YAML.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FileSdConfig {
    /// Patterns for files from which target groups are extracted, the last
    /// path segment may contain glob patterns, e.g. `targets/*.yml`
    pub files: Vec<String>,

    #[serde(
        default = "default_file_refresh_interval",
        with = "humanize::duration::serde"
    )]
    pub refresh_interval: Duration,
}

/// The configuration of a scrape job, only the fields target discovery
/// and label resolution need.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct JobConfig {
    /// The job name, which is attached to every target as `job` label by default.
    pub job_name: String,

    /// The URL scheme with which to fetch metrics from targets.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// The HTTP resource path on which to fetch metrics from targets.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Optional HTTP URL parameters.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,

    /// Rules applied to the label set of every discovered target.
    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,

    #[serde(default)]
    pub static_configs: Vec<TargetGroup>,

    #[serde(default)]
    pub dns_sd_configs: Vec<DnsSdConfig>,

    #[serde(default)]
    pub file_sd_configs: Vec<FileSdConfig>,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            job_name: String::new(),
            scheme: default_scheme(),
            metrics_path: default_metrics_path(),
            params: BTreeMap::new(),
            relabel_configs: vec![],
            static_configs: vec![],
            dns_sd_configs: vec![],
            file_sd_configs: vec![],
        }
    }
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let job = &self.job_name;
        if job.is_empty() {
            return Err(ConfigError::EmptyJobName);
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::UnsupportedScheme {
                job: job.clone(),
                scheme: self.scheme.clone(),
            });
        }

        for (index, config) in self.relabel_configs.iter().enumerate() {
            config
                .validate()
                .map_err(|source| ConfigError::Relabel {
                    job: job.clone(),
                    index,
                    source,
                })?;
        }

        for (index, config) in self.dns_sd_configs.iter().enumerate() {
            let reason = if config.names.is_empty() {
                Some("at least one name is required")
            } else if config.query_type != QueryType::SRV && config.port == 0 {
                Some("a port is required for A and AAAA queries")
            } else if config.refresh_interval.is_zero() {
                Some("refresh_interval must be positive")
            } else {
                None
            };

            if let Some(reason) = reason {
                return Err(ConfigError::DnsSd {
                    job: job.clone(),
                    index,
                    reason,
                });
            }
        }

        for (index, config) in self.file_sd_configs.iter().enumerate() {
            let err = |reason: String| ConfigError::FileSd {
                job: job.clone(),
                index,
                reason,
            };

            if config.files.is_empty() {
                return Err(err("at least one file pattern is required".to_string()));
            }

            if config.refresh_interval.is_zero() {
                return Err(err("refresh_interval must be positive".to_string()));
            }

            for pattern in &config.files {
                if !(pattern.ends_with(".json")
                    || pattern.ends_with(".yml")
                    || pattern.ends_with(".yaml"))
                {
                    return Err(err(format!("invalid file extension of {pattern:?}")));
                }

                if let Err(pe) = glob::Pattern::new(pattern) {
                    return Err(err(format!("invalid pattern {pattern:?}, {pe}")));
                }
            }
        }

        Ok(())
    }
}

/// Validates every job, and makes sure job names are unique.
pub fn validate_jobs(jobs: &[JobConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::with_capacity(jobs.len());

    for job in jobs {
        job.validate()?;

        if !names.insert(job.job_name.as_str()) {
            return Err(ConfigError::DuplicateJob(job.job_name.clone()));
        }
    }

    Ok(())
}

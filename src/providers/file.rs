use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use discovery::{Error, Provider, TargetGroup, Updates, emit};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;

use crate::config::FileSdConfig;

/// The file the target group was read from.
pub const FILEPATH_LABEL: &str = "__meta_filepath";

#[derive(Debug, ThisError)]
enum ReadError {
    #[error("read file failed, {0}")]
    Io(#[from] std::io::Error),

    #[error("decode json failed, {0}")]
    Json(#[from] serde_json::Error),

    #[error("decode yaml failed, {0}")]
    Yaml(#[from] serde_yaml::Error),
}

async fn read_groups(path: &Path) -> Result<Vec<TargetGroup>, ReadError> {
    let data = tokio::fs::read(path).await?;

    let groups = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_slice(&data)?,
        _ => serde_yaml::from_slice(&data)?,
    };

    Ok(groups)
}

fn source(path: &Path, index: usize) -> String {
    format!("{}:{}", path.display(), index)
}

/// FileProvider reads target groups from JSON or YAML files, the file
/// patterns are expanded on every refresh.
pub struct FileProvider {
    patterns: Vec<String>,
    interval: Duration,

    /// The number of groups each file contributed in the last refresh
    last: BTreeMap<PathBuf, usize>,
}

impl FileProvider {
    pub fn new(config: &FileSdConfig) -> Self {
        FileProvider {
            patterns: config.files.clone(),
            interval: config.refresh_interval,
            last: BTreeMap::new(),
        }
    }

    fn list_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for pattern in &self.patterns {
            match glob::glob(pattern) {
                Ok(paths) => {
                    for entry in paths {
                        match entry {
                            Ok(path) => files.push(path),
                            Err(err) => {
                                warn!(message = "Failed to access path", pattern, %err);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(message = "Invalid file pattern", pattern, %err);
                }
            }
        }

        files.sort();
        files.dedup();
        files
    }

    /// Reads all files, groups which disappeared since the last refresh are
    /// returned as empty groups so their previous targets are cleared.
    async fn refresh(&mut self) -> Vec<TargetGroup> {
        let mut groups = Vec::new();
        let mut current = BTreeMap::new();

        for path in self.list_files() {
            match read_groups(&path).await {
                Ok(file_groups) => {
                    current.insert(path.clone(), file_groups.len());

                    for (index, mut group) in file_groups.into_iter().enumerate() {
                        group.source = source(&path, index);
                        group
                            .labels
                            .insert(FILEPATH_LABEL.to_string(), path.display().to_string());
                        groups.push(group);
                    }
                }
                Err(err) => {
                    warn!(message = "Failed to read target groups", path = ?path, %err);

                    // keep what the file contributed before
                    if let Some(count) = self.last.get(&path) {
                        current.insert(path, *count);
                    }
                }
            }
        }

        for (path, count) in &self.last {
            let now = current.get(path).copied().unwrap_or_default();
            for index in now..*count {
                groups.push(TargetGroup {
                    source: source(path, index),
                    ..Default::default()
                });
            }
        }

        self.last = current;
        groups
    }
}

#[async_trait::async_trait]
impl Provider for FileProvider {
    async fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
        updates: Updates,
    ) -> Result<(), Error> {
        let mut provider = self;
        let mut ticker = tokio::time::interval(provider.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let groups = provider.refresh().await;
            if !emit(&updates, &shutdown, groups).await {
                break;
            }
        }

        Ok(())
    }
}

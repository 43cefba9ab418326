use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, JobConfig, validate_jobs};
use crate::providers::ProviderRegistry;
use crate::target::Target;
use crate::target_set::TargetSet;

/// TargetManager owns the target sets of all scrape jobs and applies
/// configuration reloads to them.
pub struct TargetManager<S> {
    storage: S,
    registry: ProviderRegistry,
    shutdown: CancellationToken,

    sets: Mutex<BTreeMap<String, Arc<TargetSet<S>>>>,
}

impl<S: Clone> TargetManager<S> {
    pub fn new(storage: S, registry: ProviderRegistry) -> Self {
        TargetManager {
            storage,
            registry,
            shutdown: CancellationToken::new(),
            sets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Applies a new list of jobs. Nothing changes if any job is invalid.
    ///
    /// Sets of jobs which persist are reused and get their providers
    /// restarted, sets of removed jobs are stopped. It returns once every
    /// set has finished its initial synchronization. Until then a reused
    /// set keeps serving its old targets under its old config.
    pub async fn apply_config(&self, jobs: Vec<JobConfig>) -> Result<(), ConfigError> {
        validate_jobs(&jobs)?;

        let mut pending = Vec::with_capacity(jobs.len());
        for job in jobs {
            let providers = self.registry.providers(&job)?;
            pending.push((job, providers));
        }

        let runs = {
            let mut sets = self.sets.lock();
            let mut next = BTreeMap::new();

            let runs = pending
                .into_iter()
                .map(|(job, providers)| {
                    let name = job.job_name.clone();
                    // a reused set switches config together with its groups
                    let (set, config) = match sets.remove(&name) {
                        Some(set) => (set, Some(job)),
                        None => {
                            debug!(message = "Creating target set", job = name);
                            (Arc::new(TargetSet::new(job, self.storage.clone())), None)
                        }
                    };

                    next.insert(name, Arc::clone(&set));
                    (set, config, providers)
                })
                .collect::<Vec<_>>();

            for (name, set) in std::mem::replace(&mut *sets, next) {
                info!(message = "Stopping target set of removed job", job = name);
                set.stop();
            }

            runs
        };

        join_all(runs.into_iter().map(|(set, config, providers)| async move {
            match config {
                Some(config) => set.reload_and_run(&self.shutdown, config, providers).await,
                None => set.run_providers(&self.shutdown, providers).await,
            }
        }))
        .await;

        Ok(())
    }

    pub fn target_set(&self, job: &str) -> Option<Arc<TargetSet<S>>> {
        self.sets.lock().get(job).cloned()
    }

    /// Resolved targets of every job, keyed by job name.
    pub fn targets(&self) -> BTreeMap<String, Vec<Target>> {
        let sets = self.sets.lock().clone();

        sets.into_iter()
            .map(|(name, set)| (name, set.targets()))
            .collect()
    }

    /// Stops the providers of every job.
    pub fn stop(&self) {
        self.shutdown.cancel();

        for set in self.sets.lock().values() {
            set.stop();
        }
    }
}

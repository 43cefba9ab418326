use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use discovery::TargetGroup;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::JobConfig;
use crate::providers::Providers;
use crate::target::{Target, targets_from_group};

/// How long `run_providers` waits for the first update of every provider.
const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The mapping from source key to the latest group, and the config its
/// targets are resolved with. `generation` identifies the run which owns
/// it, so a cancelled run can never write into it again.
struct State {
    generation: u64,
    config: Arc<JobConfig>,
    groups: BTreeMap<String, TargetGroup>,
}

#[derive(Default)]
struct Run {
    generation: u64,
    token: Option<CancellationToken>,
}

/// An update of the provider at `index`, `None` once the provider exits.
type Update = (usize, Option<Vec<TargetGroup>>);

/// TargetSet manages the target groups of one scrape job. It runs the
/// job's providers and keeps the latest group of every source key.
///
/// Every call of `run_providers` starts from scratch, groups of the
/// previous run are never carried over.
pub struct TargetSet<S> {
    storage: S,

    state: Arc<Mutex<State>>,
    run: Mutex<Run>,

    initial_timeout: Duration,
}

impl<S> TargetSet<S> {
    /// Creates a target set with no groups, nothing is started.
    pub fn new(config: JobConfig, storage: S) -> Self {
        TargetSet {
            storage,
            state: Arc::new(Mutex::new(State {
                generation: 0,
                config: Arc::new(config),
                groups: BTreeMap::new(),
            })),
            run: Mutex::new(Run::default()),
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
        }
    }

    pub fn with_initial_timeout(mut self, timeout: Duration) -> Self {
        self.initial_timeout = timeout;
        self
    }

    #[inline]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> Arc<JobConfig> {
        Arc::clone(&self.state.lock().config)
    }

    /// Replaces the job config, it takes effect on targets immediately and
    /// on groups when `run_providers` is called again. Use `reload_and_run`
    /// to switch both at once.
    pub fn reload(&self, config: JobConfig) {
        self.state.lock().config = Arc::new(config);
    }

    /// A consistent snapshot of the current groups, keyed by source key.
    pub fn groups(&self) -> BTreeMap<String, TargetGroup> {
        self.state.lock().groups.clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().groups.contains_key(key)
    }

    /// Resolves every group of the current snapshot into targets, ordered by
    /// source key, then by their position in the group.
    pub fn targets(&self) -> Vec<Target> {
        let (config, groups) = {
            let state = self.state.lock();
            (Arc::clone(&state.config), state.groups.clone())
        };

        groups
            .values()
            .flat_map(|group| targets_from_group(group, &config))
            .collect()
    }

    /// Stops all running providers, the groups stay as they are.
    pub fn stop(&self) {
        if let Some(token) = self.run.lock().token.take() {
            token.cancel();
        }
    }

    /// Runs `providers` until `shutdown` is cancelled or the next call of
    /// this method, whichever comes first. Providers of the previous run are
    /// stopped first.
    ///
    /// It returns once every provider has sent its first update, exited, or
    /// the initial timeout elapsed. At that point the groups are replaced
    /// by exactly what the providers have sent so far, later updates are
    /// applied as they arrive.
    pub async fn run_providers(&self, shutdown: &CancellationToken, providers: Providers) {
        self.run(shutdown, None, providers).await
    }

    /// Like `run_providers`, but `config` replaces the current config
    /// together with the groups at the initial synchronization point. Until
    /// then targets are still resolved from the old groups with the old
    /// config.
    pub async fn reload_and_run(
        &self,
        shutdown: &CancellationToken,
        config: JobConfig,
        providers: Providers,
    ) {
        self.run(shutdown, Some(Arc::new(config)), providers).await
    }

    async fn run(
        &self,
        shutdown: &CancellationToken,
        config: Option<Arc<JobConfig>>,
        providers: Providers,
    ) {
        let token = shutdown.child_token();
        let generation = {
            let mut run = self.run.lock();
            if let Some(previous) = run.token.replace(token.clone()) {
                previous.cancel();
            }

            run.generation += 1;
            run.generation
        };

        let job = match &config {
            Some(config) => config.job_name.clone(),
            None => self.config().job_name.clone(),
        };
        let mut prefixes = Vec::with_capacity(providers.len());
        let mut streams = Vec::with_capacity(providers.len());
        for (index, (prefix, provider)) in providers.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(1);

            let shutdown = token.clone();
            let job = job.clone();
            let key = prefix.clone();
            tokio::spawn(async move {
                if let Err(err) = provider.run(shutdown, tx).await {
                    error!(message = "Discovery provider exited", job, provider = key, %err);
                }
            });

            streams.push(
                ReceiverStream::new(rx)
                    .map(Some)
                    .chain(stream::once(futures::future::ready(None)))
                    .map(move |update| (index, update)),
            );
            prefixes.push(prefix);
        }

        info!(message = "Starting discovery providers", job, providers = prefixes.len());

        let (synced_tx, synced_rx) = oneshot::channel();
        let reconciler = Reconciler {
            job,
            generation,
            config,
            prefixes,
            state: Arc::clone(&self.state),
            token: token.clone(),
        };
        tokio::spawn(reconciler.run(
            stream::select_all(streams),
            self.initial_timeout,
            synced_tx,
        ));

        tokio::select! {
            _ = synced_rx => {},
            _ = token.cancelled() => {},
        }
    }
}

impl<S> Drop for TargetSet<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The only writer of the groups during one run.
struct Reconciler {
    job: String,
    generation: u64,
    /// Installed together with the initial groups
    config: Option<Arc<JobConfig>>,
    /// Source key prefix of each provider, e.g. `dns/0`
    prefixes: Vec<String>,
    state: Arc<Mutex<State>>,
    token: CancellationToken,
}

impl Reconciler {
    async fn run<U>(self, mut updates: U, initial_timeout: Duration, synced: oneshot::Sender<()>)
    where
        U: Stream<Item = Update> + Unpin,
    {
        // the initial groups are collected aside, and swapped in at once
        let mut initial = BTreeMap::new();
        let mut pending = vec![true; self.prefixes.len()];
        let mut remaining = self.prefixes.len();

        let deadline = tokio::time::sleep(initial_timeout);
        tokio::pin!(deadline);

        while remaining > 0 {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => return,
                _ = &mut deadline => {
                    warn!(
                        message = "Initial target groups not received in time",
                        job = self.job,
                        pending = remaining,
                        timeout = ?initial_timeout,
                    );
                    break;
                }
                update = updates.next() => match update {
                    Some((index, update)) => {
                        self.apply(&mut initial, index, update);

                        if std::mem::replace(&mut pending[index], false) {
                            remaining -= 1;
                        }
                    }
                    None => break,
                }
            }
        }

        {
            let mut state = self.state.lock();
            if self.token.is_cancelled() || state.generation > self.generation {
                return;
            }

            debug!(
                message = "Target groups synchronized",
                job = self.job,
                groups = initial.len()
            );

            state.generation = self.generation;
            state.groups = initial;
            if let Some(config) = &self.config {
                state.config = Arc::clone(config);
            }
        }
        let _ = synced.send(());

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,
                update = updates.next() => match update {
                    Some((index, update)) => {
                        let mut state = self.state.lock();
                        if state.generation != self.generation {
                            break;
                        }

                        self.apply(&mut state.groups, index, update);
                    }
                    None => break,
                }
            }
        }

        debug!(message = "Reconciliation stopped", job = self.job);
    }

    /// Overwrites the groups of an update, or removes all groups of the
    /// provider once it has exited.
    fn apply(
        &self,
        groups: &mut BTreeMap<String, TargetGroup>,
        index: usize,
        update: Option<Vec<TargetGroup>>,
    ) {
        let prefix = &self.prefixes[index];

        match update {
            Some(batch) => {
                for group in batch {
                    groups.insert(format!("{prefix}/{}", group.source), group);
                }
            }
            None => {
                let start = format!("{prefix}/");
                groups.retain(|key, _group| !key.starts_with(&start));
            }
        }
    }
}

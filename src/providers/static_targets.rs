use discovery::{Error, Provider, TargetGroup, Updates, emit};
use tokio_util::sync::CancellationToken;

/// StaticProvider holds a list of target groups that never change.
pub struct StaticProvider {
    groups: Vec<TargetGroup>,
}

impl StaticProvider {
    /// Groups are identified by their position in the config.
    pub fn new(groups: Vec<TargetGroup>) -> Self {
        let groups = groups
            .into_iter()
            .enumerate()
            .map(|(index, mut group)| {
                group.source = index.to_string();
                group
            })
            .collect();

        StaticProvider { groups }
    }
}

#[async_trait::async_trait]
impl Provider for StaticProvider {
    async fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
        updates: Updates,
    ) -> Result<(), Error> {
        if emit(&updates, &shutdown, self.groups).await {
            // keep running, so the groups are not treated as gone
            shutdown.cancelled().await;
        }

        Ok(())
    }
}

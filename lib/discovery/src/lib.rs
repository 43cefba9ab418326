use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An unordered set of labels, names are unique.
pub type LabelSet = BTreeMap<String, String>;

/// The host:port the target is scraped from.
pub const ADDRESS_LABEL: &str = "__address__";
/// The protocol scheme used for scraping, `http` or `https`.
pub const SCHEME_LABEL: &str = "__scheme__";
/// The HTTP path of the metrics endpoint.
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

/// Labels starting with this prefix are only visible during relabeling,
/// and never attached to a target.
pub const META_LABEL_PREFIX: &str = "__meta_";
/// URL parameters of the scrape request, e.g. `__param_module`.
pub const PARAM_LABEL_PREFIX: &str = "__param_";
/// Labels with this prefix are used internally.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// TargetGroup is a set of targets with a common labels
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetGroup {
    /// `targets` is a list of targets identified by a label set. Each target
    /// is uniquely identifiable in the group by its `__address__` label
    pub targets: Vec<LabelSet>,

    /// `labels` is a set of labels that is common across all targets in the group
    pub labels: LabelSet,

    /// An identifier that describes a group of targets, unique within
    /// the provider which emitted it.
    pub source: String,
}

impl TargetGroup {
    /// Build a group from plain addresses.
    pub fn from_addresses<I, T>(source: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let targets = addresses
            .into_iter()
            .map(|address| LabelSet::from([(ADDRESS_LABEL.to_string(), address.into())]))
            .collect();

        TargetGroup {
            targets,
            labels: LabelSet::new(),
            source: source.into(),
        }
    }
}

/// The form a group takes in static configs and service discovery files.
#[derive(Deserialize, Serialize)]
struct RawTargetGroup {
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    labels: LabelSet,
}

impl<'de> Deserialize<'de> for TargetGroup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTargetGroup::deserialize(deserializer)?;

        let mut targets = Vec::with_capacity(raw.targets.len());
        for target in raw.targets {
            if target.contains('/') {
                return Err(serde::de::Error::custom(format!(
                    "{target:?} is not a valid hostname"
                )));
            }

            targets.push(LabelSet::from([(ADDRESS_LABEL.to_string(), target)]));
        }

        Ok(TargetGroup {
            targets,
            labels: raw.labels,
            source: String::new(),
        })
    }
}

impl Serialize for TargetGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawTargetGroup {
            targets: self
                .targets
                .iter()
                .filter_map(|target| target.get(ADDRESS_LABEL).cloned())
                .collect(),
            labels: self.labels.clone(),
        }
        .serialize(serializer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The provider cannot continue, e.g. misconfiguration found at runtime
    #[error("{0}")]
    Fatal(String),
}

/// The channel every provider emits its target groups into.
pub type Updates = mpsc::Sender<Vec<TargetGroup>>;

/// Provider provides information about target groups. It maintains a set of
/// sources from which TargetGroup can originate.
///
/// `Provider` does not know if an actual change happened. It does guarantee
/// that it sends the new TargetGroup whenever a change happens, and it sends
/// its current knowledge once right after start, even if it is empty.
///
/// A provider runs until `shutdown` is cancelled, or the receiving side of
/// `updates` is gone.
#[async_trait::async_trait]
pub trait Provider: Send {
    async fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
        updates: Updates,
    ) -> Result<(), Error>;
}

/// Hands `groups` to the consumer, returns false if the provider should stop.
pub async fn emit(
    updates: &Updates,
    shutdown: &CancellationToken,
    groups: Vec<TargetGroup>,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        result = updates.send(groups) => result.is_ok(),
    }
}

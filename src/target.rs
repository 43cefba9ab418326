use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use discovery::{
    ADDRESS_LABEL, INSTANCE_LABEL, JOB_LABEL, LabelSet, META_LABEL_PREFIX, METRICS_PATH_LABEL,
    PARAM_LABEL_PREFIX, RESERVED_LABEL_PREFIX, SCHEME_LABEL, TargetGroup,
};
use thiserror::Error;
use url::Url;

use crate::config::JobConfig;
use crate::relabel;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("no address")]
    MissingAddress,

    #[error("{0:?} is not a valid hostname")]
    InvalidAddress(String),
}

/// Target refers to a singular HTTP or HTTPS endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Labels before any processing.
    discovered_labels: LabelSet,
    /// Any labels that are added to this target and its metrics.
    labels: LabelSet,
    /// Additional URL parameters that are part of the target URL.
    params: BTreeMap<String, Vec<String>>,
}

impl Target {
    pub fn new(
        labels: LabelSet,
        discovered_labels: LabelSet,
        params: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Target {
            discovered_labels,
            labels,
            params,
        }
    }

    /// The public labels of the target, reserved labels are excluded.
    pub fn labels(&self) -> LabelSet {
        self.labels
            .iter()
            .filter(|(name, _)| !name.starts_with(RESERVED_LABEL_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    #[inline]
    pub fn all_labels(&self) -> &LabelSet {
        &self.labels
    }

    /// The label set before relabeling was applied.
    #[inline]
    pub fn discovered_labels(&self) -> &LabelSet {
        &self.discovered_labels
    }

    pub fn address(&self) -> &str {
        self.labels
            .get(ADDRESS_LABEL)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn instance(&self) -> &str {
        self.labels
            .get(INSTANCE_LABEL)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// The URL to scrape, `__param_*` labels take precedence over the
    /// configured params.
    pub fn url(&self) -> Result<Url, url::ParseError> {
        let mut params = self.params.clone();
        for (name, value) in &self.labels {
            let Some(key) = name.strip_prefix(PARAM_LABEL_PREFIX) else {
                continue;
            };

            let values = params.entry(key.to_string()).or_default();
            match values.first_mut() {
                Some(first) => first.clone_from(value),
                None => values.push(value.clone()),
            }
        }

        let scheme = self.labels.get(SCHEME_LABEL).map(String::as_str);
        let mut url = Url::parse(&format!(
            "{}://{}",
            scheme.unwrap_or("http"),
            self.address()
        ))?;

        if let Some(path) = self.labels.get(METRICS_PATH_LABEL) {
            url.set_path(path);
        }

        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, values) in &params {
                for value in values {
                    pairs.append_pair(key, value);
                }
            }
        }

        Ok(url)
    }
}

/// Appends the default port of `scheme` if `address` has none, IPv6
/// literals are bracketed first.
fn with_default_port(address: &str, scheme: &str) -> String {
    let port = if scheme == "https" { 443 } else { 80 };

    if let Some(rest) = address.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((_host, "")) => format!("{address}:{port}"),
            _ => address.to_string(),
        };
    }

    // the zone of a scoped literal, e.g. `fe80::1%eth0`, stays inside the brackets
    let host = address.split_once('%').map_or(address, |(host, _zone)| host);
    if host.parse::<Ipv6Addr>().is_ok() {
        return format!("[{address}]:{port}");
    }

    if address.contains(':') {
        return address.to_string();
    }

    format!("{address}:{port}")
}

fn non_empty<'a>(labels: &'a LabelSet, name: &str) -> Option<&'a String> {
    labels.get(name).filter(|value| !value.is_empty())
}

/// Builds the label set of a target from the discovered labels and the job
/// config. The first returned set is the final label set, the second is the
/// label set before relabeling. `Ok(None)` means the target was dropped by
/// relabeling.
pub fn populate_labels(
    mut labels: LabelSet,
    config: &JobConfig,
) -> Result<Option<(LabelSet, LabelSet)>, ResolveError> {
    if non_empty(&labels, ADDRESS_LABEL).is_none() {
        return Err(ResolveError::MissingAddress);
    }

    // explicit labels are never overwritten by the job's defaults
    for (name, value) in [
        (SCHEME_LABEL, &config.scheme),
        (METRICS_PATH_LABEL, &config.metrics_path),
        (JOB_LABEL, &config.job_name),
    ] {
        labels
            .entry(name.to_string())
            .or_insert_with(|| value.clone());
    }

    for (name, values) in &config.params {
        if let Some(first) = values.first() {
            labels
                .entry(format!("{PARAM_LABEL_PREFIX}{name}"))
                .or_insert_with(|| first.clone());
        }
    }

    let mut original = labels.clone();
    original.retain(|_name, value| !value.is_empty());

    let Some(mut labels) = relabel::process(labels, &config.relabel_configs) else {
        return Ok(None);
    };

    let address = non_empty(&labels, ADDRESS_LABEL).ok_or(ResolveError::MissingAddress)?;
    let scheme = labels
        .get(SCHEME_LABEL)
        .map(String::as_str)
        .unwrap_or_default();
    let address = with_default_port(address, scheme);
    if address.contains('/') {
        return Err(ResolveError::InvalidAddress(address));
    }

    // meta labels are only visible to relabeling
    labels.retain(|name, value| !name.starts_with(META_LABEL_PREFIX) && !value.is_empty());

    if non_empty(&labels, INSTANCE_LABEL).is_none() {
        labels.insert(INSTANCE_LABEL.to_string(), address.clone());
    }
    labels.insert(ADDRESS_LABEL.to_string(), address);

    Ok(Some((labels, original)))
}

/// Resolves every endpoint of the group. Endpoints which cannot be resolved
/// are logged and skipped, they never affect their siblings.
pub fn targets_from_group(group: &TargetGroup, config: &JobConfig) -> Vec<Target> {
    let mut targets = Vec::with_capacity(group.targets.len());

    for (index, endpoint) in group.targets.iter().enumerate() {
        let mut labels = endpoint.clone();
        for (name, value) in &group.labels {
            labels
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        match populate_labels(labels, config) {
            Ok(Some((labels, original))) => {
                targets.push(Target::new(labels, original, config.params.clone()))
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    message = "Failed to resolve target",
                    job = config.job_name,
                    group = group.source,
                    index,
                    %err
                );
            }
        }
    }

    targets
}

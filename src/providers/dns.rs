use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use discovery::{ADDRESS_LABEL, Error, LabelSet, Provider, TargetGroup, Updates, emit};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use tokio_util::sync::CancellationToken;

use crate::config::{DnsSdConfig, QueryType};

/// The name the target was discovered from.
pub const DNS_NAME_LABEL: &str = "__meta_dns_name";

/// Lookup resolves a name to a list of `host:port` addresses.
#[async_trait::async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(
        &self,
        name: &str,
        query_type: QueryType,
        port: u16,
    ) -> crate::Result<Vec<String>>;
}

/// Lookup backed by the resolver configured for this host, e.g. `/etc/resolv.conf`
pub struct SystemResolver(TokioAsyncResolver);

impl SystemResolver {
    pub fn from_system_conf() -> crate::Result<SystemResolver> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

        Ok(SystemResolver(resolver))
    }
}

fn srv_address(target: &str, port: u16) -> String {
    format!("{}:{}", target.trim_end_matches('.'), port)
}

fn ip_address(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}

/// A name without records resolved fine, its group is empty now.
fn records_or_empty(result: Result<Vec<String>, ResolveError>) -> crate::Result<Vec<String>> {
    match result {
        Ok(addresses) => Ok(addresses),
        Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(vec![]),
        Err(err) => Err(err.into()),
    }
}

#[async_trait::async_trait]
impl Lookup for SystemResolver {
    async fn lookup(
        &self,
        name: &str,
        query_type: QueryType,
        port: u16,
    ) -> crate::Result<Vec<String>> {
        let result: Result<Vec<String>, ResolveError> = match query_type {
            QueryType::SRV => self.0.srv_lookup(name).await.map(|lookup| {
                lookup
                    .iter()
                    .map(|srv| srv_address(&srv.target().to_utf8(), srv.port()))
                    .collect()
            }),
            QueryType::A => self.0.ipv4_lookup(name).await.map(|lookup| {
                lookup
                    .iter()
                    .map(|record| ip_address(IpAddr::V4(record.0), port))
                    .collect()
            }),
            QueryType::AAAA => self.0.ipv6_lookup(name).await.map(|lookup| {
                lookup
                    .iter()
                    .map(|record| ip_address(IpAddr::V6(record.0), port))
                    .collect()
            }),
        };

        records_or_empty(result)
    }
}

/// DnsProvider periodically resolves the configured names, every name
/// produces one target group whose source is the name itself.
pub struct DnsProvider {
    names: Vec<String>,
    interval: Duration,
    query_type: QueryType,
    port: u16,
    resolver: Arc<dyn Lookup>,
}

impl DnsProvider {
    pub fn new(config: &DnsSdConfig, resolver: Arc<dyn Lookup>) -> Self {
        DnsProvider {
            names: config.names.clone(),
            interval: config.refresh_interval,
            query_type: config.query_type,
            port: config.port,
            resolver,
        }
    }

    /// Names failed to resolve are skipped, so their previous groups stay.
    async fn refresh(&self) -> Vec<TargetGroup> {
        let results = futures::future::join_all(self.names.iter().map(|name| async move {
            let result = self.resolver.lookup(name, self.query_type, self.port).await;
            (name, result)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(addresses) => {
                    let targets = addresses
                        .into_iter()
                        .map(|address| {
                            LabelSet::from([
                                (ADDRESS_LABEL.to_string(), address),
                                (DNS_NAME_LABEL.to_string(), name.clone()),
                            ])
                        })
                        .collect();

                    Some(TargetGroup {
                        targets,
                        labels: LabelSet::new(),
                        source: name.clone(),
                    })
                }
                Err(err) => {
                    warn!(
                        message = "Failed to lookup DNS records",
                        name,
                        query_type = ?self.query_type,
                        %err
                    );
                    None
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Provider for DnsProvider {
    async fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
        updates: Updates,
    ) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(self.interval);
        let mut first = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let groups = tokio::select! {
                _ = shutdown.cancelled() => break,
                groups = self.refresh() => groups,
            };

            // the first update is sent even if empty, so the target set
            // does not wait for this provider
            if groups.is_empty() && !first {
                continue;
            }
            first = false;

            if !emit(&updates, &shutdown, groups).await {
                break;
            }
        }

        Ok(())
    }
}

pub mod dns;
pub mod file;
pub mod static_targets;

use std::sync::Arc;

use discovery::Provider;

use crate::config::{ConfigError, JobConfig};
use dns::{DnsProvider, Lookup, SystemResolver};
use file::FileProvider;
use static_targets::StaticProvider;

/// Providers of one job, each paired with the prefix of its source keys,
/// e.g. `dns/0`.
pub type Providers = Vec<(String, Box<dyn Provider>)>;

/// ProviderRegistry builds the providers a job config asks for. Building
/// has no side effects, nothing runs until the providers are handed to a
/// target set.
#[derive(Clone)]
pub struct ProviderRegistry {
    resolver: Arc<dyn Lookup>,
}

impl ProviderRegistry {
    pub fn new(resolver: Arc<dyn Lookup>) -> Self {
        ProviderRegistry { resolver }
    }

    /// A registry whose DNS providers use the system resolver config.
    pub fn from_system_conf() -> crate::Result<Self> {
        let resolver = SystemResolver::from_system_conf()?;

        Ok(ProviderRegistry::new(Arc::new(resolver)))
    }

    pub fn providers(&self, config: &JobConfig) -> Result<Providers, ConfigError> {
        config.validate()?;

        let mut providers: Providers = Vec::with_capacity(
            config.dns_sd_configs.len() + config.file_sd_configs.len() + 1,
        );

        for (index, dns) in config.dns_sd_configs.iter().enumerate() {
            providers.push((
                format!("dns/{index}"),
                Box::new(DnsProvider::new(dns, Arc::clone(&self.resolver))),
            ));
        }

        for (index, file) in config.file_sd_configs.iter().enumerate() {
            providers.push((format!("file/{index}"), Box::new(FileProvider::new(file))));
        }

        // all static groups share one provider
        if !config.static_configs.is_empty() {
            providers.push((
                "static/0".to_string(),
                Box::new(StaticProvider::new(config.static_configs.clone())),
            ));
        }

        Ok(providers)
    }
}

#![allow(dead_code)]

mod trace;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use scrape_targets::config::{JobConfig, QueryType};
use scrape_targets::providers::ProviderRegistry;
use scrape_targets::providers::dns::Lookup;
pub use trace::trace_init;

/// A resolver whose answers can be changed while providers are running.
/// Unknown names fail to resolve.
#[derive(Clone, Default)]
pub struct MockLookup {
    answers: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl MockLookup {
    pub fn set(&self, name: &str, addresses: &[&str]) {
        self.answers.write().insert(
            name.to_string(),
            addresses.iter().map(|addr| addr.to_string()).collect(),
        );
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl Lookup for MockLookup {
    async fn lookup(
        &self,
        name: &str,
        _query_type: QueryType,
        _port: u16,
    ) -> scrape_targets::Result<Vec<String>> {
        self.answers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| format!("no such host {name}").into())
    }
}

pub fn job(text: &str) -> JobConfig {
    serde_yaml::from_str(text).expect("valid job config")
}

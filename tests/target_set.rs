mod util;

use pretty_assertions::assert_eq;
use scrape_targets::{LabelSet, TargetManager, TargetSet};
use tokio_util::sync::CancellationToken;
use util::{MockLookup, job, trace_init};

fn labels<const N: usize>(pairs: [(&str, &str); N]) -> LabelSet {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn target_set_recreates_groups_on_reload() {
    trace_init();

    let lookup = MockLookup::default();
    lookup.set("srv.name.one.example.org", &["one.example.org:9100"]);
    lookup.set("srv.name.two.example.org", &["two.example.org:9100"]);
    let registry = lookup.registry();

    let shutdown = CancellationToken::new();
    let config = job(
        r#"
job_name: foo
dns_sd_configs:
- names:
  - srv.name.one.example.org
"#,
    );

    let set = TargetSet::new(config.clone(), ());
    set.run_providers(&shutdown, registry.providers(&config).unwrap())
        .await;
    assert!(set.contains("dns/0/srv.name.one.example.org"));

    let config = job(
        r#"
job_name: foo
dns_sd_configs:
- names:
  - srv.name.two.example.org
"#,
    );
    set.reload(config.clone());
    set.run_providers(&shutdown, registry.providers(&config).unwrap())
        .await;

    assert!(!set.contains("dns/0/srv.name.one.example.org"));
    assert!(set.contains("dns/0/srv.name.two.example.org"));

    shutdown.cancel();
}

#[tokio::test]
async fn target_set_resolves_all_backends() {
    let lookup = MockLookup::default();
    lookup.set("_node._tcp.example.org", &["node1:9100", "node2:9100"]);

    let config = job(
        r#"
job_name: node
metrics_path: /probe
params:
  module: [icmp]
static_configs:
- targets: ["localhost"]
  labels:
    env: dev
dns_sd_configs:
- names: ["_node._tcp.example.org", "unknown.example.org"]
relabel_configs:
- source_labels: [__meta_dns_name]
  regex: _(.+)\._tcp\..*
  target_label: service
- source_labels: [env]
  regex: staging
  action: drop
"#,
    );

    let shutdown = CancellationToken::new();
    let set = TargetSet::new(config.clone(), ());
    set.run_providers(&shutdown, lookup.registry().providers(&config).unwrap())
        .await;

    let keys = set.groups().into_keys().collect::<Vec<_>>();
    assert_eq!(keys, vec!["dns/0/_node._tcp.example.org", "static/0/0"]);

    let targets = set.targets();
    assert_eq!(targets.len(), 3);

    assert_eq!(
        targets[0].labels(),
        labels([
            ("instance", "node1:9100"),
            ("job", "node"),
            ("service", "node"),
        ])
    );
    assert_eq!(
        targets[1].url().unwrap().as_str(),
        "http://node2:9100/probe?module=icmp"
    );
    assert_eq!(
        targets[2].labels(),
        labels([("env", "dev"), ("instance", "localhost:80"), ("job", "node")])
    );
    assert_eq!(
        targets[2].discovered_labels().get("__address__").unwrap(),
        "localhost"
    );

    shutdown.cancel();
}

#[tokio::test]
async fn manager_applies_reloads() {
    trace_init();

    let lookup = MockLookup::default();
    lookup.set("db.example.org", &["db1:9187"]);
    let manager = TargetManager::new((), lookup.registry());

    let web = job(
        r#"
job_name: web
static_configs:
- targets: ["web1:8080", "web2:8080"]
"#,
    );
    let db = job(
        r#"
job_name: db
dns_sd_configs:
- names: ["db.example.org"]
"#,
    );

    manager
        .apply_config(vec![web.clone(), db])
        .await
        .unwrap();

    let targets = manager.targets();
    assert_eq!(targets.keys().collect::<Vec<_>>(), vec!["db", "web"]);
    assert_eq!(targets["db"][0].address(), "db1:9187");
    assert_eq!(targets["web"].len(), 2);

    let web_set = manager.target_set("web").unwrap();

    // an invalid job rejects the whole reload
    let invalid = job(
        r#"
job_name: broken
scheme: ftp
"#,
    );
    assert!(manager.apply_config(vec![web.clone(), invalid]).await.is_err());
    assert!(manager.target_set("db").is_some());

    let web = job(
        r#"
job_name: web
static_configs:
- targets: ["web3:8080"]
"#,
    );
    manager.apply_config(vec![web]).await.unwrap();

    assert!(manager.target_set("db").is_none());
    let reused = manager.target_set("web").unwrap();
    assert!(std::sync::Arc::ptr_eq(&web_set, &reused));

    let targets = manager.targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets["web"].len(), 1);
    assert_eq!(targets["web"][0].instance(), "web3:8080");

    manager.stop();
}

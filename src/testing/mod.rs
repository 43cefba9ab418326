use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distr::Alphanumeric;

pub fn trace_init() {
    let levels = std::env::var("TEST_LOG").unwrap_or_else(|_| "warn".into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(levels))
        .with_test_writer()
        .try_init();
}

/// Creates an empty directory under the system temp dir
pub fn temp_dir() -> PathBuf {
    let name = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect::<String>();

    let path = std::env::temp_dir().join(name);
    std::fs::create_dir_all(&path).expect("create temp dir");
    path
}

/// Polls `f` until it returns true, panics after 5s.
pub async fn wait_for<F>(mut f: F)
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    let mut delay = 5;

    while !f() {
        tokio::time::sleep(Duration::from_millis(delay)).await;

        if started.elapsed() > Duration::from_secs(5) {
            panic!("Timed out while waiting");
        }

        // quadratic backoff up to a maximum delay
        delay = (2 * delay).min(500);
    }
}

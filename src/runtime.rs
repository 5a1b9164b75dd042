//! Event-loop worker pool shared by a server or sender.
//!
//! Each lifecycle object owns one multi-threaded tokio runtime sized by
//! `worker_threads`. Connections are tasks on that runtime, never threads
//! of their own.

use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};

use crate::config::FlowConfig;
use crate::error::Result;

/// Build the worker pool for `config`.
pub fn build_runtime(config: &FlowConfig) -> Result<Runtime> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name(format!("{}-worker", config.thread_name_prefix))
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Block the calling thread until `condition` holds or `timeout` elapses.
///
/// Checks every `interval`. Returns whether the condition was met.
pub fn block_until<F>(interval: Duration, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();

    loop {
        if condition() {
            return true;
        }

        if start.elapsed() >= timeout {
            return false;
        }

        std::thread::sleep(interval);
    }
}

/// Shut a runtime down, giving its tasks up to `drain_timeout`.
pub fn shutdown_runtime(runtime: Runtime, drain_timeout: Duration) {
    runtime.shutdown_timeout(drain_timeout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runtime_thread_names() {
        let config = FlowConfig::builder()
            .worker_threads(1)
            .thread_name_prefix("probe")
            .build()
            .unwrap();
        let runtime = build_runtime(&config).unwrap();

        let name = runtime
            .block_on(async {
                tokio::spawn(async { std::thread::current().name().map(str::to_string) })
                    .await
                    .unwrap()
            })
            .unwrap();
        assert_eq!(name, "probe-worker");

        shutdown_runtime(runtime, Duration::from_millis(100));
    }

    #[test]
    fn test_block_until() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let met = block_until(Duration::from_millis(1), Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst) >= 3
        });
        assert!(met);
        assert!(counter.load(Ordering::SeqCst) >= 4);

        assert!(!block_until(Duration::from_millis(1), Duration::from_millis(5), || false));
    }
}

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use actor_runtime::{GroupConfig, Scheduler, SchedulerConfig, SchedulerGroup, SchedulerId};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-writer subscriber once; `RUST_LOG` picks the level.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// One group of `count` schedulers with `cpu_threads` workers each.
pub fn group(count: usize, cpu_threads: usize) -> SchedulerGroup {
    let config = SchedulerConfig::default()
        .with_cpu_threads(cpu_threads)
        .with_thread_name_prefix("test");
    SchedulerGroup::new(GroupConfig::uniform(count, config)).expect("valid group config")
}

/// Claims and starts scheduler `id`.
pub fn start(group: &SchedulerGroup, id: u8) -> Scheduler {
    let mut scheduler = Scheduler::new(group, SchedulerId::new(id)).expect("scheduler id free");
    scheduler.start().expect("spawn cpu workers");
    scheduler
}

/// Drives the IO loop until it reports the group stopping.
///
/// # Panics
///
/// Panics if that does not happen within `limit`.
pub fn run_until_stopped(scheduler: &mut Scheduler, limit: Duration) {
    let deadline = Instant::now() + limit;
    while scheduler.run(Duration::from_millis(10)) {
        assert!(Instant::now() < deadline, "scheduler did not stop within {limit:?}");
    }
}

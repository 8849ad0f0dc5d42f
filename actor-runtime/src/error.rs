//! Error types.
//!
//! Sending to a dead actor, an empty queue and a failed steal are ordinary
//! outcomes, not errors. What remains is construction and OS interaction.

use crate::state::SchedulerId;

/// Invalid tuning values, by field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("a scheduler group needs between 1 and 255 schedulers, got {0}")]
    SchedulerCount(usize),
    #[error("mpmc_block_size must be positive")]
    MpmcBlockSize,
    #[error("local_queue_capacity must be a power of two >= 2, got {0}")]
    LocalQueueCapacity(usize),
    #[error("sleep_rounds ({sleep}) must exceed spin_rounds ({spin})")]
    WaiterRounds { spin: u32, sleep: u32 },
    #[error("park_timeout must be non-zero")]
    ParkTimeout,
    #[error("global_queue_interval must be positive")]
    GlobalQueueInterval,
    #[error("{0} CPU threads exceed the thread registry")]
    TooManyThreads(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("scheduler {id} out of range (group has {count})")]
    SchedulerOutOfRange { id: SchedulerId, count: usize },
    #[error("scheduler {0} is already running")]
    SchedulerTaken(SchedulerId),
    #[error("no scheduler context or scheduler group available")]
    NoScheduler,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

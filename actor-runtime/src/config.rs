//! Scheduler tuning.
//!
//! Plain values with defaults; nothing is read from the environment.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use crate::error::ConfigError;
use crate::internal::thread_id::MAX_THREADS;

/// Tuning for one scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// CPU worker threads. Zero means the IO thread runs every actor.
    pub cpu_threads: usize,
    /// Slots per block of the shared CPU queue.
    pub mpmc_block_size: usize,
    /// Capacity of each worker's stealing ring; a power of two.
    pub local_queue_capacity: usize,
    /// Idle rounds a worker yields before trying to become the sleeper.
    pub spin_rounds: u32,
    /// Idle rounds after which the sleeper parks.
    pub sleep_rounds: u32,
    /// Upper bound on one park.
    pub park_timeout: Duration,
    /// A worker looks at the shared queue first every this many pops.
    pub global_queue_interval: u32,
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_threads: thread::available_parallelism()
                .map_or(1, NonZeroUsize::get)
                .min(MAX_THREADS / 4),
            mpmc_block_size: crate::mpmc::DEFAULT_BLOCK_SIZE,
            local_queue_capacity: 256,
            spin_rounds: 32,
            sleep_rounds: 64,
            park_timeout: Duration::from_millis(10),
            global_queue_interval: 51,
            thread_name_prefix: "actor".to_string(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_cpu_threads(mut self, n: usize) -> Self {
        self.cpu_threads = n;
        self
    }

    #[must_use]
    pub fn with_mpmc_block_size(mut self, n: usize) -> Self {
        self.mpmc_block_size = n;
        self
    }

    #[must_use]
    pub fn with_local_queue_capacity(mut self, n: usize) -> Self {
        self.local_queue_capacity = n;
        self
    }

    #[must_use]
    pub fn with_wait_rounds(mut self, spin: u32, sleep: u32) -> Self {
        self.spin_rounds = spin;
        self.sleep_rounds = sleep;
        self
    }

    #[must_use]
    pub fn with_park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_global_queue_interval(mut self, n: u32) -> Self {
        self.global_queue_interval = n;
        self
    }

    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// # Errors
    ///
    /// Returns the first field that is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_threads >= MAX_THREADS {
            return Err(ConfigError::TooManyThreads(self.cpu_threads));
        }
        if self.mpmc_block_size == 0 {
            return Err(ConfigError::MpmcBlockSize);
        }
        if self.local_queue_capacity < 2 || !self.local_queue_capacity.is_power_of_two() {
            return Err(ConfigError::LocalQueueCapacity(self.local_queue_capacity));
        }
        if self.sleep_rounds <= self.spin_rounds {
            return Err(ConfigError::WaiterRounds {
                spin: self.spin_rounds,
                sleep: self.sleep_rounds,
            });
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::ParkTimeout);
        }
        if self.global_queue_interval == 0 {
            return Err(ConfigError::GlobalQueueInterval);
        }
        Ok(())
    }
}

/// Schedulers of one group, indexed by scheduler id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub schedulers: Vec<SchedulerConfig>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::uniform(1, SchedulerConfig::default())
    }
}

impl GroupConfig {
    #[must_use]
    pub fn new(schedulers: Vec<SchedulerConfig>) -> Self {
        Self { schedulers }
    }

    /// `count` schedulers sharing one config.
    #[must_use]
    pub fn uniform(count: usize, config: SchedulerConfig) -> Self {
        Self {
            schedulers: vec![config; count],
        }
    }

    /// # Errors
    ///
    /// Rejects an empty group, more than 255 schedulers, or any invalid
    /// scheduler config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = self.schedulers.len();
        if count == 0 || count > usize::from(u8::MAX) {
            return Err(ConfigError::SchedulerCount(count));
        }
        let total: usize = self.schedulers.iter().map(|s| s.cpu_threads + 1).sum();
        if total >= MAX_THREADS {
            return Err(ConfigError::TooManyThreads(total));
        }
        self.schedulers.iter().try_for_each(SchedulerConfig::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.cpu_threads >= 1);
        assert_eq!(config.mpmc_block_size, 1024);
        assert_eq!(config.local_queue_capacity, 256);
        assert_eq!(config.global_queue_interval, 51);
        config.validate().unwrap();
        GroupConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_fields() {
        let base = SchedulerConfig::default().with_cpu_threads(2);
        assert_eq!(
            base.clone().with_local_queue_capacity(100).validate(),
            Err(ConfigError::LocalQueueCapacity(100))
        );
        assert_eq!(
            base.clone().with_wait_rounds(8, 8).validate(),
            Err(ConfigError::WaiterRounds { spin: 8, sleep: 8 })
        );
        assert_eq!(
            base.clone().with_mpmc_block_size(0).validate(),
            Err(ConfigError::MpmcBlockSize)
        );
        assert_eq!(
            base.clone().with_park_timeout(Duration::ZERO).validate(),
            Err(ConfigError::ParkTimeout)
        );
        assert_eq!(
            base.with_global_queue_interval(0).validate(),
            Err(ConfigError::GlobalQueueInterval)
        );
    }

    #[test]
    fn group_size_bounds() {
        assert_eq!(
            GroupConfig::new(Vec::new()).validate(),
            Err(ConfigError::SchedulerCount(0))
        );
        let small = SchedulerConfig::default().with_cpu_threads(0);
        assert_eq!(
            GroupConfig::uniform(256, small.clone()).validate(),
            Err(ConfigError::SchedulerCount(256))
        );
        GroupConfig::uniform(3, small).validate().unwrap();
    }
}

//! Crate-private helpers shared by the reclamation schemes, the queues and
//! the scheduler.

pub mod rng;
pub mod thread_id;

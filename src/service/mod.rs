//! Batched execution service over task environments.
//!
//! [`pool::EnvPool`] is the single point of control for many independent
//! simulator-backed environments: every lifecycle operation has a batch
//! variant that fans out over a bounded worker pool and fans results back in
//! keyed by environment id.

pub mod pool;

pub use pool::{EnvPool, StepResult};

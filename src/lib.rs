//! Tidepool: a batched environment pool for embodied-agent RL training.
//!
//! Wraps expensive simulator-backed environments (household kitchen tasks,
//! tabletop manipulation) behind a uniform interface and steps many of them
//! concurrently so a training loop sees one batched call instead of N slow
//! sequential simulator calls.

pub mod config;
pub mod env;
pub mod serial;
pub mod service;

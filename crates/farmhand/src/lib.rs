//! Farmhand — a process-local worker farm.
//!
//! A [`Farm`] multiplexes asynchronous method calls across a pool of
//! child-process workers, falling back to in-process execution while the
//! pool warms up. Workers talk back to the parent through reverse handles
//! and master-calls; their log events replay on the parent logger.
//!
//! The child side of the protocol lives in the `farmhand-worker` crate; a
//! worker binary builds a [`WorkerModule`] and hands it to
//! `farmhand_worker::run_worker`.

pub mod config;
mod error;
mod farm;
mod handle;
mod logging;
mod queue;
mod shared;
mod warmup;
mod worker;

pub use config::{FarmOptions, default_calls_per_worker, default_worker_count};
pub use error::{Error, Result};
pub use farm::{Farm, FarmEvent, MethodHandle};

pub use farmhand_proto::{
    Handle, LogLevel, RequestFrame, RequestTarget, ResponseContent, ResponseFrame, WireError,
    WireValue,
};
pub use farmhand_worker::{MasterEndpoint, ModuleRegistry, WorkerContext, WorkerModule};

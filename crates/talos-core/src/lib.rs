//! # talos-core
//!
//! Core of the Talos job cluster: a delay-aware queue, a bounded worker
//! pool, and the resource-lifecycle machine that leases an expensive
//! browser-like resource to each job.
//!
//! | Area           | Description                                              | Key types / traits                          |
//! |----------------|----------------------------------------------------------|---------------------------------------------|
//! | **Cluster**    | Queue, execute, idle/wait-for-one, close.                | [`Cluster`], [`ClusterConfig`]              |
//! | **Providers**  | The seam to the underlying browser-like resource.        | [`ResourceProvider`], [`WorkerInstance`], [`JobInstance`] |
//! | **Payloads**   | Opaque job data with duck-typed URL/group extraction.    | [`JobPayload`]                              |
//! | **Tasks**      | Async closures run against a leased page handle.         | [`TaskFn`], [`TaskContext`], [`task_fn`]    |
//! | **Events**     | Enqueue/failure notifications for logging and metrics.   | [`ClusterReporter`], [`ClusterEvent`]       |
//! | **Errors**     | Typed errors for scheduling and task execution.          | [`ClusterError`]                            |
//!
//! The concrete Chromium provider strategies live in the `talos-client`
//! crate; this crate only knows the traits.

pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod provider;

mod pool;
mod queue;
mod scheduler;
mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use cluster::{Cluster, ClusterStats};
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use event::{ClusterEvent, ClusterReporter, TracingReporter};
pub use job::{domain_of, JobPayload};
pub use provider::{
    task_fn, JobInstance, PageOf, ResourceProvider, TaskContext, TaskFn, TaskFuture,
    WorkerInstance,
};

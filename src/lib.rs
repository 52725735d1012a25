//! Core library for the Stowage container storage plugin.
//!
//! The crate drives asynchronous provider jobs to completion, provisions
//! block volumes and file shares idempotently by name, and exposes them to
//! an orchestrator through identity, controller and node services. Object
//! storage buckets are mounted on nodes by a separate privileged connector
//! that only executes signed commands.

pub mod cloud;
pub mod config;
pub mod exec;
pub mod job;
pub mod logging;
pub mod mount;
pub mod mounter;
pub mod poll;
pub mod provision;
pub mod rpc;
pub mod test_support;
pub mod transport;

pub use config::{ConfigError, ConnectorConfig, PluginConfig};
pub use job::{JobError, JobHandle, JobKind, JobState, wait_for_job};
pub use poll::{Backoff, Outcome, PollError, poll_until};
pub use provision::{Attacher, DeviceResolver, ProvisionError, Provisioner};
pub use rpc::{RpcCode, RpcServer, RpcStatus};

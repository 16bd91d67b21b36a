//! Streaming client for the database change protocol (DCP).
//!
//! Opens long-lived streams per partition against a clustered document
//! store, maintains resumable stream offsets, applies server-driven flow
//! control, follows cluster topology over a streaming HTTP config
//! connection, and surfaces an ordered sequence of typed change events.
//!
//! # Overview
//! - [`Client`] is the entry point: `connect`, `start_streaming`, subscribe
//!   to [`DcpEvent`]s, `stop`.
//! - [`ConfigProvider`] follows the cluster configuration stream and
//!   publishes monotone topology updates.
//! - Flow control is credit-based: data events carry a
//!   [`FlowControlReceipt`] that must be acknowledged exactly once (the
//!   client does it for you in [`FlowControlMode::Automatic`]).
//! - Offsets ([`dcp_wire::StreamOffset`]) are surfaced on every data event;
//!   persisting and restoring them is the application's checkpoint contract.

pub mod bucket;
pub mod client;
mod conductor;
pub mod config;
mod connection;
mod demux;
mod dispatcher;
pub mod error;
pub mod events;
pub mod flow;
pub mod host;
pub mod lifecycle;
pub mod partitions;
pub mod provider;
pub mod retry;

pub use bucket::{BucketConfig, Topology};
pub use client::Client;
pub use config::{ClientConfig, NetworkResolution};
pub use error::{ConfigError, DcpError};
pub use events::{DcpEvent, RollbackAction, StreamEndReason};
pub use flow::{FlowControlMode, FlowControlReceipt};
pub use host::HostAndPort;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use partitions::{MAX_PARTITIONS, PartitionStateTable, StreamState};
pub use provider::ConfigProvider;
pub use retry::{Retry, RetryError};

pub use dcp_wire as wire;

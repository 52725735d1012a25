//! Command-line interface definitions for the `stowage` binaries.
//!
//! This module centralises the clap parser structures so the binaries and
//! the build script can reuse them when generating the manual page.

use clap::{Parser, ValueEnum};

/// Which services the plugin process serves besides identity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Mode {
    /// Provisioning and attachment against the provider.
    Controller,
    /// Staging and publishing on the local node.
    Node,
    /// Both services in one process.
    #[default]
    All,
}

impl Mode {
    /// Whether the controller service runs.
    #[must_use]
    pub const fn controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    /// Whether the node service runs.
    #[must_use]
    pub const fn node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

/// Top-level CLI for the `stowage` plugin binary.
///
/// Everything else is configured through `STOWAGE_*` environment variables
/// or the configuration file.
#[derive(Debug, Parser)]
#[command(
    name = "stowage",
    version,
    about = "Container storage plugin for cloud volumes, file shares and buckets"
)]
pub struct Cli {
    /// Services to run alongside identity.
    #[arg(long, value_enum, default_value_t = Mode::All)]
    pub mode: Mode,
    /// Unix socket to serve on, overriding `STOWAGE_RPC_SOCKET`.
    #[arg(long, value_name = "SOCKET")]
    pub endpoint: Option<String>,
    /// Identifier of this node, overriding `STOWAGE_NODE_ID`.
    #[arg(long, value_name = "ID")]
    pub node_id: Option<String>,
}

/// CLI for the privileged `stowage-connector` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stowage-connector",
    version,
    about = "Privileged helper that executes signed bucket mount commands"
)]
pub struct ConnectorCli {
    /// Unix socket to serve on, overriding `STOWAGE_CONNECTOR_SOCKET`.
    #[arg(long, value_name = "SOCKET")]
    pub socket: Option<String>,
}

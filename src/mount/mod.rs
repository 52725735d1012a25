//! Signed mount delegation between the plugin and the privileged connector.
//!
//! The plugin builds a [`MountCommand`], signs its parameter map with the
//! shared secret and sends it to the connector over a Unix socket. The
//! connector verifies the token before trusting any parameter, confines the
//! credential file to its credential directory, runs the mount helper and
//! always removes the credential file afterwards.

use std::io;

use thiserror::Error;

use crate::exec::SpawnError;
use crate::transport::TransportError;

mod client;
mod command;
mod server;
pub mod token;

pub use client::{BucketMount, MountClient};
pub use command::{
    FailureKind, MountAction, MountCommand, MountResponse, PARAM_BUCKET, PARAM_CREDENTIAL_FILE,
    PARAM_ENDPOINT_DOMAIN, PARAM_MOUNT_OPTIONS, PARAM_REGION, PARAM_TARGET_PATH, ResponseStatus,
};
pub use server::{MountServer, ServerSettings};
pub use token::TokenError;

/// Errors raised on either side of the mount-delegation channel.
#[derive(Debug, Error)]
pub enum MountError {
    /// The command token does not match its parameters.
    #[error("mount command failed authentication")]
    Unauthenticated,
    /// The command could not be signed.
    #[error("cannot sign mount command: {0}")]
    Signing(#[source] TokenError),
    /// A required parameter is absent or empty.
    #[error("missing required parameter {name}")]
    MissingParameter {
        /// Parameter name.
        name: String,
    },
    /// A parameter value is unsafe or malformed.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Why the value was refused.
        reason: String,
    },
    /// The credential path lies outside the credential directory.
    #[error("credential file {path} is outside the credential directory")]
    CredentialOutsideDir {
        /// Offending path.
        path: String,
    },
    /// The credential file does not exist.
    #[error("credential file {path} does not exist")]
    CredentialMissing {
        /// Missing path.
        path: String,
    },
    /// The credential directory could not be opened.
    #[error("cannot open credential directory {path}: {source}")]
    CredentialDir {
        /// Directory path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The mount helper exited unsuccessfully.
    #[error("{program} exited with status {status_text}: {output}")]
    CommandFailed {
        /// Program that ran.
        program: String,
        /// Exit status as text.
        status_text: String,
        /// Captured output.
        output: String,
    },
    /// The mount helper could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The local channel failed.
    #[error("mount connector unreachable: {0}")]
    Transport(#[from] TransportError),
    /// The connector refused or failed the command.
    #[error("mount connector reported failure: {message}")]
    Rejected {
        /// Classification returned by the connector, if any.
        kind: Option<FailureKind>,
        /// Message returned by the connector.
        message: String,
    },
}

impl MountError {
    /// Classifies this error for the wire response.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Unauthenticated => FailureKind::Unauthenticated,
            Self::MissingParameter { .. }
            | Self::InvalidParameter { .. }
            | Self::CredentialOutsideDir { .. } => FailureKind::InvalidRequest,
            Self::CredentialMissing { .. } => FailureKind::Precondition,
            Self::Rejected {
                kind: Some(kind), ..
            } => *kind,
            Self::Signing(_)
            | Self::CredentialDir { .. }
            | Self::CommandFailed { .. }
            | Self::Spawn(_)
            | Self::Transport(_)
            | Self::Rejected { kind: None, .. } => FailureKind::Execution,
        }
    }
}

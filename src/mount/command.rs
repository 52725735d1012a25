//! Wire documents exchanged with the mount connector.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::token::{self, TokenError};

/// Bucket or share to mount.
pub const PARAM_BUCKET: &str = "bucket";
/// Mount target directory.
pub const PARAM_TARGET_PATH: &str = "target_path";
/// Credential file inside the connector's credential directory.
pub const PARAM_CREDENTIAL_FILE: &str = "credential_file";
/// Cloud region of the bucket.
pub const PARAM_REGION: &str = "region";
/// Domain of the object storage endpoint.
pub const PARAM_ENDPOINT_DOMAIN: &str = "endpoint_domain";
/// Extra comma-separated mount options.
pub const PARAM_MOUNT_OPTIONS: &str = "mount_options";

/// Privileged action requested from the connector.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountAction {
    /// Mount a bucket at a target path.
    Mount,
    /// Unmount a target path.
    Unmount,
}

impl MountAction {
    /// Parameters that must be present for this action.
    #[must_use]
    pub const fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::Mount => &[PARAM_BUCKET, PARAM_TARGET_PATH, PARAM_CREDENTIAL_FILE],
            Self::Unmount => &[PARAM_TARGET_PATH],
        }
    }
}

/// A signed mount request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MountCommand {
    /// Requested action.
    pub action: MountAction,
    /// Hex digest of `parameters` keyed with the shared secret.
    pub token: String,
    /// Action inputs.
    pub parameters: BTreeMap<String, String>,
}

impl MountCommand {
    /// Builds a command and signs its parameters.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::EmptySecret`] when `secret` is empty.
    pub fn signed(
        action: MountAction,
        parameters: BTreeMap<String, String>,
        secret: &str,
    ) -> Result<Self, TokenError> {
        let token = token::sign(secret, &parameters)?;
        Ok(Self {
            action,
            token,
            parameters,
        })
    }

    /// Returns the parameter value for `key`.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Outcome reported by the connector.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The action completed.
    Success,
    /// The action was rejected or failed.
    Failure,
}

/// Why the connector refused or failed a command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The token did not match the parameters.
    Unauthenticated,
    /// A parameter was missing, unsafe or pointed outside the credential
    /// directory.
    InvalidRequest,
    /// The referenced credential file does not exist.
    Precondition,
    /// The helper failed or could not be started.
    Execution,
}

/// Connector response body.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MountResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Human readable detail.
    pub message: String,
    /// Failure classification; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl MountResponse {
    /// A success response.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            kind: None,
        }
    }

    /// A failure response.
    #[must_use]
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failure,
            message: message.into(),
            kind: Some(kind),
        }
    }

    /// Returns `true` for a success response.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, ResponseStatus::Success)
    }
}

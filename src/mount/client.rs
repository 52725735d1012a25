//! Unprivileged side of mount delegation.

use std::collections::BTreeMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, instrument};

use super::command::{
    MountAction, MountCommand, MountResponse, PARAM_BUCKET, PARAM_CREDENTIAL_FILE,
    PARAM_ENDPOINT_DOMAIN, PARAM_MOUNT_OPTIONS, PARAM_REGION, PARAM_TARGET_PATH,
};
use super::MountError;
use crate::transport;

/// Inputs of a bucket mount.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BucketMount {
    /// Bucket name, optionally followed by `:/prefix`.
    pub bucket: String,
    /// Directory to mount at.
    pub target_path: String,
    /// Credential file written into the connector's credential directory.
    pub credential_file: String,
    /// Region override.
    pub region: Option<String>,
    /// Endpoint domain override.
    pub endpoint_domain: Option<String>,
    /// Extra mount options.
    pub mount_options: Option<String>,
}

impl BucketMount {
    fn parameters(&self) -> BTreeMap<String, String> {
        let mut parameters = BTreeMap::from([
            (PARAM_BUCKET.to_owned(), self.bucket.clone()),
            (PARAM_TARGET_PATH.to_owned(), self.target_path.clone()),
            (PARAM_CREDENTIAL_FILE.to_owned(), self.credential_file.clone()),
        ]);
        let optional = [
            (PARAM_REGION, &self.region),
            (PARAM_ENDPOINT_DOMAIN, &self.endpoint_domain),
            (PARAM_MOUNT_OPTIONS, &self.mount_options),
        ];
        for (key, value) in optional {
            if let Some(present) = value.as_ref().filter(|text| !text.is_empty()) {
                parameters.insert(key.to_owned(), present.clone());
            }
        }
        parameters
    }
}

/// Sends signed commands to the mount connector.
#[derive(Clone)]
pub struct MountClient {
    socket: Utf8PathBuf,
    secret: String,
}

impl fmt::Debug for MountClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountClient")
            .field("socket", &self.socket)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl MountClient {
    /// Creates a client for the connector listening on `socket`.
    #[must_use]
    pub fn new(socket: impl Into<Utf8PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            secret: secret.into(),
        }
    }

    /// Socket the client talks to.
    #[must_use]
    pub fn socket(&self) -> &Utf8Path {
        &self.socket
    }

    /// Asks the connector to mount a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Rejected`] when the connector reports failure
    /// and [`MountError::Transport`] when it cannot be reached.
    #[instrument(skip_all, fields(target = %request.target_path))]
    pub async fn mount(&self, request: &BucketMount) -> Result<(), MountError> {
        self.expect_success(MountAction::Mount, request.parameters())
            .await
    }

    /// Asks the connector to unmount `target_path`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Rejected`] when the connector reports failure
    /// and [`MountError::Transport`] when it cannot be reached.
    #[instrument(skip(self))]
    pub async fn unmount(&self, target_path: &str) -> Result<(), MountError> {
        let parameters = BTreeMap::from([(PARAM_TARGET_PATH.to_owned(), target_path.to_owned())]);
        self.expect_success(MountAction::Unmount, parameters).await
    }

    /// Signs and sends one command, returning the connector's response.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Signing`] when the secret is unusable and
    /// [`MountError::Transport`] when the exchange fails.
    pub async fn send(
        &self,
        action: MountAction,
        parameters: BTreeMap<String, String>,
    ) -> Result<MountResponse, MountError> {
        let command =
            MountCommand::signed(action, parameters, &self.secret).map_err(MountError::Signing)?;
        debug!(?action, socket = %self.socket, "sending mount command");
        let response: MountResponse = transport::exchange(&self.socket, &command).await?;
        Ok(response)
    }

    async fn expect_success(
        &self,
        action: MountAction,
        parameters: BTreeMap<String, String>,
    ) -> Result<(), MountError> {
        let response = self.send(action, parameters).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(MountError::Rejected {
                kind: response.kind,
                message: response.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_parameters_are_omitted_when_empty() {
        let request = BucketMount {
            bucket: String::from("data"),
            target_path: String::from("/mnt/data"),
            credential_file: String::from("/run/creds/abc"),
            region: Some(String::new()),
            endpoint_domain: None,
            mount_options: Some(String::from("ro")),
        };
        let parameters = request.parameters();
        assert_eq!(parameters.len(), 4);
        assert!(!parameters.contains_key(PARAM_REGION));
        assert_eq!(
            parameters.get(PARAM_MOUNT_OPTIONS).map(String::as_str),
            Some("ro")
        );
    }

    #[test]
    fn debug_output_redacts_secret() {
        let client = MountClient::new("/run/connector.sock", "hunter2");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("hunter2"));
    }
}

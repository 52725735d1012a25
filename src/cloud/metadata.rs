//! Instance metadata service client used on nodes to resolve device paths.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{CloudError, CloudFuture, MetadataApi};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const BY_ID_PREFIX: &str = "/dev/disk/by-id/virtio-";

#[derive(Deserialize)]
struct MetadataDocument {
    #[serde(default)]
    devices: Vec<MetadataDevice>,
}

#[derive(Deserialize)]
struct MetadataDevice {
    #[serde(default)]
    serial: String,
}

/// Reads the instance metadata document over HTTP.
#[derive(Clone, Debug)]
pub struct MetadataServiceClient {
    http: reqwest::Client,
    url: String,
}

impl MetadataServiceClient {
    /// Creates a client for the metadata document at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn new(url: impl Into<String>) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|err| CloudError::Transport {
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn document(&self) -> Result<MetadataDocument, CloudError> {
        let transport = |err: reqwest::Error| CloudError::Transport {
            message: err.to_string(),
        };
        let response = self.http.get(&self.url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                message: format!("metadata service at {}", self.url),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|err| CloudError::Decode {
            resource: String::from("metadata"),
            message: err.to_string(),
        })
    }
}

impl MetadataApi for MetadataServiceClient {
    fn device_for<'a>(&'a self, volume_id: &'a str) -> CloudFuture<'a, Option<String>> {
        Box::pin(async move {
            let document = self.document().await?;
            let path = device_path(&document.devices, volume_id);
            debug!(volume_id, ?path, "metadata device lookup");
            Ok(path)
        })
    }
}

/// Virtio serials are truncated volume ids, so a device matches when its
/// serial is a non-empty prefix of the id.
fn device_path(devices: &[MetadataDevice], volume_id: &str) -> Option<String> {
    devices
        .iter()
        .find(|device| !device.serial.is_empty() && volume_id.starts_with(&device.serial))
        .map(|device| format!("{BY_ID_PREFIX}{}", device.serial))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(serials: &[&str]) -> Vec<MetadataDevice> {
        serials
            .iter()
            .map(|serial| MetadataDevice {
                serial: (*serial).to_owned(),
            })
            .collect()
    }

    #[test]
    fn matches_truncated_serial() {
        let found = device_path(
            &devices(&["other", "0f3c9a2e-1b7d-4e"]),
            "0f3c9a2e-1b7d-4e5f-8a90-0123456789ab",
        );
        assert_eq!(
            found.as_deref(),
            Some("/dev/disk/by-id/virtio-0f3c9a2e-1b7d-4e")
        );
    }

    #[test]
    fn ignores_empty_serials() {
        assert_eq!(device_path(&devices(&[""]), "vol-1"), None);
    }

    #[test]
    fn document_tolerates_missing_devices() {
        let document: MetadataDocument =
            serde_json::from_str(r#"{"uuid": "node-a"}"#).expect("document should parse");
        assert!(document.devices.is_empty());
    }
}

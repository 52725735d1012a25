//! Authenticated HTTP transport shared by the REST cloud clients.

use std::fmt;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::CloudError;
use crate::config::PluginConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_HEADER: &str = "X-Auth-Token";

/// Thin, cloneable wrapper around an authenticated HTTP client.
///
/// The client holds no mutable state after construction and is shared by
/// every resource API and every concurrent request.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    region: String,
    endpoint_domain: String,
    project_id: String,
    token: String,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("region", &self.region)
            .field("endpoint_domain", &self.endpoint_domain)
            .field("project_id", &self.project_id)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Creates a client for the given region and endpoint domain.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn new(
        region: impl Into<String>,
        endpoint_domain: impl Into<String>,
        project_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| CloudError::Transport {
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            region: region.into(),
            endpoint_domain: endpoint_domain.into(),
            project_id: project_id.into(),
            token: token.into(),
        })
    }

    /// Creates a client from validated plugin configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn from_config(config: &PluginConfig) -> Result<Self, CloudError> {
        Self::new(
            config.region.clone(),
            config.endpoint_domain.clone(),
            config.project_id.clone(),
            config.auth_token.clone(),
        )
    }

    /// Builds the project-scoped base URL of a regional service.
    #[must_use]
    pub fn service_url(&self, service: &str, version: &str) -> String {
        format!(
            "https://{service}.{}.{}/{version}/{}",
            self.region, self.endpoint_domain, self.project_id
        )
    }

    /// Region the client talks to.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Performs a GET and decodes the JSON body.
    pub(super) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        resource: &str,
        id: &str,
    ) -> Result<T, CloudError> {
        let body = self.execute::<()>(Method::GET, url, None, resource, id).await?;
        decode(&body, resource)
    }

    /// Sends `payload` with `method` and decodes the JSON body.
    pub(super) async fn send_json<B, T>(
        &self,
        method: Method,
        url: &str,
        payload: Option<&B>,
        resource: &str,
        id: &str,
    ) -> Result<T, CloudError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let body = self.execute(method, url, payload, resource, id).await?;
        decode(&body, resource)
    }

    /// Sends `payload` with `method`, ignoring any response body.
    pub(super) async fn send_empty<B>(
        &self,
        method: Method,
        url: &str,
        payload: Option<&B>,
        resource: &str,
        id: &str,
    ) -> Result<(), CloudError>
    where
        B: Serialize + Sync + ?Sized,
    {
        self.execute(method, url, payload, resource, id).await?;
        Ok(())
    }

    async fn execute<B>(
        &self,
        method: Method,
        url: &str,
        payload: Option<&B>,
        resource: &str,
        id: &str,
    ) -> Result<Vec<u8>, CloudError>
    where
        B: Serialize + Sync + ?Sized,
    {
        debug!(%method, url, "provider request");
        let mut request = self
            .http
            .request(method, url)
            .header(AUTH_HEADER, &self.token);
        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| CloudError::Transport {
            message: err.to_string(),
        })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| CloudError::Transport {
                message: err.to_string(),
            })?;

        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound {
                resource: resource.to_owned(),
                id: id.to_owned(),
            });
        }
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }
}

fn decode<T: DeserializeOwned>(body: &[u8], resource: &str) -> Result<T, CloudError> {
    serde_json::from_slice(body).map_err(|err| CloudError::Decode {
        resource: resource.to_owned(),
        message: err.to_string(),
    })
}

/// Percent-encodes a query value.
pub(super) fn encode_query(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RestClient {
        RestClient::new("region-1", "cloud.example", "proj", "secret-token")
            .expect("client should build")
    }

    #[test]
    fn service_url_is_project_scoped() {
        assert_eq!(
            client().service_url("evs", "v2"),
            "https://evs.region-1.cloud.example/v2/proj"
        );
    }

    #[test]
    fn debug_output_redacts_token() {
        let rendered = format!("{:?}", client());
        assert!(!rendered.contains("secret-token"), "token leaked: {rendered}");
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn encode_query_escapes_reserved_characters() {
        assert_eq!(encode_query("pvc-1 a/b"), "pvc-1%20a%2Fb");
    }

    #[test]
    fn decode_reports_resource_on_failure() {
        let err = decode::<serde_json::Value>(b"not json", "volume").expect_err("should fail");
        assert!(matches!(err, CloudError::Decode { ref resource, .. } if resource == "volume"));
    }
}

//! Configuration loading via `ortho-config`.
//!
//! Two independent configurations exist because the plugin and the mount
//! connector run as separate processes with different privileges. Both share
//! the mount-delegation secret; only the plugin holds cloud credentials.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default Unix socket served by the plugin.
pub const DEFAULT_RPC_SOCKET: &str = "/run/stowage/csi.sock";
/// Default Unix socket served by the mount connector.
pub const DEFAULT_CONNECTOR_SOCKET: &str = "/run/stowage/connector.sock";
/// Default directory holding short-lived bucket credential files.
pub const DEFAULT_CREDENTIAL_DIR: &str = "/run/stowage/credentials";
/// Default instance metadata document.
pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254/openstack/latest/meta_data.json";

/// Plugin configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "STOWAGE")]
pub struct PluginConfig {
    /// Cloud region, for example `eu-west-0`.
    pub region: String,
    /// Domain appended to regional service names.
    #[ortho_config(default = "cloud.example.com".to_owned())]
    pub endpoint_domain: String,
    /// Project identifier used to scope every API call.
    pub project_id: String,
    /// Pre-issued API token. This value is required.
    pub auth_token: String,
    /// Identifier of the compute instance this process runs on. Required in
    /// node mode.
    pub node_id: Option<String>,
    /// Socket the plugin serves RPCs on.
    #[ortho_config(default = DEFAULT_RPC_SOCKET.to_owned())]
    pub rpc_socket: String,
    /// Socket of the privileged mount connector.
    #[ortho_config(default = DEFAULT_CONNECTOR_SOCKET.to_owned())]
    pub connector_socket: String,
    /// Directory shared with the connector for credential files.
    #[ortho_config(default = DEFAULT_CREDENTIAL_DIR.to_owned())]
    pub credential_dir: String,
    /// Secret used to sign mount-delegation commands.
    pub shared_secret: String,
    /// Instance metadata document used to resolve device paths.
    #[ortho_config(default = DEFAULT_METADATA_URL.to_owned())]
    pub metadata_url: String,
    /// Network granted access to new file shares.
    pub share_network_id: Option<String>,
    /// Log output format: `text` or `json`.
    #[ortho_config(default = "text".to_owned())]
    pub log_format: String,
    /// Maximum number of volumes attachable to this node.
    #[ortho_config(default = 24)]
    pub max_volumes_per_node: u32,
}

/// Mount connector configuration.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "STOWAGE_CONNECTOR")]
pub struct ConnectorConfig {
    /// Socket the connector listens on.
    #[ortho_config(default = DEFAULT_CONNECTOR_SOCKET.to_owned())]
    pub socket: String,
    /// The only directory credential files are read from.
    #[ortho_config(default = DEFAULT_CREDENTIAL_DIR.to_owned())]
    pub credential_dir: String,
    /// Secret used to verify mount-delegation commands.
    pub shared_secret: String,
    /// FUSE mount helper for object storage buckets.
    #[ortho_config(default = "s3fs".to_owned())]
    pub mount_bin: String,
    /// Binary used to detach mounts.
    #[ortho_config(default = "umount".to_owned())]
    pub umount_bin: String,
    /// Region used when a command omits one.
    pub region: Option<String>,
    /// Domain appended to the object storage endpoint.
    #[ortho_config(default = "cloud.example.com".to_owned())]
    pub endpoint_domain: String,
    /// Log output format: `text` or `json`.
    #[ortho_config(default = "text".to_owned())]
    pub log_format: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to stowage.toml",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

fn require_optional_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    value.map_or(Ok(()), |present| require_field(present, metadata))
}

impl PluginConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stowage")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.region,
            &FieldMetadata::new("cloud region", "STOWAGE_REGION", "region"),
        )?;
        require_field(
            &self.endpoint_domain,
            &FieldMetadata::new(
                "endpoint domain",
                "STOWAGE_ENDPOINT_DOMAIN",
                "endpoint_domain",
            ),
        )?;
        require_field(
            &self.project_id,
            &FieldMetadata::new("project ID", "STOWAGE_PROJECT_ID", "project_id"),
        )?;
        require_field(
            &self.auth_token,
            &FieldMetadata::new("API token", "STOWAGE_AUTH_TOKEN", "auth_token"),
        )?;
        require_field(
            &self.shared_secret,
            &FieldMetadata::new(
                "mount delegation secret",
                "STOWAGE_SHARED_SECRET",
                "shared_secret",
            ),
        )?;
        require_field(
            &self.credential_dir,
            &FieldMetadata::new(
                "credential directory",
                "STOWAGE_CREDENTIAL_DIR",
                "credential_dir",
            ),
        )?;
        require_optional_field(
            self.share_network_id.as_deref(),
            &FieldMetadata::new(
                "share network ID",
                "STOWAGE_SHARE_NETWORK_ID",
                "share_network_id",
            ),
        )?;
        Ok(())
    }

    /// Returns the node identifier required by node-side services.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no node id is configured.
    pub fn require_node_id(&self) -> Result<&str, ConfigError> {
        let metadata = FieldMetadata::new("node ID", "STOWAGE_NODE_ID", "node_id");
        let node_id = self.node_id.as_deref().unwrap_or_default();
        require_field(node_id, &metadata)?;
        Ok(node_id)
    }
}

impl ConnectorConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stowage-connector")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.socket,
            &FieldMetadata::new("connector socket", "STOWAGE_CONNECTOR_SOCKET", "socket"),
        )?;
        require_field(
            &self.credential_dir,
            &FieldMetadata::new(
                "credential directory",
                "STOWAGE_CONNECTOR_CREDENTIAL_DIR",
                "credential_dir",
            ),
        )?;
        require_field(
            &self.shared_secret,
            &FieldMetadata::new(
                "mount delegation secret",
                "STOWAGE_CONNECTOR_SHARED_SECRET",
                "shared_secret",
            ),
        )?;
        require_field(
            &self.mount_bin,
            &FieldMetadata::new("mount helper", "STOWAGE_CONNECTOR_MOUNT_BIN", "mount_bin"),
        )?;
        require_field(
            &self.umount_bin,
            &FieldMetadata::new(
                "unmount binary",
                "STOWAGE_CONNECTOR_UMOUNT_BIN",
                "umount_bin",
            ),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

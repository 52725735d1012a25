//! Request and response documents of the plugin protocol.
//!
//! All types are plain serde documents so they can travel inside the
//! [`RpcRequest`](super::RpcRequest) / [`RpcResponse`](super::RpcResponse)
//! envelope.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cloud::{ResourceKind, SourceRef};

use super::status::RpcStatus;

/// `volume_context` key naming the volume kind.
pub const CONTEXT_KIND: &str = "kind";
/// `volume_context` key carrying a share's NFS export location.
pub const CONTEXT_EXPORT_LOCATION: &str = "export_location";
/// `volume_context` key carrying a bucket's region.
pub const CONTEXT_REGION: &str = "region";
/// `volume_context` key carrying a bucket's endpoint domain.
pub const CONTEXT_ENDPOINT_DOMAIN: &str = "endpoint_domain";
/// `publish_context` key carrying the attached device path.
pub const PUBLISH_DEVICE_PATH: &str = "device_path";
/// Create parameter selecting the volume kind.
pub const PARAM_KIND: &str = "kind";
/// Create parameter naming an existing bucket.
pub const PARAM_BUCKET: &str = "bucket";
/// Create parameter selecting the provider volume type.
pub const PARAM_VOLUME_TYPE: &str = "type";
/// Create parameter selecting the share protocol.
pub const PARAM_SHARE_PROTO: &str = "share_proto";
/// Create parameter selecting the availability zone.
pub const PARAM_AVAILABILITY_ZONE: &str = "availability_zone";
/// Secret holding the object storage access key.
pub const SECRET_ACCESS_KEY: &str = "access_key";
/// Secret holding the object storage secret key.
pub const SECRET_SECRET_KEY: &str = "secret_key";

/// Kind of volume addressed by a [`VolumeRef`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VolumeKind {
    /// A provider-managed block volume or share.
    Resource(ResourceKind),
    /// A pre-existing object storage bucket mounted through the connector.
    Bucket,
}

impl VolumeKind {
    /// Stable string form used in volume identifiers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resource(kind) => kind.as_str(),
            Self::Bucket => "bucket",
        }
    }

    /// Provider kind, when the volume is provider-managed.
    #[must_use]
    pub const fn resource_kind(self) -> Option<ResourceKind> {
        match self {
            Self::Resource(kind) => Some(kind),
            Self::Bucket => None,
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeKind {
    type Err = RpcStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("bucket") || value.trim().eq_ignore_ascii_case("obs") {
            return Ok(Self::Bucket);
        }
        value
            .parse::<ResourceKind>()
            .map(Self::Resource)
            .map_err(RpcStatus::invalid_argument)
    }
}

/// Protocol volume identifier of the form `{kind}/{provider_id}`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VolumeRef {
    /// Kind of volume.
    pub kind: VolumeKind,
    /// Provider identifier, or bucket name for buckets.
    pub id: String,
}

impl VolumeRef {
    /// Builds a reference.
    #[must_use]
    pub fn new(kind: VolumeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for VolumeRef {
    type Err = RpcStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, id) = value.split_once('/').ok_or_else(|| {
            RpcStatus::invalid_argument(format!("volume id '{value}' is not of the form kind/id"))
        })?;
        if id.trim().is_empty() {
            return Err(RpcStatus::invalid_argument(format!(
                "volume id '{value}' has an empty provider id"
            )));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

/// How a volume may be accessed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Read-write on one node.
    #[default]
    SingleNodeWriter,
    /// Read-only on one node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Many readers, one writer.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Returns `true` for modes that let more than one node write.
    #[must_use]
    pub const fn is_multi_node_writer(self) -> bool {
        matches!(self, Self::MultiNodeSingleWriter | Self::MultiNodeMultiWriter)
    }
}

/// A capability requested for a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Filesystem to create or expect.
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Extra mount flags.
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// Requested capacity bounds in bytes; zero means unbounded.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CapacityRange {
    /// Minimum acceptable size.
    #[serde(default)]
    pub required_bytes: u64,
    /// Maximum acceptable size.
    #[serde(default)]
    pub limit_bytes: u64,
}

/// Content a new volume is populated from.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    /// A snapshot id.
    Snapshot {
        /// Snapshot identifier.
        snapshot_id: String,
    },
    /// Another volume's protocol id.
    Volume {
        /// Volume identifier.
        volume_id: String,
    },
}

impl From<&SourceRef> for ContentSource {
    fn from(source: &SourceRef) -> Self {
        match source {
            SourceRef::Snapshot(id) => Self::Snapshot {
                snapshot_id: id.clone(),
            },
            SourceRef::Volume(id) => Self::Volume {
                volume_id: id.clone(),
            },
        }
    }
}

/// Create a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-chosen name, used for idempotency.
    pub name: String,
    /// Requested capacity.
    #[serde(default)]
    pub capacity: CapacityRange,
    /// Capabilities the volume must support.
    #[serde(default)]
    pub capabilities: Vec<VolumeCapability>,
    /// Storage class parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Optional content source.
    #[serde(default)]
    pub content_source: Option<ContentSource>,
}

/// A provisioned volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Protocol identifier (`{kind}/{provider_id}`).
    pub volume_id: String,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Context passed to node operations.
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    /// Content source the volume was created from.
    #[serde(default)]
    pub content_source: Option<ContentSource>,
}

/// Request naming a single volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeIdRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
}

/// Current state of a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeStatus {
    /// The volume.
    pub volume: Volume,
    /// Raw provider status.
    pub status: String,
    /// Nodes the volume is attached to.
    #[serde(default)]
    pub published_node_ids: Vec<String>,
}

/// Grow a volume on the provider side.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControllerExpandVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Requested capacity.
    pub capacity: CapacityRange,
}

/// Result of a provider-side expand.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControllerExpandVolumeResponse {
    /// Capacity after the expand.
    pub capacity_bytes: u64,
    /// Whether the node must grow the filesystem.
    pub node_expansion_required: bool,
}

/// Attach a volume to a node.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControllerPublishVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Instance to attach to.
    pub node_id: String,
    /// Whether the attachment is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Result of attaching a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControllerPublishVolumeResponse {
    /// Context passed to node stage.
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

/// Detach a volume from a node.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControllerUnpublishVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Instance to detach from.
    pub node_id: String,
}

/// Check whether a volume supports a set of capabilities.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Capabilities to check.
    pub capabilities: Vec<VolumeCapability>,
}

/// Verdict on a capability check.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// `true` when every capability is supported.
    pub confirmed: bool,
    /// Why the capabilities were refused.
    #[serde(default)]
    pub message: Option<String>,
}

/// Mount a volume at its node-global staging path.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeStageVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Global staging directory.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub capability: VolumeCapability,
    /// Context returned by controller publish.
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
    /// Context returned by create.
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

/// Undo a stage.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeUnstageVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Global staging directory.
    pub staging_target_path: String,
}

/// Make a volume available at a workload path.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodePublishVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Staging directory, for staged kinds.
    #[serde(default)]
    pub staging_target_path: Option<String>,
    /// Workload directory.
    pub target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub capability: VolumeCapability,
    /// Whether the workload gets read-only access.
    #[serde(default)]
    pub readonly: bool,
    /// Context returned by create.
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    /// Secrets supplied by the orchestrator.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// Undo a publish.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeUnpublishVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Workload directory.
    pub target_path: String,
}

/// Report usage of a published volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeGetVolumeStatsRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Path the volume is mounted at.
    pub volume_path: String,
}

/// Unit of a [`VolumeUsage`] entry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageUnit {
    /// Bytes.
    Bytes,
    /// Inodes.
    Inodes,
}

/// One usage figure.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeUsage {
    /// Unit of the figures.
    pub unit: UsageUnit,
    /// Total capacity.
    pub total: u64,
    /// Available capacity.
    pub available: u64,
    /// Used capacity.
    pub used: u64,
}

/// Usage of a published volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeStats {
    /// Byte and inode usage.
    pub usage: Vec<VolumeUsage>,
}

/// Grow the filesystem of a published volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeExpandVolumeRequest {
    /// Protocol volume identifier.
    pub volume_id: String,
    /// Path the volume is mounted at.
    pub volume_path: String,
    /// Requested capacity.
    #[serde(default)]
    pub capacity: CapacityRange,
}

/// Result of a node-side expand.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeExpandVolumeResponse {
    /// Capacity after the expand.
    pub capacity_bytes: u64,
}

/// Plugin identity.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub vendor_version: String,
}

/// Capabilities advertised by the plugin.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCapability {
    /// The plugin serves controller operations.
    ControllerService,
    /// Volumes can be expanded while in use.
    OnlineVolumeExpansion,
}

/// Node identity and limits.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeInfo {
    /// Instance identifier.
    pub node_id: String,
    /// Maximum number of attached block volumes.
    pub max_volumes_per_node: u32,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::rpc::RpcCode;

    #[rstest]
    #[case("block/vol-1", VolumeKind::Resource(ResourceKind::Block), "vol-1")]
    #[case("turbo/abc", VolumeKind::Resource(ResourceKind::TurboShare), "abc")]
    #[case("bucket/logs:/prefix", VolumeKind::Bucket, "logs:/prefix")]
    fn volume_refs_parse(#[case] raw: &str, #[case] kind: VolumeKind, #[case] id: &str) {
        let parsed: VolumeRef = raw.parse().expect("valid ref");
        assert_eq!(parsed, VolumeRef::new(kind, id));
        assert_eq!(parsed.to_string(), raw);
    }

    #[rstest]
    #[case("vol-1")]
    #[case("block/")]
    #[case("tape/x")]
    fn malformed_refs_are_invalid_arguments(#[case] raw: &str) {
        let err = raw.parse::<VolumeRef>().expect_err("invalid ref");
        assert_eq!(err.code, RpcCode::InvalidArgument);
    }

    #[test]
    fn multi_node_writer_modes() {
        assert!(AccessMode::MultiNodeMultiWriter.is_multi_node_writer());
        assert!(!AccessMode::MultiNodeReaderOnly.is_multi_node_writer());
    }
}

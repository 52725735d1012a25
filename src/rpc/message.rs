//! Request and response envelopes carried over the plugin socket.
//!
//! Each connection carries exactly one [`RpcRequest`] followed by one
//! [`RpcResponse`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::status::RpcStatus;
use super::types::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetVolumeStatsRequest, NodeInfo,
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, PluginCapability, PluginInfo, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeIdRequest, VolumeStats, VolumeStatus,
};

/// A protocol method call.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Identity: plugin name and version.
    GetPluginInfo,
    /// Identity: advertised capabilities.
    GetPluginCapabilities,
    /// Identity: readiness probe.
    Probe,
    /// Controller: create or reuse a volume.
    CreateVolume(CreateVolumeRequest),
    /// Controller: delete a volume.
    DeleteVolume(VolumeIdRequest),
    /// Controller: fetch a volume and its attachments.
    ControllerGetVolume(VolumeIdRequest),
    /// Controller: grow a volume.
    ControllerExpandVolume(ControllerExpandVolumeRequest),
    /// Controller: attach a volume to a node.
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    /// Controller: detach a volume from a node.
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    /// Controller: check capabilities.
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    /// Node: mount at the staging path.
    NodeStageVolume(NodeStageVolumeRequest),
    /// Node: unmount the staging path.
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    /// Node: mount at the workload path.
    NodePublishVolume(NodePublishVolumeRequest),
    /// Node: unmount the workload path.
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    /// Node: usage figures.
    NodeGetVolumeStats(NodeGetVolumeStatsRequest),
    /// Node: grow the filesystem.
    NodeExpandVolume(NodeExpandVolumeRequest),
    /// Node: identity and limits.
    NodeGetInfo,
}

impl RpcRequest {
    /// Protocol method name, for logs.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetPluginInfo => "get_plugin_info",
            Self::GetPluginCapabilities => "get_plugin_capabilities",
            Self::Probe => "probe",
            Self::CreateVolume(_) => "create_volume",
            Self::DeleteVolume(_) => "delete_volume",
            Self::ControllerGetVolume(_) => "controller_get_volume",
            Self::ControllerExpandVolume(_) => "controller_expand_volume",
            Self::ControllerPublishVolume(_) => "controller_publish_volume",
            Self::ControllerUnpublishVolume(_) => "controller_unpublish_volume",
            Self::ValidateVolumeCapabilities(_) => "validate_volume_capabilities",
            Self::NodeStageVolume(_) => "node_stage_volume",
            Self::NodeUnstageVolume(_) => "node_unstage_volume",
            Self::NodePublishVolume(_) => "node_publish_volume",
            Self::NodeUnpublishVolume(_) => "node_unpublish_volume",
            Self::NodeGetVolumeStats(_) => "node_get_volume_stats",
            Self::NodeExpandVolume(_) => "node_expand_volume",
            Self::NodeGetInfo => "node_get_info",
        }
    }
}

impl fmt::Display for RpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "{}(name={})", self.method(), req.name),
            Self::DeleteVolume(req) | Self::ControllerGetVolume(req) => {
                write!(f, "{}({})", self.method(), req.volume_id)
            }
            Self::ControllerExpandVolume(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::ControllerPublishVolume(req) => {
                write!(f, "{}({} -> {})", self.method(), req.volume_id, req.node_id)
            }
            Self::ControllerUnpublishVolume(req) => {
                write!(f, "{}({} -> {})", self.method(), req.volume_id, req.node_id)
            }
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "{}({})", self.method(), req.volume_id)
            }
            Self::NodeStageVolume(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::NodeUnstageVolume(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::NodePublishVolume(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::NodeUnpublishVolume(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::NodeGetVolumeStats(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::NodeExpandVolume(req) => write!(f, "{}({})", self.method(), req.volume_id),
            Self::GetPluginInfo | Self::GetPluginCapabilities | Self::Probe | Self::NodeGetInfo => {
                f.write_str(self.method())
            }
        }
    }
}

/// The reply to an [`RpcRequest`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "result", content = "body", rename_all = "snake_case")]
pub enum RpcResponse {
    /// Plugin identity.
    PluginInfo(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilities(Vec<PluginCapability>),
    /// Probe result.
    Ready(bool),
    /// A created volume.
    Volume(Volume),
    /// A volume and its state.
    VolumeStatus(VolumeStatus),
    /// A provider-side expand result.
    ControllerExpanded(ControllerExpandVolumeResponse),
    /// An attach result.
    Published(ControllerPublishVolumeResponse),
    /// A capability verdict.
    Validated(ValidateVolumeCapabilitiesResponse),
    /// Usage figures.
    Stats(VolumeStats),
    /// A node-side expand result.
    NodeExpanded(NodeExpandVolumeResponse),
    /// Node identity.
    NodeInfo(NodeInfo),
    /// Success with no payload.
    Empty,
    /// The call failed.
    Error(RpcStatus),
}

impl RpcResponse {
    /// Returns the error status, if the call failed.
    #[must_use]
    pub const fn error(&self) -> Option<&RpcStatus> {
        match self {
            Self::Error(status) => Some(status),
            _ => None,
        }
    }
}

impl From<RpcStatus> for RpcResponse {
    fn from(status: RpcStatus) -> Self {
        Self::Error(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcCode;

    #[test]
    fn requests_are_tagged_by_method() {
        let request = RpcRequest::DeleteVolume(VolumeIdRequest {
            volume_id: String::from("block/v-1"),
        });
        let json = serde_json::to_value(&request).expect("serialise");
        assert_eq!(json["method"], "delete_volume");
        assert_eq!(json["params"]["volume_id"], "block/v-1");
    }

    #[test]
    fn unit_requests_parse_without_params() {
        let parsed: RpcRequest =
            serde_json::from_str(r#"{"method":"probe"}"#).expect("deserialise");
        assert_eq!(parsed, RpcRequest::Probe);
    }

    #[test]
    fn error_responses_carry_code_and_message() {
        let response = RpcResponse::from(RpcStatus::not_found("volume block/x not found"));
        let json = serde_json::to_value(&response).expect("serialise");
        assert_eq!(json["result"], "error");
        assert_eq!(json["body"]["code"], "not_found");
        assert_eq!(response.error().map(|status| status.code), Some(RpcCode::NotFound));
    }

    #[test]
    fn display_names_the_volume() {
        let request = RpcRequest::CreateVolume(CreateVolumeRequest {
            name: String::from("pvc-1"),
            ..CreateVolumeRequest::default()
        });
        assert_eq!(request.to_string(), "create_volume(name=pvc-1)");
    }
}

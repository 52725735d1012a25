//! The plugin's RPC surface: identity, controller and node services.
//!
//! Requests arrive as [`RpcRequest`] documents on a Unix socket, one per
//! connection, and are answered with a single [`RpcResponse`]. Provider and
//! mount failures are mapped onto [`RpcCode`] values so the orchestrator
//! can tell retryable conditions from permanent ones.

mod controller;
mod identity;
mod message;
mod node;
mod server;
mod status;
mod types;

pub use controller::ControllerService;
pub use identity::{IdentityService, PLUGIN_NAME};
pub use message::{RpcRequest, RpcResponse};
pub use node::NodeService;
pub use server::RpcServer;
pub use status::{RpcCode, RpcStatus};
pub use types::{
    AccessMode, CONTEXT_ENDPOINT_DOMAIN, CONTEXT_EXPORT_LOCATION, CONTEXT_KIND, CONTEXT_REGION,
    CapacityRange, ContentSource, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, NodeExpandVolumeRequest,
    NodeExpandVolumeResponse, NodeGetVolumeStatsRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
    PARAM_AVAILABILITY_ZONE, PARAM_BUCKET, PARAM_KIND, PARAM_SHARE_PROTO, PARAM_VOLUME_TYPE,
    PUBLISH_DEVICE_PATH, PluginCapability, PluginInfo, SECRET_ACCESS_KEY, SECRET_SECRET_KEY,
    UsageUnit, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeCapability, VolumeIdRequest, VolumeKind, VolumeRef, VolumeStats, VolumeStatus,
    VolumeUsage,
};

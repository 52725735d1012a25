//! Routes decoded requests to the services this process runs.

use std::future::Future;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::controller::ControllerService;
use super::identity::IdentityService;
use super::message::{RpcRequest, RpcResponse};
use super::node::NodeService;
use super::status::RpcStatus;
use crate::transport::{self, TransportError};

/// Identity plus whichever of the controller and node services are enabled.
#[derive(Clone, Debug)]
pub struct RpcServer {
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl RpcServer {
    /// Creates a server; identity calls are always answered.
    #[must_use]
    pub const fn new(controller: Option<ControllerService>, node: Option<NodeService>) -> Self {
        Self {
            identity: IdentityService::new(controller.is_some()),
            controller,
            node,
        }
    }

    /// Answers one request. Failures become [`RpcResponse::Error`].
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let method = request.method();
        match self.route(request).await {
            Ok(response) => response,
            Err(status) => {
                warn!(method, code = %status.code, message = %status.message, "request failed");
                RpcResponse::Error(status)
            }
        }
    }

    /// Accepts connections until `shutdown` resolves, serving each on its
    /// own task.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when accepting a connection fails.
    pub async fn serve<F>(self: Arc<Self>, listener: UnixListener, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("plugin server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(TransportError::Io)?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.respond(stream).await {
                            warn!(error = %err, "plugin connection failed");
                        }
                    });
                }
            }
        }
    }

    async fn respond(&self, mut stream: UnixStream) -> Result<(), TransportError> {
        let response = match transport::read_request::<RpcRequest>(&mut stream).await {
            Ok(request) => {
                debug!(%request, "handling request");
                self.dispatch(request).await
            }
            Err(err) => {
                debug!(error = %err, "rejecting unreadable request");
                RpcResponse::Error(RpcStatus::invalid_argument(err.to_string()))
            }
        };
        transport::write_response(&mut stream, &response).await
    }

    async fn route(&self, request: RpcRequest) -> Result<RpcResponse, RpcStatus> {
        let response = match request {
            RpcRequest::GetPluginInfo => RpcResponse::PluginInfo(self.identity.plugin_info()),
            RpcRequest::GetPluginCapabilities => {
                RpcResponse::PluginCapabilities(self.identity.capabilities())
            }
            RpcRequest::Probe => RpcResponse::Ready(self.identity.probe()),
            RpcRequest::CreateVolume(req) => {
                RpcResponse::Volume(self.controller()?.create_volume(&req).await?)
            }
            RpcRequest::DeleteVolume(req) => {
                self.controller()?.delete_volume(&req).await?;
                RpcResponse::Empty
            }
            RpcRequest::ControllerGetVolume(req) => {
                RpcResponse::VolumeStatus(self.controller()?.get_volume(&req).await?)
            }
            RpcRequest::ControllerExpandVolume(req) => {
                RpcResponse::ControllerExpanded(self.controller()?.expand_volume(&req).await?)
            }
            RpcRequest::ControllerPublishVolume(req) => {
                RpcResponse::Published(self.controller()?.publish_volume(&req).await?)
            }
            RpcRequest::ControllerUnpublishVolume(req) => {
                self.controller()?.unpublish_volume(&req).await?;
                RpcResponse::Empty
            }
            RpcRequest::ValidateVolumeCapabilities(req) => {
                RpcResponse::Validated(self.controller()?.validate_capabilities(&req).await?)
            }
            RpcRequest::NodeStageVolume(req) => {
                self.node()?.stage_volume(&req).await?;
                RpcResponse::Empty
            }
            RpcRequest::NodeUnstageVolume(req) => {
                self.node()?.unstage_volume(&req).await?;
                RpcResponse::Empty
            }
            RpcRequest::NodePublishVolume(req) => {
                self.node()?.publish_volume(&req).await?;
                RpcResponse::Empty
            }
            RpcRequest::NodeUnpublishVolume(req) => {
                self.node()?.unpublish_volume(&req).await?;
                RpcResponse::Empty
            }
            RpcRequest::NodeGetVolumeStats(req) => {
                RpcResponse::Stats(self.node()?.volume_stats(&req).await?)
            }
            RpcRequest::NodeExpandVolume(req) => {
                RpcResponse::NodeExpanded(self.node()?.expand_volume(&req).await?)
            }
            RpcRequest::NodeGetInfo => RpcResponse::NodeInfo(self.node()?.info()),
        };
        Ok(response)
    }

    fn controller(&self) -> Result<&ControllerService, RpcStatus> {
        self.controller
            .as_ref()
            .ok_or_else(|| RpcStatus::unimplemented("controller service is not enabled"))
    }

    fn node(&self) -> Result<&NodeService, RpcStatus> {
        self.node
            .as_ref()
            .ok_or_else(|| RpcStatus::unimplemented("node service is not enabled"))
    }
}

//! Controller service: provider-side volume lifecycle.

use std::collections::{BTreeMap, HashMap};

use tracing::{info, instrument};

use super::status::RpcStatus;
use super::types::{
    AccessMode, CONTEXT_ENDPOINT_DOMAIN, CONTEXT_EXPORT_LOCATION, CONTEXT_KIND, CONTEXT_REGION,
    ContentSource, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, PARAM_AVAILABILITY_ZONE, PARAM_BUCKET,
    PARAM_KIND, PARAM_SHARE_PROTO, PARAM_VOLUME_TYPE, PUBLISH_DEVICE_PATH,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeCapability, VolumeIdRequest, VolumeKind, VolumeRef, VolumeStatus,
};
use crate::cloud::{CreateSpec, METADATA_PV_NAME, Resource, ResourceKind, SourceRef};
use crate::provision::{Attacher, GIB, Provisioner};

/// Parameters consumed by the controller rather than passed to the provider.
const RESERVED_PARAMS: [&str; 5] = [
    PARAM_KIND,
    PARAM_BUCKET,
    PARAM_VOLUME_TYPE,
    PARAM_SHARE_PROTO,
    PARAM_AVAILABILITY_ZONE,
];

/// Translates controller calls into provisioner and attacher operations.
#[derive(Clone, Debug, Default)]
pub struct ControllerService {
    provisioners: HashMap<ResourceKind, Provisioner>,
    attacher: Option<Attacher>,
    bucket_context: BTreeMap<String, String>,
}

impl ControllerService {
    /// Creates a controller with no provisioners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the provisioner for its kind, replacing any earlier one.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioners.insert(provisioner.kind(), provisioner);
        self
    }

    /// Enables attach and detach of block volumes.
    #[must_use]
    pub fn with_attacher(mut self, attacher: Attacher) -> Self {
        self.attacher = Some(attacher);
        self
    }

    /// Region and endpoint domain written into bucket volume contexts.
    #[must_use]
    pub fn with_bucket_endpoint(mut self, region: &str, endpoint_domain: &str) -> Self {
        self.bucket_context
            .insert(CONTEXT_REGION.to_owned(), region.to_owned());
        self.bucket_context
            .insert(CONTEXT_ENDPOINT_DOMAIN.to_owned(), endpoint_domain.to_owned());
        self
    }

    /// Creates a volume, or returns the existing one with the same name and
    /// attributes.
    ///
    /// # Errors
    ///
    /// Returns [`RpcStatus`] with `InvalidArgument` for malformed requests,
    /// `AlreadyExists` for conflicting or ambiguous names, and the mapped
    /// code of any provider or job failure.
    #[instrument(skip_all, fields(name = %request.name))]
    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, RpcStatus> {
        if request.name.trim().is_empty() {
            return Err(RpcStatus::invalid_argument("volume name must not be empty"));
        }
        if request.capabilities.is_empty() {
            return Err(RpcStatus::invalid_argument(
                "at least one volume capability is required",
            ));
        }
        let kind = request
            .parameters
            .get(PARAM_KIND)
            .map_or(Ok(VolumeKind::Resource(ResourceKind::Block)), |raw| {
                raw.parse()
            })?;
        if let Some(reason) = unsupported_capability(kind, &request.capabilities) {
            return Err(RpcStatus::invalid_argument(reason));
        }

        let Some(resource_kind) = kind.resource_kind() else {
            return self.bucket_volume(request);
        };
        let provisioner = self.provisioner(resource_kind)?;
        let size_gb = provisioner
            .profile()
            .size_for(request.capacity.required_bytes, request.capacity.limit_bytes)?;
        let spec = CreateSpec {
            name: request.name.clone(),
            size_gb,
            source: request
                .content_source
                .as_ref()
                .map(source_ref)
                .transpose()?,
            volume_type: request.parameters.get(PARAM_VOLUME_TYPE).cloned(),
            share_proto: request.parameters.get(PARAM_SHARE_PROTO).cloned(),
            availability_zone: request.parameters.get(PARAM_AVAILABILITY_ZONE).cloned(),
            metadata: BTreeMap::from([(METADATA_PV_NAME.to_owned(), request.name.clone())]),
            parameters: request
                .parameters
                .iter()
                .filter(|(key, _)| !RESERVED_PARAMS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };

        let provisioned = provisioner.provision(&spec).await?;
        info!(
            id = %provisioned.resource.id,
            reused = provisioned.reused,
            "volume ready"
        );
        Ok(volume_from(&provisioned.resource))
    }

    /// Deletes a volume; an absent volume counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`RpcStatus`] for malformed ids and provider or job failures.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn delete_volume(&self, request: &VolumeIdRequest) -> Result<(), RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let Some(kind) = volume.kind.resource_kind() else {
            info!("bucket volumes are not owned by the plugin; nothing to delete");
            return Ok(());
        };
        self.provisioner(kind)?.delete(&volume.id).await?;
        Ok(())
    }

    /// Returns a volume with its status and attachments.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an absent volume.
    pub async fn get_volume(&self, request: &VolumeIdRequest) -> Result<VolumeStatus, RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let Some(kind) = volume.kind.resource_kind() else {
            return Err(RpcStatus::unimplemented(
                "bucket volumes have no provider state",
            ));
        };
        let resource = self.provisioner(kind)?.get(&volume.id).await?;
        Ok(VolumeStatus {
            volume: volume_from(&resource),
            status: resource.status.clone(),
            published_node_ids: resource
                .attachments
                .iter()
                .map(|attachment| attachment.instance_id.clone())
                .collect(),
        })
    }

    /// Grows a volume on the provider.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an absent volume, `OutOfRange` for sizes past
    /// the kind's maximum, and the mapped code of job failures.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn expand_volume(
        &self,
        request: &ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let Some(kind) = volume.kind.resource_kind() else {
            return Err(RpcStatus::unimplemented("bucket volumes cannot be expanded"));
        };
        let provisioner = self.provisioner(kind)?;
        let requested_gb = provisioner
            .profile()
            .size_for(request.capacity.required_bytes, request.capacity.limit_bytes)?;
        let outcome = provisioner.expand(&volume.id, requested_gb).await?;
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: outcome.size_gb.saturating_mul(GIB),
            node_expansion_required: outcome.resize_required,
        })
    }

    /// Attaches a block volume to a node. Shares and buckets need no
    /// attachment and succeed immediately.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for missing fields, `NotFound` for an
    /// absent volume, and the mapped code of job failures.
    #[instrument(skip_all, fields(volume_id = %request.volume_id, node_id = %request.node_id))]
    pub async fn publish_volume(
        &self,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        require_node(&request.node_id)?;
        if volume.kind != VolumeKind::Resource(ResourceKind::Block) {
            return Ok(ControllerPublishVolumeResponse::default());
        }
        let attachment = self
            .attacher()?
            .attach(&request.node_id, &volume.id)
            .await?;
        let publish_context = attachment
            .device
            .into_iter()
            .map(|device| (PUBLISH_DEVICE_PATH.to_owned(), device))
            .collect();
        Ok(ControllerPublishVolumeResponse { publish_context })
    }

    /// Detaches a block volume from a node; an absent attachment counts as
    /// detached.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for missing fields and the mapped code of
    /// job failures.
    #[instrument(skip_all, fields(volume_id = %request.volume_id, node_id = %request.node_id))]
    pub async fn unpublish_volume(
        &self,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<(), RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        require_node(&request.node_id)?;
        if volume.kind != VolumeKind::Resource(ResourceKind::Block) {
            return Ok(());
        }
        self.attacher()?
            .detach(&request.node_id, &volume.id)
            .await?;
        Ok(())
    }

    /// Checks that a volume exists and supports every requested capability.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an absent volume and `InvalidArgument` for an
    /// empty capability list.
    pub async fn validate_capabilities(
        &self,
        request: &ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        if request.capabilities.is_empty() {
            return Err(RpcStatus::invalid_argument(
                "at least one volume capability is required",
            ));
        }
        if let Some(kind) = volume.kind.resource_kind() {
            self.provisioner(kind)?.get(&volume.id).await?;
        }
        let message = unsupported_capability(volume.kind, &request.capabilities);
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: message.is_none(),
            message,
        })
    }

    fn bucket_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, RpcStatus> {
        let bucket = request
            .parameters
            .get(PARAM_BUCKET)
            .filter(|bucket| !bucket.trim().is_empty())
            .ok_or_else(|| RpcStatus::invalid_argument("bucket volumes need a bucket parameter"))?;
        let mut volume_context = self.bucket_context.clone();
        volume_context.insert(CONTEXT_KIND.to_owned(), VolumeKind::Bucket.to_string());
        Ok(Volume {
            volume_id: VolumeRef::new(VolumeKind::Bucket, bucket.clone()).to_string(),
            capacity_bytes: request.capacity.required_bytes,
            volume_context,
            content_source: None,
        })
    }

    fn provisioner(&self, kind: ResourceKind) -> Result<&Provisioner, RpcStatus> {
        self.provisioners
            .get(&kind)
            .ok_or_else(|| RpcStatus::unimplemented(format!("{kind} volumes are not configured")))
    }

    fn attacher(&self) -> Result<&Attacher, RpcStatus> {
        self.attacher
            .as_ref()
            .ok_or_else(|| RpcStatus::unimplemented("volume attachment is not configured"))
    }
}

fn parse_ref(raw: &str) -> Result<VolumeRef, RpcStatus> {
    if raw.trim().is_empty() {
        return Err(RpcStatus::invalid_argument("volume id must not be empty"));
    }
    raw.parse()
}

fn require_node(node_id: &str) -> Result<(), RpcStatus> {
    if node_id.trim().is_empty() {
        Err(RpcStatus::invalid_argument("node id must not be empty"))
    } else {
        Ok(())
    }
}

fn source_ref(source: &ContentSource) -> Result<SourceRef, RpcStatus> {
    match source {
        ContentSource::Snapshot { snapshot_id } if !snapshot_id.trim().is_empty() => {
            Ok(SourceRef::Snapshot(snapshot_id.clone()))
        }
        ContentSource::Volume { volume_id } if !volume_id.trim().is_empty() => {
            Ok(SourceRef::Volume(parse_ref(volume_id)?.id))
        }
        _ => Err(RpcStatus::invalid_argument("content source id must not be empty")),
    }
}

/// Block volumes attach to one instance at a time, so modes that let
/// several nodes write are refused for them.
fn unsupported_capability(kind: VolumeKind, capabilities: &[VolumeCapability]) -> Option<String> {
    if kind != VolumeKind::Resource(ResourceKind::Block) {
        return None;
    }
    capabilities
        .iter()
        .map(|capability| capability.access_mode)
        .find(|mode| mode.is_multi_node_writer())
        .map(|mode: AccessMode| format!("block volumes do not support access mode {mode:?}"))
}

fn volume_from(resource: &Resource) -> Volume {
    let mut volume_context = BTreeMap::from([(
        CONTEXT_KIND.to_owned(),
        resource.kind.as_str().to_owned(),
    )]);
    if let Some(location) = resource.export_location.as_ref() {
        volume_context.insert(CONTEXT_EXPORT_LOCATION.to_owned(), location.clone());
    }
    Volume {
        volume_id: VolumeRef::new(VolumeKind::Resource(resource.kind), resource.id.clone())
            .to_string(),
        capacity_bytes: resource.size_gb.saturating_mul(GIB),
        volume_context,
        content_source: resource.source.as_ref().map(ContentSource::from),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::cloud::{Attachment, CREATED_BY_VALUE, METADATA_CREATED_BY};
    use crate::poll::Backoff;
    use crate::provision::ResourceProfile;
    use crate::rpc::{CapacityRange, RpcCode};
    use crate::test_support::{FakeInstanceApi, FakeResourceApi};

    const FAST: Backoff = Backoff::new(std::time::Duration::from_millis(1), 1.0, 5);

    struct Harness {
        blocks: Arc<FakeResourceApi>,
        shares: Arc<FakeResourceApi>,
        instances: Arc<FakeInstanceApi>,
        controller: ControllerService,
    }

    #[fixture]
    fn harness() -> Harness {
        let blocks = Arc::new(FakeResourceApi::new(ResourceKind::Block));
        let shares = Arc::new(FakeResourceApi::new(ResourceKind::Share));
        let instances = Arc::new(FakeInstanceApi::new());
        let controller = ControllerService::new()
            .with_provisioner(
                Provisioner::new(blocks.clone())
                    .with_profile(ResourceProfile::BLOCK.with_backoff(FAST)),
            )
            .with_provisioner(
                Provisioner::new(shares.clone())
                    .with_profile(ResourceProfile::SHARE.with_backoff(FAST)),
            )
            .with_attacher(Attacher::new(instances.clone()).with_backoff(FAST))
            .with_bucket_endpoint("eu-west-0", "cloud.example.com");
        Harness {
            blocks,
            shares,
            instances,
            controller,
        }
    }

    fn create_request(name: &str, gib: u64, kind: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_owned(),
            capacity: CapacityRange {
                required_bytes: gib.saturating_mul(GIB),
                limit_bytes: 0,
            },
            capabilities: vec![VolumeCapability::default()],
            parameters: BTreeMap::from([(PARAM_KIND.to_owned(), kind.to_owned())]),
            content_source: None,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn create_is_idempotent_by_name(harness: Harness) {
        let request = create_request("pvc-1", 20, "block");

        let first = harness.controller.create_volume(&request).await.expect("create");
        let second = harness.controller.create_volume(&request).await.expect("reuse");

        assert_eq!(first.volume_id, second.volume_id);
        assert!(first.volume_id.starts_with("block/"));
        assert_eq!(first.capacity_bytes, 20 * GIB);
        assert_eq!(harness.blocks.calls().create, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn created_volume_carries_markers(harness: Harness) {
        let volume = harness
            .controller
            .create_volume(&create_request("pvc-2", 1, "block"))
            .await
            .expect("create");
        let id = volume.volume_id.trim_start_matches("block/");
        let resource = harness.blocks.resource(id).expect("stored");

        assert_eq!(resource.size_gb, 10, "raised to the block minimum");
        assert_eq!(
            resource.metadata.get(METADATA_CREATED_BY).map(String::as_str),
            Some(CREATED_BY_VALUE)
        );
        assert_eq!(
            resource.metadata.get(METADATA_PV_NAME).map(String::as_str),
            Some("pvc-2")
        );
    }

    #[rstest]
    #[tokio::test]
    async fn conflicting_size_is_already_exists(harness: Harness) {
        harness
            .controller
            .create_volume(&create_request("pvc-3", 20, "block"))
            .await
            .expect("create");

        let err = harness
            .controller
            .create_volume(&create_request("pvc-3", 30, "block"))
            .await
            .expect_err("conflict");

        assert_eq!(err.code, RpcCode::AlreadyExists);
        assert_eq!(harness.blocks.calls().create, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn share_volume_context_has_export_location(harness: Harness) {
        let volume = harness
            .controller
            .create_volume(&create_request("pvc-4", 5, "share"))
            .await
            .expect("create");

        assert_eq!(
            volume.volume_context.get(CONTEXT_KIND).map(String::as_str),
            Some("share")
        );
        assert!(volume.volume_context.contains_key(CONTEXT_EXPORT_LOCATION));
        assert_eq!(harness.shares.len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn bucket_volume_needs_no_provider(harness: Harness) {
        let mut request = create_request("pvc-5", 1, "bucket");
        request
            .parameters
            .insert(PARAM_BUCKET.to_owned(), String::from("logs"));

        let volume = harness.controller.create_volume(&request).await.expect("create");

        assert_eq!(volume.volume_id, "bucket/logs");
        assert_eq!(
            volume.volume_context.get(CONTEXT_REGION).map(String::as_str),
            Some("eu-west-0")
        );
        assert!(harness.blocks.is_empty());
    }

    #[rstest]
    #[case::no_name("", vec![VolumeCapability::default()])]
    #[case::no_capabilities("pvc", vec![])]
    #[case::multi_writer_block(
        "pvc",
        vec![VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            ..VolumeCapability::default()
        }]
    )]
    #[tokio::test]
    async fn invalid_creates_are_rejected_before_provider_calls(
        harness: Harness,
        #[case] name: &str,
        #[case] capabilities: Vec<VolumeCapability>,
    ) {
        let mut request = create_request(name, 10, "block");
        request.capabilities = capabilities;

        let err = harness
            .controller
            .create_volume(&request)
            .await
            .expect_err("invalid");

        assert_eq!(err.code, RpcCode::InvalidArgument);
        assert_eq!(harness.blocks.calls().list, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn turbo_kind_without_provisioner_is_unimplemented(harness: Harness) {
        let err = harness
            .controller
            .create_volume(&create_request("pvc-6", 500, "turbo"))
            .await
            .expect_err("not configured");

        assert_eq!(err.code, RpcCode::Unimplemented);
    }

    #[rstest]
    #[tokio::test]
    async fn delete_of_missing_volume_succeeds(harness: Harness) {
        let request = VolumeIdRequest {
            volume_id: String::from("block/absent"),
        };

        harness.controller.delete_volume(&request).await.expect("idempotent");
    }

    #[rstest]
    #[tokio::test]
    async fn get_of_missing_volume_is_not_found(harness: Harness) {
        let err = harness
            .controller
            .get_volume(&VolumeIdRequest {
                volume_id: String::from("block/absent"),
            })
            .await
            .expect_err("missing");

        assert_eq!(err.code, RpcCode::NotFound);
    }

    #[rstest]
    #[tokio::test]
    async fn get_lists_attached_nodes(harness: Harness) {
        let mut resource = Resource::new("v-9", "pvc-9", ResourceKind::Block, 10);
        resource.attachments.push(Attachment {
            instance_id: String::from("node-a"),
            device: None,
        });
        harness.blocks.insert(resource);

        let status = harness
            .controller
            .get_volume(&VolumeIdRequest {
                volume_id: String::from("block/v-9"),
            })
            .await
            .expect("get");

        assert_eq!(status.published_node_ids, vec![String::from("node-a")]);
    }

    #[rstest]
    #[tokio::test]
    async fn expand_to_current_size_needs_no_resize(harness: Harness) {
        harness
            .blocks
            .insert(Resource::new("v-1", "pvc", ResourceKind::Block, 20));

        let response = harness
            .controller
            .expand_volume(&ControllerExpandVolumeRequest {
                volume_id: String::from("block/v-1"),
                capacity: CapacityRange {
                    required_bytes: 20 * GIB,
                    limit_bytes: 0,
                },
            })
            .await
            .expect("expand");

        assert!(!response.node_expansion_required);
        assert_eq!(harness.blocks.calls().expand, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn publish_attaches_block_volumes(harness: Harness) {
        harness
            .blocks
            .insert(Resource::new("v-2", "pvc", ResourceKind::Block, 10));
        harness.instances.set_device_on_attach(Some("/dev/vdc"));

        let response = harness
            .controller
            .publish_volume(&ControllerPublishVolumeRequest {
                volume_id: String::from("block/v-2"),
                node_id: String::from("node-a"),
                readonly: false,
            })
            .await
            .expect("publish");

        assert_eq!(
            response.publish_context.get(PUBLISH_DEVICE_PATH).map(String::as_str),
            Some("/dev/vdc")
        );
        assert!(harness.instances.is_attached("node-a", "v-2"));
    }

    #[rstest]
    #[tokio::test]
    async fn publish_of_share_skips_attachment(harness: Harness) {
        harness
            .controller
            .publish_volume(&ControllerPublishVolumeRequest {
                volume_id: String::from("share/s-1"),
                node_id: String::from("node-a"),
                readonly: false,
            })
            .await
            .expect("publish");

        assert_eq!(harness.instances.calls(), (0, 0));
    }

    #[rstest]
    #[tokio::test]
    async fn validate_refuses_multi_writer_block(harness: Harness) {
        harness
            .blocks
            .insert(Resource::new("v-3", "pvc", ResourceKind::Block, 10));

        let response = harness
            .controller
            .validate_capabilities(&ValidateVolumeCapabilitiesRequest {
                volume_id: String::from("block/v-3"),
                capabilities: vec![VolumeCapability {
                    access_mode: AccessMode::MultiNodeMultiWriter,
                    ..VolumeCapability::default()
                }],
            })
            .await
            .expect("validate");

        assert!(!response.confirmed);
        assert!(response.message.is_some());
    }
}

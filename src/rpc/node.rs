//! Node service: staging, publishing and usage of volumes on this node.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::status::RpcStatus;
use super::types::{
    CONTEXT_ENDPOINT_DOMAIN, CONTEXT_EXPORT_LOCATION, CONTEXT_REGION, NodeExpandVolumeRequest,
    NodeExpandVolumeResponse, NodeGetVolumeStatsRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
    PUBLISH_DEVICE_PATH, SECRET_ACCESS_KEY, SECRET_SECRET_KEY, UsageUnit, VolumeKind, VolumeRef,
    VolumeStats, VolumeUsage,
};
use crate::cloud::ResourceKind;
use crate::mount::{BucketMount, MountClient};
use crate::mounter::{self, DEFAULT_FS_TYPE, Mounter};
use crate::provision::DeviceResolver;

/// Filesystem type passed to `mount` for file shares.
const NFS: &str = "nfs";

#[derive(Clone, Debug)]
struct Connector {
    client: MountClient,
    credential_dir: Utf8PathBuf,
}

/// Translates node calls into local mount operations.
#[derive(Clone, Debug)]
pub struct NodeService {
    node_id: String,
    max_volumes_per_node: u32,
    mounter: Mounter,
    devices: DeviceResolver,
    connector: Option<Connector>,
}

impl NodeService {
    /// Creates a node service for `node_id`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, mounter: Mounter, devices: DeviceResolver) -> Self {
        Self {
            node_id: node_id.into(),
            max_volumes_per_node: 0,
            mounter,
            devices,
            connector: None,
        }
    }

    /// Limit reported by [`NodeService::info`].
    #[must_use]
    pub const fn with_max_volumes(mut self, max_volumes_per_node: u32) -> Self {
        self.max_volumes_per_node = max_volumes_per_node;
        self
    }

    /// Enables bucket volumes, delegating their mounts to the connector and
    /// writing credentials into `credential_dir`.
    #[must_use]
    pub fn with_connector(mut self, client: MountClient, credential_dir: impl Into<Utf8PathBuf>) -> Self {
        self.connector = Some(Connector {
            client,
            credential_dir: credential_dir.into(),
        });
        self
    }

    /// Formats a block volume if needed and mounts it at its staging path.
    /// Shares and buckets are mounted directly at publish time.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for missing fields, `NotFound` when no
    /// device path is known, and `Internal` when a mount tool fails.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn stage_volume(&self, request: &NodeStageVolumeRequest) -> Result<(), RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let staging = required_path("staging target path", &request.staging_target_path)?;
        if volume.kind != VolumeKind::Resource(ResourceKind::Block) {
            return Ok(());
        }
        if self.mounter.is_mounted(staging).await? {
            debug!("volume already staged");
            return Ok(());
        }
        let hint = request
            .publish_context
            .get(PUBLISH_DEVICE_PATH)
            .map(String::as_str);
        let device = self.devices.resolve(&self.node_id, &volume.id, hint).await?;
        let wanted = request
            .capability
            .fs_type
            .as_deref()
            .filter(|fs| !fs.is_empty())
            .unwrap_or(DEFAULT_FS_TYPE);
        let fs_type = self.mounter.format_if_needed(&device, wanted).await?;
        self.mounter
            .mount(&device, staging, Some(&fs_type), &request.capability.mount_flags)
            .await?;
        info!(staging, "volume staged");
        Ok(())
    }

    /// Unmounts the staging path; an unmounted path counts as unstaged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for missing fields and `Internal` when
    /// `umount` fails.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn unstage_volume(&self, request: &NodeUnstageVolumeRequest) -> Result<(), RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let staging = required_path("staging target path", &request.staging_target_path)?;
        if volume.kind != VolumeKind::Resource(ResourceKind::Block) {
            return Ok(());
        }
        self.mounter.unmount(staging).await?;
        Ok(())
    }

    /// Makes a volume available at the workload path: a bind mount of the
    /// staging path for block volumes, an NFS mount of the export location
    /// for shares, or a delegated mount for buckets.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for missing fields or secrets,
    /// `Unimplemented` when buckets are not configured, `Unavailable` when
    /// the connector cannot be reached, and `Internal` when a mount fails.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn publish_volume(&self, request: &NodePublishVolumeRequest) -> Result<(), RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let target = required_path("target path", &request.target_path)?;
        match volume.kind {
            VolumeKind::Bucket => return self.publish_bucket(request, &volume, target).await,
            VolumeKind::Resource(ResourceKind::Share | ResourceKind::TurboShare) => {
                return self.publish_share(request, target).await;
            }
            VolumeKind::Resource(ResourceKind::Block) => {}
        }
        let staging = required_path(
            "staging target path",
            request.staging_target_path.as_deref().unwrap_or_default(),
        )?;
        self.mounter
            .bind_mount(staging, target, request.readonly)
            .await?;
        info!(target, "volume published");
        Ok(())
    }

    /// Unmounts the workload path; an unmounted path counts as unpublished.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for missing fields and the mapped code of
    /// unmount failures.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn unpublish_volume(
        &self,
        request: &NodeUnpublishVolumeRequest,
    ) -> Result<(), RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let target = required_path("target path", &request.target_path)?;
        if !self.mounter.is_mounted(target).await? {
            debug!("target not mounted");
            return Ok(());
        }
        if volume.kind == VolumeKind::Bucket {
            self.connector()?.client.unmount(target).await?;
        } else {
            self.mounter.unmount(target).await?;
        }
        info!(target, "volume unpublished");
        Ok(())
    }

    /// Reports byte and inode usage of the filesystem at the volume path.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the path does not exist.
    pub async fn volume_stats(
        &self,
        request: &NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, RpcStatus> {
        parse_ref(&request.volume_id)?;
        let path = required_path("volume path", &request.volume_path)?;
        if tokio::fs::metadata(path).await.is_err() {
            return Err(RpcStatus::not_found(format!("volume path {path} does not exist")));
        }
        let usage = mounter::stats(Utf8Path::new(path))?;
        Ok(VolumeStats {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: usage.total_bytes,
                    available: usage.available_bytes,
                    used: usage.used_bytes,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: usage.total_inodes,
                    available: usage.free_inodes,
                    used: usage.used_inodes,
                },
            ],
        })
    }

    /// Grows the filesystem of a block volume to fill its device. Shares
    /// grow on the provider alone.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing is mounted at the volume path and
    /// `FailedPrecondition` for filesystems that cannot be resized.
    #[instrument(skip_all, fields(volume_id = %request.volume_id))]
    pub async fn expand_volume(
        &self,
        request: &NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, RpcStatus> {
        let volume = parse_ref(&request.volume_id)?;
        let path = required_path("volume path", &request.volume_path)?;
        let response = NodeExpandVolumeResponse {
            capacity_bytes: request.capacity.required_bytes,
        };
        if volume.kind != VolumeKind::Resource(ResourceKind::Block) {
            return Ok(response);
        }
        let mount = self
            .mounter
            .mount_info(path)
            .await?
            .ok_or_else(|| RpcStatus::not_found(format!("nothing is mounted at {path}")))?;
        self.mounter
            .resize(&mount.source, path, &mount.fs_type)
            .await?;
        info!(device = %mount.source, "filesystem resized");
        Ok(response)
    }

    /// Node identity and limits.
    #[must_use]
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
        }
    }

    async fn publish_share(
        &self,
        request: &NodePublishVolumeRequest,
        target: &str,
    ) -> Result<(), RpcStatus> {
        let export = request
            .volume_context
            .get(CONTEXT_EXPORT_LOCATION)
            .filter(|location| !location.trim().is_empty())
            .ok_or_else(|| {
                RpcStatus::invalid_argument("share volume context lacks an export location")
            })?;
        let mut options = request.capability.mount_flags.clone();
        if request.readonly {
            options.push(String::from("ro"));
        }
        self.mounter.mount(export, target, Some(NFS), &options).await?;
        info!(target, "share published");
        Ok(())
    }

    async fn publish_bucket(
        &self,
        request: &NodePublishVolumeRequest,
        volume: &VolumeRef,
        target: &str,
    ) -> Result<(), RpcStatus> {
        let connector = self.connector()?;
        if self.mounter.is_mounted(target).await? {
            debug!("bucket already mounted");
            return Ok(());
        }
        let access_key = secret(request, SECRET_ACCESS_KEY)?;
        let secret_key = secret(request, SECRET_SECRET_KEY)?;
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|err| RpcStatus::internal(format!("cannot create {target}: {err}")))?;

        let credential =
            write_credential(&connector.credential_dir, &format!("{access_key}:{secret_key}"))
                .await?;
        let mut options = request.capability.mount_flags.clone();
        if request.readonly {
            options.push(String::from("ro"));
        }
        let mount = BucketMount {
            bucket: volume.id.clone(),
            target_path: target.to_owned(),
            credential_file: credential.to_string(),
            region: request.volume_context.get(CONTEXT_REGION).cloned(),
            endpoint_domain: request.volume_context.get(CONTEXT_ENDPOINT_DOMAIN).cloned(),
            mount_options: (!options.is_empty()).then(|| options.join(",")),
        };

        match connector.client.mount(&mount).await {
            Ok(()) => {
                info!(target, "bucket published");
                Ok(())
            }
            Err(err) => {
                discard_credential(&credential).await;
                Err(err.into())
            }
        }
    }

    fn connector(&self) -> Result<&Connector, RpcStatus> {
        self.connector
            .as_ref()
            .ok_or_else(|| RpcStatus::unimplemented("bucket volumes are not configured on this node"))
    }
}

fn parse_ref(raw: &str) -> Result<VolumeRef, RpcStatus> {
    if raw.trim().is_empty() {
        return Err(RpcStatus::invalid_argument("volume id must not be empty"));
    }
    raw.parse()
}

fn required_path<'a>(what: &str, value: &'a str) -> Result<&'a str, RpcStatus> {
    if value.trim().is_empty() {
        Err(RpcStatus::invalid_argument(format!("{what} must not be empty")))
    } else {
        Ok(value)
    }
}

fn secret<'a>(request: &'a NodePublishVolumeRequest, key: &str) -> Result<&'a str, RpcStatus> {
    request
        .secrets
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RpcStatus::invalid_argument(format!("secret {key} is required")))
}

/// Writes `contents` to a fresh owner-only file in `dir`.
async fn write_credential(dir: &Utf8Path, contents: &str) -> Result<Utf8PathBuf, RpcStatus> {
    let failed = |err: std::io::Error| RpcStatus::internal(format!("cannot write credential file: {err}"));
    tokio::fs::create_dir_all(dir).await.map_err(failed)?;
    let path = dir.join(Uuid::new_v4().to_string());
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .await
        .map_err(failed)?;
    file.write_all(contents.as_bytes()).await.map_err(failed)?;
    file.flush().await.map_err(failed)?;
    Ok(path)
}

/// Removes a credential the connector did not consume. The connector
/// deletes files it accepted, so an absent file is expected.
async fn discard_credential(path: &Utf8Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(%path, "removed undelivered credential file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, "failed to remove undelivered credential file"),
    }
}

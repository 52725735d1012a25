//! Block volume API backed by the block storage REST service.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::rest::{RestClient, encode_query};
use super::{Attachment, CloudFuture, CreateSpec, Resource, ResourceApi, ResourceKind, SourceRef};
use crate::job::{JobHandle, JobKind, JobSnapshot};

const SERVICE: &str = "evs";
const RESOURCE: &str = "volume";

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    volume: CreateVolumePayload<'a>,
}

#[derive(Serialize)]
struct CreateVolumePayload<'a> {
    name: &'a str,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_zone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_volid: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty_map")]
    metadata: &'a BTreeMap<String, String>,
}

fn is_empty_map(map: &&BTreeMap<String, String>) -> bool {
    map.is_empty()
}

#[derive(Serialize)]
struct ExtendBody {
    #[serde(rename = "os-extend")]
    extend: ExtendPayload,
}

#[derive(Serialize)]
struct ExtendPayload {
    new_size: u64,
}

#[derive(Deserialize)]
pub(super) struct JobAccepted {
    pub(super) job_id: String,
}

#[derive(Deserialize)]
pub(super) struct JobBody {
    pub(super) status: String,
    #[serde(default)]
    pub(super) entities: JobEntities,
    #[serde(default)]
    pub(super) fail_reason: Option<String>,
}

#[derive(Default, Deserialize)]
pub(super) struct JobEntities {
    #[serde(default)]
    pub(super) volume_id: Option<String>,
}

impl From<JobBody> for JobSnapshot {
    fn from(body: JobBody) -> Self {
        Self {
            status: body.status,
            entity: body.entities.volume_id,
            reason: body.fail_reason,
        }
    }
}

#[derive(Deserialize)]
struct VolumeList {
    #[serde(default)]
    volumes: Vec<WireVolume>,
}

#[derive(Deserialize)]
struct VolumeEnvelope {
    volume: WireVolume,
}

#[derive(Deserialize)]
struct WireVolume {
    id: String,
    #[serde(default)]
    name: String,
    size: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    volume_type: Option<String>,
    #[serde(default)]
    snapshot_id: Option<String>,
    #[serde(default)]
    source_volid: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Deserialize)]
struct WireAttachment {
    server_id: String,
    #[serde(default)]
    device: Option<String>,
}

impl From<WireVolume> for Resource {
    fn from(wire: WireVolume) -> Self {
        let source = wire
            .snapshot_id
            .filter(|id| !id.is_empty())
            .map(SourceRef::Snapshot)
            .or_else(|| {
                wire.source_volid
                    .filter(|id| !id.is_empty())
                    .map(SourceRef::Volume)
            });
        Self {
            source,
            volume_type: wire.volume_type,
            status: wire.status,
            metadata: wire.metadata,
            attachments: wire
                .attachments
                .into_iter()
                .map(|attachment| Attachment {
                    instance_id: attachment.server_id,
                    device: attachment.device.filter(|device| !device.is_empty()),
                })
                .collect(),
            ..Self::new(wire.id, wire.name, ResourceKind::Block, wire.size)
        }
    }
}

/// [`ResourceApi`] for block volumes.
#[derive(Clone, Debug)]
pub struct RestVolumeApi {
    client: RestClient,
}

impl RestVolumeApi {
    /// Wraps a shared REST client.
    #[must_use]
    pub const fn new(client: RestClient) -> Self {
        Self { client }
    }

    fn volumes_url(&self) -> String {
        format!("{}/cloudvolumes", self.client.service_url(SERVICE, "v2"))
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/jobs/{job_id}", self.client.service_url(SERVICE, "v1"))
    }
}

impl ResourceApi for RestVolumeApi {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Block
    }

    fn list_by_name<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Vec<Resource>> {
        Box::pin(async move {
            let url = format!("{}/detail?name={}", self.volumes_url(), encode_query(name));
            let list: VolumeList = self.client.get_json(&url, RESOURCE, name).await?;
            Ok(list.volumes.into_iter().map(Resource::from).collect())
        })
    }

    fn create<'a>(&'a self, spec: &'a CreateSpec) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let (snapshot_id, source_volid) = match &spec.source {
                Some(SourceRef::Snapshot(id)) => (Some(id.as_str()), None),
                Some(SourceRef::Volume(id)) => (None, Some(id.as_str())),
                None => (None, None),
            };
            let body = CreateVolumeBody {
                volume: CreateVolumePayload {
                    name: &spec.name,
                    size: spec.size_gb,
                    volume_type: spec.volume_type.as_deref(),
                    availability_zone: spec.availability_zone.as_deref(),
                    snapshot_id,
                    source_volid,
                    metadata: &spec.metadata,
                },
            };
            let accepted: JobAccepted = self
                .client
                .send_json(
                    Method::POST,
                    &self.volumes_url(),
                    Some(&body),
                    RESOURCE,
                    &spec.name,
                )
                .await?;
            Ok(JobHandle::new(accepted.job_id, JobKind::Compute))
        })
    }

    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot> {
        Box::pin(async move {
            let body: JobBody = self
                .client
                .get_json(&self.job_url(&job.id), "job", &job.id)
                .await?;
            Ok(JobSnapshot::from(body))
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Resource> {
        Box::pin(async move {
            let url = format!("{}/{id}", self.volumes_url());
            let envelope: VolumeEnvelope = self.client.get_json(&url, RESOURCE, id).await?;
            Ok(Resource::from(envelope.volume))
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Option<JobHandle>> {
        Box::pin(async move {
            let url = format!("{}/{id}", self.volumes_url());
            let accepted: JobAccepted = self
                .client
                .send_json::<(), _>(Method::DELETE, &url, None, RESOURCE, id)
                .await?;
            Ok(Some(JobHandle::new(accepted.job_id, JobKind::Compute)))
        })
    }

    fn expand<'a>(&'a self, id: &'a str, new_size_gb: u64) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let url = format!("{}/{id}/action", self.volumes_url());
            let body = ExtendBody {
                extend: ExtendPayload {
                    new_size: new_size_gb,
                },
            };
            let accepted: JobAccepted = self
                .client
                .send_json(Method::POST, &url, Some(&body), RESOURCE, id)
                .await?;
            Ok(JobHandle::new(accepted.job_id, JobKind::Compute))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_volume_maps_snapshot_source_and_attachments() {
        let wire: WireVolume = serde_json::from_str(
            r#"{
                "id": "vol-1",
                "name": "pvc-1",
                "size": 20,
                "status": "in-use",
                "snapshot_id": "snap-1",
                "source_volid": "",
                "metadata": {"created_by": "stowage"},
                "attachments": [{"server_id": "node-a", "device": "/dev/vdb"}]
            }"#,
        )
        .expect("wire volume should parse");

        let resource = Resource::from(wire);
        assert_eq!(resource.kind, ResourceKind::Block);
        assert_eq!(resource.source, Some(SourceRef::Snapshot(String::from("snap-1"))));
        assert_eq!(resource.attachments.len(), 1);
        assert_eq!(
            resource.attachments.first().and_then(|a| a.device.as_deref()),
            Some("/dev/vdb")
        );
    }

    #[test]
    fn create_body_omits_absent_fields() {
        let metadata = BTreeMap::new();
        let body = CreateVolumeBody {
            volume: CreateVolumePayload {
                name: "pvc-1",
                size: 10,
                volume_type: Some("SSD"),
                availability_zone: None,
                snapshot_id: None,
                source_volid: None,
                metadata: &metadata,
            },
        };
        let json = serde_json::to_string(&body).expect("serialise");
        assert_eq!(
            json,
            r#"{"volume":{"name":"pvc-1","size":10,"volume_type":"SSD"}}"#
        );
    }

    #[test]
    fn extend_body_uses_action_name() {
        let body = ExtendBody {
            extend: ExtendPayload { new_size: 30 },
        };
        let json = serde_json::to_string(&body).expect("serialise");
        assert_eq!(json, r#"{"os-extend":{"new_size":30}}"#);
    }

    #[test]
    fn job_body_captures_volume_entity() {
        let body: JobBody = serde_json::from_str(
            r#"{"status": "SUCCESS", "entities": {"volume_id": "vol-7"}}"#,
        )
        .expect("job body should parse");
        let snapshot = JobSnapshot::from(body);
        assert_eq!(snapshot.status, "SUCCESS");
        assert_eq!(snapshot.entity.as_deref(), Some("vol-7"));
    }
}

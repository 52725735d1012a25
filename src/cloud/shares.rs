//! File share API backed by the shared file system REST service.
//!
//! Shares have no job service: creation and expansion are observed through
//! the share's own status, so the job handle carries the share id.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::rest::{RestClient, encode_query};
use super::{CloudFuture, CreateSpec, Resource, ResourceApi, ResourceKind, SourceRef};
use crate::job::{JobHandle, JobKind, JobSnapshot};

const SERVICE: &str = "sfs";
const RESOURCE: &str = "share";
const DEFAULT_PROTOCOL: &str = "NFS";
const ACCESS_TYPE: &str = "cert";
const ACCESS_LEVEL: &str = "rw";

#[derive(Serialize)]
struct CreateShareBody<'a> {
    share: CreateSharePayload<'a>,
}

#[derive(Serialize)]
struct CreateSharePayload<'a> {
    name: &'a str,
    size: u64,
    share_proto: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_zone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    share_type: Option<&'a str>,
    metadata: &'a BTreeMap<String, String>,
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

#[derive(Serialize)]
struct AllowAccessBody<'a> {
    #[serde(rename = "os-allow_access")]
    allow: AllowAccessPayload<'a>,
}

#[derive(Serialize)]
struct AllowAccessPayload<'a> {
    access_to: &'a str,
    access_type: &'a str,
    access_level: &'a str,
}

#[derive(Deserialize)]
struct ShareList {
    #[serde(default)]
    shares: Vec<WireShare>,
}

#[derive(Deserialize)]
struct ShareEnvelope {
    share: WireShare,
}

#[derive(Deserialize)]
struct WireShare {
    id: String,
    #[serde(default)]
    name: String,
    size: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    share_proto: Option<String>,
    #[serde(default)]
    snapshot_id: Option<String>,
    #[serde(default)]
    export_location: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl From<WireShare> for Resource {
    fn from(wire: WireShare) -> Self {
        Self {
            status: wire.status,
            share_proto: wire.share_proto,
            source: wire
                .snapshot_id
                .filter(|id| !id.is_empty())
                .map(SourceRef::Snapshot),
            export_location: wire.export_location.filter(|loc| !loc.is_empty()),
            metadata: wire.metadata,
            ..Self::new(wire.id, wire.name, ResourceKind::Share, wire.size)
        }
    }
}

/// [`ResourceApi`] for NFS file shares.
#[derive(Clone, Debug)]
pub struct RestShareApi {
    client: RestClient,
}

impl RestShareApi {
    /// Wraps a shared REST client.
    #[must_use]
    pub const fn new(client: RestClient) -> Self {
        Self { client }
    }

    fn shares_url(&self) -> String {
        format!("{}/shares", self.client.service_url(SERVICE, "v2"))
    }

    async fn fetch(&self, id: &str) -> Result<Resource, super::CloudError> {
        let url = format!("{}/{id}", self.shares_url());
        let envelope: ShareEnvelope = self.client.get_json(&url, RESOURCE, id).await?;
        Ok(Resource::from(envelope.share))
    }
}

impl ResourceApi for RestShareApi {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Share
    }

    fn list_by_name<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Vec<Resource>> {
        Box::pin(async move {
            let url = format!("{}/detail?name={}", self.shares_url(), encode_query(name));
            let list: ShareList = self.client.get_json(&url, RESOURCE, name).await?;
            Ok(list.shares.into_iter().map(Resource::from).collect())
        })
    }

    fn create<'a>(&'a self, spec: &'a CreateSpec) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let snapshot_id = match &spec.source {
                Some(SourceRef::Snapshot(id)) => Some(id.as_str()),
                Some(SourceRef::Volume(_)) | None => None,
            };
            let body = CreateShareBody {
                share: CreateSharePayload {
                    name: &spec.name,
                    size: spec.size_gb,
                    share_proto: spec.share_proto.as_deref().unwrap_or(DEFAULT_PROTOCOL),
                    availability_zone: spec.availability_zone.as_deref(),
                    snapshot_id,
                    share_type: spec.parameters.get("share_type").map(String::as_str),
                    metadata: &spec.metadata,
                },
            };
            let created: ShareEnvelope = self
                .client
                .send_json(
                    Method::POST,
                    &self.shares_url(),
                    Some(&body),
                    RESOURCE,
                    &spec.name,
                )
                .await?;
            Ok(JobHandle::new(created.share.id, JobKind::ShareCreate))
        })
    }

    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot> {
        Box::pin(async move {
            let share = self.fetch(&job.id).await?;
            Ok(JobSnapshot {
                status: share.status,
                entity: Some(share.id),
                reason: None,
            })
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Resource> {
        Box::pin(self.fetch(id))
    }

    fn delete<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Option<JobHandle>> {
        Box::pin(async move {
            let url = format!("{}/{id}", self.shares_url());
            self.client
                .send_empty::<()>(Method::DELETE, &url, None, RESOURCE, id)
                .await?;
            Ok(None)
        })
    }

    fn expand<'a>(&'a self, id: &'a str, new_size_gb: u64) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let url = format!("{}/{id}/action", self.shares_url());
            let body = ExtendBody {
                extend: ExtendPayload {
                    new_size: new_size_gb,
                },
            };
            self.client
                .send_empty(Method::POST, &url, Some(&body), RESOURCE, id)
                .await?;
            Ok(JobHandle::new(id, JobKind::ShareExtend))
        })
    }

    fn grant_access<'a>(&'a self, id: &'a str, network_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let url = format!("{}/{id}/action", self.shares_url());
            let body = AllowAccessBody {
                allow: AllowAccessPayload {
                    access_to: network_id,
                    access_type: ACCESS_TYPE,
                    access_level: ACCESS_LEVEL,
                },
            };
            match self
                .client
                .send_empty(Method::POST, &url, Some(&body), RESOURCE, id)
                .await
            {
                Err(err) if err.is_conflict() => Ok(()),
                other => other,
            }
        })
    }
}

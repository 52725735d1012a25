//! Scale-out file share API.
//!
//! The turbo service reports progress through numeric `status` and
//! `sub_status` codes rather than a job service. Creation is tracked through
//! `status`; expansion through `sub_status`.

use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};

use super::rest::RestClient;
use super::{CloudError, CloudFuture, CreateSpec, Resource, ResourceApi, ResourceKind};
use crate::job::{JobHandle, JobKind, JobSnapshot};

const SERVICE: &str = "sfs-turbo";
const RESOURCE: &str = "turbo share";
const DEFAULT_PROTOCOL: &str = "NFS";
const DEFAULT_SHARE_TYPE: &str = "STANDARD";

const PARAM_VPC_ID: &str = "vpc_id";
const PARAM_SUBNET_ID: &str = "subnet_id";
const PARAM_SECURITY_GROUP_ID: &str = "security_group_id";

#[derive(Serialize)]
struct CreateTurboBody<'a> {
    share: CreateTurboPayload<'a>,
}

#[derive(Serialize)]
struct CreateTurboPayload<'a> {
    name: &'a str,
    size: u64,
    share_proto: &'a str,
    share_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_zone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_group_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ExtendBody {
    extend: ExtendPayload,
}

#[derive(Serialize)]
struct ExtendPayload {
    new_size: u64,
}

#[derive(Deserialize)]
struct CreatedTurbo {
    id: String,
}

#[derive(Deserialize)]
struct TurboList {
    #[serde(default)]
    shares: Vec<WireTurbo>,
}

#[derive(Deserialize)]
struct WireTurbo {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(deserialize_with = "size_from_number_or_string")]
    size: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    sub_status: String,
    #[serde(default)]
    share_proto: Option<String>,
    #[serde(default)]
    export_location: Option<String>,
}

/// The service reports sizes as either `500` or `"500.00"`.
fn size_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    match RawSize::deserialize(deserializer)? {
        RawSize::Number(size) => Ok(size),
        RawSize::Text(text) => {
            let whole = text.split('.').next().unwrap_or_default().trim();
            whole
                .parse::<u64>()
                .map_err(|err| serde::de::Error::custom(format!("invalid size '{text}': {err}")))
        }
    }
}

impl From<WireTurbo> for Resource {
    fn from(wire: WireTurbo) -> Self {
        Self {
            status: wire.status,
            share_proto: wire.share_proto,
            export_location: wire.export_location.filter(|loc| !loc.is_empty()),
            ..Self::new(wire.id, wire.name, ResourceKind::TurboShare, wire.size)
        }
    }
}

/// [`ResourceApi`] for scale-out file shares.
#[derive(Clone, Debug)]
pub struct RestTurboShareApi {
    client: RestClient,
}

impl RestTurboShareApi {
    /// Wraps a shared REST client.
    #[must_use]
    pub const fn new(client: RestClient) -> Self {
        Self { client }
    }

    fn shares_url(&self) -> String {
        format!("{}/sfs-turbo/shares", self.client.service_url(SERVICE, "v1"))
    }

    async fn fetch(&self, id: &str) -> Result<WireTurbo, CloudError> {
        let url = format!("{}/{id}", self.shares_url());
        self.client.get_json(&url, RESOURCE, id).await
    }
}

impl ResourceApi for RestTurboShareApi {
    fn kind(&self) -> ResourceKind {
        ResourceKind::TurboShare
    }

    fn list_by_name<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Vec<Resource>> {
        Box::pin(async move {
            let url = format!("{}/detail", self.shares_url());
            let list: TurboList = self.client.get_json(&url, RESOURCE, name).await?;
            Ok(list
                .shares
                .into_iter()
                .filter(|share| share.name == name)
                .map(Resource::from)
                .collect())
        })
    }

    fn create<'a>(&'a self, spec: &'a CreateSpec) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let param = |key: &str| spec.parameters.get(key).map(String::as_str);
            let body = CreateTurboBody {
                share: CreateTurboPayload {
                    name: &spec.name,
                    size: spec.size_gb,
                    share_proto: spec.share_proto.as_deref().unwrap_or(DEFAULT_PROTOCOL),
                    share_type: param("share_type").unwrap_or(DEFAULT_SHARE_TYPE),
                    availability_zone: spec.availability_zone.as_deref(),
                    vpc_id: param(PARAM_VPC_ID),
                    subnet_id: param(PARAM_SUBNET_ID),
                    security_group_id: param(PARAM_SECURITY_GROUP_ID),
                },
            };
            let created: CreatedTurbo = self
                .client
                .send_json(
                    Method::POST,
                    &self.shares_url(),
                    Some(&body),
                    RESOURCE,
                    &spec.name,
                )
                .await?;
            Ok(JobHandle::new(created.id, JobKind::TurboCreate))
        })
    }

    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot> {
        Box::pin(async move {
            let share = self.fetch(&job.id).await?;
            let status = match job.kind {
                JobKind::TurboExtend => share.sub_status,
                _ => share.status,
            };
            Ok(JobSnapshot {
                status,
                entity: Some(share.id),
                reason: None,
            })
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Resource> {
        Box::pin(async move { self.fetch(id).await.map(Resource::from) })
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
            Ok(JobHandle::new(id, JobKind::TurboExtend))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"id": "t-1", "size": 500}"#, 500)]
    #[case(r#"{"id": "t-1", "size": "600.00"}"#, 600)]
    #[case(r#"{"id": "t-1", "size": "700"}"#, 700)]
    fn size_accepts_numbers_and_decimal_strings(#[case] raw: &str, #[case] expected: u64) {
        let wire: WireTurbo = serde_json::from_str(raw).expect("turbo share should parse");
        assert_eq!(wire.size, expected);
    }

    #[test]
    fn size_rejects_garbage() {
        let result = serde_json::from_str::<WireTurbo>(r#"{"id": "t-1", "size": "lots"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn create_body_carries_network_parameters() {
        let body = CreateTurboBody {
            share: CreateTurboPayload {
                name: "pvc-3",
                size: 500,
                share_proto: DEFAULT_PROTOCOL,
                share_type: DEFAULT_SHARE_TYPE,
                availability_zone: None,
                vpc_id: Some("vpc-1"),
                subnet_id: Some("subnet-1"),
                security_group_id: None,
            },
        };
        let json = serde_json::to_value(&body).expect("serialise");
        assert_eq!(json["share"]["vpc_id"], "vpc-1");
        assert_eq!(json["share"]["subnet_id"], "subnet-1");
        assert!(json["share"].get("security_group_id").is_none());
    }
}

//! Attach and detach operations against compute instances.

use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::rest::RestClient;
use super::volumes::{JobAccepted, JobBody};
use super::{Attachment, CloudFuture, InstanceApi};
use crate::job::{JobHandle, JobKind, JobSnapshot};

const SERVICE: &str = "ecs";
const RESOURCE: &str = "attachment";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachBody<'a> {
    volume_attachment: AttachPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachPayload<'a> {
    volume_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentEnvelope {
    volume_attachment: WireAttachment,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttachment {
    server_id: String,
    #[serde(default)]
    device: Option<String>,
}

/// [`InstanceApi`] backed by the compute REST service.
#[derive(Clone, Debug)]
pub struct RestInstanceApi {
    client: RestClient,
}

impl RestInstanceApi {
    /// Wraps a shared REST client.
    #[must_use]
    pub const fn new(client: RestClient) -> Self {
        Self { client }
    }

    fn server_url(&self, instance_id: &str) -> String {
        format!(
            "{}/cloudservers/{instance_id}",
            self.client.service_url(SERVICE, "v1")
        )
    }
}

impl InstanceApi for RestInstanceApi {
    fn attach<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let url = format!("{}/attachvolume", self.server_url(instance_id));
            let body = AttachBody {
                volume_attachment: AttachPayload { volume_id },
            };
            let accepted: JobAccepted = self
                .client
                .send_json(Method::POST, &url, Some(&body), RESOURCE, volume_id)
                .await?;
            Ok(JobHandle::new(accepted.job_id, JobKind::Compute))
        })
    }

    fn detach<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, JobHandle> {
        Box::pin(async move {
            let url = format!("{}/detachvolume/{volume_id}", self.server_url(instance_id));
            let accepted: JobAccepted = self
                .client
                .send_json::<(), _>(Method::DELETE, &url, None, RESOURCE, volume_id)
                .await?;
            Ok(JobHandle::new(accepted.job_id, JobKind::Compute))
        })
    }

    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot> {
        Box::pin(async move {
            let url = format!("{}/jobs/{}", self.client.service_url(SERVICE, "v1"), job.id);
            let body: JobBody = self.client.get_json(&url, "job", &job.id).await?;
            Ok(JobSnapshot::from(body))
        })
    }

    fn attachment<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, Option<Attachment>> {
        Box::pin(async move {
            let url = format!(
                "{}/os-volume_attachments/{volume_id}",
                self.server_url(instance_id)
            );
            match self
                .client
                .get_json::<AttachmentEnvelope>(&url, RESOURCE, volume_id)
                .await
            {
                Ok(envelope) => Ok(Some(Attachment {
                    instance_id: envelope.volume_attachment.server_id,
                    device: envelope
                        .volume_attachment
                        .device
                        .filter(|device| !device.is_empty()),
                })),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            }
        })
    }
}

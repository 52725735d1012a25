//! Attach, detach and device path resolution for block volumes.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::ProvisionError;
use crate::cloud::{Attachment, InstanceApi, MetadataApi};
use crate::job::wait_for_job;
use crate::poll::Backoff;

/// Controller-side attach and detach.
#[derive(Clone)]
pub struct Attacher {
    instances: Arc<dyn InstanceApi>,
    backoff: Backoff,
}

impl std::fmt::Debug for Attacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attacher")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Attacher {
    /// Creates an attacher using the default job schedule.
    #[must_use]
    pub fn new(instances: Arc<dyn InstanceApi>) -> Self {
        Self {
            instances,
            backoff: Backoff::JOB,
        }
    }

    /// Overrides the job schedule.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attaches `volume_id` to `instance_id`, returning the attachment.
    ///
    /// An existing attachment is returned without submitting a job.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the provider rejects the request or
    /// the attach job fails.
    #[instrument(skip(self))]
    pub async fn attach(
        &self,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<Attachment, ProvisionError> {
        if let Some(existing) = self.instances.attachment(instance_id, volume_id).await? {
            debug!("volume already attached");
            return Ok(existing);
        }

        let job = self
            .instances
            .attach(instance_id, volume_id)
            .await
            .map_err(|err| ProvisionError::from_lookup(volume_id, err))?;
        info!(job_id = %job.id, "attach submitted");
        self.wait(&job).await?;

        let attachment = self
            .instances
            .attachment(instance_id, volume_id)
            .await?
            .unwrap_or_else(|| Attachment {
                instance_id: instance_id.to_owned(),
                device: None,
            });
        info!(device = ?attachment.device, "volume attached");
        Ok(attachment)
    }

    /// Detaches `volume_id` from `instance_id`. A missing attachment counts
    /// as detached.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the provider rejects the request or
    /// the detach job fails.
    #[instrument(skip(self))]
    pub async fn detach(&self, instance_id: &str, volume_id: &str) -> Result<(), ProvisionError> {
        match self.instances.attachment(instance_id, volume_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("volume not attached");
                return Ok(());
            }
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let job = match self.instances.detach(instance_id, volume_id).await {
            Ok(job) => job,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        info!(job_id = %job.id, "detach submitted");
        self.wait(&job).await?;
        info!("volume detached");
        Ok(())
    }

    async fn wait(&self, job: &crate::job::JobHandle) -> Result<(), ProvisionError> {
        let instances = self.instances.as_ref();
        wait_for_job(job, self.backoff, move || instances.job_status(job)).await?;
        Ok(())
    }
}

/// Node-side device path lookup with a metadata service fallback.
#[derive(Clone)]
pub struct DeviceResolver {
    metadata: Arc<dyn MetadataApi>,
}

impl std::fmt::Debug for DeviceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceResolver").finish_non_exhaustive()
    }
}

impl DeviceResolver {
    /// Creates a resolver backed by the instance metadata service.
    #[must_use]
    pub fn new(metadata: Arc<dyn MetadataApi>) -> Self {
        Self { metadata }
    }

    /// Returns `hint` when the provider reported a device path, otherwise
    /// asks the metadata service.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::DeviceNotFound`] when neither source knows
    /// the device and [`ProvisionError::Cloud`] when the lookup fails.
    pub async fn resolve(
        &self,
        instance_id: &str,
        volume_id: &str,
        hint: Option<&str>,
    ) -> Result<String, ProvisionError> {
        if let Some(device) = hint.filter(|device| !device.trim().is_empty()) {
            return Ok(device.to_owned());
        }
        self.metadata
            .device_for(volume_id)
            .await?
            .ok_or_else(|| ProvisionError::DeviceNotFound {
                volume_id: volume_id.to_owned(),
                instance_id: instance_id.to_owned(),
            })
    }
}

//! Create-or-reuse and delete.

use tracing::{info, instrument, warn};

use super::{ProvisionError, Provisioner};
use crate::cloud::{CREATED_BY_VALUE, CloudError, CreateSpec, METADATA_CREATED_BY, Resource};
use crate::job::{JobHandle, JobSnapshot, JobState, wait_for_job};

/// Result of [`Provisioner::provision`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Provisioned {
    /// The created or reused resource.
    pub resource: Resource,
    /// `true` when an existing resource satisfied the request.
    pub reused: bool,
}

impl Provisioner {
    /// Runs the full provisioning sequence: validate, create or reuse by name,
    /// then grant the configured network access.
    ///
    /// Safe under retried delivery: a second call with identical inputs
    /// returns the same resource without another create request.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when validation fails, the name is taken by
    /// a conflicting or ambiguous set of resources, or a provider call or job
    /// fails.
    #[instrument(skip_all, fields(kind = %self.profile.kind, name = %spec.name))]
    pub async fn provision(&self, spec: &CreateSpec) -> Result<Provisioned, ProvisionError> {
        self.validate(spec)?;
        let provisioned = self.create_or_reuse(spec).await?;
        if let Some(network_id) = self.access_network.as_deref() {
            self.api
                .grant_access(&provisioned.resource.id, network_id)
                .await?;
        }
        Ok(provisioned)
    }

    /// Returns the single resource named `spec.name` when its attributes
    /// match, or creates it when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Conflict`] when the existing resource
    /// differs, [`ProvisionError::Ambiguous`] when several share the name,
    /// and job or provider errors from the create path.
    pub async fn create_or_reuse(&self, spec: &CreateSpec) -> Result<Provisioned, ProvisionError> {
        let mut matches: Vec<Resource> = self
            .api
            .list_by_name(&spec.name)
            .await?
            .into_iter()
            .filter(|resource| resource.name == spec.name)
            .collect();

        if matches.len() > 1 {
            let ids: Vec<String> = matches.into_iter().map(|resource| resource.id).collect();
            warn!(count = ids.len(), "multiple resources share the requested name");
            return Err(ProvisionError::Ambiguous {
                name: spec.name.clone(),
                count: ids.len(),
                ids,
            });
        }

        if let Some(existing) = matches.pop() {
            self.check_reusable(&existing, spec)?;
            info!(id = %existing.id, "reusing existing resource");
            let resource = self.await_ready(existing).await?;
            return Ok(Provisioned {
                resource,
                reused: true,
            });
        }

        let resource = self.create_new(spec).await?;
        Ok(Provisioned {
            resource,
            reused: false,
        })
    }

    /// Deletes a resource, treating an absent resource as already deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] for provider failures other than not found
    /// and for failed or timed out delete jobs.
    #[instrument(skip(self), fields(kind = %self.profile.kind))]
    pub async fn delete(&self, id: &str) -> Result<(), ProvisionError> {
        match self.api.get(id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                info!("resource already absent");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let job = match self.api.delete(id).await {
            Ok(job) => job,
            Err(err) if err.is_not_found() => {
                info!("resource vanished before delete");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(handle) = job {
            let api = self.api.as_ref();
            let handle_ref = &handle;
            wait_for_job(handle_ref, self.profile.expand_backoff, move || {
                api.job_status(handle_ref)
            })
            .await?;
        }
        info!("resource deleted");
        Ok(())
    }

    fn validate(&self, spec: &CreateSpec) -> Result<(), ProvisionError> {
        if spec.name.trim().is_empty() {
            return Err(ProvisionError::InvalidArgument(String::from(
                "name must not be empty",
            )));
        }
        self.profile.check_bounds(spec.size_gb)
    }

    fn check_reusable(&self, existing: &Resource, spec: &CreateSpec) -> Result<(), ProvisionError> {
        let conflict = |reason: String| ProvisionError::Conflict {
            name: spec.name.clone(),
            reason,
        };

        if existing.is_abnormal() {
            return Err(conflict(format!(
                "existing resource {} is in status {}",
                existing.id, existing.status
            )));
        }
        if existing.size_gb != spec.size_gb {
            return Err(conflict(format!(
                "size {} GiB differs from requested {} GiB",
                existing.size_gb, spec.size_gb
            )));
        }
        if self.profile.tracks_source && existing.source != spec.source {
            return Err(conflict(format!(
                "source {:?} differs from requested {:?}",
                existing.source, spec.source
            )));
        }
        if let (Some(have), Some(want)) = (&existing.volume_type, &spec.volume_type) {
            if !have.eq_ignore_ascii_case(want) {
                return Err(conflict(format!(
                    "volume type {have} differs from requested {want}"
                )));
            }
        }
        if let (Some(have), Some(want)) = (&existing.share_proto, &spec.share_proto) {
            if !have.eq_ignore_ascii_case(want) {
                return Err(conflict(format!(
                    "protocol {have} differs from requested {want}"
                )));
            }
        }
        Ok(())
    }

    /// Waits for a reused resource that is still being created, polling its
    /// own status under the create schedule.
    async fn await_ready(&self, existing: Resource) -> Result<Resource, ProvisionError> {
        let kind = self.profile.creation_status();
        if kind.classify(&existing.status) != Some(JobState::Pending) {
            return Ok(existing);
        }
        info!(id = %existing.id, status = %existing.status, "waiting for existing resource");

        let handle = JobHandle::new(existing.id.clone(), kind);
        let api = self.api.as_ref();
        let id = existing.id.as_str();
        wait_for_job(&handle, self.profile.create_backoff, move || async move {
            let resource = api.get(id).await?;
            Ok::<_, CloudError>(JobSnapshot {
                status: resource.status,
                entity: Some(resource.id),
                reason: None,
            })
        })
        .await?;
        self.get(id).await
    }

    async fn create_new(&self, spec: &CreateSpec) -> Result<Resource, ProvisionError> {
        let mut request = spec.clone();
        request
            .metadata
            .insert(METADATA_CREATED_BY.to_owned(), CREATED_BY_VALUE.to_owned());

        let job = self.api.create(&request).await?;
        info!(job_id = %job.id, size_gb = request.size_gb, "create submitted");

        let api = self.api.as_ref();
        let job_ref = &job;
        let outcome = wait_for_job(job_ref, self.profile.create_backoff, move || {
            api.job_status(job_ref)
        })
        .await?;

        let id = outcome.entity.ok_or_else(|| ProvisionError::MissingEntity {
            job_id: outcome.job_id.clone(),
        })?;
        let resource = self.get(&id).await?;
        info!(id = %resource.id, "resource created");
        Ok(resource)
    }
}

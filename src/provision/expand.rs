//! Volume expansion with minimum-step rounding and post-job verification.

use tracing::{info, instrument};

use super::{ProvisionError, Provisioner};
use crate::job::wait_for_job;

/// Result of [`Provisioner::expand`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExpandOutcome {
    /// Size of the resource after the call, in GiB.
    pub size_gb: u64,
    /// `true` when the node must grow the filesystem.
    pub resize_required: bool,
}

impl Provisioner {
    /// Grows a resource to at least `requested_gb`.
    ///
    /// A request at or below the current size is a no-op that issues no
    /// provider mutation. Increases smaller than the kind's expansion step
    /// are rounded up to `current + step`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] for a missing resource,
    /// [`ProvisionError::OutOfRange`] when the target exceeds the kind's
    /// maximum and [`ProvisionError::SizeMismatch`] when the provider reports
    /// a different size once the job has finished.
    #[instrument(skip(self), fields(kind = %self.profile.kind))]
    pub async fn expand(&self, id: &str, requested_gb: u64) -> Result<ExpandOutcome, ProvisionError> {
        let current = self.get(id).await?;
        if current.size_gb >= requested_gb {
            info!(size_gb = current.size_gb, "resource already large enough");
            return Ok(ExpandOutcome {
                size_gb: current.size_gb,
                resize_required: false,
            });
        }

        let target_gb = self.expand_target(current.size_gb, requested_gb)?;
        let job = self
            .api
            .expand(id, target_gb)
            .await
            .map_err(|err| ProvisionError::from_lookup(id, err))?;
        info!(job_id = %job.id, from_gb = current.size_gb, target_gb, "expand submitted");

        let api = self.api.as_ref();
        let job_ref = &job;
        wait_for_job(job_ref, self.profile.expand_backoff, move || {
            api.job_status(job_ref)
        })
        .await?;

        let refreshed = self.get(id).await?;
        if refreshed.size_gb != target_gb {
            return Err(ProvisionError::SizeMismatch {
                id: id.to_owned(),
                expected_gb: target_gb,
                actual_gb: refreshed.size_gb,
            });
        }
        info!(size_gb = refreshed.size_gb, "resource expanded");
        Ok(ExpandOutcome {
            size_gb: refreshed.size_gb,
            resize_required: self.profile.node_expansion,
        })
    }

    fn expand_target(&self, current_gb: u64, requested_gb: u64) -> Result<u64, ProvisionError> {
        let minimum = current_gb.saturating_add(self.profile.expand_step_gb);
        let target_gb = requested_gb.max(minimum);
        match self.profile.max_gb {
            Some(max_gb) if target_gb > max_gb => Err(ProvisionError::OutOfRange(format!(
                "expanding {} to {target_gb} GiB exceeds maximum {max_gb} GiB",
                self.profile.kind
            ))),
            _ => Ok(target_gb),
        }
    }
}

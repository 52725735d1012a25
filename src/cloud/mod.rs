//! Cloud provider collaborators.
//!
//! The provisioner talks to the provider through the small capability
//! traits defined here: [`ResourceApi`] once per storage kind,
//! [`InstanceApi`] for attachments and [`MetadataApi`] for the instance
//! metadata service. The REST implementations live in the submodules; tests
//! use the in-memory doubles from [`crate::test_support`].

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::job::{JobHandle, JobSnapshot};

mod instances;
mod metadata;
mod rest;
mod shares;
mod turbo;
mod types;
mod volumes;

pub use instances::RestInstanceApi;
pub use metadata::MetadataServiceClient;
pub use rest::RestClient;
pub use shares::RestShareApi;
pub use turbo::RestTurboShareApi;
pub use types::{
    Attachment, CREATED_BY_VALUE, CreateSpec, METADATA_CREATED_BY, METADATA_PV_NAME, Resource,
    ResourceKind, SourceRef,
};
pub use volumes::RestVolumeApi;

/// Errors returned by cloud collaborators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// The addressed resource does not exist.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource type (for example `volume`).
        resource: String,
        /// Identifier that was looked up.
        id: String,
    },
    /// The provider rejected the request.
    #[error("provider returned HTTP {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or error message.
        message: String,
    },
    /// The request never produced a response.
    #[error("transport error: {message}")]
    Transport {
        /// Transport level failure description.
        message: String,
    },
    /// The provider response could not be decoded.
    #[error("failed to decode {resource} response: {message}")]
    Decode {
        /// Resource type being decoded.
        resource: String,
        /// Decoder error message.
        message: String,
    },
}

impl CloudError {
    /// Returns `true` for the distinguishable "not found" condition.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` when the provider reported a conflict (HTTP 409).
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }
}

/// Future returned by cloud operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Capabilities the provisioner needs for one kind of storage.
pub trait ResourceApi: Send + Sync {
    /// Kind of storage served by this implementation.
    fn kind(&self) -> ResourceKind;

    /// Lists resources whose name matches `name`.
    ///
    /// Providers may filter by prefix or substring; callers compare names
    /// exactly.
    fn list_by_name<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Vec<Resource>>;

    /// Submits a create request and returns the job tracking it.
    fn create<'a>(&'a self, spec: &'a CreateSpec) -> CloudFuture<'a, JobHandle>;

    /// Looks up the status of a job returned by this implementation.
    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot>;

    /// Fetches a resource by id.
    fn get<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Resource>;

    /// Submits a delete request. Returns a job when deletion is asynchronous.
    fn delete<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Option<JobHandle>>;

    /// Submits an expand request to `new_size_gb`.
    fn expand<'a>(&'a self, id: &'a str, new_size_gb: u64) -> CloudFuture<'a, JobHandle>;

    /// Grants the given network access to the resource. Kinds without access
    /// control accept every call.
    fn grant_access<'a>(&'a self, id: &'a str, network_id: &'a str) -> CloudFuture<'a, ()> {
        let _ = (id, network_id);
        Box::pin(async { Ok(()) })
    }
}

/// Attachment operations against compute instances.
pub trait InstanceApi: Send + Sync {
    /// Submits an attach job for `volume_id` on `instance_id`.
    fn attach<'a>(&'a self, instance_id: &'a str, volume_id: &'a str)
    -> CloudFuture<'a, JobHandle>;

    /// Submits a detach job for `volume_id` on `instance_id`.
    fn detach<'a>(&'a self, instance_id: &'a str, volume_id: &'a str)
    -> CloudFuture<'a, JobHandle>;

    /// Looks up the status of an attach or detach job.
    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot>;

    /// Returns the attachment of `volume_id` on `instance_id`, if any.
    fn attachment<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, Option<Attachment>>;
}

/// Instance metadata service lookups performed from the node itself.
pub trait MetadataApi: Send + Sync {
    /// Resolves the OS device path for `volume_id`, if the metadata service
    /// knows it.
    fn device_for<'a>(&'a self, volume_id: &'a str) -> CloudFuture<'a, Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable() {
        let err = CloudError::NotFound {
            resource: String::from("volume"),
            id: String::from("vol-1"),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "volume vol-1 not found");
    }

    #[test]
    fn conflict_detection_uses_status_code() {
        let err = CloudError::Api {
            status: 409,
            message: String::from("rule exists"),
        };
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }
}

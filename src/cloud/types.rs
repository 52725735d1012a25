//! Provider resource model shared by the cloud clients and the provisioner.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metadata key recording which system created a resource.
pub const METADATA_CREATED_BY: &str = "created_by";
/// Value stored under [`METADATA_CREATED_BY`].
pub const CREATED_BY_VALUE: &str = "stowage";
/// Metadata key recording the orchestrator-side volume name.
pub const METADATA_PV_NAME: &str = "pv_name";

/// Kinds of provisionable storage.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceKind {
    /// Block volume attached to a single instance.
    Block,
    /// NFS file share.
    Share,
    /// Scale-out NFS file share with large minimum sizes.
    TurboShare,
}

impl ResourceKind {
    /// Stable string form used in volume identifiers and parameters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Share => "share",
            Self::TurboShare => "turbo",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" | "evs" => Ok(Self::Block),
            "share" | "sfs" => Ok(Self::Share),
            "turbo" | "sfs-turbo" => Ok(Self::TurboShare),
            other => Err(format!("unknown resource kind '{other}'")),
        }
    }
}

/// Immutable content source of a resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceRef {
    /// Created from a snapshot.
    Snapshot(String),
    /// Cloned from another volume.
    Volume(String),
}

/// Relationship between a resource and a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Instance the resource is attached to.
    pub instance_id: String,
    /// Device path reported by the provider, when known.
    pub device: Option<String>,
}

/// A provider-managed volume or share.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Human readable name used for idempotent lookup.
    pub name: String,
    /// Kind of storage.
    pub kind: ResourceKind,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Raw provider status.
    pub status: String,
    /// Content source, if the resource was not created empty.
    pub source: Option<SourceRef>,
    /// Provider volume type (block volumes only).
    pub volume_type: Option<String>,
    /// Share protocol (shares only).
    pub share_proto: Option<String>,
    /// NFS export location (shares only).
    pub export_location: Option<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// Current attachments.
    pub attachments: Vec<Attachment>,
}

impl Resource {
    /// Creates a resource with the given identity and size and no optional
    /// attributes.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: ResourceKind,
        size_gb: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            size_gb,
            status: String::from("available"),
            source: None,
            volume_type: None,
            share_proto: None,
            export_location: None,
            metadata: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    /// Returns `true` when the provider reports an error status.
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        let status = self.status.to_ascii_lowercase();
        status.contains("error") || status == "303" || status == "fail"
    }
}

/// Attributes for a new resource.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateSpec {
    /// Resource name.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Optional content source.
    pub source: Option<SourceRef>,
    /// Provider volume type (block volumes).
    pub volume_type: Option<String>,
    /// Share protocol (shares).
    pub share_proto: Option<String>,
    /// Availability zone.
    pub availability_zone: Option<String>,
    /// Metadata stored on the resource.
    pub metadata: BTreeMap<String, String>,
    /// Provider-specific parameters passed through verbatim (network ids,
    /// share types).
    pub parameters: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("block", ResourceKind::Block)]
    #[case("EVS", ResourceKind::Block)]
    #[case(" share ", ResourceKind::Share)]
    #[case("sfs-turbo", ResourceKind::TurboShare)]
    fn resource_kind_parses_aliases(#[case] raw: &str, #[case] expected: ResourceKind) {
        assert_eq!(raw.parse::<ResourceKind>(), Ok(expected));
    }

    #[test]
    fn resource_kind_rejects_unknown() {
        assert!("bucket".parse::<ResourceKind>().is_err());
    }

    #[rstest]
    #[case("available", false)]
    #[case("error_extending", true)]
    #[case("303", true)]
    #[case("in-use", false)]
    fn abnormal_status_detection(#[case] status: &str, #[case] expected: bool) {
        let mut resource = Resource::new("id", "name", ResourceKind::Share, 1);
        resource.status = status.to_owned();
        assert_eq!(resource.is_abnormal(), expected);
    }
}

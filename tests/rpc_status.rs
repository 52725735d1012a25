//! Error codes surfaced to orchestrator callers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use stowage::cloud::{CloudError, ResourceKind};
use stowage::job::JobError;
use stowage::provision::{GIB, ProvisionError, ResourceProfile};
use stowage::rpc::{
    AccessMode, CapacityRange, ControllerService, CreateVolumeRequest, PARAM_KIND, RpcCode,
    RpcRequest, RpcResponse, RpcServer, RpcStatus, ValidateVolumeCapabilitiesRequest,
    VolumeCapability, VolumeIdRequest,
};
use stowage::test_support::FakeResourceApi;
use stowage::{Backoff, Provisioner, transport};

fn server() -> RpcServer {
    let fast = Backoff::new(Duration::from_millis(1), 1.0, 3);
    let blocks = FakeResourceApi::new(ResourceKind::Block);
    let controller = ControllerService::new().with_provisioner(
        Provisioner::new(Arc::new(blocks)).with_profile(ResourceProfile::BLOCK.with_backoff(fast)),
    );
    RpcServer::new(Some(controller), None)
}

fn create(name: &str, required_bytes: u64, kind: &str) -> RpcRequest {
    RpcRequest::CreateVolume(CreateVolumeRequest {
        name: name.to_owned(),
        capacity: CapacityRange {
            required_bytes,
            limit_bytes: 0,
        },
        capabilities: vec![VolumeCapability::default()],
        parameters: BTreeMap::from([(PARAM_KIND.to_owned(), kind.to_owned())]),
        content_source: None,
    })
}

fn volume(volume_id: &str) -> VolumeIdRequest {
    VolumeIdRequest {
        volume_id: volume_id.to_owned(),
    }
}

#[rstest]
#[case::empty_name(create("", GIB, "block"), RpcCode::InvalidArgument)]
#[case::unknown_kind(create("pvc-1", GIB, "tape"), RpcCode::InvalidArgument)]
#[case::too_large(create("pvc-1", 40_000 * GIB, "block"), RpcCode::OutOfRange)]
#[case::kind_not_served(create("pvc-1", GIB, "share"), RpcCode::Unimplemented)]
#[case::malformed_id(RpcRequest::DeleteVolume(volume("no-kind")), RpcCode::InvalidArgument)]
#[case::missing_volume(RpcRequest::ControllerGetVolume(volume("block/vol-x")), RpcCode::NotFound)]
#[case::bucket_state(RpcRequest::ControllerGetVolume(volume("bucket/logs")), RpcCode::Unimplemented)]
#[case::node_disabled(RpcRequest::NodeGetInfo, RpcCode::Unimplemented)]
#[tokio::test]
async fn requests_fail_with_the_matching_code(#[case] request: RpcRequest, #[case] code: RpcCode) {
    let response = server().dispatch(request).await;

    assert_eq!(response.error().map(|status| status.code), Some(code), "{response:?}");
}

#[tokio::test]
async fn multi_node_writers_are_refused_for_block_volumes() {
    let server = server();
    let RpcResponse::Volume(created) = server.dispatch(create("pvc-1", GIB, "block")).await else {
        panic!("create should succeed");
    };
    let request = RpcRequest::ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest {
        volume_id: created.volume_id,
        capabilities: vec![VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            ..VolumeCapability::default()
        }],
    });

    let response = server.dispatch(request).await;

    assert!(
        matches!(response, RpcResponse::Validated(ref verdict) if !verdict.confirmed),
        "{response:?}"
    );
}

#[tokio::test]
async fn unreadable_requests_get_an_invalid_argument_reply() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let socket = camino::Utf8PathBuf::from_path_buf(dir.path().join("plugin.sock"))
        .expect("utf8 path");
    let listener = transport::bind(&socket).expect("bind");
    let serving = tokio::spawn(Arc::new(server()).serve(listener, std::future::pending()));

    let mut stream = UnixStream::connect(socket.as_std_path()).await.expect("connect");
    stream.write_all(b"{\"method\":\"reticulate\"}").await.expect("write");
    stream.shutdown().await.expect("shutdown");
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.expect("read");
    serving.abort();

    let response: RpcResponse = serde_json::from_slice(&reply).expect("json reply");
    assert_eq!(
        response.error().map(|status| status.code),
        Some(RpcCode::InvalidArgument)
    );
}

#[rstest]
#[case::cloud_not_found(
    ProvisionError::Cloud(CloudError::NotFound {
        resource: String::from("volume"),
        id: String::from("v-1"),
    }),
    RpcCode::NotFound
)]
#[case::provider_conflict(
    ProvisionError::Cloud(CloudError::Api {
        status: 409,
        message: String::from("busy"),
    }),
    RpcCode::AlreadyExists
)]
#[case::timed_out(
    ProvisionError::Job(JobError::TimedOut {
        label: "compute job",
        job_id: String::from("job-1"),
        attempts: 30,
    }),
    RpcCode::Unknown
)]
#[case::ambiguous(
    ProvisionError::Ambiguous {
        name: String::from("pvc-1"),
        count: 2,
        ids: vec![String::from("a"), String::from("b")],
    },
    RpcCode::AlreadyExists
)]
fn provisioning_errors_map_onto_protocol_codes(#[case] err: ProvisionError, #[case] code: RpcCode) {
    let message = err.to_string();

    let status = RpcStatus::from(err);

    assert_eq!(status.code, code);
    assert_eq!(status.message, message);
}

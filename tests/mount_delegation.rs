//! Mount delegation over a real Unix socket.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::sync::oneshot;

use stowage::DeviceResolver;
use stowage::mount::{
    BucketMount, FailureKind, MountClient, MountError, MountServer, ServerSettings,
};
use stowage::mounter::Mounter;
use stowage::rpc::{
    NodePublishVolumeRequest, NodeService, RpcCode, SECRET_ACCESS_KEY, SECRET_SECRET_KEY,
};
use stowage::test_support::{CommandInvocation, FakeMetadataApi, ScriptedRunner};
use stowage::transport;

const SECRET: &str = "delegation-secret";

struct Connector {
    dir: TempDir,
    socket: Utf8PathBuf,
    credential_dir: Utf8PathBuf,
    runner: ScriptedRunner,
    stop: Option<oneshot::Sender<()>>,
}

impl Connector {
    fn root(&self) -> &Utf8Path {
        Utf8Path::from_path(self.dir.path()).expect("utf8 temp dir")
    }

    fn client(&self, secret: &str) -> MountClient {
        MountClient::new(self.socket.clone(), secret)
    }

    fn write_credential(&self, name: &str) -> Utf8PathBuf {
        let path = self.credential_dir.join(name);
        std::fs::write(&path, "AK:SK").expect("write credential");
        path
    }

    fn credential_count(&self) -> usize {
        std::fs::read_dir(&self.credential_dir)
            .expect("credential dir")
            .count()
    }

    fn commands(&self) -> Vec<String> {
        self.runner
            .invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
    }
}

fn bucket_publish(target: &Utf8Path, readonly: bool) -> NodePublishVolumeRequest {
    NodePublishVolumeRequest {
        volume_id: String::from("bucket/logs"),
        target_path: target.to_string(),
        readonly,
        secrets: BTreeMap::from([
            (SECRET_ACCESS_KEY.to_owned(), String::from("AK")),
            (SECRET_SECRET_KEY.to_owned(), String::from("SK")),
        ]),
        ..NodePublishVolumeRequest::default()
    }
}

fn bucket_node(client: MountClient, credential_dir: &Utf8Path) -> NodeService {
    NodeService::new(
        "node-a",
        Mounter::new(Arc::new(ScriptedRunner::new())),
        DeviceResolver::new(Arc::new(FakeMetadataApi::new(&[]))),
    )
    .with_connector(client, credential_dir.to_owned())
}

fn bucket_mount(credential_file: &Utf8Path) -> BucketMount {
    BucketMount {
        bucket: String::from("logs"),
        target_path: String::from("/mnt/logs"),
        credential_file: credential_file.to_string(),
        ..BucketMount::default()
    }
}

#[fixture]
fn connector() -> Connector {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
    let credential_dir = root.join("credentials");
    std::fs::create_dir(&credential_dir).expect("credential dir");
    let socket = root.join("connector.sock");
    let runner = ScriptedRunner::new();
    let settings = ServerSettings {
        credential_dir: credential_dir.clone(),
        secret: SECRET.to_owned(),
        mount_bin: String::from("s3fs"),
        umount_bin: String::from("umount"),
        default_region: Some(String::from("eu-west-0")),
        endpoint_domain: String::from("cloud.example.com"),
    };
    let server =
        Arc::new(MountServer::new(settings, Arc::new(runner.clone())).expect("open credential dir"));
    let listener = transport::bind(&socket).expect("bind connector socket");
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.serve(listener, async move {
        stopped.await.ok();
    }));
    Connector {
        dir,
        socket,
        credential_dir,
        runner,
        stop: Some(stop),
    }
}

#[rstest]
#[tokio::test]
async fn signed_mount_runs_helper_and_consumes_credential(connector: Connector) {
    let credential = connector.write_credential("cred-1");

    connector
        .client(SECRET)
        .mount(&bucket_mount(&credential))
        .await
        .expect("mount succeeds");

    assert_eq!(
        connector.commands(),
        vec![format!(
            "s3fs logs /mnt/logs -o url=https://obs.eu-west-0.cloud.example.com -o passwd_file={credential}"
        )]
    );
    assert_eq!(connector.credential_count(), 0);
}

#[rstest]
#[tokio::test]
async fn helper_failure_is_reported_and_credential_still_removed(connector: Connector) {
    let credential = connector.write_credential("cred-1");
    connector.runner.push_failure(1);

    let err = connector
        .client(SECRET)
        .mount(&bucket_mount(&credential))
        .await
        .expect_err("mount fails");

    assert!(matches!(
        err,
        MountError::Rejected { kind: Some(FailureKind::Execution), ref message }
            if message.contains("s3fs")
    ));
    assert_eq!(connector.credential_count(), 0);
}

#[rstest]
#[tokio::test]
async fn commands_signed_with_another_secret_are_refused(connector: Connector) {
    let credential = connector.write_credential("cred-1");

    let err = connector
        .client("wrong-secret")
        .mount(&bucket_mount(&credential))
        .await
        .expect_err("refused");

    assert!(
        matches!(
            err,
            MountError::Rejected { kind: Some(FailureKind::Unauthenticated), ref message }
                if message.contains("authentication")
        ),
        "unexpected error: {err}"
    );
    assert!(connector.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn credentials_outside_the_directory_are_refused(connector: Connector) {
    let outside = connector.root().join("elsewhere");
    std::fs::write(&outside, "AK:SK").expect("write outside file");

    let err = connector
        .client(SECRET)
        .mount(&bucket_mount(&outside))
        .await
        .expect_err("refused");

    assert!(
        matches!(
            err,
            MountError::Rejected { kind: Some(FailureKind::InvalidRequest), ref message }
                if message.contains("outside")
        ),
        "unexpected error: {err}"
    );
    assert!(outside.exists());
    assert!(connector.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn unmount_needs_only_the_target(connector: Connector) {
    connector
        .client(SECRET)
        .unmount("/mnt/logs")
        .await
        .expect("unmount succeeds");

    assert_eq!(connector.commands(), vec![String::from("umount /mnt/logs")]);
}

#[rstest]
#[tokio::test]
async fn node_publish_delegates_bucket_mounts(connector: Connector) {
    let target = connector.root().join("pods/target");
    let node = bucket_node(connector.client(SECRET), &connector.credential_dir);
    let request = bucket_publish(&target, true);

    node.publish_volume(&request).await.expect("publish succeeds");

    let commands = connector.commands();
    let [mount] = commands.as_slice() else {
        panic!("expected one helper invocation, got {commands:?}");
    };
    assert!(mount.starts_with(&format!("s3fs logs {target} ")), "{mount}");
    assert!(
        mount.contains(&format!("passwd_file={}/", connector.credential_dir)),
        "{mount}"
    );
    assert!(mount.ends_with("-o ro"), "{mount}");
    assert_eq!(connector.credential_count(), 0);
}

#[rstest]
#[tokio::test]
async fn unreachable_connector_is_unavailable(connector: Connector) {
    let node = bucket_node(
        MountClient::new(connector.root().join("absent.sock"), SECRET),
        &connector.credential_dir,
    );
    let request = bucket_publish(&connector.root().join("target"), false);

    let err = node.publish_volume(&request).await.expect_err("unreachable");

    assert_eq!(err.code, RpcCode::Unavailable);
    assert_eq!(connector.credential_count(), 0);
}

#[rstest]
#[tokio::test]
async fn refused_bucket_publish_leaves_no_credential_behind(connector: Connector) {
    let node = bucket_node(connector.client("plugin-secret"), &connector.credential_dir);
    let request = bucket_publish(&connector.root().join("target"), false);

    let err = node.publish_volume(&request).await.expect_err("refused");

    assert_eq!(err.code, RpcCode::Unauthenticated, "{err}");
    assert_eq!(connector.credential_count(), 0);
    assert!(connector.runner.invocations().is_empty());
}

//! Privileged side of mount delegation.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, instrument, warn};

use super::command::{
    FailureKind, MountAction, MountCommand, MountResponse, PARAM_BUCKET, PARAM_CREDENTIAL_FILE,
    PARAM_ENDPOINT_DOMAIN, PARAM_MOUNT_OPTIONS, PARAM_REGION, PARAM_TARGET_PATH,
};
use super::{MountError, token};
use crate::config::ConnectorConfig;
use crate::exec::{self, CommandOutput, CommandRunner};
use crate::transport::{self, TransportError};

/// Settings that govern how the connector executes commands.
#[derive(Clone)]
pub struct ServerSettings {
    /// Only credential files directly inside this directory are accepted.
    pub credential_dir: Utf8PathBuf,
    /// Shared secret used to verify command tokens.
    pub secret: String,
    /// Bucket mount helper.
    pub mount_bin: String,
    /// Unmount helper.
    pub umount_bin: String,
    /// Region used when a command carries none.
    pub default_region: Option<String>,
    /// Endpoint domain used when a command carries none.
    pub endpoint_domain: String,
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("credential_dir", &self.credential_dir)
            .field("secret", &"<redacted>")
            .field("mount_bin", &self.mount_bin)
            .field("umount_bin", &self.umount_bin)
            .field("default_region", &self.default_region)
            .field("endpoint_domain", &self.endpoint_domain)
            .finish()
    }
}

impl From<&ConnectorConfig> for ServerSettings {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            credential_dir: Utf8PathBuf::from(&config.credential_dir),
            secret: config.shared_secret.clone(),
            mount_bin: config.mount_bin.clone(),
            umount_bin: config.umount_bin.clone(),
            default_region: config.region.clone(),
            endpoint_domain: config.endpoint_domain.clone(),
        }
    }
}

/// Verifies and executes signed mount commands.
pub struct MountServer {
    settings: ServerSettings,
    credentials: Dir,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for MountServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountServer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MountServer {
    /// Opens the credential directory and prepares the server.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::CredentialDir`] when the directory cannot be
    /// opened.
    pub fn new(settings: ServerSettings, runner: Arc<dyn CommandRunner>) -> Result<Self, MountError> {
        let credentials = Dir::open_ambient_dir(&settings.credential_dir, ambient_authority())
            .map_err(|source| MountError::CredentialDir {
                path: settings.credential_dir.to_string(),
                source,
            })?;
        Ok(Self {
            settings,
            credentials,
            runner,
        })
    }

    /// Executes one command and renders the outcome as a response.
    ///
    /// Failures never escape as errors; the caller always receives a
    /// response it can relay to the client.
    #[instrument(skip_all, fields(action = ?command.action))]
    pub async fn handle(&self, command: &MountCommand) -> MountResponse {
        match self.execute(command).await {
            Ok(message) => {
                info!(%message, "mount command completed");
                MountResponse::success(message)
            }
            Err(err) => {
                warn!(error = %err, "mount command failed");
                MountResponse::failure(err.failure_kind(), err.to_string())
            }
        }
    }

    /// Accepts connections until `shutdown` resolves, serving each on its
    /// own task.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Transport`] when accepting a connection fails.
    pub async fn serve<F>(self: Arc<Self>, listener: UnixListener, shutdown: F) -> Result<(), MountError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("mount connector shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(TransportError::Io)?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.respond(stream).await {
                            warn!(error = %err, "mount connection failed");
                        }
                    });
                }
            }
        }
    }

    async fn respond(&self, mut stream: UnixStream) -> Result<(), TransportError> {
        let response = match transport::read_request::<MountCommand>(&mut stream).await {
            Ok(command) => self.handle(&command).await,
            Err(err) => {
                debug!(error = %err, "rejecting unreadable mount command");
                MountResponse::failure(FailureKind::InvalidRequest, err.to_string())
            }
        };
        transport::write_response(&mut stream, &response).await
    }

    async fn execute(&self, command: &MountCommand) -> Result<String, MountError> {
        token::verify(&self.settings.secret, &command.parameters, &command.token)
            .map_err(|_| MountError::Unauthenticated)?;
        for name in command.action.required_params() {
            required(command, name)?;
        }
        match command.action {
            MountAction::Mount => self.mount(command).await,
            MountAction::Unmount => self.unmount(command).await,
        }
    }

    async fn mount(&self, command: &MountCommand) -> Result<String, MountError> {
        let raw = required(command, PARAM_CREDENTIAL_FILE)?;
        let name = self.confine(raw)?;
        let result = self.mount_with_credential(command, name).await;
        self.discard_credential(name);
        result
    }

    async fn mount_with_credential(
        &self,
        command: &MountCommand,
        credential: &str,
    ) -> Result<String, MountError> {
        let bucket = checked_value(PARAM_BUCKET, required(command, PARAM_BUCKET)?)?;
        let target = checked_target(required(command, PARAM_TARGET_PATH)?)?;
        let region = command
            .param(PARAM_REGION)
            .filter(|value| !value.is_empty())
            .or(self.settings.default_region.as_deref())
            .ok_or_else(|| MountError::MissingParameter {
                name: PARAM_REGION.to_owned(),
            })?;
        let domain = command
            .param(PARAM_ENDPOINT_DOMAIN)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.settings.endpoint_domain);
        let region_value = checked_value(PARAM_REGION, region)?;
        let domain_value = checked_value(PARAM_ENDPOINT_DOMAIN, domain)?;

        let present = self
            .credentials
            .symlink_metadata(credential)
            .is_ok_and(|metadata| metadata.is_file());
        if !present {
            return Err(MountError::CredentialMissing {
                path: self.settings.credential_dir.join(credential).to_string(),
            });
        }

        let mut args = vec![
            OsString::from(bucket),
            OsString::from(target),
            OsString::from("-o"),
            OsString::from(format!("url=https://obs.{region_value}.{domain_value}")),
            OsString::from("-o"),
            OsString::from(format!(
                "passwd_file={}",
                self.settings.credential_dir.join(credential)
            )),
        ];
        if let Some(options) = command.param(PARAM_MOUNT_OPTIONS).filter(|value| !value.is_empty()) {
            args.push(OsString::from("-o"));
            args.push(OsString::from(checked_value(PARAM_MOUNT_OPTIONS, options)?));
        }

        let output = self.run(&self.settings.mount_bin, &args).await?;
        expect_success(&self.settings.mount_bin, &output)?;
        Ok(format!("mounted {bucket} at {target}"))
    }

    async fn unmount(&self, command: &MountCommand) -> Result<String, MountError> {
        let target = checked_target(required(command, PARAM_TARGET_PATH)?)?;
        let args = [OsString::from(target)];
        let output = self.run(&self.settings.umount_bin, &args).await?;
        if output.is_success() {
            return Ok(format!("unmounted {target}"));
        }
        if output.combined().contains("not mounted") {
            return Ok(format!("{target} was not mounted"));
        }
        expect_success(&self.settings.umount_bin, &output)?;
        Ok(format!("unmounted {target}"))
    }

    async fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, MountError> {
        debug!(command = %exec::render(program, args), "running mount helper");
        Ok(self.runner.run(program, args).await?)
    }

    /// Resolves `raw` to a file name directly inside the credential
    /// directory without touching the filesystem.
    fn confine<'a>(&self, raw: &'a str) -> Result<&'a str, MountError> {
        let outside = || MountError::CredentialOutsideDir {
            path: raw.to_owned(),
        };
        let path = Utf8Path::new(raw);
        if path.parent() != Some(self.settings.credential_dir.as_path()) {
            return Err(outside());
        }
        match path.components().next_back() {
            Some(Utf8Component::Normal(name)) => Ok(name),
            _ => Err(outside()),
        }
    }

    fn discard_credential(&self, name: &str) {
        match self.credentials.remove_file(name) {
            Ok(()) => debug!("credential file removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "failed to remove credential file"),
        }
    }
}

fn required<'a>(command: &'a MountCommand, name: &str) -> Result<&'a str, MountError> {
    command
        .param(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| MountError::MissingParameter {
            name: name.to_owned(),
        })
}

fn checked_value<'a>(name: &str, value: &'a str) -> Result<&'a str, MountError> {
    let invalid = |reason: &str| MountError::InvalidParameter {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if value.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid("must not contain control characters"));
    }
    Ok(value)
}

fn checked_target(value: &str) -> Result<&str, MountError> {
    let target = checked_value(PARAM_TARGET_PATH, value)?;
    let path = Utf8Path::new(target);
    if !path.is_absolute() || path.components().any(|part| part == Utf8Component::ParentDir) {
        return Err(MountError::InvalidParameter {
            name: PARAM_TARGET_PATH.to_owned(),
            reason: String::from("must be an absolute path without '..'"),
        });
    }
    Ok(target)
}

fn expect_success(program: &str, output: &CommandOutput) -> Result<(), MountError> {
    if output.is_success() {
        Ok(())
    } else {
        Err(MountError::CommandFailed {
            program: program.to_owned(),
            status_text: output.status_text(),
            output: output.combined(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{CommandInvocation, ScriptedRunner};

    const SECRET: &str = "connector-secret";

    struct Harness {
        dir: TempDir,
        runner: ScriptedRunner,
        server: MountServer,
    }

    impl Harness {
        fn credential_dir(&self) -> Utf8PathBuf {
            Utf8PathBuf::from_path_buf(self.dir.path().to_path_buf()).expect("utf-8 temp dir")
        }

        fn write_credential(&self, name: &str) -> String {
            let path = self.credential_dir().join(name);
            std::fs::write(&path, "AK:SK").expect("write credential");
            path.into_string()
        }

        fn mount_command(&self, credential: &str) -> MountCommand {
            let params = BTreeMap::from([
                (PARAM_BUCKET.to_owned(), String::from("data")),
                (PARAM_TARGET_PATH.to_owned(), String::from("/mnt/data")),
                (PARAM_CREDENTIAL_FILE.to_owned(), credential.to_owned()),
                (PARAM_REGION.to_owned(), String::from("eu-west-0")),
            ]);
            MountCommand::signed(MountAction::Mount, params, SECRET).expect("sign")
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let runner = ScriptedRunner::new();
        let settings = ServerSettings {
            credential_dir: Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
                .expect("utf-8 temp dir"),
            secret: SECRET.to_owned(),
            mount_bin: String::from("s3fs"),
            umount_bin: String::from("umount"),
            default_region: None,
            endpoint_domain: String::from("cloud.example.com"),
        };
        let server = MountServer::new(settings, Arc::new(runner.clone())).expect("server");
        Harness {
            dir,
            runner,
            server,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn mounts_bucket_and_removes_credential(harness: Harness) {
        let credential = harness.write_credential("cred-1");
        let response = harness
            .server
            .handle(&harness.mount_command(&credential))
            .await;

        assert!(response.is_success(), "{response:?}");
        let calls = harness.runner.invocations();
        assert_eq!(calls.len(), 1);
        let rendered = calls
            .first()
            .map(CommandInvocation::command_string)
            .unwrap_or_default();
        assert!(rendered.starts_with("s3fs data /mnt/data -o url=https://obs.eu-west-0.cloud.example.com"));
        assert!(rendered.contains(&format!("passwd_file={credential}")));
        assert!(!Utf8Path::new(&credential).exists());
    }

    #[rstest]
    #[tokio::test]
    async fn credential_is_removed_when_mount_fails(harness: Harness) {
        let credential = harness.write_credential("cred-2");
        harness.runner.push_failure(1);

        let response = harness
            .server
            .handle(&harness.mount_command(&credential))
            .await;

        assert!(!response.is_success());
        assert!(response.message.contains("simulated failure"));
        assert!(!Utf8Path::new(&credential).exists());
    }

    #[rstest]
    #[tokio::test]
    async fn tampered_command_is_rejected_before_parameter_checks(harness: Harness) {
        let mut command = MountCommand::signed(MountAction::Mount, BTreeMap::new(), SECRET)
            .expect("sign");
        command
            .parameters
            .insert(PARAM_TARGET_PATH.to_owned(), String::from("/etc"));

        let response = harness.server.handle(&command).await;

        assert!(!response.is_success());
        assert!(response.message.contains("authentication"), "{}", response.message);
        assert!(harness.runner.invocations().is_empty());
    }

    #[rstest]
    #[case::parent_escape("../outside")]
    #[case::nested("nested/cred")]
    #[tokio::test]
    async fn credential_outside_directory_is_refused(harness: Harness, #[case] suffix: &str) {
        let raw = format!("{}/{suffix}", harness.credential_dir());
        let response = harness.server.handle(&harness.mount_command(&raw)).await;

        assert!(!response.is_success());
        assert!(response.message.contains("outside"), "{}", response.message);
        assert!(harness.runner.invocations().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn credential_in_another_directory_is_refused(harness: Harness) {
        let response = harness
            .server
            .handle(&harness.mount_command("/tmp/elsewhere/cred"))
            .await;

        assert!(response.message.contains("outside"), "{}", response.message);
    }

    #[rstest]
    #[tokio::test]
    async fn missing_credential_is_reported(harness: Harness) {
        let raw = harness.credential_dir().join("absent").into_string();
        let response = harness.server.handle(&harness.mount_command(&raw)).await;

        assert!(response.message.contains("does not exist"), "{}", response.message);
        assert!(harness.runner.invocations().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_region_without_default_fails(harness: Harness) {
        let credential = harness.write_credential("cred-3");
        let mut params = harness.mount_command(&credential).parameters;
        params.remove(PARAM_REGION);
        let command = MountCommand::signed(MountAction::Mount, params, SECRET).expect("sign");

        let response = harness.server.handle(&command).await;

        assert!(response.message.contains("region"), "{}", response.message);
        assert!(!Utf8Path::new(&credential).exists());
    }

    #[rstest]
    #[tokio::test]
    async fn option_like_bucket_is_refused(harness: Harness) {
        let credential = harness.write_credential("cred-4");
        let mut params = harness.mount_command(&credential).parameters;
        params.insert(PARAM_BUCKET.to_owned(), String::from("-oallow_other"));
        let command = MountCommand::signed(MountAction::Mount, params, SECRET).expect("sign");

        let response = harness.server.handle(&command).await;

        assert!(response.message.contains("invalid parameter bucket"));
        assert!(harness.runner.invocations().is_empty());
    }

    #[rstest]
    #[case::clean(Some(0), "", true)]
    #[case::not_mounted(Some(32), "umount: /mnt/data: not mounted.", true)]
    #[case::busy(Some(32), "umount: /mnt/data: target is busy.", false)]
    #[tokio::test]
    async fn unmount_outcomes(
        harness: Harness,
        #[case] code: Option<i32>,
        #[case] stderr: &str,
        #[case] success: bool,
    ) {
        harness.runner.push_output(code, "", stderr);
        let params = BTreeMap::from([(PARAM_TARGET_PATH.to_owned(), String::from("/mnt/data"))]);
        let command = MountCommand::signed(MountAction::Unmount, params, SECRET).expect("sign");

        let response = harness.server.handle(&command).await;

        assert_eq!(response.is_success(), success, "{response:?}");
        let calls = harness.runner.invocations();
        assert_eq!(
            calls.first().map(CommandInvocation::command_string),
            Some(String::from("umount /mnt/data"))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unmount_requires_absolute_target(harness: Harness) {
        let params = BTreeMap::from([(PARAM_TARGET_PATH.to_owned(), String::from("mnt/../x"))]);
        let command = MountCommand::signed(MountAction::Unmount, params, SECRET).expect("sign");

        let response = harness.server.handle(&command).await;

        assert!(!response.is_success());
        assert!(harness.runner.invocations().is_empty());
    }
}

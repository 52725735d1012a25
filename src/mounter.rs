//! Node-local filesystem operations: format, mount, unmount, resize, stats.
//!
//! Every external tool runs through a [`CommandRunner`], so the node logic
//! can be driven by a scripted runner in tests.

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8Path;
use nix::sys::statvfs::statvfs;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::exec::{self, CommandOutput, CommandRunner, SpawnError};

/// Filesystem used when a request names none.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// `findmnt` exit status when nothing is mounted at the target.
const FINDMNT_NOT_FOUND: i32 = 1;
/// `blkid -p` exit status when the device carries no recognised signature.
const BLKID_NO_SIGNATURE: i32 = 2;

/// Errors raised by node-local filesystem operations.
#[derive(Debug, Error)]
pub enum MounterError {
    /// An external tool exited unsuccessfully.
    #[error("`{command}` exited with status {status_text}: {output}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit status as text.
        status_text: String,
        /// Captured output.
        output: String,
    },
    /// An external tool could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Creating a mount target failed.
    #[error("cannot prepare {path}: {source}")]
    Io {
        /// Path being prepared.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The filesystem cannot be resized online.
    #[error("filesystem {fs_type} cannot be resized")]
    UnsupportedFilesystem {
        /// Filesystem type.
        fs_type: String,
    },
    /// `statvfs` failed.
    #[error("cannot read filesystem statistics for {path}: {source}")]
    Stats {
        /// Queried path.
        path: String,
        /// Underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
}

/// Capacity and inode usage of a mounted filesystem.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FilesystemStats {
    /// Total bytes.
    pub total_bytes: u64,
    /// Bytes available to unprivileged users.
    pub available_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
    /// Total inodes.
    pub total_inodes: u64,
    /// Free inodes.
    pub free_inodes: u64,
    /// Inodes in use.
    pub used_inodes: u64,
}

/// Source and filesystem type of an existing mount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountInfo {
    /// Mounted device or remote export.
    pub source: String,
    /// Filesystem type as reported by `findmnt`.
    pub fs_type: String,
}

/// Runs mount tooling on the local node.
#[derive(Clone)]
pub struct Mounter {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Mounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mounter").finish_non_exhaustive()
    }
}

impl Mounter {
    /// Creates a mounter over the given runner.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Reports whether something is mounted exactly at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError`] when `findmnt` cannot run or fails in an
    /// unexpected way.
    pub async fn is_mounted(&self, target: &str) -> Result<bool, MounterError> {
        Ok(self.mount_info(target).await?.is_some())
    }

    /// Describes the mount at `target`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError`] when `findmnt` cannot run or fails in an
    /// unexpected way.
    pub async fn mount_info(&self, target: &str) -> Result<Option<MountInfo>, MounterError> {
        let args = args(&[
            "--mountpoint",
            target,
            "--noheadings",
            "--output",
            "SOURCE,FSTYPE",
        ]);
        let output = self.run("findmnt", &args).await?;
        if output.code == Some(FINDMNT_NOT_FOUND) {
            return Ok(None);
        }
        check("findmnt", &args, &output)?;
        let mut fields = output.stdout.split_whitespace();
        Ok(fields.next().map(|source| MountInfo {
            source: source.to_owned(),
            fs_type: fields.next().unwrap_or_default().to_owned(),
        }))
    }

    /// Creates a filesystem on `device` unless it already carries one.
    ///
    /// Returns the filesystem type found or created.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError`] when probing or formatting fails.
    #[instrument(skip(self))]
    pub async fn format_if_needed(&self, device: &str, fs_type: &str) -> Result<String, MounterError> {
        let probe = args(&["-p", "-s", "TYPE", "-o", "value", device]);
        let output = self.run("blkid", &probe).await?;
        if output.is_success() {
            let existing = output.stdout.trim();
            if !existing.is_empty() {
                debug!(existing, "device already formatted");
                return Ok(existing.to_owned());
            }
        } else if output.code != Some(BLKID_NO_SIGNATURE) {
            check("blkid", &probe, &output)?;
        }

        let program = format!("mkfs.{fs_type}");
        let mkfs = if fs_type.starts_with("ext") {
            args(&["-F", device])
        } else {
            args(&[device])
        };
        info!(fs_type, "formatting device");
        let formatted = self.run(&program, &mkfs).await?;
        check(&program, &mkfs, &formatted)?;
        Ok(fs_type.to_owned())
    }

    /// Mounts `source` at `target`, creating the target directory first.
    ///
    /// A target that is already mounted is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError`] when the directory cannot be created or
    /// `mount` fails.
    #[instrument(skip(self, options))]
    pub async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MounterError> {
        ensure_dir(target).await?;
        if self.is_mounted(target).await? {
            debug!("target already mounted");
            return Ok(());
        }
        let mut mount_args = Vec::new();
        if let Some(kind) = fs_type {
            mount_args.push(OsString::from("-t"));
            mount_args.push(OsString::from(kind));
        }
        if !options.is_empty() {
            mount_args.push(OsString::from("-o"));
            mount_args.push(OsString::from(options.join(",")));
        }
        mount_args.push(OsString::from(source));
        mount_args.push(OsString::from(target));
        let output = self.run("mount", &mount_args).await?;
        check("mount", &mount_args, &output)
    }

    /// Bind-mounts `source` at `target`, optionally read-only.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError`] when the bind mount fails.
    pub async fn bind_mount(&self, source: &str, target: &str, read_only: bool) -> Result<(), MounterError> {
        let mut options = vec![String::from("bind")];
        if read_only {
            options.push(String::from("ro"));
        }
        self.mount(source, target, None, &options).await
    }

    /// Unmounts `target`; a target with nothing mounted counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError`] when `umount` fails.
    #[instrument(skip(self))]
    pub async fn unmount(&self, target: &str) -> Result<(), MounterError> {
        if !self.is_mounted(target).await? {
            debug!("target not mounted");
            return Ok(());
        }
        let umount = args(&[target]);
        let output = self.run("umount", &umount).await?;
        check("umount", &umount, &output)
    }

    /// Grows the filesystem on `device`, mounted at `target`, to fill the
    /// device.
    ///
    /// # Errors
    ///
    /// Returns [`MounterError::UnsupportedFilesystem`] for filesystems other
    /// than ext and xfs, or [`MounterError::CommandFailed`] when the resize
    /// tool fails.
    #[instrument(skip(self))]
    pub async fn resize(&self, device: &str, target: &str, fs_type: &str) -> Result<(), MounterError> {
        let (program, resize_args) = if fs_type.starts_with("ext") {
            ("resize2fs", args(&[device]))
        } else if fs_type == "xfs" {
            ("xfs_growfs", args(&[target]))
        } else {
            return Err(MounterError::UnsupportedFilesystem {
                fs_type: fs_type.to_owned(),
            });
        };
        let output = self.run(program, &resize_args).await?;
        check(program, &resize_args, &output)
    }

    async fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, MounterError> {
        debug!(command = %exec::render(program, args), "running");
        Ok(self.runner.run(program, args).await?)
    }
}

/// Reads capacity and inode usage of the filesystem holding `path`.
///
/// # Errors
///
/// Returns [`MounterError::Stats`] when `statvfs` fails.
pub fn stats(path: &Utf8Path) -> Result<FilesystemStats, MounterError> {
    let raw = statvfs(path.as_std_path()).map_err(|source| MounterError::Stats {
        path: path.to_string(),
        source,
    })?;
    let fragment = u64::from(raw.fragment_size());
    let total_bytes = u64::from(raw.blocks()).saturating_mul(fragment);
    let free_bytes = u64::from(raw.blocks_free()).saturating_mul(fragment);
    let total_inodes = u64::from(raw.files());
    let free_inodes = u64::from(raw.files_free());
    Ok(FilesystemStats {
        total_bytes,
        available_bytes: u64::from(raw.blocks_available()).saturating_mul(fragment),
        used_bytes: total_bytes.saturating_sub(free_bytes),
        total_inodes,
        free_inodes,
        used_inodes: total_inodes.saturating_sub(free_inodes),
    })
}

async fn ensure_dir(target: &str) -> Result<(), MounterError> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|source| MounterError::Io {
            path: target.to_owned(),
            source,
        })
}

fn args(values: &[&str]) -> Vec<OsString> {
    values.iter().map(OsString::from).collect()
}

fn check(program: &str, args: &[OsString], output: &CommandOutput) -> Result<(), MounterError> {
    if output.is_success() {
        Ok(())
    } else {
        Err(MounterError::CommandFailed {
            command: exec::render(program, args),
            status_text: output.status_text(),
            output: output.combined(),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{CommandInvocation, ScriptedRunner};

    #[fixture]
    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
    }

    fn commands(runner: &ScriptedRunner) -> Vec<String> {
        runner
            .invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    fn target_in(dir: &TempDir) -> String {
        dir.path().join("target").to_string_lossy().into_owned()
    }

    #[rstest]
    #[tokio::test]
    async fn mount_info_reads_source_and_type(runner: ScriptedRunner) {
        runner.push_output(Some(0), "/dev/vdb ext4\n", "");
        let mounter = Mounter::new(Arc::new(runner.clone()));

        let info = mounter.mount_info("/mnt/a").await.expect("findmnt");

        assert_eq!(
            info,
            Some(MountInfo {
                source: String::from("/dev/vdb"),
                fs_type: String::from("ext4"),
            })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unmounted_target_has_no_info(runner: ScriptedRunner) {
        runner.push_exit_code(1);
        let mounter = Mounter::new(Arc::new(runner.clone()));

        assert_eq!(mounter.mount_info("/mnt/a").await.expect("findmnt"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn unexpected_findmnt_failure_is_an_error(runner: ScriptedRunner) {
        runner.push_output(Some(4), "", "boom");
        let mounter = Mounter::new(Arc::new(runner.clone()));

        let err = mounter.is_mounted("/mnt/a").await.expect_err("must fail");

        assert!(matches!(err, MounterError::CommandFailed { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn blank_device_is_formatted(runner: ScriptedRunner) {
        runner.push_exit_code(2);
        runner.push_success();
        let mounter = Mounter::new(Arc::new(runner.clone()));

        let fs = mounter
            .format_if_needed("/dev/vdb", "ext4")
            .await
            .expect("format");

        assert_eq!(fs, "ext4");
        assert_eq!(
            commands(&runner),
            vec![
                String::from("blkid -p -s TYPE -o value /dev/vdb"),
                String::from("mkfs.ext4 -F /dev/vdb"),
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn formatted_device_is_left_alone(runner: ScriptedRunner) {
        runner.push_output(Some(0), "xfs\n", "");
        let mounter = Mounter::new(Arc::new(runner.clone()));

        let fs = mounter
            .format_if_needed("/dev/vdb", "ext4")
            .await
            .expect("probe");

        assert_eq!(fs, "xfs");
        assert_eq!(runner.invocations().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn mount_skips_mounted_target(runner: ScriptedRunner) {
        let dir = TempDir::new().expect("temp dir");
        let target = target_in(&dir);
        runner.push_output(Some(0), "/dev/vdb\n", "");
        let mounter = Mounter::new(Arc::new(runner.clone()));

        mounter
            .mount("/dev/vdb", &target, Some("ext4"), &[])
            .await
            .expect("mount");

        assert_eq!(runner.invocations().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn bind_mount_passes_options(runner: ScriptedRunner) {
        let dir = TempDir::new().expect("temp dir");
        let target = target_in(&dir);
        runner.push_exit_code(1);
        runner.push_success();
        let mounter = Mounter::new(Arc::new(runner.clone()));

        mounter
            .bind_mount("/staging/vol", &target, true)
            .await
            .expect("bind");

        let issued = commands(&runner);
        assert_eq!(
            issued.last(),
            Some(&format!("mount -o bind,ro /staging/vol {target}"))
        );
        assert!(dir.path().join("target").is_dir());
    }

    #[rstest]
    #[tokio::test]
    async fn unmount_of_unmounted_target_is_a_no_op(runner: ScriptedRunner) {
        runner.push_exit_code(1);
        let mounter = Mounter::new(Arc::new(runner.clone()));

        mounter.unmount("/mnt/a").await.expect("unmount");

        assert_eq!(commands(&runner), vec![String::from(
            "findmnt --mountpoint /mnt/a --noheadings --output SOURCE,FSTYPE"
        )]);
    }

    #[rstest]
    #[case::ext4("ext4", "resize2fs /dev/vdb")]
    #[case::xfs("xfs", "xfs_growfs /mnt/a")]
    #[tokio::test]
    async fn resize_picks_tool_by_filesystem(
        runner: ScriptedRunner,
        #[case] fs_type: &str,
        #[case] expected: &str,
    ) {
        let mounter = Mounter::new(Arc::new(runner.clone()));

        mounter
            .resize("/dev/vdb", "/mnt/a", fs_type)
            .await
            .expect("resize");

        assert_eq!(commands(&runner), vec![expected.to_owned()]);
    }

    #[rstest]
    #[tokio::test]
    async fn resize_rejects_unknown_filesystem(runner: ScriptedRunner) {
        let mounter = Mounter::new(Arc::new(runner.clone()));

        let err = mounter
            .resize("/dev/vdb", "/mnt/a", "vfat")
            .await
            .expect_err("unsupported");

        assert!(matches!(err, MounterError::UnsupportedFilesystem { .. }));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn stats_reports_usage_for_temp_dir() {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir");

        let usage = stats(path).expect("statvfs");

        assert!(usage.total_bytes > 0);
        assert!(usage.used_bytes <= usage.total_bytes);
    }
}

//! Host-backed implementations of the mount abstractions.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::{CommandOutput, Executor, FileSystem, FsStats, Mounter};
use crate::error::CsiError;

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// `blkid` exit code for "no recognizable signature".
pub const BLKID_NO_SIGNATURE: i32 = 2;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs commands with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput> {
        debug!(program, ?args, "running command");
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            // Dropping the pipe delivers EOF.
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// FileSystem
// ---------------------------------------------------------------------------

/// Plain `std::fs` access.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let paths =
            glob::glob(pattern).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(paths.filter_map(Result::ok).collect())
    }

    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map(drop)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let result = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn statfs(&self, path: &Path) -> io::Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let frag = stat.fragment_size() as u64;
        let total_bytes = stat.blocks() as u64 * frag;
        let free_bytes = stat.blocks_free() as u64 * frag;
        let total_inodes = stat.files() as u64;
        let free_inodes = stat.files_free() as u64;
        Ok(FsStats {
            total_bytes,
            available_bytes: stat.blocks_available() as u64 * frag,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            total_inodes,
            free_inodes,
            used_inodes: total_inodes.saturating_sub(free_inodes),
        })
    }
}

// ---------------------------------------------------------------------------
// Mount table
// ---------------------------------------------------------------------------

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device or source.
    pub source: String,
    /// Mount point.
    pub target: String,
    /// Filesystem type.
    pub fs_type: String,
}

/// Parse `/proc/self/mounts` contents.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`, with
/// whitespace inside fields escaped as octal (`\040`).
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                source: unescape_octal(source),
                target: unescape_octal(target),
                fs_type: fs_type.to_owned(),
            })
        })
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split `mount(8)` style options into kernel flags and filesystem data.
pub fn parse_mount_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "defaults" | "rw" | "" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other.to_owned()),
        }
    }
    let data = (!data.is_empty()).then(|| data.join(","));
    (flags, data)
}

// ---------------------------------------------------------------------------
// Mounter
// ---------------------------------------------------------------------------

/// Mounts with the `mount(2)` syscall and formats with `mkfs.*`.
pub struct SystemMounter {
    exec: Arc<dyn Executor>,
}

impl SystemMounter {
    /// Create a mounter that runs helper tools through `exec`.
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    async fn mount_table(&self) -> Result<Vec<MountEntry>, CsiError> {
        let contents = tokio::fs::read_to_string(MOUNT_TABLE)
            .await
            .map_err(|e| CsiError::Internal(format!("read {MOUNT_TABLE}: {e}")))?;
        Ok(parse_mount_table(&contents))
    }

    /// Filesystem type found on `device`, or `None` when it carries no
    /// signature.
    async fn probe_fs_type(&self, device: &str) -> Result<Option<String>, CsiError> {
        let out = self
            .exec
            .run("blkid", &["-p", "-s", "TYPE", "-o", "value", device], None)
            .await
            .map_err(CsiError::internal)?;
        match out.code {
            Some(0) => Ok(Some(out.stdout.trim().to_owned()).filter(|t| !t.is_empty())),
            Some(BLKID_NO_SIGNATURE) => Ok(None),
            _ => Err(CsiError::Internal(format!(
                "blkid {device} failed: {}",
                out.stderr.trim()
            ))),
        }
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    #[instrument(skip(self))]
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let (flags, data) = parse_mount_options(options);
        let fs_type = (!fs_type.is_empty()).then_some(fs_type);
        let failed = |e: nix::Error| CsiError::MountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        };

        nix::mount::mount(Some(source), target, fs_type, flags, data.as_deref()).map_err(failed)?;

        // The kernel ignores MS_RDONLY on the initial bind mount; a separate
        // remount is needed to enforce it.
        if flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: format!("remount read-only: {e}"),
            })?;
        }
        debug!(source, target, "mounted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn is_mount_point(&self, path: &str) -> Result<bool, CsiError> {
        Ok(self.mount_table().await?.iter().any(|m| m.target == path))
    }

    async fn mount_sources(&self, path: &str) -> Result<Vec<String>, CsiError> {
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .filter(|m| m.target == path)
            .map(|m| m.source)
            .collect())
    }

    async fn mount_targets(&self, source: &str) -> Result<Vec<String>, CsiError> {
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .filter(|m| m.source == source)
            .map(|m| m.target)
            .collect())
    }

    #[instrument(skip(self))]
    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        match self.probe_fs_type(source).await? {
            Some(existing) => {
                debug!(source, %existing, "device already formatted");
            }
            None => {
                let mkfs = format!("mkfs.{fs_type}");
                let args: Vec<&str> = if fs_type.starts_with("ext") {
                    vec!["-F", "-m0", source]
                } else {
                    vec![source]
                };
                info!(source, fs_type, "formatting device");
                let out = self.exec.run(&mkfs, &args, None).await.map_err(CsiError::internal)?;
                if !out.success() {
                    return Err(CsiError::MountFailed {
                        path: target.to_owned(),
                        reason: format!("{mkfs} {source}: {}", out.stderr.trim()),
                    });
                }
            }
        }
        self.mount(source, target, fs_type, options).await
    }
}

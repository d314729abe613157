//! Host abstractions used by the node service.
//!
//! Everything the node does to the host goes through one of three traits:
//!
//! | Trait | Responsibility |
//! |---|---|
//! | [`Mounter`] | mount table queries, mount / unmount, format-and-mount |
//! | [`FileSystem`] | path existence, globbing, symlinks, directories, statfs |
//! | [`Executor`] | running external tools (`blkid`, `cryptsetup`, `udevadm`, ...) |
//!
//! [`system`] holds the implementations backed by the real host.

pub mod system;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::CsiError;

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// A successful result carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and `stderr`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `program` with `args`, feeding `stdin` when given, and capture its
    /// output. A non-zero exit is reported through [`CommandOutput::code`],
    /// not as an error.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput>;
}

/// Filesystem usage as reported by `statfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
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

/// Path-level filesystem access.
pub trait FileSystem: Send + Sync {
    /// Whether `path` exists (following symlinks).
    fn exists(&self, path: &Path) -> bool;

    /// Paths matching a glob pattern.
    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>>;

    /// Resolve all symlinks in `path`.
    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf>;

    /// Create `path` and all missing parents.
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Create an empty regular file if it does not exist.
    fn create_file(&self, path: &Path) -> io::Result<()>;

    /// Remove a file or an empty directory; missing paths are not an error.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Usage of the filesystem containing `path`.
    fn statfs(&self, path: &Path) -> io::Result<FsStats>;
}

/// Mount table access and mount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target`. `fs_type` is empty for bind mounts;
    /// `options` are `mount(8)` style options such as `bind` or `ro`.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Unmount `target`.
    async fn unmount(&self, target: &str) -> Result<(), CsiError>;

    /// Whether `path` is currently a mount point.
    async fn is_mount_point(&self, path: &str) -> Result<bool, CsiError>;

    /// Sources of every mount currently on `path`.
    async fn mount_sources(&self, path: &str) -> Result<Vec<String>, CsiError>;

    /// Targets of every mount whose source is `source`.
    async fn mount_targets(&self, source: &str) -> Result<Vec<String>, CsiError>;

    /// Create a filesystem on `source` unless it already carries one, then
    /// mount it on `target`.
    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;
}

//! LUKS encryption of volumes at stage time.
//!
//! Encryption is requested through storage-class parameters that the
//! controller copies into the volume context; the passphrase arrives with the
//! node-stage secrets. All crypto work goes through `cryptsetup`, and the key
//! is only ever handed over on the child's stdin.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::CsiError;
use crate::mount::system::BLKID_NO_SIGNATURE;
use crate::mount::{CommandOutput, Executor, FileSystem};
use crate::types::{PARAM_LUKS_CIPHER, PARAM_LUKS_ENCRYPTED, PARAM_LUKS_KEY_SIZE, SECRET_LUKS_KEY};

const CRYPTSETUP: &str = "cryptsetup";
const MAPPER_DIR: &str = "/dev/mapper";

/// Node RPC a [`LuksContext`] was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NodeStageVolume,
    NodePublishVolume,
    NodeUnstageVolume,
    NodeUnpublishVolume,
}

/// Encryption settings for one node call.
#[derive(Clone, PartialEq, Eq)]
pub struct LuksContext {
    pub encryption_enabled: bool,
    pub key: String,
    pub cipher: String,
    pub key_size: String,
    pub mapping_name: String,
    pub lifecycle: Lifecycle,
}

impl fmt::Debug for LuksContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuksContext")
            .field("encryption_enabled", &self.encryption_enabled)
            .field("key", &"<redacted>")
            .field("cipher", &self.cipher)
            .field("key_size", &self.key_size)
            .field("mapping_name", &self.mapping_name)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl LuksContext {
    /// Build the context from a volume context and the request secrets.
    pub fn from_request(
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
        mapping_name: &str,
        lifecycle: Lifecycle,
    ) -> Self {
        let get =
            |map: &HashMap<String, String>, key: &str| map.get(key).cloned().unwrap_or_default();
        Self {
            encryption_enabled: volume_context
                .get(PARAM_LUKS_ENCRYPTED)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            key: get(secrets, SECRET_LUKS_KEY),
            cipher: get(volume_context, PARAM_LUKS_CIPHER),
            key_size: get(volume_context, PARAM_LUKS_KEY_SIZE),
            mapping_name: mapping_name.to_owned(),
            lifecycle,
        }
    }

    /// Check that every field needed to format or open a mapping is present.
    pub fn validate(&self) -> Result<(), CsiError> {
        if !self.encryption_enabled {
            return Ok(());
        }
        let missing: Vec<&str> = [
            ("cipher", &self.cipher),
            ("key", &self.key),
            ("key size", &self.key_size),
            ("mapping name", &self.mapping_name),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(name, _)| name)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CsiError::Encryption(format!(
                "{:?}: missing {}",
                self.lifecycle,
                missing.join(", ")
            )))
        }
    }
}

/// Path of the device-mapper node for `name`.
pub fn mapper_path(name: &str) -> String {
    format!("{MAPPER_DIR}/{name}")
}

/// Whether `path` lives under `/dev/mapper`.
pub fn is_mapper_path(path: &str) -> bool {
    Path::new(path).parent() == Some(Path::new(MAPPER_DIR))
}

/// Runs `cryptsetup` and `blkid` on behalf of the node service.
pub struct LuksManager {
    exec: Arc<dyn Executor>,
    fs: Arc<dyn FileSystem>,
}

impl LuksManager {
    pub fn new(exec: Arc<dyn Executor>, fs: Arc<dyn FileSystem>) -> Self {
        Self { exec, fs }
    }

    async fn cryptsetup(
        &self,
        args: &[&str],
        key: Option<&str>,
    ) -> Result<CommandOutput, CsiError> {
        self.exec
            .run(CRYPTSETUP, args, key.map(str::as_bytes))
            .await
            .map_err(|e| CsiError::Encryption(format!("{CRYPTSETUP} {}: {e}", args[0])))
    }

    fn check(out: CommandOutput, what: &str) -> Result<CommandOutput, CsiError> {
        if out.success() {
            Ok(out)
        } else {
            Err(CsiError::Encryption(format!(
                "{what} failed ({:?}): {}",
                out.code,
                out.stderr.trim()
            )))
        }
    }

    /// Whether `device` already carries any signature (filesystem, LUKS, ...).
    pub async fn is_formatted(&self, device: &str) -> Result<bool, CsiError> {
        let out = self
            .exec
            .run("blkid", &["-p", device], None)
            .await
            .map_err(CsiError::encryption)?;
        match out.code {
            Some(0) => Ok(true),
            Some(BLKID_NO_SIGNATURE) => Ok(false),
            code => Err(CsiError::Encryption(format!(
                "blkid {device} failed ({code:?}): {}",
                out.stderr.trim()
            ))),
        }
    }

    /// Write a LUKS2 header to `device`, then prove it opens.
    #[instrument(skip(self, ctx), fields(mapping = %ctx.mapping_name))]
    pub async fn format(&self, device: &str, ctx: &LuksContext) -> Result<(), CsiError> {
        ctx.validate()?;
        info!(device, cipher = %ctx.cipher, "formatting device with luks");
        let out = self
            .cryptsetup(
                &[
                    "-q",
                    "luksFormat",
                    "--type",
                    "luks2",
                    "--cipher",
                    &ctx.cipher,
                    "--key-size",
                    &ctx.key_size,
                    "--key-file",
                    "-",
                    device,
                ],
                Some(&ctx.key),
            )
            .await?;
        Self::check(out, "luksFormat")?;

        self.open(device, ctx).await?;
        self.close(&ctx.mapping_name).await
    }

    /// Open the mapping for `device` and return its `/dev/mapper` path.
    #[instrument(skip(self, ctx), fields(mapping = %ctx.mapping_name))]
    pub async fn open(&self, device: &str, ctx: &LuksContext) -> Result<String, CsiError> {
        let path = mapper_path(&ctx.mapping_name);
        if self.fs.exists(Path::new(&path)) {
            debug!(%path, "luks mapping already open");
            return Ok(path);
        }
        let out = self
            .cryptsetup(
                &["luksOpen", "--key-file", "-", device, &ctx.mapping_name],
                Some(&ctx.key),
            )
            .await?;
        Self::check(out, "luksOpen")?;
        info!(device, %path, "luks mapping opened");
        Ok(path)
    }

    /// Close the mapping called `name`.
    #[instrument(skip(self))]
    pub async fn close(&self, name: &str) -> Result<(), CsiError> {
        let out = self.cryptsetup(&["luksClose", name], None).await?;
        Self::check(out, "luksClose").map(drop)
    }

    /// Whether `path` is an active LUKS device-mapper target.
    pub async fn is_luks_mapping(&self, path: &str) -> Result<bool, CsiError> {
        let Some(name) = Path::new(path).file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };
        let out = self.cryptsetup(&["status", name], None).await?;
        if !out.success() {
            return Ok(false);
        }
        Ok(out.stdout.lines().any(|line| {
            line.trim_start()
                .strip_prefix("type:")
                .is_some_and(|t| t.to_ascii_lowercase().contains("luks"))
        }))
    }

    /// Grow the mapping called `name` to its backing device.
    #[instrument(skip(self, key))]
    pub async fn resize(&self, name: &str, key: Option<&str>) -> Result<(), CsiError> {
        let args: &[&str] = if key.is_some() {
            &["resize", "--key-file", "-", name]
        } else {
            &["resize", name]
        };
        let out = self.cryptsetup(args, key).await?;
        Self::check(out, "resize").map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, FakeFs};

    fn ctx(lifecycle: Lifecycle) -> LuksContext {
        let context = HashMap::from([
            (PARAM_LUKS_ENCRYPTED.to_owned(), "true".to_owned()),
            (PARAM_LUKS_CIPHER.to_owned(), "aes-xts-plain64".to_owned()),
            (PARAM_LUKS_KEY_SIZE.to_owned(), "512".to_owned()),
        ]);
        let secrets = HashMap::from([(SECRET_LUKS_KEY.to_owned(), "hunter2".to_owned())]);
        LuksContext::from_request(&context, &secrets, "pvc1", lifecycle)
    }

    fn manager() -> (Arc<FakeFs>, Arc<FakeExec>, LuksManager) {
        let fs = Arc::new(FakeFs::default());
        let exec = Arc::new(FakeExec::new(fs.clone()));
        let luks = LuksManager::new(exec.clone(), fs.clone());
        (fs, exec, luks)
    }

    #[test]
    fn context_reads_parameters_and_secret() {
        let ctx = ctx(Lifecycle::NodeStageVolume);
        assert!(ctx.encryption_enabled);
        assert_eq!(ctx.key, "hunter2");
        assert_eq!(ctx.key_size, "512");
        assert!(ctx.validate().is_ok());
        assert!(!format!("{ctx:?}").contains("hunter2"));
    }

    #[test]
    fn validate_reports_missing_fields() {
        let mut ctx = ctx(Lifecycle::NodeStageVolume);
        ctx.cipher.clear();
        ctx.key.clear();
        let err = ctx.validate().unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.to_string().contains("cipher, key"));

        ctx.encryption_enabled = false;
        assert!(ctx.validate().is_ok());
    }

    #[tokio::test]
    async fn is_formatted_follows_blkid_exit_code() {
        let (_, exec, luks) = manager();
        assert!(!luks.is_formatted("/dev/sdc").await.unwrap());
        exec.set_fs_type("/dev/sdc", "ext4");
        assert!(luks.is_formatted("/dev/sdc").await.unwrap());
        exec.respond("blkid", CommandOutput::failed(4, "io error"));
        assert!(luks.is_formatted("/dev/sdd").await.is_err());
    }

    #[tokio::test]
    async fn format_opens_and_closes_with_key_on_stdin() {
        let (fs, exec, luks) = manager();
        let ctx = ctx(Lifecycle::NodeStageVolume);
        luks.format("/dev/sdc", &ctx).await.unwrap();

        assert_eq!(
            exec.commands(),
            vec![
                "cryptsetup -q luksFormat --type luks2 --cipher aes-xts-plain64 \
                 --key-size 512 --key-file - /dev/sdc",
                "cryptsetup luksOpen --key-file - /dev/sdc pvc1",
                "cryptsetup luksClose pvc1",
            ]
        );
        assert_eq!(exec.stdin_of("luksFormat").as_deref(), Some("hunter2"));
        assert!(!fs.exists(Path::new("/dev/mapper/pvc1")));
        assert!(luks.is_formatted("/dev/sdc").await.unwrap());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (_, exec, luks) = manager();
        let ctx = ctx(Lifecycle::NodeStageVolume);
        assert_eq!(luks.open("/dev/sdc", &ctx).await.unwrap(), "/dev/mapper/pvc1");
        assert_eq!(luks.open("/dev/sdc", &ctx).await.unwrap(), "/dev/mapper/pvc1");
        assert_eq!(exec.commands().len(), 1);
    }

    #[tokio::test]
    async fn status_detects_luks_mappings() {
        let (_, _, luks) = manager();
        let ctx = ctx(Lifecycle::NodeStageVolume);
        assert!(!luks.is_luks_mapping("/dev/mapper/pvc1").await.unwrap());
        luks.open("/dev/sdc", &ctx).await.unwrap();
        assert!(luks.is_luks_mapping("/dev/mapper/pvc1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_close_is_an_encryption_error() {
        let (_, exec, luks) = manager();
        exec.respond("cryptsetup luksClose", CommandOutput::failed(5, "device busy"));
        let err = luks.close("pvc1").await.unwrap_err();
        assert!(matches!(err, CsiError::Encryption(ref m) if m.contains("device busy")));
    }

    #[test]
    fn mapper_paths() {
        assert_eq!(mapper_path("pvc1"), "/dev/mapper/pvc1");
        assert!(is_mapper_path("/dev/mapper/pvc1"));
        assert!(!is_mapper_path("/dev/sdc"));
    }
}

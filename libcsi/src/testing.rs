//! In-memory stand-ins for the cloud API and the host, used by unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::cloud::{
    CloudClient, CloudError, CreateVolumeOptions, Instance, ListOptions, Page, RemoteVolume,
    VolumeStatus,
};
use crate::error::CsiError;
use crate::mount::{CommandOutput, Executor, FileSystem, FsStats, Mounter};

const GIB_BYTES: u64 = 1 << 30;

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

/// Cloud API over in-memory maps. Volume IDs start at 100.
pub struct FakeCloud {
    region: String,
    next_id: AtomicU64,
    volumes: Mutex<BTreeMap<u64, RemoteVolume>>,
    instances: Mutex<BTreeMap<u64, Instance>>,
    page_size: Mutex<usize>,
    initial_status: Mutex<VolumeStatus>,
    next_attach_error: Mutex<Option<CloudError>>,
    attach_delay_polls: AtomicU32,
    pub attach_calls: AtomicU32,
    pub detach_calls: AtomicU32,
    pub create_calls: AtomicU32,
    pub delete_calls: AtomicU32,
    pub resize_calls: AtomicU32,
    pub clone_calls: AtomicU32,
}

impl FakeCloud {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_owned(),
            next_id: AtomicU64::new(100),
            volumes: Mutex::default(),
            instances: Mutex::default(),
            page_size: Mutex::new(100),
            initial_status: Mutex::new(VolumeStatus::Active),
            next_attach_error: Mutex::default(),
            attach_delay_polls: AtomicU32::new(0),
            attach_calls: AtomicU32::default(),
            detach_calls: AtomicU32::default(),
            create_calls: AtomicU32::default(),
            delete_calls: AtomicU32::default(),
            resize_calls: AtomicU32::default(),
            clone_calls: AtomicU32::default(),
        }
    }

    pub fn add_instance(&self, id: u64, label: &str, memory_gib: u64) {
        self.instances.lock().unwrap().insert(
            id,
            Instance {
                id,
                label: label.to_owned(),
                region: self.region.clone(),
                memory_bytes: memory_gib * GIB_BYTES,
            },
        );
    }

    /// Insert a volume directly and return its ID.
    pub fn add_volume(&self, label: &str, size_gib: u64, attached: Option<u64>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let volume = RemoteVolume {
            id,
            label: label.to_owned(),
            size_gib,
            region: self.region.clone(),
            status: VolumeStatus::Active,
            attached_instance_id: attached,
            filesystem_path: device_path(label),
            tags: Vec::new(),
        };
        self.volumes.lock().unwrap().insert(id, volume);
        id
    }

    pub fn volume(&self, id: u64) -> Option<RemoteVolume> {
        self.volumes.lock().unwrap().get(&id).cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().unwrap().len()
    }

    pub fn set_region(&self, id: u64, region: &str) {
        if let Some(v) = self.volumes.lock().unwrap().get_mut(&id) {
            v.region = region.to_owned();
        }
    }

    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock().unwrap() = size;
    }

    /// New and cloned volumes start in `status` and turn active on the next
    /// read.
    pub fn set_initial_status(&self, status: VolumeStatus) {
        *self.initial_status.lock().unwrap() = status;
    }

    pub fn fail_next_attach(&self, err: CloudError) {
        *self.next_attach_error.lock().unwrap() = Some(err);
    }

    /// Attachments become visible only after `polls` reads of the volume.
    pub fn delay_attach_visibility(&self, polls: u32) {
        self.attach_delay_polls.store(polls, Ordering::SeqCst);
    }

    fn not_found(id: u64) -> CloudError {
        CloudError::NotFound(format!("volume {id}"))
    }

    fn paginate<T: Clone>(&self, items: Vec<T>, opts: &ListOptions) -> Page<T> {
        let size = opts
            .page_size
            .map_or(*self.page_size.lock().unwrap(), |s| s as usize)
            .max(1);
        let pages = u32::try_from(items.len().div_ceil(size)).unwrap().max(1);
        let page = opts.page.max(1);
        let start = (page as usize - 1) * size;
        Page {
            data: items.into_iter().skip(start).take(size).collect(),
            page,
            pages,
        }
    }
}

fn device_path(label: &str) -> String {
    format!("/dev/disk/by-id/scsi-0Linode_Volume_{label}")
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn list_volumes(&self, opts: &ListOptions) -> Result<Page<RemoteVolume>, CloudError> {
        let items: Vec<_> = self
            .volumes
            .lock()
            .unwrap()
            .values()
            .filter(|v| opts.label.as_ref().is_none_or(|l| &v.label == l))
            .cloned()
            .collect();
        Ok(self.paginate(items, opts))
    }

    async fn get_volume(&self, volume_id: u64) -> Result<RemoteVolume, CloudError> {
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes.get_mut(&volume_id).ok_or_else(|| Self::not_found(volume_id))?;
        let seen = volume.clone();
        if volume.status == VolumeStatus::Creating || volume.status == VolumeStatus::Resizing {
            volume.status = VolumeStatus::Active;
        }
        let hidden = self
            .attach_delay_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(RemoteVolume {
                attached_instance_id: None,
                ..seen
            });
        }
        Ok(seen)
    }

    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<RemoteVolume, CloudError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let volume = RemoteVolume {
            id,
            label: opts.label.clone(),
            size_gib: opts.size_gib,
            region: opts.region.clone(),
            status: self.initial_status.lock().unwrap().clone(),
            attached_instance_id: None,
            filesystem_path: device_path(&opts.label),
            tags: opts.tags.clone(),
        };
        self.volumes.lock().unwrap().insert(id, volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: u64) -> Result<(), CloudError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut volumes = self.volumes.lock().unwrap();
        match volumes.get(&volume_id) {
            None => Err(Self::not_found(volume_id)),
            Some(v) if v.attached_instance_id.is_some() => Err(CloudError::Api {
                status: 400,
                message: "volume is attached".into(),
            }),
            Some(_) => {
                volumes.remove(&volume_id);
                Ok(())
            }
        }
    }

    async fn attach_volume(
        &self,
        volume_id: u64,
        instance_id: u64,
    ) -> Result<RemoteVolume, CloudError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_attach_error.lock().unwrap().take() {
            return Err(err);
        }
        if !self.instances.lock().unwrap().contains_key(&instance_id) {
            return Err(CloudError::NotFound(format!("instance {instance_id}")));
        }
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes.get_mut(&volume_id).ok_or_else(|| Self::not_found(volume_id))?;
        if volume.attached_instance_id.is_some() {
            return Err(CloudError::AlreadyAttached(volume_id));
        }
        volume.attached_instance_id = Some(instance_id);
        Ok(volume.clone())
    }

    async fn detach_volume(&self, volume_id: u64) -> Result<(), CloudError> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes.get_mut(&volume_id).ok_or_else(|| Self::not_found(volume_id))?;
        volume.attached_instance_id = None;
        Ok(())
    }

    async fn resize_volume(&self, volume_id: u64, size_gib: u64) -> Result<(), CloudError> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes.get_mut(&volume_id).ok_or_else(|| Self::not_found(volume_id))?;
        if size_gib < volume.size_gib {
            return Err(CloudError::Api {
                status: 400,
                message: "volumes can only be resized up".into(),
            });
        }
        volume.size_gib = size_gib;
        volume.status = VolumeStatus::Resizing;
        Ok(())
    }

    async fn clone_volume(&self, volume_id: u64, label: &str) -> Result<RemoteVolume, CloudError> {
        self.clone_calls.fetch_add(1, Ordering::SeqCst);
        let source = self.volume(volume_id).ok_or_else(|| Self::not_found(volume_id))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let volume = RemoteVolume {
            id,
            label: label.to_owned(),
            status: self.initial_status.lock().unwrap().clone(),
            attached_instance_id: None,
            filesystem_path: device_path(label),
            ..source
        };
        self.volumes.lock().unwrap().insert(id, volume.clone());
        Ok(volume)
    }

    async fn list_instances(&self, opts: &ListOptions) -> Result<Page<Instance>, CloudError> {
        let items: Vec<_> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| opts.label.as_ref().is_none_or(|l| &i.label == l))
            .cloned()
            .collect();
        Ok(self.paginate(items, opts))
    }

    async fn get_instance(&self, instance_id: u64) -> Result<Instance, CloudError> {
        self.instances
            .lock()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Path set with symlinks and canned statfs results.
#[derive(Default)]
pub struct FakeFs {
    files: Mutex<BTreeSet<PathBuf>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    links: Mutex<HashMap<PathBuf, PathBuf>>,
    stats: Mutex<HashMap<PathBuf, FsStats>>,
}

impl FakeFs {
    pub fn add_file(&self, path: &str) {
        self.files.lock().unwrap().insert(PathBuf::from(path));
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(PathBuf::from(path));
    }

    /// Add `link` pointing at `target`; the target is created as a file.
    pub fn add_symlink(&self, link: &str, target: &str) {
        self.add_file(target);
        self.links
            .lock()
            .unwrap()
            .insert(PathBuf::from(link), PathBuf::from(target));
    }

    pub fn remove_path(&self, path: &str) {
        let path = Path::new(path);
        self.files.lock().unwrap().remove(path);
        self.dirs.lock().unwrap().remove(path);
    }

    pub fn set_stats(&self, path: &str, stats: FsStats) {
        self.stats.lock().unwrap().insert(PathBuf::from(path), stats);
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(Path::new(path))
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains(Path::new(path))
    }
}

impl FileSystem for FakeFs {
    fn exists(&self, path: &Path) -> bool {
        self.links.lock().unwrap().contains_key(path)
            || self.files.lock().unwrap().contains(path)
            || self.dirs.lock().unwrap().contains(path)
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|p| pattern.matches_path(p))
            .cloned()
            .collect())
    }

    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
        if let Some(target) = self.links.lock().unwrap().get(path) {
            return Ok(target.clone());
        }
        if self.exists(path) {
            Ok(path.to_path_buf())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        self.files.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.files.lock().unwrap().remove(path);
        self.dirs.lock().unwrap().remove(path);
        Ok(())
    }

    fn statfs(&self, path: &Path) -> io::Result<FsStats> {
        self.stats
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub line: String,
    pub stdin: Option<String>,
}

/// Records commands and emulates `blkid` and `cryptsetup` against a
/// [`FakeFs`]. Canned responses registered with [`FakeExec::respond`] win
/// over the emulation.
pub struct FakeExec {
    fs: Arc<FakeFs>,
    log: Mutex<Vec<Invocation>>,
    fs_types: Mutex<HashMap<String, String>>,
    canned: Mutex<Vec<(String, CommandOutput)>>,
}

impl FakeExec {
    pub fn new(fs: Arc<FakeFs>) -> Self {
        Self {
            fs,
            log: Mutex::default(),
            fs_types: Mutex::default(),
            canned: Mutex::default(),
        }
    }

    /// Command lines run so far.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|i| i.line.clone()).collect()
    }

    /// Stdin of the first command whose line contains `needle`.
    pub fn stdin_of(&self, needle: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.line.contains(needle))
            .and_then(|i| i.stdin.clone())
    }

    /// Report `fs_type` as the signature on `device`.
    pub fn set_fs_type(&self, device: &str, fs_type: &str) {
        self.fs_types
            .lock()
            .unwrap()
            .insert(device.to_owned(), fs_type.to_owned());
    }

    /// Drop every canned response.
    pub fn clear_responses(&self) {
        self.canned.lock().unwrap().clear();
    }

    /// Answer every command line starting with `prefix` with `output`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.canned.lock().unwrap().push((prefix.to_owned(), output));
    }

    fn emulate(&self, program: &str, args: &[&str]) -> CommandOutput {
        match (program, args) {
            ("blkid", [.., device]) => match self.fs_types.lock().unwrap().get(*device) {
                Some(t) if args.contains(&"value") => CommandOutput::ok(format!("{t}\n")),
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed(2, ""),
            },
            ("cryptsetup", [.., "luksFormat", _, _, _, _, _, _, _, _, device]) => {
                self.set_fs_type(device, "crypto_LUKS");
                CommandOutput::ok("")
            }
            ("cryptsetup", ["luksOpen", _, _, _, name]) => {
                self.fs.add_file(&format!("/dev/mapper/{name}"));
                CommandOutput::ok("")
            }
            ("cryptsetup", ["luksClose", name]) => {
                self.fs.remove_path(&format!("/dev/mapper/{name}"));
                CommandOutput::ok("")
            }
            ("cryptsetup", ["status", name]) => {
                if self.fs.is_file(&format!("/dev/mapper/{name}")) {
                    CommandOutput::ok(format!("/dev/mapper/{name} is active.\n  type:    LUKS2\n"))
                } else {
                    CommandOutput::failed(4, format!("/dev/mapper/{name} is inactive."))
                }
            }
            _ => CommandOutput::ok(""),
        }
    }
}

#[async_trait]
impl Executor for FakeExec {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.log.lock().unwrap().push(Invocation {
            line: line.clone(),
            stdin: stdin.map(|s| String::from_utf8_lossy(s).into_owned()),
        });
        let canned = self
            .canned
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone());
        Ok(canned.unwrap_or_else(|| self.emulate(program, args)))
    }
}

// ---------------------------------------------------------------------------
// Mounter
// ---------------------------------------------------------------------------

/// One entry of the fake mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Mount table kept in memory.
#[derive(Default)]
pub struct FakeMounter {
    table: Mutex<Vec<FakeMount>>,
    formatted: Mutex<Vec<(String, String)>>,
    mount_calls: AtomicU32,
    gate: Mutex<Option<Arc<Semaphore>>>,
    entered: Notify,
}

impl FakeMounter {
    pub fn add_mount(&self, source: &str, target: &str, fs_type: &str) {
        self.table.lock().unwrap().push(FakeMount {
            source: source.to_owned(),
            target: target.to_owned(),
            fs_type: fs_type.to_owned(),
            options: Vec::new(),
        });
    }

    pub fn mounts(&self) -> Vec<FakeMount> {
        self.table.lock().unwrap().clone()
    }

    pub fn mount_at(&self, target: &str) -> Option<FakeMount> {
        self.mounts().into_iter().find(|m| m.target == target)
    }

    /// `(device, fs_type)` pairs passed to `format_and_mount`.
    pub fn formatted(&self) -> Vec<(String, String)> {
        self.formatted.lock().unwrap().clone()
    }

    pub fn mount_calls(&self) -> u32 {
        self.mount_calls.load(Ordering::SeqCst)
    }

    /// Park every following `mount` until [`FakeMounter::release_mounts`].
    pub fn hold_mounts(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Resolves once a `mount` call is parked on the gate.
    pub async fn mount_started(&self) {
        self.entered.notified().await;
    }

    pub fn release_mounts(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1024);
        }
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            let _ = gate.acquire().await;
        }
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        self.table.lock().unwrap().push(FakeMount {
            source: source.to_owned(),
            target: target.to_owned(),
            fs_type: fs_type.to_owned(),
            options: options.to_vec(),
        });
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        let mut table = self.table.lock().unwrap();
        let Some(pos) = table.iter().rposition(|m| m.target == target) else {
            return Err(CsiError::UnmountFailed {
                path: target.to_owned(),
                reason: "not mounted".into(),
            });
        };
        table.remove(pos);
        Ok(())
    }

    async fn is_mount_point(&self, path: &str) -> Result<bool, CsiError> {
        Ok(self.table.lock().unwrap().iter().any(|m| m.target == path))
    }

    async fn mount_sources(&self, path: &str) -> Result<Vec<String>, CsiError> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.target == path)
            .map(|m| m.source.clone())
            .collect())
    }

    async fn mount_targets(&self, source: &str) -> Result<Vec<String>, CsiError> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.source == source)
            .map(|m| m.target.clone())
            .collect())
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.formatted
            .lock()
            .unwrap()
            .push((source.to_owned(), fs_type.to_owned()));
        self.mount(source, target, fs_type, options).await
    }
}

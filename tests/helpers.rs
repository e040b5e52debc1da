//! Shared test utilities: a fake privileged host and friends.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use snapdisk::config::Config;
use snapdisk::host::{Host, ImageInfo};
use snapdisk::image::{Image, ImageFactory};
use snapdisk::medium::Bundler;
use snapdisk::output::MemoryOutput;
use snapdisk::{Disk, DiskContext, Error, Result};
use tempfile::TempDir;

/// Default size of fake media: 100 MiB in sectors.
pub const FAKE_SECTORS: u64 = 204_800;

/// Event log shared by the fake host and fake images, so tests can check
/// ordering across both.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// A host step, for failure injection or for hooks run after it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    /// The n-th loop attach (1-based).
    Attach(usize),
    Size,
    Sparse,
    DmCreate,
    Overlay,
}

#[derive(Default)]
struct HostState {
    next_loop: usize,
    attaches: usize,
    loops: HashSet<PathBuf>,
    dm: HashSet<String>,
    tables: Vec<String>,
}

/// Callback run once when the host reaches a step.
pub type Hook = Box<dyn FnOnce() + Send>;

/// In-memory stand-in for losetup/blockdev/dd/dmsetup/qemu-img.
pub struct FakeHost {
    log: EventLog,
    state: Mutex<HostState>,
    formats: Mutex<HashMap<PathBuf, String>>,
    fail_at: Option<FailAt>,
    hook: Mutex<Option<(FailAt, Hook)>>,
}

impl FakeHost {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            state: Mutex::new(HostState::default()),
            formats: Mutex::new(HashMap::new()),
            fail_at: None,
            hook: Mutex::new(None),
        }
    }

    pub fn failing(log: EventLog, step: FailAt) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new(log)
        }
    }

    /// Report `format` for `path` instead of raw.
    pub fn set_format(&self, path: &Path, format: &str) {
        self.formats
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), format.to_string());
    }

    /// Run `hook` right after `step` has allocated its resource.
    pub fn on_step(&self, step: FailAt, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some((step, Box::new(hook)));
    }

    fn fire(&self, step: FailAt) {
        let hook = {
            let mut slot = self.hook.lock().unwrap();
            match slot.as_ref() {
                Some((at, _)) if *at == step => slot.take(),
                _ => None,
            }
        };
        if let Some((_, hook)) = hook {
            hook();
        }
    }

    pub fn attached_loops(&self) -> usize {
        self.state.lock().unwrap().loops.len()
    }

    pub fn dm_nodes(&self) -> usize {
        self.state.lock().unwrap().dm.len()
    }

    pub fn tables(&self) -> Vec<String> {
        self.state.lock().unwrap().tables.clone()
    }

    fn record(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }

    fn fail(&self, program: &str) -> Error {
        self.record(format!("{} FAILED", program));
        Error::ExternalTool {
            program: program.to_string(),
            code: 1,
            stderr: "injected failure".to_string(),
        }
    }
}

impl Host for FakeHost {
    fn loop_attach(&self, file: &Path) -> Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        state.attaches += 1;
        let step = FailAt::Attach(state.attaches);
        if self.fail_at == Some(step) {
            drop(state);
            return Err(self.fail("losetup"));
        }
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.loops.insert(device.clone());
        drop(state);
        self.record(format!("attach {} {}", file.display(), device.display()));
        self.fire(step);
        Ok(device)
    }

    fn loop_detach(&self, device: &Path) -> Result<()> {
        let removed = self.state.lock().unwrap().loops.remove(device);
        self.record(format!("detach {}", device.display()));
        if !removed {
            return Err(self.fail("losetup"));
        }
        Ok(())
    }

    fn size_in_sectors(&self, device: &Path) -> Result<u64> {
        if self.fail_at == Some(FailAt::Size) {
            return Err(self.fail("blockdev"));
        }
        self.record(format!("getsz {}", device.display()));
        Ok(FAKE_SECTORS)
    }

    fn extend_sparse(&self, file: &Path, sectors: u64) -> Result<()> {
        if self.fail_at == Some(FailAt::Sparse) {
            return Err(self.fail("dd"));
        }
        fs::OpenOptions::new().write(true).open(file)?.set_len(sectors * 512)?;
        self.record(format!("sparse {} {}", file.display(), sectors));
        Ok(())
    }

    fn dm_create(&self, name: &str, table: &Path) -> Result<()> {
        let contents = fs::read_to_string(table)?;
        if self.fail_at == Some(FailAt::DmCreate) {
            return Err(self.fail("dmsetup"));
        }
        let mut state = self.state.lock().unwrap();
        state.dm.insert(name.to_string());
        state.tables.push(contents);
        drop(state);
        self.record(format!("dm create {}", name));
        self.fire(FailAt::DmCreate);
        Ok(())
    }

    fn dm_remove(&self, name: &str) -> Result<()> {
        let removed = self.state.lock().unwrap().dm.remove(name);
        self.record(format!("dm remove {}", name));
        if !removed {
            return Err(self.fail("dmsetup"));
        }
        Ok(())
    }

    fn image_info(&self, file: &Path) -> Result<ImageInfo> {
        let format = self
            .formats
            .lock()
            .unwrap()
            .get(file)
            .cloned()
            .unwrap_or_else(|| "raw".to_string());
        Ok(ImageInfo {
            format,
            virtual_size: FAKE_SECTORS * 512,
            backing_filename: None,
        })
    }

    fn create_overlay(&self, base: &Path, base_format: &str, overlay: &Path) -> Result<()> {
        if self.fail_at == Some(FailAt::Overlay) {
            return Err(self.fail("qemu-img"));
        }
        fs::write(overlay, b"QFI\xfb")?;
        self.set_format(overlay, "qcow2");
        self.record(format!(
            "overlay {} {} {}",
            base.display(),
            base_format,
            overlay.display()
        ));
        Ok(())
    }

    fn convert_to_raw(&self, image: &Path, format: &str, dest: &Path) -> Result<()> {
        let file = fs::File::create(dest)?;
        file.set_len(FAKE_SECTORS * 512)?;
        self.record(format!(
            "convert {} {} {}",
            image.display(),
            format,
            dest.display()
        ));
        Ok(())
    }
}

/// Bundler that writes a small marker file.
pub struct FakeBundler {
    pub calls: Mutex<usize>,
    pub fail: bool,
}

impl FakeBundler {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(0),
            fail: false,
        }
    }
}

impl Bundler for FakeBundler {
    fn create_image(&self, image: &Path, _exclude: &[PathBuf]) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        fs::write(image, b"partial")?;
        if self.fail {
            return Err(Error::Bundle("mksquashfs died".into()));
        }
        Ok(())
    }
}

/// Image that logs enable/destroy into the shared event log.
pub struct FakeImage {
    device: PathBuf,
    log: EventLog,
    fail_enable: bool,
}

impl Image for FakeImage {
    fn enable(&mut self) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("image enable {}", self.device.display()));
        if self.fail_enable {
            return Err(Error::Bundle("cannot inspect".into()));
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("image destroy {}", self.device.display()));
        Ok(())
    }
}

pub struct FakeImageFactory {
    pub log: EventLog,
    pub fail_enable: bool,
}

impl ImageFactory for FakeImageFactory {
    fn open(&self, device: &Path, _info: &ImageInfo) -> Result<Box<dyn Image>> {
        Ok(Box::new(FakeImage {
            device: device.to_path_buf(),
            log: Arc::clone(&self.log),
            fail_enable: self.fail_enable,
        }))
    }
}

/// A temporary staging parent, a raw medium file and fake collaborators.
pub struct TestEnv {
    /// Kept alive for the lifetime of the environment.
    pub _temp_dir: TempDir,
    pub tmp: PathBuf,
    pub medium: PathBuf,
    pub log: EventLog,
    pub host: Arc<FakeHost>,
    pub output: Arc<MemoryOutput>,
    pub bundler: Arc<FakeBundler>,
    pub fail_enable: bool,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_host(|log| FakeHost::new(log))
    }

    pub fn failing(step: FailAt) -> Self {
        Self::with_host(|log| FakeHost::failing(log, step))
    }

    fn with_host(make: impl FnOnce(EventLog) -> FakeHost) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tmp = temp_dir.path().join("tmp");
        fs::create_dir(&tmp).expect("Failed to create tmp dir");
        let medium = temp_dir.path().join("disk.img");
        fs::write(&medium, vec![0xAB; 4096]).expect("Failed to create medium");

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        Self {
            _temp_dir: temp_dir,
            tmp,
            medium,
            host: Arc::new(make(Arc::clone(&log))),
            log,
            output: Arc::new(MemoryOutput::new()),
            bundler: Arc::new(FakeBundler::new()),
            fail_enable: false,
        }
    }

    pub fn context(&self) -> DiskContext {
        DiskContext {
            host: self.host.clone(),
            output: self.output.clone(),
            bundler: self.bundler.clone(),
            images: Arc::new(FakeImageFactory {
                log: Arc::clone(&self.log),
                fail_enable: self.fail_enable,
            }),
        }
    }

    /// A disk over the raw medium file, staged under `tmp`.
    pub fn disk(&self) -> Disk {
        self.disk_for(&self.medium)
    }

    pub fn disk_for(&self, source: &Path) -> Disk {
        Disk::new(source, Some(&self.tmp), &Config::default(), self.context())
            .expect("Failed to create disk")
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Entries left in the staging parent.
    pub fn staging_entries(&self) -> usize {
        fs::read_dir(&self.tmp).expect("read tmp").count()
    }
}

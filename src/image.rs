//! Registry of live image handles.
//!
//! An image is whatever downstream tooling builds on top of a snapshot
//! device (an OS inspection session, a raw reader, ...). The registry keeps
//! every live one so teardown can destroy them before the devices they sit
//! on are removed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::extract;
use crate::host::ImageInfo;

/// An opaque image collaborator.
pub trait Image: Send {
    /// Make the image ready for use. Called once, right after construction.
    fn enable(&mut self) -> Result<()>;
    /// Release everything the image holds on its device.
    fn destroy(&mut self) -> Result<()>;
}

/// Builds [`Image`]s over snapshot devices.
pub trait ImageFactory: Send + Sync {
    fn open(&self, device: &Path, info: &ImageInfo) -> Result<Box<dyn Image>>;
}

/// A registered image. Clones refer to the same image.
#[derive(Clone)]
pub struct ImageHandle {
    id: u64,
    device: PathBuf,
    image: Arc<Mutex<Box<dyn Image>>>,
}

impl ImageHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The snapshot device this image owns.
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Lock the image for use.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Image>> {
        self.image.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn destroy(&self) -> Result<()> {
        self.lock().destroy()
    }
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("id", &self.id)
            .field("device", &self.device)
            .finish()
    }
}

/// Live images in creation order.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: u64,
    live: Vec<ImageHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Whether a live handle already owns `device`.
    pub fn owns(&self, device: &Path) -> bool {
        self.live.iter().any(|h| h.device == device)
    }

    /// Register an enabled image. At most one handle per device.
    pub fn insert(&mut self, device: &Path, image: Box<dyn Image>) -> Result<ImageHandle> {
        if self.owns(device) {
            return Err(Error::DeviceInUse(device.to_path_buf()));
        }
        self.next_id += 1;
        let handle = ImageHandle {
            id: self.next_id,
            device: device.to_path_buf(),
            image: Arc::new(Mutex::new(image)),
        };
        self.live.push(handle.clone());
        Ok(handle)
    }

    /// Unregister a handle without destroying it.
    pub fn remove(&mut self, id: u64) -> Result<ImageHandle> {
        let pos = self
            .live
            .iter()
            .position(|h| h.id == id)
            .ok_or(Error::UnknownImage(id))?;
        Ok(self.live.remove(pos))
    }

    /// Take every live handle, oldest first.
    pub fn drain(&mut self) -> Vec<ImageHandle> {
        std::mem::take(&mut self.live)
    }
}

/// Destroy a single, already unregistered handle.
pub fn destroy(handle: &ImageHandle) -> Result<()> {
    tracing::debug!(id = handle.id, device = %handle.device.display(), "destroying image");
    handle.destroy()
}

/// Destroy handles newest first. Failures are logged and counted.
pub fn destroy_all(handles: Vec<ImageHandle>) -> usize {
    let mut failures = 0;
    for handle in handles.into_iter().rev() {
        if let Err(e) = destroy(&handle) {
            tracing::warn!(id = handle.id, device = %handle.device.display(), error = %e, "image teardown failed");
            failures += 1;
        }
    }
    failures
}

/// The plainest image: a registry claim on the device, checked readable
/// and measured when enabled. Readers open the device themselves.
#[derive(Debug)]
pub struct RawImage {
    device: PathBuf,
    format: String,
    size: Option<u64>,
}

impl RawImage {
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Device size in bytes, known while enabled.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

impl Image for RawImage {
    fn enable(&mut self) -> Result<()> {
        let size = extract::device_size(&self.device)?;
        tracing::debug!(device = %self.device.display(), size, "raw image enabled");
        self.size = Some(size);
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.size = None;
        Ok(())
    }
}

/// Factory for [`RawImage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RawImageFactory;

impl ImageFactory for RawImageFactory {
    fn open(&self, device: &Path, info: &ImageInfo) -> Result<Box<dyn Image>> {
        Ok(Box::new(RawImage {
            device: device.to_path_buf(),
            format: info.format.clone(),
            size: None,
        }))
    }
}

//! The resource-lifecycle manager.
//!
//! A [`Disk`] never alters the medium it is created from: every change
//! goes to a snapshot. It owns a private staging directory, the cleanup
//! stack for every kernel and filesystem resource it allocates, and the
//! registry of images built on top of its snapshots.
//!
//! Teardown is a single idempotent operation reachable from
//! [`Disk::cleanup`], from `Drop`, and from a [`ShutdownHandle`] handed to
//! a signal handler. Images are destroyed first, then the cleanup stack is
//! unwound, and the staging directory goes last.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cleanup::{self, CleanupJob, CleanupReport, CleanupStack};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::{Host, SystemHost};
use crate::image::{self, ImageFactory, ImageHandle, RawImageFactory, Registry};
use crate::medium::{self, Bundler, ResolvedMedium, SquashfsBundler};
use crate::output::{ConsoleOutput, Output};
use crate::snapshot;
use crate::tmpdir;

/// The collaborators a [`Disk`] works with.
#[derive(Clone)]
pub struct DiskContext {
    pub host: Arc<dyn Host>,
    pub output: Arc<dyn Output>,
    pub bundler: Arc<dyn Bundler>,
    pub images: Arc<dyn ImageFactory>,
}

impl DiskContext {
    /// Real helpers, console output, squashfs bundling and raw images.
    pub fn system(config: &Config) -> Self {
        Self {
            host: Arc::new(SystemHost::new(config.retry)),
            output: Arc::new(ConsoleOutput),
            bundler: Arc::new(SquashfsBundler),
            images: Arc::new(RawImageFactory),
        }
    }
}

/// What a teardown did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Images destroyed.
    pub images: usize,
    /// Images whose destroy failed.
    pub image_failures: usize,
    /// Cleanup jobs run, newest first, and their failures.
    pub cleanup: CleanupReport,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.image_failures == 0 && self.cleanup.is_clean()
    }
}

/// State shared between a [`Disk`] and its [`ShutdownHandle`]s.
struct Shared {
    host: Arc<dyn Host>,
    jobs: Mutex<CleanupStack>,
    images: Mutex<Registry>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, CleanupStack> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn images(&self) -> MutexGuard<'_, Registry> {
        self.images.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Record the undo job for a resource that now exists.
    ///
    /// Once teardown has started the job runs right away instead, and the
    /// caller is told to stop allocating.
    fn register(&self, job: CleanupJob) -> Result<()> {
        {
            // The flag is checked under the lock teardown drains with, so a
            // job is either drained or run here, never lost.
            let mut jobs = self.jobs();
            if !self.is_shutting_down() {
                jobs.push(job);
                return Ok(());
            }
        }
        tracing::warn!(%job, "allocation finished during teardown, releasing it now");
        if let Err(e) = job.run(self.host.as_ref()) {
            tracing::warn!(%job, error = %e, "cleanup job failed");
        }
        Err(Error::ShuttingDown)
    }

    /// Tear everything down once. Returns `None` if teardown already began.
    fn shutdown(&self) -> Option<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let handles = self.images().drain();
        let images = handles.len();
        let image_failures = image::destroy_all(handles);

        let jobs = self.jobs().drain();
        let cleanup = cleanup::unwind(jobs, self.host.as_ref());

        if !cleanup.is_clean() {
            tracing::warn!(failed = cleanup.failed.len(), "some resources could not be released");
        }

        Some(ShutdownReport {
            images,
            image_failures,
            cleanup,
        })
    }
}

/// Cloneable trigger for a [`Disk`]'s teardown, safe to move into a
/// signal-handling thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Destroy all images and unwind the cleanup stack.
    ///
    /// Only reverses what is already registered. Returns `None` when
    /// another caller has already started the teardown.
    pub fn shutdown(&self) -> Option<ShutdownReport> {
        self.shared.shutdown()
    }
}

/// A disk hosting an operating system, worked on through snapshots.
pub struct Disk {
    source: PathBuf,
    staging: PathBuf,
    ctx: DiskContext,
    shared: Arc<Shared>,
    medium: Option<ResolvedMedium>,
}

impl Disk {
    /// Create a manager for `source`, with its staging directory under
    /// `tmp` (or the best available temporary location).
    pub fn new(
        source: impl Into<PathBuf>,
        tmp: Option<&Path>,
        config: &Config,
        ctx: DiskContext,
    ) -> Result<Self> {
        let parent = tmpdir::select_staging_parent(tmp, config)?;
        let staging = tmpdir::create_staging_area(&parent)?;

        let shared = Arc::new(Shared {
            host: Arc::clone(&ctx.host),
            jobs: Mutex::new(CleanupStack::new()),
            images: Mutex::new(Registry::new()),
            shutting_down: AtomicBool::new(false),
        });
        shared.register(CleanupJob::RemoveDir(staging.clone()))?;

        tracing::debug!(staging = %staging.display(), "created staging directory");

        Ok(Self {
            source: source.into(),
            staging,
            ctx,
            shared,
            medium: None,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Resolve the source medium (cached after the first call).
    pub fn medium(&mut self) -> Result<&ResolvedMedium> {
        let resolved = match self.medium.take() {
            Some(m) => m,
            None => {
                self.ensure_running()?;
                let shared = Arc::clone(&self.shared);
                medium::resolve(
                    &self.source,
                    &self.staging,
                    self.ctx.bundler.as_ref(),
                    self.ctx.output.as_ref(),
                    |job| shared.register(job),
                )?
            }
        };
        Ok(self.medium.insert(resolved))
    }

    /// The source medium as a file path: the source itself, or the image
    /// the host filesystem was bundled into.
    pub fn file(&mut self) -> Result<PathBuf> {
        Ok(self.medium()?.path.clone())
    }

    /// Create a snapshot of the source medium and return the device (or
    /// overlay file) to work on.
    pub fn snapshot(&mut self) -> Result<PathBuf> {
        let medium = self.medium()?.clone();
        self.ensure_running()?;
        let shared = Arc::clone(&self.shared);
        snapshot::snapshot(
            &medium,
            &self.staging,
            self.ctx.host.as_ref(),
            self.ctx.output.as_ref(),
            |job| shared.register(job),
        )
    }

    /// Build, enable and register an image over `device`.
    pub fn get_image(&self, device: &Path) -> Result<ImageHandle> {
        self.ensure_running()?;
        if self.shared.images().owns(device) {
            return Err(Error::DeviceInUse(device.to_path_buf()));
        }

        let info = self.ctx.host.image_info(device)?;
        let mut image = self.ctx.images.open(device, &info)?;
        if let Err(e) = image.enable() {
            if let Err(destroy_err) = image.destroy() {
                tracing::warn!(error = %destroy_err, "destroying half-enabled image failed");
            }
            return Err(e);
        }

        let mut registry = self.shared.images();
        let refused = if self.shared.is_shutting_down() {
            Some(Error::ShuttingDown)
        } else if registry.owns(device) {
            Some(Error::DeviceInUse(device.to_path_buf()))
        } else {
            None
        };
        if let Some(e) = refused {
            drop(registry);
            if let Err(destroy_err) = image.destroy() {
                tracing::warn!(error = %destroy_err, "destroying unregistered image failed");
            }
            return Err(e);
        }

        let handle = registry.insert(device, image)?;
        tracing::debug!(id = handle.id(), device = %device.display(), "image enabled");
        Ok(handle)
    }

    /// Unregister and destroy an image created by [`Disk::get_image`].
    pub fn destroy_image(&self, handle: ImageHandle) -> Result<()> {
        let handle = self.shared.images().remove(handle.id())?;
        image::destroy(&handle)
    }

    /// Number of registered images.
    pub fn live_images(&self) -> usize {
        self.shared.images().len()
    }

    /// Pending cleanup jobs, oldest first.
    pub fn pending_jobs(&self) -> Vec<CleanupJob> {
        self.shared.jobs().jobs().to_vec()
    }

    /// A handle that can trigger teardown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Release everything this disk allocated. Must be called before the
    /// program ends; safe to call more than once.
    pub fn cleanup(&self) -> Option<ShutdownReport> {
        self.shared.shutdown()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        self.cleanup();
    }
}

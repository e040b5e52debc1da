//! Create command - snapshot a medium and dump it into an image file.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use snapdisk::config::Config;
use snapdisk::extract;
use snapdisk::{Disk, DiskContext, ShutdownHandle};

use crate::timing::Timer;

/// Exit status after an interrupt-triggered teardown.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Options for the create command.
pub struct CreateOptions {
    pub medium: PathBuf,
    pub outfile: PathBuf,
    pub tmpdir: Option<PathBuf>,
    /// Work on a snapshot (default) rather than the medium itself.
    pub snapshot: bool,
    /// Overwrite an existing outfile.
    pub force: bool,
}

/// Execute the create command.
pub fn cmd_create(opts: &CreateOptions, config: &Config) -> Result<()> {
    require_root()?;
    check_outfile(&opts.outfile, &opts.medium, opts.force)?;

    let interrupt = Arc::new(Interrupt::default());
    install_signal_handler(Arc::clone(&interrupt))?;

    let ctx = DiskContext::system(config);
    let mut disk = Disk::new(&opts.medium, opts.tmpdir.as_deref(), config, ctx.clone())
        .context("Failed to set up the disk")?;
    if interrupt.arm(disk.shutdown_handle()) {
        std::process::exit(INTERRUPTED_EXIT_CODE);
    }

    let result = create_image(&mut disk, opts, &ctx);

    println!("cleaning up...");
    if let Some(report) = disk.cleanup() {
        if !report.is_clean() {
            ctx.output.warn(&format!(
                "{} resource(s) could not be released; see the log for details",
                report.cleanup.failed.len() + report.image_failures
            ));
        }
    }

    result
}

fn create_image(disk: &mut Disk, opts: &CreateOptions, ctx: &DiskContext) -> Result<()> {
    let timer = Timer::start("snapshot");
    let device = if opts.snapshot {
        disk.snapshot()?
    } else {
        ctx.output
            .warn("Not working on a snapshot: any change is made to the medium itself.");
        disk.file()?
    };
    timer.finish();

    let image = disk.get_image(&device)?;

    let timer = Timer::start("extract");
    let extracted = extract::export_image(
        ctx.host.as_ref(),
        image.device(),
        &opts.outfile,
        ctx.output.as_ref(),
    )
    .with_context(|| format!("Failed to dump {}", image.device().display()))?;
    timer.finish();

    disk.destroy_image(image)?;

    println!("{}  {}", extracted.sha256, opts.outfile.display());
    Ok(())
}

/// Interrupt state shared with the signal handler.
///
/// The handler is installed before the disk exists, so an interrupt may
/// arrive while nothing can be torn down yet. It is remembered and acted
/// on as soon as the disk's handle is armed.
#[derive(Default)]
struct Interrupt {
    slot: Mutex<(Option<ShutdownHandle>, bool)>,
}

impl Interrupt {
    /// Record an interrupt. Returns true if this call tore the disk down.
    fn interrupt(&self) -> bool {
        let handle = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.1 = true;
            slot.0.clone()
        };
        handle.is_some_and(|h| h.shutdown().is_some())
    }

    /// Hand over the disk's shutdown handle. Returns true if an earlier
    /// interrupt was pending and the disk has now been torn down.
    fn arm(&self, handle: ShutdownHandle) -> bool {
        let pending = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.0 = Some(handle.clone());
            slot.1
        };
        pending && handle.shutdown().is_some()
    }
}

/// Tear the disk down on SIGINT/SIGTERM and exit.
///
/// If teardown is already running on the main thread, the handler leaves
/// it to finish there.
fn install_signal_handler(interrupt: Arc<Interrupt>) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::warn!("interrupted, releasing snapshot resources");
        if interrupt.interrupt() {
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    })
    .context("Failed to install signal handler")
}

fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        bail!("You must run snapdisk as root");
    }
    Ok(())
}

fn check_outfile(outfile: &Path, medium: &Path, force: bool) -> Result<()> {
    if outfile == medium {
        bail!("Output file {} is the medium itself", outfile.display());
    }
    if outfile.exists() && !force {
        bail!(
            "Output file {} exists (use --force to overwrite it).",
            outfile.display()
        );
    }
    Ok(())
}

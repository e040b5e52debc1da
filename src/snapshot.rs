//! Copy-on-write snapshots of a resolved medium.
//!
//! Non-raw images get a qcow2 overlay. Raw images and block devices get a
//! device-mapper `snapshot` target:
//!
//! ```text
//! medium file ─ losetup ─> /dev/loopN ─┐
//!                                      ├─ dmsetup create ─> /dev/mapper/<name>
//! cow file ──── losetup ─> /dev/loopM ─┘
//! ```
//!
//! Each step registers its undo job right after it succeeds, so a failure
//! midway leaves exactly the completed steps on the cleanup stack.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cleanup::CleanupJob;
use crate::error::Result;
use crate::host::Host;
use crate::medium::{MediumKind, ResolvedMedium};
use crate::output::Output;

/// Prefix of every device-mapper node this crate creates.
pub const DM_NAME_PREFIX: &str = "snapdisk-snapshot-";

/// Where device-mapper exposes named nodes.
pub const DM_DIR: &str = "/dev/mapper";

/// Sector size used throughout the device-mapper path.
pub const SECTOR_SIZE: u64 = 512;

/// Exception-store chunk size, in sectors (4 KiB).
pub const CHUNK_SECTORS: u32 = 8;

/// `N`: the exception store does not survive a reboot.
pub const PERSISTENCE: &str = "N";

/// A fresh device-mapper name with a random 128-bit suffix.
///
/// Stale nodes from a crashed run may still exist, so names are never
/// derived from anything predictable.
pub fn dm_name() -> String {
    format!("{}{}", DM_NAME_PREFIX, Uuid::new_v4().simple())
}

/// Device-mapper table line for a snapshot of `origin` backed by `cow`.
pub fn snapshot_table(sectors: u64, origin: &Path, cow: &Path) -> String {
    format!(
        "0 {} snapshot {} {} {} {}\n",
        sectors,
        origin.display(),
        cow.display(),
        PERSISTENCE,
        CHUNK_SECTORS
    )
}

/// Build an isolated, writable view of `medium` and return its path.
///
/// `register` must record each job on the cleanup stack; if it refuses
/// (the manager is shutting down) the snapshot is abandoned.
pub fn snapshot<F>(
    medium: &ResolvedMedium,
    staging: &Path,
    host: &dyn Host,
    out: &dyn Output,
    mut register: F,
) -> Result<PathBuf>
where
    F: FnMut(CleanupJob) -> Result<()>,
{
    if medium.kind == MediumKind::HostRoot {
        out.warn("Snapshotting ignored for host bundling mode.");
        return Ok(medium.path.clone());
    }

    let info = host.image_info(&medium.path)?;

    out.info("Snapshotting medium source ...");

    if !info.is_raw() {
        let overlay = staging.join(format!("snapshot-{}.qcow2", Uuid::new_v4().simple()));
        host.create_overlay(&medium.path, &info.format, &overlay)?;
        register(CleanupJob::RemoveFile(overlay.clone()))?;

        tracing::info!(
            base = %medium.path.display(),
            format = %info.format,
            overlay = %overlay.display(),
            "created format-level overlay"
        );
        out.success("done");
        return Ok(overlay);
    }

    let origin = match medium.kind {
        MediumKind::BlockDevice => medium.path.clone(),
        _ => attach(host, &medium.path, &mut register)?,
    };

    let sectors = host.size_in_sectors(&origin)?;

    let cow = staging.join(format!("cow-{}.img", Uuid::new_v4().simple()));
    fs::File::create_new(&cow)?;
    register(CleanupJob::RemoveFile(cow.clone()))?;
    host.extend_sparse(&cow, sectors)?;

    let cow_device = attach(host, &cow, &mut register)?;

    let name = dm_name();
    let table = staging.join(format!("{}.table", name));
    fs::write(&table, snapshot_table(sectors, &origin, &cow_device))?;
    let created = host.dm_create(&name, &table);
    if let Err(e) = fs::remove_file(&table) {
        tracing::warn!(table = %table.display(), error = %e, "cannot remove table file");
    }
    created?;
    register(CleanupJob::RemoveDm(name.clone()))?;

    let device = Path::new(DM_DIR).join(&name);
    tracing::info!(
        origin = %origin.display(),
        cow_device = %cow_device.display(),
        sectors,
        device = %device.display(),
        "created device-mapper snapshot"
    );
    out.success("done");
    Ok(device)
}

fn attach<F>(host: &dyn Host, file: &Path, register: &mut F) -> Result<PathBuf>
where
    F: FnMut(CleanupJob) -> Result<()>,
{
    let device = host.loop_attach(file)?;
    register(CleanupJob::DetachLoop(device.clone()))?;
    tracing::debug!(file = %file.display(), device = %device.display(), "attached loop device");
    Ok(device)
}

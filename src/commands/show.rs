//! Show command - displays information.

use anyhow::{Context, Result};
use std::path::PathBuf;

use snapdisk::config::Config;
use snapdisk::host::{Host, SystemHost};
use snapdisk::medium::{self, MediumKind};

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Classify a medium and read its format
    Medium(PathBuf),
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => {
            config.print();
        }
        ShowTarget::Medium(path) => {
            let kind = medium::classify(&path)?;
            println!("Medium: {}", path.display());
            match kind {
                MediumKind::HostRoot => {
                    println!("  Kind: host root (bundled with mksquashfs, not snapshotted)");
                    println!("  Output: squashfs filesystem image, not a partitioned disk");
                }
                MediumKind::ImageFile | MediumKind::BlockDevice => {
                    let label = if kind == MediumKind::ImageFile {
                        "image file"
                    } else {
                        "block device"
                    };
                    println!("  Kind: {}", label);
                    let info = SystemHost::new(config.retry)
                        .image_info(&path)
                        .with_context(|| format!("Failed to inspect {}", path.display()))?;
                    println!("  Format: {}", info.format);
                    println!("  Virtual size: {} MB", info.virtual_size / 1024 / 1024);
                    if let Some(backing) = &info.backing_filename {
                        println!("  Backing file: {}", backing);
                    }
                    let strategy = if info.is_raw() {
                        "device-mapper snapshot"
                    } else {
                        "qcow2 overlay"
                    };
                    println!("  Snapshot strategy: {}", strategy);
                    if !info.is_raw() {
                        println!("  Output: converted to raw with qemu-img");
                    }
                }
            }
        }
    }
    Ok(())
}

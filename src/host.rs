//! The privileged command surface: loop devices, device-mapper, sparse
//! files and image-format helpers.
//!
//! [`Host`] is the seam the snapshot engine and the cleanup stack talk
//! to. [`SystemHost`] drives the real utilities; tests substitute a fake.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::process::{Cmd, RetryPolicy};

/// Structured result of an image-format query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    /// Image format as named by qemu-img (`raw`, `qcow2`, `vmdk`, ...).
    pub format: String,
    /// Guest-visible size in bytes.
    #[serde(default)]
    pub virtual_size: u64,
    /// Backing file, for overlays.
    #[serde(default)]
    pub backing_filename: Option<String>,
}

impl ImageInfo {
    pub fn is_raw(&self) -> bool {
        self.format == "raw"
    }

    /// Parse the output of `qemu-img info --output=json`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Parse {
            what: "qemu-img info output",
            detail: e.to_string(),
        })
    }
}

/// External privileged operations used to build and unwind a snapshot.
///
/// Every allocating method either succeeds completely or returns an
/// error having allocated nothing the caller must release.
pub trait Host: Send + Sync {
    /// Bind `file` to the first free loop device and return its path.
    fn loop_attach(&self, file: &Path) -> Result<PathBuf>;
    /// Release a loop device.
    fn loop_detach(&self, device: &Path) -> Result<()>;
    /// Size of a block device in 512-byte sectors.
    fn size_in_sectors(&self, device: &Path) -> Result<u64>;
    /// Grow `file` to `sectors` without allocating blocks.
    fn extend_sparse(&self, file: &Path, sectors: u64) -> Result<()>;
    /// Create device-mapper node `name` from a table file.
    fn dm_create(&self, name: &str, table: &Path) -> Result<()>;
    /// Remove device-mapper node `name`.
    fn dm_remove(&self, name: &str) -> Result<()>;
    /// Read the image format of `file`.
    fn image_info(&self, file: &Path) -> Result<ImageInfo>;
    /// Create a format-level copy-on-write overlay at `overlay` backed by `base`.
    fn create_overlay(&self, base: &Path, base_format: &str, overlay: &Path) -> Result<()>;
    /// Write the guest-visible contents of a `format` image to `dest` as raw.
    fn convert_to_raw(&self, image: &Path, format: &str, dest: &Path) -> Result<()>;
}

/// [`Host`] backed by losetup, blockdev, dd, dmsetup and qemu-img.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    retry: RetryPolicy,
}

impl SystemHost {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

impl Host for SystemHost {
    fn loop_attach(&self, file: &Path) -> Result<PathBuf> {
        let result = Cmd::new("losetup")
            .args(["-f", "--show"])
            .arg_path(file)
            .run()?;
        let device = result.stdout_trimmed();
        if device.is_empty() {
            return Err(Error::Parse {
                what: "losetup output",
                detail: "no loop device printed".into(),
            });
        }
        Ok(PathBuf::from(device))
    }

    fn loop_detach(&self, device: &Path) -> Result<()> {
        self.retry
            .run(|| Cmd::new("losetup").arg("-d").arg_path(device).run_retryable())?;
        Ok(())
    }

    fn size_in_sectors(&self, device: &Path) -> Result<u64> {
        let result = Cmd::new("blockdev").arg("--getsz").arg_path(device).run()?;
        parse_sectors(result.stdout_trimmed())
    }

    fn extend_sparse(&self, file: &Path, sectors: u64) -> Result<()> {
        let mut of = std::ffi::OsString::from("of=");
        of.push(file.as_os_str());
        Cmd::new("dd")
            .arg("if=/dev/null")
            .arg_os(&of)
            .arg("bs=512")
            .arg(format!("seek={}", sectors))
            .run()?;
        Ok(())
    }

    fn dm_create(&self, name: &str, table: &Path) -> Result<()> {
        Cmd::new("dmsetup")
            .args(["create", name])
            .arg_path(table)
            .run()?;
        Ok(())
    }

    fn dm_remove(&self, name: &str) -> Result<()> {
        self.retry
            .run(|| Cmd::new("dmsetup").args(["remove", name]).run_retryable())?;
        Ok(())
    }

    fn image_info(&self, file: &Path) -> Result<ImageInfo> {
        let result = Cmd::new("qemu-img")
            .args(["info", "--output=json"])
            .arg_path(file)
            .run()?;
        ImageInfo::from_json(&result.stdout)
    }

    fn create_overlay(&self, base: &Path, base_format: &str, overlay: &Path) -> Result<()> {
        Cmd::new("qemu-img")
            .args(["create", "-f", "qcow2", "-F", base_format, "-b"])
            .arg_path(base)
            .arg_path(overlay)
            .run()?;
        Ok(())
    }

    fn convert_to_raw(&self, image: &Path, format: &str, dest: &Path) -> Result<()> {
        Cmd::new("qemu-img")
            .args(["convert", "-f", format, "-O", "raw"])
            .arg_path(image)
            .arg_path(dest)
            .run()?;
        Ok(())
    }
}

/// Parse the sector count printed by `blockdev --getsz`.
pub fn parse_sectors(output: &str) -> Result<u64> {
    output.trim().parse().map_err(|_| Error::Parse {
        what: "blockdev --getsz output",
        detail: output.trim().to_string(),
    })
}

//! Dumping a snapshot device into an image file.
//!
//! The output is always the guest-visible disk in raw form: raw devices
//! are copied byte for byte, anything else (a qcow2 overlay) is converted
//! by `qemu-img` first.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::host::Host;
use crate::output::Output;

/// Copy unit (4 MiB).
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Result of an extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the written data.
    pub sha256: String,
}

const MB: u64 = 1024 * 1024;

/// Size of a file or block device in bytes.
pub fn device_size(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    Ok(file.seek(SeekFrom::End(0))?)
}

/// Write the guest-visible contents of `device` to `outfile` as a raw
/// disk image, truncating it.
pub fn export_image(
    host: &dyn Host,
    device: &Path,
    outfile: &Path,
    out: &dyn Output,
) -> Result<Extracted> {
    let info = host.image_info(device)?;
    if info.is_raw() {
        return extract_image(device, outfile, out);
    }

    out.info(&format!(
        "Converting {} image ({} MB) to raw ...",
        info.format,
        info.virtual_size.div_ceil(MB)
    ));
    host.convert_to_raw(device, &info.format, outfile)?;

    let size = device_size(outfile)?;
    let mut written = File::open(outfile)?;
    let (bytes, sha256) = copy_hashed(&mut written, None, size)?;
    report_done(outfile, &sha256, out);
    Ok(Extracted { bytes, sha256 })
}

/// Copy the whole of `device` into `outfile`, truncating it.
pub fn extract_image(device: &Path, outfile: &Path, out: &dyn Output) -> Result<Extracted> {
    let size = device_size(device)?;
    let mut source = File::open(device)?;
    let mut dest = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(outfile)?;

    out.info(&format!("Dumping image file ({} MB) ...", size.div_ceil(MB)));

    let (bytes, sha256) = copy_hashed(&mut source, Some(&mut dest), size)?;
    dest.sync_all()?;

    report_done(outfile, &sha256, out);
    Ok(Extracted { bytes, sha256 })
}

/// Read up to `size` bytes in [`BLOCK_SIZE`] chunks, hashing them and
/// writing them to `dest` if given.
fn copy_hashed(
    source: &mut File,
    mut dest: Option<&mut File>,
    size: u64,
) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut copied = 0u64;
    let mut last_decile = 0;

    while copied < size {
        let want = usize::try_from(size - copied).map_or(BLOCK_SIZE, |left| left.min(BLOCK_SIZE));
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        if let Some(dest) = dest.as_deref_mut() {
            dest.write_all(&buf[..n])?;
        }
        hasher.update(&buf[..n]);
        copied += n as u64;

        let decile = copied * 10 / size;
        if decile > last_decile {
            last_decile = decile;
            tracing::info!(percent = decile * 10, "dumping image");
        }
    }

    Ok((copied, format!("{:x}", hasher.finalize())))
}

fn report_done(outfile: &Path, sha256: &str, out: &dyn Output) {
    out.success(&format!(
        "Image file {} was successfully created (sha256 {})",
        outfile.display(),
        sha256
    ));
}

//! Source medium classification.
//!
//! A medium is an image file, a block device, or the running host's own
//! root filesystem. The latter is flattened into an image file first.

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cleanup::CleanupJob;
use crate::error::{Error, Result};
use crate::output::Output;
use crate::process::Cmd;

/// What a source path turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumKind {
    /// `/` itself: the live host filesystem.
    HostRoot,
    /// A regular file, assumed to hold a disk image.
    ImageFile,
    /// A block device.
    BlockDevice,
}

impl MediumKind {
    fn describe(self) -> &'static str {
        match self {
            MediumKind::HostRoot => "looks like a directory",
            MediumKind::ImageFile => "looks like an image file",
            MediumKind::BlockDevice => "looks like a block device",
        }
    }
}

/// A source medium resolved to a concrete file or device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedium {
    pub kind: MediumKind,
    /// The file to work on: the source itself, or the bundled image.
    pub path: PathBuf,
}

/// Flattens the live host filesystem into a single image file.
pub trait Bundler: Send + Sync {
    /// Write an image of `/` to `image`, leaving out `exclude`.
    fn create_image(&self, image: &Path, exclude: &[PathBuf]) -> Result<()>;
}

/// Pseudo and volatile filesystems never bundled.
pub const BUNDLE_EXCLUDES: &[&str] = &["/proc", "/sys", "/dev", "/run", "/tmp", "/var/tmp"];

/// [`Bundler`] producing a squashfs image with mksquashfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SquashfsBundler;

impl Bundler for SquashfsBundler {
    fn create_image(&self, image: &Path, exclude: &[PathBuf]) -> Result<()> {
        let mut cmd = Cmd::new("mksquashfs")
            .arg("/")
            .arg_path(image)
            .args(["-comp", "gzip"])
            .arg("-noappend")
            .arg("-no-progress")
            .arg("-e");

        // mksquashfs resolves excludes relative to the source root
        for path in BUNDLE_EXCLUDES.iter().map(Path::new).chain(exclude.iter().map(PathBuf::as_path)) {
            let relative = path.strip_prefix("/").unwrap_or(path);
            cmd = cmd.arg_path(relative);
        }

        cmd.run().map_err(|e| Error::Bundle(e.to_string()))?;
        Ok(())
    }
}

/// Stat `source` and decide what kind of medium it is.
///
/// Only `/` is accepted as a directory. Symlinks are followed; a dangling
/// link or a link loop is an invalid medium.
pub fn classify(source: &Path) -> Result<MediumKind> {
    let metadata = fs::metadata(source).map_err(|e| Error::InvalidMedium {
        path: source.to_path_buf(),
        reason: stat_failure(&e),
    })?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        if is_host_root(source) {
            return Ok(MediumKind::HostRoot);
        }
        return Err(Error::UnsupportedMedium {
            path: source.to_path_buf(),
            reason: "only the host root `/' is supported as a directory medium".into(),
        });
    }
    if file_type.is_file() {
        return Ok(MediumKind::ImageFile);
    }
    if file_type.is_block_device() {
        return Ok(MediumKind::BlockDevice);
    }

    Err(Error::InvalidMedium {
        path: source.to_path_buf(),
        reason: "only block devices, regular files and directories are supported".into(),
    })
}

/// Resolve `source` to a file path, bundling the host root if needed.
///
/// `register` receives the cleanup job for any file created here. For the
/// bundle it is registered before bundling starts, since a failed bundler
/// can leave a partial image behind.
pub fn resolve<F>(
    source: &Path,
    staging: &Path,
    bundler: &dyn Bundler,
    out: &dyn Output,
    mut register: F,
) -> Result<ResolvedMedium>
where
    F: FnMut(CleanupJob) -> Result<()>,
{
    out.info(&format!("Examining source medium `{}' ...", source.display()));
    let kind = classify(source)?;
    out.success(kind.describe());

    let path = match kind {
        MediumKind::HostRoot => {
            let image = staging.join(format!("{}.squashfs", Uuid::new_v4().simple()));
            register(CleanupJob::RemoveFileIfExists(image.clone()))?;

            out.info("Bundling the host filesystem ...");
            bundler.create_image(&image, &[staging.to_path_buf()])?;
            out.success(&format!("bundled into {}", image.display()));
            image
        }
        MediumKind::ImageFile | MediumKind::BlockDevice => source.to_path_buf(),
    };

    Ok(ResolvedMedium { kind, path })
}

fn is_host_root(path: &Path) -> bool {
    fs::canonicalize(path)
        .map(|p| p == Path::new("/"))
        .unwrap_or(false)
}

fn stat_failure(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::NotFound => "no such file or device (dangling symlink?)".into(),
        _ if e.raw_os_error() == Some(libc::ELOOP) => "too many levels of symbolic links".into(),
        _ => e.to_string(),
    }
}

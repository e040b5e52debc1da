//! Choosing where the (rather big) temporary files go.

use std::ffi::CString;
use std::fs::DirBuilder;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};

/// Standard locations checked when nothing was configured. Order matters:
/// on equal free space the earlier entry wins.
pub const CANDIDATES: &[&str] = &["/var/tmp", "/tmp"];

/// Prefix of the per-manager staging directory.
pub const STAGING_PREFIX: &str = ".snapdisk.";

/// Result of probing a candidate with `statvfs(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Mounted read-only.
    pub read_only: bool,
    /// Bytes available to unprivileged users (`f_bavail * f_frsize`).
    pub available: u64,
}

/// Pick the parent directory for the staging area.
///
/// An explicit choice is returned unchanged, then `TMPDIR`, and only
/// then the writable candidate with the most free space.
pub fn select_staging_parent(explicit: Option<&Path>, config: &Config) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        tracing::debug!(dir = %dir.display(), "using user-specified tmp directory");
        return Ok(dir.to_path_buf());
    }

    if let Some(dir) = &config.tmpdir {
        tracing::debug!(dir = %dir.display(), "using TMPDIR as tmp directory");
        return Ok(dir.clone());
    }

    let candidates: Vec<PathBuf> = CANDIDATES.iter().map(PathBuf::from).collect();
    let chosen = pick_candidate(&candidates, statvfs)?;
    tracing::debug!(dir = %chosen.display(), "picked tmp directory with most free space");
    Ok(chosen)
}

/// Choose the writable candidate with the most available space.
///
/// Candidates `stat` cannot read are skipped.
pub fn pick_candidate<F>(candidates: &[PathBuf], stat: F) -> Result<PathBuf>
where
    F: Fn(&Path) -> Option<SpaceInfo>,
{
    let mut best: Option<(&PathBuf, u64)> = None;

    for candidate in candidates {
        let Some(info) = stat(candidate) else {
            tracing::debug!(dir = %candidate.display(), "cannot stat candidate, skipping");
            continue;
        };
        if info.read_only {
            continue;
        }
        match best {
            Some((_, avail)) if avail >= info.available => {}
            _ => best = Some((candidate, info.available)),
        }
    }

    best.map(|(p, _)| p.clone()).ok_or_else(|| Error::NoCandidate {
        candidates: candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Create a fresh, private staging directory under `parent`.
pub fn create_staging_area(parent: &Path) -> Result<PathBuf> {
    let dir = parent.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple()));
    DirBuilder::new().mode(0o700).create(&dir)?;
    Ok(dir)
}

/// Measure a directory with `statvfs(2)`.
pub fn statvfs(path: &Path) -> Option<SpaceInfo> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(SpaceInfo {
        read_only: stat.f_flag & libc::ST_RDONLY != 0,
        available: (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn fake(table: &[(&str, bool, u64)]) -> HashMap<PathBuf, SpaceInfo> {
        table
            .iter()
            .map(|(p, ro, avail)| {
                (
                    PathBuf::from(p),
                    SpaceInfo {
                        read_only: *ro,
                        available: *avail,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_explicit_dir_wins() {
        let config = Config {
            tmpdir: Some(PathBuf::from("/from/env")),
            ..Config::default()
        };
        let dir = select_staging_parent(Some(Path::new("/explicit")), &config).unwrap();
        assert_eq!(dir, PathBuf::from("/explicit"));
    }

    #[test]
    fn test_env_override_before_probing() {
        let config = Config {
            tmpdir: Some(PathBuf::from("/does/not/exist")),
            ..Config::default()
        };
        // Not validated: existence is the caller's concern.
        let dir = select_staging_parent(None, &config).unwrap();
        assert_eq!(dir, PathBuf::from("/does/not/exist"));
    }

    #[test]
    fn test_most_free_space_wins() {
        let table = fake(&[("/var/tmp", false, 10), ("/tmp", false, 20)]);
        let dir = pick_candidate(&paths(&["/var/tmp", "/tmp"]), |p| table.get(p).copied()).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_tie_prefers_earlier_candidate() {
        let table = fake(&[("/var/tmp", false, 20), ("/tmp", false, 20)]);
        let dir = pick_candidate(&paths(&["/var/tmp", "/tmp"]), |p| table.get(p).copied()).unwrap();
        assert_eq!(dir, PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_read_only_skipped() {
        let table = fake(&[("/var/tmp", true, 1000), ("/tmp", false, 1)]);
        let dir = pick_candidate(&paths(&["/var/tmp", "/tmp"]), |p| table.get(p).copied()).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_no_writable_candidate() {
        let table = fake(&[("/var/tmp", true, 1000)]);
        let err = pick_candidate(&paths(&["/var/tmp", "/tmp"]), |p| table.get(p).copied())
            .unwrap_err();
        match err {
            Error::NoCandidate { candidates } => assert_eq!(candidates, "/var/tmp, /tmp"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_statvfs_on_real_dir() {
        let dir = tempfile::tempdir().unwrap();
        let info = statvfs(dir.path()).expect("statvfs should succeed");
        assert!(!info.read_only);
        assert!(statvfs(Path::new("/nonexistent_path_12345")).is_none());
    }

    #[test]
    fn test_staging_area_is_private_and_unique() {
        use std::os::unix::fs::PermissionsExt;

        let parent = tempfile::tempdir().unwrap();
        let a = create_staging_area(parent.path()).unwrap();
        let b = create_staging_area(parent.path()).unwrap();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(STAGING_PREFIX));
        let mode = std::fs::metadata(&a).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}

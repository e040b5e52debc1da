//! Host tool availability checks.

use std::path::Path;

use super::types::CheckResult;

/// Helpers every snapshot needs, with the package that ships them.
pub const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("losetup", "util-linux", "Required to attach images to loop devices"),
    ("blockdev", "util-linux", "Required to size block devices"),
    ("dmsetup", "device-mapper", "Required to create snapshot devices"),
    ("dd", "coreutils", "Required to allocate sparse cow files"),
    ("qemu-img", "qemu-img", "Required to inspect image formats and create overlays"),
];

/// Helpers only some modes need.
pub const OPTIONAL_TOOLS: &[(&str, &str, &str)] = &[(
    "mksquashfs",
    "squashfs-tools",
    "Required only when the host root `/' is the medium",
)];

/// Kernel interfaces behind the loop and device-mapper helpers.
const CONTROL_NODES: &[(&str, &str)] = &[
    ("/dev/loop-control", "Load the `loop' kernel module"),
    ("/dev/mapper/control", "Load the `dm_mod' and `dm_snapshot' kernel modules"),
];

/// Check host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    let mut results = Vec::new();

    for (tool, package, purpose) in REQUIRED_TOOLS {
        results.push(check_tool_exists(tool, package, purpose, true));
    }
    for (tool, package, purpose) in OPTIONAL_TOOLS {
        results.push(check_tool_exists(tool, package, purpose, false));
    }

    results
}

/// Check the loop and device-mapper control nodes exist.
pub fn check_control_nodes() -> Vec<CheckResult> {
    CONTROL_NODES
        .iter()
        .map(|(node, hint)| {
            if Path::new(node).exists() {
                CheckResult::pass(node)
            } else {
                CheckResult::fail(node, &format!("Not found. {}", hint))
            }
        })
        .collect()
}

/// Check snapdisk runs with the privileges the helpers need.
pub fn check_privileges() -> CheckResult {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        CheckResult::pass("root privileges")
    } else {
        CheckResult::fail("root privileges", "snapdisk must run as root")
    }
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        Err(_) => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;

    #[test]
    fn test_present_tool_passes() {
        let result = check_tool_exists("sh", "bash", "", true);
        assert_eq!(result.status, CheckStatus::Pass);
        assert!(result.details.is_some());
    }

    #[test]
    fn test_missing_required_tool_fails() {
        let result = check_tool_exists("nonexistent_program_12345", "nothing", "", true);
        assert_eq!(result.status, CheckStatus::Fail);
    }

    #[test]
    fn test_missing_optional_tool_warns() {
        let result = check_tool_exists("nonexistent_program_12345", "nothing", "", false);
        assert_eq!(result.status, CheckStatus::Warn);
    }

    #[test]
    fn test_every_tool_is_checked() {
        let results = check_host_tools();
        assert_eq!(results.len(), REQUIRED_TOOLS.len() + OPTIONAL_TOOLS.len());
    }
}

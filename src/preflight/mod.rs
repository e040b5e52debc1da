//! Preflight checks for snapshotting.
//!
//! Validates host tools, kernel interfaces and privileges before any
//! loop device or device-mapper node is allocated.
//! Run with `snapdisk preflight` to check everything is ready.

mod host_tools;
mod types;

use anyhow::{bail, Result};

use types::PreflightReport;

/// Run all preflight checks.
pub fn run_preflight() -> PreflightReport {
    let mut checks = Vec::new();

    tracing::debug!("checking host tools");
    checks.extend(host_tools::check_host_tools());

    tracing::debug!("checking kernel interfaces");
    checks.extend(host_tools::check_control_nodes());

    checks.push(host_tools::check_privileges());

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail() -> Result<()> {
    let report = run_preflight();
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before snapshotting.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

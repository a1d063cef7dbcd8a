//! Preflight checks for build validation.
//!
//! Validates that the host system has required tools before building.
//! This prevents cryptic errors during the build process, and guarantees
//! that a missing bootstrap tool is caught before the jail directory is
//! ever created.

use anyhow::Result;

use crate::error::BuildError;

/// Required host tools for building the live ISO.
///
/// Each tuple is (command_name, package_name). Guest-side tools are not
/// listed here; they are installed by the customizer inside the jail and
/// checked at their point of use.
pub const HOST_TOOLS: &[(&str, &str)] = &[
    ("debootstrap", "debootstrap"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("sha512sum", "coreutils"),
    ("chroot", "coreutils"),
];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Returns [`BuildError::MissingDependency`] for the first tool that
/// cannot be found, naming the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    for (tool, package) in tools {
        if !command_exists(tool) {
            return Err(BuildError::MissingDependency {
                tool: (*tool).to_string(),
                package: (*package).to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Check that all standard host tools are available.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(HOST_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_reports_missing_tool() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();

        match err.downcast_ref::<BuildError>() {
            Some(BuildError::MissingDependency { tool, package }) => {
                assert_eq!(tool, "nonexistent_command_xyz");
                assert_eq!(package, "fake-package");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }
}

//! apt operations used by the guest stage.
//!
//! Everything runs with forced non-interactive options; the jail has no
//! terminal a maintainer script could ask questions on.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::process::{Cmd, ToolRunner};

/// Options appended to every apt-get invocation.
pub const APT_OPTIONS: &[&str] = &["-y", "-o", "Dpkg::Options::=--force-confold"];

/// Root-relative path of the deny-pin preferences file.
pub const DENY_PIN_FILE: &str = "etc/apt/preferences.d/99-deny";

/// Root-relative path of the browser repository pin.
pub const BROWSER_PIN_FILE: &str = "etc/apt/preferences.d/mozilla-firefox";

/// Refresh the package index.
pub fn update(runner: &dyn ToolRunner) -> Result<()> {
    Cmd::new("apt-get")
        .arg("update")
        .interactive()
        .error_msg("apt-get update failed")
        .run_with(runner)?;
    Ok(())
}

/// Install packages.
pub fn install(runner: &dyn ToolRunner, packages: &[&str]) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }
    Cmd::new("apt-get")
        .arg("install")
        .args(APT_OPTIONS)
        .args(packages.iter().copied())
        .interactive()
        .error_msg("apt-get install failed")
        .run_with(runner)?;
    Ok(())
}

/// Upgrade everything currently installed.
pub fn dist_upgrade(runner: &dyn ToolRunner) -> Result<()> {
    Cmd::new("apt-get")
        .arg("dist-upgrade")
        .args(APT_OPTIONS)
        .interactive()
        .error_msg("apt-get dist-upgrade failed")
        .run_with(runner)?;
    Ok(())
}

/// Remove packages that are no longer needed, purging their config.
pub fn autoremove_purge(runner: &dyn ToolRunner) -> Result<()> {
    Cmd::new("apt-get")
        .args(["autoremove", "-y", "--purge"])
        .interactive()
        .error_msg("apt-get autoremove failed")
        .run_with(runner)?;
    Ok(())
}

/// Purge specific packages.
pub fn purge(runner: &dyn ToolRunner, packages: &[&str]) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }
    Cmd::new("apt-get")
        .arg("purge")
        .args(packages.iter().copied())
        .args(APT_OPTIONS)
        .interactive()
        .error_msg("apt-get purge failed")
        .run_with(runner)?;
    Ok(())
}

/// Names of every installed package.
pub fn installed_packages(runner: &dyn ToolRunner) -> Result<Vec<String>> {
    let outcome = Cmd::new("dpkg-query")
        .args(["-W", "-f=${binary:Package}\\n"])
        .error_msg("dpkg-query failed")
        .run_with(runner)?;
    Ok(outcome
        .stdout_text()
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Pin the deny globs to a negative priority so none of them can be
/// pulled in as a transitive dependency while the main set installs.
pub fn write_deny_pins(root: &Path, globs: &[String]) -> Result<()> {
    if globs.is_empty() {
        return Ok(());
    }
    let path = root.join(DENY_PIN_FILE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = format!(
        "Package: {}\nPin: release *\nPin-Priority: -1\n",
        globs.join(" ")
    );
    fs::write(&path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// Lift the deny pins. The pin is a one-shot gate for the install window,
/// not a permanent policy; a missing file is fine.
pub fn remove_deny_pins(root: &Path) -> Result<()> {
    match fs::remove_file(root.join(DENY_PIN_FILE)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context("removing deny-pin file"),
    }
}

/// Add the Mozilla PPA and pin the firefox family to it, so firefox comes
/// from the PPA as a real deb instead of the snap transition package.
pub fn add_browser_repository(root: &Path, runner: &dyn ToolRunner) -> Result<()> {
    Cmd::new("add-apt-repository")
        .args(["ppa:mozillateam/ppa", "-y"])
        .interactive()
        .error_msg("add-apt-repository failed")
        .run_with(runner)?;

    let path = root.join(BROWSER_PIN_FILE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(
        &path,
        "Package: firefox*\nPin: release o=LP-PPA-mozillateam\nPin-Priority: 501\n",
    )
    .with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_deny_pins_round_trip() {
        let temp = TempDir::new().unwrap();
        let globs = vec!["libreoffice*".to_string(), "snapd".to_string()];

        write_deny_pins(temp.path(), &globs).unwrap();
        let content = fs::read_to_string(temp.path().join(DENY_PIN_FILE)).unwrap();
        assert!(content.contains("Package: libreoffice* snapd"));
        assert!(content.contains("Pin-Priority: -1"));

        remove_deny_pins(temp.path()).unwrap();
        assert!(!temp.path().join(DENY_PIN_FILE).exists());
    }

    #[test]
    fn test_remove_deny_pins_tolerates_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(remove_deny_pins(temp.path()).is_ok());
    }

    #[test]
    fn test_empty_deny_set_writes_nothing() {
        let temp = TempDir::new().unwrap();
        write_deny_pins(temp.path(), &[]).unwrap();
        assert!(!temp.path().join(DENY_PIN_FILE).exists());
    }
}

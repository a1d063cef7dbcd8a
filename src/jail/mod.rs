//! Isolated root environment provisioning and teardown.
//!
//! `provision` bootstraps a minimal base system into a fresh jail
//! directory, stages branding assets, and acquires the mounts and device
//! nodes the jail needs through the caller's [`ResourceGuard`].
//! `enter_and_run` copies this binary into the jail and re-invokes it
//! under chroot(8) as the customizer entrypoint. `teardown` releases
//! everything and deletes the jail only when the release was fully clean.

pub mod devices;

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::BuilderConfig;
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::guard::ResourceGuard;
use crate::pipeline::run_step;
use crate::process::{Cmd, ToolRunner};

/// Jail-relative path of the customizer entrypoint.
pub const GUEST_ENTRYPOINT: &str = "usr/local/sbin/live-builder";
/// Jail-relative path of the serialized guest configuration.
pub const GUEST_CONFIG: &str = "etc/live-builder.json";

/// Handle to a provisioned jail.
#[derive(Debug)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Create and populate the jail.
///
/// Fails with [`BuildError::EnvironmentAlreadyExists`] before any mutating
/// action if the jail path is occupied; builds never merge into an
/// existing tree. `created` is set as soon as the directory exists so the
/// teardown path knows whether this run owns it.
pub fn provision(
    ctx: &BuildContext,
    config: &BuilderConfig,
    guard: &mut ResourceGuard<'_>,
    runner: &dyn ToolRunner,
    created: &mut bool,
) -> Result<Jail> {
    if ctx.jail_dir.exists() {
        return Err(BuildError::EnvironmentAlreadyExists(ctx.jail_dir.clone()).into());
    }

    run_step("bootstrap", || bootstrap(ctx, runner, created))?;
    run_step("apt-sources", || write_apt_sources(ctx))?;
    run_step("branding", || stage_branding(ctx, config))?;
    run_step("environment-resources", || acquire_environment(ctx, guard))?;

    Ok(Jail {
        root: ctx.jail_dir.clone(),
    })
}

/// Run the customizer inside the jail.
///
/// The entrypoint copy and its config file are removed afterward whether
/// or not the guest stage succeeded.
pub fn enter_and_run(
    ctx: &BuildContext,
    config: &BuilderConfig,
    jail: &Jail,
    runner: &dyn ToolRunner,
) -> Result<()> {
    let entrypoint = jail.root().join(GUEST_ENTRYPOINT);
    let config_path = jail.root().join(GUEST_CONFIG);

    stage_guest_files(config, &entrypoint, &config_path)?;
    let result = run_guest(ctx, jail, runner);
    remove_guest_files(&entrypoint, &config_path);
    result
}

/// Outcome of the teardown path.
#[derive(Debug)]
pub struct TeardownReport {
    pub failures: Vec<BuildError>,
    pub jail_removed: bool,
}

/// Release every acquired resource, then delete the jail only if this run
/// created it and nothing is left mounted. An unclean release leaves the
/// jail in place for manual inspection; a recursive delete under a live
/// mount could reach host files.
pub fn teardown(
    ctx: &BuildContext,
    guard: &mut ResourceGuard<'_>,
    jail_created: bool,
) -> TeardownReport {
    let failures = guard.release_all();
    for failure in &failures {
        log::warn!("{failure}");
    }

    let mut jail_removed = false;
    if jail_created && ctx.jail_dir.exists() {
        if guard.is_clean() {
            match fs::remove_dir_all(&ctx.jail_dir) {
                Ok(()) => {
                    jail_removed = true;
                    println!("Removed jail {}", ctx.jail_dir.display());
                }
                Err(err) => log::warn!(
                    "could not remove jail {}: {err}",
                    ctx.jail_dir.display()
                ),
            }
        } else {
            println!(
                "Leaving jail {} in place for inspection; unreleased resources:",
                ctx.jail_dir.display()
            );
            for resource in guard.unreleased() {
                println!("  {} at {}", resource.kind, resource.target.display());
            }
        }
    }

    TeardownReport {
        failures,
        jail_removed,
    }
}

fn bootstrap(ctx: &BuildContext, runner: &dyn ToolRunner, created: &mut bool) -> Result<()> {
    if let Some(parent) = ctx.jail_dir.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating workspace directory '{}'", parent.display()))?;
    }
    fs::create_dir(&ctx.jail_dir)
        .with_context(|| format!("creating jail directory '{}'", ctx.jail_dir.display()))?;
    *created = true;

    fs::create_dir_all(&ctx.apt_cache_dir)?;
    fs::create_dir_all(&ctx.apt_lists_dir)?;

    println!("Bootstrapping {} into {}...", ctx.release, ctx.jail_dir.display());
    Cmd::new("debootstrap")
        .arg("--arch=amd64")
        .arg("--variant=minbase")
        .arg(format!("--cache-dir={}", ctx.apt_cache_dir.display()))
        .arg(&ctx.release)
        .arg_path(&ctx.jail_dir)
        .arg(&ctx.mirror)
        .interactive()
        .error_msg("debootstrap failed")
        .run_with(runner)?;
    Ok(())
}

fn write_apt_sources(ctx: &BuildContext) -> Result<()> {
    let sources = format!(
        "deb {mirror} {release} main restricted universe multiverse\n\
         deb-src {mirror} {release} main restricted universe multiverse\n\
         \n\
         deb {mirror} {release}-security main restricted universe multiverse\n\
         deb-src {mirror} {release}-security main restricted universe multiverse\n\
         \n\
         deb {mirror} {release}-updates main restricted universe multiverse\n\
         deb-src {mirror} {release}-updates main restricted universe multiverse\n",
        mirror = ctx.mirror,
        release = ctx.release,
    );

    let apt_dir = ctx.jail_dir.join("etc/apt");
    fs::create_dir_all(&apt_dir)?;
    fs::write(apt_dir.join("sources.list"), sources)
        .with_context(|| "writing apt sources into the jail")?;
    Ok(())
}

/// Copy branding assets into the jail and normalize their ownership.
fn stage_branding(ctx: &BuildContext, config: &BuilderConfig) -> Result<()> {
    let branding = ctx.workspace.join("branding");
    let theme_src = branding.join("plymouth");
    if !theme_src.is_dir() {
        anyhow::bail!(
            "branding assets not found at '{}'; a plymouth theme directory is required",
            theme_src.display()
        );
    }

    let theme_dest = ctx
        .jail_dir
        .join("usr/share/plymouth/themes")
        .join(&config.id);
    copy_tree(&theme_src, &theme_dest)?;
    chown_tree_root(&theme_dest)?;

    let icons_src = branding.join("icons");
    if icons_src.is_dir() {
        let icons_dest = ctx.jail_dir.join("usr/share/icons");
        copy_tree(&icons_src, &icons_dest)?;
        chown_tree_root(&icons_dest)?;
    }

    Ok(())
}

fn acquire_environment(ctx: &BuildContext, guard: &mut ResourceGuard<'_>) -> Result<()> {
    // Private /dev so nothing in the jail can touch host devices.
    let dev_dir = ctx.jail_dir.join("dev");
    fs::create_dir_all(&dev_dir)?;
    guard.mount_tmpfs(&dev_dir)?;
    for node in devices::DEVICE_NODES {
        guard.make_device_node(&dev_dir, node)?;
    }
    guard.make_symlink("/proc/self/fd", &dev_dir.join("fd"))?;

    let run_dir = ctx.jail_dir.join("run");
    fs::create_dir_all(&run_dir)?;
    guard.mount_tmpfs(&run_dir)?;

    // Shared apt cache and index, so repeated builds skip re-downloading.
    let archives = ctx.jail_dir.join("var/cache/apt/archives");
    let lists = ctx.jail_dir.join("var/lib/apt/lists");
    fs::create_dir_all(&archives)?;
    fs::create_dir_all(&lists)?;
    guard.bind_mount(&ctx.apt_cache_dir, &archives)?;
    guard.bind_mount(&ctx.apt_lists_dir, &lists)?;

    Ok(())
}

fn stage_guest_files(config: &BuilderConfig, entrypoint: &Path, config_path: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("resolving builder executable path")?;

    if let Some(parent) = entrypoint.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&exe, entrypoint)
        .with_context(|| format!("copying entrypoint into jail at '{}'", entrypoint.display()))?;
    fs::set_permissions(entrypoint, fs::Permissions::from_mode(0o755))?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(config)?;
    fs::write(config_path, json)
        .with_context(|| format!("writing guest config '{}'", config_path.display()))?;
    Ok(())
}

fn run_guest(ctx: &BuildContext, jail: &Jail, runner: &dyn ToolRunner) -> Result<()> {
    println!("Entering jail for {}...", ctx.build_id);
    let outcome = Cmd::new("chroot")
        .arg_path(jail.root())
        .arg(format!("/{GUEST_ENTRYPOINT}"))
        .arg("guest-stage")
        .env("HOME", "/root")
        .env("LC_ALL", "C")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .interactive()
        .allow_fail()
        .run_with(runner)?;

    if !outcome.success() {
        return Err(BuildError::StageExecutionFailure {
            stage: "guest-stage".to_string(),
            exit_code: Some(outcome.code),
        }
        .into());
    }
    Ok(())
}

fn remove_guest_files(entrypoint: &Path, config_path: &Path) {
    let _ = fs::remove_file(entrypoint);
    let _ = fs::remove_file(config_path);
}

/// Recursively copy a directory tree, preserving layout but not metadata.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Hand the tree to root:root. Branding assets are copied from a checkout
/// that may belong to any user.
fn chown_tree_root(path: &Path) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        log::debug!("skipping ownership normalization of {}: not root", path.display());
        return Ok(());
    }
    for entry in WalkDir::new(path) {
        let entry = entry?;
        std::os::unix::fs::chown(entry.path(), Some(0), Some(0))
            .with_context(|| format!("chown root:root '{}'", entry.path().display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_preserves_layout() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("top.txt"), "top").unwrap();
        fs::write(src.join("nested/inner.txt"), "inner").unwrap();

        let dest = temp.path().join("dest");
        copy_tree(&src, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(dest.join("nested/inner.txt")).unwrap(),
            "inner"
        );
    }

    #[test]
    fn test_remove_guest_files_tolerates_missing() {
        let temp = TempDir::new().unwrap();
        remove_guest_files(
            &temp.path().join("not-there"),
            &temp.path().join("also-not-there"),
        );
    }
}

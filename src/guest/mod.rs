//! The guest stage: customization executed inside the jail.
//!
//! Re-invoked as `live-builder guest-stage` under chroot(8), so every
//! path below is relative to the jail root. Sub-stages run strictly in
//! order and the first failure aborts the rest; the teardown at the end
//! runs no matter what, leaving the tree free of build-time residue
//! (machine id, init diversion, deny pins, shell history).

pub mod apt;
pub mod bootimage;
pub mod desktop;
pub mod ntfs_plugin;
pub mod scaffold;

use anyhow::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::config::BuilderConfig;
use crate::guard::ResourceGuard;
use crate::pipeline::run_step;
use crate::process::{Cmd, ToolRunner};

/// Run the full customization against the process root.
pub fn run(config: &BuilderConfig, runner: &dyn ToolRunner) -> Result<()> {
    run_at(Path::new("/"), config, runner)
}

/// Run the customization against an explicit root. Split out so the
/// sequence can be exercised against a scratch tree in tests.
pub fn run_at(root: &Path, config: &BuilderConfig, runner: &dyn ToolRunner) -> Result<()> {
    let mut guard = ResourceGuard::new(runner);
    let result = customize(root, config, runner, &mut guard);
    teardown(root, runner, &mut guard);
    result
}

fn customize(
    root: &Path,
    config: &BuilderConfig,
    runner: &dyn ToolRunner,
    guard: &mut ResourceGuard<'_>,
) -> Result<()> {
    run_step("mount-virtual-filesystems", || {
        mount_virtual_filesystems(root, guard)
    })?;
    run_step("configure-environment", || {
        configure_environment(root, config)
    })?;
    run_step("refresh-package-index", || {
        apt::update(runner)?;
        apt::install(runner, &["software-properties-common"])
    })?;
    run_step("deny-pins", || {
        apt::write_deny_pins(root, &config.packages.deny)
    })?;
    run_step("extra-repository", || {
        apt::add_browser_repository(root, runner)
    })?;
    run_step("install-init", || {
        apt::update(runner)?;
        apt::install(runner, &["libterm-readline-gnu-perl", "systemd-sysv", "dbus-bin"])
    })?;
    run_step("machine-id", || machine_id_and_divert(root, runner))?;
    run_step("install-packages", || install_packages(root, config, runner))?;
    run_step("ntfs-plugin", || ntfs_plugin::build(root, runner))?;
    run_step("boot-splash", || desktop::set_boot_splash(config, runner))?;
    run_step("desktop-preferences", || {
        desktop::apply_preferences(root, config, runner)
    })?;
    run_step("network-manager", || {
        desktop::configure_network_manager(root, runner)
    })?;
    run_step("initramfs", || {
        Cmd::new("update-initramfs")
            .arg("-u")
            .interactive()
            .error_msg("update-initramfs failed")
            .run_with(runner)?;
        Ok(())
    })?;
    run_step("image-scaffold", || scaffold::build(root, config, runner))?;
    run_step("boot-images", || bootimage::build(root, runner))?;
    Ok(())
}

fn mount_virtual_filesystems(root: &Path, guard: &mut ResourceGuard<'_>) -> Result<()> {
    let proc_dir = root.join("proc");
    let sys_dir = root.join("sys");
    let pts_dir = root.join("dev/pts");
    fs::create_dir_all(&proc_dir)?;
    fs::create_dir_all(&sys_dir)?;
    fs::create_dir_all(&pts_dir)?;

    guard.mount_virtual("proc", &proc_dir)?;
    guard.mount_virtual("sysfs", &sys_dir)?;
    guard.mount_virtual("devpts", &pts_dir)?;
    Ok(())
}

fn configure_environment(root: &Path, config: &BuilderConfig) -> Result<()> {
    // Process-wide exports only make sense inside the actual jail.
    if root == Path::new("/") {
        std::env::set_var("HOME", "/root");
        std::env::set_var("LC_ALL", "C");
        std::env::set_var("DEBIAN_FRONTEND", "noninteractive");
    }

    let casper = format!(
        "export USERNAME=\"{username}\"\n\
         export USERFULLNAME=\"{name} live session user\"\n\
         export HOST=\"{id}\"\n\
         export BUILD_SYSTEM=\"Ubuntu\"\n\
         export FLAVOUR=\"{name}\"\n",
        username = config.username,
        name = config.name,
        id = config.id,
    );
    fs::create_dir_all(root.join("etc"))?;
    fs::write(root.join("etc/casper.conf"), casper)?;
    Ok(())
}

/// Give the jail a fresh machine identity and neuter the legacy init
/// notifier so package hooks cannot poke a real init daemon from inside.
fn machine_id_and_divert(root: &Path, runner: &dyn ToolRunner) -> Result<()> {
    let outcome = Cmd::new("dbus-uuidgen")
        .error_msg("dbus-uuidgen failed")
        .run_with(runner)?;
    fs::write(root.join("etc/machine-id"), outcome.stdout_text())?;
    Cmd::new("ln")
        .args(["-fs", "/etc/machine-id", "/var/lib/dbus/machine-id"])
        .run_with(runner)?;

    Cmd::new("dpkg-divert")
        .args(["--local", "--rename", "--add", "/sbin/initctl"])
        .error_msg("dpkg-divert failed")
        .run_with(runner)?;
    Cmd::new("ln")
        .args(["-s", "/bin/true", "/sbin/initctl"])
        .run_with(runner)?;
    Ok(())
}

fn install_packages(root: &Path, config: &BuilderConfig, runner: &dyn ToolRunner) -> Result<()> {
    apt::dist_upgrade(runner)?;
    let packages = config.packages.install_list();
    apt::install(runner, &packages)?;
    apt::autoremove_purge(runner)?;
    // The package set is final; lift the deny pins.
    apt::remove_deny_pins(root)?;
    Ok(())
}

/// Unconditional cleanup of build-time residue, followed by unmounting
/// the virtual filesystems in reverse acquisition order.
fn teardown(root: &Path, runner: &dyn ToolRunner, guard: &mut ResourceGuard<'_>) {
    println!("Cleaning up guest environment...");

    // The image must not ship a baked-in machine identity.
    if let Err(err) = fs::write(root.join("etc/machine-id"), "") {
        log::warn!("could not blank machine-id: {err}");
    }

    let initctl = root.join("sbin/initctl");
    if initctl.exists() || initctl.is_symlink() {
        let _ = fs::remove_file(&initctl);
    }
    let _ = Cmd::new("dpkg-divert")
        .args(["--rename", "--remove", "/sbin/initctl"])
        .allow_fail()
        .run_with(runner);

    if let Err(err) = apt::remove_deny_pins(root) {
        log::warn!("could not remove deny pins: {err}");
    }

    let tmp = root.join("tmp");
    let _ = fs::remove_dir_all(&tmp);
    if fs::create_dir_all(&tmp).is_ok() {
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777));
    }

    let _ = fs::remove_file(root.join("root/.bash_history"));

    for failure in guard.release_all() {
        log::warn!("{failure}");
    }
}

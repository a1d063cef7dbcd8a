//! Builder configuration and package sets.
//!
//! Compiled-in defaults describe the stock RescueOS image; an optional
//! `live-builder.toml` in the workspace overrides them. The same structure
//! is serialized into the jail as JSON so the guest stage sees exactly the
//! configuration the host resolved.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Optional workspace configuration file.
pub const CONFIG_FILE: &str = "live-builder.toml";

/// Resolved builder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Display name, used in the build id, volume label, and boot menu.
    pub name: String,
    /// Lowercase identifier, used for theme and marker file names.
    pub id: String,
    /// Live session user name.
    pub username: String,
    /// Ubuntu release codename to bootstrap.
    pub release: String,
    /// Package mirror URL.
    pub mirror: String,
    /// Root of the shared apt cache. Defaults to the user cache directory
    /// so repeated builds from any checkout reuse downloaded packages.
    pub cache_dir: Option<PathBuf>,
    /// Packages installed into the image, by category.
    pub packages: PackageSet,
}

/// Category-ordered package selection plus the deny globs pinned to a
/// negative priority during installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSet {
    pub generic: Vec<String>,
    pub live: Vec<String>,
    pub network: Vec<String>,
    pub bootloader: Vec<String>,
    pub desktop: Vec<String>,
    pub tools: Vec<String>,
    pub filesystems: Vec<String>,
    /// Glob patterns blocked while the main set installs, so none of them
    /// sneak in as transitive dependencies. The pin is lifted before the
    /// customizer finishes, on success and failure alike.
    pub deny: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: "RescueOS".to_string(),
            id: "rescueos".to_string(),
            username: "rescue".to_string(),
            release: "plucky".to_string(),
            mirror: "http://archive.ubuntu.com/ubuntu/".to_string(),
            cache_dir: None,
            packages: PackageSet::default(),
        }
    }
}

impl Default for PackageSet {
    fn default() -> Self {
        Self {
            generic: strings(&[
                "ubuntu-standard",
                "sudo",
                // 6.14.0-28 and -29 break losetup on squashfs files living
                // on a read-only filesystem; stay on -27 until fixed.
                "linux-image-6.14.0-27-generic",
            ]),
            live: strings(&[
                "casper",
                "discover",
                "laptop-detect",
                "locales",
                "mtools",
                "binutils",
            ]),
            network: strings(&["network-manager", "net-tools", "iw"]),
            bootloader: strings(&[
                "grub-common",
                "grub-gfxpayload-lists",
                "grub-pc",
                "grub-pc-bin",
                "grub2-common",
                "grub-efi-amd64-signed",
                "shim-signed",
            ]),
            desktop: strings(&[
                "plymouth",
                "plymouth-label",
                "plymouth-theme-ubuntu-text",
                "ubuntu-gnome-desktop",
                "ubuntu-gnome-wallpapers",
            ]),
            tools: strings(&[
                "gnome-disk-utility",
                "gparted",
                "udisks2",
                "smartmontools",
                "parted",
                "gvfs-backends",
                "gvfs-fuse",
                "network-manager-gnome",
                "htop",
                "iotop",
                "ncdu",
                "lsof",
                "file",
                "lshw",
                "usbutils",
                "clonezilla",
                "testdisk",
                "sleuthkit",
                "binwalk",
                "partimage",
                "python3-hivex",
                "python3-pip",
                "firefox",
                "git",
                "unzip",
            ]),
            filesystems: strings(&[
                // Core Linux/Unix
                "btrfs-progs",
                "xfsprogs",
                "f2fs-tools",
                "reiserfsprogs",
                "jfsutils",
                "nilfs-tools",
                "zfsutils-linux",
                // Windows and cross-platform
                "ntfs-3g",
                "dosfstools",
                "exfatprogs",
                "hfsprogs",
                "hfsutils",
                "udftools",
                // Network / cluster
                "nfs-common",
                "cifs-utils",
                "sshfs",
                "glusterfs-client",
                "ceph-common",
                "davfs2",
                "fuse3",
                // Special / archival
                "squashfs-tools",
                "erofs-utils",
                "mtd-utils",
                "fuseiso",
                "archivemount",
            ]),
            deny: strings(&[
                "libreoffice*",
                "thunderbird*",
                "rhythmbox*",
                "gnome-mahjongg",
                "gnome-mines",
                "gnome-sudoku",
                "aisleriot",
                "cheese",
                "simple-scan",
                "transmission*",
                "remmina*",
                "totem*",
                "shotwell*",
                "hexchat*",
                "deja-dup*",
                "ubuntu-docs",
                "gnome-user-docs",
                "snapd",
                "plymouth-themes",
                "plymouth-theme-spinner",
            ]),
        }
    }
}

impl PackageSet {
    /// The full installation list, in category order.
    pub fn install_list(&self) -> Vec<&str> {
        self.generic
            .iter()
            .chain(&self.live)
            .chain(&self.network)
            .chain(&self.bootloader)
            .chain(&self.desktop)
            .chain(&self.tools)
            .chain(&self.filesystems)
            .map(|package| package.as_str())
            .collect()
    }
}

/// Load the workspace configuration, falling back to defaults when no
/// config file is present.
pub fn load(workspace: &Path) -> Result<BuilderConfig> {
    let path = workspace.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(BuilderConfig::default());
    }
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading config file '{}'", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file '{}'", path.display()))
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

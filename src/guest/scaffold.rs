//! On-disc image scaffold, built inside the jail at /image.
//!
//! Lays out the casper/install/isolinux directories, copies the installed
//! kernel and initrd, fetches the memtest86+ payload, and writes the GRUB
//! menu and disk identification metadata.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuilderConfig;
use crate::process::{Cmd, ToolRunner};

/// Fixed upstream location of the memtest86+ binaries.
pub const MEMTEST_URL: &str = "https://memtest.org/download/v7.00/mt86plus_7.00.binaries.zip";

/// Build the /image layout.
pub fn build(root: &Path, config: &BuilderConfig, runner: &dyn ToolRunner) -> Result<()> {
    let image = root.join("image");
    for sub in ["casper", "isolinux", "install"] {
        fs::create_dir_all(image.join(sub))?;
    }

    let kernel = find_boot_file(root, "vmlinuz-")?;
    let initrd = find_boot_file(root, "initrd.img-")?;
    fs::copy(&kernel, image.join("casper/vmlinuz"))
        .with_context(|| format!("copying kernel '{}'", kernel.display()))?;
    fs::copy(&initrd, image.join("casper/initrd"))
        .with_context(|| format!("copying initrd '{}'", initrd.display()))?;

    fetch_memtest(&image.join("install"), runner)?;

    // Empty marker file; the GRUB menu locates the boot volume by it.
    fs::write(image.join(&config.id), "")?;
    fs::write(image.join("isolinux/grub.cfg"), grub_menu(config))?;
    fs::write(image.join("README.diskdefines"), disk_defines(config))?;
    Ok(())
}

/// Pick the newest `-generic` file with the given prefix from /boot.
fn find_boot_file(root: &Path, prefix: &str) -> Result<PathBuf> {
    let boot = root.join("boot");
    let mut candidates: Vec<PathBuf> = fs::read_dir(&boot)
        .with_context(|| format!("reading '{}'", boot.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix) && name.ends_with("-generic"))
        })
        .collect();

    candidates.sort();
    match candidates.pop() {
        Some(path) => Ok(path),
        None => bail!("no {prefix}*-generic found under '{}'", boot.display()),
    }
}

/// Download the memtest86+ archive and extract the BIOS and EFI binaries.
/// No retry on failure; a flaky mirror is surfaced to the operator.
fn fetch_memtest(install_dir: &Path, runner: &dyn ToolRunner) -> Result<()> {
    println!("Fetching memtest86+ from {MEMTEST_URL}...");
    let response = reqwest::blocking::get(MEMTEST_URL)
        .with_context(|| format!("downloading '{MEMTEST_URL}'"))?;
    if !response.status().is_success() {
        bail!("memtest86+ download failed: HTTP {}", response.status());
    }
    let body = response
        .bytes()
        .context("reading memtest86+ archive body")?;

    let archive = install_dir.join("memtest86.zip");
    fs::write(&archive, &body)?;

    for (member, output) in [
        ("memtest64.bin", "memtest86+.bin"),
        ("memtest64.efi", "memtest86+.efi"),
    ] {
        let outcome = Cmd::new("unzip")
            .arg("-p")
            .arg_path(&archive)
            .arg(member)
            .error_msg(format!("unzip of '{member}' failed"))
            .run_with(runner)?;
        fs::write(install_dir.join(output), &outcome.stdout)?;
    }

    fs::remove_file(&archive)?;
    Ok(())
}

fn grub_menu(config: &BuilderConfig) -> String {
    let name = &config.name;
    let id = &config.id;
    format!(
        r#"search --set=root --file /{id}

insmod all_video

loadfont unicode

set menu_color_normal=white/black
set menu_color_highlight=black/light-gray

set default="0"
set timeout=30

menuentry "Launch {name}" {{
    set gfxpayload=keep
    linux /casper/vmlinuz boot=casper nopersistent quiet splash ---
    initrd /casper/initrd
}}

menuentry "Launch {name} to RAM" {{
    set gfxpayload=keep
    linux /casper/vmlinuz boot=casper nopersistent quiet splash toram ---
    initrd /casper/initrd
}}

menuentry "Launch {name} (Safe Graphics)" {{
    set gfxpayload=keep
    linux /casper/vmlinuz boot=casper nopersistent quiet splash nomodeset ---
    initrd /casper/initrd
}}

menuentry "Launch {name} to RAM (Safe Graphics)" {{
    set gfxpayload=keep
    linux /casper/vmlinuz boot=casper nopersistent quiet splash nomodeset toram ---
    initrd /casper/initrd
}}

grub_platform
if [ "$grub_platform" = "efi" ]; then
    menuentry "Test memory Memtest86+" {{
        linux /install/memtest86+.efi
    }}

    menuentry 'UEFI Firmware Settings' {{
        fwsetup
    }}
else
    menuentry "Test memory Memtest86+" {{
        linux16 /install/memtest86+.bin
    }}
fi

menuentry 'Boot from next volume' {{
    exit 1
}}
"#
    )
}

fn disk_defines(config: &BuilderConfig) -> String {
    format!(
        "#define DISKNAME  {name}\n\
         #define TYPE  binary\n\
         #define TYPEbinary  1\n\
         #define ARCH  amd64\n\
         #define ARCHamd64  1\n\
         #define DISKNUM  1\n\
         #define DISKNUM1  1\n\
         #define TOTALNUM  0\n\
         #define TOTALNUM0  1\n",
        name = config.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_boot_file_picks_newest_generic() {
        let temp = TempDir::new().unwrap();
        let boot = temp.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("vmlinuz-6.14.0-26-generic"), "").unwrap();
        fs::write(boot.join("vmlinuz-6.14.0-27-generic"), "").unwrap();
        fs::write(boot.join("vmlinuz-6.14.0-27-generic.efi.signed"), "").unwrap();

        let found = find_boot_file(temp.path(), "vmlinuz-").unwrap();
        assert!(found.ends_with("vmlinuz-6.14.0-27-generic"));
    }

    #[test]
    fn test_find_boot_file_errors_when_absent() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("boot")).unwrap();
        assert!(find_boot_file(temp.path(), "vmlinuz-").is_err());
    }

    #[test]
    fn test_grub_menu_offers_all_boot_variants() {
        let config = BuilderConfig::default();
        let menu = grub_menu(&config);

        assert!(menu.contains("search --set=root --file /rescueos"));
        assert!(menu.contains("menuentry \"Launch RescueOS\""));
        assert!(menu.contains("toram"));
        assert!(menu.contains("nomodeset"));
        assert!(menu.contains("fwsetup"));
        assert!(menu.contains("memtest86+.bin"));
        assert!(menu.contains("memtest86+.efi"));
    }

    #[test]
    fn test_disk_defines_names_the_distro() {
        let config = BuilderConfig::default();
        let defines = disk_defines(&config);
        assert!(defines.starts_with("#define DISKNAME  RescueOS"));
        assert!(defines.contains("#define ARCH  amd64"));
    }
}

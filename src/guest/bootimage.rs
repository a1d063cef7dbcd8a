//! Boot image construction: the FAT-formatted EFI image, the BIOS
//! El Torito image, and the content checksum manifest.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::process::{Cmd, ToolRunner};

/// FAT16 needs headroom beyond the three loaders and the menu.
const EFIBOOT_SIZE_BYTES: usize = 10 * 1024 * 1024;

const SHIM_SIGNED: &str = "usr/lib/shim/shimx64.efi.signed.previous";
const MOK_MANAGER: &str = "usr/lib/shim/mmx64.efi";
const GRUB_SIGNED: &str = "usr/lib/grub/x86_64-efi-signed/grubx64.efi.signed";
const CDBOOT_IMAGE: &str = "usr/lib/grub/i386-pc/cdboot.img";

/// Stage the signed loaders and build both boot images plus the manifest.
pub fn build(root: &Path, runner: &dyn ToolRunner) -> Result<()> {
    let image = root.join("image");
    let isolinux = image.join("isolinux");

    stage_signed_loaders(root, &isolinux)?;
    build_efi_image(&isolinux, runner)?;
    build_bios_image(root, &isolinux, runner)?;
    write_checksum_manifest(&image, runner)?;
    Ok(())
}

/// Copy the signed shim, MOK manager, and GRUB into the staging area.
/// These stay signed as shipped; Secure Boot verifies the chain at boot.
fn stage_signed_loaders(root: &Path, isolinux: &Path) -> Result<()> {
    for (source, dest) in [
        (SHIM_SIGNED, "bootx64.efi"),
        (MOK_MANAGER, "mmx64.efi"),
        (GRUB_SIGNED, "grubx64.efi"),
    ] {
        let from = root.join(source);
        fs::copy(&from, isolinux.join(dest))
            .with_context(|| format!("staging signed loader '{}'", from.display()))?;
    }
    Ok(())
}

fn build_efi_image(isolinux: &Path, runner: &dyn ToolRunner) -> Result<()> {
    let image = isolinux.join("efiboot.img");
    fs::write(&image, vec![0u8; EFIBOOT_SIZE_BYTES])
        .with_context(|| format!("zero-filling '{}'", image.display()))?;

    Cmd::new("mkfs.vfat")
        .args(["-F", "16"])
        .arg_path(&image)
        .error_msg("mkfs.vfat failed. Install dosfstools.")
        .run_with(runner)?;

    // mtools misparses image paths under a multibyte locale.
    Cmd::new("mmd")
        .args(["-i", "efiboot.img", "efi", "efi/ubuntu", "efi/boot"])
        .env("LC_CTYPE", "C")
        .dir(isolinux)
        .error_msg("mmd failed. Install mtools.")
        .run_with(runner)?;

    // The signed GRUB only reads its config from \EFI\ubuntu.
    for (source, dest) in [
        ("./bootx64.efi", "::efi/boot/bootx64.efi"),
        ("./mmx64.efi", "::efi/boot/mmx64.efi"),
        ("./grubx64.efi", "::efi/boot/grubx64.efi"),
        ("./grub.cfg", "::efi/ubuntu/grub.cfg"),
    ] {
        Cmd::new("mcopy")
            .args(["-i", "efiboot.img", source, dest])
            .env("LC_CTYPE", "C")
            .dir(isolinux)
            .error_msg(format!("mcopy of '{source}' failed"))
            .run_with(runner)?;
    }
    Ok(())
}

fn build_bios_image(root: &Path, isolinux: &Path, runner: &dyn ToolRunner) -> Result<()> {
    let core = isolinux.join("core.img");
    Cmd::new("grub-mkstandalone")
        .arg("--format=i386-pc")
        .arg(format!("--output={}", core.display()))
        .arg("--install-modules=linux16 linux normal iso9660 biosdisk memdisk search tar ls")
        .arg("--modules=linux16 linux normal iso9660 biosdisk search")
        .arg("--locales=")
        .arg("--fonts=")
        .arg(format!(
            "boot/grub/grub.cfg={}",
            isolinux.join("grub.cfg").display()
        ))
        .error_msg("grub-mkstandalone failed")
        .run_with(runner)?;

    // El Torito image is the CD boot sector followed by the standalone core.
    let cdboot = root.join(CDBOOT_IMAGE);
    let mut bios = fs::read(&cdboot)
        .with_context(|| format!("reading '{}'", cdboot.display()))?;
    bios.extend(fs::read(&core).with_context(|| format!("reading '{}'", core.display()))?);
    fs::write(isolinux.join("bios.img"), bios)?;
    Ok(())
}

/// Checksum everything on the disc except the boot staging area; the
/// signed loaders are not byte-reproducible between otherwise identical
/// builds.
fn write_checksum_manifest(image: &Path, runner: &dyn ToolRunner) -> Result<()> {
    let files = manifest_files(image)?;
    if files.is_empty() {
        return Ok(());
    }

    let outcome = Cmd::new("md5sum")
        .args(files.iter().map(String::as_str))
        .dir(image)
        .error_msg("md5sum failed")
        .run_with(runner)?;
    fs::write(image.join("md5sum.txt"), outcome.stdout)?;
    Ok(())
}

/// Relative paths to include in the manifest, sorted for stable output.
pub(crate) fn manifest_files(image: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(image) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel: &Path = entry.path().strip_prefix(image)?;
        if rel.starts_with("isolinux") || rel == Path::new("md5sum.txt") {
            continue;
        }
        files.push(format!("./{}", rel.display()));
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: PathBuf) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_manifest_excludes_boot_staging_and_itself() {
        let temp = TempDir::new().unwrap();
        touch(temp.path().join("casper/vmlinuz"));
        touch(temp.path().join("casper/initrd"));
        touch(temp.path().join("install/memtest86+.bin"));
        touch(temp.path().join("isolinux/bios.img"));
        touch(temp.path().join("isolinux/efiboot.img"));
        touch(temp.path().join("md5sum.txt"));

        let files = manifest_files(temp.path()).unwrap();
        assert_eq!(
            files,
            vec![
                "./casper/initrd".to_string(),
                "./casper/vmlinuz".to_string(),
                "./install/memtest86+.bin".to_string(),
            ]
        );
    }

    #[test]
    fn test_manifest_of_empty_tree_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(manifest_files(temp.path()).unwrap().is_empty());
    }
}

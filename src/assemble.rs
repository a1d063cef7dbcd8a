//! Image assembly: squashfs, hybrid ISO mastering, and checksums.
//!
//! Runs on the host after the jail has been fully released; only the
//! jail's plain filesystem contents remain by the time these run.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::context::BuildContext;
use crate::error::BuildError;
use crate::process::{Cmd, ToolRunner};

/// Paths excluded from the squashfs and the size metadata. The cache and
/// scratch trees never belong in the shipped image.
pub const SQUASHFS_EXCLUDES: &[&str] = &[
    "var/cache/apt/archives/*",
    "root/*",
    "root/.*",
    "tmp/*",
    "tmp/.*",
    "swapfile",
];

/// Move the guest-built /image tree out of the jail onto the host side,
/// so the jail itself can be squashed and later deleted.
pub fn stage_image_tree(ctx: &BuildContext) -> Result<()> {
    let source = ctx.jail_dir.join("image");
    if !source.is_dir() {
        bail!(
            "guest stage did not produce an image tree at '{}'",
            source.display()
        );
    }
    if ctx.image_dir.exists() {
        log::warn!(
            "removing stale image staging at {}",
            ctx.image_dir.display()
        );
        fs::remove_dir_all(&ctx.image_dir)?;
    }
    fs::rename(&source, &ctx.image_dir).with_context(|| {
        format!(
            "moving image tree '{}' to '{}'",
            source.display(),
            ctx.image_dir.display()
        )
    })?;
    Ok(())
}

/// Compress the jail into the read-only live filesystem and record its
/// uncompressed size next to it (casper uses the figure for the to-RAM
/// boot option).
pub fn build_squashfs(ctx: &BuildContext, runner: &dyn ToolRunner) -> Result<()> {
    let output = ctx.image_dir.join("casper/filesystem.squashfs");
    println!("Creating squashfs at {}...", output.display());

    let mut cmd = Cmd::new("mksquashfs")
        .arg_path(&ctx.jail_dir)
        .arg_path(&output)
        .args(["-noappend", "-no-duplicates", "-no-recovery", "-wildcards"])
        .args(["-comp", "zstd", "-b", "1M"]);
    for pattern in SQUASHFS_EXCLUDES {
        cmd = cmd.args(["-e", pattern]);
    }
    cmd.interactive()
        .error_msg("mksquashfs failed. Install squashfs-tools.")
        .run_with(runner)?;

    let size = uncompressed_size(&ctx.jail_dir);
    fs::write(
        ctx.image_dir.join("casper/filesystem.size"),
        format!("{size}\n"),
    )?;
    Ok(())
}

/// Master the hybrid ISO: BIOS El Torito boot plus a GPT-appended EFI
/// system partition, with the EFI loaders grafted to their fixed on-disc
/// paths.
pub fn build_iso(ctx: &BuildContext, runner: &dyn ToolRunner) -> Result<()> {
    fs::create_dir_all(&ctx.output_dir)?;
    let grub_mbr = ctx.jail_dir.join("usr/lib/grub/i386-pc/boot_hybrid.img");

    println!("Creating ISO {}...", ctx.iso_path.display());
    Cmd::new("xorriso")
        .args(["-as", "mkisofs"])
        .args(["-iso-level", "3"])
        .arg("-full-iso9660-filenames")
        .args(["-J", "-J", "-joliet-long"])
        .args(["-volid", ctx.volume_label()])
        .arg("-output")
        .arg_path(&ctx.iso_path)
        .args([
            "-eltorito-boot",
            "isolinux/bios.img",
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
            "--eltorito-catalog",
            "boot.catalog",
            "--grub2-boot-info",
        ])
        .arg("--grub2-mbr")
        .arg_path(&grub_mbr)
        .args(["-partition_offset", "16", "--mbr-force-bootable"])
        .args(["-eltorito-alt-boot", "-no-emul-boot", "-e", "isolinux/efiboot.img"])
        .args([
            "-append_partition",
            "2",
            "28732ac11ff8d211ba4b00a0c93ec93b",
            "isolinux/efiboot.img",
        ])
        .arg("-appended_part_as_gpt")
        .args(["-iso_mbr_part_type", "a2a0d0ebe5b9334487c068b6b72699c7"])
        .args(["-m", "isolinux/efiboot.img", "-m", "isolinux/bios.img"])
        .args(["-e", "--interval:appended_partition_2:::"])
        .args(["-exclude", "isolinux"])
        .arg("-graft-points")
        .args([
            "/EFI/boot/bootx64.efi=isolinux/bootx64.efi",
            "/EFI/boot/mmx64.efi=isolinux/mmx64.efi",
            "/EFI/boot/grubx64.efi=isolinux/grubx64.efi",
            "/EFI/ubuntu/grub.cfg=isolinux/grub.cfg",
            "/isolinux/bios.img=isolinux/bios.img",
            "/isolinux/efiboot.img=isolinux/efiboot.img",
            ".",
        ])
        .dir(&ctx.image_dir)
        .interactive()
        .error_msg("xorriso failed. Install xorriso.")
        .run_with(runner)?;

    if !ctx.iso_path.is_file() {
        return Err(BuildError::ArtifactCreationFailure(ctx.iso_path.clone()).into());
    }
    Ok(())
}

/// Write the `<iso>.sha512` file in the standard two-space format, using
/// just the filename so `sha512sum -c` works from the output directory.
pub fn generate_checksum(ctx: &BuildContext, runner: &dyn ToolRunner) -> Result<PathBuf> {
    let outcome = Cmd::new("sha512sum")
        .arg_path(&ctx.iso_path)
        .error_msg("sha512sum failed. Install coreutils.")
        .run_with(runner)?;

    let text = outcome.stdout_text();
    let hash = text
        .split_whitespace()
        .next()
        .context("could not parse sha512sum output, no hash found")?;
    let filename = ctx
        .iso_path
        .file_name()
        .context("could not get ISO filename")?
        .to_string_lossy();

    fs::write(&ctx.checksum_path, format!("{hash}  {filename}\n"))?;

    if hash.len() >= 16 {
        println!("  SHA512: {}...{}", &hash[..8], &hash[hash.len() - 8..]);
    }
    Ok(ctx.checksum_path.clone())
}

/// In-process digest of the finished ISO, recorded in the build report.
pub fn iso_digest(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("opening '{}' for digest", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Byte total of the jail tree, staying on one filesystem and skipping
/// the same paths the squashfs excludes.
fn uncompressed_size(jail: &Path) -> u64 {
    let mut total = 0u64;
    for entry in WalkDir::new(jail).same_file_system(true) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(jail).unwrap_or(entry.path());
        if is_size_excluded(rel) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

fn is_size_excluded(rel: &Path) -> bool {
    rel.starts_with("var/cache/apt/archives")
        || rel.starts_with("root")
        || rel.starts_with("tmp")
        || rel == Path::new("swapfile")
}

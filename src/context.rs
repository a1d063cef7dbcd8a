//! Build context: every path and identifier the pipeline needs, resolved
//! once at startup and never mutated. Components read from this instead of
//! relying on the process working directory.

use std::path::{Path, PathBuf};

use time::{Date, OffsetDateTime};

use crate::config::BuilderConfig;

/// Immutable per-build configuration.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Distro display name.
    pub name: String,
    /// Date-stamped build identifier, e.g. `RescueOS-2026.08.06`. Doubles
    /// as the ISO volume label.
    pub build_id: String,
    /// Ubuntu release codename.
    pub release: String,
    /// Package mirror URL.
    pub mirror: String,
    /// Workspace root the build was started from.
    pub workspace: PathBuf,
    /// The chroot jail.
    pub jail_dir: PathBuf,
    /// Host-side staging for the on-disc layout, moved out of the jail
    /// after the guest stage.
    pub image_dir: PathBuf,
    /// Host-side apt package cache, bind-mounted into the jail.
    pub apt_cache_dir: PathBuf,
    /// Host-side apt index lists, bind-mounted into the jail.
    pub apt_lists_dir: PathBuf,
    /// Final ISO path.
    pub iso_path: PathBuf,
    /// Checksum file written next to the ISO.
    pub checksum_path: PathBuf,
    /// Machine-readable build report.
    pub report_path: PathBuf,
    /// Directory holding the final artifacts.
    pub output_dir: PathBuf,
}

impl BuildContext {
    /// Resolve a context for the given build date.
    pub fn new(workspace: &Path, config: &BuilderConfig, date: Date) -> Self {
        let build_id = format!(
            "{}-{:04}.{:02}.{:02}",
            config.name,
            date.year(),
            u8::from(date.month()),
            date.day()
        );
        let output_dir = workspace.join("build");
        let (apt_cache_dir, apt_lists_dir) = cache_dirs(config);

        Self {
            name: config.name.clone(),
            release: config.release.clone(),
            mirror: config.mirror.clone(),
            workspace: workspace.to_path_buf(),
            jail_dir: workspace.join("chroot"),
            image_dir: workspace.join("image"),
            apt_cache_dir,
            apt_lists_dir,
            iso_path: output_dir.join(format!("{build_id}.iso")),
            checksum_path: output_dir.join(format!("{build_id}.iso.sha512")),
            report_path: output_dir.join("build-report.json"),
            output_dir,
            build_id,
        }
    }

    /// Resolve a context stamped with today's date.
    pub fn for_today(workspace: &Path, config: &BuilderConfig) -> Self {
        Self::new(workspace, config, OffsetDateTime::now_utc().date())
    }

    /// ISO volume label.
    pub fn volume_label(&self) -> &str {
        &self.build_id
    }
}

fn cache_dirs(config: &BuilderConfig) -> (PathBuf, PathBuf) {
    let root = config
        .cache_dir
        .clone()
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("live-builder")))
        .unwrap_or_else(|| PathBuf::from(".live-builder-cache"));
    (root.join("apt-archives"), root.join("apt-lists"))
}

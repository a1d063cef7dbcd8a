//! Source build of the ntfs-3g system-compression plugin.
//!
//! Windows system files are often stored WOF-compressed; stock ntfs-3g
//! cannot read them without this plugin, and it is not packaged upstream.
//! The build tools are installed only for this step and purged afterward,
//! so no compiler toolchain ships in the final image.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::guest::apt;
use crate::process::{Cmd, ToolRunner};

const SOURCE_REPO: &str = "https://github.com/ebiggers/ntfs-3g-system-compression.git";
const BUILD_TREE: &str = "ntfs-3g-system-compression";
const PLUGIN_NAME: &str = "ntfs-plugin-80000017.so";

const BUILD_DEPS: &[&str] = &[
    "autoconf",
    "automake",
    "libtool",
    "pkg-config",
    "ntfs-3g-dev",
    "libfuse-dev",
    "build-essential",
];

/// Clone, build, and install the plugin, then remove every trace of the
/// toolchain that built it.
pub fn build(root: &Path, runner: &dyn ToolRunner) -> Result<()> {
    // Anything already present stays installed afterward; only the deps
    // we add here are purged again.
    let installed = apt::installed_packages(runner)?;
    let added: Vec<&str> = BUILD_DEPS
        .iter()
        .copied()
        .filter(|dep| !installed.iter().any(|package| package == dep))
        .collect();
    apt::install(runner, &added)?;

    let tree = root.join(BUILD_TREE);
    Cmd::new("git")
        .arg("clone")
        .arg(SOURCE_REPO)
        .arg_path(&tree)
        .interactive()
        .error_msg("git clone of ntfs-3g-system-compression failed")
        .run_with(runner)?;

    Cmd::new("autoreconf")
        .arg("-i")
        .dir(&tree)
        .error_msg("autoreconf failed")
        .run_with(runner)?;
    Cmd::new("chmod")
        .arg("+x")
        .arg_path(&tree.join("configure"))
        .run_with(runner)?;
    Cmd::new("./configure")
        .dir(&tree)
        .interactive()
        .error_msg("configure failed")
        .run_with(runner)?;
    Cmd::new("make")
        .dir(&tree)
        .interactive()
        .error_msg("make failed")
        .run_with(runner)?;

    let plugin_dir = plugin_search_dir(root, runner)?;
    let built = find_built_plugin(&tree)?;
    fs::create_dir_all(&plugin_dir)
        .with_context(|| format!("creating plugin directory '{}'", plugin_dir.display()))?;
    fs::copy(&built, plugin_dir.join(PLUGIN_NAME))
        .with_context(|| format!("installing '{PLUGIN_NAME}'"))?;

    apt::purge(runner, &added)?;
    apt::autoremove_purge(runner)?;
    fs::remove_dir_all(&tree)
        .with_context(|| format!("removing build tree '{}'", tree.display()))?;
    Ok(())
}

/// Ask ntfs-3g where it looks for plugins. The directory only appears in
/// its diagnostic output, so both streams are searched.
fn plugin_search_dir(root: &Path, runner: &dyn ToolRunner) -> Result<PathBuf> {
    let outcome = Cmd::new("ntfs-3g")
        .arg("-h")
        .allow_fail()
        .run_with(runner)?;
    let text = format!("{}\n{}", outcome.stdout_text(), outcome.stderr);
    let path = parse_plugin_path(&text)
        .context("could not find 'Plugin path:' in ntfs-3g help output")?;
    // Reported absolute; rebase onto the root we are customizing.
    Ok(root.join(path.strip_prefix("/").unwrap_or(&path)))
}

pub(crate) fn parse_plugin_path(text: &str) -> Option<PathBuf> {
    text.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Plugin path:")
            .map(|rest| PathBuf::from(rest.trim()))
    })
}

fn find_built_plugin(tree: &Path) -> Result<PathBuf> {
    for entry in WalkDir::new(tree) {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name().to_str() == Some(PLUGIN_NAME) {
            return Ok(entry.path().to_path_buf());
        }
    }
    bail!("build finished but '{PLUGIN_NAME}' was not produced");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_plugin_path_from_help_output() {
        let text = "ntfs-3g 2022.10.3 integrated FUSE 28\n\
                    Plugin path: /usr/lib/x86_64-linux-gnu/ntfs-3g\n\
                    Copyright (C) 2005-2007 Yura Pakhuchiy";
        assert_eq!(
            parse_plugin_path(text),
            Some(PathBuf::from("/usr/lib/x86_64-linux-gnu/ntfs-3g"))
        );
    }

    #[test]
    fn test_parse_plugin_path_missing() {
        assert_eq!(parse_plugin_path("no such line here"), None);
    }

    #[test]
    fn test_find_built_plugin_locates_nested_artifact() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join(".libs");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join(PLUGIN_NAME), b"elf").unwrap();

        let found = find_built_plugin(temp.path()).unwrap();
        assert!(found.ends_with(format!(".libs/{PLUGIN_NAME}")));
    }

    #[test]
    fn test_find_built_plugin_errors_when_absent() {
        let temp = TempDir::new().unwrap();
        assert!(find_built_plugin(temp.path()).is_err());
    }
}

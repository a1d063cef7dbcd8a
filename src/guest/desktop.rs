//! Desktop and system defaults baked into the image.
//!
//! Settings are delivered as high-priority gschema override files rather
//! than by editing Ubuntu's own override in place; glib applies overrides
//! in filename order, so the later-sorted file wins for the same keys.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::BuilderConfig;
use crate::process::{Cmd, ToolRunner};

/// Shortcuts pinned to the dash, most used first.
const FAVORITE_APPS: &[&str] = &[
    "firefox.desktop",
    "org.gnome.Nautilus.desktop",
    "org.gnome.Terminal.desktop",
    "org.gnome.DiskUtility.desktop",
    "gparted.desktop",
];

const GTK_THEME: &str = "Yaru-dark";

/// Register the branded plymouth theme and make it the default via the
/// alternatives mechanism.
pub fn set_boot_splash(config: &BuilderConfig, runner: &dyn ToolRunner) -> Result<()> {
    let theme = format!(
        "/usr/share/plymouth/themes/{id}/{id}.plymouth",
        id = config.id
    );
    Cmd::new("update-alternatives")
        .args([
            "--install",
            "/usr/share/plymouth/themes/default.plymouth",
            "default.plymouth",
        ])
        .arg(&theme)
        .arg("10")
        .error_msg("update-alternatives --install failed")
        .run_with(runner)?;
    Cmd::new("update-alternatives")
        .args(["--set", "default.plymouth"])
        .arg(&theme)
        .error_msg("update-alternatives --set failed")
        .run_with(runner)?;
    Ok(())
}

/// Write session defaults and recompile the schema and dconf caches.
pub fn apply_preferences(
    root: &Path,
    config: &BuilderConfig,
    runner: &dyn ToolRunner,
) -> Result<()> {
    write_settings_override(root, config)?;
    write_power_override(root, config)?;
    write_dconf_defaults(root, config)?;

    Cmd::new("glib-compile-schemas")
        .arg("/usr/share/glib-2.0/schemas")
        .error_msg("glib-compile-schemas failed")
        .run_with(runner)?;
    Cmd::new("dconf")
        .arg("update")
        .error_msg("dconf update failed")
        .run_with(runner)?;
    Ok(())
}

/// Stop NetworkManager from fighting over interfaces declared in legacy
/// interface files, and hand DNS to systemd-resolved.
pub fn configure_network_manager(root: &Path, runner: &dyn ToolRunner) -> Result<()> {
    let nm_dir = root.join("etc/NetworkManager");
    fs::create_dir_all(nm_dir.join("conf.d"))?;

    fs::write(
        nm_dir.join("NetworkManager.conf"),
        "[main]\n\
         plugins=ifupdown,keyfile\n\
         dns=systemd-resolved\n\
         \n\
         [ifupdown]\n\
         managed=false\n",
    )?;
    // An empty file overrides the packaged globally-managed-devices
    // snippet, so hotplugged interfaces stay managed.
    fs::write(nm_dir.join("conf.d/10-globally-managed-devices.conf"), "")?;

    Cmd::new("dpkg-reconfigure")
        .arg("network-manager")
        .interactive()
        .error_msg("dpkg-reconfigure network-manager failed")
        .run_with(runner)?;
    Ok(())
}

fn write_settings_override(root: &Path, config: &BuilderConfig) -> Result<()> {
    let schemas = root.join("usr/share/glib-2.0/schemas");
    fs::create_dir_all(&schemas)?;

    let favorites = favorite_apps_list();
    let content = format!(
        "[org.gnome.shell]\n\
         favorite-apps={favorites}\n\
         \n\
         [org.gnome.shell:ubuntu]\n\
         favorite-apps={favorites}\n\
         \n\
         [org.gnome.desktop.interface]\n\
         gtk-theme='{GTK_THEME}'\n\
         icon-theme='{GTK_THEME}'\n\
         \n\
         [org.gnome.desktop.interface:GNOME-Greeter]\n\
         gtk-theme='{GTK_THEME}'\n\
         icon-theme='{GTK_THEME}'\n\
         \n\
         [org.gnome.desktop.interface:ubuntu]\n\
         gtk-theme='{GTK_THEME}'\n\
         icon-theme='{GTK_THEME}'\n"
    );

    let path = schemas.join(format!("90_{}-settings.gschema.override", config.id));
    fs::write(&path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// A live session must never blank the screen or suspend mid-recovery.
fn write_power_override(root: &Path, config: &BuilderConfig) -> Result<()> {
    let schemas = root.join("usr/share/glib-2.0/schemas");
    fs::create_dir_all(&schemas)?;

    let content = "[org.gnome.desktop.session]\n\
                   idle-delay=uint32 0\n\
                   \n\
                   [org.gnome.settings-daemon.plugins.power]\n\
                   sleep-inactive-battery-type='nothing'\n\
                   sleep-inactive-ac-type='nothing'\n\
                   sleep-inactive-battery-timeout=0\n\
                   sleep-inactive-ac-timeout=0\n";

    let path = schemas.join(format!("99_{}-power.gschema.override", config.id));
    fs::write(&path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

fn write_dconf_defaults(root: &Path, config: &BuilderConfig) -> Result<()> {
    fs::create_dir_all(root.join("etc/dconf/profile"))?;
    fs::create_dir_all(root.join("etc/dconf/db/local.d"))?;

    fs::write(
        root.join("etc/dconf/profile/user"),
        "user-db:user\nsystem-db:local\n",
    )?;

    let keyfile = format!(
        "[org/gnome/desktop/interface]\n\
         gtk-theme='{GTK_THEME}'\n\
         icon-theme='{GTK_THEME}'\n\
         color-scheme='prefer-dark'\n\
         \n\
         [org/gnome/shell]\n\
         favorite-apps={}\n",
        favorite_apps_list()
    );
    fs::write(
        root.join("etc/dconf/db/local.d").join(format!("00-{}", config.id)),
        keyfile,
    )?;
    Ok(())
}

fn favorite_apps_list() -> String {
    let quoted: Vec<String> = FAVORITE_APPS
        .iter()
        .map(|app| format!("'{app}'"))
        .collect();
    format!("[{}]", quoted.join(", "))
}

//! live-builder entry point.
//!
//! `build` drives the full host pipeline; `guest-stage` is the internal
//! mode this binary re-enters itself in, under chroot(8), to run the
//! customizer inside the jail.

use std::fs;
use std::io::{self, Write as _};
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use fs2::FileExt;

use live_builder::config::{self, BuilderConfig};
use live_builder::context::BuildContext;
use live_builder::guest;
use live_builder::jail;
use live_builder::pipeline;
use live_builder::preflight;
use live_builder::process::HostRunner;

fn usage() -> &'static str {
    "Usage:\n  live-builder build        Build the live ISO (requires root)\n  live-builder preflight    Check required host tools\n  live-builder guest-stage  Internal: customizer entrypoint inside the jail"
}

fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["build"] => build(),
        ["preflight"] => {
            preflight::check_host_tools()?;
            println!("All required host tools found.");
            Ok(())
        }
        ["guest-stage"] => guest_stage(),
        _ => bail!(usage()),
    }
}

fn build() -> Result<()> {
    require_root()?;
    let started = Instant::now();

    let workspace = std::env::current_dir().context("resolving working directory")?;
    let config = config::load(&workspace)?;
    let ctx = BuildContext::for_today(&workspace, &config);
    println!("Beginning build for {}...", ctx.build_id);

    if ctx.iso_path.exists() && !confirm_replace(&ctx.iso_path)? {
        println!("Exiting.");
        return Ok(());
    }

    // One build per workspace; the jail and staging paths are exclusive.
    let _lock = acquire_build_lock(&workspace)?;

    // Keep the process alive through SIGINT so the interrupted stage
    // fails normally and teardown still runs.
    ctrlc::set_handler(|| {
        eprintln!("\nInterrupt received; finishing teardown before exit...");
        pipeline::request_interrupt();
    })
    .context("installing interrupt handler")?;

    pipeline::run_build(&ctx, &config, &HostRunner, preflight::HOST_TOOLS)?;

    println!(
        "\nBuild complete in {:.1?}. Output: {}",
        started.elapsed(),
        ctx.iso_path.display()
    );
    Ok(())
}

fn guest_stage() -> Result<()> {
    let config_path = Path::new("/").join(jail::GUEST_CONFIG);
    let bytes = fs::read(&config_path)
        .with_context(|| format!("reading guest config '{}'", config_path.display()))?;
    let config: BuilderConfig =
        serde_json::from_slice(&bytes).context("parsing guest config")?;
    guest::run(&config, &HostRunner)
}

fn require_root() -> Result<()> {
    // mount, mknod, and chroot all need it
    if unsafe { libc::geteuid() } != 0 {
        bail!("live-builder must be run as root");
    }
    Ok(())
}

fn confirm_replace(path: &Path) -> Result<bool> {
    print!(
        "Output file \"{}\" already exists, replace it? [y/N]: ",
        path.display()
    );
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("y") {
        fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))?;
        Ok(true)
    } else {
        Ok(false)
    }
}

fn acquire_build_lock(workspace: &Path) -> Result<fs::File> {
    let path = workspace.join(".live-builder.lock");
    let file = fs::File::create(&path)
        .with_context(|| format!("creating lock file '{}'", path.display()))?;
    file.try_lock_exclusive()
        .context("another build is already running in this workspace")?;
    Ok(file)
}

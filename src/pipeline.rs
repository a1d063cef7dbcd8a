//! The build pipeline: an ordered list of named stages run strictly
//! sequentially, with teardown on every exit path.
//!
//! A stage failure halts the remaining stages and is surfaced to the
//! caller after teardown has run. Stage statuses are persisted as a JSON
//! build report so a failed run can be diagnosed after the fact.

use anyhow::{bail, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;

use crate::assemble;
use crate::config::BuilderConfig;
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::guard::ResourceGuard;
use crate::jail;
use crate::process::{CommandFailed, ToolRunner};
use crate::preflight;

/// Host-side stages, in execution order.
pub const STAGES: &[&str] = &[
    "provision",
    "guest-stage",
    "release-environment",
    "image-staging",
    "squashfs",
    "iso",
    "checksum",
];

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Mark the build interrupted. Installed as the SIGINT handler so an
/// interrupt surfaces as a stage failure and still routes through
/// teardown instead of killing the process mid-mount.
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Stage lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
}

/// Machine-readable record of one build run.
#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub status: String,
    pub stages: Vec<StageRecord>,
    pub iso_path: Option<String>,
    pub iso_sha256: Option<String>,
    pub unreleased_resources: Vec<String>,
}

impl BuildReport {
    fn new(ctx: &BuildContext) -> Self {
        Self {
            build_id: ctx.build_id.clone(),
            created_at_utc: utc_timestamp(),
            finished_at_utc: None,
            status: "running".to_string(),
            stages: STAGES
                .iter()
                .map(|name| StageRecord {
                    name: (*name).to_string(),
                    status: StageStatus::Pending,
                })
                .collect(),
            iso_path: None,
            iso_sha256: None,
            unreleased_resources: Vec::new(),
        }
    }

    fn set_status(&mut self, name: &str, status: StageStatus) {
        if let Some(record) = self.stages.iter_mut().find(|record| record.name == name) {
            record.status = status;
        }
    }

    fn finish(&mut self, succeeded: bool) {
        self.finished_at_utc = Some(utc_timestamp());
        self.status = if succeeded { "success" } else { "failure" }.to_string();
    }

    fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Run one named step, attributing any failure to it.
///
/// The exit code of a failed external tool is carried into the
/// [`BuildError::StageExecutionFailure`] when one is present in the chain.
pub fn run_step<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    f().map_err(|err| {
        let exit_code = err
            .downcast_ref::<CommandFailed>()
            .map(|failure| failure.code);
        err.context(BuildError::StageExecutionFailure {
            stage: name.to_string(),
            exit_code,
        })
    })
}

/// Run the full build.
///
/// Preflight runs first so a missing host tool is reported before the
/// jail directory is created. Teardown runs regardless of how the stages
/// end, and the build report is written on every path.
pub fn run_build(
    ctx: &BuildContext,
    config: &BuilderConfig,
    runner: &dyn ToolRunner,
    required_tools: &[(&str, &str)],
) -> Result<BuildReport> {
    preflight::check_required_tools(required_tools)?;

    let mut guard = ResourceGuard::new(runner);
    let mut report = BuildReport::new(ctx);
    let mut jail_created = false;

    let result = run_stages(
        ctx,
        config,
        runner,
        &mut guard,
        &mut report,
        &mut jail_created,
    );
    conclude(ctx, &mut guard, &mut report, jail_created, result.is_ok());
    result.map(|()| report)
}

fn run_stages(
    ctx: &BuildContext,
    config: &BuilderConfig,
    runner: &dyn ToolRunner,
    guard: &mut ResourceGuard<'_>,
    report: &mut BuildReport,
    jail_created: &mut bool,
) -> Result<()> {
    let jail = execute(report, "provision", || {
        jail::provision(ctx, config, guard, runner, jail_created)
    })?;

    execute(report, "guest-stage", || {
        jail::enter_and_run(ctx, config, &jail, runner)
    })?;

    execute(report, "release-environment", || {
        let failures = guard.release_all();
        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            log::warn!("{failure}");
        }
        bail!(
            "{} resource(s) could not be released; refusing to assemble from a jail with live mounts",
            failures.len()
        );
    })?;

    execute(report, "image-staging", || assemble::stage_image_tree(ctx))?;
    execute(report, "squashfs", || assemble::build_squashfs(ctx, runner))?;
    execute(report, "iso", || assemble::build_iso(ctx, runner))?;

    // The checksum is a convenience, never the build outcome.
    report.set_status("checksum", StageStatus::Running);
    match assemble::generate_checksum(ctx, runner) {
        Ok(path) => {
            report.set_status("checksum", StageStatus::Succeeded);
            println!("  Wrote: {}", path.display());
        }
        Err(err) => {
            report.set_status("checksum", StageStatus::Failed);
            log::warn!("checksum generation failed, ISO stands without one: {err:#}");
        }
    }

    report.iso_path = Some(ctx.iso_path.display().to_string());
    report.iso_sha256 = assemble::iso_digest(&ctx.iso_path).ok();
    Ok(())
}

fn execute<T>(
    report: &mut BuildReport,
    name: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    if interrupted() {
        report.set_status(name, StageStatus::Failed);
        bail!("build interrupted before stage '{name}'");
    }

    println!("\n=== {name} ===");
    report.set_status(name, StageStatus::Running);
    match f() {
        Ok(value) => {
            report.set_status(name, StageStatus::Succeeded);
            Ok(value)
        }
        Err(err) => {
            report.set_status(name, StageStatus::Failed);
            Err(err)
        }
    }
}

fn conclude(
    ctx: &BuildContext,
    guard: &mut ResourceGuard<'_>,
    report: &mut BuildReport,
    jail_created: bool,
    succeeded: bool,
) {
    println!("\n=== teardown ===");
    let teardown = jail::teardown(ctx, guard, jail_created);
    if !teardown.failures.is_empty() {
        log::warn!(
            "{} resource(s) remain unreleased; see report",
            teardown.failures.len()
        );
    }

    if ctx.image_dir.exists() {
        if let Err(err) = fs::remove_dir_all(&ctx.image_dir) {
            log::warn!(
                "could not remove image staging {}: {err}",
                ctx.image_dir.display()
            );
        }
    }

    report.unreleased_resources = guard
        .unreleased()
        .iter()
        .map(|resource| format!("{} at {}", resource.kind, resource.target.display()))
        .collect();
    report.finish(succeeded);
    if let Err(err) = report.write(&ctx.report_path) {
        log::warn!("could not write build report: {err:#}");
    }
}

fn utc_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

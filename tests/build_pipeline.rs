//! End-to-end pipeline behavior against a fake tool runner.
//!
//! These exercise the failure-handling contract: preflight ordering, the
//! destructive-cleanup gate, guest exit code propagation, and the
//! checksum step's non-fatality.

mod helpers;

use helpers::{fixed_context, workspace_config, FakeRunner};
use live_builder::error::BuildError;
use live_builder::guard::ResourceGuard;
use live_builder::jail;
use live_builder::pipeline;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_missing_host_tool_fails_before_jail_creation() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();

    let err = pipeline::run_build(
        &ctx,
        &config,
        &runner,
        &[("definitely_missing_tool_xyz", "some-package")],
    )
    .unwrap_err();

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingDependency { tool, .. }) => {
            assert_eq!(tool, "definitely_missing_tool_xyz");
        }
        other => panic!("expected MissingDependency, got {other:?}"),
    }
    assert!(!ctx.jail_dir.exists(), "jail must not be created");
    assert!(runner.calls().is_empty(), "no tool may run after preflight fails");
}

#[test]
fn test_existing_jail_is_refused_and_never_deleted() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();

    fs::create_dir_all(&ctx.jail_dir).unwrap();
    fs::write(ctx.jail_dir.join("leftover.txt"), "from a previous run").unwrap();

    let err = pipeline::run_build(&ctx, &config, &runner, &[]).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::EnvironmentAlreadyExists(_))
    ));
    // No resource was acquired before the refusal
    assert!(!runner.saw("mount"));
    assert!(!runner.saw("mknod"));
    // The pre-existing tree is someone else's; it stays untouched
    assert!(ctx.jail_dir.join("leftover.txt").exists());
}

#[test]
fn test_guest_exit_code_surfaces_and_clean_release_removes_jail() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();
    runner.fail_on("chroot", 3);

    let err = pipeline::run_build(&ctx, &config, &runner, &[]).unwrap_err();

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::StageExecutionFailure { stage, exit_code }) => {
            assert_eq!(stage, "guest-stage");
            assert_eq!(*exit_code, Some(3));
        }
        other => panic!("expected StageExecutionFailure, got {other:?}"),
    }

    // All resources released cleanly, so the jail this run created is gone
    assert!(!ctx.jail_dir.exists());

    // The report records the halt point
    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(&ctx.report_path).unwrap()).unwrap();
    assert_eq!(report["status"], "failure");
    let stages = report["stages"].as_array().unwrap();
    let status_of = |name: &str| {
        stages
            .iter()
            .find(|stage| stage["name"] == name)
            .map(|stage| stage["status"].clone())
            .unwrap()
    };
    assert_eq!(status_of("provision"), "succeeded");
    assert_eq!(status_of("guest-stage"), "failed");
    assert_eq!(status_of("squashfs"), "pending");
}

#[test]
fn test_unreleased_resource_blocks_jail_removal() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();
    runner.fail_on("umount", 32);

    fs::create_dir_all(ctx.jail_dir.join("dev")).unwrap();

    // Fixture mount table still listing the target as mounted
    let table = temp.path().join("mounts");
    fs::write(
        &table,
        format!("tmpfs {} tmpfs rw 0 0\n", ctx.jail_dir.join("dev").display()),
    )
    .unwrap();

    let mut guard = ResourceGuard::with_mount_table(&runner, &table);
    guard.mount_tmpfs(&ctx.jail_dir.join("dev")).unwrap();

    let report = jail::teardown(&ctx, &mut guard, true);

    assert!(!report.jail_removed);
    assert_eq!(report.failures.len(), 1);
    assert!(
        ctx.jail_dir.exists(),
        "a jail with live mounts must never be deleted"
    );
    assert!(matches!(
        report.failures[0],
        BuildError::TeardownFailure(_, _)
    ));
}

#[test]
fn test_checksum_failure_does_not_fail_the_build() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();

    let jail_image = ctx.jail_dir.join("image");
    runner.on("chroot", move |_| {
        fs::create_dir_all(jail_image.join("casper")).unwrap();
        fs::create_dir_all(jail_image.join("isolinux")).unwrap();
    });
    let iso_path = ctx.iso_path.clone();
    runner.on("xorriso", move |_| {
        fs::write(&iso_path, b"iso contents").unwrap();
    });
    runner.fail_on("sha512sum", 1);

    let report = pipeline::run_build(&ctx, &config, &runner, &[]).unwrap();

    assert_eq!(report.status, "success");
    assert!(ctx.iso_path.exists());
    assert!(!ctx.checksum_path.exists(), "no checksum file on failure");
    assert!(report.iso_sha256.is_some(), "report digest is independent");
    // Staging and jail are both gone after a clean run
    assert!(!ctx.jail_dir.exists());
    assert!(!ctx.image_dir.exists());
}

#[test]
fn test_iso_mastering_failure_fails_the_build() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();

    let jail_image = ctx.jail_dir.join("image");
    runner.on("chroot", move |_| {
        fs::create_dir_all(jail_image.join("casper")).unwrap();
    });
    runner.fail_on("xorriso", 1);

    let err = pipeline::run_build(&ctx, &config, &runner, &[]).unwrap_err();
    assert!(format!("{err:#}").contains("xorriso"));
    assert!(!ctx.iso_path.exists());

    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(&ctx.report_path).unwrap()).unwrap();
    assert_eq!(report["status"], "failure");
}

#[test]
fn test_rerun_after_clean_failure_yields_deterministic_artifact() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);

    // First attempt dies in the guest stage; the release is clean so the
    // jail is removed.
    let first = FakeRunner::new();
    first.fail_on("chroot", 1);
    pipeline::run_build(&ctx, &config, &first, &[]).unwrap_err();
    assert!(!ctx.jail_dir.exists());

    // Second attempt succeeds and lands the artifact at the same
    // date-stamped path with the same volume label.
    let second = FakeRunner::new();
    let jail_image = ctx.jail_dir.join("image");
    second.on("chroot", move |_| {
        fs::create_dir_all(jail_image.join("casper")).unwrap();
        fs::create_dir_all(jail_image.join("isolinux")).unwrap();
    });
    let iso_path = ctx.iso_path.clone();
    second.on("xorriso", move |_| {
        fs::write(&iso_path, b"iso contents").unwrap();
    });

    let report = pipeline::run_build(&ctx, &config, &second, &[]).unwrap();

    assert_eq!(report.status, "success");
    assert_eq!(report.build_id, "RescueOS-2026.08.06");
    assert!(ctx.iso_path.ends_with("build/RescueOS-2026.08.06.iso"));
    assert!(ctx.iso_path.exists());
    assert!(second.saw("-volid RescueOS-2026.08.06"));
}

#[test]
fn test_provision_acquires_resources_in_documented_order() {
    let temp = TempDir::new().unwrap();
    let config = workspace_config(temp.path());
    let ctx = fixed_context(temp.path(), &config);
    let runner = FakeRunner::new();
    // Halt right after provisioning so only its acquisitions are logged
    runner.fail_on("chroot", 1);

    pipeline::run_build(&ctx, &config, &runner, &[]).unwrap_err();

    let calls = runner.calls();
    let mount_and_node_calls: Vec<&String> = calls
        .iter()
        .filter(|line| {
            line.starts_with("mount") || line.starts_with("mknod") || line.starts_with("ln -s")
        })
        .collect();

    // tmpfs over dev, eight device nodes, fd symlink, tmpfs over run,
    // two cache binds
    assert_eq!(mount_and_node_calls.len(), 13);
    assert!(mount_and_node_calls[0].contains("-t tmpfs"));
    assert!(mount_and_node_calls[0].ends_with("/dev"));
    assert!(mount_and_node_calls[1].starts_with("mknod"));
    assert!(mount_and_node_calls[9].starts_with("ln -s /proc/self/fd"));
    assert!(mount_and_node_calls[10].ends_with("/run"));
    assert!(mount_and_node_calls[11].starts_with("mount --bind"));
    assert!(mount_and_node_calls[12].contains("apt-lists"));
}

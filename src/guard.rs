//! Tracking and guaranteed release of privileged OS resources.
//!
//! Every mount, device node, and symlink the build acquires is recorded
//! here in acquisition order. [`ResourceGuard::release_all`] walks the
//! record in reverse, so a mount nested under another mount is always
//! released before the thing it depends on. Releases that fail are
//! collected rather than thrown; a non-empty collection is the gate that
//! forbids deleting the jail directory, because removing a directory with
//! something still mounted over it can delete host files through the
//! mount point.

use anyhow::Result;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::error::BuildError;
use crate::jail::devices::DeviceNode;
use crate::process::{Cmd, ToolRunner};

/// What kind of OS resource a record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    BindMount,
    VfsMount,
    DeviceNode,
    Symlink,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::BindMount => "bind mount",
            ResourceKind::VfsMount => "filesystem mount",
            ResourceKind::DeviceNode => "device node",
            ResourceKind::Symlink => "symlink",
        };
        f.write_str(label)
    }
}

/// One acquired resource.
#[derive(Debug, Clone)]
pub struct Resource {
    pub kind: ResourceKind,
    pub target: PathBuf,
    pub acquired_at: OffsetDateTime,
    released: bool,
}

impl Resource {
    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Ordered record of acquired resources with LIFO release.
pub struct ResourceGuard<'r> {
    runner: &'r dyn ToolRunner,
    mount_table: PathBuf,
    resources: Vec<Resource>,
}

impl<'r> ResourceGuard<'r> {
    pub fn new(runner: &'r dyn ToolRunner) -> Self {
        Self::with_mount_table(runner, Path::new("/proc/self/mounts"))
    }

    /// Use an alternate mount table. Tests point this at a fixture file.
    pub fn with_mount_table(runner: &'r dyn ToolRunner, mount_table: &Path) -> Self {
        Self {
            runner,
            mount_table: mount_table.to_path_buf(),
            resources: Vec::new(),
        }
    }

    /// Mount a fresh tmpfs over `target`.
    pub fn mount_tmpfs(&mut self, target: &Path) -> Result<()> {
        let cmd = Cmd::new("mount")
            .args(["-t", "tmpfs", "tmpfs"])
            .arg_path(target);
        self.acquire(ResourceKind::VfsMount, target, cmd)
    }

    /// Mount a virtual filesystem (proc, sysfs, devpts) at `target`.
    pub fn mount_virtual(&mut self, fstype: &str, target: &Path) -> Result<()> {
        let cmd = Cmd::new("mount")
            .arg("none")
            .args(["-t", fstype])
            .arg_path(target);
        self.acquire(ResourceKind::VfsMount, target, cmd)
    }

    /// Bind-mount `source` onto `target`.
    pub fn bind_mount(&mut self, source: &Path, target: &Path) -> Result<()> {
        let cmd = Cmd::new("mount")
            .arg("--bind")
            .arg_path(source)
            .arg_path(target);
        self.acquire(ResourceKind::BindMount, target, cmd)
    }

    /// Create a character device node inside `dev_dir`.
    pub fn make_device_node(&mut self, dev_dir: &Path, node: &DeviceNode) -> Result<()> {
        let path = dev_dir.join(node.name);
        let cmd = Cmd::new("mknod")
            .arg("-m")
            .arg(format!("{:o}", node.mode))
            .arg_path(&path)
            .arg("c")
            .arg(node.major.to_string())
            .arg(node.minor.to_string());
        self.acquire(ResourceKind::DeviceNode, &path, cmd)
    }

    /// Create a symlink at `link_path` pointing to `link_target`.
    pub fn make_symlink(&mut self, link_target: &str, link_path: &Path) -> Result<()> {
        let cmd = Cmd::new("ln").arg("-s").arg(link_target).arg_path(link_path);
        self.acquire(ResourceKind::Symlink, link_path, cmd)
    }

    /// Perform the underlying OS call and record the resource on success.
    /// On failure nothing is recorded, so there is nothing to release.
    fn acquire(&mut self, kind: ResourceKind, target: &Path, cmd: Cmd) -> Result<()> {
        let outcome = match cmd.allow_fail().run_with(self.runner) {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(BuildError::ResourceAcquisitionFailure {
                    kind,
                    target: target.to_path_buf(),
                    reason: format!("{err:#}"),
                }
                .into())
            }
        };
        if !outcome.success() {
            return Err(BuildError::ResourceAcquisitionFailure {
                kind,
                target: target.to_path_buf(),
                reason: outcome.stderr_trimmed().to_string(),
            }
            .into());
        }

        self.resources.push(Resource {
            kind,
            target: target.to_path_buf(),
            acquired_at: OffsetDateTime::now_utc(),
            released: false,
        });
        Ok(())
    }

    /// Release every recorded resource in reverse acquisition order.
    ///
    /// Each release is attempted regardless of prior failures; the
    /// failures are returned rather than raised. Already-released
    /// resources are skipped, so calling this twice is harmless.
    pub fn release_all(&mut self) -> Vec<BuildError> {
        let runner = self.runner;
        let mount_table = self.mount_table.clone();
        let mut failures = Vec::new();

        for resource in self.resources.iter_mut().rev() {
            if resource.released {
                continue;
            }
            match resource.kind {
                ResourceKind::BindMount | ResourceKind::VfsMount => {
                    let outcome = Cmd::new("umount")
                        .arg_path(&resource.target)
                        .allow_fail()
                        .run_with(runner);
                    // umount of something no longer mounted exits non-zero;
                    // only a target still present in the mount table counts
                    // as a real failure.
                    let still_mounted = match outcome {
                        Ok(outcome) => {
                            !outcome.success() && is_mounted(&mount_table, &resource.target)
                        }
                        Err(_) => is_mounted(&mount_table, &resource.target),
                    };
                    if still_mounted {
                        failures.push(BuildError::TeardownFailure(
                            resource.kind,
                            resource.target.clone(),
                        ));
                    } else {
                        resource.released = true;
                    }
                }
                ResourceKind::DeviceNode | ResourceKind::Symlink => {
                    match fs::remove_file(&resource.target) {
                        Ok(()) => resource.released = true,
                        Err(err) if err.kind() == ErrorKind::NotFound => {
                            resource.released = true;
                        }
                        Err(_) => failures.push(BuildError::TeardownFailure(
                            resource.kind,
                            resource.target.clone(),
                        )),
                    }
                }
            }
        }

        failures
    }

    /// All recorded resources, in acquisition order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Resources that have not been confirmed released.
    pub fn unreleased(&self) -> Vec<&Resource> {
        self.resources.iter().filter(|r| !r.released).collect()
    }

    /// True when every recorded resource has been released.
    pub fn is_clean(&self) -> bool {
        self.resources.iter().all(|r| r.released)
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        // Backstop for exit paths that skipped an explicit release.
        if self.resources.iter().any(|r| !r.released) {
            for failure in self.release_all() {
                log::warn!("{failure}");
            }
        }
    }
}

/// Check whether `target` appears as a mount point in the mount table.
fn is_mounted(mount_table: &Path, target: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(mount_table) else {
        return false;
    };
    let target = target.to_string_lossy();
    contents.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(unescape_mount_path)
            .is_some_and(|mount_point| mount_point == target)
    })
}

/// Mount tables escape whitespace and backslashes as octal sequences.
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExitOutcome, Invocation};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct FakeRunner {
        calls: RefCell<Vec<String>>,
        fail_with: RefCell<HashMap<String, i32>>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_with: RefCell::new(HashMap::new()),
            }
        }

        fn fail_on(&self, program: &str, code: i32) {
            self.fail_with.borrow_mut().insert(program.to_string(), code);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl ToolRunner for FakeRunner {
        fn run(&self, invocation: &Invocation) -> Result<ExitOutcome> {
            self.calls.borrow_mut().push(invocation.command_line());
            let code = self
                .fail_with
                .borrow()
                .get(&invocation.program)
                .copied()
                .unwrap_or(0);
            Ok(ExitOutcome {
                code,
                stdout: Vec::new(),
                stderr: if code == 0 {
                    String::new()
                } else {
                    "simulated failure".to_string()
                },
            })
        }
    }

    #[test]
    fn test_release_runs_in_reverse_acquisition_order() {
        let runner = FakeRunner::new();
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("dev");
        let second = temp.path().join("run");
        let third = temp.path().join("cache");

        let mut guard = ResourceGuard::new(&runner);
        guard.mount_tmpfs(&first).unwrap();
        guard.mount_tmpfs(&second).unwrap();
        guard.bind_mount(Path::new("/srv/cache"), &third).unwrap();

        let failures = guard.release_all();
        assert!(failures.is_empty());

        let umounts: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("umount"))
            .collect();
        assert_eq!(umounts.len(), 3);
        assert!(umounts[0].contains("cache"));
        assert!(umounts[1].contains("run"));
        assert!(umounts[2].contains("dev"));
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let runner = FakeRunner::new();
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("dev");

        let mut guard = ResourceGuard::new(&runner);
        guard.mount_tmpfs(&target).unwrap();

        assert!(guard.release_all().is_empty());
        assert!(guard.release_all().is_empty());

        let umounts = runner
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("umount"))
            .count();
        assert_eq!(umounts, 1, "released resources must not be re-released");
    }

    #[test]
    fn test_failed_acquisition_records_nothing() {
        let runner = FakeRunner::new();
        runner.fail_on("mount", 32);
        let temp = TempDir::new().unwrap();

        let mut guard = ResourceGuard::new(&runner);
        let err = guard.mount_tmpfs(&temp.path().join("dev")).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ResourceAcquisitionFailure { .. })
        ));
        assert!(guard.resources().is_empty());
        assert!(guard.release_all().is_empty());
    }

    #[test]
    fn test_confirmed_mount_failure_is_reported_unreleased() {
        let runner = FakeRunner::new();
        runner.fail_on("umount", 32);
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("dev");

        // Fixture mount table that still lists the target as mounted
        let table = temp.path().join("mounts");
        fs::write(&table, format!("tmpfs {} tmpfs rw 0 0\n", target.display())).unwrap();

        let mut guard = ResourceGuard::with_mount_table(&runner, &table);
        guard.mount_tmpfs(&target).unwrap();

        let failures = guard.release_all();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            BuildError::TeardownFailure(ResourceKind::VfsMount, _)
        ));
        assert!(!guard.is_clean());
        assert_eq!(guard.unreleased().len(), 1);
    }

    #[test]
    fn test_failed_umount_of_unmounted_target_counts_as_released() {
        // umount exits non-zero for a target that is not mounted; the
        // mount table is the source of truth.
        let runner = FakeRunner::new();
        runner.fail_on("umount", 32);
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("dev");

        let table = temp.path().join("mounts");
        fs::write(&table, "tmpfs /somewhere/else tmpfs rw 0 0\n").unwrap();

        let mut guard = ResourceGuard::with_mount_table(&runner, &table);
        guard.mount_tmpfs(&target).unwrap();

        assert!(guard.release_all().is_empty());
        assert!(guard.is_clean());
    }

    #[test]
    fn test_device_node_release_removes_file() {
        let runner = FakeRunner::new();
        let temp = TempDir::new().unwrap();
        let dev_dir = temp.path().to_path_buf();
        let node = DeviceNode {
            name: "null",
            mode: 0o666,
            major: 1,
            minor: 3,
        };

        let mut guard = ResourceGuard::new(&runner);
        guard.make_device_node(&dev_dir, &node).unwrap();
        // The fake runner does not create the file; a missing node must
        // still count as released.
        assert!(guard.release_all().is_empty());
        assert!(guard.is_clean());
    }

    #[test]
    fn test_mknod_command_shape() {
        let runner = FakeRunner::new();
        let temp = TempDir::new().unwrap();
        let node = DeviceNode {
            name: "console",
            mode: 0o600,
            major: 5,
            minor: 1,
        };

        let mut guard = ResourceGuard::new(&runner);
        guard.make_device_node(temp.path(), &node).unwrap();

        let call = &runner.calls()[0];
        assert!(call.starts_with("mknod -m 600"));
        assert!(call.ends_with("console c 5 1"));
    }

    #[test]
    fn test_unescape_mount_path() {
        assert_eq!(unescape_mount_path("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }

    #[test]
    fn test_is_mounted_against_fixture_table() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("mounts");
        fs::write(&table, "proc /proc proc rw 0 0\ntmpfs /dev tmpfs rw 0 0\n").unwrap();

        assert!(is_mounted(&table, Path::new("/dev")));
        assert!(!is_mounted(&table, Path::new("/devx")));
    }
}

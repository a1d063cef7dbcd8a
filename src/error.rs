//! Build failure taxonomy.
//!
//! Components propagate `anyhow::Result` in the usual way; the variants
//! here are attached at the point of failure so callers (and tests) can
//! downcast to the precise class of fault.

use std::path::PathBuf;

use thiserror::Error;

use crate::guard::ResourceKind;

/// Classified build failures.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A required external tool is not on PATH. Raised before any
    /// mutating action.
    #[error("'{tool}' is not installed. Please install {package} to continue.")]
    MissingDependency { tool: String, package: String },

    /// The jail path is already occupied. Builds never merge into an
    /// existing tree; the leftover requires manual cleanup.
    #[error("jail directory '{}' already exists; remove it before building", .0.display())]
    EnvironmentAlreadyExists(PathBuf),

    /// An OS call backing a mount, device node, or symlink failed.
    /// The resource is not recorded, so there is nothing to release.
    #[error("failed to acquire {} at '{}': {}", .kind, .target.display(), .reason)]
    ResourceAcquisitionFailure {
        kind: ResourceKind,
        target: PathBuf,
        reason: String,
    },

    /// A named pipeline step failed; the exit code is carried when the
    /// failure came from an external tool.
    #[error("stage '{}' failed{}", .stage, exit_suffix(.exit_code))]
    StageExecutionFailure {
        stage: String,
        exit_code: Option<i32>,
    },

    /// A resource could not be released. Collected rather than thrown so
    /// the remaining releases are still attempted; any of these vetoes
    /// jail deletion.
    #[error("could not release {} at '{}'", .0, .1.display())]
    TeardownFailure(ResourceKind, PathBuf),

    /// The assembler finished but the expected artifact is missing.
    #[error("artifact '{}' was not created", .0.display())]
    ArtifactCreationFailure(PathBuf),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}

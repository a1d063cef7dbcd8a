//! Shared test support: a scriptable fake tool runner and workspace
//! fixtures.

#![allow(dead_code)]

use anyhow::Result;
use std::cell::RefCell;
use std::fs;
use std::path::Path;

use live_builder::config::BuilderConfig;
use live_builder::context::BuildContext;
use live_builder::process::{ExitOutcome, Invocation, ToolRunner};
use time::{Date, Month};

type Effect = Box<dyn Fn(&Invocation)>;

/// Records every invocation. Commands succeed by default; failures,
/// canned stdout, and filesystem side effects are keyed on a substring of
/// the rendered command line.
pub struct FakeRunner {
    calls: RefCell<Vec<String>>,
    failures: RefCell<Vec<(String, i32)>>,
    outputs: RefCell<Vec<(String, Vec<u8>)>>,
    effects: RefCell<Vec<(String, Effect)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            failures: RefCell::new(Vec::new()),
            outputs: RefCell::new(Vec::new()),
            effects: RefCell::new(Vec::new()),
        }
    }

    /// Commands whose line contains `marker` exit with `code`.
    pub fn fail_on(&self, marker: &str, code: i32) {
        self.failures.borrow_mut().push((marker.to_string(), code));
    }

    /// Commands whose line contains `marker` produce this stdout.
    pub fn output_for(&self, marker: &str, bytes: &[u8]) {
        self.outputs
            .borrow_mut()
            .push((marker.to_string(), bytes.to_vec()));
    }

    /// Run a side effect when a matching command executes, standing in
    /// for the files a real tool would have created.
    pub fn on(&self, marker: &str, effect: impl Fn(&Invocation) + 'static) {
        self.effects
            .borrow_mut()
            .push((marker.to_string(), Box::new(effect)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn saw(&self, marker: &str) -> bool {
        self.calls.borrow().iter().any(|line| line.contains(marker))
    }
}

impl ToolRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExitOutcome> {
        let line = invocation.command_line();
        self.calls.borrow_mut().push(line.clone());

        for (marker, effect) in self.effects.borrow().iter() {
            if line.contains(marker.as_str()) {
                effect(invocation);
            }
        }

        let code = self
            .failures
            .borrow()
            .iter()
            .find(|(marker, _)| line.contains(marker.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        let stdout = self
            .outputs
            .borrow()
            .iter()
            .find(|(marker, _)| line.contains(marker.as_str()))
            .map(|(_, bytes)| bytes.clone())
            .unwrap_or_default();

        Ok(ExitOutcome {
            code,
            stdout,
            stderr: if code == 0 {
                String::new()
            } else {
                "simulated failure".to_string()
            },
        })
    }
}

/// A workspace with branding assets and a config whose caches stay
/// inside the workspace.
pub fn workspace_config(workspace: &Path) -> BuilderConfig {
    fs::create_dir_all(workspace.join("branding/plymouth")).unwrap();
    fs::write(
        workspace.join("branding/plymouth/rescueos.plymouth"),
        "[Plymouth Theme]\nName=RescueOS\n",
    )
    .unwrap();

    let mut config = BuilderConfig::default();
    config.cache_dir = Some(workspace.join("cache"));
    config
}

/// Context pinned to a fixed build date for deterministic paths.
pub fn fixed_context(workspace: &Path, config: &BuilderConfig) -> BuildContext {
    BuildContext::new(
        workspace,
        config,
        Date::from_calendar_date(2026, Month::August, 6).unwrap(),
    )
}

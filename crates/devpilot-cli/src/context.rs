use anyhow::Result;
use devpilot_core::AppConfig;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Command-line flags that override the layered settings.
pub(crate) struct Overrides {
    pub json: bool,
    pub verbose: bool,
    pub model: Option<String>,
    pub max_iterations: Option<u64>,
    pub no_input: bool,
}

pub(crate) struct RunContext {
    pub workspace: PathBuf,
    pub cfg: AppConfig,
    pub json: bool,
    /// Prompts are allowed: stdin is a terminal and `--no-input` is off.
    pub interactive: bool,
}

impl RunContext {
    pub fn load(workspace: &Path, overrides: Overrides) -> Result<Self> {
        let mut cfg = AppConfig::ensure(workspace)?;
        apply_overrides(&mut cfg, &overrides);
        Ok(Self {
            workspace: workspace.to_path_buf(),
            cfg,
            json: overrides.json,
            interactive: !overrides.no_input && std::io::stdin().is_terminal(),
        })
    }
}

fn apply_overrides(cfg: &mut AppConfig, overrides: &Overrides) {
    if let Some(model) = overrides.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        cfg.llm.model = model.to_string();
    }
    if let Some(max) = overrides.max_iterations {
        cfg.agent_loop.max_iterations = max.max(1);
    }
    if overrides.verbose {
        cfg.observe.verbose = true;
    }
}

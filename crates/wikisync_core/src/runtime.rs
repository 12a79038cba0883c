use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{DEFAULT_EXPAND_LEVEL, DEFAULT_SEPARATOR, DEFAULT_WIKI_DIR, WikiConfig};
use crate::filesystem::{display_path, ensure_dir, write_text_atomic};

pub const STATE_DIRNAME: &str = ".wikisync";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Local wiki tree for `config`, relative paths anchored at the project root.
    pub fn wiki_dir(&self, config: &WikiConfig) -> PathBuf {
        absolutize(Path::new(config.wiki_dir()), &self.project_root)
    }

    /// Resolve a user-supplied path (flag or config value) against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        absolutize(path, &self.project_root)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})",
            display_path(&self.project_root),
            self.root_source.as_str(),
            display_path(&self.state_dir),
            display_path(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let (project_root, root_source) = if let Some(path) = overrides.project_root.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup("WIKISYNC_PROJECT_ROOT") {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else if let Some(found) = detect_project_root(&context.cwd) {
        (found, ValueSource::Heuristic)
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };

    let state_dir = project_root.join(STATE_DIRNAME);
    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup("WIKISYNC_CONFIG") {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        config_path,
        root_source,
        config_source,
    })
}

/// Create `.wikisync/` and the default wiki directory, and write a commented
/// config unless one already exists (or `force` is set).
pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let wiki_dir = paths.project_root.join(DEFAULT_WIKI_DIR);
    for dir in [&paths.state_dir, &wiki_dir] {
        if !dir.exists() {
            ensure_dir(dir)?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if paths.config_path.exists() && !options.force {
        false
    } else {
        write_text_atomic(&paths.config_path, &render_materialized_config())?;
        true
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# wikisync configuration (materialized by `wikisync init`)\n# The API key is read from BACKLOG_API_KEY (a .env file works too).\n\n[remote]\n# space_url = \"https://your-space.backlog.com\"\n# project_key = \"PROJECT\"\n# wiki_prefix = \"Parent/Child\"\n# user_agent = \"wikisync/0.1\"\n\n[local]\nwiki_dir = \"{DEFAULT_WIKI_DIR}\"\n\n[flatten]\n# output_dir = \"../project.wiki\"\nseparator = \"{DEFAULT_SEPARATOR}\"\nexpand_level = {DEFAULT_EXPAND_LEVEL}\nclean = false\n"
    )
}

fn detect_project_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| {
            candidate.join(STATE_DIRNAME).is_dir() || candidate.join(DEFAULT_WIKI_DIR).is_dir()
        })
        .map(Path::to_path_buf)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

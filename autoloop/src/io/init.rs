//! Initialization helpers for `.autoloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{LoopConfig, write_config};

/// All canonical paths within `.autoloop/` for a working directory.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub loop_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub stream_log_path: PathBuf,
    pub pause_marker_path: PathBuf,
    pub stop_marker_path: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let loop_dir = root.join(".autoloop");
        Self {
            root: root.clone(),
            loop_dir: loop_dir.clone(),
            iterations_dir: loop_dir.join("iterations"),
            gitignore_path: loop_dir.join(".gitignore"),
            config_path: loop_dir.join("config.toml"),
            checkpoint_path: loop_dir.join("checkpoint.json"),
            stream_log_path: loop_dir.join("stream.log"),
            pause_marker_path: loop_dir.join("PAUSE"),
            stop_marker_path: loop_dir.join("STOP"),
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing loop-owned files.
    pub force: bool,
}

/// Create `.autoloop/` scaffolding in `root`.
///
/// Fails if `.autoloop/config.toml` already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<LoopPaths> {
    let paths = LoopPaths::new(root);
    if paths.loop_dir.exists() && !paths.loop_dir.is_dir() {
        return Err(anyhow!("init: .autoloop exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.loop_dir)?;
    create_dir(&paths.iterations_dir)?;
    write_file(&paths.gitignore_path, LOOP_GITIGNORE)?;
    write_config(&paths.config_path, &LoopConfig::default())?;

    Ok(paths)
}

/// Make sure the directories the loop writes into exist.
pub fn ensure_layout(paths: &LoopPaths) -> Result<()> {
    create_dir(&paths.loop_dir)?;
    create_dir(&paths.iterations_dir)?;
    if !paths.gitignore_path.exists() {
        write_file(&paths.gitignore_path, LOOP_GITIGNORE)?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const LOOP_GITIGNORE: &str = "iterations/\nstream.log\ncheckpoint.json\nPAUSE\nSTOP\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.loop_dir.is_dir());
        assert!(paths.iterations_dir.is_dir());
        assert!(paths.config_path.is_file());
        let gitignore = fs::read_to_string(&paths.gitignore_path).expect("read gitignore");
        assert_eq!(gitignore, LOOP_GITIGNORE);
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workspace(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_iterations = 7\n").expect("write custom");

        init_workspace(temp.path(), &InitOptions { force: true }).expect("re-init");
        let config = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(config.contains("max_iterations = 100"));
    }
}

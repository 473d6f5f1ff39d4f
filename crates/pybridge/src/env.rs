//! Resolves the worker executable path from `pythonPath`/`virtualEnv`/`cwd` inputs.
//!
//! Mirrors the shape of the teacher's `CommandEnvironment` (home.rs): a small struct computed
//! once at pool construction time, with an `apply` method that installs the resolved pieces
//! onto a [`tokio::process::Command`] before spawn.

use std::path::{Path, PathBuf};

use tokio::process::Command;

const DEFAULT_PYTHON_NAMES: &[&str] = &["python3", "python"];

/// Inputs accepted from [`crate::builder::BridgeConfig`] for resolving the worker binary.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvInputs {
    pub python_path: Option<PathBuf>,
    pub virtual_env: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// The resolved worker executable plus the environment/cwd to spawn it with.
#[derive(Debug, Clone)]
pub struct ResolvedProcessEnv {
    pub executable: PathBuf,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ResolvedProcessEnv {
    /// Resolves the worker executable per spec §4.7:
    /// 1. `virtualEnv` set and `pythonPath` unset (or a bare default name) → venv's `bin`/`Scripts`.
    /// 2. `pythonPath` set → used verbatim.
    /// 3. Otherwise → the platform-default name, resolved via `PATH` at spawn time.
    pub fn resolve(inputs: &ProcessEnvInputs) -> Self {
        let python_path_is_default = inputs
            .python_path
            .as_ref()
            .map(|p| is_default_python_name(p))
            .unwrap_or(true);

        let executable = if let (Some(venv), true) = (&inputs.virtual_env, python_path_is_default) {
            venv_executable(venv)
        } else if let Some(explicit) = &inputs.python_path {
            explicit.clone()
        } else {
            PathBuf::from(platform_default_name())
        };

        Self {
            executable,
            cwd: inputs.cwd.clone(),
            env: inputs.env.clone(),
        }
    }

    /// Applies the resolved cwd/env onto a freshly built [`Command`]. Does not set the
    /// executable itself; callers build `Command::new(&resolved.executable)` first so this can
    /// be reused for a [`Command`] already under construction.
    pub fn apply(&self, command: &mut Command) {
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
    }
}

fn is_default_python_name(path: &Path) -> bool {
    match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => DEFAULT_PYTHON_NAMES.contains(&name),
        None => false,
    }
}

#[cfg(windows)]
fn venv_executable(venv_root: &Path) -> PathBuf {
    venv_root.join("Scripts").join("python.exe")
}

#[cfg(not(windows))]
fn venv_executable(venv_root: &Path) -> PathBuf {
    venv_root.join("bin").join("python3")
}

#[cfg(windows)]
fn platform_default_name() -> &'static str {
    "python.exe"
}

#[cfg(not(windows))]
fn platform_default_name() -> &'static str {
    "python3"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_venv_when_python_path_unset() {
        let inputs = ProcessEnvInputs {
            virtual_env: Some(PathBuf::from("/srv/venv")),
            ..Default::default()
        };
        let resolved = ResolvedProcessEnv::resolve(&inputs);
        assert_eq!(resolved.executable, venv_executable(Path::new("/srv/venv")));
    }

    #[test]
    fn resolves_venv_when_python_path_is_bare_default_name() {
        let inputs = ProcessEnvInputs {
            virtual_env: Some(PathBuf::from("/srv/venv")),
            python_path: Some(PathBuf::from("python3")),
            ..Default::default()
        };
        let resolved = ResolvedProcessEnv::resolve(&inputs);
        assert_eq!(resolved.executable, venv_executable(Path::new("/srv/venv")));
    }

    #[test]
    fn explicit_python_path_wins_over_venv() {
        let inputs = ProcessEnvInputs {
            virtual_env: Some(PathBuf::from("/srv/venv")),
            python_path: Some(PathBuf::from("/opt/special/python")),
            ..Default::default()
        };
        let resolved = ResolvedProcessEnv::resolve(&inputs);
        assert_eq!(resolved.executable, PathBuf::from("/opt/special/python"));
    }

    #[test]
    fn falls_back_to_platform_default() {
        let resolved = ResolvedProcessEnv::resolve(&ProcessEnvInputs::default());
        assert_eq!(resolved.executable, PathBuf::from(platform_default_name()));
    }

    #[test]
    fn carries_cwd_and_env_through() {
        let inputs = ProcessEnvInputs {
            cwd: Some(PathBuf::from("/work")),
            env: vec![("FOO".into(), "bar".into())],
            ..Default::default()
        };
        let resolved = ResolvedProcessEnv::resolve(&inputs);
        assert_eq!(resolved.cwd, Some(PathBuf::from("/work")));
        assert_eq!(resolved.env, vec![("FOO".to_string(), "bar".to_string())]);
    }
}

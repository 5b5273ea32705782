//! The settings-file format.
//!
//! Grounded in `internal/kclvm_py/config/settings.py`'s `load_settings_files`
//! (`original_source/`): a YAML document with a `kcl_cli_configs` block and a
//! `kcl_options` list, loaded once per CLI invocation and merged into the
//! runtime's cli-config record. `${KCL_MOD}` inside a file path expands to
//! the package root found by walking upward from the working directory for a
//! package marker (`kcl.mod`), the same resolution `settings.py`'s
//! `GetPkgRoot` performs.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{ErrorKind, KclError, Span};

const KCL_MOD_MARKER: &str = "kcl.mod";
const KCL_MOD_PATH_ENV: &str = "${KCL_MOD}";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CliConfigs {
    pub files: Vec<String>,
    pub output: Option<String>,
    pub overrides: Vec<String>,
    pub path_selector: Vec<String>,
    pub strict_range_check: bool,
    pub disable_none: bool,
    pub verbose: Option<u8>,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KclOption {
    pub key: String,
    pub value: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub kcl_cli_configs: CliConfigs,
    pub kcl_options: Vec<KclOption>,
}

/// Parses `text` as a settings file, rejecting a top-level scalar or list —
/// only a mapping with `kcl_cli_configs`/`kcl_options` keys is a valid
/// document.
pub fn parse(text: &str, source: &str) -> Result<Settings, KclError> {
    let raw: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|err| KclError::new(ErrorKind::InvalidSyntax, Span::dummy(), format!("{source}: {err}")))?;
    if !matches!(raw, serde_yaml::Value::Mapping(_)) {
        return Err(KclError::new(
            ErrorKind::IllegalArgumentError,
            Span::dummy(),
            format!("{source}: a settings file must be a top-level mapping, not a scalar or list"),
        ));
    }
    serde_yaml::from_value(raw).map_err(|err| KclError::new(ErrorKind::InvalidSyntax, Span::dummy(), format!("{source}: {err}")))
}

/// Reads and parses a settings file from disk, then expands `${KCL_MOD}` in
/// every `files` entry against the package root located from `work_dir`.
pub fn load(path: &Path, work_dir: &Path) -> Result<Settings, KclError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| KclError::new(ErrorKind::CannotFindModule, Span::dummy(), format!("cannot read settings file {}: {err}", path.display())))?;
    let mut settings = parse(&text, &path.display().to_string())?;
    let pkg_root = find_package_root(work_dir);
    for file in &mut settings.kcl_cli_configs.files {
        *file = expand_kcl_mod(file, pkg_root.as_deref());
    }
    Ok(settings)
}

/// Replaces `${KCL_MOD}` with the located package root; an unresolved root
/// expands to the empty string, matching `settings.py`'s `or ""` fallback.
#[must_use]
pub fn expand_kcl_mod(path: &str, pkg_root: Option<&Path>) -> String {
    let root = pkg_root.map_or_else(String::new, |p| p.display().to_string());
    path.replace(KCL_MOD_PATH_ENV, &root)
}

/// Walks upward from `start` looking for a `kcl.mod` package marker file,
/// returning the directory that contains it.
#[must_use]
pub fn find_package_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(KCL_MOD_MARKER).is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_scalar_is_rejected() {
        let err = parse("just-a-string", "settings.yaml").unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgumentError);
    }

    #[test]
    fn top_level_list_is_rejected() {
        let err = parse("- a\n- b\n", "settings.yaml").unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgumentError);
    }

    #[test]
    fn mapping_parses_cli_configs_and_options() {
        let text = "kcl_cli_configs:\n  files:\n    - a.k\n  strict_range_check: true\nkcl_options:\n  - key: env\n    value: prod\n";
        let settings = parse(text, "settings.yaml").unwrap();
        assert_eq!(settings.kcl_cli_configs.files, vec!["a.k".to_owned()]);
        assert!(settings.kcl_cli_configs.strict_range_check);
        assert_eq!(settings.kcl_options[0].key, "env");
    }

    #[test]
    fn kcl_mod_expands_to_located_package_root() {
        let root = Path::new("/workspace/pkg");
        assert_eq!(expand_kcl_mod("${KCL_MOD}/a.k", Some(root)), "/workspace/pkg/a.k");
        assert_eq!(expand_kcl_mod("${KCL_MOD}/a.k", None), "/a.k");
    }
}

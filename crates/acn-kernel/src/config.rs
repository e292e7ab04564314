//! Loading `AcnConfig` from `~/.acn/config.toml`.
//!
//! A config file may list other TOML files under `include = [...]`. Included
//! files are merged first, in order, and the including file overrides them.
//! Include paths must be relative and stay inside the including file's
//! directory. Any failure falls back to defaults with a warning: a node
//! always gets a config, and `AcnConfig::validate` decides if it is usable.

use acn_types::config::AcnConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load node configuration, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> AcnConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return AcnConfig::default();
    }

    match read_merged(&config_path) {
        Ok(value) => match value.try_into::<AcnConfig>() {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to deserialize merged config, using defaults"
                );
                AcnConfig::default()
            }
        },
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to load config, using defaults");
            AcnConfig::default()
        }
    }
}

/// Parse `path` and resolve its includes into a single TOML value.
fn read_merged(path: &Path) -> Result<toml::Value, String> {
    let mut root = read_toml(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));

    // A broken include degrades to the root file alone.
    if let Err(e) = IncludeResolver::new(&mut visited).resolve(&mut root, &dir, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
        strip_include(&mut root);
    }
    Ok(root)
}

fn read_toml(path: &Path) -> Result<toml::Value, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
    toml::from_str(&contents).map_err(|e| format!("cannot parse '{}': {e}", path.display()))
}

/// Remove and return the `include` list of a table.
fn strip_include(value: &mut toml::Value) -> Vec<String> {
    let Some(table) = value.as_table_mut() else {
        return Vec::new();
    };
    match table.remove("include") {
        Some(toml::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

struct IncludeResolver<'a> {
    visited: &'a mut HashSet<PathBuf>,
}

impl<'a> IncludeResolver<'a> {
    fn new(visited: &'a mut HashSet<PathBuf>) -> Self {
        Self { visited }
    }

    /// Replace `value` with its includes merged underneath it.
    fn resolve(&mut self, value: &mut toml::Value, dir: &Path, depth: u32) -> Result<(), String> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(format!(
                "include depth exceeds the maximum of {MAX_INCLUDE_DEPTH}"
            ));
        }
        let includes = strip_include(value);
        if includes.is_empty() {
            return Ok(());
        }

        let mut merged = toml::Value::Table(toml::map::Map::new());
        for include in &includes {
            let path = self.check(include, dir)?;
            info!(include = %include, "Loading config include");
            let mut included = read_toml(&path)?;
            let include_dir = path.parent().unwrap_or(dir).to_path_buf();
            self.resolve(&mut included, &include_dir, depth + 1)?;
            deep_merge_toml(&mut merged, &included);
        }
        deep_merge_toml(&mut merged, value);
        *value = merged;
        Ok(())
    }

    /// Canonical path of an include, rejecting anything outside `dir`.
    fn check(&mut self, include: &str, dir: &Path) -> Result<PathBuf, String> {
        let relative = Path::new(include);
        if relative.is_absolute() {
            return Err(format!("absolute include path rejected: {include}"));
        }
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("include path traversal rejected: {include}"));
        }

        let canonical = std::fs::canonicalize(dir.join(relative))
            .map_err(|e| format!("include '{include}' cannot be resolved: {e}"))?;
        let canonical_dir = std::fs::canonicalize(dir)
            .map_err(|e| format!("config dir cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("include '{include}' escapes the config directory"));
        }
        if !self.visited.insert(canonical.clone()) {
            return Err(format!("circular include: {include}"));
        }
        Ok(canonical)
    }
}

/// Deep-merge `overlay` into `base`. Tables merge key by key, anything else
/// is replaced.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.acn`, or a directory under the temp dir when there is no home.
pub fn acn_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".acn")
}

pub fn default_config_path() -> PathBuf {
    acn_home().join("config.toml")
}

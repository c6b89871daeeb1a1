// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/runa/config.yaml"));
    paths.push(PathBuf::from("/etc/runa/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/runa/config.yaml"));
        paths.push(home.join(".config/runa/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("runa/config.yaml"));
        paths.push(cfg.join("runa/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".runa/config.yaml"));
    paths.push(PathBuf::from(".runa/config.yml"));
    paths.push(PathBuf::from(".runa.yaml"));
    paths.push(PathBuf::from(".runa.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_without_files_returns_defaults() {
        // An explicit path is not given; system/user paths may or may not
        // exist on the test machine, but a missing set must not error.
        let cfg = load(None).unwrap();
        assert!(!cfg.model.provider.is_empty());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: local\n  name: llama3.2").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.provider, "local");
        assert_eq!(cfg.model.name, "llama3.2");
    }

    #[test]
    fn explicit_file_with_bad_yaml_errors() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model: [unclosed").unwrap();
        assert!(load(Some(f.path())).is_err());
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = serde_yaml::from_str::<serde_yaml::Value>("a: 1").unwrap();
        let src = serde_yaml::from_str::<serde_yaml::Value>("a: 2").unwrap();
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"], serde_yaml::Value::from(2));
    }

    #[test]
    fn merge_keeps_unrelated_keys() {
        let mut dst = serde_yaml::from_str::<serde_yaml::Value>("a: 1\nb: 2").unwrap();
        let src = serde_yaml::from_str::<serde_yaml::Value>("b: 3").unwrap();
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"], serde_yaml::Value::from(1));
        assert_eq!(dst["b"], serde_yaml::Value::from(3));
    }

    #[test]
    fn merge_nested_mappings() {
        let mut dst =
            serde_yaml::from_str::<serde_yaml::Value>("model:\n  provider: native\n  name: a")
                .unwrap();
        let src = serde_yaml::from_str::<serde_yaml::Value>("model:\n  name: b").unwrap();
        merge_yaml(&mut dst, src);
        assert_eq!(dst["model"]["provider"], serde_yaml::Value::from("native"));
        assert_eq!(dst["model"]["name"], serde_yaml::Value::from("b"));
    }
}

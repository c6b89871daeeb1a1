// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Trust decision recorded for a workspace folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Trust this folder.
    TrustFolder,
    /// Trust the parent folder (covers sibling checkouts).
    TrustParent,
    /// Never trust this folder.
    DoNotTrust,
}

/// Persisted mapping of absolute folder path → trust decision.
///
/// The file lives under the user config dir and survives sessions; session
/// conversation history deliberately does not.
#[derive(Debug, Default)]
pub struct TrustStore {
    path: PathBuf,
    entries: HashMap<PathBuf, TrustLevel>,
}

impl TrustStore {
    /// Default on-disk location (`<config dir>/runa/trusted_folders.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("runa/trusted_folders.json"))
    }

    /// Load the store from `path`, starting empty when the file is missing.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let entries = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, folder: &Path) -> Option<TrustLevel> {
        self.entries.get(folder).copied()
    }

    /// Effective trust for `folder`, honouring `TrustParent` entries on any
    /// ancestor.  An explicit entry on the folder itself wins.
    pub fn is_trusted(&self, folder: &Path) -> bool {
        match self.entries.get(folder) {
            Some(TrustLevel::TrustFolder) | Some(TrustLevel::TrustParent) => return true,
            Some(TrustLevel::DoNotTrust) => return false,
            None => {}
        }
        folder
            .ancestors()
            .skip(1)
            .any(|a| self.entries.get(a) == Some(&TrustLevel::TrustParent))
    }

    pub fn set(&mut self, folder: PathBuf, level: TrustLevel) {
        self.entries.insert(folder, level);
    }

    /// Write the store back to disk, creating parent directories as needed.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

/// Remove the cached credential file, if any.
///
/// The cache contents are opaque to the runtime; this is the only operation
/// the core exposes on it.
pub fn clear_cached_credentials() -> anyhow::Result<()> {
    if let Some(dir) = dirs::config_dir() {
        let path = dir.join("runa/credentials.json");
        if path.is_file() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

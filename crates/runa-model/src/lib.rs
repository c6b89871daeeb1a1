// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod extract;
pub mod retry;
mod error;
mod local;
mod mock;
mod native;
mod provider;
mod types;

pub use error::ModelError;
pub use local::LocalGenerator;
pub use mock::{MockGenerator, Script, ScriptedGenerator};
pub use native::NativeGenerator;
pub use provider::{ContentGenerator, ResponseStream};
pub use types::*;

use runa_config::ModelConfig;

/// Construct a boxed [`ContentGenerator`] from configuration.
///
/// Selects the driver by `cfg.provider`: `"native"` (hosted function-calling
/// API), `"local"` (self-hosted `/api/chat` server), or `"mock"` (tests).
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ContentGenerator>> {
    match cfg.provider.as_str() {
        "native" => Ok(Box::new(NativeGenerator::new(
            resolve_api_key(cfg),
            cfg.base_url.clone(),
            cfg.embedding_model.clone(),
        ))),
        "local" => Ok(Box::new(LocalGenerator::new(
            cfg.base_url.clone(),
            cfg.embedding_model.clone(),
        ))),
        "mock" => Ok(Box::new(MockGenerator)),
        other => anyhow::bail!(
            "unknown model provider: {other:?} (expected \"native\", \"local\" or \"mock\")"
        ),
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    std::env::var("GEMINI_API_KEY").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_native_succeeds() {
        assert!(from_config(&cfg("native")).is_ok());
    }

    #[test]
    fn from_config_local_succeeds() {
        assert!(from_config(&cfg("local")).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        assert!(from_config(&cfg("mock")).is_ok());
    }

    #[test]
    fn from_config_unknown_provider_errors() {
        let err = from_config(&cfg("nope")).err().unwrap().to_string();
        assert!(err.contains("unknown model provider"));
    }

    #[test]
    fn explicit_api_key_preferred_over_env() {
        let mut c = cfg("native");
        c.api_key = Some("explicit".into());
        c.api_key_env = Some("SOME_UNSET_VAR_XYZ".into());
        assert_eq!(resolve_api_key(&c).as_deref(), Some("explicit"));
    }
}

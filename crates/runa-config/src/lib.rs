// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod cancel;
pub mod loader;
pub mod schema;
pub mod trust;

pub use cancel::CancelToken;
pub use loader::load;
pub use schema::{
    AgentConfig, ApprovalMode, AuthKind, Config, ModelConfig, ToolsConfig,
};
pub use trust::{clear_cached_credentials, TrustLevel, TrustStore};

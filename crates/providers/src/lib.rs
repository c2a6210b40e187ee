//! LLM provider implementations for turnloop.
//!
//! All providers implement the `turnloop_core::Provider` trait.
//! The router selects the correct provider based on configuration.

pub mod anthropic;
pub mod router;
pub mod scripted;

pub use anthropic::AnthropicProvider;
pub use router::{ProviderRouter, build_from_config, build_provider};
pub use scripted::{ScriptStep, ScriptedProvider, TurnScript};

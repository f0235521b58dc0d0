//! LLM integration.
//!
//! [`LlmProvider`] is the seam the classifier talks to. The only concrete
//! backend is an OpenAI-compatible chat-completions client.

mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::ClassifierConfig;

/// Build the configured provider, or `None` when no API key is set.
pub fn create_provider(config: &ClassifierConfig) -> Option<Arc<dyn LlmProvider>> {
    let api_key = config.api_key.clone()?;
    tracing::info!("Using OpenAI-compatible provider (model: {})", config.model);
    Some(Arc::new(OpenAiProvider::new(
        api_key,
        config.base_url.clone(),
        config.model.clone(),
    )))
}

pub mod providers;
pub mod registry;
pub mod streaming;

use std::sync::Arc;

use tracing::warn;

use relay_core::config::ModelConfig;
use relay_core::error::Result;
use relay_core::traits::LlmProvider;

pub use providers::openai::OpenAiProvider;
pub use registry::ProviderRegistry;

/// Build a provider client for a model binding. Every supported provider speaks
/// the OpenAI chat-completions protocol.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn LlmProvider>> {
    let endpoint = providers::presets::resolve_endpoint(&config.provider, config.base_url.as_deref())?;
    if endpoint.needs_api_key && config.api_key.as_deref().map_or(true, str::is_empty) {
        warn!(provider = %config.provider, "No API key configured; requests will likely be rejected");
    }
    Ok(Arc::new(
        OpenAiProvider::new(config.provider.clone(), endpoint.url)
            .with_api_key(config.api_key.clone())
            .with_headers(endpoint.extra_headers),
    ))
}

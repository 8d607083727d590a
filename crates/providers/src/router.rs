//! Provider selection: builds the configured model service.

use devassist_config::AppConfig;
use devassist_core::error::ProviderError;
use devassist_core::provider::ModelProvider;
use std::sync::Arc;
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;

/// Build the model provider named in the configuration.
///
/// Every supported backend speaks the OpenAI-compatible protocol; the name
/// only picks the default endpoint when `provider.api_url` is left empty.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn ModelProvider>, ProviderError> {
    let name = config.provider.name.as_str();
    let base_url = if config.provider.api_url.is_empty() {
        default_base_url(name).ok_or_else(|| {
            ProviderError::NotConfigured(format!("no endpoint known for provider '{name}'"))
        })?
    } else {
        config.provider.api_url.clone()
    };

    let api_key = config.api_key.clone().unwrap_or_default();
    if api_key.is_empty() && name != "ollama" && name != "vllm" {
        return Err(ProviderError::NotConfigured(
            "no API key set (api_key in config.toml or DEVASSIST_API_KEY)".into(),
        ));
    }

    debug!(provider = name, base_url = %base_url, "Building model provider");
    let provider = OpenAiCompatProvider::new(name, base_url, api_key)
        .with_timeout(config.provider.timeout_secs);
    Ok(Arc::new(provider))
}

/// Default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> Option<String> {
    let url = match provider_name {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "vllm" => "http://localhost:8000/v1",
        _ => return None,
    };
    Some(url.to_string())
}

//! Provider selection for completions.

use loomweave_assets::LlmConfig;
use loomweave_config::LlmSettings;
use loomweave_core::Provider;
use loomweave_pipeline::{PipelineError, ProviderSource, ResolvedModel, merge_llm};
use loomweave_providers::OpenAiCompatProvider;
use std::sync::Arc;
use tracing::debug;

/// Resolves the configured endpoint, or a per-character `llm_config`
/// pointing somewhere else.
///
/// Requests that keep the configured endpoint share one provider; a
/// different `base_url` or key gets a provider built on the shared client.
pub struct ConfiguredProviders {
    settings: LlmSettings,
    default: Arc<dyn Provider>,
    client: reqwest::Client,
}

impl ConfiguredProviders {
    pub fn new(settings: LlmSettings, client: reqwest::Client) -> Self {
        let default: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::with_client(
            "default",
            &settings.base_url,
            settings.api_key.clone(),
            client.clone(),
        ));
        Self {
            settings,
            default,
            client,
        }
    }
}

impl ProviderSource for ConfiguredProviders {
    fn resolve(&self, overrides: Option<&LlmConfig>) -> Result<ResolvedModel, PipelineError> {
        let merged = merge_llm(&self.settings, overrides);
        let provider = if merged.base_url == self.settings.base_url
            && merged.api_key == self.settings.api_key
        {
            self.default.clone()
        } else {
            debug!(base_url = %merged.base_url, "Using per-request endpoint");
            Arc::new(OpenAiCompatProvider::with_client(
                "override",
                &merged.base_url,
                merged.api_key.clone(),
                self.client.clone(),
            )) as Arc<dyn Provider>
        };
        Ok(ResolvedModel {
            provider,
            model: merged.model,
            temperature: merged.temperature,
            max_tokens: merged.max_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_is_shared() {
        let source = ConfiguredProviders::new(LlmSettings::default(), reqwest::Client::new());
        let overrides = LlmConfig {
            model: Some("gpt-4o".into()),
            temperature: Some(0.2),
            ..Default::default()
        };
        let resolved = source.resolve(Some(&overrides)).unwrap();
        assert_eq!(resolved.model, "gpt-4o");
        assert_eq!(resolved.temperature, 0.2);
        assert_eq!(resolved.provider.name(), "default");
    }

    #[test]
    fn other_endpoint_gets_own_provider() {
        let source = ConfiguredProviders::new(LlmSettings::default(), reqwest::Client::new());
        let overrides = LlmConfig {
            base_url: Some("http://localhost:8080/v1".into()),
            ..Default::default()
        };
        let resolved = source.resolve(Some(&overrides)).unwrap();
        assert_eq!(resolved.provider.name(), "override");
        assert_eq!(resolved.model, LlmSettings::default().model);
    }
}

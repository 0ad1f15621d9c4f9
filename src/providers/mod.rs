// src/providers/mod.rs
//! Generation-provider collaborators.
//!
//! Every remote generative backend is reached through the same capability
//! trait: structured input in, `{result, cost}` out. Which backend serves
//! which capability is decided by configuration, not by per-backend
//! subclassing; a provider is just a retrying client pointed at an endpoint.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;

use crate::error::PipelineError;

pub mod fanout;
pub mod remote;

use remote::{HttpTransport, RemoteClient};

/// Result of one provider call.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub result: Value,
    pub cost: Decimal,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Service name used for cost records and error messages.
    fn service(&self) -> &str;

    async fn generate(&self, input: Value) -> Result<ProviderOutput, PipelineError>;
}

/// A remote backend behind the retrying client.
pub struct RemoteProvider {
    client: RemoteClient,
    endpoint: String,
    service: String,
}

impl RemoteProvider {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let service = service.into();
        let transport = Arc::new(HttpTransport::new(api_key));
        Self {
            client: RemoteClient::new(service.clone(), transport),
            endpoint: endpoint.into(),
            service,
        }
    }
}

#[async_trait]
impl GenerationProvider for RemoteProvider {
    fn service(&self) -> &str {
        &self.service
    }

    async fn generate(&self, input: Value) -> Result<ProviderOutput, PipelineError> {
        let (result, cost) = self.client.invoke("POST", &self.endpoint, &input).await?;
        Ok(ProviderOutput { result, cost })
    }
}

/// The set of configured generation backends, one per pipeline capability.
#[derive(Clone, Default)]
pub struct ProviderCatalog {
    pub script: Option<Arc<dyn GenerationProvider>>,
    pub image: Option<Arc<dyn GenerationProvider>>,
    pub voice: Option<Arc<dyn GenerationProvider>>,
    pub clip: Option<Arc<dyn GenerationProvider>>,
}

impl ProviderCatalog {
    /// Build the catalog from `<NAME>_PROVIDER_URL` / `<NAME>_PROVIDER_KEY`
    /// environment pairs. A missing backend disables that capability with a
    /// warning rather than failing startup.
    pub fn from_env() -> Self {
        Self {
            script: Self::provider_from_env("script", "SCRIPT_PROVIDER_URL", "SCRIPT_PROVIDER_KEY"),
            image: Self::provider_from_env("image", "IMAGE_PROVIDER_URL", "IMAGE_PROVIDER_KEY"),
            voice: Self::provider_from_env("voice", "VOICE_PROVIDER_URL", "VOICE_PROVIDER_KEY"),
            clip: Self::provider_from_env("clip", "CLIP_PROVIDER_URL", "CLIP_PROVIDER_KEY"),
        }
    }

    fn provider_from_env(service: &str, url_var: &str, key_var: &str) -> Option<Arc<dyn GenerationProvider>> {
        match std::env::var(url_var) {
            Ok(endpoint) if !endpoint.is_empty() => {
                tracing::info!("Initializing {} generation provider...", service);
                let api_key = std::env::var(key_var).ok().filter(|k| !k.is_empty());
                Some(Arc::new(RemoteProvider::new(service, endpoint, api_key)))
            }
            _ => {
                tracing::warn!(
                    "{} not set. {} generation will be disabled.",
                    url_var,
                    service
                );
                None
            }
        }
    }

    pub fn require(&self, service: &str) -> Result<Arc<dyn GenerationProvider>, PipelineError> {
        let slot = match service {
            "script" => self.script.as_ref(),
            "image" => self.image.as_ref(),
            "voice" => self.voice.as_ref(),
            "clip" => self.clip.as_ref(),
            _ => None,
        };
        slot.cloned().ok_or_else(|| PipelineError::NotConfigured {
            service: service.to_string(),
        })
    }

    pub fn configured(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.script.is_some() {
            names.push("script");
        }
        if self.image.is_some() {
            names.push("image");
        }
        if self.voice.is_some() {
            names.push("voice");
        }
        if self.clip.is_some() {
            names.push("clip");
        }
        names
    }
}

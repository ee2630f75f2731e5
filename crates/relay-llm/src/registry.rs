use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use relay_core::config::ModelConfig;
use relay_core::error::Result;
use relay_core::traits::LlmProvider;

use crate::create_provider;

struct CachedProvider {
    provider: Arc<dyn LlmProvider>,
    created_at: Instant,
}

/// Resolves model bindings to provider clients.
///
/// Built clients are cached per endpoint and credential and rebuilt once their
/// TTL elapses. Providers added with [`ProviderRegistry::register`] are pinned
/// and take precedence over built clients for the same provider name.
pub struct ProviderRegistry {
    ttl: Duration,
    pinned: HashMap<String, Arc<dyn LlmProvider>>,
    cache: Mutex<HashMap<String, CachedProvider>>,
}

impl ProviderRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pinned: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a provider under a name. Pinned providers never expire.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.pinned.insert(name.into(), provider);
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(name, provider);
        self
    }

    /// Resolve the provider for a model binding.
    pub fn get(&self, model: &ModelConfig) -> Result<Arc<dyn LlmProvider>> {
        if let Some(provider) = self.pinned.get(&model.provider) {
            return Ok(provider.clone());
        }

        let key = cache_key(model);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = cache.get(&key) {
            if entry.created_at.elapsed() < self.ttl {
                return Ok(entry.provider.clone());
            }
            debug!(key = %redact(&key), "Provider cache entry expired");
        }

        let provider = create_provider(model)?;
        cache.insert(
            key,
            CachedProvider {
                provider: provider.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(provider)
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let before = cache.len();
        cache.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - cache.len()
    }

    /// Number of cached (non-pinned) clients.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(3_600))
    }
}

fn cache_key(model: &ModelConfig) -> String {
    let url = model.base_url.as_deref().unwrap_or("");
    match model.provider.as_str() {
        "ollama" => format!("ollama:{url}"),
        other => format!(
            "{other}:{}:{url}",
            fingerprint(model.api_key.as_deref().unwrap_or(""))
        ),
    }
}

/// Short non-reversible tag so raw keys never sit in the cache map.
fn fingerprint(secret: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    secret.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn redact(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(provider: &str, key: Option<&str>) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            model_id: "m".into(),
            api_key: key.map(String::from),
            base_url: None,
            max_tokens: None,
        }
    }

    #[test]
    fn reuses_within_ttl() {
        let registry = ProviderRegistry::new(Duration::from_secs(60));
        let a = registry.get(&model("openai", Some("k1"))).unwrap();
        let b = registry.get(&model("openai", Some("k1"))).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.get(&model("openai", Some("k2"))).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn rebuilds_after_ttl() {
        let registry = ProviderRegistry::new(Duration::ZERO);
        let a = registry.get(&model("ollama", None)).unwrap();
        let b = registry.get(&model("ollama", None)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.purge_expired(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_provider_fails() {
        let registry = ProviderRegistry::default();
        assert!(registry.get(&model("carrier-pigeon", None)).is_err());
    }

    #[test]
    fn pinned_provider_wins() {
        let pinned: Arc<dyn LlmProvider> =
            Arc::new(crate::OpenAiProvider::new("mock", "http://127.0.0.1:1/v1/chat/completions"));
        let registry = ProviderRegistry::default().with_provider("mock", pinned.clone());
        let got = registry.get(&model("mock", None)).unwrap();
        assert!(Arc::ptr_eq(&got, &pinned));
        assert!(registry.is_empty());
    }

    #[test]
    fn keys_do_not_contain_secrets() {
        let key = cache_key(&model("openai", Some("sk-secret")));
        assert!(!key.contains("sk-secret"));
        assert!(key.starts_with("openai:"));
    }
}

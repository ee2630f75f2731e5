use relay_core::error::{RelayError, Result};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// A named provider preset for OpenAI-compatible APIs.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    match provider {
        "openai" => Some(ProviderPreset {
            default_base_url: OPENAI_API_URL,
            needs_api_key: true,
            extra_headers: &[],
        }),
        "ollama" => Some(ProviderPreset {
            default_base_url: OLLAMA_DEFAULT_URL,
            needs_api_key: false,
            extra_headers: &[],
        }),
        "groq" => Some(ProviderPreset {
            default_base_url: "https://api.groq.com/openai/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "openrouter" => Some(ProviderPreset {
            default_base_url: "https://openrouter.ai/api/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[("X-Title", "Relay")],
        }),
        "together" => Some(ProviderPreset {
            default_base_url: "https://api.together.xyz/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "deepseek" => Some(ProviderPreset {
            default_base_url: "https://api.deepseek.com/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "mistral" => Some(ProviderPreset {
            default_base_url: "https://api.mistral.ai/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        _ => None,
    }
}

/// List all known preset provider names. `compatible` additionally accepts any base URL.
pub fn all_preset_names() -> &'static [&'static str] {
    &[
        "openai",
        "ollama",
        "groq",
        "openrouter",
        "together",
        "deepseek",
        "mistral",
        "compatible",
    ]
}

/// Turn a configured base URL into a full chat-completions endpoint.
/// `http://host:11434`, `http://host:11434/v1` and the full path all resolve the same.
pub fn chat_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else if trimmed.ends_with("/v1") {
        format!("{trimmed}/chat/completions")
    } else {
        format!("{trimmed}/v1/chat/completions")
    }
}

/// Resolved endpoint for a provider name plus optional base URL override.
pub struct Endpoint {
    pub url: String,
    pub needs_api_key: bool,
    pub extra_headers: Vec<(String, String)>,
}

pub fn resolve_endpoint(provider: &str, base_url: Option<&str>) -> Result<Endpoint> {
    if provider == "compatible" {
        let url = base_url.ok_or_else(|| {
            RelayError::Config("provider 'compatible' requires base_url".to_string())
        })?;
        return Ok(Endpoint {
            url: chat_endpoint(url),
            needs_api_key: false,
            extra_headers: Vec::new(),
        });
    }

    let preset = get_preset(provider)
        .ok_or_else(|| RelayError::UnsupportedProvider(provider.to_string()))?;
    let url = match base_url {
        Some(url) => chat_endpoint(url),
        None => chat_endpoint(preset.default_base_url),
    };
    Ok(Endpoint {
        url,
        needs_api_key: preset.needs_api_key,
        extra_headers: preset
            .extra_headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_base_urls() {
        let full = "http://localhost:11434/v1/chat/completions";
        assert_eq!(chat_endpoint("http://localhost:11434"), full);
        assert_eq!(chat_endpoint("http://localhost:11434/v1/"), full);
        assert_eq!(chat_endpoint(full), full);
    }

    #[test]
    fn unknown_provider_is_unsupported() {
        assert!(matches!(
            resolve_endpoint("carrier-pigeon", None),
            Err(RelayError::UnsupportedProvider(_))
        ));
        assert!(resolve_endpoint("compatible", None).is_err());
        assert!(resolve_endpoint("compatible", Some("http://vllm:8000")).is_ok());
    }

    #[test]
    fn ollama_needs_no_key() {
        let ep = resolve_endpoint("ollama", None).unwrap();
        assert!(!ep.needs_api_key);
        assert_eq!(ep.url, "http://localhost:11434/v1/chat/completions");
    }
}

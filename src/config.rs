use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Provider presets. These are data, not behavior: a preset is a base URL,
/// a default model, and whether the endpoint expects an Authorization
/// header. Local providers (ollama, lmstudio) run without a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    OpenRouter,
    Ollama,
    LmStudio,
}

impl Provider {
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1/chat/completions",
            Self::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
            Self::Ollama => "http://localhost:11434/v1/chat/completions",
            Self::LmStudio => "http://localhost:1234/v1/chat/completions",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::OpenRouter => "openai/gpt-4o-mini",
            Self::Ollama => "llama3.1",
            Self::LmStudio => "local-model",
        }
    }

    pub fn requires_key(self) -> bool {
        matches!(self, Self::OpenAi | Self::OpenRouter)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "ollama" => Some(Self::Ollama),
            "lmstudio" => Some(Self::LmStudio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_endpoint: String,
    /// May be empty for local providers.
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_concurrent_requests: usize,
    /// Default preference for `Request.stream` when the caller has none.
    pub stream_response: bool,
}

/// On-disk shape for the optional TOML file pointed at by QUILL_CONFIG.
/// Every field is optional; env vars override whatever the file sets.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    provider: Option<String>,
    api_endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    max_concurrent_requests: Option<usize>,
    stream_response: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        let provider = Provider::OpenAi;
        Self {
            api_endpoint: provider.endpoint().to_string(),
            api_key: String::new(),
            model: provider.default_model().to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT,
            stream_response: true,
        }
    }
}

impl Config {
    /// Load configuration: optional TOML file (QUILL_CONFIG), then env
    /// overrides, then validation. Callers should run dotenv discovery
    /// before this if they want `.env` support.
    pub fn load() -> Self {
        let file = match env::var("QUILL_CONFIG") {
            Ok(path) => load_file(Path::new(&path)).unwrap_or_default(),
            Err(_) => ConfigFile::default(),
        };
        Self::from_sources(file).validated()
    }

    fn from_sources(file: ConfigFile) -> Self {
        let mut cfg = Config::default();

        let provider = env::var("QUILL_PROVIDER")
            .ok()
            .or(file.provider)
            .and_then(|p| {
                let known = Provider::from_name(&p);
                if known.is_none() {
                    tracing::warn!(provider = %p, "unknown provider name, using openai preset");
                }
                known
            });
        if let Some(p) = provider {
            cfg.api_endpoint = p.endpoint().to_string();
            cfg.model = p.default_model().to_string();
            if p.requires_key() && env::var("QUILL_API_KEY").is_err() && file.api_key.is_none() {
                tracing::warn!("provider requires an API key but none is configured");
            }
        }

        if let Some(v) = env::var("QUILL_API_ENDPOINT").ok().or(file.api_endpoint) {
            cfg.api_endpoint = v;
        }
        if let Some(v) = env::var("QUILL_API_KEY").ok().or(file.api_key) {
            cfg.api_key = v;
        }
        if let Some(v) = env::var("QUILL_MODEL").ok().or(file.model) {
            cfg.model = v;
        }
        if let Some(v) = env_parse::<u64>("QUILL_TIMEOUT_MS").or(file.timeout_ms) {
            cfg.timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("QUILL_MAX_RETRIES").or(file.max_retries) {
            cfg.max_retries = v;
        }
        if let Some(v) =
            env_parse::<usize>("QUILL_MAX_CONCURRENT").or(file.max_concurrent_requests)
        {
            cfg.max_concurrent_requests = v;
        }
        if let Some(v) = env_parse::<bool>("QUILL_STREAM").or(file.stream_response) {
            cfg.stream_response = v;
        }

        cfg
    }

    /// Clamp out-of-range values rather than failing startup.
    fn validated(mut self) -> Self {
        if self.max_concurrent_requests == 0 {
            tracing::warn!("max_concurrent_requests must be >= 1, clamping to 1");
            self.max_concurrent_requests = 1;
        }
        if self.timeout.is_zero() {
            tracing::warn!("timeout must be > 0, using default");
            self.timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        }
        if self.api_endpoint.trim().is_empty() {
            tracing::warn!("api_endpoint is empty, using openai preset");
            self.api_endpoint = Provider::OpenAi.endpoint().to_string();
        }
        self
    }
}

fn load_file(path: &Path) -> Option<ConfigFile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), "failed to read config file: {e}");
            return None;
        }
    };
    match toml::from_str(&raw) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(path = %path.display(), "failed to parse config file: {e}");
            None
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable value, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_concurrent_requests, 3);
        assert!(cfg.stream_response);
    }

    #[test]
    fn validation_clamps_zero_concurrency() {
        let cfg = Config {
            max_concurrent_requests: 0,
            ..Config::default()
        }
        .validated();
        assert_eq!(cfg.max_concurrent_requests, 1);
    }

    #[test]
    fn validation_restores_zero_timeout() {
        let cfg = Config {
            timeout: Duration::ZERO,
            ..Config::default()
        }
        .validated();
        assert_eq!(cfg.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn toml_round_trip() {
        let file: ConfigFile = toml::from_str(
            r#"
            provider = "ollama"
            model = "llama3.1:70b"
            timeout_ms = 60000
            stream_response = false
            "#,
        )
        .unwrap();
        assert_eq!(file.provider.as_deref(), Some("ollama"));
        assert_eq!(file.model.as_deref(), Some("llama3.1:70b"));
        assert_eq!(file.timeout_ms, Some(60_000));
        assert_eq!(file.stream_response, Some(false));
    }

    #[test]
    fn provider_presets() {
        assert!(Provider::OpenRouter.requires_key());
        assert!(!Provider::Ollama.requires_key());
        assert!(Provider::LmStudio.endpoint().starts_with("http://localhost"));
        assert_eq!(Provider::from_name("OpenRouter"), Some(Provider::OpenRouter));
        assert_eq!(Provider::from_name("nope"), None);
    }
}

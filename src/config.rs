//! Runtime configuration.
//!
//! All settings come from the process environment (a `.env` file is loaded
//! by the binary before this runs). Values are read once at startup;
//! changing them requires a restart.

use std::env;

/// Application configuration, resolved from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the Gemini LLM and embedding endpoints (`GOOGLE_API_KEY`).
    pub google_api_key: String,
    /// Postgres connection string (`DATABASE_URL`).
    pub database_url: String,
    /// Model used for research planning, filtering, reflection, and chat.
    pub reasoning_model: String,
    /// Cheaper model used for auxiliary calls such as title generation.
    pub fast_model: String,
    /// HTTP listen port (`PORT`).
    pub port: String,
    /// Text splitter chunk size in characters (`CHUNK_SIZE`).
    pub chunk_size: usize,
    /// Overlap between consecutive chunks (`CHUNK_OVERLAP`).
    pub chunk_overlap: usize,
    /// Embedding model name (`EMBEDDING_MODEL`).
    pub embedding_model: String,
    /// Default vector collection name (`COLLECTION_NAME`).
    pub collection_name: String,
    /// API key for the OCR scraping service (`MISTRAL_API_KEY`).
    pub mistral_api_key: String,
}

impl Config {
    /// Resolve configuration from the environment, falling back to defaults
    /// for everything except the API keys and the database URL.
    pub fn load() -> Self {
        Self {
            google_api_key: get_env("GOOGLE_API_KEY", ""),
            database_url: get_env("DATABASE_URL", ""),
            reasoning_model: get_env("REASONING_MODEL", "gemini-3-pro-preview"),
            fast_model: get_env("FAST_MODEL", "gemini-3-flash-preview"),
            port: get_env("PORT", "3000"),
            chunk_size: get_env_as_usize("CHUNK_SIZE", 1000),
            chunk_overlap: get_env_as_usize("CHUNK_OVERLAP", 200),
            embedding_model: get_env("EMBEDDING_MODEL", "gemini-embedding-001"),
            collection_name: get_env("COLLECTION_NAME", "thesis_db"),
            mistral_api_key: get_env("MISTRAL_API_KEY", ""),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn get_env_as_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(get_env("RESEARCH_HELPER_TEST_UNSET", "fallback"), "fallback");
        assert_eq!(get_env_as_usize("RESEARCH_HELPER_TEST_UNSET", 1000), 1000);
    }

    #[test]
    fn test_non_numeric_falls_back() {
        std::env::set_var("RESEARCH_HELPER_TEST_BAD_INT", "not-a-number");
        assert_eq!(get_env_as_usize("RESEARCH_HELPER_TEST_BAD_INT", 200), 200);
        std::env::remove_var("RESEARCH_HELPER_TEST_BAD_INT");
    }
}

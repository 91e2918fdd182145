use anyhow::Context;
use std::path::PathBuf;

/// Runtime configuration, read from the environment once at startup.
/// The Telegram token itself is consumed by `Bot::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    pub tmdb_api_key: String,
    pub language: String,
    pub store_path: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let tmdb_api_key = std::env::var("TMDB_API_KEY").context("TMDB_API_KEY is not set")?;
        let language = std::env::var("TMDB_LANG").unwrap_or_else(|_| "en-US".to_string());
        let store_path = std::env::var("STORE_PATH")
            .unwrap_or_else(|_| "movie_bot_state.json".to_string())
            .into();
        Ok(Self {
            tmdb_api_key,
            language,
            store_path,
        })
    }

    /// Region subtag of the language tag ("en-US" -> "US"), used for
    /// watch-provider lookups. Plain languages fall back to US.
    pub fn region(&self) -> String {
        self.language
            .rsplit_once('-')
            .map(|(_, region)| region.to_ascii_uppercase())
            .unwrap_or_else(|| "US".to_string())
    }
}

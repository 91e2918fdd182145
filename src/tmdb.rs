use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3";

/// w500 is plenty for chat-sized posters.
pub const IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p/w500";

/// TMDb refuses pages beyond 500.
const MAX_PAGE: u32 = 500;

const GENRE_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum TmdbError {
    #[error("TMDb request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("TMDb API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
}

/// TMDb v3 client, bearer-token auth.
#[derive(Clone)]
pub struct TmdbClient {
    http: Client,
    base_url: String,
    api_token: String,
    language: String,
}

impl TmdbClient {
    pub fn new(api_token: String, language: String) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), api_token, language)
    }

    /// Base URL override, used by tests to point at a wiremock server.
    pub fn with_base_url(base_url: String, api_token: String, language: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_token,
            language,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TmdbError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.status_message)
                .unwrap_or(body);
            return Err(TmdbError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    /// Title search, `GET /search/movie`.
    pub async fn search_movies(&self, query: &str, page: u32) -> Result<MoviePage, TmdbError> {
        let params = [
            ("query", query.to_string()),
            ("language", self.language.clone()),
            ("page", clamp_page(page).to_string()),
            ("include_adult", "false".to_string()),
        ];
        self.get_json("/search/movie", &params).await
    }

    /// Popularity-sorted browse of a single genre.
    pub async fn discover_by_genre(&self, genre_id: u64, page: u32) -> Result<MoviePage, TmdbError> {
        let params = [
            ("with_genres", genre_id.to_string()),
            ("language", self.language.clone()),
            ("sort_by", "popularity.desc".to_string()),
            ("page", clamp_page(page).to_string()),
            ("include_adult", "false".to_string()),
        ];
        self.get_json("/discover/movie", &params).await
    }

    /// Popularity-sorted browse by origin country (ISO 3166-1 alpha-2).
    pub async fn discover_by_country(&self, country: &str, page: u32) -> Result<MoviePage, TmdbError> {
        let params = [
            ("with_origin_country", country.to_string()),
            ("language", self.language.clone()),
            ("sort_by", "popularity.desc".to_string()),
            ("page", clamp_page(page).to_string()),
            ("include_adult", "false".to_string()),
        ];
        self.get_json("/discover/movie", &params).await
    }

    /// Full movie card; a 404 (deleted or never existed) is `None`.
    pub async fn movie_details(&self, id: u64) -> Result<Option<MovieDetails>, TmdbError> {
        let path = format!("/movie/{id}");
        let params = [("language", self.language.clone())];
        match self.get_json::<MovieDetails>(&path, &params).await {
            Ok(details) => Ok(Some(details)),
            Err(TmdbError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn genre_list(&self) -> Result<Vec<Genre>, TmdbError> {
        let params = [("language", self.language.clone())];
        let resp: GenreListResp = self.get_json("/genre/movie/list", &params).await?;
        Ok(resp.genres)
    }

    /// Per-country streaming offers, keyed by region code.
    pub async fn watch_providers(
        &self,
        movie_id: u64,
    ) -> Result<HashMap<String, CountryProviders>, TmdbError> {
        let path = format!("/movie/{movie_id}/watch/providers");
        let resp: ProvidersResp = self.get_json(&path, &[]).await?;
        Ok(resp.results)
    }

    /// Best YouTube trailer, trying the configured language first and
    /// falling back to en-US.
    pub async fn best_trailer_url(&self, movie_id: u64) -> Result<Option<String>, TmdbError> {
        let path = format!("/movie/{movie_id}/videos");
        let mut languages = vec![self.language.as_str()];
        if self.language != "en-US" {
            languages.push("en-US");
        }
        let mut all = Vec::new();
        for lang in languages {
            let resp: VideosResp = self.get_json(&path, &[("language", lang.to_string())]).await?;
            all.extend(resp.results);
        }
        Ok(pick_best_trailer(&all))
    }
}

fn clamp_page(page: u32) -> u32 {
    page.clamp(1, MAX_PAGE)
}

fn pick_best_trailer(videos: &[Video]) -> Option<String> {
    let mut candidates: Vec<&Video> = videos
        .iter()
        .filter(|v| v.site.eq_ignore_ascii_case("YouTube"))
        .collect();
    candidates.sort_by_key(|v| {
        let official = if v.official.unwrap_or(false) { 0 } else { 1 };
        let kind = match v.kind.as_str() {
            "Trailer" => 0,
            "Teaser" => 1,
            _ => 2,
        };
        (official, kind)
    });
    candidates
        .first()
        .map(|v| format!("https://www.youtube.com/watch?v={}", v.key))
}

/// Genre id -> name catalog, cached per language with a 24h TTL so the
/// genre keyboard does not hit TMDb on every tap.
#[derive(Clone)]
pub struct GenreCatalog {
    cache: Cache<String, Arc<Vec<Genre>>>,
}

impl GenreCatalog {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(8)
                .time_to_live(GENRE_CACHE_TTL)
                .build(),
        }
    }

    pub async fn all(&self, tmdb: &TmdbClient) -> Result<Arc<Vec<Genre>>, TmdbError> {
        let lang = tmdb.language().to_string();
        if let Some(cached) = self.cache.get(&lang).await {
            return Ok(cached);
        }
        let genres = Arc::new(tmdb.genre_list().await?);
        self.cache.insert(lang, genres.clone()).await;
        Ok(genres)
    }

    pub async fn name_of(&self, tmdb: &TmdbClient, id: u64) -> Result<Option<String>, TmdbError> {
        let genres = self.all(tmdb).await?;
        Ok(genres.iter().find(|g| g.id == id).map(|g| g.name.clone()))
    }
}

impl Default for GenreCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/* ======= DTOs ======= */

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    status_message: String,
}

#[derive(Debug, Deserialize)]
pub struct MoviePage {
    pub page: u32,
    pub results: Vec<Movie>,
    pub total_pages: u32,
    pub total_results: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Movie {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub original_title: String,
    #[serde(default)]
    pub overview: String,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub vote_average: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MovieDetails {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub original_title: String,
    #[serde(default)]
    pub overview: String,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub vote_average: Option<f64>,
    #[serde(default)]
    pub genres: Vec<Genre>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Genre {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct GenreListResp {
    genres: Vec<Genre>,
}

#[derive(Debug, Deserialize)]
struct VideosResp {
    results: Vec<Video>,
}

#[derive(Debug, Deserialize)]
pub struct Video {
    pub key: String,
    pub site: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub official: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ProvidersResp {
    #[serde(default)]
    results: HashMap<String, CountryProviders>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CountryProviders {
    pub link: Option<String>,
    #[serde(default)]
    pub flatrate: Vec<Provider>,
    #[serde(default)]
    pub rent: Vec<Provider>,
    #[serde(default)]
    pub buy: Vec<Provider>,
    #[serde(default)]
    pub ads: Vec<Provider>,
    #[serde(default)]
    pub free: Vec<Provider>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub provider_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(kind: &str, official: Option<bool>, key: &str) -> Video {
        Video {
            key: key.to_string(),
            site: "YouTube".to_string(),
            kind: kind.to_string(),
            official,
        }
    }

    #[test]
    fn page_is_clamped_to_tmdb_limits() {
        assert_eq!(clamp_page(0), 1);
        assert_eq!(clamp_page(1), 1);
        assert_eq!(clamp_page(500), 500);
        assert_eq!(clamp_page(9999), 500);
    }

    #[test]
    fn official_trailer_beats_unofficial_trailer() {
        let videos = vec![
            video("Trailer", Some(false), "fan-cut"),
            video("Trailer", Some(true), "the-one"),
        ];
        assert_eq!(
            pick_best_trailer(&videos).as_deref(),
            Some("https://www.youtube.com/watch?v=the-one")
        );
    }

    #[test]
    fn trailer_beats_teaser_at_equal_officialness() {
        let videos = vec![
            video("Teaser", Some(true), "teaser"),
            video("Trailer", Some(true), "trailer"),
        ];
        assert_eq!(
            pick_best_trailer(&videos).as_deref(),
            Some("https://www.youtube.com/watch?v=trailer")
        );
    }

    #[test]
    fn non_youtube_videos_are_ignored() {
        let mut v = video("Trailer", Some(true), "vimeo-id");
        v.site = "Vimeo".to_string();
        assert_eq!(pick_best_trailer(&[v]), None);
        assert_eq!(pick_best_trailer(&[]), None);
    }

    #[test]
    fn movie_tolerates_sparse_payloads() {
        let m: Movie = serde_json::from_str(r#"{"id": 42, "title": "Solaris"}"#).unwrap();
        assert_eq!(m.id, 42);
        assert!(m.overview.is_empty());
        assert!(m.release_date.is_none());

        let m: Movie =
            serde_json::from_str(r#"{"id": 1, "title": "X", "release_date": null}"#).unwrap();
        assert!(m.release_date.is_none());
    }

    #[test]
    fn error_envelope_message_is_extracted() {
        let body: ApiErrorBody = serde_json::from_str(
            r#"{"status_code":7,"status_message":"Invalid API key: You must be granted a valid key.","success":false}"#,
        )
        .unwrap();
        assert!(body.status_message.contains("Invalid API key"));
    }

    #[test]
    fn providers_default_to_empty_sections() {
        let p: CountryProviders =
            serde_json::from_str(r#"{"link":"https://www.themoviedb.org/movie/603/watch"}"#)
                .unwrap();
        assert!(p.flatrate.is_empty());
        assert!(p.free.is_empty());
        assert!(p.link.is_some());
    }
}

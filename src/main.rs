use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

use tg_moviefinder_bot::{config::Config, storage::Favorites, tg, tmdb};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let bot = Bot::from_env();

    let app = tg::App {
        region: config.region(),
        tmdb: tmdb::TmdbClient::new(config.tmdb_api_key.clone(), config.language.clone()),
        genres: tmdb::GenreCatalog::new(),
        favorites: Favorites::open(config.store_path.clone()).await?,
    };

    tracing::info!("movie finder bot is up, waiting for updates");
    tg::run(bot, app).await;
    Ok(())
}

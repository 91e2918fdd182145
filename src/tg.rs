use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{
        CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile,
        KeyboardButton, KeyboardMarkup, MessageId, ParseMode,
    },
    utils::command::BotCommands,
};
use unicode_segmentation::UnicodeSegmentation;

use crate::storage::{Favorite, Favorites};
use crate::tmdb::{
    CountryProviders, Genre, GenreCatalog, Movie, MovieDetails, TmdbClient, IMAGE_BASE_URL,
};

const BTN_SEARCH: &str = "🔎 Search";
const BTN_GENRE: &str = "🎭 Genre";
const BTN_COUNTRY: &str = "🌍 Country";

/// ISO 3166-1 alpha-2 codes offered on the country keyboard.
const COUNTRIES: &[(&str, &str)] = &[
    ("US", "USA"),
    ("GB", "United Kingdom"),
    ("RU", "Russia"),
    ("UZ", "Uzbekistan"),
    ("FR", "France"),
    ("DE", "Germany"),
    ("ES", "Spain"),
    ("IT", "Italy"),
    ("JP", "Japan"),
    ("KR", "South Korea"),
    ("IN", "India"),
    ("CN", "China"),
    ("CA", "Canada"),
];

const RESULT_BUTTONS_PER_PAGE: usize = 10;

/// TMDb returns 20 results per page.
const TMDB_PAGE_SIZE: usize = 20;

/// Telegram caps callback_data at 64 bytes; "pg:s:NNN:" leaves ~50,
/// keep a margin for multi-digit pages.
const CALLBACK_PAYLOAD_LIMIT: usize = 40;

const ERR_TMDB_DOWN: &str = "TMDb is not answering right now, try again later.";

/* ====== Commands ====== */
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Commands:")]
enum Command {
    #[command(description = "show the main keyboard")]
    Start,
    #[command(description = "your saved movies")]
    Favorites,
    #[command(description = "help")]
    Help,
}

/// Everything the handlers need, cloned into each endpoint.
#[derive(Clone)]
pub struct App {
    pub tmdb: TmdbClient,
    pub genres: GenreCatalog,
    pub favorites: Favorites,
    pub region: String,
}

pub async fn run(bot: Bot, app: App) {
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint({
                    let app = app.clone();
                    move |bot: Bot, msg: Message, cmd: Command| {
                        let app = app.clone();
                        async move { on_command(bot, msg, cmd, &app).await }
                    }
                }))
                .branch({
                    let app = app.clone();
                    dptree::endpoint(move |bot: Bot, msg: Message| {
                        let app = app.clone();
                        async move { on_text(bot, msg, &app).await }
                    })
                }),
        )
        .branch(Update::filter_callback_query().endpoint({
            let app = app.clone();
            move |bot: Bot, q: CallbackQuery| {
                let app = app.clone();
                async move { on_callback(bot, q, &app).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/* ====== Commands ====== */
async fn on_command(bot: Bot, msg: Message, cmd: Command, app: &App) -> ResponseResult<()> {
    match cmd {
        Command::Start => {
            // warm the genre catalog; a failure here is not fatal
            if let Err(e) = app.genres.all(&app.tmdb).await {
                tracing::warn!(error = %e, "failed to warm the genre catalog");
            }
            bot.send_message(
                msg.chat.id,
                "Hi! I search the TMDb movie catalog. Send me a title, or pick a button below.",
            )
            .reply_markup(main_keyboard())
            .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        }
        Command::Favorites => send_favorites(&bot, msg.chat.id, app).await?,
    }
    Ok(())
}

/* ====== Text routing: keyboard buttons or a search query ====== */
async fn on_text(bot: Bot, msg: Message, app: &App) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }

    match text {
        BTN_SEARCH => {
            bot.send_message(msg.chat.id, "Type a movie title:")
                .reply_markup(main_keyboard())
                .await?;
        }
        BTN_GENRE => match app.genres.all(&app.tmdb).await {
            Ok(genres) => {
                bot.send_message(msg.chat.id, "Pick a genre:")
                    .reply_markup(genre_keyboard(&genres))
                    .await?;
            }
            Err(e) => report_tmdb_error(&bot, msg.chat.id, &e).await?,
        },
        BTN_COUNTRY => {
            bot.send_message(msg.chat.id, "Pick a country:")
                .reply_markup(country_keyboard())
                .await?;
        }
        query => {
            let sent = bot.send_message(msg.chat.id, "🔎 Searching…").await?;
            show_page(&bot, app, msg.chat.id, sent.id, &Browse::Search(query.to_string()), 1)
                .await?;
        }
    }
    Ok(())
}

/* ====== Paging state, carried entirely inside callback_data ======
   pg:s:<page>:<query>  — title search
   pg:g:<page>:<genre>  — discover by genre id
   pg:c:<page>:<code>   — discover by country */
#[derive(Debug, Clone, PartialEq, Eq)]
enum Browse {
    Search(String),
    Genre(u64),
    Country(String),
}

impl Browse {
    fn page_callback(&self, page: u32) -> String {
        match self {
            Browse::Search(q) => format!("pg:s:{page}:{}", clip_payload(q)),
            Browse::Genre(id) => format!("pg:g:{page}:{id}"),
            Browse::Country(code) => format!("pg:c:{page}:{code}"),
        }
    }
}

static PAGE_CALLBACK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^pg:([sgc]):(\d+):(.*)$").unwrap());

fn parse_page_callback(data: &str) -> Option<(Browse, u32)> {
    let caps = PAGE_CALLBACK.captures(data)?;
    let page: u32 = caps[2].parse().ok()?;
    let payload = &caps[3];
    let browse = match &caps[1] {
        "s" => Browse::Search(payload.to_string()),
        "g" => Browse::Genre(payload.parse().ok()?),
        "c" => Browse::Country(payload.to_string()),
        _ => return None,
    };
    Some((browse, page))
}

/// Truncate a callback payload on a grapheme boundary so the whole
/// callback_data stays under Telegram's 64-byte cap.
fn clip_payload(s: &str) -> String {
    let mut out = String::new();
    for g in s.graphemes(true) {
        if out.len() + g.len() > CALLBACK_PAYLOAD_LIMIT {
            break;
        }
        out.push_str(g);
    }
    out
}

/* ====== Result pages ====== */
async fn show_page(
    bot: &Bot,
    app: &App,
    chat: ChatId,
    message: MessageId,
    browse: &Browse,
    page: u32,
) -> ResponseResult<()> {
    let fetched = match browse {
        Browse::Search(q) => app.tmdb.search_movies(q, page).await,
        Browse::Genre(id) => app.tmdb.discover_by_genre(*id, page).await,
        Browse::Country(code) => app.tmdb.discover_by_country(code, page).await,
    };
    let result_page = match fetched {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, ?browse, page, "TMDb page fetch failed");
            bot.edit_message_text(chat, message, ERR_TMDB_DOWN).await?;
            return Ok(());
        }
    };

    if result_page.results.is_empty() {
        bot.edit_message_text(chat, message, "Nothing found. Try another query.")
            .await?;
        return Ok(());
    }

    let heading = match browse {
        Browse::Search(q) => format!("🔎 Search: <b>{}</b>", html_escape(q)),
        Browse::Genre(id) => {
            let name = app
                .genres
                .name_of(&app.tmdb, *id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| id.to_string());
            format!("🎭 Genre: <b>{}</b>", html_escape(&name))
        }
        Browse::Country(code) => format!("🌍 Country: <b>{}</b>", html_escape(code)),
    };
    let total_pages = result_page.total_pages.max(1);
    let header = format!("{heading}\n<i>(page {page} of {total_pages})</i>");
    let kb = page_keyboard(&result_page.results, browse, page, total_pages);

    bot.edit_message_text(chat, message, header)
        .parse_mode(ParseMode::Html)
        .reply_markup(kb)
        .await?;
    Ok(())
}

fn page_keyboard(
    results: &[Movie],
    browse: &Browse,
    page: u32,
    total_pages: u32,
) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = results
        .iter()
        .take(RESULT_BUTTONS_PER_PAGE)
        .map(|m| {
            vec![InlineKeyboardButton::callback(
                one_line_title(m),
                format!("det:{}", m.id),
            )]
        })
        .collect();
    let nav = nav_row(browse, page, total_pages, results.len());
    if !nav.is_empty() {
        rows.push(nav);
    }
    InlineKeyboardMarkup::new(rows)
}

fn nav_row(
    browse: &Browse,
    page: u32,
    total_pages: u32,
    results_on_page: usize,
) -> Vec<InlineKeyboardButton> {
    let mut row = Vec::new();
    if page > 1 {
        row.push(InlineKeyboardButton::callback(
            "◀ Prev",
            browse.page_callback(page - 1),
        ));
    }
    // total_pages occasionally lags behind reality; a full page means
    // there may be more even when TMDb says this is the last one
    if page < total_pages || results_on_page == TMDB_PAGE_SIZE {
        row.push(InlineKeyboardButton::callback(
            "▶ Next",
            browse.page_callback(page + 1),
        ));
    }
    row
}

/* ====== Callback routing ======
   det:<id>            — movie card
   genre:<id>:<page>   — open a genre browse
   country:<code>:<page>
   pg:…                — page navigation (see Browse)
   watch:<id>          — streaming providers
   trailer:<id>        — best YouTube trailer
   fav_add:<id> / fav_list / fav_del:<id> */
async fn on_callback(bot: Bot, q: CallbackQuery, app: &App) -> ResponseResult<()> {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    let Some(origin) = q.message.as_ref() else {
        return Ok(());
    };
    let chat = origin.chat().id;
    let message_id = origin.id();

    if let Some((browse, page)) = parse_page_callback(&data) {
        bot.answer_callback_query(q.id.clone()).await?;
        return show_page(&bot, app, chat, message_id, &browse, page).await;
    }

    let mut parts = data.splitn(3, ':');
    let op = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("");

    match op {
        "det" => {
            bot.answer_callback_query(q.id.clone()).await?;
            let Ok(id) = arg.parse::<u64>() else {
                return Ok(());
            };
            send_details(&bot, app, chat, id).await?;
        }
        "genre" => {
            bot.answer_callback_query(q.id.clone()).await?;
            let (Ok(id), Ok(page)) = (arg.parse::<u64>(), rest.parse::<u32>()) else {
                return Ok(());
            };
            show_page(&bot, app, chat, message_id, &Browse::Genre(id), page).await?;
        }
        "country" => {
            bot.answer_callback_query(q.id.clone()).await?;
            let Ok(page) = rest.parse::<u32>() else {
                return Ok(());
            };
            show_page(&bot, app, chat, message_id, &Browse::Country(arg.to_string()), page)
                .await?;
        }
        "watch" => {
            bot.answer_callback_query(q.id.clone()).await?;
            let Ok(id) = arg.parse::<u64>() else {
                return Ok(());
            };
            send_watch_providers(&bot, app, chat, id).await?;
        }
        "trailer" => {
            bot.answer_callback_query(q.id.clone()).await?;
            let Ok(id) = arg.parse::<u64>() else {
                return Ok(());
            };
            send_trailer(&bot, app, chat, id).await?;
        }
        "fav_add" => {
            let Ok(id) = arg.parse::<u64>() else {
                return Ok(());
            };
            match app.tmdb.movie_details(id).await {
                Ok(Some(details)) => {
                    let added = app
                        .favorites
                        .add(chat.0, favorite_from(&details))
                        .await
                        .map_err(to_req_err)?;
                    answer_cb(&bot, &q, if added { "Saved ⭐" } else { "Already saved" }).await?;
                }
                Ok(None) => answer_cb(&bot, &q, "Movie not found").await?,
                Err(e) => {
                    tracing::warn!(error = %e, movie_id = id, "favorite add failed");
                    answer_cb(&bot, &q, ERR_TMDB_DOWN).await?;
                }
            }
        }
        "fav_list" => {
            bot.answer_callback_query(q.id.clone()).await?;
            send_favorites(&bot, chat, app).await?;
        }
        "fav_del" => {
            let Ok(id) = arg.parse::<u64>() else {
                return Ok(());
            };
            let removed = app.favorites.remove(chat.0, id).await.map_err(to_req_err)?;
            answer_cb(&bot, &q, if removed { "Removed" } else { "Not in favorites" }).await?;
            if removed {
                send_favorites(&bot, chat, app).await?;
            }
        }
        _ => answer_cb(&bot, &q, "Unknown action").await?,
    }
    Ok(())
}

/* ====== Movie card ====== */
async fn send_details(bot: &Bot, app: &App, chat: ChatId, movie_id: u64) -> ResponseResult<()> {
    let details = match app.tmdb.movie_details(movie_id).await {
        Ok(Some(d)) => d,
        Ok(None) => {
            bot.send_message(chat, "That movie is gone from TMDb.").await?;
            return Ok(());
        }
        Err(e) => return report_tmdb_error(bot, chat, &e).await,
    };

    let caption = details_caption(&details);
    let kb = details_keyboard(movie_id);

    if let Some(poster) = &details.poster_path {
        let url = format!("{IMAGE_BASE_URL}{poster}");
        // posters go by bytes: Telegram is picky about CDN redirects
        if let Ok(bytes) = fetch_image(&url).await {
            bot.send_photo(
                chat,
                InputFile::memory(bytes).file_name(format!("poster_{movie_id}.jpg")),
            )
            .caption(caption)
            .parse_mode(ParseMode::Html)
            .reply_markup(kb)
            .await?;
            return Ok(());
        }
    }

    bot.send_message(chat, caption)
        .parse_mode(ParseMode::Html)
        .reply_markup(kb)
        .await?;
    Ok(())
}

fn details_caption(d: &MovieDetails) -> String {
    let title = display_title(&d.title, &d.original_title);
    let year = d
        .release_date
        .as_deref()
        .and_then(|r| r.get(..4))
        .unwrap_or("—");
    let rating = d
        .vote_average
        .map(|v| format!("{v:.1}"))
        .unwrap_or_else(|| "—".to_string());
    let genres = if d.genres.is_empty() {
        "—".to_string()
    } else {
        d.genres
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let overview = if d.overview.trim().is_empty() {
        "<i>no overview</i>".to_string()
    } else {
        // photo captions are capped at 1024 chars
        clip(&html_escape(&d.overview), 700)
    };
    format!(
        "<b>{}</b> ({})\n⭐ TMDb: <b>{}</b>\n🎭 <i>{}</i>\n\n{}",
        html_escape(title),
        year,
        rating,
        html_escape(&genres),
        overview
    )
}

fn details_keyboard(movie_id: u64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "⭐ Save to favorites",
            format!("fav_add:{movie_id}"),
        )],
        vec![InlineKeyboardButton::callback(
            "🟢 Where to watch?",
            format!("watch:{movie_id}"),
        )],
        vec![InlineKeyboardButton::callback(
            "▶ Trailer",
            format!("trailer:{movie_id}"),
        )],
        vec![InlineKeyboardButton::callback(
            "🗂 My favorites",
            "fav_list".to_string(),
        )],
    ])
}

fn favorite_from(d: &MovieDetails) -> Favorite {
    Favorite {
        id: d.id,
        title: display_title(&d.title, &d.original_title).to_string(),
        year: d
            .release_date
            .as_deref()
            .and_then(|r| r.get(..4))
            .map(str::to_string),
    }
}

/* ====== Providers & trailers ====== */
async fn send_watch_providers(
    bot: &Bot,
    app: &App,
    chat: ChatId,
    movie_id: u64,
) -> ResponseResult<()> {
    let providers = match app.tmdb.watch_providers(movie_id).await {
        Ok(p) => p,
        Err(e) => return report_tmdb_error(bot, chat, &e).await,
    };
    let entry = providers
        .get(app.region.as_str())
        .or_else(|| providers.get("US"))
        .or_else(|| providers.get("GB"));
    let Some(entry) = entry else {
        bot.send_message(chat, "No streaming providers listed for your region.")
            .await?;
        return Ok(());
    };
    bot.send_message(chat, providers_text(&app.region, entry)).await?;
    Ok(())
}

fn providers_text(region: &str, entry: &CountryProviders) -> String {
    let mut lines = vec![format!("Where to watch ({region}):")];
    let sections: [(&str, &[crate::tmdb::Provider]); 5] = [
        ("Subscription", &entry.flatrate),
        ("Rent", &entry.rent),
        ("Buy", &entry.buy),
        ("With ads", &entry.ads),
        ("Free", &entry.free),
    ];
    for (label, offers) in sections {
        if !offers.is_empty() {
            let names = offers
                .iter()
                .map(|p| p.provider_name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("• {label}: {names}"));
        }
    }
    if let Some(link) = &entry.link {
        lines.push(String::new());
        lines.push(format!("Full provider list: {link}"));
    }
    lines.join("\n")
}

async fn send_trailer(bot: &Bot, app: &App, chat: ChatId, movie_id: u64) -> ResponseResult<()> {
    match app.tmdb.best_trailer_url(movie_id).await {
        Ok(Some(url)) => {
            bot.send_message(chat, format!("▶ {url}")).await?;
        }
        Ok(None) => {
            bot.send_message(chat, "No trailer found.").await?;
        }
        Err(e) => return report_tmdb_error(bot, chat, &e).await,
    }
    Ok(())
}

/* ====== Favorites view ====== */
async fn send_favorites(bot: &Bot, chat: ChatId, app: &App) -> ResponseResult<()> {
    let favorites = app.favorites.list(chat.0).await;
    if favorites.is_empty() {
        bot.send_message(chat, "Nothing saved yet. Use ⭐ on a movie card to add one.")
            .await?;
        return Ok(());
    }
    let rows: Vec<Vec<InlineKeyboardButton>> = favorites
        .iter()
        .take(20)
        .map(|f| {
            vec![
                InlineKeyboardButton::callback(format!("ℹ {}", favorite_title(f)), format!("det:{}", f.id)),
                InlineKeyboardButton::callback("✖".to_string(), format!("fav_del:{}", f.id)),
            ]
        })
        .collect();
    bot.send_message(chat, "🗂 Your favorites:")
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

fn favorite_title(f: &Favorite) -> String {
    match &f.year {
        Some(y) => format!("{} ({})", f.title, y),
        None => f.title.clone(),
    }
}

/* ====== Keyboards ====== */
fn main_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![
        KeyboardButton::new(BTN_SEARCH),
        KeyboardButton::new(BTN_GENRE),
        KeyboardButton::new(BTN_COUNTRY),
    ]])
    .resize_keyboard()
}

fn genre_keyboard(genres: &[Genre]) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    for g in genres.iter().take(30) {
        row.push(InlineKeyboardButton::callback(
            g.name.clone(),
            format!("genre:{}:1", g.id),
        ));
        if row.len() == 3 {
            rows.push(std::mem::take(&mut row));
        }
    }
    if !row.is_empty() {
        rows.push(row);
    }
    InlineKeyboardMarkup::new(rows)
}

fn country_keyboard() -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    for (code, label) in COUNTRIES {
        row.push(InlineKeyboardButton::callback(
            label.to_string(),
            format!("country:{code}:1"),
        ));
        if row.len() == 2 {
            rows.push(std::mem::take(&mut row));
        }
    }
    if !row.is_empty() {
        rows.push(row);
    }
    InlineKeyboardMarkup::new(rows)
}

/* ====== Helpers ====== */
fn display_title<'a>(title: &'a str, original: &'a str) -> &'a str {
    if title.is_empty() {
        original
    } else {
        title
    }
}

fn one_line_title(m: &Movie) -> String {
    let title = display_title(&m.title, &m.original_title);
    match m.release_date.as_deref().and_then(|d| d.get(..4)) {
        Some(y) => format!("{title} ({y})"),
        None => title.to_string(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn clip(s: &str, max_graphemes: usize) -> String {
    let mut it = s.graphemes(true);
    let clipped: String = it.by_ref().take(max_graphemes).collect();
    if it.next().is_some() {
        clipped + "…"
    } else {
        clipped
    }
}

async fn report_tmdb_error(
    bot: &Bot,
    chat: ChatId,
    err: &crate::tmdb::TmdbError,
) -> ResponseResult<()> {
    tracing::warn!(error = %err, "TMDb call failed");
    bot.send_message(chat, ERR_TMDB_DOWN).await?;
    Ok(())
}

async fn answer_cb(bot: &Bot, q: &CallbackQuery, text: &str) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone())
        .text(text)
        .show_alert(false)
        .await?;
    Ok(())
}

/// Poster download as raw bytes, resilient to CDN redirects.
async fn fetch_image(url: &str) -> Result<Vec<u8>, teloxide::RequestError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("tg-moviefinder-bot/0.1")
        .build()
        .map_err(to_req_err)?;
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, "image/*")
        .send()
        .await
        .map_err(to_req_err)?;
    if !resp.status().is_success() {
        return Err(to_req_err(format!("status {}", resp.status())));
    }
    let bytes = resp.bytes().await.map_err(to_req_err)?;
    Ok(bytes.to_vec())
}

fn to_req_err<E: std::fmt::Display>(e: E) -> teloxide::RequestError {
    teloxide::RequestError::Io(std::sync::Arc::new(std::io::Error::new(
        std::io::ErrorKind::Other,
        e.to_string(),
    )))
}

pub mod config;
pub mod storage;
pub mod tg;
pub mod tmdb;

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::fs;
use tokio::sync::RwLock;

/// What we keep per saved movie. The full card is re-fetched from TMDb
/// when the user opens it, so id + title + year is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Favorite {
    pub id: u64,
    pub title: String,
    pub year: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileState {
    version: u32,
    // chat_id -> saved movies
    chats: HashMap<i64, Vec<Favorite>>,
}

/// Per-chat favorites, held in memory and snapshotted to a JSON file
/// after every mutation.
#[derive(Clone)]
pub struct Favorites {
    inner: Arc<RwLock<FileState>>,
    path: PathBuf,
}

impl Favorites {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = if fs::try_exists(&path).await.unwrap_or(false) {
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<FileState>(&data) {
                Ok(mut s) => {
                    if s.version == 0 {
                        s.version = 1;
                    }
                    s
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "favorites snapshot is unreadable, starting empty"
                    );
                    FileState {
                        version: 1,
                        ..Default::default()
                    }
                }
            }
        } else {
            FileState {
                version: 1,
                ..Default::default()
            }
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(state)),
            path,
        })
    }

    /// Saved movies for a chat, title-sorted.
    pub async fn list(&self, chat_id: i64) -> Vec<Favorite> {
        let guard = self.inner.read().await;
        let mut list = guard.chats.get(&chat_id).cloned().unwrap_or_default();
        list.sort_by(|a, b| a.title.cmp(&b.title));
        list
    }

    /// Returns false when the movie is already saved for this chat.
    pub async fn add(&self, chat_id: i64, favorite: Favorite) -> anyhow::Result<bool> {
        let added = {
            let mut guard = self.inner.write().await;
            let entry = guard.chats.entry(chat_id).or_default();
            if entry.iter().any(|f| f.id == favorite.id) {
                false
            } else {
                entry.push(favorite);
                true
            }
        };
        if added {
            self.flush().await?;
        }
        Ok(added)
    }

    /// Returns false when the movie was not saved in the first place.
    pub async fn remove(&self, chat_id: i64, movie_id: u64) -> anyhow::Result<bool> {
        let removed = {
            let mut guard = self.inner.write().await;
            match guard.chats.get_mut(&chat_id) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|f| f.id != movie_id);
                    list.len() < before
                }
                None => false,
            }
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        // serialize under the read lock, write to disk outside of it
        let snapshot = {
            let guard = self.inner.read().await;
            serde_json::to_vec_pretty(&*guard)?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &snapshot).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_store() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "moviefinder-favorites-{}-{}.json",
            std::process::id(),
            n
        ))
    }

    fn favorite(id: u64, title: &str) -> Favorite {
        Favorite {
            id,
            title: title.to_string(),
            year: Some("1972".to_string()),
        }
    }

    #[tokio::test]
    async fn add_is_idempotent_per_movie() {
        let path = temp_store();
        let favorites = Favorites::open(path.clone()).await.unwrap();

        assert!(favorites.add(1, favorite(603, "The Matrix")).await.unwrap());
        assert!(!favorites.add(1, favorite(603, "The Matrix")).await.unwrap());
        assert_eq!(favorites.list(1).await.len(), 1);

        // same movie in another chat is a separate entry
        assert!(favorites.add(2, favorite(603, "The Matrix")).await.unwrap());

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn list_is_sorted_by_title() {
        let path = temp_store();
        let favorites = Favorites::open(path.clone()).await.unwrap();

        favorites.add(1, favorite(2, "Stalker")).await.unwrap();
        favorites.add(1, favorite(1, "Mirror")).await.unwrap();
        favorites.add(1, favorite(3, "Andrei Rublev")).await.unwrap();

        let titles: Vec<_> = favorites
            .list(1)
            .await
            .into_iter()
            .map(|f| f.title)
            .collect();
        assert_eq!(titles, ["Andrei Rublev", "Mirror", "Stalker"]);

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_deleted() {
        let path = temp_store();
        let favorites = Favorites::open(path.clone()).await.unwrap();

        favorites.add(1, favorite(603, "The Matrix")).await.unwrap();
        assert!(favorites.remove(1, 603).await.unwrap());
        assert!(!favorites.remove(1, 603).await.unwrap());
        assert!(!favorites.remove(99, 603).await.unwrap());
        assert!(favorites.list(1).await.is_empty());

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = temp_store();
        {
            let favorites = Favorites::open(path.clone()).await.unwrap();
            favorites.add(7, favorite(11, "Solaris")).await.unwrap();
        }
        let reopened = Favorites::open(path.clone()).await.unwrap();
        assert_eq!(reopened.list(7).await, vec![favorite(11, "Solaris")]);

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let path = temp_store();
        fs::write(&path, b"not json at all").await.unwrap();

        let favorites = Favorites::open(path.clone()).await.unwrap();
        assert!(favorites.list(1).await.is_empty());

        let _ = fs::remove_file(&path).await;
    }
}

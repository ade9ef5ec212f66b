use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use common::{Error, Result};

use crate::write_atomic;

/// One JSON object per file. Backs the cooldown and statistics singletons.
pub struct JsonSingletonStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T> JsonSingletonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send,
{
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    /// Read the current object; `Default` when the file does not exist yet.
    pub async fn load(&self) -> Result<T> {
        self.read()
    }

    pub async fn save(&self, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(value)
    }

    /// Read-transform-write under the exclusive lock; returns the new value.
    pub async fn update(&self, transform: impl FnOnce(T) -> T) -> Result<T>
    where
        T: Clone,
    {
        let _guard = self.write_lock.lock().await;
        let next = transform(self.read()?);
        self.write(&next)?;
        Ok(next)
    }

    fn read(&self) -> Result<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("failed to parse {}: {e}", self.path.display())))
    }

    fn write(&self, value: &T) -> Result<()> {
        write_atomic(&self.path, value)?;
        debug!(path = %self.path.display(), "singleton store written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        hits: u32,
    }

    #[tokio::test]
    async fn load_returns_default_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonSingletonStore<Counter> =
            JsonSingletonStore::open(dir.path().join("c.json")).unwrap();
        assert_eq!(store.load().await.unwrap(), Counter::default());
    }

    #[tokio::test]
    async fn update_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");

        let store: JsonSingletonStore<Counter> = JsonSingletonStore::open(&path).unwrap();
        let next = store
            .update(|mut c| {
                c.hits += 1;
                c
            })
            .await
            .unwrap();
        assert_eq!(next.hits, 1);

        let reopened: JsonSingletonStore<Counter> = JsonSingletonStore::open(&path).unwrap();
        assert_eq!(reopened.load().await.unwrap().hits, 1);
    }
}

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use common::{Error, Result};

use crate::write_atomic;

/// A JSON array on disk holding every snapshot of one entity type.
///
/// Mutations take the exclusive lock, read the whole array, transform it and
/// write it back atomically (tmp file + rename). Readers never lock; they see
/// the last committed snapshot.
pub struct JsonCollectionStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T> JsonCollectionStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    /// Open (or create) the store at `path`. The parent directory is created
    /// if missing; the file itself appears on first write.
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

    pub async fn get_all(&self) -> Result<Vec<T>> {
        self.read()
    }

    pub async fn get_by(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        Ok(self.read()?.into_iter().filter(|e| predicate(e)).collect())
    }

    /// Insert the entity, or replace the existing one with the same key.
    pub async fn add_or_update(
        &self,
        entity: T,
        key: impl Fn(&T) -> String,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read()?;
        let entity_key = key(&entity);
        match entries.iter_mut().find(|e| key(e) == entity_key) {
            Some(slot) => *slot = entity,
            None => entries.push(entity),
        }
        self.write(&entries)
    }

    /// Remove matching entries; returns how many were removed.
    pub async fn delete(&self, predicate: impl Fn(&T) -> bool) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read()?;
        let before = entries.len();
        entries.retain(|e| !predicate(e));
        let removed = before - entries.len();
        if removed > 0 {
            self.write(&entries)?;
        }
        Ok(removed)
    }

    /// Transform every entry in place; returns how many entries were written.
    pub async fn update_all(&self, transform: impl Fn(T) -> T) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let entries: Vec<T> = self.read()?.into_iter().map(transform).collect();
        let count = entries.len();
        self.write(&entries)?;
        Ok(count)
    }

    fn read(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("failed to parse {}: {e}", self.path.display())))
    }

    fn write(&self, entries: &[T]) -> Result<()> {
        write_atomic(&self.path, entries)?;
        debug!(path = %self.path.display(), count = entries.len(), "collection store written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: String,
        value: i64,
    }

    fn entry(id: &str, value: i64) -> Entry {
        Entry { id: id.into(), value }
    }

    #[tokio::test]
    async fn add_or_update_is_visible_to_a_fresh_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");

        let store: JsonCollectionStore<Entry> = JsonCollectionStore::open(&path).unwrap();
        store.add_or_update(entry("a", 1), |e| e.id.clone()).await.unwrap();

        // A second store over the same file observes the committed snapshot.
        let fresh: JsonCollectionStore<Entry> = JsonCollectionStore::open(&path).unwrap();
        let all = fresh.get_all().await.unwrap();
        assert_eq!(all, vec![entry("a", 1)]);
    }

    #[tokio::test]
    async fn add_or_update_replaces_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonCollectionStore<Entry> =
            JsonCollectionStore::open(dir.path().join("e.json")).unwrap();

        store.add_or_update(entry("a", 1), |e| e.id.clone()).await.unwrap();
        store.add_or_update(entry("a", 2), |e| e.id.clone()).await.unwrap();
        store.add_or_update(entry("b", 3), |e| e.id.clone()).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry("a", 2));
    }

    #[tokio::test]
    async fn delete_removes_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonCollectionStore<Entry> =
            JsonCollectionStore::open(dir.path().join("e.json")).unwrap();

        store.add_or_update(entry("a", 1), |e| e.id.clone()).await.unwrap();
        store.add_or_update(entry("b", 2), |e| e.id.clone()).await.unwrap();

        let removed = store.delete(|e| e.value == 1).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_all().await.unwrap(), vec![entry("b", 2)]);
    }

    #[tokio::test]
    async fn update_all_transforms_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonCollectionStore<Entry> =
            JsonCollectionStore::open(dir.path().join("e.json")).unwrap();

        store.add_or_update(entry("a", 1), |e| e.id.clone()).await.unwrap();
        store.add_or_update(entry("b", 2), |e| e.id.clone()).await.unwrap();

        let count = store
            .update_all(|mut e| {
                e.value += 10;
                e
            })
            .await
            .unwrap();
        assert_eq!(count, 2);

        let values: Vec<i64> = store.get_all().await.unwrap().iter().map(|e| e.value).collect();
        assert_eq!(values, vec![11, 12]);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonCollectionStore<Entry> =
            JsonCollectionStore::open(dir.path().join("missing.json")).unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }
}

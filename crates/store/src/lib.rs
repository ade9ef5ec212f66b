//! JSON file persistence: a collection store (array of snapshots) and a
//! singleton store (one object per file). Both write through a temporary
//! sibling file and rename, so a crash mid-write never corrupts the
//! committed state.

pub mod collection;
pub mod singleton;

pub use collection::JsonCollectionStore;
pub use singleton::JsonSingletonStore;

use std::path::Path;

use serde::Serialize;

use common::Result;

/// Serialize `value` pretty-printed and swap it into place atomically.
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

//! Dump / Restore — JSON export and import of the whole store.
//!
//! The dump format groups keys by their collection-style prefix
//! (everything before the first `:`) and maps each prefix to the array of
//! value documents stored under it:
//!
//! ```json
//! {
//!   "users": [ {"_id": "1", "name": "ada"}, ... ],
//!   "orders": [ ... ]
//! }
//! ```
//!
//! Dump never fails on value format: a value that does not parse as JSON
//! is exported as a JSON string of its lossy UTF-8 decoding. Restore is
//! strict — every document must be an object carrying an `_id` member,
//! which is combined with the collection prefix to rebuild the key
//! `<collection>:<_id>`.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::info;

use super::{Engine, EngineError};

/// Key prefix before the first `:`, or the whole key when there is none.
fn collection_of(key: &[u8]) -> String {
    let prefix = match key.iter().position(|&b| b == b':') {
        Some(at) => &key[..at],
        None => key,
    };
    String::from_utf8_lossy(prefix).into_owned()
}

impl Engine {
    /// Exports every live key/value pair as a JSON document at `path`.
    pub fn dump_db(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        let mut collections: Map<String, Value> = Map::new();

        let mut total = 0u64;
        for (key, value) in self.iter()? {
            let doc = match serde_json::from_slice::<Value>(&value) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(String::from_utf8_lossy(&value).into_owned()),
            };
            let bucket = collections
                .entry(collection_of(&key))
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(docs) = bucket {
                docs.push(doc);
            }
            total += 1;
        }

        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, &Value::Object(collections))
            .map_err(|e| EngineError::Io(e.into()))?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        info!(path = %path.display(), entries = total, "database dumped");
        Ok(())
    }

    /// Imports a dump produced by [`Engine::dump_db`].
    ///
    /// Every document must be a JSON object with an `_id` member; its key
    /// becomes `<collection>:<_id>`. Documents are written through the
    /// normal mutation path, one batch per collection, so the import is
    /// durable and crash-safe like any other write.
    pub fn restore_db(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let doc: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::InvalidArgument(format!("restore file is not JSON: {e}")))?;
        let Value::Object(collections) = doc else {
            return Err(EngineError::InvalidArgument(
                "restore document must be an object of collections".into(),
            ));
        };

        let mut total = 0u64;
        for (collection, docs) in collections {
            let Value::Array(docs) = docs else {
                return Err(EngineError::InvalidArgument(format!(
                    "collection {collection:?} is not an array"
                )));
            };

            let mut batch = self.new_batch();
            for doc in docs {
                let id = doc
                    .as_object()
                    .and_then(|obj| obj.get("_id"))
                    .ok_or_else(|| {
                        EngineError::InvalidArgument(format!(
                            "document in {collection:?} lacks _id"
                        ))
                    })?;
                let id = match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let key = format!("{collection}:{id}").into_bytes();
                let value = serde_json::to_vec(&doc).map_err(|e| EngineError::Io(e.into()))?;
                batch.put(key, value);
                total += 1;
            }
            self.apply_batch(&batch)?;
        }

        info!(path = %path.display(), entries = total, "database restored");
        Ok(())
    }
}

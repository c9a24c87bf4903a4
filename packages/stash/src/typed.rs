//! Typed reads and writes.
//!
//! A typed write is only accepted if the value serializes, deserializes
//! back, and serializes again to the same JSON. A type that loses or
//! invents data on the way through (skipped fields, lossy conversions)
//! would otherwise persist something different from what was written.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use stash_core_store::Path;

use crate::broadcast::EventKind;
use crate::{Error, Result, Store};

impl Store {
    /// Serialize `data` and write it. Fails before anything changes if the
    /// value does not round-trip through JSON unchanged.
    pub fn write_typed<T>(&self, path: &Path, data: &T, kind: EventKind) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = to_checked_value(path, data)?;
        self.write(path, value, kind)
    }

    /// [`set`](Store::set) for a typed value.
    pub fn set_typed<T>(&self, path: &Path, data: &T) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = to_checked_value(path, data)?;
        self.set(path, value)
    }

    /// Read a document into a Rust type.
    pub fn get_typed<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let Some(value) = self.get(path) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Read every document of a collection into a Rust type.
    pub fn get_all_typed<T: DeserializeOwned>(
        &self,
        collection: &Path,
    ) -> Result<Option<BTreeMap<String, T>>> {
        let Some(documents) = self.get_all(collection) else {
            return Ok(None);
        };
        let typed = documents
            .into_iter()
            .map(|(id, value)| -> Result<(String, T)> { Ok((id, serde_json::from_value(value)?)) })
            .collect::<Result<BTreeMap<String, T>>>()?;
        Ok(Some(typed))
    }
}

fn to_checked_value<T>(path: &Path, data: &T) -> Result<JsonValue>
where
    T: Serialize + DeserializeOwned,
{
    let mismatch = |message: String| Error::SerializationMismatch {
        path: path.clone(),
        message,
    };

    let value = serde_json::to_value(data).map_err(|e| mismatch(e.to_string()))?;
    let decoded: T = serde_json::from_value(value.clone()).map_err(|e| mismatch(e.to_string()))?;
    let again = serde_json::to_value(&decoded).map_err(|e| mismatch(e.to_string()))?;
    if again != value {
        return Err(mismatch(format!(
            "serialized as {} but reads back as {}",
            value, again
        )));
    }
    Ok(value)
}

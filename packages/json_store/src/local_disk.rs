use std::{fs, io, path};

use crate::{Error, Result};

/// File holding the shard resolver snapshot.
pub const RESOLVER_FILE: &str = "__resolver__.json";

const PLAIN_SUFFIX: &str = ".json";
const ENCRYPTED_SUFFIX: &str = ".encrypted.json";
const TEMP_SUFFIX: &str = ".tmp";

/// The directory every shard file and the resolver file live in.
///
/// All file names are flat: `<shard>.json`, `<shard>.encrypted.json` and
/// `__resolver__.json`. Writes go through a temporary file and a rename so
/// a reader never observes a half-written file.
#[derive(Debug)]
pub struct ShardDirectory {
    root: path::PathBuf,
}

impl ShardDirectory {
    /// Open (creating if needed) a writable directory.
    pub fn new(root: path::PathBuf) -> Result<ShardDirectory> {
        fs::create_dir_all(&root).map_err(|error| Error::RootPathInvalid {
            path: root.clone(),
            source: error,
        })?;

        let attr = fs::metadata(&root).map_err(|error| Error::RootPathInvalid {
            path: root.clone(),
            source: error,
        })?;

        if !attr.is_dir() {
            return Err(Error::RootPathInvalid {
                path: root,
                source: io::Error::other("Root path must be a directory."),
            });
        }

        if attr.permissions().readonly() {
            return Err(Error::RootPathInvalid {
                path: root,
                source: io::Error::other("Root directory must be writable"),
            });
        }

        match root.canonicalize() {
            Ok(root) => Ok(ShardDirectory { root }),
            Err(error) => Err(Error::RootPathInvalid {
                path: root,
                source: error,
            }),
        }
    }

    pub fn root(&self) -> &path::Path {
        &self.root
    }

    /// Backing file of a shard.
    pub fn shard_file(&self, shard: &str, encrypted: bool) -> path::PathBuf {
        let suffix = if encrypted {
            ENCRYPTED_SUFFIX
        } else {
            PLAIN_SUFFIX
        };
        self.root.join(format!("{}{}", encode_shard_name(shard), suffix))
    }

    pub fn resolver_file(&self) -> path::PathBuf {
        self.root.join(RESOLVER_FILE)
    }

    /// Read a whole file. A missing file is `Ok(None)`.
    pub async fn read(&self, file: &path::Path) -> Result<Option<Vec<u8>>> {
        log::debug!("Reading {}...", file.display());
        match tokio::fs::read(file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(file, err)),
        }
    }

    /// Replace a file's content through a temporary file and a rename.
    pub async fn write_atomic(&self, file: &path::Path, bytes: &[u8]) -> Result<()> {
        log::debug!("Writing {}...", file.display());
        let mut temp = file.as_os_str().to_owned();
        temp.push(TEMP_SUFFIX);
        let temp = path::PathBuf::from(temp);

        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|err| Error::io(&temp, err))?;
        if let Err(err) = tokio::fs::rename(&temp, file).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::io(file, err));
        }
        Ok(())
    }

    /// Delete a file. Returns whether a file was actually removed.
    pub async fn remove(&self, file: &path::Path) -> Result<bool> {
        match tokio::fs::remove_file(file).await {
            Ok(()) => {
                log::debug!("Removed {}", file.display());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::io(file, err)),
        }
    }

    /// Every shard file currently on disk, as (shard name, encrypted).
    pub async fn list_shards(&self) -> Result<Vec<(String, bool)>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| Error::io(&self.root, err))?;

        let mut shards = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| Error::io(&self.root, err))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(shard) = parse_shard_file_name(file_name) {
                shards.push(shard);
            }
        }
        shards.sort();
        Ok(shards)
    }
}

/// Map a shard name onto a flat, unambiguous file stem.
///
/// ASCII letters, digits, `-` and `_` are kept; every other byte becomes
/// `%XX`. A leading `_` is escaped too so no shard can collide with the
/// resolver file.
pub fn encode_shard_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'_' && i > 0);
        if keep {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// Inverse of [`encode_shard_name`]. `None` for stems it could not produce.
pub fn decode_shard_name(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

fn parse_shard_file_name(file_name: &str) -> Option<(String, bool)> {
    if file_name == RESOLVER_FILE {
        return None;
    }
    if let Some(stem) = file_name.strip_suffix(ENCRYPTED_SUFFIX) {
        return decode_shard_name(stem).map(|name| (name, true));
    }
    let stem = file_name.strip_suffix(PLAIN_SUFFIX)?;
    decode_shard_name(stem).map(|name| (name, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_file_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        fs::write(&file_path, b"x").unwrap();

        assert!(matches!(
            ShardDirectory::new(file_path),
            Err(Error::RootPathInvalid { .. })
        ));
    }

    #[test]
    fn creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = ShardDirectory::new(nested.clone()).unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.root(), nested.canonicalize().unwrap());
    }

    #[test]
    fn shard_names_round_trip() {
        for name in ["posts", "user-1", "a/b", "x.encrypted", "__resolver__", "é", "a_b"] {
            let encoded = encode_shard_name(name);
            assert!(!encoded.contains('/'));
            assert!(!encoded.contains('.'));
            assert_eq!(decode_shard_name(&encoded).as_deref(), Some(name));
        }
        assert_eq!(encode_shard_name("a_b"), "a_b");
        assert_eq!(encode_shard_name("__resolver__"), "%5F_resolver__");
    }

    #[test]
    fn file_names_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardDirectory::new(dir.path().to_path_buf()).unwrap();

        let plain = store.shard_file("a/b", false);
        let encrypted = store.shard_file("a/b", true);
        let name = |p: &path::Path| p.file_name().unwrap().to_str().unwrap().to_string();

        assert_eq!(name(plain.as_path()), "a%2Fb.json");
        assert_eq!(name(encrypted.as_path()), "a%2Fb.encrypted.json");
        assert_eq!(
            parse_shard_file_name(&name(plain.as_path())),
            Some(("a/b".to_string(), false))
        );
        assert_eq!(
            parse_shard_file_name(&name(encrypted.as_path())),
            Some(("a/b".to_string(), true))
        );
        assert_eq!(parse_shard_file_name(RESOLVER_FILE), None);
        assert_eq!(parse_shard_file_name("posts.json.tmp"), None);
    }

    #[tokio::test]
    async fn read_write_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardDirectory::new(dir.path().to_path_buf()).unwrap();
        let file = store.shard_file("posts", false);

        assert_eq!(store.read(&file).await.unwrap(), None);
        store.write_atomic(&file, b"{}").await.unwrap();
        assert_eq!(store.read(&file).await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(
            store.list_shards().await.unwrap(),
            vec![("posts".to_string(), false)]
        );

        assert!(store.remove(&file).await.unwrap());
        assert!(!store.remove(&file).await.unwrap());
        assert!(store.list_shards().await.unwrap().is_empty());
    }
}

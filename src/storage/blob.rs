//! Content-addressed blob storage with BLAKE3 hashing
//!
//! Chunk text, embedding vectors, raw documents and archived run states are
//! written once under the hash of their bytes. Large blobs are zstd-compressed.

use crate::error::{Result, TrendError};
use ahash::AHashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of zstd-compressed blob files
const COMPRESSED_SUFFIX: &str = "zst";

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> TrendError {
    move |source| TrendError::Io { source, context }
}

/// Outcome of a blob write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobWrite {
    pub hash: String,
    /// Bytes on disk
    pub size: u64,
    pub compressed: bool,
    /// False when identical content was already stored
    pub is_new: bool,
}

/// Content-addressed blob storage
pub struct BlobStore {
    base_path: PathBuf,
    compression_threshold: usize,
}

impl BlobStore {
    /// Open (and create) the blob directory under `base_path`
    pub fn new(base_path: PathBuf, compression_threshold: usize) -> Result<Self> {
        let blobs_dir = base_path.join("blobs");
        fs::create_dir_all(&blobs_dir).map_err(io_error(format!(
            "Failed to create blobs directory: {}",
            blobs_dir.display()
        )))?;

        Ok(Self {
            base_path,
            compression_threshold,
        })
    }

    /// Store `data`, returning its hash
    pub fn write(&self, data: &[u8]) -> Result<BlobWrite> {
        let hash = hash_data(data);
        if let Some((_, compressed)) = self.locate(&hash) {
            return Ok(BlobWrite {
                size: self.size(&hash)?,
                hash,
                compressed,
                is_new: false,
            });
        }

        let compressed = data.len() >= self.compression_threshold;
        let blob_path = if compressed {
            self.blob_path(&hash).with_extension(COMPRESSED_SUFFIX)
        } else {
            self.blob_path(&hash)
        };
        let bytes = if compressed {
            zstd::encode_all(data, 3)
                .map_err(io_error("Failed to compress blob data".to_string()))?
        } else {
            data.to_vec()
        };

        let parent = blob_path
            .parent()
            .ok_or_else(|| TrendError::Storage(format!("Invalid blob path for {}", hash)))?;
        fs::create_dir_all(parent).map_err(io_error(format!(
            "Failed to create blob directory: {}",
            parent.display()
        )))?;

        // temp file then rename, so readers never see a partial blob
        let temp_path = parent.join(format!("{}.tmp", hash));
        let mut file = fs::File::create(&temp_path).map_err(io_error(format!(
            "Failed to create temp blob file: {}",
            temp_path.display()
        )))?;
        file.write_all(&bytes).map_err(io_error(format!(
            "Failed to write blob: {}",
            temp_path.display()
        )))?;
        file.sync_all().map_err(io_error(format!(
            "Failed to sync blob: {}",
            temp_path.display()
        )))?;
        drop(file);

        fs::rename(&temp_path, &blob_path).map_err(io_error(format!(
            "Failed to move blob into place: {}",
            blob_path.display()
        )))?;

        Ok(BlobWrite {
            hash,
            size: bytes.len() as u64,
            compressed,
            is_new: true,
        })
    }

    /// Read a blob, decompressing it when needed
    pub fn read(&self, hash: &str) -> Result<Vec<u8>> {
        let (blob_path, compressed) = self
            .locate(hash)
            .ok_or_else(|| TrendError::Storage(format!("Blob not found: {}", hash)))?;

        let data = fs::read(&blob_path).map_err(io_error(format!(
            "Failed to read blob: {}",
            blob_path.display()
        )))?;

        if compressed {
            zstd::decode_all(&data[..]).map_err(io_error(format!(
                "Failed to decompress blob: {}",
                blob_path.display()
            )))
        } else {
            Ok(data)
        }
    }

    /// Read a blob that holds UTF-8 text
    pub fn read_string(&self, hash: &str) -> Result<String> {
        String::from_utf8(self.read(hash)?)
            .map_err(|e| TrendError::Storage(format!("Blob {} is not UTF-8: {}", hash, e)))
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.locate(hash).is_some()
    }

    /// Size on disk
    pub fn size(&self, hash: &str) -> Result<u64> {
        let (blob_path, _) = self
            .locate(hash)
            .ok_or_else(|| TrendError::Storage(format!("Blob not found: {}", hash)))?;
        let metadata = fs::metadata(&blob_path).map_err(io_error(format!(
            "Failed to get blob metadata: {}",
            blob_path.display()
        )))?;
        Ok(metadata.len())
    }

    /// Delete every blob whose hash is not in `referenced`
    pub fn gc(&self, referenced: &AHashSet<String>) -> Result<GcStats> {
        let mut stats = GcStats::default();

        self.walk_blobs(|hash, path| {
            stats.total_blobs += 1;
            if referenced.contains(hash) {
                return Ok(());
            }

            let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(path)
                .map_err(io_error(format!("Failed to delete blob: {}", path.display())))?;
            stats.deleted_blobs += 1;
            stats.freed_bytes += size;
            Ok(())
        })?;

        Ok(stats)
    }

    /// Path of a stored blob and whether it is compressed
    fn locate(&self, hash: &str) -> Option<(PathBuf, bool)> {
        let plain = self.blob_path(hash);
        if plain.is_file() {
            return Some((plain, false));
        }
        let compressed = plain.with_extension(COMPRESSED_SUFFIX);
        compressed.is_file().then_some((compressed, true))
    }

    /// Two-level sharding: blobs/ab/cd/abcd...
    fn blob_path(&self, hash: &str) -> PathBuf {
        let mut path = self.base_path.join("blobs");
        if let (Some(shard1), Some(shard2)) = (hash.get(0..2), hash.get(2..4)) {
            path = path.join(shard1).join(shard2);
        }
        path.join(hash)
    }

    fn walk_blobs<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&str, &Path) -> Result<()>,
    {
        let blobs_dir = self.base_path.join("blobs");
        if !blobs_dir.exists() {
            return Ok(());
        }

        for shard1 in read_dirs(&blobs_dir)? {
            for shard2 in read_dirs(&shard1)? {
                let entries = fs::read_dir(&shard2).map_err(io_error(format!(
                    "Failed to read blob shard: {}",
                    shard2.display()
                )))?;
                for entry in entries {
                    let path = entry
                        .map_err(io_error("Failed to read blob entry".to_string()))?
                        .path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if path.is_file() && !name.ends_with(".tmp") {
                        let hash = name.trim_end_matches(".zst").to_string();
                        callback(&hash, &path)?;
                    }
                }
            }
        }

        Ok(())
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(path).map_err(io_error(format!(
        "Failed to read directory: {}",
        path.display()
    )))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error("Failed to read directory entry".to_string()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// BLAKE3 hash truncated to 32 hex characters
fn hash_data(data: &[u8]) -> String {
    format!("{:.32}", blake3::hash(data).to_hex())
}

/// Statistics from garbage collection
#[derive(Debug, Default)]
pub struct GcStats {
    pub total_blobs: usize,
    pub deleted_blobs: usize,
    pub freed_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf(), 1024).unwrap();

        let data = b"Transformer inference on edge devices";
        let written = store.write(data).unwrap();

        assert!(written.is_new);
        assert!(!written.compressed);
        assert_eq!(written.hash.len(), 32);
        assert_eq!(store.read(&written.hash).unwrap(), data);
    }

    #[test]
    fn test_blob_deduplication() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf(), 1024).unwrap();

        let first = store.write(b"chunk text").unwrap();
        let second = store.write(b"chunk text").unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn test_blob_compression() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf(), 10).unwrap();

        let data = vec![b'A'; 2000];
        let written = store.write(&data).unwrap();

        assert!(written.compressed);
        assert!(store.size(&written.hash).unwrap() < data.len() as u64);
        assert_eq!(store.read(&written.hash).unwrap(), data);
    }

    #[test]
    fn test_missing_blob() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf(), 1024).unwrap();

        assert!(!store.exists("0123456789abcdef"));
        assert!(matches!(
            store.read("0123456789abcdef"),
            Err(TrendError::Storage(_))
        ));
    }

    #[test]
    fn test_gc_keeps_referenced() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf(), 1024).unwrap();

        let keep = store.write(b"keep").unwrap();
        let drop = store.write(b"drop").unwrap();

        let referenced: AHashSet<String> = [keep.hash.clone()].into_iter().collect();
        let stats = store.gc(&referenced).unwrap();

        assert_eq!(stats.total_blobs, 2);
        assert_eq!(stats.deleted_blobs, 1);
        assert!(store.exists(&keep.hash));
        assert!(!store.exists(&drop.hash));
    }

    #[test]
    fn test_blob_path_sharding() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf(), 1024).unwrap();

        let path = store.blob_path("abcdef1234567890");
        assert!(path.to_str().unwrap().contains("/blobs/ab/cd/"));
    }
}

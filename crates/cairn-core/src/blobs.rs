//! Attachment blob storage.
//!
//! Blobs live as plain files named by attachment id, separately from the
//! attachment metadata kept in the database.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;

use crate::error::Result;
use crate::models::Id;

const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// Directory of attachment blobs keyed by attachment id
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &Id) -> PathBuf {
        self.dir.join(id.as_str())
    }

    pub async fn exists(&self, id: &Id) -> Result<bool> {
        Ok(fs::try_exists(self.path(id)).await?)
    }

    pub async fn write(&self, id: &Id, bytes: &[u8]) -> Result<()> {
        fs::write(self.path(id), bytes).await?;
        Ok(())
    }

    /// Move a file into the store; copies when a rename isn't possible
    pub async fn import(&self, id: &Id, source: &Path) -> Result<()> {
        let target = self.path(id);
        if fs::rename(source, &target).await.is_ok() {
            return Ok(());
        }
        fs::copy(source, &target).await?;
        if let Err(error) = fs::remove_file(source).await {
            tracing::debug!(%error, source = %source.display(), "Failed to remove imported file");
        }
        Ok(())
    }

    pub async fn read(&self, id: &Id) -> Result<Vec<u8>> {
        Ok(fs::read(self.path(id)).await?)
    }

    /// Delete a blob; returns `false` if it didn't exist
    pub async fn remove(&self, id: &Id) -> Result<bool> {
        match fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

/// Content id of a blob: lowercase hex SHA-256
pub fn content_id(bytes: &[u8]) -> Id {
    id_from_digest(&Sha256::digest(bytes))
}

/// Content id and size of a file, read in chunks
pub async fn hash_file(path: &Path) -> Result<(Id, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; HASH_CHUNK_BYTES];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((id_from_digest(&hasher.finalize()), size))
}

fn id_from_digest(digest: &[u8]) -> Id {
    let hex = hex::encode(digest);
    // hex output always satisfies the id alphabet
    Id::parse(hex).unwrap_or_else(|_| unreachable!("hex digest is a valid id"))
}

/// Pick a MIME type from a declared content type and the file name.
///
/// A generic declared type loses to a guess from the extension.
pub fn infer_mime_type(content_type: Option<&str>, file_name: &str) -> String {
    let guess = mime_guess::from_path(file_name)
        .first_raw()
        .map(str::to_string);

    if let Some(content_type) = content_type.map(str::trim) {
        if !content_type.is_empty()
            && !content_type.eq_ignore_ascii_case("application/octet-stream")
        {
            return content_type.to_string();
        }
    }

    guess.unwrap_or_else(|| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_id_is_sha256_hex() {
        assert_eq!(
            content_id(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn hash_file_matches_content_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let bytes: Vec<u8> = (0..150_000u32).map(|i| (i % 13) as u8).collect();
        tokio::fs::write(&path, &bytes).await.unwrap();

        let (id, size) = hash_file(&path).await.unwrap();
        assert_eq!(id, content_id(&bytes));
        assert_eq!(size, bytes.len() as u64);
    }

    #[tokio::test]
    async fn import_moves_files_into_the_store() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        let source = dir.path().join("upload");
        tokio::fs::write(&source, b"blob").await.unwrap();
        let id = Id::from_static("a1");

        store.import(&id, &source).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
        assert!(!source.exists());
        assert_eq!(store.read(&id).await.unwrap(), b"blob");

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
    }

    #[test]
    fn infers_mime_types() {
        assert_eq!(infer_mime_type(Some("image/png"), "x.bin"), "image/png");
        assert_eq!(
            infer_mime_type(Some("application/octet-stream"), "photo.jpg"),
            "image/jpeg"
        );
        assert_eq!(infer_mime_type(None, "notes.txt"), "text/plain");
        assert_eq!(infer_mime_type(None, "unknown"), "application/octet-stream");
    }
}

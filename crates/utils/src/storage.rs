use std::{
    collections::HashMap,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::RwLock,
};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error};

/// Result type for content store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future type for content fetches, enabling object safety.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = StorageResult<String>> + Send + 'a>>;

/// Errors that can occur while reading stored messages.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The message was not found.
    #[error("Message not found")]
    NotFound,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// A storage engine error occurred.
    #[error("Storage error: {0}")]
    Engine(String),
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound
        } else {
            StorageError::Io(e)
        }
    }
}

/// Trait for stores holding the raw inbound messages.
///
/// The write side belongs to the receiving mail service, forwarding only
/// ever reads. Content is returned as text, invalid UTF-8 sequences are
/// replaced rather than rejected.
pub trait ContentStore: Send + Sync {
    /// Fetches the raw message stored under the given key.
    fn fetch<'a>(&'a self, key: &'a str) -> FetchFuture<'a>;

    /// Returns the name of this store.
    fn name(&self) -> &str;
}

/// Builds the content key of a stored message.
pub fn content_key(prefix: &str, message_id: &str) -> String {
    format!("{prefix}{message_id}")
}

/// Filesystem content store, every key is a file path relative to the base
/// directory.
#[derive(Debug, Clone)]
pub struct FileContentStore {
    base_path: PathBuf,
}

impl FileContentStore {
    /// Creates a new [`FileContentStore`] rooted at the given directory.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Returns the path of a key, refusing keys that would escape the
    /// base directory.
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split(['/', '\\']).any(|segment| segment == "..")
        {
            return Err(StorageError::Engine(format!("Invalid content key: {key}")));
        }
        Ok(self.base_path.join(key))
    }

    /// Stores content under a key, creating parent directories as needed.
    pub async fn put(&self, key: &str, content: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }
}

impl ContentStore for FileContentStore {
    fn fetch<'a>(&'a self, key: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = self.key_path(key)?;
            debug!(key = %key, path = %path.display(), "Reading stored message");
            let bytes = fs::read(&path).await.map_err(|e| {
                error!(key = %key, error = %e, "Failed to read stored message");
                StorageError::from(e)
            })?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

impl Default for FileContentStore {
    fn default() -> Self {
        Self::new(PathBuf::from("mailbox"))
    }
}

/// In-memory content store.
///
/// Useful for testing and development.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    contents: RwLock<HashMap<String, String>>,
}

impl MemoryContentStore {
    /// Creates a new empty [`MemoryContentStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores content under a key, replacing any previous content.
    pub fn put(&self, key: &str, content: &str) -> StorageResult<()> {
        self.contents
            .write()
            .map_err(|e| StorageError::Engine(e.to_string()))?
            .insert(key.to_string(), content.to_string());
        Ok(())
    }

    /// Removes the content stored under a key.
    pub fn remove(&self, key: &str) -> StorageResult<()> {
        self.contents
            .write()
            .map_err(|e| StorageError::Engine(e.to_string()))?
            .remove(key)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }
}

impl ContentStore for MemoryContentStore {
    fn fetch<'a>(&'a self, key: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            self.contents
                .read()
                .map_err(|e| StorageError::Engine(e.to_string()))?
                .get(key)
                .cloned()
                .ok_or(StorageError::NotFound)
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_content_key() {
        assert_eq!(content_key("emails/", "abc"), "emails/abc");
        assert_eq!(content_key("", "abc"), "abc");
    }

    #[tokio::test]
    async fn test_file_store_put_and_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileContentStore::new(temp_dir.path().to_path_buf());

        store.put("emails/abc", "Subject: Hi\r\n\r\nHello").await.unwrap();
        let content = store.fetch("emails/abc").await.unwrap();
        assert_eq!(content, "Subject: Hi\r\n\r\nHello");
    }

    #[tokio::test]
    async fn test_file_store_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileContentStore::new(temp_dir.path().to_path_buf());
        assert!(matches!(
            store.fetch("emails/missing").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_file_store_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileContentStore::new(temp_dir.path().to_path_buf());
        assert!(matches!(
            store.fetch("emails/../../etc/passwd").await,
            Err(StorageError::Engine(_))
        ));
        assert!(matches!(
            store.fetch("/etc/passwd").await,
            Err(StorageError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_lossy_utf8() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("raw"), b"Subject: \xff\r\n\r\n").unwrap();
        let store = FileContentStore::new(temp_dir.path().to_path_buf());
        let content = store.fetch("raw").await.unwrap();
        assert!(content.starts_with("Subject: \u{fffd}"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryContentStore::new();
        store.put("emails/abc", "raw").unwrap();
        assert_eq!(store.fetch("emails/abc").await.unwrap(), "raw");

        store.remove("emails/abc").unwrap();
        assert!(matches!(
            store.fetch("emails/abc").await,
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_storage_error_display() {
        assert_eq!(StorageError::NotFound.to_string(), "Message not found");
        assert_eq!(
            StorageError::Engine("test".to_string()).to_string(),
            "Storage error: test"
        );
    }
}

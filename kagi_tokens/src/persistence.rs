//! Persisting a token cache between process runs

use std::error;

use async_trait::async_trait;
use kagi_clock::Clock;
use thiserror::Error;

use crate::cache::{CacheDeserializationError, CacheSerializationError, TokenCache};

/// An error while reading or writing a persisted cache
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The backing store could not be read or written
    #[error("unable to access persisted token cache")]
    Io(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The cache could not be serialized
    #[error(transparent)]
    Serialize(#[from] CacheSerializationError),
    /// The persisted cache was corrupt and has been discarded
    #[error(transparent)]
    Corrupt(#[from] CacheDeserializationError),
}

/// A place where the serialized form of a token cache is kept between runs
///
/// There is no cross-process locking: the last writer wins. Load before each
/// independent sequence of operations to pick up changes made elsewhere.
#[async_trait]
pub trait CachePersistence: std::fmt::Debug + Send + Sync {
    /// Reads the persisted blob, or `None` if nothing has been stored yet
    async fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replaces the persisted blob
    async fn write(&self, data: Vec<u8>) -> Result<(), PersistenceError>;
}

/// Replaces the contents of `cache` with the persisted form
///
/// Nothing persisted yet means an empty cache. A corrupt blob also leaves
/// `cache` empty and is reported as [`PersistenceError::Corrupt`].
pub async fn load_into<P, C>(persistence: &P, cache: &TokenCache<C>) -> Result<(), PersistenceError>
where
    P: CachePersistence + ?Sized,
    C: Clock,
{
    match persistence.read().await? {
        Some(data) => cache.deserialize(&data)?,
        None => cache.clear(),
    }
    Ok(())
}

/// Writes out the contents of `cache`
pub async fn store<P, C>(persistence: &P, cache: &TokenCache<C>) -> Result<(), PersistenceError>
where
    P: CachePersistence + ?Sized,
    C: Clock,
{
    let data = cache.serialize()?;
    persistence.write(data).await
}

#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use file::FileCachePersistence;

#[cfg(feature = "file")]
mod file {
    use std::{io, path::PathBuf};

    use async_trait::async_trait;
    use kagi_clock::Clock;
    use tokio::fs::OpenOptions;

    use super::{CachePersistence, PersistenceError};
    use crate::cache::TokenCache;

    fn io_error(e: io::Error) -> PersistenceError {
        PersistenceError::Io(Box::new(e))
    }

    /// A token cache persisted to a local file
    ///
    /// On Unix, the file is created readable only by its owner.
    #[derive(Debug)]
    pub struct FileCachePersistence {
        path: PathBuf,
    }

    impl FileCachePersistence {
        /// Constructs a new file persistence layer
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Replaces the contents of `cache` with the contents of the file
        pub async fn load_into<C: Clock>(&self, cache: &TokenCache<C>) -> Result<(), PersistenceError> {
            super::load_into(self, cache).await
        }

        /// Writes the contents of `cache` to the file
        pub async fn store<C: Clock>(&self, cache: &TokenCache<C>) -> Result<(), PersistenceError> {
            super::store(self, cache).await
        }
    }

    #[async_trait]
    impl CachePersistence for FileCachePersistence {
        async fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
            use tokio::io::AsyncReadExt;

            let mut file = match OpenOptions::new().read(true).open(&self.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %self.path.display(), "no persisted token cache");
                    return Ok(None);
                }
                Err(e) => return Err(io_error(e)),
            };
            let mut data = Vec::new();
            file.read_to_end(&mut data).await.map_err(io_error)?;
            tracing::debug!(path = %self.path.display(), bytes = data.len(), "read token cache");
            Ok(Some(data))
        }

        async fn write(&self, data: Vec<u8>) -> Result<(), PersistenceError> {
            use tokio::io::AsyncWriteExt;

            let mut file_opts = OpenOptions::new();

            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            file_opts.mode(0o600);

            let mut file = file_opts.open(&self.path).await.map_err(io_error)?;
            file.write_all(&data).await.map_err(io_error)?;
            file.flush().await.map_err(io_error)?;
            tracing::debug!(path = %self.path.display(), bytes = data.len(), "stored token cache");
            Ok(())
        }
    }

}

use std::path::Path;

use crate::{Error, Result};

/// Transport for shard files. Object-store backends (s3, gcs, http) plug
/// in here; the bundled implementation serves `file://` locations, which
/// is all that single-node deployments and tests require.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Fetch `location` into `dest`, returning the byte size written.
    async fn fetch(&self, location: &str, dest: &Path) -> Result<u64>;
}

pub struct LocalStorage;

#[async_trait::async_trait]
impl Storage for LocalStorage {
    async fn fetch(&self, location: &str, dest: &Path) -> Result<u64> {
        let source = match url::Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|()| Error::UnsupportedScheme(location.to_string()))?,
            // Bare paths are treated as local files.
            Err(_) => std::path::PathBuf::from(location),
            Ok(url) => return Err(Error::UnsupportedScheme(url.scheme().to_string())),
        };
        Ok(tokio::fs::copy(&source, dest).await?)
    }
}

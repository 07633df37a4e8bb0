//! HTTP source downloads.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{Error, Result};

/// Connect timeout for source downloads. The body itself may take arbitrarily long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Downloads sources given by URL into a local directory.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("stream-caster/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Stream `url` to `dest_dir/<random prefix><basename>` chunk by chunk.
    ///
    /// A partially written file is removed when the download fails.
    pub async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::validation(format!("Invalid source URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::validation(format!(
                "Unsupported source URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let response = self.client.get(parsed.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::AcquisitionFailed(format!(
                "GET {url} returned {status}"
            )));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            file_name_of(&parsed)
        ));

        match write_body(response, &dest).await {
            Ok(bytes) => {
                info!(url = %url, path = %dest.display(), bytes, "Downloaded source");
                Ok(dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(e)
            }
        }
    }
}

async fn write_body(response: reqwest::Response, dest: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Last non-empty path segment, or `source` when the URL has none.
fn file_name_of(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| s.replace(['\\', ':'], "_"))
        .unwrap_or_else(|| "source".to_string())
}

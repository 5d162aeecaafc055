use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::DownloadProgress;
use crate::error::CcvmError;

fn is_remote(base: &str) -> bool {
    base.starts_with("http://") || base.starts_with("https://")
}

/// Cache file name for a remote image: the last path segment, minus any query.
fn cache_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => "image.img",
    }
}

/// Download a response body to a file, reporting each chunk.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    progress: &(dyn Fn(DownloadProgress) + Sync),
) -> Result<(), CcvmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| CcvmError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let total = response.content_length();
    let mut downloaded = 0u64;
    progress(DownloadProgress { downloaded, total });

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CcvmError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| CcvmError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        downloaded += chunk.len() as u64;
        progress(DownloadProgress { downloaded, total });
    }

    file.flush().await.map_err(|e| CcvmError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Make the base image available locally, downloading it if needed.
///
/// Local paths are used in place. Remote images land in `cache_dir` and are
/// reused by later instances.
pub async fn ensure_base_image(
    base: &str,
    cache_dir: &Path,
    progress: &(dyn Fn(DownloadProgress) + Sync),
) -> Result<PathBuf, CcvmError> {
    if !is_remote(base) {
        let path = PathBuf::from(base);
        if !path.is_file() {
            return Err(CcvmError::Io {
                context: format!("base image not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        return Ok(path);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| CcvmError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(cache_name(base));
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(dest);
    }

    tracing::info!(url = %base, "downloading base image");

    let response = reqwest::get(base)
        .await
        .map_err(|e| CcvmError::ImageDownload {
            message: format!("request to {base} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(CcvmError::ImageDownload {
            message: format!("unexpected response from {base}"),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let tmp_path = dest.with_extension("part");

    // A previous run may have been interrupted mid-download.
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, progress).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| CcvmError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    tracing::info!(path = %dest.display(), "base image cached");
    Ok(dest)
}

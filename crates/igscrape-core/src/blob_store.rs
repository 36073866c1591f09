//! Image Blob Store (C7): an abstract capability that turns a remote
//! image URL into a stable local path. Concrete storage (local disk, S3,
//! whatever) is out of scope (§1) — callers depend on the trait.
//!
//! Filenames are idempotent: `{key}_{md5(url)}.jpg`, so re-downloading
//! the same URL for the same entity overwrites in place instead of
//! accumulating duplicates.

use async_trait::async_trait;
use image::imageops::FilterType;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Profile and post images are downscaled to fit this box and re-encoded
/// as JPEG at quality 85 (§4.7). Follower avatars skip this step and are
/// stored as downloaded.
const MAX_DIMENSION: u32 = 1200;
const JPEG_QUALITY: u8 = 85;

fn reencode(bytes: &[u8]) -> Option<Vec<u8>> {
    let image = image::load_from_memory(bytes).ok()?;
    let image = if image.width() > MAX_DIMENSION || image.height() > MAX_DIMENSION {
        image.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3)
    } else {
        image
    };

    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    image.write_with_encoder(encoder).ok()?;
    Some(out.into_inner())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save_profile_avatar(&self, username: &str, url: &str) -> crate::Result<Option<String>>;
    async fn save_post_image(&self, post_id: &str, url: &str) -> crate::Result<Option<String>>;
    async fn save_follower_avatar(&self, username: &str, url: &str) -> crate::Result<Option<String>>;

    /// Best-effort batch of follower avatars; individual failures are
    /// swallowed (return `None` for that entry) rather than aborting the
    /// whole batch. Returns `{key -> path|null}` per §4.7; `key` is the
    /// follower's username, matching `save_follower_avatar`.
    async fn save_follower_avatars_batch(
        &self,
        items: &[(String, String)],
    ) -> std::collections::HashMap<String, Option<String>> {
        let mut out = std::collections::HashMap::with_capacity(items.len());
        for (username, url) in items {
            let path = self.save_follower_avatar(username, url).await.unwrap_or(None);
            out.insert(username.clone(), path);
        }
        out
    }

    async fn cleanup(&self, older_than_secs: u64) -> crate::Result<u64>;
}

pub struct FilesystemBlobStore {
    root: PathBuf,
    http: reqwest::Client,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn shared(root: impl Into<PathBuf>) -> Arc<dyn BlobStore> {
        Arc::new(Self::new(root))
    }

    fn directory_for(&self, kind: &str) -> PathBuf {
        self.root.join(kind)
    }

    async fn download_to(&self, kind: &str, key: &str, url: &str, downscale: bool) -> crate::Result<Option<String>> {
        let digest = format!("{:x}", md5::compute(url.as_bytes()));
        let filename = format!("{key}_{digest}.jpg");
        let dir = self.directory_for(kind);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(error = %e, "failed to create blob directory");
            return Ok(None);
        }
        let path = dir.join(&filename);

        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(Some(path.to_string_lossy().to_string()));
        }

        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, url, "blob download failed, returning null path");
                return Ok(None);
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), url, "blob download returned non-success status");
            return Ok(None);
        }
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed reading blob body");
                return Ok(None);
            }
        };

        let bytes = if downscale {
            match tokio::task::spawn_blocking({
                let bytes = bytes.to_vec();
                move || reencode(&bytes)
            })
            .await
            {
                Ok(Some(reencoded)) => reencoded,
                _ => {
                    warn!(url, "failed to re-encode downloaded image, storing original bytes");
                    bytes.to_vec()
                }
            }
        } else {
            bytes.to_vec()
        };

        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(error = %e, "failed writing blob to disk");
            return Ok(None);
        }

        Ok(Some(path.to_string_lossy().to_string()))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn save_profile_avatar(&self, username: &str, url: &str) -> crate::Result<Option<String>> {
        self.download_to("profiles", username, url, true).await
    }

    async fn save_post_image(&self, post_id: &str, url: &str) -> crate::Result<Option<String>> {
        self.download_to("posts", post_id, url, true).await
    }

    async fn save_follower_avatar(&self, username: &str, url: &str) -> crate::Result<Option<String>> {
        self.download_to("followers", username, url, false).await
    }

    async fn cleanup(&self, older_than_secs: u64) -> crate::Result<u64> {
        let mut removed = 0u64;
        let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(older_than_secs);

        for kind in ["profiles", "posts", "followers"] {
            let dir = self.directory_for(kind);
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                if let Ok(modified) = metadata.modified() {
                    if modified < cutoff {
                        if tokio::fs::remove_file(entry.path()).await.is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn unreachable_host_returns_null_path_not_error() {
        let dir = tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let result = store
            .save_profile_avatar("p1", "http://127.0.0.1:9/nonexistent.jpg")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn filename_is_idempotent_per_url() {
        let digest1 = format!("{:x}", md5::compute(b"http://example.com/a.jpg"));
        let digest2 = format!("{:x}", md5::compute(b"http://example.com/a.jpg"));
        assert_eq!(digest1, digest2);
    }

    fn tiny_png() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(4000, 4000, image::Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn reencode_downscales_oversized_images_to_jpeg() {
        let source = tiny_png();
        let reencoded = reencode(&source).expect("re-encode should succeed on a valid image");
        let decoded = image::load_from_memory(&reencoded).unwrap();
        assert!(decoded.width() <= MAX_DIMENSION);
        assert!(decoded.height() <= MAX_DIMENSION);
    }

    #[tokio::test]
    async fn save_profile_avatar_does_not_redownload_once_stored() {
        use wiremock::matchers::method as wm_method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tiny_png()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let url = format!("{}/avatar.png", server.uri());

        let first = store.save_profile_avatar("p1", &url).await.unwrap();
        let second = store.save_profile_avatar("p1", &url).await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_some());
    }
}

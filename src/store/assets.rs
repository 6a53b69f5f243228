//! Blob storage for uploaded images.

use std::path::PathBuf;

use base64::Engine;
use tokio::fs;
use uuid::Uuid;

use crate::llm::ImageInput;
use crate::task::AssetRef;

pub struct AssetStore {
    dir: PathBuf,
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        _ => "jpg",
    }
}

impl AssetStore {
    pub async fn new(dir: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("Failed to create asset dir: {}", e))?;
        Ok(Self { dir })
    }

    /// Decode a base64 upload (optionally a `data:` URL) and store it.
    pub async fn save_base64(&self, payload: &str, mime_type: &str) -> Result<AssetRef, String> {
        let encoded = match payload.split_once(";base64,") {
            Some((_, data)) => data,
            None => payload,
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("Invalid base64 image: {}", e))?;
        self.save_bytes(&bytes, mime_type).await
    }

    /// Store raw image bytes, e.g. a multipart file part.
    pub async fn save_bytes(&self, bytes: &[u8], mime_type: &str) -> Result<AssetRef, String> {
        if bytes.is_empty() {
            return Err("Empty image payload".to_string());
        }

        let asset_id = Uuid::new_v4().simple().to_string();
        let path = self
            .dir
            .join(format!("{}.{}", asset_id, extension_for(mime_type)));
        fs::write(&path, bytes)
            .await
            .map_err(|e| format!("Failed to store image: {}", e))?;
        tracing::debug!(asset_id = %asset_id, bytes = bytes.len(), "Stored uploaded image");
        Ok(AssetRef::stored(
            asset_id,
            path.to_string_lossy().into_owned(),
            mime_type,
        ))
    }

    /// Image input for a model call: local bytes when stored, else the remote URL.
    pub async fn load(asset: &AssetRef) -> Result<ImageInput, String> {
        if let Some(path) = &asset.path {
            let data = fs::read(path)
                .await
                .map_err(|e| format!("Failed to read asset {}: {}", path, e))?;
            return Ok(ImageInput::Bytes {
                data,
                mime_type: asset.mime_type.clone(),
            });
        }
        match &asset.url {
            Some(url) => Ok(ImageInput::Url(url.clone())),
            None => Err(format!("Asset {} has neither a path nor a url", asset.asset_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load_data_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets = AssetStore::new(dir.path().to_path_buf()).await.expect("assets");
        let asset = assets
            .save_base64("data:image/png;base64,dW5pdC10ZXN0LWltYWdl", "image/png")
            .await
            .expect("save");
        assert!(asset.path.as_deref().unwrap_or_default().ends_with(".png"));

        match AssetStore::load(&asset).await.expect("load") {
            ImageInput::Bytes { data, mime_type } => {
                assert_eq!(data, b"unit-test-image");
                assert_eq!(mime_type, "image/png");
            }
            other => panic!("unexpected image input: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets = AssetStore::new(dir.path().to_path_buf()).await.expect("assets");
        assert!(assets.save_base64("%%%", "image/png").await.is_err());
        assert!(assets.save_bytes(b"", "image/png").await.is_err());
    }

    #[tokio::test]
    async fn test_save_bytes_uses_mime_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets = AssetStore::new(dir.path().to_path_buf()).await.expect("assets");
        let asset = assets.save_bytes(b"webp-bytes", "image/webp").await.expect("save");
        let path = asset.path.clone().unwrap_or_default();
        assert!(path.ends_with(".webp"));
        assert_eq!(tokio::fs::read(&path).await.expect("read"), b"webp-bytes");
    }

    #[tokio::test]
    async fn test_remote_asset_passes_url() {
        let asset = AssetRef::remote("https://example.com/p.jpg", "image/jpeg");
        assert!(matches!(
            AssetStore::load(&asset).await.expect("load"),
            ImageInput::Url(url) if url == "https://example.com/p.jpg"
        ));
    }
}

//! Layer Store: content-addressed image layer blobs so repeated
//! deploys only transfer bytes the daemon doesn't already have. Uses
//! the `tar` crate to assemble a loadable image tar from the stored
//! blobs, the same way a build context tar gets built.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::store::DurableStore;

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("malformed digest {0:?}")]
    MalformedDigest(String),
    #[error("layer {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// One entry of `docker save`'s `manifest.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

#[derive(Clone)]
pub struct LayerStore {
    store: DurableStore,
    root: PathBuf,
}

fn hex_digest(hex: &str) -> bool {
    hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Accepts the layer path forms `docker save` manifests use:
/// `blobs/sha256/<hex>`, `blobs/sha256/<hex>/layer.tar`,
/// `sha256:<hex>/layer.tar`, `<hex>/layer.tar`.
pub fn extract_digest_hex(layer_path: &str) -> Option<String> {
    let trimmed = layer_path.trim_end_matches("/layer.tar");
    if let Some(rest) = trimmed.strip_prefix("blobs/sha256/") {
        return hex_digest(rest).then(|| rest.to_owned());
    }
    if let Some(rest) = trimmed.strip_prefix("sha256:") {
        return hex_digest(rest).then(|| rest.to_owned());
    }
    if hex_digest(trimmed) {
        return Some(trimmed.to_owned());
    }
    None
}

pub fn digest_to_name(digest: &str) -> Result<String> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| LayerError::MalformedDigest(digest.to_owned()))?;
    if !hex_digest(hex) {
        return Err(LayerError::MalformedDigest(digest.to_owned()));
    }
    Ok(hex.to_owned())
}

impl LayerStore {
    pub fn new(store: DurableStore, root: PathBuf) -> Self {
        Self { store, root }
    }

    pub fn get_layer_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest_to_name(digest)?;
        Ok(self.root.join(hex).join("layer.tar"))
    }

    pub async fn has_layers(&self, digests: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        Ok(self.store.has_layers(digests).await?)
    }

    /// Streams `reader` to a temp file under the target directory while
    /// hashing; verifies `sha256(bytes) == digest`'s hex part before
    /// renaming into place, so a half-written or mismatched blob never
    /// becomes visible at its final path.
    pub async fn store_layer<R>(&self, digest: &str, mut reader: R) -> Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let hex = digest_to_name(digest)?;
        let final_dir = self.root.join(&hex);
        tokio::fs::create_dir_all(&final_dir).await?;
        let tmp_path = final_dir.join(".upload.tmp");

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        {
            let mut tmp = File::create(&tmp_path).await?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tmp.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            tmp.flush().await?;
        }

        let actual = hex::encode(hasher.finalize());
        if actual != hex {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(LayerError::DigestMismatch {
                expected: hex,
                actual,
            });
        }

        let final_path = final_dir.join("layer.tar");
        tokio::fs::rename(&tmp_path, &final_path).await?;
        self.store.save_layer(digest, size as i64).await?;
        Ok(size)
    }

    pub async fn touch(&self, digests: &[String]) -> Result<()> {
        Ok(self.store.touch_layers(digests).await?)
    }

    pub async fn delete(&self, digest: &str) -> Result<()> {
        let hex = digest_to_name(digest)?;
        let dir = self.root.join(hex);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        self.store.delete_layer(digest).await?;
        Ok(())
    }

    /// Produces a docker-loadable tar: `manifest.json`, the image config
    /// JSON at the path the manifest names, and for each layer path a
    /// copy of the stored blob plus a dummy `VERSION`/`json` sidecar for
    /// legacy loader compatibility. Touches every referenced layer
    /// before returning (keeps LRU-ish accounting honest even though
    /// haloyd doesn't currently evict on it).
    pub async fn assemble_image_tar(
        &self,
        manifest: &[ManifestEntry],
        config_bytes: &[u8],
    ) -> Result<PathBuf> {
        let mut layer_sources = Vec::new();
        for entry in manifest {
            for layer_path in &entry.layers {
                let hex = extract_digest_hex(layer_path)
                    .ok_or_else(|| LayerError::MalformedDigest(layer_path.clone()))?;
                let digest = format!("sha256:{hex}");
                let stored_path = self.get_layer_path(&digest)?;
                if !stored_path.exists() {
                    return Err(LayerError::NotFound(digest));
                }
                layer_sources.push((layer_path.clone(), stored_path, digest));
            }
        }

        let out_dir = std::env::temp_dir().join(format!("haloyd-assemble-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&out_dir).await?;
        let out_path = out_dir.join("image.tar");

        let manifest_json = serde_json::to_vec(manifest)?;
        let config_path = manifest
            .first()
            .map(|m| m.config.clone())
            .unwrap_or_else(|| "config.json".to_owned());

        let out_path_clone = out_path.clone();
        let config_bytes = config_bytes.to_vec();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), std::io::Error> {
            let file = std::fs::File::create(&out_path_clone)?;
            let mut builder = tar::Builder::new(file);

            append_bytes(&mut builder, "manifest.json", &manifest_json)?;
            append_bytes(&mut builder, &config_path, &config_bytes)?;

            for (layer_path, stored_path, _digest) in &layer_sources {
                let mut f = std::fs::File::open(stored_path)?;
                builder.append_file(layer_path, &mut f)?;

                let dir = layer_path
                    .rsplit_once('/')
                    .map(|(d, _)| d.to_owned())
                    .unwrap_or_default();
                append_bytes(&mut builder, &format!("{dir}/VERSION"), b"1.0")?;
                append_bytes(&mut builder, &format!("{dir}/json"), b"{}")?;
            }

            builder.finish()
        })
        .await
        .expect("assemble task panicked")?;

        let digests = layer_sources
            .into_iter()
            .map(|(_, _, d)| d)
            .collect::<Vec<_>>();
        self.touch(&digests).await?;

        Ok(out_path)
    }
}

fn append_bytes(
    builder: &mut tar::Builder<std::fs::File>,
    path: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn new_store() -> (LayerStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db.sqlite3");
        let store = DurableStore::open(&db_path).await.unwrap();
        let ls = LayerStore::new(store, dir.path().join("layers"));
        (ls, dir)
    }

    #[test]
    fn extracts_digest_from_all_four_layouts() {
        let hex = "a".repeat(64);
        assert_eq!(
            extract_digest_hex(&format!("blobs/sha256/{hex}")),
            Some(hex.clone())
        );
        assert_eq!(
            extract_digest_hex(&format!("blobs/sha256/{hex}/layer.tar")),
            Some(hex.clone())
        );
        assert_eq!(
            extract_digest_hex(&format!("sha256:{hex}/layer.tar")),
            Some(hex.clone())
        );
        assert_eq!(extract_digest_hex(&format!("{hex}/layer.tar")), Some(hex));
        assert_eq!(extract_digest_hex("not-a-digest/layer.tar"), None);
    }

    #[tokio::test]
    async fn store_layer_verifies_digest() {
        let (ls, _dir) = new_store().await;
        let data = b"hello world".to_vec();
        let hex = hex::encode(Sha256::digest(&data));
        let digest = format!("sha256:{hex}");

        let size = ls.store_layer(&digest, Cursor::new(data.clone())).await.unwrap();
        assert_eq!(size, data.len() as u64);

        let path = ls.get_layer_path(&digest).unwrap();
        let stored = tokio::fs::read(&path).await.unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn store_layer_rejects_mismatched_digest() {
        let (ls, _dir) = new_store().await;
        let wrong_digest = format!("sha256:{}", "b".repeat(64));
        let err = ls
            .store_layer(&wrong_digest, Cursor::new(b"hello".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::DigestMismatch { .. }));
    }
}

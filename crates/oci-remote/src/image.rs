//! The image capability interface
//!
//! [`Image`] describes what can be asked of a container image regardless of
//! where it lives. [`RemoteImage`](crate::remote::RemoteImage) is the
//! registry-backed implementation; most accessors are provided in terms of
//! [`Image::raw_manifest`] and [`Image::blob`].

use crate::digest::{Digest, Hasher};
use crate::errors::{OciDistributionError, Result};
use crate::manifest::{ConfigFile, OciManifest, IMAGE_MANIFEST_MEDIA_TYPE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A stream of blob content, chunk by chunk.
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// A container image.
///
/// None of the accessors cache: every call goes back to the image source.
/// Callers that need a document repeatedly should hold on to it.
#[async_trait]
pub trait Image: Send + Sync {
    /// The manifest exactly as served.
    async fn raw_manifest(&self) -> Result<Bytes>;

    /// The size in bytes of the blob with the given digest.
    async fn blob_size(&self, digest: &Digest) -> Result<u64>;

    /// The content of the blob with the given digest.
    ///
    /// The bytes are not checked against `digest`; use
    /// [`Image::pull_blob`] for that.
    async fn blob(&self, digest: &Digest) -> Result<BlobStream>;

    /// The decompressed content of the blob with the given digest.
    async fn uncompressed_blob(&self, digest: &Digest) -> Result<BlobStream>;

    /// The decompressed content of the layer with the given diff ID.
    async fn uncompressed_layer(&self, diff_id: &Digest) -> Result<BlobStream>;

    /// The decoded manifest.
    async fn manifest(&self) -> Result<OciManifest> {
        OciManifest::parse(&self.raw_manifest().await?)
    }

    /// The manifest's media type.
    ///
    /// Manifests that do not declare one are assumed to be Docker schema 2.
    async fn media_type(&self) -> Result<String> {
        Ok(self
            .manifest()
            .await?
            .media_type
            .unwrap_or_else(|| IMAGE_MANIFEST_MEDIA_TYPE.to_string()))
    }

    /// The SHA-256 digest of the manifest bytes as served.
    async fn digest(&self) -> Result<Digest> {
        Ok(Digest::sha256_bytes(&self.raw_manifest().await?))
    }

    /// The digest of the config blob.
    async fn config_name(&self) -> Result<Digest> {
        Ok(self.manifest().await?.config.digest)
    }

    /// The config blob exactly as served.
    async fn raw_config_file(&self) -> Result<Bytes> {
        let name = self.config_name().await?;
        read_all(self.blob(&name).await?).await
    }

    /// The decoded config file.
    async fn config_file(&self) -> Result<ConfigFile> {
        ConfigFile::parse(&self.raw_config_file().await?)
    }

    /// The distribution digests of the layers, in manifest order.
    async fn fs_layers(&self) -> Result<Vec<Digest>> {
        Ok(self.manifest().await?.layer_digests())
    }

    /// The diff IDs of the layers, in config order.
    async fn diff_ids(&self) -> Result<Vec<Digest>> {
        Ok(self.config_file().await?.rootfs.diff_ids)
    }

    /// Every blob this image references: the config and all layers.
    async fn blob_set(&self) -> Result<HashSet<Digest>> {
        let manifest = self.manifest().await?;
        let mut blobs: HashSet<Digest> = manifest.layer_digests().into_iter().collect();
        blobs.insert(manifest.config.digest);
        Ok(blobs)
    }

    /// The compressed content of the layer with the given diff ID.
    ///
    /// The diff ID's position in the config's `rootfs.diff_ids` picks the
    /// manifest layer at the same position. Both lists come from a single
    /// manifest read and the config it names.
    async fn layer(&self, diff_id: &Digest) -> Result<BlobStream> {
        let manifest = self.manifest().await?;
        let raw_config = read_all(self.blob(&manifest.config.digest).await?).await?;
        let config = ConfigFile::parse(&raw_config)?;
        let digest = config
            .rootfs
            .diff_ids
            .iter()
            .position(|d| d == diff_id)
            .and_then(|i| manifest.layers.get(i))
            .map(|l| l.digest.clone())
            .ok_or_else(|| OciDistributionError::LayerNotFound(diff_id.clone()))?;
        debug!(%diff_id, %digest, "Resolved layer");
        self.blob(&digest).await
    }

    /// Writes the blob with the given digest to `out`, failing with
    /// [`OciDistributionError::DigestMismatch`] if the bytes do not hash to
    /// `digest`.
    ///
    /// The content is written as it arrives, so on a mismatch `out` has
    /// already received the bad bytes and should be discarded.
    async fn pull_blob(
        &self,
        digest: &Digest,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let mut stream = self.blob(digest).await?;
        let mut hasher = Hasher::new(digest.algorithm());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        let actual = hasher.finish();
        if &actual != digest {
            return Err(OciDistributionError::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Collects a blob stream into memory.
pub async fn read_all(mut stream: BlobStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod test {
    use super::*;
    use futures_util::stream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// An image held entirely in memory.
    struct MemoryImage {
        manifest: Vec<u8>,
        blobs: HashMap<Digest, Vec<u8>>,
    }

    impl MemoryImage {
        fn new(layers: &[&[u8]], diff_ids: &[&str]) -> Self {
            let mut blobs = HashMap::new();
            let diff_ids: Vec<Digest> = diff_ids.iter().map(|d| d.parse().unwrap()).collect();
            let config = serde_json::to_vec(&serde_json::json!({
                "rootfs": {"type": "layers", "diff_ids": diff_ids},
            }))
            .unwrap();
            let config_digest = Digest::sha256_bytes(&config);
            blobs.insert(config_digest.clone(), config);

            let mut layer_descriptors = Vec::new();
            for layer in layers {
                let digest = Digest::sha256_bytes(layer);
                blobs.insert(digest.clone(), layer.to_vec());
                layer_descriptors.push(serde_json::json!({
                    "mediaType": crate::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    "digest": digest,
                    "size": layer.len(),
                }));
            }
            let manifest = serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "config": {
                    "mediaType": crate::manifest::IMAGE_CONFIG_MEDIA_TYPE,
                    "digest": config_digest,
                    "size": 0,
                },
                "layers": layer_descriptors,
            }))
            .unwrap();
            MemoryImage { manifest, blobs }
        }
    }

    #[async_trait]
    impl Image for MemoryImage {
        async fn raw_manifest(&self) -> Result<Bytes> {
            Ok(Bytes::from(self.manifest.clone()))
        }

        async fn blob_size(&self, digest: &Digest) -> Result<u64> {
            Ok(self.blobs[digest].len() as u64)
        }

        async fn blob(&self, digest: &Digest) -> Result<BlobStream> {
            let data = self.blobs.get(digest).cloned().unwrap_or_default();
            // Two chunks, so readers have to reassemble.
            let (a, b) = data.split_at(data.len() / 2);
            let chunks = vec![Ok(Bytes::copy_from_slice(a)), Ok(Bytes::copy_from_slice(b))];
            Ok(stream::iter(chunks).boxed())
        }

        async fn uncompressed_blob(&self, _digest: &Digest) -> Result<BlobStream> {
            Err(OciDistributionError::UnsupportedOperation(
                "uncompressed_blob".to_string(),
            ))
        }

        async fn uncompressed_layer(&self, _diff_id: &Digest) -> Result<BlobStream> {
            Err(OciDistributionError::UnsupportedOperation(
                "uncompressed_layer".to_string(),
            ))
        }
    }

    /// A tag that moves to `after` once its manifest has been read.
    struct MovingTag {
        before: MemoryImage,
        after: MemoryImage,
        manifest_reads: AtomicUsize,
    }

    #[async_trait]
    impl Image for MovingTag {
        async fn raw_manifest(&self) -> Result<Bytes> {
            if self.manifest_reads.fetch_add(1, Ordering::SeqCst) == 0 {
                self.before.raw_manifest().await
            } else {
                self.after.raw_manifest().await
            }
        }

        async fn blob_size(&self, digest: &Digest) -> Result<u64> {
            self.blob_image(digest).blob_size(digest).await
        }

        async fn blob(&self, digest: &Digest) -> Result<BlobStream> {
            self.blob_image(digest).blob(digest).await
        }

        async fn uncompressed_blob(&self, digest: &Digest) -> Result<BlobStream> {
            self.before.uncompressed_blob(digest).await
        }

        async fn uncompressed_layer(&self, diff_id: &Digest) -> Result<BlobStream> {
            self.before.uncompressed_layer(diff_id).await
        }
    }

    impl MovingTag {
        /// Both images stay in the registry; only the tag moves.
        fn blob_image(&self, digest: &Digest) -> &MemoryImage {
            if self.before.blobs.contains_key(digest) {
                &self.before
            } else {
                &self.after
            }
        }
    }

    const DIFF_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIFF_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[tokio::test]
    async fn layer_follows_diff_id_position() {
        let image = MemoryImage::new(&[b"first layer", b"second layer"], &[DIFF_A, DIFF_B]);

        let layer = image.layer(&DIFF_B.parse().unwrap()).await.unwrap();
        assert_eq!(&b"second layer"[..], &read_all(layer).await.unwrap()[..]);
        let layer = image.layer(&DIFF_A.parse().unwrap()).await.unwrap();
        assert_eq!(&b"first layer"[..], &read_all(layer).await.unwrap()[..]);
    }

    #[tokio::test]
    async fn layer_pairs_diff_ids_with_a_single_manifest() {
        let image = MovingTag {
            before: MemoryImage::new(&[b"before one", b"before two"], &[DIFF_A, DIFF_B]),
            after: MemoryImage::new(&[b"after one"], &[DIFF_B]),
            manifest_reads: AtomicUsize::new(0),
        };

        let layer = image.layer(&DIFF_B.parse().unwrap()).await.unwrap();
        assert_eq!(&b"before two"[..], &read_all(layer).await.unwrap()[..]);
        assert_eq!(1, image.manifest_reads.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_diff_id_is_layer_not_found() {
        let image = MemoryImage::new(&[b"first layer"], &[DIFF_A]);
        let missing: Digest = DIFF_B.parse().unwrap();
        match image.layer(&missing).await {
            Err(OciDistributionError::LayerNotFound(d)) => assert_eq!(missing, d),
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("expected LayerNotFound"),
        }
    }

    #[tokio::test]
    async fn diff_id_without_matching_layer_is_layer_not_found() {
        // More diff IDs than layers.
        let image = MemoryImage::new(&[b"first layer"], &[DIFF_A, DIFF_B]);
        assert!(matches!(
            image.layer(&DIFF_B.parse().unwrap()).await,
            Err(OciDistributionError::LayerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn blob_set_is_config_and_layers() {
        let image = MemoryImage::new(&[b"one", b"two", b"one"], &[DIFF_A, DIFF_B, DIFF_A]);
        let set = image.blob_set().await.unwrap();
        let mut expected: HashSet<Digest> = image.fs_layers().await.unwrap().into_iter().collect();
        expected.insert(image.config_name().await.unwrap());
        assert_eq!(expected, set);
        // A repeated layer is listed once.
        assert_eq!(3, set.len());
    }

    #[tokio::test]
    async fn media_type_defaults_to_docker_schema_2() {
        let image = MemoryImage::new(&[], &[]);
        assert_eq!(IMAGE_MANIFEST_MEDIA_TYPE, image.media_type().await.unwrap());
    }

    #[tokio::test]
    async fn digest_is_over_raw_manifest_bytes() {
        let image = MemoryImage::new(&[b"layer"], &[DIFF_A]);
        assert_eq!(
            Digest::sha256_bytes(&image.manifest),
            image.digest().await.unwrap()
        );
    }

    #[tokio::test]
    async fn pull_blob_verifies_content() {
        let image = MemoryImage::new(&[b"some layer bytes"], &[DIFF_A]);
        let digest = Digest::sha256_bytes(b"some layer bytes");
        let mut out: Vec<u8> = Vec::new();
        image.pull_blob(&digest, &mut out).await.unwrap();
        assert_eq!(b"some layer bytes".to_vec(), out);

        // Content served under a digest it does not hash to.
        let mut image = image;
        image.blobs.insert(digest.clone(), b"tampered".to_vec());
        let mut out: Vec<u8> = Vec::new();
        match image.pull_blob(&digest, &mut out).await {
            Err(OciDistributionError::DigestMismatch { expected, actual }) => {
                assert_eq!(digest, expected);
                assert_eq!(Digest::sha256_bytes(b"tampered"), actual);
            }
            other => panic!("expected DigestMismatch, got {:?}", other.err()),
        }
    }
}

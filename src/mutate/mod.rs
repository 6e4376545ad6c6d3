//! Building new image generations on top of an existing manifest.
//!
//! A [`Mutator`] is opened on a [`DescriptorPath`] ending in a manifest. Layers
//! and config edits accumulate in a pending builder and nothing is visible
//! until [`Mutator::commit`] writes a new config and manifest (and any nested
//! indexes on the way) as fresh blobs. Existing blobs are never modified and
//! the top-level index is left alone: publishing the result is up to the
//! caller.
use crate::{
    cancel::CancelToken,
    digest::{Digest, DigestReader},
    error::{Error, Result},
    image::{
        Descriptor, DescriptorPath, History, ImageConfig, ImageMeta, MEDIA_TYPE_IMAGE_LAYER,
        MEDIA_TYPE_IMAGE_LAYER_GZIP, Manifest, RuntimeConfig,
    },
    store::{Engine, EngineExt},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, io::Read, str::FromStr};

/// How new layer blobs are compressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    pub const fn media_type(self) -> &'static str {
        match self {
            Self::None => MEDIA_TYPE_IMAGE_LAYER,
            Self::Gzip => MEDIA_TYPE_IMAGE_LAYER_GZIP,
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            other => Err(Error::Invalid(format!("unknown compression '{other}'"))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        })
    }
}

/// Edits not yet committed.
#[derive(Debug, Default)]
struct Pending {
    config: Option<RuntimeConfig>,
    meta: Option<ImageMeta>,
    annotations: Option<BTreeMap<String, String>>,
    layers: Vec<Descriptor>,
    diff_ids: Vec<Digest>,
    history: Vec<History>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.config.is_none()
            && self.meta.is_none()
            && self.annotations.is_none()
            && self.layers.is_empty()
            && self.history.is_empty()
    }
}

pub struct Mutator<'a> {
    engine: &'a dyn Engine,
    source: DescriptorPath,
    manifest: Manifest,
    config: ImageConfig,
    pending: Pending,
    compression: Compression,
}

impl<'a> Mutator<'a> {
    /// Opens the manifest at the end of `source`.
    ///
    /// Fails with [`Error::UnknownType`] if `source` does not address an
    /// image manifest and with [`Error::Invalid`] if the manifest or its
    /// config cannot be parsed.
    #[tracing::instrument(level = "debug", skip_all, fields(manifest = %source.descriptor().digest))]
    pub fn new(ctx: &CancelToken, engine: &'a dyn Engine, source: DescriptorPath) -> Result<Self> {
        let manifest = engine.read_manifest(ctx, source.descriptor())?;
        let config = engine.read_config(ctx, &manifest.config)?;
        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            tracing::warn!(
                layers = manifest.layers.len(),
                diff_ids = config.rootfs.diff_ids.len(),
                "Manifest layer count does not match config diff_ids"
            );
        }
        Ok(Self {
            engine,
            source,
            manifest,
            config,
            pending: Pending::default(),
            compression: Compression::default(),
        })
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// The path of the manifest this mutator currently builds on.
    pub const fn source(&self) -> &DescriptorPath {
        &self.source
    }

    /// The config as it would be committed right now.
    pub fn config(&self) -> ImageConfig {
        let mut config = self.config.clone();
        if let Some(runtime) = &self.pending.config {
            config.config = Some(runtime.clone());
        }
        if let Some(meta) = &self.pending.meta {
            config.created = meta.created;
            config.author.clone_from(&meta.author);
            config.architecture.clone_from(&meta.architecture);
            config.os.clone_from(&meta.os);
        }
        config
            .rootfs
            .diff_ids
            .extend(self.pending.diff_ids.iter().cloned());
        config.history.extend(self.pending.history.iter().cloned());
        config
    }

    pub fn meta(&self) -> ImageMeta {
        self.pending
            .meta
            .clone()
            .unwrap_or_else(|| self.config.meta())
    }

    /// Manifest annotations as they would be committed right now.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.pending
            .annotations
            .clone()
            .unwrap_or_else(|| self.manifest.annotations.clone())
    }

    /// Replaces the runtime config, meta and annotations of the next commit.
    ///
    /// `history` is recorded as a metadata-only entry.
    pub fn set(
        &mut self,
        config: RuntimeConfig,
        meta: ImageMeta,
        annotations: BTreeMap<String, String>,
        history: Option<History>,
    ) {
        self.pending.config = Some(config);
        self.pending.meta = Some(meta);
        self.pending.annotations = Some(annotations);
        if let Some(mut history) = history {
            history.empty_layer = true;
            self.pending.history.push(history);
        }
    }

    /// Stores `layer` (an uncompressed tar stream) as a new top layer.
    ///
    /// The diff id is computed over the uncompressed stream; the blob is
    /// compressed according to [`Self::with_compression`].
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn add(
        &mut self,
        ctx: &CancelToken,
        layer: &mut dyn Read,
        history: Option<History>,
    ) -> Result<Descriptor> {
        let algorithm = self.engine.algorithm();
        let mut uncompressed = DigestReader::new(layer, algorithm);

        let (digest, size, diff_id) = match self.compression {
            Compression::None => {
                let (digest, size) = self.engine.put_blob(ctx, &mut uncompressed)?;
                let (diff_id, _) = uncompressed.finish();
                (digest, size, diff_id)
            }
            Compression::Gzip => {
                let mut encoder = flate2::read::GzEncoder::new(
                    &mut uncompressed,
                    flate2::Compression::default(),
                );
                let (digest, size) = self.engine.put_blob(ctx, &mut encoder)?;
                drop(encoder);
                let (diff_id, _) = uncompressed.finish();
                (digest, size, diff_id)
            }
        };

        let descriptor = Descriptor::new(self.compression.media_type(), digest, size);
        tracing::info!(
            digest = %descriptor.digest,
            %diff_id,
            size,
            "Added layer"
        );

        self.pending.layers.push(descriptor.clone());
        self.pending.diff_ids.push(diff_id);
        if let Some(mut history) = history {
            history.empty_layer = false;
            self.pending.history.push(history);
        }
        Ok(descriptor)
    }

    /// Writes the pending generation and returns the path to its manifest.
    ///
    /// Nested indexes along the source path are rewritten to point at the new
    /// manifest. Afterwards the mutator builds on the committed generation.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn commit(&mut self, ctx: &CancelToken) -> Result<DescriptorPath> {
        if self.pending.is_empty() {
            tracing::debug!("Committing without pending changes");
        }

        let config = self.config();
        let (config_digest, config_size) = self.engine.put_blob_json(ctx, &config)?;
        let mut manifest = self.manifest.clone();
        manifest.config = retarget(&self.manifest.config, config_digest, config_size);
        manifest
            .layers
            .extend(self.pending.layers.iter().cloned());
        manifest.annotations = self.annotations();

        let (manifest_digest, manifest_size) = self.engine.put_blob_json(ctx, &manifest)?;
        let walk = self.source.walk();
        let mut new_walk = walk.to_vec();
        let last = new_walk.len() - 1;
        new_walk[last] = retarget(&walk[last], manifest_digest, manifest_size);

        // Rewrite every nested index between the root and the manifest,
        // bottom up, so each points at its freshly written child.
        for i in (0..last).rev() {
            let mut index = self.engine.read_index_blob(ctx, &walk[i])?;
            let old_child = &walk[i + 1];
            let mut replaced = false;
            for entry in &mut index.manifests {
                if entry.same_target(old_child) {
                    *entry = retarget(entry, new_walk[i + 1].digest.clone(), new_walk[i + 1].size);
                    replaced = true;
                }
            }
            if !replaced {
                return Err(Error::Invalid(format!(
                    "index {} does not reference {}",
                    walk[i].digest, old_child.digest
                )));
            }
            let (digest, size) = self.engine.put_blob_json(ctx, &index)?;
            new_walk[i] = retarget(&walk[i], digest, size);
        }

        let committed = DescriptorPath::from_walk(new_walk)?;
        tracing::info!(
            manifest = %committed.descriptor().digest,
            layers = manifest.layers.len(),
            "Committed image"
        );

        self.manifest = manifest;
        self.config = config;
        self.source = committed.clone();
        self.pending = Pending::default();
        Ok(committed)
    }
}

/// A copy of `descriptor` pointing at different content.
fn retarget(descriptor: &Descriptor, digest: Digest, size: u64) -> Descriptor {
    let mut descriptor = descriptor.clone();
    descriptor.digest = digest;
    descriptor.size = size;
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{
        Index, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
    };
    use crate::store::{MemoryEngine, References};
    use serde_json::json;

    /// Writes a one-layer image and returns the path to its manifest.
    fn base_image(engine: &dyn Engine, ctx: &CancelToken) -> DescriptorPath {
        let layer = b"base layer bytes";
        let (layer_digest, layer_size) = engine.put_blob(ctx, &mut &layer[..]).unwrap();

        let config: ImageConfig = serde_json::from_value(json!({
            "created": "2024-05-01T00:00:00Z",
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/usr/bin"], "Volumes": {"/data": {}}},
            "rootfs": {"type": "layers", "x-squashed": false, "diff_ids": [layer_digest.to_string()]},
            "history": [{"created_by": "base", "x-builder": "stage-1"}]
        }))
        .unwrap();
        let (config_digest, config_size) = engine.put_blob_json(ctx, &config).unwrap();

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_owned()),
            config: Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_IMAGE_LAYER,
                layer_digest,
                layer_size,
            )],
            annotations: BTreeMap::new(),
            extra: BTreeMap::new(),
        };
        let (digest, size) = engine.put_blob_json(ctx, &manifest).unwrap();
        let descriptor = Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, digest, size);
        engine.put_reference(ctx, "base", &descriptor).unwrap();
        engine.resolve_reference(ctx, "base").unwrap().remove(0)
    }

    #[test]
    fn test_commit_without_changes_is_stable() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let source = base_image(&engine, &ctx);

        let mut mutator = Mutator::new(&ctx, &engine, source.clone()).unwrap();
        let committed = mutator.commit(&ctx).unwrap();
        assert_eq!(committed.descriptor().digest, source.descriptor().digest);
        assert_eq!(committed, source);
    }

    #[test]
    fn test_add_layer_and_commit() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let source = base_image(&engine, &ctx);
        let blobs_before = engine.list_blobs(&ctx).unwrap();
        let index_before = engine.get_index(&ctx).unwrap();

        let mut mutator = Mutator::new(&ctx, &engine, source.clone())
            .unwrap()
            .with_compression(Compression::None);
        let layer = b"second layer";
        let history = History {
            created_by: Some("test".to_owned()),
            empty_layer: true,
            ..History::default()
        };
        let added = mutator.add(&ctx, &mut &layer[..], Some(history)).unwrap();
        assert_eq!(added.media_type, MEDIA_TYPE_IMAGE_LAYER);

        let pending = mutator.config();
        assert_eq!(pending.rootfs.diff_ids.len(), 2);
        assert_eq!(pending.rootfs.diff_ids[1], added.digest);

        let committed = mutator.commit(&ctx).unwrap();
        assert_ne!(committed.descriptor().digest, source.descriptor().digest);

        let manifest = engine.read_manifest(&ctx, committed.descriptor()).unwrap();
        let base = engine.read_manifest(&ctx, source.descriptor()).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0], base.layers[0]);
        assert_eq!(manifest.layers[1], added);

        let config = engine.read_config(&ctx, &manifest.config).unwrap();
        assert_eq!(config.history.len(), 2);
        assert!(!config.history[1].empty_layer);
        assert_eq!(config.history[1].created_by.as_deref(), Some("test"));
        assert_eq!(config.volumes(), vec!["/data".to_owned()]);
        assert_eq!(config.history[0].extra["x-builder"], json!("stage-1"));
        assert_eq!(config.rootfs.extra["x-squashed"], json!(false));

        // Nothing existing was touched.
        for digest in blobs_before {
            assert!(engine.get_blob(&ctx, &digest).is_ok());
        }
        assert_eq!(engine.get_index(&ctx).unwrap(), index_before);
    }

    #[test]
    fn test_gzip_layer_diff_id_is_uncompressed_digest() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let source = base_image(&engine, &ctx);

        let mut mutator = Mutator::new(&ctx, &engine, source).unwrap();
        let layer = vec![b'z'; 10_000];
        let added = mutator.add(&ctx, &mut layer.as_slice(), None).unwrap();
        assert_eq!(added.media_type, MEDIA_TYPE_IMAGE_LAYER_GZIP);
        assert!(added.size < 10_000);

        let diff_id = mutator.config().rootfs.diff_ids[1].clone();
        assert_eq!(diff_id, engine.algorithm().digest_bytes(&layer));
        assert_ne!(diff_id, added.digest);

        let compressed = engine.read_blob(&ctx, &added.digest).unwrap();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, layer);
    }

    #[test]
    fn test_set_records_empty_layer_history() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let source = base_image(&engine, &ctx);
        let mut mutator = Mutator::new(&ctx, &engine, source).unwrap();

        let mut meta = mutator.meta();
        meta.author = Some("someone".to_owned());
        let mut annotations = BTreeMap::new();
        annotations.insert("org.example.note".to_owned(), "hi".to_owned());
        mutator.set(
            RuntimeConfig::default(),
            meta,
            annotations.clone(),
            Some(History::default()),
        );

        assert_eq!(mutator.meta().author.as_deref(), Some("someone"));
        assert_eq!(mutator.annotations(), annotations);
        let config = mutator.config();
        assert!(config.history.last().unwrap().empty_layer);
        assert!(config.volumes().is_empty());

        let committed = mutator.commit(&ctx).unwrap();
        let manifest = engine.read_manifest(&ctx, committed.descriptor()).unwrap();
        assert_eq!(manifest.annotations, annotations);
    }

    #[test]
    fn test_chained_commits_do_not_duplicate_layers() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let source = base_image(&engine, &ctx);
        let mut mutator = Mutator::new(&ctx, &engine, source).unwrap();

        mutator.add(&ctx, &mut &b"one"[..], None).unwrap();
        let first = mutator.commit(&ctx).unwrap();
        mutator.add(&ctx, &mut &b"two"[..], None).unwrap();
        let second = mutator.commit(&ctx).unwrap();

        assert_eq!(mutator.source(), &second);
        let first = engine.read_manifest(&ctx, first.descriptor()).unwrap();
        let second = engine.read_manifest(&ctx, second.descriptor()).unwrap();
        assert_eq!(first.layers.len(), 2);
        assert_eq!(second.layers.len(), 3);
    }

    #[test]
    fn test_commit_rewrites_nested_index() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let base = base_image(&engine, &ctx);

        let nested = Index {
            manifests: vec![base.descriptor().clone()],
            ..Index::default()
        };
        let (digest, size) = engine.put_blob_json(&ctx, &nested).unwrap();
        let nested_desc = Descriptor::new(MEDIA_TYPE_IMAGE_INDEX, digest, size);
        engine.put_reference(&ctx, "nested", &nested_desc).unwrap();
        let source = engine.resolve_reference(&ctx, "nested").unwrap().remove(0);
        assert_eq!(source.walk().len(), 2);

        let mut mutator = Mutator::new(&ctx, &engine, source.clone()).unwrap();
        mutator.add(&ctx, &mut &b"layer"[..], None).unwrap();
        let committed = mutator.commit(&ctx).unwrap();

        assert_eq!(committed.walk().len(), 2);
        assert_ne!(committed.root().digest, source.root().digest);
        assert_eq!(committed.root().ref_name(), Some("nested"));
        let index = engine.read_index_blob(&ctx, committed.root()).unwrap();
        assert_eq!(index.manifests, vec![committed.descriptor().clone()]);
    }

    #[test]
    fn test_new_rejects_non_manifest() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let (digest, size) = engine.put_blob(&ctx, &mut &b"{}"[..]).unwrap();
        let path = DescriptorPath::new(Descriptor::new(MEDIA_TYPE_IMAGE_LAYER, digest, size));
        assert!(
            Mutator::new(&ctx, &engine, path)
                .err()
                .unwrap()
                .is_unknown_type()
        );
    }

    #[test]
    fn test_new_rejects_malformed_config() {
        let engine = MemoryEngine::default();
        let ctx = CancelToken::new();
        let (config_digest, config_size) = engine.put_blob(&ctx, &mut &b"not json"[..]).unwrap();
        let manifest = Manifest {
            schema_version: 2,
            media_type: None,
            config: Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size),
            layers: Vec::new(),
            annotations: BTreeMap::new(),
            extra: BTreeMap::new(),
        };
        let (digest, size) = engine.put_blob_json(&ctx, &manifest).unwrap();
        let path = DescriptorPath::new(Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, digest, size));
        assert!(matches!(
            Mutator::new(&ctx, &engine, path),
            Err(Error::Invalid(_))
        ));
    }
}

//! The repack pipeline: bundle rootfs in, new image generation out.
//!
//! ```text
//! bundle meta ─► baseline ─► changes ─► mask filter ─► layer ─► Mutator::add
//!                                                              ─► Mutator::commit
//!                                                              ─► update_reference
//! ```
//!
//! Every step tags its errors with a [`Stage`]. The reference is only
//! published once the commit succeeded, so a failed repack leaves the index
//! untouched (it may leave unreferenced blobs behind).
use crate::{
    bundle::{Bundle, BundleMeta},
    cancel::CancelToken,
    diff::{self, ChangeDetector},
    digest::Digest,
    error::{Error, Result, Stage, StageExt},
    image::{DescriptorPath, History, MEDIA_TYPE_IMAGE_MANIFEST},
    layer::{MapOptions, generate_layer},
    mutate::{Compression, Mutator},
    store::{Engine, EngineExt, References},
};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Values that replace the defaults of the recorded history entry.
#[derive(Debug, Clone, Default)]
pub struct HistoryOverrides {
    pub author: Option<String>,
    pub comment: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepackOptions {
    /// Reference the new manifest is published under.
    pub tag: String,
    pub mask_paths: Vec<PathBuf>,
    /// Also mask the volumes declared by the image config.
    pub mask_volumes: bool,
    /// Record a new baseline and point the bundle at the new manifest.
    pub refresh_bundle: bool,
    pub compression: Compression,
    pub history: HistoryOverrides,
}

impl RepackOptions {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            mask_paths: Vec::new(),
            mask_volumes: true,
            refresh_bundle: false,
            compression: Compression::default(),
            history: HistoryOverrides::default(),
        }
    }
}

/// Turns the changes made to `bundle`'s rootfs into a new layer on top of
/// the image it was bound to and publishes the result as `options.tag`.
///
/// Returns the path to the new manifest.
#[tracing::instrument(skip_all, fields(bundle = %bundle.path().display(), tag = %options.tag))]
pub fn repack(
    ctx: &CancelToken,
    engine: &dyn Engine,
    bundle: &Bundle,
    options: &RepackOptions,
) -> Result<DescriptorPath> {
    let mut meta = bundle.read_meta().stage(Stage::ReadBundle)?;
    tracing::debug!(
        version = %meta.version,
        from = %meta.from.descriptor().digest,
        rootless = meta.map_options.rootless,
        "Loaded bundle metadata"
    );
    let from = meta.from.descriptor();
    if from.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
        return Err(Error::NotImplemented(format!(
            "bundle was bound to a {} rather than an image manifest",
            from.media_type
        )))
        .stage(Stage::ReadBundle);
    }
    let base_digest = from.digest.clone();

    let mut mutator = Mutator::new(ctx, engine, meta.from.clone())
        .stage(Stage::OpenStore)?
        .with_compression(options.compression);

    let baseline = bundle
        .read_baseline(&base_digest)
        .stage(Stage::ParseBaseline)?;

    tracing::info!("Computing filesystem diff");
    let rootfs = bundle.rootfs_path();
    let changes = baseline.changes(&rootfs).stage(Stage::ComputeDiff)?;

    let mut masks = options.mask_paths.clone();
    if options.mask_volumes {
        masks.extend(mutator.config().volumes().into_iter().map(PathBuf::from));
    }
    let total = changes.len();
    let changes = diff::filter(changes, &masks);
    tracing::info!(
        changes = changes.len(),
        masked = total - changes.len(),
        "Filesystem diff done"
    );

    let mut layer = generate_layer(ctx, rootfs, changes, meta.map_options.clone())
        .stage(Stage::GenerateLayer)?;

    let image_meta = mutator.meta();
    let overrides = &options.history;
    let history = History {
        created: Some(overrides.created.unwrap_or_else(Utc::now)),
        created_by: overrides.created_by.clone(),
        author: overrides.author.clone().or(image_meta.author),
        comment: overrides.comment.clone(),
        ..History::default()
    };
    mutator
        .add(ctx, &mut layer, Some(history))
        .stage(Stage::AddLayer)?;
    drop(layer);

    let committed = mutator.commit(ctx).stage(Stage::Commit)?;
    tracing::info!(
        "New image manifest created: {} -> {}",
        committed.root().digest,
        committed.descriptor().digest
    );

    engine
        .update_reference(ctx, &options.tag, committed.root())
        .stage(Stage::PublishReference)?;
    tracing::info!("Tagged new image manifest as {}", options.tag);

    if options.refresh_bundle {
        refresh(bundle, &mut meta, &committed, &base_digest).stage(Stage::RefreshBundle)?;
    }
    Ok(committed)
}

fn refresh(
    bundle: &Bundle,
    meta: &mut BundleMeta,
    committed: &DescriptorPath,
    base_digest: &Digest,
) -> Result<()> {
    let new_digest = &committed.descriptor().digest;
    bundle.record_baseline(new_digest)?;
    if new_digest != base_digest {
        bundle.remove_baseline(base_digest)?;
    }
    meta.from = committed.clone();
    bundle.write_meta(meta)?;
    tracing::info!("Bundle now tracks {new_digest}");
    Ok(())
}

/// Binds the existing rootfs of `bundle` to the manifest `reference` points
/// at and records its baseline.
///
/// The rootfs is expected to already hold the unpacked image.
#[tracing::instrument(skip(ctx, engine, bundle, map_options), fields(bundle = %bundle.path().display()))]
pub fn init_bundle(
    ctx: &CancelToken,
    engine: &dyn Engine,
    bundle: &Bundle,
    reference: &str,
    map_options: MapOptions,
) -> Result<BundleMeta> {
    if bundle.meta_path().exists() {
        return Err(Error::Clobber(format!(
            "{} is already bound to an image",
            bundle.path().display()
        )));
    }
    let rootfs = bundle.rootfs_path();
    if !rootfs.is_dir() {
        return Err(Error::Invalid(format!(
            "bundle has no rootfs directory at {}",
            rootfs.display()
        )));
    }

    let mut paths = engine.resolve_reference(ctx, reference)?;
    let from = match paths.len() {
        0 => {
            return Err(Error::NotFound(format!(
                "no image manifest for reference '{reference}'"
            )));
        }
        1 => paths.remove(0),
        n => {
            return Err(Error::Invalid(format!(
                "reference '{reference}' is ambiguous: {n} manifests match"
            )));
        }
    };
    engine.read_manifest(ctx, from.descriptor())?;

    let meta = BundleMeta::new(from, map_options);
    bundle.record_baseline(&meta.from.descriptor().digest)?;
    bundle.write_meta(&meta)?;
    tracing::info!(
        "Bound {} to {}",
        rootfs.display(),
        meta.from.descriptor().digest
    );
    Ok(meta)
}

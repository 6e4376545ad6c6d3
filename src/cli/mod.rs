use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::{CONFIG_ENV, Config};
use crate::error::{Stage, StageExt};
use crate::layer::{IdMapping, MapOptions};
use crate::mutate::Compression;
use crate::repack::{self, HistoryOverrides, RepackOptions};
use crate::store::{self, DirEngine, Engine, References};
use crate::util;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rustix::process::geteuid;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// An image layout path with a reference name, written `<path>[:<tag>]`.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub layout: PathBuf,
    pub tag: String,
}

impl FromStr for ImageRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (layout, tag) = util::parse_image_ref(s)?;
        Ok(Self {
            layout: PathBuf::from(layout),
            tag,
        })
    }
}

#[derive(Parser, Debug)]
pub struct Cli {
    /// Settings file
    #[clap(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
#[clap(version, about, author)]
pub enum Commands {
    /// Create an empty image layout
    #[clap(name = "init")]
    Init {
        /// Directory to create the layout in
        #[clap(long)]
        layout: PathBuf,
    },

    /// Bind an unpacked rootfs to an image and record its baseline
    #[clap(name = "init-bundle")]
    InitBundle {
        /// Image the rootfs was unpacked from, as <path>[:<tag>]
        #[clap(long)]
        image: ImageRef,

        /// Bundle directory holding rootfs/
        #[clap(value_parser)]
        bundle: PathBuf,

        /// uid mapping <container>:<host>:<size>, may be repeated
        #[clap(long = "uid-map")]
        uid_map: Vec<IdMapping>,

        /// gid mapping <container>:<host>:<size>, may be repeated
        #[clap(long = "gid-map")]
        gid_map: Vec<IdMapping>,

        /// Tolerate what an unprivileged user cannot read (implied when not root)
        #[clap(long)]
        rootless: bool,
    },

    /// Repack a bundle's changes into a new layer and tag the result
    #[clap(name = "repack", aliases = &["commit"])]
    Repack {
        /// Image to update, as <path>[:<new-tag>]
        #[clap(long)]
        image: ImageRef,

        /// Bundle directory created by init-bundle
        #[clap(value_parser)]
        bundle: PathBuf,

        /// Path prefix whose changes are left out of the layer, may be repeated
        #[clap(long = "mask-path")]
        mask_path: Vec<PathBuf>,

        /// Do not mask the volumes declared by the image config
        #[clap(long)]
        no_mask_volumes: bool,

        /// Point the bundle at the new image afterwards
        #[clap(long)]
        refresh_bundle: bool,

        /// Layer compression: gzip or none
        #[clap(long)]
        compression: Option<Compression>,

        #[clap(long = "history.author")]
        history_author: Option<String>,

        #[clap(long = "history.comment")]
        history_comment: Option<String>,

        /// RFC 3339 timestamp of the history entry (default: now)
        #[clap(long = "history.created")]
        history_created: Option<DateTime<Utc>>,

        #[clap(long = "history.created_by")]
        history_created_by: Option<String>,
    },

    /// Point a new reference at the image of an existing one
    #[clap(name = "tag", aliases = &["t"])]
    Tag {
        /// Source reference, as <path>[:<tag>]
        #[clap(long)]
        image: ImageRef,

        /// New reference name
        #[clap(value_parser)]
        new_tag: String,
    },

    /// Remove a reference
    #[clap(name = "rm", aliases = &["remove", "untag"])]
    Remove {
        /// Reference to remove, as <path>[:<tag>]
        #[clap(long)]
        image: ImageRef,
    },

    /// List references
    #[clap(name = "ls", aliases = &["list"])]
    List {
        #[clap(long)]
        layout: PathBuf,
    },

    /// Remove temporary files left behind by interrupted operations
    #[clap(name = "clean", aliases = &["gc"])]
    Clean {
        #[clap(long)]
        layout: PathBuf,
    },
}

fn open_engine(layout: &Path, config: &Config) -> Result<DirEngine, String> {
    DirEngine::open(layout, config.store)
        .stage(Stage::OpenStore)
        .map_err(|e| format!("Failed to open {}: {}", layout.display(), e))
}

fn close_engine(mut engine: DirEngine) -> Result<(), String> {
    engine
        .close()
        .map_err(|e| format!("Failed to close image store: {}", e))
}

impl Cli {
    pub fn run(self) -> Result<(), String> {
        let config = Config::load(self.config.as_deref())
            .map_err(|e| format!("Failed to load config: {}", e))?;
        let ctx = CancelToken::new();
        tracing::trace!("Running command: {:?}", self.command);
        match self.command {
            Commands::Init { layout } => {
                store::create_layout(&layout, config.store)
                    .map_err(|e| format!("Failed to create layout: {}", e))?;
                println!("Created image layout at {}", layout.display());
                Ok(())
            }
            Commands::InitBundle {
                image,
                bundle,
                uid_map,
                gid_map,
                rootless,
            } => {
                let rootless = rootless || !geteuid().is_root();
                let map_options = MapOptions {
                    uid_mappings: uid_map,
                    gid_mappings: gid_map,
                    rootless,
                };
                let engine = open_engine(&image.layout, &config)?;
                let meta = repack::init_bundle(
                    &ctx,
                    &engine,
                    &Bundle::new(&bundle),
                    &image.tag,
                    map_options,
                )
                .map_err(|e| format!("Failed to initialise bundle: {}", e))?;
                close_engine(engine)?;
                println!(
                    "{} bound to {}",
                    bundle.display(),
                    meta.from.descriptor().digest
                );
                Ok(())
            }
            Commands::Repack {
                image,
                bundle,
                mask_path,
                no_mask_volumes,
                refresh_bundle,
                compression,
                history_author,
                history_comment,
                history_created,
                history_created_by,
            } => {
                let options = RepackOptions {
                    tag: image.tag,
                    mask_paths: mask_path,
                    mask_volumes: config.repack.mask_volumes && !no_mask_volumes,
                    refresh_bundle,
                    compression: compression.unwrap_or(config.repack.compression),
                    history: HistoryOverrides {
                        author: history_author,
                        comment: history_comment,
                        created: history_created,
                        created_by: Some(
                            history_created_by.unwrap_or_else(|| config.repack.created_by.clone()),
                        ),
                    },
                };
                tracing::info!(
                    "Repacking {} into {}:{}",
                    bundle.display(),
                    image.layout.display(),
                    options.tag
                );
                let engine = open_engine(&image.layout, &config)?;
                let committed = repack::repack(&ctx, &engine, &Bundle::new(&bundle), &options)
                    .map_err(|e| format!("Failed to repack {}: {}", bundle.display(), e))?;
                close_engine(engine)?;
                println!("{}", committed.descriptor().digest);
                Ok(())
            }
            Commands::Tag { image, new_tag } => {
                let engine = open_engine(&image.layout, &config)?;
                let descriptor = engine
                    .get_reference(&ctx, &image.tag)
                    .map_err(|e| format!("Failed to resolve '{}': {}", image.tag, e))?;
                tracing::info!("Tagging {} as '{}'", descriptor.digest, new_tag);
                engine
                    .update_reference(&ctx, &new_tag, &descriptor)
                    .map_err(|e| format!("Failed to tag '{}': {}", new_tag, e))?;
                close_engine(engine)?;
                println!("Tagged {} as '{}'", descriptor.digest, new_tag);
                Ok(())
            }
            Commands::Remove { image } => {
                let engine = open_engine(&image.layout, &config)?;
                tracing::info!("Removing reference '{}'", image.tag);
                engine
                    .delete_reference(&ctx, &image.tag)
                    .map_err(|e| format!("Failed to remove '{}': {}", image.tag, e))?;
                close_engine(engine)?;
                println!("Removed reference '{}'", image.tag);
                Ok(())
            }
            Commands::List { layout } => {
                let engine = open_engine(&layout, &config)?;
                let names = engine
                    .list_references(&ctx)
                    .map_err(|e| format!("Failed to list references: {}", e))?;
                close_engine(engine)?;
                for name in names {
                    println!("{}", name);
                }
                Ok(())
            }
            Commands::Clean { layout } => {
                let engine = open_engine(&layout, &config)?;
                engine
                    .clean(&ctx)
                    .map_err(|e| format!("Failed to clean {}: {}", layout.display(), e))?;
                close_engine(engine)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repack_args() {
        let cli = Cli::try_parse_from([
            "oci-repack",
            "repack",
            "--image",
            "/srv/image:v2",
            "--mask-path",
            "/var/cache",
            "--mask-path",
            "/tmp",
            "--history.created",
            "2024-05-01T12:00:00Z",
            "--compression",
            "none",
            "bundle",
        ])
        .unwrap();
        let Commands::Repack {
            image,
            bundle,
            mask_path,
            compression,
            history_created,
            no_mask_volumes,
            ..
        } = cli.command
        else {
            panic!("expected repack");
        };
        assert_eq!(image.layout, PathBuf::from("/srv/image"));
        assert_eq!(image.tag, "v2");
        assert_eq!(bundle, PathBuf::from("bundle"));
        assert_eq!(mask_path.len(), 2);
        assert_eq!(compression, Some(Compression::None));
        assert_eq!(
            history_created.unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
        assert!(!no_mask_volumes);
    }

    #[test]
    fn test_parse_init_bundle_mappings() {
        let cli = Cli::try_parse_from([
            "oci-repack",
            "init-bundle",
            "--image",
            "img",
            "--uid-map",
            "0:1000:1",
            "bundle",
        ])
        .unwrap();
        let Commands::InitBundle { image, uid_map, .. } = cli.command else {
            panic!("expected init-bundle");
        };
        assert_eq!(image.tag, util::DEFAULT_TAG);
        assert_eq!(uid_map[0].host_id, 1000);
    }

    #[test]
    fn test_rejects_empty_tag() {
        assert!(Cli::try_parse_from(["oci-repack", "rm", "--image", "img:"]).is_err());
    }
}

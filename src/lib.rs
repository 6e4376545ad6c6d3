//! Produce new OCI image generations from edited rootfs bundles.
//!
//! An image layout is opened as a content-addressable [`store::Engine`].
//! A bundle's rootfs is compared against its recorded [`baseline`], the
//! change-set is filtered through [`diff::filter`] and turned into a layer
//! archive by [`layer`], and a [`mutate::Mutator`] commits that layer as a new
//! manifest on top of the original image. [`repack`] wires these together.
pub mod baseline;
pub mod bundle;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod image;
pub mod layer;
pub mod mutate;
pub mod repack;
pub mod store;
pub mod util;

//! Image store: content-addressed layers, tag index, tarball import/export
//! and the Buildfile-driven builder.

mod builder;
mod layers;
mod reference;
mod store;
mod tarball;
mod types;

pub use builder::{BuildInstruction, BuildOptions, parse_buildfile};
pub use layers::{apply_layer_tar, pack_layer};
pub use reference::ImageReference;
pub use store::ImageStore;
pub use types::{ImageConfigBlob, ImageManifest, ImageRecord, RuntimeDefaults};

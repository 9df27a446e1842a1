pub mod codec;
pub mod common;
pub mod error;
pub mod filter;
pub mod import;
pub mod paths;
pub mod ply;
pub mod settings;
mod structures;

pub use error::{ConversionError, FailureKind};
pub use import::{AssetImporter, PendingImports};
pub use paths::PlannedArtifacts;
pub use settings::Settings;
pub use structures::{
    ConversionParameters, DeletionMask, PointRecord, PointSet, PointSource, TextureSize,
};

use std::path::Path;

/// Reads a splat PLY and writes it back out in the full 62-property layout at `destination`,
/// dropping cutouts. Returns the number of exported points.
pub fn export_ply_file(raw_ply: &[u8], destination: &Path) -> Result<usize, ConversionError> {
    let set = ply::read_point_set(raw_ply)?;
    ply::export(&set, destination)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    pub mod client;
    pub mod pipeline;

    pub use client::{ConversionClient, MeshService};
    pub use pipeline::{
        CancelHandle, ConversionJob, ConversionPipeline, ConversionRequest, JobOutcome, JobStatus,
    };
}
}

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::common::{MESH_EXTENSION, POINT_CLOUD_EXTENSION};
use crate::error::ConversionError;

/// Where one model's artifacts live. Paths always use `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlannedArtifacts {
    pub model_name: String,
    pub model_directory: String,
    pub point_cloud_path: String,
    pub mesh_path: String,
}

impl PlannedArtifacts {
    pub fn point_cloud_file_name(&self) -> String {
        format!("{}.{}", self.model_name, POINT_CLOUD_EXTENSION)
    }

    pub fn mesh_file_name(&self) -> String {
        format!("{}.{}", self.model_name, MESH_EXTENSION)
    }
}

#[inline]
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

pub(crate) fn validate_model_name(model_name: &str) -> Result<(), ConversionError> {
    if model_name.is_empty()
        || model_name == "."
        || model_name == ".."
        || model_name.contains(['/', '\\'])
    {
        return Err(ConversionError::InvalidDestination(format!(
            "model name '{}' must be a single, non-empty path component",
            model_name
        )));
    }
    Ok(())
}

/// Computes the artifact paths without touching the filesystem.
pub fn artifact_paths(
    base_directory: &str,
    model_name: &str,
) -> Result<PlannedArtifacts, ConversionError> {
    validate_model_name(model_name)?;
    let base = normalize_separators(base_directory);
    let trimmed = base.trim_end_matches('/');
    let model_directory = if !trimmed.is_empty() {
        format!("{}/{}", trimmed, model_name)
    } else if base.starts_with('/') {
        format!("/{}", model_name)
    } else {
        model_name.to_string()
    };
    Ok(PlannedArtifacts {
        point_cloud_path: format!(
            "{}/{}.{}",
            model_directory, model_name, POINT_CLOUD_EXTENSION
        ),
        mesh_path: format!("{}/{}.{}", model_directory, model_name, MESH_EXTENSION),
        model_name: model_name.to_string(),
        model_directory,
    })
}

/// Plans `base/model/model.ply` and `base/model/model.fbx` and makes sure `base/model` exists.
/// Calling it again for the same inputs is a no-op.
pub fn plan(base_directory: &str, model_name: &str) -> Result<PlannedArtifacts, ConversionError> {
    let planned = artifact_paths(base_directory, model_name)?;
    let dir = Path::new(&planned.model_directory);
    if dir.is_dir() {
        debug!("Folder exists {}", planned.model_directory);
    } else {
        debug!("Creating folder {}", planned.model_directory);
        fs::create_dir_all(dir).map_err(|e| ConversionError::io_at(dir, e))?;
    }
    Ok(planned)
}

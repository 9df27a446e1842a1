use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::ConversionError;

/// Host-side importer that turns a persisted mesh file into a usable asset.
pub trait AssetImporter {
    fn import_file(&mut self, path: &str) -> Result<(), ConversionError>;
    fn notify_import_complete(&mut self, path: &str);
}

/// Mesh paths written by the pipeline that the host has not imported yet.
#[derive(Debug, Clone, Default)]
pub struct PendingImports {
    paths: Arc<Mutex<Vec<String>>>,
}

impl PendingImports {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark(&self, path: &str) {
        let mut paths = self.guard();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.guard().iter().any(|p| p == path)
    }

    /// Returns whether the path was pending.
    pub fn clear(&self, path: &str) -> bool {
        let mut paths = self.guard();
        let before = paths.len();
        paths.retain(|p| p != path);
        before != paths.len()
    }

    pub fn pending(&self) -> Vec<String> {
        self.guard().clone()
    }

    /// Runs the importer for `path` and clears the mark once it reports completion.
    /// A failed import leaves the path pending.
    pub fn finish<I: AssetImporter + ?Sized>(
        &self,
        importer: &mut I,
        path: &str,
    ) -> Result<(), ConversionError> {
        importer.import_file(path)?;
        importer.notify_import_complete(path);
        self.clear(path);
        debug!("Import finished for {}", path);
        Ok(())
    }
}

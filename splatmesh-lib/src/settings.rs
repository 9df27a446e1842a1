use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::deg_to_rad;
use crate::error::ConversionError;
use crate::structures::{ConversionParameters, TextureSize};

pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:8000/process";
pub const DEFAULT_CONVERTED_MODELS_PATH: &str = "GeneratedModels/Mesh";
pub const MAX_ANGLE_LIMIT_DEGREES: u32 = 360;

/// Conversion settings handed to the pipeline when a job is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub conversion_service_url: String,
    pub converted_models_path: String,
    /// Also dump the outgoing form fields at info level.
    pub log_to_console: bool,
    pub min_detail_size: f32,
    pub simplify: f32,
    pub angle_limit_degrees: u32,
    pub texture_size: TextureSize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            conversion_service_url: DEFAULT_SERVICE_URL.to_string(),
            converted_models_path: DEFAULT_CONVERTED_MODELS_PATH.to_string(),
            log_to_console: false,
            min_detail_size: 0.01,
            simplify: 0.0,
            angle_limit_degrees: 60,
            texture_size: TextureSize::Size2048,
        }
    }
}

impl Settings {
    pub fn from_json(text: &str) -> Result<Self, ConversionError> {
        let settings: Settings =
            serde_json::from_str(text).map_err(|e| ConversionError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConversionError> {
        let text = fs::read_to_string(path).map_err(|e| ConversionError::io_at(path, e))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConversionError> {
        serde_json::to_string_pretty(self).map_err(|e| ConversionError::Settings(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConversionError> {
        fs::write(path, self.to_json()?).map_err(|e| ConversionError::io_at(path, e))
    }

    pub fn reset_conversion_parameters(&mut self) {
        let defaults = Settings::default();
        self.min_detail_size = defaults.min_detail_size;
        self.simplify = defaults.simplify;
        self.angle_limit_degrees = defaults.angle_limit_degrees;
        self.texture_size = defaults.texture_size;
    }

    pub fn validate(&self) -> Result<(), ConversionError> {
        let url = self.conversion_service_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConversionError::Settings(format!(
                "conversion_service_url must be an http(s) URL, got '{}'",
                self.conversion_service_url
            )));
        }
        if self.angle_limit_degrees > MAX_ANGLE_LIMIT_DEGREES {
            return Err(ConversionError::Settings(format!(
                "angle_limit_degrees must be within 0..={}, got {}",
                MAX_ANGLE_LIMIT_DEGREES, self.angle_limit_degrees
            )));
        }
        self.conversion_parameters().validate()
    }

    /// Request parameters with the angle converted to radians.
    pub fn conversion_parameters(&self) -> ConversionParameters {
        ConversionParameters {
            min_detail_size: self.min_detail_size,
            simplify: self.simplify,
            angle_limit_radians: deg_to_rad(self.angle_limit_degrees as f32),
            texture_size: self.texture_size,
        }
    }
}

//! Multipart upload to the splat-to-mesh conversion service.

use std::future::Future;

use reqwest::multipart::{Form, Part};
use tracing::{debug, info};

use crate::common::format_invariant;
use crate::error::ConversionError;
use crate::settings::Settings;
use crate::structures::ConversionParameters;

/// One request/response exchange: exported PLY bytes in, mesh bytes out.
pub trait MeshService {
    fn submit(
        &self,
        file_bytes: Vec<u8>,
        file_name: &str,
        parameters: &ConversionParameters,
    ) -> impl Future<Output = Result<Vec<u8>, ConversionError>> + Send;
}

/// Text fields sent next to the file part, formatted the way the service parses them.
pub fn form_fields(parameters: &ConversionParameters) -> [(&'static str, String); 4] {
    [
        ("min_detail", format_invariant(parameters.min_detail_size)),
        ("simplify", format_invariant(parameters.simplify)),
        ("angle_limit", format_invariant(parameters.angle_limit_radians)),
        ("texture_size", parameters.texture_size.pixels().to_string()),
    ]
}

#[derive(Debug, Clone)]
pub struct ConversionClient {
    client: reqwest::Client,
    url: String,
    log_parameters: bool,
}

impl ConversionClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ConversionError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConversionError::Settings(format!("HTTP client: {}", e)))?;
        Ok(ConversionClient {
            client,
            url: url.into(),
            log_parameters: false,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConversionError> {
        let mut client = Self::new(settings.conversion_service_url.trim())?;
        client.log_parameters = settings.log_to_console;
        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl MeshService for ConversionClient {
    async fn submit(
        &self,
        file_bytes: Vec<u8>,
        file_name: &str,
        parameters: &ConversionParameters,
    ) -> Result<Vec<u8>, ConversionError> {
        let fields = form_fields(parameters);
        if self.log_parameters {
            info!(
                "Sending mesh conversion params min_detail:{}, simplify:{}, angle_limit:{}, texture_size:{}",
                fields[0].1, fields[1].1, fields[2].1, fields[3].1
            );
        }

        let upload_size = file_bytes.len();
        let part = Part::bytes(file_bytes)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(ConversionError::upload_failed)?;
        let form = fields
            .into_iter()
            .fold(Form::new().part("file", part), |form, (name, value)| {
                form.text(name, value)
            });

        debug!(url = %self.url, bytes = upload_size, file = file_name, "uploading point cloud");
        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(ConversionError::upload_failed)?
            .error_for_status()
            .map_err(ConversionError::upload_failed)?;

        let body = response
            .bytes()
            .await
            .map_err(ConversionError::upload_failed)?;
        debug!(bytes = body.len(), "received conversion response");
        Ok(body.to_vec())
    }
}

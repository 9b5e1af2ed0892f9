//! Multipart uploads to platform media endpoints.

use std::time::Duration;

use serde_json::Value;

use crate::{
    UPLOAD_TIMEOUT_SECS,
    error::{Error, Result},
    mime::mime_for_extension,
};

pub struct UploadRequest {
    /// Full endpoint URL; access tokens ride in the query string or in
    /// `bearer`.
    pub url: String,
    /// Multipart field name, `media` for the WeCom family.
    pub field_name: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Explicit MIME; derived from the filename extension otherwise.
    pub mime: Option<String>,
    /// Extra text fields some platforms require (`image_type`, ...).
    pub extra_fields: Vec<(String, String)>,
    pub bearer: Option<String>,
}

/// POST a file as `multipart/form-data` and return the parsed JSON
/// response. The multipart boundary is unique per request.
pub async fn upload_multipart(http: &reqwest::Client, request: UploadRequest) -> Result<Value> {
    let mime = request.mime.clone().unwrap_or_else(|| {
        let ext = request.file_name.rsplit('.').next().unwrap_or("");
        mime_for_extension(ext).to_string()
    });

    let part = reqwest::multipart::Part::bytes(request.bytes)
        .file_name(request.file_name.clone())
        .mime_str(&mime)
        .map_err(|e| Error::external("multipart mime", e))?;
    let mut form = reqwest::multipart::Form::new().part(request.field_name.clone(), part);
    for (name, value) in &request.extra_fields {
        form = form.text(name.clone(), value.clone());
    }

    let mut builder = http
        .post(&request.url)
        .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
        .multipart(form);
    if let Some(bearer) = &request.bearer {
        builder = builder.bearer_auth(bearer);
    }
    let response = builder
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    operation: "media upload",
                    seconds: UPLOAD_TIMEOUT_SECS,
                }
            } else {
                Error::external("media upload", e)
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            context: "media upload".into(),
            status: status.as_u16(),
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| Error::external("media upload response", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_defaults_from_filename_extension() {
        let request = UploadRequest {
            url: "https://example.invalid/upload".into(),
            field_name: "media".into(),
            file_name: "voice.amr".into(),
            bytes: vec![1, 2, 3],
            mime: None,
            extra_fields: Vec::new(),
            bearer: None,
        };
        let ext = request.file_name.rsplit('.').next().unwrap();
        assert_eq!(mime_for_extension(ext), "audio/amr");
    }
}

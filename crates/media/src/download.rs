//! Size-capped, budgeted media downloads into the temp root.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {rand::Rng, tracing::debug};

use crate::{
    DOWNLOAD_TIMEOUT_SECS,
    error::{Error, Result},
    mime::extension_for_mime,
};

/// Hook applied to the raw body before it is written (WeCom callback
/// media arrives AES-encrypted).
pub type PayloadDecryptor = Arc<dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync>;

pub struct DownloadRequest {
    pub url: String,
    /// Caller-supplied filename; its extension wins when present.
    pub file_name: Option<String>,
    /// Archive prefix, e.g. `img`, `voice`, `file`.
    pub prefix: String,
    pub max_bytes: u64,
    /// Bearer token for platforms that authenticate media URLs.
    pub bearer: Option<String>,
    pub decryptor: Option<PayloadDecryptor>,
}

/// Downloads media into an exclusively-owned temp directory.
pub struct Downloader {
    http: reqwest::Client,
    temp_root: PathBuf,
}

impl Downloader {
    pub fn new(temp_root: impl Into<PathBuf>) -> Result<Self> {
        let temp_root = temp_root.into();
        std::fs::create_dir_all(&temp_root)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::external("build http client", e))?;
        Ok(Self { http, temp_root })
    }

    #[must_use]
    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Download `request.url` into the temp root and return the file path.
    ///
    /// The size cap is enforced twice: against `Content-Length` before the
    /// body is read, and against the running byte count while streaming.
    pub async fn download(&self, request: &DownloadRequest) -> Result<PathBuf> {
        let mut builder = self
            .http
            .get(&request.url)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS));
        if let Some(bearer) = &request.bearer {
            builder = builder.bearer_auth(bearer);
        }
        let response = builder.send().await.map_err(map_reqwest("media download"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                context: "media download".into(),
                status: status.as_u16(),
            });
        }

        if let Some(declared) = response.content_length()
            && declared > request.max_bytes
        {
            return Err(Error::SizeLimit {
                max_bytes: request.max_bytes,
            });
        }

        let disposition_name = response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(map_reqwest("media download"))?
        {
            if body.len() as u64 + chunk.len() as u64 > request.max_bytes {
                return Err(Error::SizeLimit {
                    max_bytes: request.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        if let Some(decryptor) = &request.decryptor {
            body = decryptor(body)?;
        }

        let ext = resolve_extension(
            request.file_name.as_deref(),
            disposition_name.as_deref(),
            content_type.as_deref(),
        );
        let path = self.unique_temp_path(&request.prefix, &ext);
        write_atomic(&path, &body).await?;
        debug!(path = %path.display(), bytes = body.len(), "media downloaded");
        Ok(path)
    }

    /// Fetch bytes from a URL or a local path, with the same size cap.
    /// Used by outbound senders that re-upload host-provided media.
    pub async fn fetch_bytes(&self, source: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let source = source.trim();
        if source.is_empty() {
            return Err(Error::invalid_input("empty media source"));
        }

        let local = source.strip_prefix("file://").unwrap_or(source);
        if Path::new(local).exists() {
            let bytes = tokio::fs::read(local).await?;
            if bytes.len() as u64 > max_bytes {
                return Err(Error::SizeLimit { max_bytes });
            }
            return Ok(bytes);
        }

        let response = self
            .http
            .get(source)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .send()
            .await
            .map_err(map_reqwest("media fetch"))?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                context: "media fetch".into(),
                status: response.status().as_u16(),
            });
        }
        if let Some(declared) = response.content_length()
            && declared > max_bytes
        {
            return Err(Error::SizeLimit { max_bytes });
        }
        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest("media fetch"))? {
            if body.len() as u64 + chunk.len() as u64 > max_bytes {
                return Err(Error::SizeLimit { max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn unique_temp_path(&self, prefix: &str, ext: &str) -> PathBuf {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix: u32 = rand::rng().random_range(0..0xff_ffff);
        self.temp_root
            .join(format!("{prefix}_{now_ms}_{suffix:06x}.{ext}"))
    }
}

fn map_reqwest(operation: &'static str) -> impl Fn(reqwest::Error) -> Error {
    move |e| {
        if e.is_timeout() {
            Error::Timeout {
                operation,
                seconds: DOWNLOAD_TIMEOUT_SECS,
            }
        } else {
            Error::external(operation, e)
        }
    }
}

/// Extension resolution order: caller filename, Content-Disposition,
/// MIME table, `.bin`.
fn resolve_extension(
    caller_name: Option<&str>,
    disposition_name: Option<&str>,
    content_type: Option<&str>,
) -> String {
    for name in [caller_name, disposition_name].into_iter().flatten() {
        if let Some(ext) = extension_of(name) {
            return ext;
        }
    }
    if let Some(ext) = content_type.and_then(extension_for_mime) {
        return ext.to_string();
    }
    "bin".to_string()
}

fn extension_of(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 || !ext.chars().all(char::is_alphanumeric)
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Parse `filename=` / `filename*=` out of a Content-Disposition header,
/// percent-decoding the value.
fn parse_disposition_filename(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = value.trim_matches('"').rsplit('\'').next().unwrap_or("");
            let decoded = percent_decode(encoded);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
        if let Some(value) = part.strip_prefix("filename=") {
            let decoded = percent_decode(value.trim_matches('"'));
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
    }
    None
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Write then rename, so a crash never leaves a half-written file under
/// the final name.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let staging = path.with_extension("part");
    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

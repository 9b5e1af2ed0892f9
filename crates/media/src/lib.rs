//! Media pipeline: size-capped download, dated archive with retention,
//! multipart upload, MIME classification, and voice transcoding.

pub mod archive;
pub mod download;
pub mod error;
pub mod mime;
pub mod transcode;
pub mod upload;

pub use {
    archive::{MediaArchive, prune_inbound},
    download::{DownloadRequest, Downloader, PayloadDecryptor},
    error::{Error, Result},
    mime::{classify, extension_for_mime, mime_for_extension},
    transcode::{ffmpeg_available, transcode_to_amr},
    upload::{UploadRequest, upload_multipart},
};

/// Default HTTP budget for token/metadata calls.
pub const METADATA_TIMEOUT_SECS: u64 = 30;
/// Dedicated budget for media body downloads.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 120;
/// Budget for multipart uploads.
pub const UPLOAD_TIMEOUT_SECS: u64 = 60;
/// Default inbound archive cap.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Default archive retention.
pub const DEFAULT_KEEP_DAYS: u32 = 7;

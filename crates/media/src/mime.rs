//! Extension↔MIME mapping and the coarse classification senders key on.

use qiao_common::MediaKind;

/// Extension → MIME, for uploads and saved files.
#[must_use]
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "amr" => "audio/amr",
        "speex" => "audio/speex",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// MIME → preferred extension, for downloads without a usable filename.
#[must_use]
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let mime = mime.split(';').next().unwrap_or("").trim();
    Some(match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        "audio/amr" => "amr",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => return None,
    })
}

/// Classify a file for sending.
///
/// SVG is classified as a plain file: none of the platforms render it as
/// an image. `wav`/`mp3` only count as voice when the account has voice
/// transcoding enabled, since the platforms accept `amr`/`speex` only.
#[must_use]
pub fn classify(file_name: &str, declared_mime: Option<&str>, voice_transcode: bool) -> MediaKind {
    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "svg" => return MediaKind::File,
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => return MediaKind::Image,
        "amr" | "speex" => return MediaKind::Voice,
        "wav" | "mp3" => {
            return if voice_transcode {
                MediaKind::Voice
            } else {
                MediaKind::File
            };
        },
        "mp4" | "mov" | "avi" => return MediaKind::Video,
        _ => {},
    }

    match declared_mime.map(|m| m.split('/').next().unwrap_or("")) {
        Some("image") => {
            if declared_mime.is_some_and(|m| m.contains("svg")) {
                MediaKind::File
            } else {
                MediaKind::Image
            }
        },
        Some("video") => MediaKind::Video,
        Some("audio") => {
            if voice_transcode {
                MediaKind::Voice
            } else {
                MediaKind::File
            }
        },
        _ => MediaKind::File,
    }
}

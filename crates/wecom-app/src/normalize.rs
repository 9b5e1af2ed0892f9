//! Convert decrypted callback XML fields into the channel-neutral
//! envelope, archiving media along the way.

use std::collections::HashMap;

use tracing::{debug, warn};

use {
    qiao_common::{Attachment, ChannelKind, ChatType, InboundEnvelope, MediaKind},
    qiao_media::{DownloadRequest, error::Error as MediaError},
};

use crate::state::AccountState;

/// What a callback body parsed into, before any media I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCallback {
    Text {
        content: String,
    },
    Voice {
        media_id: Option<String>,
        recognition: Option<String>,
    },
    Image {
        media_id: String,
    },
    File {
        media_id: String,
        file_name: Option<String>,
    },
    /// Events and unsupported kinds are dropped.
    Ignored,
}

/// Classify the decrypted XML fields. Pure; media handling happens later.
#[must_use]
pub fn parse_callback(fields: &HashMap<String, String>) -> ParsedCallback {
    let msg_type = fields
        .get("MsgType")
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match msg_type.as_str() {
        "text" => match non_empty(fields, "Content") {
            Some(content) => ParsedCallback::Text { content },
            None => ParsedCallback::Ignored,
        },
        "voice" => ParsedCallback::Voice {
            media_id: non_empty(fields, "MediaId"),
            recognition: non_empty(fields, "Recognition"),
        },
        "image" => match non_empty(fields, "MediaId") {
            Some(media_id) => ParsedCallback::Image { media_id },
            None => ParsedCallback::Ignored,
        },
        "file" => match non_empty(fields, "MediaId") {
            Some(media_id) => ParsedCallback::File {
                media_id,
                file_name: non_empty(fields, "Title"),
            },
            None => ParsedCallback::Ignored,
        },
        _ => ParsedCallback::Ignored,
    }
}

/// Build the inbound envelope, downloading and archiving any media.
///
/// Returns `None` for events and empty callbacks.
pub async fn normalize(
    state: &AccountState,
    fields: &HashMap<String, String>,
) -> Option<InboundEnvelope> {
    let sender_id = non_empty(fields, "FromUserName")?;
    let parsed = parse_callback(fields);

    let timestamp_ms = fields
        .get("CreateTime")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or_else(now_ms);

    let (body, attachments) = match parsed {
        ParsedCallback::Ignored => return None,
        ParsedCallback::Text { content } => (content, Vec::new()),
        ParsedCallback::Voice {
            media_id,
            recognition,
        } => {
            let mut attachments = Vec::new();
            let mut body = match &media_id {
                Some(media_id) => {
                    let outcome = archive_media(state, media_id, "voice", None).await;
                    attachments.push(Attachment {
                        kind: MediaKind::Voice,
                        source: media_id.clone(),
                        saved_path: outcome.saved_path(),
                        transcript: recognition.clone(),
                        file_name: None,
                    });
                    outcome.body_token("voice")
                },
                None => "[voice]".to_string(),
            };
            if let Some(recognition) = recognition {
                body.push_str(&format!("\n[recognition] {recognition}"));
            }
            (body, attachments)
        },
        ParsedCallback::Image { media_id } => {
            let outcome = archive_media(state, &media_id, "img", None).await;
            let attachment = Attachment {
                kind: MediaKind::Image,
                source: media_id,
                saved_path: outcome.saved_path(),
                transcript: None,
                file_name: None,
            };
            (outcome.body_token("image"), vec![attachment])
        },
        ParsedCallback::File {
            media_id,
            file_name,
        } => {
            let outcome = archive_media(state, &media_id, "file", file_name.as_deref()).await;
            let attachment = Attachment {
                kind: MediaKind::File,
                source: media_id,
                saved_path: outcome.saved_path(),
                transcript: None,
                file_name,
            };
            (outcome.body_token("file"), vec![attachment])
        },
    };

    let message_id = non_empty(fields, "MsgId")
        .unwrap_or_else(|| InboundEnvelope::synthesize_message_id(&sender_id, now_ms()));

    Some(InboundEnvelope {
        channel: ChannelKind::WecomApp,
        account_id: state.account_id.clone(),
        message_id,
        message_sid: None,
        timestamp_ms,
        // self-built app callbacks are always 1:1 with a member
        chat_type: ChatType::Direct,
        sender_id: sender_id.clone(),
        sender_name: None,
        peer_id: sender_id,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned: false,
    })
}

enum MediaOutcome {
    Saved(std::path::PathBuf),
    TooLarge { max_bytes: u64 },
    Failed,
    Disabled,
}

impl MediaOutcome {
    fn saved_path(&self) -> Option<std::path::PathBuf> {
        match self {
            Self::Saved(path) => Some(path.clone()),
            _ => None,
        }
    }

    /// The stable body reference for this media, or the user-visible
    /// failure note.
    fn body_token(&self, label: &str) -> String {
        match self {
            Self::Saved(path) => format!("[{label}] saved:{}", path.display()),
            Self::TooLarge { max_bytes } => format!(
                "[{label}] exceeds the {} MB inbound limit and was not saved",
                max_bytes / (1024 * 1024)
            ),
            Self::Failed | Self::Disabled => format!("[{label}]"),
        }
    }
}

async fn archive_media(
    state: &AccountState,
    media_id: &str,
    prefix: &str,
    file_name: Option<&str>,
) -> MediaOutcome {
    if !state.config.inbound_media.enabled {
        return MediaOutcome::Disabled;
    }
    let url = match state.client.media_download_url(media_id).await {
        Ok(url) => url,
        Err(error) => {
            warn!(error = %error, "wecom-app media url resolution failed");
            return MediaOutcome::Failed;
        },
    };
    let request = DownloadRequest {
        url,
        file_name: file_name.map(str::to_string),
        prefix: prefix.to_string(),
        max_bytes: state.config.inbound_media.max_bytes,
        bearer: None,
        decryptor: None,
    };
    match state.downloader.download(&request).await {
        Ok(path) => {
            let archived = state.archive.archive(&path).await;
            state.archive.prune().await;
            MediaOutcome::Saved(archived)
        },
        Err(MediaError::SizeLimit { max_bytes }) => {
            debug!(media_id, max_bytes, "inbound media over size limit");
            MediaOutcome::TooLarge { max_bytes }
        },
        Err(error) => {
            warn!(media_id, error = %error, "inbound media download failed");
            MediaOutcome::Failed
        },
    }
}

fn non_empty(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn text_callback_parses_content() {
        let parsed = parse_callback(&fields(&[("MsgType", "text"), ("Content", "hello")]));
        assert_eq!(
            parsed,
            ParsedCallback::Text {
                content: "hello".into()
            }
        );
    }

    #[test]
    fn voice_prefers_platform_recognition() {
        let parsed = parse_callback(&fields(&[
            ("MsgType", "voice"),
            ("MediaId", "m1"),
            ("Recognition", "天气不错"),
        ]));
        assert_eq!(
            parsed,
            ParsedCallback::Voice {
                media_id: Some("m1".into()),
                recognition: Some("天气不错".into()),
            }
        );
    }

    #[test]
    fn events_and_unknown_kinds_are_ignored() {
        assert_eq!(
            parse_callback(&fields(&[("MsgType", "event"), ("Event", "subscribe")])),
            ParsedCallback::Ignored
        );
        assert_eq!(
            parse_callback(&fields(&[("MsgType", "location")])),
            ParsedCallback::Ignored
        );
        assert_eq!(
            parse_callback(&fields(&[("MsgType", "text"), ("Content", "  ")])),
            ParsedCallback::Ignored
        );
    }

    #[test]
    fn image_requires_media_id() {
        assert_eq!(
            parse_callback(&fields(&[("MsgType", "image")])),
            ParsedCallback::Ignored
        );
        assert_eq!(
            parse_callback(&fields(&[("MsgType", "image"), ("MediaId", "m2")])),
            ParsedCallback::Image {
                media_id: "m2".into()
            }
        );
    }

    #[test]
    fn file_carries_title_as_name() {
        assert_eq!(
            parse_callback(&fields(&[
                ("MsgType", "file"),
                ("MediaId", "m3"),
                ("Title", "report.pdf")
            ])),
            ParsedCallback::File {
                media_id: "m3".into(),
                file_name: Some("report.pdf".into()),
            }
        );
    }

    #[test]
    fn media_outcome_body_tokens() {
        let saved = MediaOutcome::Saved("/data/inbound/2026-08-02/img_1_a.jpg".into());
        assert_eq!(
            saved.body_token("image"),
            "[image] saved:/data/inbound/2026-08-02/img_1_a.jpg"
        );
        let too_large = MediaOutcome::TooLarge {
            max_bytes: 10 * 1024 * 1024,
        };
        assert!(too_large.body_token("file").contains("10 MB"));
        assert_eq!(MediaOutcome::Failed.body_token("voice"), "[voice]");
    }
}

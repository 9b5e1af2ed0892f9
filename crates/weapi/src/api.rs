//! REST client for the WeCom self-built application APIs.

use std::{sync::Arc, time::Duration};

use {
    secrecy::Secret,
    serde_json::{Value, json},
    tracing::debug,
};

use {
    qiao_channels::{Error, Result},
    qiao_media::upload::{UploadRequest, upload_multipart},
};

use crate::{
    API_BASE,
    token::{TokenCache, is_token_errcode},
};

/// Reject a platform envelope whose `errcode` is non-zero, classifying
/// token expiry so callers can retry once with a fresh token.
pub fn check_errcode(value: &Value) -> Result<()> {
    let errcode = value.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if errcode == 0 {
        return Ok(());
    }
    if is_token_errcode(errcode) {
        return Err(Error::TokenExpired { code: errcode });
    }
    let errmsg = value
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    Err(Error::External {
        context: "wecom api".into(),
        source: format!("errcode {errcode}: {errmsg}").into(),
    })
}

/// One corp application's API access: `message/send`, media up/download.
pub struct WecomClient {
    http: reqwest::Client,
    base_url: String,
    corp_id: String,
    corp_secret: Secret<String>,
    agent_id: i64,
    tokens: Arc<TokenCache>,
    token_key: String,
}

impl WecomClient {
    pub fn new(
        corp_id: impl Into<String>,
        corp_secret: Secret<String>,
        agent_id: i64,
        tokens: Arc<TokenCache>,
    ) -> Result<Self> {
        let corp_id = corp_id.into();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(qiao_media::METADATA_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::external("build http client", e))?;
        let token_key = TokenCache::key(&corp_id, Some(agent_id));
        Ok(Self {
            http,
            base_url: API_BASE.to_string(),
            corp_id,
            corp_secret,
            agent_id,
            tokens,
            token_key,
        })
    }

    /// Point at a different API origin (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn token(&self) -> Result<String> {
        self.tokens
            .access_token(
                &self.http,
                &self.base_url,
                &self.token_key,
                &self.corp_id,
                &self.corp_secret,
            )
            .await
    }

    /// Send one application message (`message/send`). A dead token is
    /// evicted and the call retried once with a fresh one.
    pub async fn send_message(&self, body: &Value) -> Result<()> {
        match self.send_message_once(body).await {
            Err(error) if error.is_token_expiry() => {
                debug!("wecom send retried after token eviction");
                self.tokens.invalidate(&self.token_key).await;
                self.send_message_once(body).await
            },
            other => other,
        }
    }

    async fn send_message_once(&self, body: &Value) -> Result<()> {
        let token = self.token().await?;
        let response = self
            .http
            .post(format!("{}/cgi-bin/message/send", self.base_url))
            .query(&[("access_token", token.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| classify_http_error("wecom message send", e))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::external("wecom message send response", e))?;
        check_errcode(&value)
    }

    /// Upload media (`media/upload?type=image|voice|video|file`) and
    /// return the platform `media_id`.
    pub async fn upload_media(
        &self,
        media_type: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        match self
            .upload_media_once(media_type, file_name, bytes.clone())
            .await
        {
            Err(error) if error.is_token_expiry() => {
                self.tokens.invalidate(&self.token_key).await;
                self.upload_media_once(media_type, file_name, bytes).await
            },
            other => other,
        }
    }

    async fn upload_media_once(
        &self,
        media_type: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let token = self.token().await?;
        let url = format!(
            "{}/cgi-bin/media/upload?access_token={token}&type={media_type}",
            self.base_url
        );
        let value = upload_multipart(&self.http, UploadRequest {
            url,
            field_name: "media".into(),
            file_name: file_name.to_string(),
            bytes,
            mime: None,
            extra_fields: Vec::new(),
            bearer: None,
        })
        .await
        .map_err(classify_media_error)?;
        check_errcode(&value)?;
        value
            .get("media_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::External {
                context: "wecom media upload".into(),
                source: "response carried no media_id".into(),
            })
    }

    /// Download URL for an inbound `media_id`, with a fresh token baked in.
    pub async fn media_download_url(&self, media_id: &str) -> Result<String> {
        let token = self.token().await?;
        Ok(format!(
            "{}/cgi-bin/media/get?access_token={token}&media_id={media_id}",
            self.base_url
        ))
    }

    // ── message bodies ──────────────────────────────────────────────────

    #[must_use]
    pub fn text_message(&self, to_user: &str, content: &str) -> Value {
        json!({
            "touser": to_user,
            "msgtype": "text",
            "agentid": self.agent_id,
            "text": { "content": content },
        })
    }

    #[must_use]
    pub fn markdown_message(&self, to_user: &str, content: &str) -> Value {
        json!({
            "touser": to_user,
            "msgtype": "markdown",
            "agentid": self.agent_id,
            "markdown": { "content": content },
        })
    }

    #[must_use]
    pub fn media_message(&self, to_user: &str, msgtype: &str, media_id: &str) -> Value {
        let mut body = json!({
            "touser": to_user,
            "msgtype": msgtype,
            "agentid": self.agent_id,
        });
        body[msgtype] = json!({ "media_id": media_id });
        body
    }
}

/// Timeouts get their typed kind; everything else stays a wrapped source.
fn classify_http_error(operation: &'static str, error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::timeout(operation)
    } else {
        Error::external(operation, error)
    }
}

/// Size and timeout failures from the media layer keep their kinds.
fn classify_media_error(error: qiao_media::Error) -> Error {
    match error {
        qiao_media::Error::SizeLimit { max_bytes } => Error::SizeLimit { max_bytes },
        qiao_media::Error::Timeout { operation, .. } => Error::timeout(operation),
        other => Error::external("wecom media upload", other),
    }
}

/// Push a message through a group-robot webhook URL (no token needed).
pub async fn send_robot_webhook(
    http: &reqwest::Client,
    webhook_url: &str,
    body: &Value,
) -> Result<()> {
    let response = http
        .post(webhook_url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::external("wecom robot webhook", e))?;
    let value: Value = response
        .json()
        .await
        .map_err(|e| Error::external("wecom robot webhook response", e))?;
    check_errcode(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errcode_zero_is_ok() {
        assert!(check_errcode(&json!({ "errcode": 0, "errmsg": "ok" })).is_ok());
        assert!(check_errcode(&json!({})).is_ok());
    }

    #[test]
    fn token_errcodes_map_to_token_expired() {
        for code in [40001, 40014, 42001] {
            let err = check_errcode(&json!({ "errcode": code, "errmsg": "bad" })).unwrap_err();
            assert!(err.is_token_expiry(), "code {code}");
        }
    }

    #[test]
    fn other_errcodes_are_external() {
        let err = check_errcode(&json!({ "errcode": 81013, "errmsg": "user not found" }))
            .unwrap_err();
        assert!(!err.is_token_expiry());
        assert!(err.to_string().contains("81013"));
    }

    #[tokio::test]
    async fn message_bodies_carry_agent_id_and_msgtype() {
        let client = WecomClient::new(
            "corp1",
            Secret::new("secret".into()),
            1000002,
            Arc::new(TokenCache::new()),
        )
        .unwrap();

        let text = client.text_message("alice", "hi");
        assert_eq!(text["msgtype"], "text");
        assert_eq!(text["agentid"], 1000002);
        assert_eq!(text["text"]["content"], "hi");

        let voice = client.media_message("alice", "voice", "m9");
        assert_eq!(voice["msgtype"], "voice");
        assert_eq!(voice["voice"]["media_id"], "m9");

        let file = client.media_message("alice", "file", "m10");
        assert_eq!(file["file"]["media_id"], "m10");
    }
}

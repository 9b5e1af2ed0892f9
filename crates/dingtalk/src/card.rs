//! Streaming AI-card lifecycle.
//!
//! One card per reply: `CREATED → INPUTING → FINISHED` (or `FAILED`).
//! The first stream update must be preceded by the INPUTING status PUT;
//! subsequent updates are throttled to one per 300 ms and always carry a
//! fresh guid, `isFull = true`, and the full accumulated content.
//! Finishing requires both a finalize stream call and the FINISHED status
//! PUT; a second finalize is a no-op.

use std::time::Duration;

use {
    serde_json::json,
    tokio::{sync::Mutex, time::Instant},
    tracing::{debug, warn},
};

use std::sync::Arc;

use qiao_channels::Error as ChannelError;

use crate::token::DingTalkApi;

/// Minimum spacing between streaming updates.
pub const STREAM_THROTTLE: Duration = Duration::from_millis(300);

/// Default template for markdown AI cards.
const DEFAULT_TEMPLATE_ID: &str = "382e4302-551d-4880-bf29-a30acb27b2ef.schema";

/// Card lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Created,
    Inputing,
    Finished,
    Failed,
}

impl CardState {
    fn flow_status(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Inputing => "INPUTING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

struct StreamGuard {
    state: CardState,
    last_update: Instant,
}

/// One streaming card instance; the single writer for its `outTrackId`.
pub struct CardStream {
    api: Arc<DingTalkApi>,
    out_track_id: String,
    guard: Mutex<StreamGuard>,
}

impl CardStream {
    /// Create and deliver a card into the conversation's open space.
    pub async fn create(
        api: Arc<DingTalkApi>,
        template_id: Option<&str>,
        open_conversation_id: &str,
        robot_code: &str,
    ) -> anyhow::Result<Self> {
        let out_track_id = uuid::Uuid::new_v4().to_string();
        let open_space_id = format!("dtv1.card//IM_ROBOT.{open_conversation_id}");
        let template = template_id.unwrap_or(DEFAULT_TEMPLATE_ID);

        api.post_json("/v1.0/card/instances", &json!({
            "cardTemplateId": template,
            "outTrackId": out_track_id,
            "cardData": { "cardParamMap": { "content": "" } },
            "callbackType": "STREAM",
        }))
        .await?;

        api.post_json("/v1.0/card/instances/deliver", &json!({
            "outTrackId": out_track_id,
            "openSpaceId": open_space_id,
            "imRobotOpenDeliverModel": { "spaceType": "IM_ROBOT", "robotCode": robot_code },
            "imGroupOpenDeliverModel": { "robotCode": robot_code },
        }))
        .await?;

        debug!(out_track_id, "ai card created");
        Ok(Self {
            api,
            out_track_id,
            guard: Mutex::new(StreamGuard {
                state: CardState::Created,
                last_update: Instant::now() - STREAM_THROTTLE,
            }),
        })
    }

    #[must_use]
    pub fn out_track_id(&self) -> &str {
        &self.out_track_id
    }

    pub async fn state(&self) -> CardState {
        self.guard.lock().await.state
    }

    /// Stream the accumulated content. `finalize` closes the stream and
    /// transitions the card to FINISHED.
    pub async fn stream(&self, content: &str, finalize: bool) -> anyhow::Result<()> {
        let mut guard = self.guard.lock().await;
        match guard.state {
            CardState::Finished | CardState::Failed => {
                // double-finalize and post-finish updates are safe no-ops
                return Ok(());
            },
            CardState::Created => {
                self.put_status(CardState::Inputing, content).await?;
                guard.state = CardState::Inputing;
            },
            CardState::Inputing => {},
        }

        if !finalize {
            let elapsed = guard.last_update.elapsed();
            if elapsed < STREAM_THROTTLE {
                tokio::time::sleep(STREAM_THROTTLE - elapsed).await;
            }
        }

        self.api
            .put_json("/v1.0/card/streaming", &json!({
                "outTrackId": self.out_track_id,
                "guid": uuid::Uuid::new_v4().to_string(),
                "key": "content",
                "content": content,
                "isFull": true,
                "isFinalize": finalize,
                "isError": false,
            }))
            .await
            .map_err(|e| ChannelError::card_failure(e))?;
        guard.last_update = Instant::now();

        if finalize {
            self.put_status(CardState::Finished, content).await?;
            guard.state = CardState::Finished;
        }
        Ok(())
    }

    /// Finish the card with an error banner; used by the plain-message
    /// fallback after a card API failure.
    pub async fn fail(&self, note: &str) {
        let mut guard = self.guard.lock().await;
        if matches!(guard.state, CardState::Finished | CardState::Failed) {
            return;
        }
        let banner = format!("⚠️ {note}");
        if let Err(error) = self
            .api
            .put_json("/v1.0/card/streaming", &json!({
                "outTrackId": self.out_track_id,
                "guid": uuid::Uuid::new_v4().to_string(),
                "key": "content",
                "content": banner,
                "isFull": true,
                "isFinalize": true,
                "isError": true,
            }))
            .await
        {
            warn!(error = %error, "card error stream failed");
        }
        if let Err(error) = self.put_status(CardState::Failed, &banner).await {
            warn!(error = %error, "card FAILED status put failed");
        }
        guard.state = CardState::Failed;
    }

    async fn put_status(&self, state: CardState, content: &str) -> anyhow::Result<()> {
        self.api
            .put_json("/v1.0/card/instances", &json!({
                "outTrackId": self.out_track_id,
                "cardData": {
                    "cardParamMap": {
                        "flowStatus": state.flow_status(),
                        "content": content,
                    }
                },
            }))
            .await
            .map_err(|e| ChannelError::card_failure(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::Secret;

    use super::*;

    fn unreachable_api() -> Arc<DingTalkApi> {
        Arc::new(
            DingTalkApi::new("key", Secret::new("secret".into()))
                .unwrap()
                .with_base_url("http://127.0.0.1:1"),
        )
    }

    fn card(api: Arc<DingTalkApi>) -> CardStream {
        CardStream {
            api,
            out_track_id: "track-1".into(),
            guard: Mutex::new(StreamGuard {
                state: CardState::Created,
                last_update: Instant::now() - STREAM_THROTTLE,
            }),
        }
    }

    #[tokio::test]
    async fn finished_cards_ignore_further_streams() {
        let card = card(unreachable_api());
        {
            let mut guard = card.guard.lock().await;
            guard.state = CardState::Finished;
        }
        // both finalize and non-finalize are no-ops on FINISHED
        card.stream("late", true).await.unwrap();
        card.stream("late", false).await.unwrap();
        assert_eq!(card.state().await, CardState::Finished);
    }

    #[tokio::test]
    async fn first_stream_requires_inputing_put_first() {
        // with an unreachable API the INPUTING status PUT fails before any
        // streaming call, proving the ordering
        let card = card(unreachable_api());
        assert!(card.stream("first", false).await.is_err());
        assert_eq!(card.state().await, CardState::Created);
    }

    #[tokio::test]
    async fn fail_is_terminal() {
        let card = card(unreachable_api());
        card.fail("boom").await;
        assert_eq!(card.state().await, CardState::Failed);
        // further streams are ignored
        card.stream("x", true).await.unwrap();
        assert_eq!(card.state().await, CardState::Failed);
    }

    #[test]
    fn flow_status_names() {
        assert_eq!(CardState::Inputing.flow_status(), "INPUTING");
        assert_eq!(CardState::Finished.flow_status(), "FINISHED");
    }
}

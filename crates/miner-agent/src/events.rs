//! Turn event-bus frames into miner events and log them.

use async_trait::async_trait;
use miner_pubsub::{
    CloseInfo, InboundFrame, MessageFrame, PubSubError, PubSubListener, TopicName,
};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

/// Events the miner cares about.
#[derive(Clone, Debug, PartialEq)]
pub enum MinerEvent {
    /// Points were credited on a channel.
    PointsEarned {
        channel_id: String,
        gained: i64,
        balance: i64,
        reason: String,
    },
    /// A bonus chest can be claimed.
    ClaimAvailable { channel_id: String, claim_id: String },
    /// A channel went live.
    StreamUp { channel_id: String },
    /// A channel went offline.
    StreamDown { channel_id: String },
    /// A channel is raiding another.
    Raid {
        channel_id: String,
        target_login: String,
    },
    /// A prediction opened on a channel.
    PredictionOpened {
        channel_id: String,
        event_id: String,
        title: String,
    },
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn int_at(value: &Value, pointer: &str) -> i64 {
    value.pointer(pointer).and_then(Value::as_i64).unwrap_or_default()
}

/// Classify a MESSAGE frame. Frames of no interest yield `None`.
pub fn classify(message: &MessageFrame) -> Option<MinerEvent> {
    let payload = &message.payload;
    let channel = message.topic.target().to_owned();
    let event = match (message.topic.name()?, message.event_type()?) {
        (TopicName::CommunityPointsUser, "points-earned") => MinerEvent::PointsEarned {
            channel_id: str_at(payload, "/data/channel_id").to_owned(),
            gained: int_at(payload, "/data/point_gain/total_points"),
            balance: int_at(payload, "/data/balance/balance"),
            reason: str_at(payload, "/data/point_gain/reason_code").to_owned(),
        },
        (TopicName::CommunityPointsUser, "claim-available") => MinerEvent::ClaimAvailable {
            channel_id: str_at(payload, "/data/claim/channel_id").to_owned(),
            claim_id: str_at(payload, "/data/claim/id").to_owned(),
        },
        (TopicName::VideoPlaybackById, "stream-up") => MinerEvent::StreamUp { channel_id: channel },
        (TopicName::VideoPlaybackById, "stream-down") => {
            MinerEvent::StreamDown { channel_id: channel }
        }
        (TopicName::Raid, "raid_update_v2") => MinerEvent::Raid {
            channel_id: channel,
            target_login: str_at(payload, "/raid/target_login").to_owned(),
        },
        (TopicName::PredictionsChannel, "event-created") => MinerEvent::PredictionOpened {
            channel_id: channel,
            event_id: str_at(payload, "/data/event/id").to_owned(),
            title: str_at(payload, "/data/event/title").to_owned(),
        },
        _ => return None,
    };
    Some(event)
}

/// Logs connection lifecycle and miner events.
pub struct LoggingListener;

#[async_trait]
impl PubSubListener for LoggingListener {
    async fn on_open(&self) {
        info!("event bus connected");
    }

    async fn on_message(&self, frame: &InboundFrame) {
        match frame {
            InboundFrame::Message(message) => match classify(message) {
                Some(MinerEvent::PointsEarned {
                    channel_id,
                    gained,
                    balance,
                    reason,
                }) => info!(channel_id = %channel_id, gained, balance, reason = %reason, "points earned"),
                Some(MinerEvent::ClaimAvailable {
                    channel_id,
                    claim_id,
                }) => info!(channel_id = %channel_id, claim_id = %claim_id, "bonus claim available"),
                Some(MinerEvent::StreamUp { channel_id }) => info!(channel_id = %channel_id, "stream up"),
                Some(MinerEvent::StreamDown { channel_id }) => info!(channel_id = %channel_id, "stream down"),
                Some(MinerEvent::Raid {
                    channel_id,
                    target_login,
                }) => info!(channel_id = %channel_id, target = %target_login, "raid started"),
                Some(MinerEvent::PredictionOpened {
                    channel_id,
                    event_id,
                    title,
                }) => info!(channel_id = %channel_id, event_id = %event_id, title = %title, "prediction opened"),
                None => debug!(
                    topic = %message.topic,
                    event_type = message.event_type().unwrap_or("-"),
                    "unhandled message"
                ),
            },
            InboundFrame::Response(response) if !response.is_success() => {
                warn!(error = %response.error, "server rejected a command");
            }
            InboundFrame::Unknown(unknown) => debug!(kind = %unknown.kind, "unknown frame"),
            other => trace!(kind = other.kind(), "frame"),
        }
    }

    async fn on_close(&self, info: &CloseInfo) {
        warn!(
            code = info.code,
            reason = %info.reason,
            remote = info.remote,
            "event bus connection closed"
        );
    }

    async fn on_error(&self, error: &PubSubError) {
        if error.is_fatal() {
            tracing::error!(error = %error, "event bus error, not retrying");
        } else {
            warn!(error = %error, "event bus error");
        }
    }
}

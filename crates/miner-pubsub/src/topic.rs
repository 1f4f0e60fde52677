//! Topics and the per-connection topic registry.
//!
//! A topic is `<name>.<target>`, e.g. `community-points-user-v1.123`. The
//! registry is the set of topics the client wants; it outlives any single
//! socket and is replayed after every reconnect.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::PubSubError;

/// Topic families the miner listens to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicName {
    /// Point balance changes and claim availability for the user.
    CommunityPointsUser,
    /// Reward redemptions on a channel.
    ChannelPointsChannel,
    /// Stream up/down and viewer count for a channel.
    VideoPlaybackById,
    /// Outgoing raids from a channel.
    Raid,
    /// Predictions opened on a channel.
    PredictionsChannel,
    /// The user's own prediction results.
    PredictionsUser,
    /// Drop progress for the user.
    UserDropEvents,
    /// On-site notifications for the user.
    OnsiteNotifications,
    /// Community moments on a channel.
    CommunityMomentsChannel,
}

impl TopicName {
    /// Every known topic family.
    pub const ALL: [Self; 9] = [
        Self::CommunityPointsUser,
        Self::ChannelPointsChannel,
        Self::VideoPlaybackById,
        Self::Raid,
        Self::PredictionsChannel,
        Self::PredictionsUser,
        Self::UserDropEvents,
        Self::OnsiteNotifications,
        Self::CommunityMomentsChannel,
    ];

    /// Wire prefix of the family.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommunityPointsUser => "community-points-user-v1",
            Self::ChannelPointsChannel => "channel-points-channel-v1",
            Self::VideoPlaybackById => "video-playback-by-id",
            Self::Raid => "raid",
            Self::PredictionsChannel => "predictions-channel-v1",
            Self::PredictionsUser => "predictions-user-v1",
            Self::UserDropEvents => "user-drop-events",
            Self::OnsiteNotifications => "onsite-notifications",
            Self::CommunityMomentsChannel => "community-moments-channel-v1",
        }
    }

    /// Look a family up by its wire prefix.
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == s)
    }

    /// Whether the family is keyed by the user rather than a channel.
    pub fn is_user_topic(self) -> bool {
        matches!(
            self,
            Self::CommunityPointsUser
                | Self::PredictionsUser
                | Self::UserDropEvents
                | Self::OnsiteNotifications
        )
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription channel identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Build `<name>.<target>`.
    pub fn new(name: TopicName, target: impl fmt::Display) -> Self {
        Self(format!("{name}.{target}"))
    }

    /// Accept any `<name>.<target>` string; unknown names are kept verbatim.
    pub fn parse(s: &str) -> Option<Self> {
        let (name, target) = s.split_once('.')?;
        if name.is_empty() || target.is_empty() || s.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self(s.to_owned()))
    }

    /// The known family, if any.
    pub fn name(&self) -> Option<TopicName> {
        self.0.split_once('.').and_then(|(n, _)| TopicName::from_wire(n))
    }

    /// The part after the first dot (channel or user id).
    pub fn target(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, t)| t)
    }

    /// Return the inner string as a slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid topic: {s:?}"))
    }
}

/// The set of topics a client wants subscribed.
///
/// Ordered so resubscription after reconnect is deterministic.
#[derive(Clone, Debug)]
pub struct TopicRegistry {
    topics: BTreeSet<Topic>,
    capacity: usize,
}

impl TopicRegistry {
    /// Create an empty registry holding at most `capacity` topics.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: BTreeSet::new(),
            capacity,
        }
    }

    /// Add a topic. Returns `Ok(false)` if it was already present.
    pub fn add(&mut self, topic: Topic) -> Result<bool, PubSubError> {
        if self.topics.contains(&topic) {
            return Ok(false);
        }
        if self.topics.len() >= self.capacity {
            return Err(PubSubError::TopicLimit {
                limit: self.capacity,
            });
        }
        Ok(self.topics.insert(topic))
    }

    /// Remove a topic. Returns whether it was present.
    pub fn remove(&mut self, topic: &Topic) -> bool {
        self.topics.remove(topic)
    }

    /// Drop every topic.
    pub fn clear(&mut self) {
        self.topics.clear();
    }

    /// Whether the topic is registered.
    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topics are registered.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Whether another topic would fit.
    pub fn has_capacity(&self) -> bool {
        self.topics.len() < self.capacity
    }

    /// Maximum number of topics.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the current topics, in order.
    pub fn snapshot(&self) -> Vec<Topic> {
        self.topics.iter().cloned().collect()
    }
}

//! # Topic Naming
//!
//! Routing keys have the shape `<owner>.<resource>.<subtopic>`.
//!
//! ```text
//!   u-42 . ws-7f3a . updates      publish topic, always concrete
//!   *    . ws-7f3a . #            listen selector
//! ```
//!
//! `*` matches exactly one segment and `#` matches zero or more segments,
//! as on an AMQP topic exchange.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Matches exactly one segment.
pub const SINGLE_WILDCARD: &str = "*";

/// Matches any remainder (zero or more segments).
pub const MULTI_WILDCARD: &str = "#";

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Durable topic exchange carrying workspace events.
pub const WORKSPACE_EXCHANGE: &str = "ws.events";

/// Exchange for node-local workspace traffic.
pub const WORKSPACE_LOCAL_EXCHANGE: &str = "ws.events.local";

/// Durable queue feeding prebuild status updates.
pub const PREBUILD_UPDATABLE_QUEUE: &str = "prebuild-updatable";

/// Subtopics carried on the workspace exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceSubtopic {
    /// Instance status updates.
    Updates,
    /// Workspace log output.
    Log,
    /// Credit/usage accounting.
    Credit,
    /// Log output of headless (prebuild) workspaces.
    HeadlessLog,
    /// Exposed port changes.
    Ports,
}

impl WorkspaceSubtopic {
    /// All subtopics, in declaration order.
    pub const ALL: [WorkspaceSubtopic; 5] = [
        Self::Updates,
        Self::Log,
        Self::Credit,
        Self::HeadlessLog,
        Self::Ports,
    ];

    /// Routing-key segment for this subtopic.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updates => "updates",
            Self::Log => "log",
            Self::Credit => "credit",
            Self::HeadlessLog => "headless-log",
            Self::Ports => "ports",
        }
    }
}

impl fmt::Display for WorkspaceSubtopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceSubtopic {
    type Err = UnknownSubtopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|subtopic| subtopic.as_str() == s)
            .ok_or_else(|| UnknownSubtopic(s.to_string()))
    }
}

/// A subtopic string outside [`WorkspaceSubtopic`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subtopic: {0}")]
pub struct UnknownSubtopic(pub String);

/// A parsed three-segment routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub owner_id: String,
    pub resource_id: String,
    pub subtopic: String,
}

impl Topic {
    pub fn new(
        owner_id: impl Into<String>,
        resource_id: impl Into<String>,
        subtopic: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            resource_id: resource_id.into(),
            subtopic: subtopic.into(),
        }
    }

    /// The subtopic as a known workspace subtopic, if it is one.
    #[must_use]
    pub fn workspace_subtopic(&self) -> Option<WorkspaceSubtopic> {
        self.subtopic.parse().ok()
    }

    /// True if no segment is a wildcard token.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        [&self.owner_id, &self.resource_id, &self.subtopic]
            .iter()
            .all(|segment| !is_wildcard(segment))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.owner_id, self.resource_id, self.subtopic)
    }
}

fn is_wildcard(segment: &str) -> bool {
    segment == SINGLE_WILDCARD || segment == MULTI_WILDCARD
}

/// Build a listen selector. Absent owner/resource become `*`, an absent
/// subtopic becomes `#`.
#[must_use]
pub fn listen_topic(owner_id: Option<&str>, resource_id: Option<&str>, subtopic: Option<&str>) -> String {
    format!(
        "{}.{}.{}",
        owner_id.unwrap_or(SINGLE_WILDCARD),
        resource_id.unwrap_or(SINGLE_WILDCARD),
        subtopic.unwrap_or(MULTI_WILDCARD)
    )
}

/// Build a publish routing key.
///
/// All three segments must be concrete for routing to work; this is not
/// checked here.
#[must_use]
pub fn publish_topic(owner_id: &str, resource_id: &str, subtopic: &str) -> String {
    listen_topic(Some(owner_id), Some(resource_id), Some(subtopic))
}

/// Parse a routing key received from the broker.
///
/// Returns `None` unless the key has exactly three segments.
#[must_use]
pub fn parse_topic(topic: &str) -> Option<Topic> {
    let mut segments = topic.split(SEPARATOR);
    let owner_id = segments.next()?;
    let resource_id = segments.next()?;
    let subtopic = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    Some(Topic::new(owner_id, resource_id, subtopic))
}

/// Owner segment of a topic, or `None` for an empty topic or a wildcard owner.
#[must_use]
pub fn parse_owner(topic: Option<&str>) -> Option<String> {
    let topic = topic.filter(|t| !t.is_empty())?;
    let owner = topic.split(SEPARATOR).next()?;
    (owner != SINGLE_WILDCARD).then(|| owner.to_string())
}

/// A listen selector compiled for matching routing keys.
///
/// Used by the in-memory broker to emulate topic-exchange routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSelector {
    pattern: String,
    segments: Vec<String>,
}

impl TopicSelector {
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let segments = pattern.split(SEPARATOR).map(str::to_string).collect();
        Self { pattern, segments }
    }

    /// The selector as written.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True if the selector contains `*` or `#`.
    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        self.segments.iter().any(|s| is_wildcard(s))
    }

    /// Topic-exchange matching of a routing key.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = routing_key.split(SEPARATOR).collect();
        let pattern: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        match_segments(&pattern, &key)
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&MULTI_WILDCARD, rest)) => {
            // `#` absorbs zero or more segments
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((head, rest)) => match key.split_first() {
            Some((segment, key_rest)) => {
                (*head == SINGLE_WILDCARD || head == segment) && match_segments(rest, key_rest)
            }
            None => false,
        },
    }
}

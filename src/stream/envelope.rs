// Wire types of the filtered stream and the pure line decoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::api::ApiErrorDetail;

/// Lines longer than this are dropped as malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub possibly_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Expanded objects shared by every record of one envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Includes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
}

impl Includes {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Look up the expanded author of a tweet.
    pub fn author_of(&self, tweet: &Tweet) -> Option<&User> {
        let author_id = tweet.author_id.as_deref()?;
        self.users.iter().find(|u| u.id == author_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingRule {
    pub id: String,
    #[serde(default)]
    pub tag: String,
}

/// One decoded line of the feed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default, deserialize_with = "one_or_many")]
    pub data: Vec<Tweet>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub matching_rules: Vec<MatchingRule>,
    /// Operational messages the server pushes in-band.
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}

/// The v2 stream sends `data` as an object; batched replays send an array.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Tweet>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Box<Tweet>),
        Many(Vec<Tweet>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(tweet) => vec![*tweet],
        OneOrMany::Many(tweets) => tweets,
    })
}

/// What a single line of the feed turned out to be.
#[derive(Debug)]
pub enum LineOutcome {
    KeepAlive,
    Envelope(StreamEnvelope),
    Malformed(String),
}

/// Decode one raw line. Never fails: bad input is reported as `Malformed`.
pub fn decode_line(raw: &[u8]) -> LineOutcome {
    let content = raw.strip_suffix(b"\n").unwrap_or(raw);
    if content.len() > MAX_LINE_BYTES {
        return LineOutcome::Malformed(format!(
            "line exceeds the {MAX_LINE_BYTES} byte limit"
        ));
    }
    let line = raw.trim_ascii();
    if line.is_empty() {
        return LineOutcome::KeepAlive;
    }
    match serde_json::from_slice::<StreamEnvelope>(line) {
        Ok(envelope) => LineOutcome::Envelope(envelope),
        Err(e) => LineOutcome::Malformed(e.to_string()),
    }
}

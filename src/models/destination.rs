// Destination Model
// A single egress target the relay process pushes the ingest stream to

use serde::{Deserialize, Serialize};

/// One configured egress target (external streaming platform)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Unique identifier
    pub id: String,

    /// Display name for the destination
    pub name: String,

    /// Base RTMP(S) ingest URL of the platform, without the stream key
    pub rtmp_url: String,

    /// Stream key appended to the URL path when rendering
    pub stream_key: String,

    /// Disabled destinations are kept in the store but never rendered
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Destination {
    /// Create a new enabled destination with a generated id
    pub fn new(name: impl Into<String>, rtmp_url: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            rtmp_url: rtmp_url.into(),
            stream_key: stream_key.into(),
            enabled: true,
        }
    }

    /// Full push target: base URL with a single trailing slash stripped,
    /// then the stream key as the final path segment
    pub fn push_url(&self) -> String {
        let base = self.rtmp_url.strip_suffix('/').unwrap_or(&self.rtmp_url);
        format!("{base}/{}", self.stream_key)
    }

    /// Whether the destination uses the secure transport scheme
    pub fn is_secure(&self) -> bool {
        self.rtmp_url.starts_with("rtmps://")
    }
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_url_appends_key() {
        let dest = Destination::new("Twitch", "rtmp://live.twitch.tv/app", "abc123");
        assert_eq!(dest.push_url(), "rtmp://live.twitch.tv/app/abc123");
    }

    #[test]
    fn test_push_url_strips_single_trailing_slash() {
        let dest = Destination::new("Twitch", "rtmp://live.twitch.tv/app/", "abc123");
        assert_eq!(dest.push_url(), "rtmp://live.twitch.tv/app/abc123");
    }

    #[test]
    fn test_is_secure() {
        let plain = Destination::new("a", "rtmp://a.example/live", "k");
        let secure = Destination::new("b", "rtmps://b.example/live", "k");
        assert!(!plain.is_secure());
        assert!(secure.is_secure());
    }
}

//! Configuration for the camgate bridge.
//!
//! The server binary builds a [`Config`] from CLI arguments and `CAMGATE_*`
//! environment variables; everything is validated up front so a missing
//! source URL or credential fails at startup, not mid-session.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP signaling server
    #[serde(default)]
    pub server: ServerConfig,

    /// MJPEG camera source
    #[serde(default)]
    pub source: SourceConfig,

    /// Media and peer connection settings
    #[serde(default)]
    pub media: MediaConfig,

    /// External vision-analysis collaborator
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

/// HTTP signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// MJPEG source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Camera URL serving `multipart/x-mixed-replace` JPEG parts
    #[serde(default)]
    pub url: String,

    /// Nominal frame rate; sets the frame time-base and the retry pacing
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Connect/handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Backoff between retries after a recoverable demux error, in
    /// milliseconds (roughly one frame period)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Upper bound on a single JPEG payload; larger scans are reset
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_fps() -> u32 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_backoff() -> u64 {
    33
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            fps: default_fps(),
            connect_timeout_secs: default_connect_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Media and peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// STUN servers for ICE gathering
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// Maximum number of concurrent peer connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-subscriber relay buffer in frames; a subscriber lagging past
    /// this skips ahead to the most recent frames
    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,

    /// Seconds to wait for ICE gathering before answering
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_secs: u64,
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_max_connections() -> usize {
    16
}

fn default_relay_capacity() -> usize {
    8
}

fn default_gather_timeout() -> u64 {
    5
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            max_connections: default_max_connections(),
            relay_capacity: default_relay_capacity(),
            gather_timeout_secs: default_gather_timeout(),
        }
    }
}

/// Wire format used when talking to the analysis collaborator.
///
/// The collaborator contract is request/response over HTTP; the exact body
/// shape is configuration, not a fixed vendor contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisWireFormat {
    /// JSON chat payload carrying the image as a base64 `data:` URL
    ChatCompletions,
    /// Binary JPEG POST with the prompt in a request header
    RawJpeg,
}

impl Default for AnalysisWireFormat {
    fn default() -> Self {
        AnalysisWireFormat::ChatCompletions
    }
}

/// Analysis collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Whether frames are forwarded for analysis at all
    #[serde(default)]
    pub enabled: bool,

    /// Collaborator endpoint URL
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,

    /// Bearer credential. Required when `enabled`; never logged.
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// Model identifier passed in chat-completion payloads
    #[serde(default = "default_model")]
    pub model: String,

    /// Text prompt sent alongside each frame
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Request body shape
    #[serde(default)]
    pub format: AnalysisWireFormat,

    /// Hard per-request timeout in seconds
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,

    /// Bounded worker queue depth; frames beyond it are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// JPEG quality (1-100) for submitted stills
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_analysis_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_prompt() -> String {
    "What is in this image?".to_string()
}

fn default_analysis_timeout() -> u64 {
    10
}

fn default_queue_depth() -> usize {
    4
}

fn default_jpeg_quality() -> u8 {
    80
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_analysis_endpoint(),
            api_key: String::new(),
            model: default_model(),
            prompt: default_prompt(),
            format: AnalysisWireFormat::default(),
            timeout_secs: default_analysis_timeout(),
            queue_depth: default_queue_depth(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            source: SourceConfig::default(),
            media: MediaConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl Config {
    /// Set the MJPEG source URL
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source.url = url.into();
        self
    }

    /// Set the HTTP listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Enable analysis with the given credential
    pub fn with_analysis_key(mut self, api_key: impl Into<String>) -> Self {
        self.analysis.enabled = true;
        self.analysis.api_key = api_key.into();
        self
    }

    /// Validate the configuration, failing fast with a descriptive error
    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() {
            return Err(Error::InvalidConfig(
                "MJPEG source URL is required (set --source-url or CAMGATE_SOURCE_URL)"
                    .to_string(),
            ));
        }

        let parsed = url::Url::parse(&self.source.url).map_err(|e| {
            Error::InvalidConfig(format!("Invalid MJPEG source URL '{}': {}", self.source.url, e))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "MJPEG source URL must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        if self.server.port == 0 {
            return Err(Error::InvalidConfig(
                "Listen port must be non-zero".to_string(),
            ));
        }

        if self.source.fps == 0 || self.source.fps > 240 {
            return Err(Error::InvalidConfig(format!(
                "Frame rate must be between 1 and 240, got {}",
                self.source.fps
            )));
        }

        if self.source.retry_backoff_ms == 0 {
            return Err(Error::InvalidConfig(
                "Retry backoff must be non-zero to avoid busy-looping".to_string(),
            ));
        }

        if self.source.max_frame_bytes < 1024 {
            return Err(Error::InvalidConfig(format!(
                "Max frame size must be at least 1024 bytes, got {}",
                self.source.max_frame_bytes
            )));
        }

        if self.media.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "Max connections must be at least 1".to_string(),
            ));
        }

        if self.media.relay_capacity == 0 {
            return Err(Error::InvalidConfig(
                "Relay capacity must be at least 1 frame".to_string(),
            ));
        }

        if self.analysis.enabled {
            if self.analysis.api_key.is_empty() {
                return Err(Error::InvalidConfig(
                    "Analysis credential is required when analysis is enabled \
                     (set --analysis-key or CAMGATE_ANALYSIS_KEY)"
                        .to_string(),
                ));
            }
            url::Url::parse(&self.analysis.endpoint).map_err(|e| {
                Error::InvalidConfig(format!(
                    "Invalid analysis endpoint '{}': {}",
                    self.analysis.endpoint, e
                ))
            })?;
            if self.analysis.timeout_secs == 0 {
                return Err(Error::InvalidConfig(
                    "Analysis timeout must be non-zero".to_string(),
                ));
            }
            if self.analysis.queue_depth == 0 {
                return Err(Error::InvalidConfig(
                    "Analysis queue depth must be at least 1".to_string(),
                ));
            }
            if self.analysis.jpeg_quality == 0 || self.analysis.jpeg_quality > 100 {
                return Err(Error::InvalidConfig(format!(
                    "JPEG quality must be between 1 and 100, got {}",
                    self.analysis.jpeg_quality
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::default().with_source_url("http://camera.local/stream")
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.source.fps, 30);
        assert_eq!(config.source.retry_backoff_ms, 33);
        assert_eq!(config.media.max_connections, 16);
        assert!(!config.analysis.enabled);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_source_url_rejected() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("source URL"));
    }

    #[test]
    fn test_non_http_source_url_rejected() {
        let config = Config::default().with_source_url("rtsp://camera.local/stream");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_backoff_rejected() {
        let mut config = valid_config();
        config.source.retry_backoff_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_analysis_requires_credential() {
        let mut config = valid_config();
        config.analysis.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("credential"));

        config.analysis.api_key = "sk-test".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_analysis_quality_range() {
        let mut config = valid_config().with_analysis_key("sk-test");
        config.analysis.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.analysis.jpeg_quality = 101;
        assert!(config.validate().is_err());
        config.analysis.jpeg_quality = 80;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wire_format_serialization() {
        let json = serde_json::to_string(&AnalysisWireFormat::ChatCompletions).unwrap();
        assert_eq!(json, "\"chat_completions\"");
        let parsed: AnalysisWireFormat = serde_json::from_str("\"raw_jpeg\"").unwrap();
        assert_eq!(parsed, AnalysisWireFormat::RawJpeg);
    }
}

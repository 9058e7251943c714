use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use sfumeet_proto::{MediaKind, RtpCodecCapability};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub sfu: SfuLimitsConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Path of the signaling WebSocket endpoint
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 5000,
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Media engine listen settings and router codecs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// IP the engine binds RTC sockets to
    pub listen_ip: String,
    /// Public IP advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Router codec list, shared read-only by every room
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 20000,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            codecs: vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()],
        }
    }
}

/// Room and peer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuLimitsConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Drop a room as soon as its last peer leaves
    pub drop_empty_rooms: bool,
}

impl Default for SfuLimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            drop_empty_rooms: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Largest accepted signaling frame, in bytes
    pub max_message_size: usize,
    /// Outbound queue capacity per connection
    pub send_buffer: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            send_buffer: 256,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SFUMEET_SERVER__HTTP_PORT, SFUMEET_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("SFUMEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// IP advertised to peers in ICE candidates
    #[must_use]
    pub fn announced_ip(&self) -> &str {
        self.media
            .announced_ip
            .as_deref()
            .unwrap_or(&self.media.listen_ip)
    }

    /// Check for misconfigurations, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.http_port == 0 {
            errors.push("server.http_port must not be 0".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            errors.push(format!(
                "server.ws_path must start with '/', got {:?}",
                self.server.ws_path
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.media.rtc_min_port == 0 || self.media.rtc_min_port > self.media.rtc_max_port {
            errors.push(format!(
                "media RTC port range {}-{} is invalid",
                self.media.rtc_min_port, self.media.rtc_max_port
            ));
        }
        if !self.media.enable_udp && !self.media.enable_tcp {
            errors.push("media: at least one of enable_udp / enable_tcp must be set".to_string());
        }
        let has_audio = self.media.codecs.iter().any(|c| c.kind == MediaKind::Audio);
        let has_video = self.media.codecs.iter().any(|c| c.kind == MediaKind::Video);
        if !has_audio && !has_video {
            errors.push("media.codecs must contain at least one audio or video codec".to_string());
        }
        for codec in &self.media.codecs {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
                errors.push(format!(
                    "media codec {} does not match its kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        if self.signaling.send_buffer == 0 {
            errors.push("signaling.send_buffer must be greater than 0".to_string());
        }
        if self.signaling.max_message_size < 1024 {
            errors.push("signaling.max_message_size must be at least 1024 bytes".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.media.rtc_min_port, 10000);
        assert_eq!(config.media.rtc_max_port, 20000);
        assert_eq!(config.media.codecs.len(), 2);
    }

    #[test]
    fn test_http_address() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:5000");
    }

    #[test]
    fn test_announced_ip_falls_back_to_listen_ip() {
        let mut config = Config::default();
        assert_eq!(config.announced_ip(), "127.0.0.1");
        config.media.announced_ip = Some("203.0.113.7".to_string());
        assert_eq!(config.announced_ip(), "203.0.113.7");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.http_port = 0;
        config.media.rtc_min_port = 30000;
        config.media.codecs.clear();
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_validate_rejects_mislabelled_codec() {
        let mut config = Config::default();
        config.media.codecs[0].kind = MediaKind::Video;
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("audio/opus"));
    }
}

//! Server configuration
//!
//! Loaded from a TOML file; every section has working defaults so a bare
//! `livehub` starts an RTMP-only relay. Out-of-range values are fatal at
//! startup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rtmp: RtmpConfig,
    pub http_flv: HttpFlvConfig,
    pub hls: HlsConfig,
    pub rtp: RtpConfig,
    /// 1 (fatal) .. 5 (debug)
    pub log_level: u8,
}

/// RTMP listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    pub port: u16,
    /// GOP ring capacity (1..=255)
    pub gop_size: u8,
    /// Publisher read deadline in seconds
    pub read_timeout: u64,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            port: 1935,
            gop_size: 1,
            read_timeout: 10,
        }
    }
}

impl RtmpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

/// HTTP-FLV listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpFlvConfig {
    pub enable: bool,
    pub port: u16,
}

impl Default for HttpFlvConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: 8080,
        }
    }
}

/// HLS segmenter settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub enable: bool,
    pub port: u16,
    /// Directory for segments and playlists
    pub ts_path: String,
    /// Segment file name prefix
    pub ts_prefix: String,
    /// Minimum segment duration in milliseconds
    pub ts_duration: u64,
    /// Sliding playlist span in milliseconds
    pub ts_window: u64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: 8081,
            ts_path: "./hls".to_string(),
            ts_prefix: String::new(),
            ts_duration: 2000,
            ts_window: 6000,
        }
    }
}

impl HlsConfig {
    /// Playlist entry count
    pub fn window_size(&self) -> usize {
        (self.ts_window / self.ts_duration.max(1)) as usize
    }
}

/// RTP ingest settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    pub enable: bool,
    /// Even RTP ports; each uses the next odd port for RTCP
    pub ports: Vec<u16>,
    /// Optional upstream RTMP URL used as an extra sink
    pub remote: Option<String>,
    /// Session read deadline in seconds
    pub read_timeout: u64,
    /// Room name for ingested media; defaults to "rtp-{port}"
    pub stream: Option<String>,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            ports: Vec::new(),
            remote: None,
            read_timeout: 30,
            stream: None,
        }
    }
}

impl RtpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Config =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks; violations are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.rtmp.gop_size == 0 {
            return Err(Error::Config("rtmp.gop_size must be 1..=255".into()));
        }
        if self.rtmp.read_timeout == 0 {
            return Err(Error::Config("rtmp.read_timeout must be positive".into()));
        }
        if self.hls.enable {
            if self.hls.ts_duration == 0 {
                return Err(Error::Config("hls.ts_duration must be positive".into()));
            }
            if self.hls.ts_window < self.hls.ts_duration {
                return Err(Error::Config(
                    "hls.ts_window must be at least hls.ts_duration".into(),
                ));
            }
        }
        if self.rtp.enable {
            if self.rtp.ports.is_empty() {
                return Err(Error::Config("rtp.ports must not be empty".into()));
            }
            for port in &self.rtp.ports {
                if port % 2 == 1 {
                    return Err(Error::Config(format!(
                        "rtp port {} must be even (RTCP takes the next odd port)",
                        port
                    )));
                }
            }
        }
        if self.log_level != 0 && !(1..=5).contains(&self.log_level) {
            return Err(Error::Config("log_level must be 1..=5".into()));
        }
        Ok(())
    }

    /// Map the numeric log level onto a tracing filter directive
    pub fn tracing_filter(&self) -> &'static str {
        match self.log_level {
            1 | 2 => "error",
            3 => "warn",
            0 | 4 => "info",
            _ => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rtmp.port, 1935);
        assert_eq!(config.rtmp.gop_size, 1);
        assert!(!config.hls.enable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            log_level = 5

            [rtmp]
            port = 2935
            gop_size = 2
            read_timeout = 5

            [hls]
            enable = true
            ts_path = "/tmp/hls"
            ts_duration = 2000
            ts_window = 6000

            [rtp]
            enable = true
            ports = [5004]
            remote = "rtmp://upstream/live/cam"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.rtmp.port, 2935);
        assert_eq!(config.rtmp.gop_size, 2);
        assert_eq!(config.hls.window_size(), 3);
        assert_eq!(config.rtp.ports, vec![5004]);
        assert_eq!(config.tracing_filter(), "debug");
    }

    #[test]
    fn test_invalid_gop_size() {
        let mut config = Config::default();
        config.rtmp.gop_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_odd_rtp_port_rejected() {
        let mut config = Config::default();
        config.rtp.enable = true;
        config.rtp.ports = vec![5005];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_window_smaller_than_duration_rejected() {
        let mut config = Config::default();
        config.hls.enable = true;
        config.hls.ts_duration = 4000;
        config.hls.ts_window = 2000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}

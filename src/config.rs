//! Configuration loading for the broadcast server.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables (prefixed with `LPXCAST_`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LPXCAST_PORT=9090
//! LPXCAST_TARGET_FPS=24.0
//! LPXCAST_LOOP_VIDEO=false
//! ```
//!
//! # Example
//!
//! ```no_run
//! use lpxcast::config::ServerConfig;
//!
//! let config = ServerConfig::load_from("config.toml")?;
//! # Ok::<(), lpxcast::error::LpxError>(())
//! ```

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, LpxError};

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the binary scan-tables resource (see `tables::load`).
    pub scan_tables_path: PathBuf,

    /// Path to the source video file.
    pub video_file_path: PathBuf,

    /// TCP port the broadcast server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Output frame width in pixels.
    pub output_width: u32,

    /// Output frame height in pixels.
    pub output_height: u32,

    /// Target frame rate. `<= 0.0` means "use the video's native fps".
    #[serde(default)]
    pub target_fps: f64,

    /// Whether to loop the video on end-of-stream.
    #[serde(default = "default_loop_video")]
    pub loop_video: bool,

    /// `tracing` filter directive, e.g. "info" or "lpxcast=debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    8080
}

fn default_loop_video() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load configuration from `lpxcast.toml` in the current directory and
    /// the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("lpxcast.toml")
    }

    /// Load configuration from a specific file path, then environment
    /// overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns `LpxError::Config` if the file cannot be parsed, or
    /// `LpxError::Configuration` if the loaded values fail validation.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LPXCAST_"))
            .extract()
            .map_err(LpxError::Config)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - `port` is non-zero
    /// - `output_width` / `output_height` are non-zero
    /// - `scan_tables_path` / `video_file_path` are non-empty
    pub fn validate(&self) -> AppResult<()> {
        if self.port == 0 {
            return Err(LpxError::Configuration("port must be non-zero".into()));
        }
        if self.output_width == 0 || self.output_height == 0 {
            return Err(LpxError::Configuration(
                "output_width and output_height must be non-zero".into(),
            ));
        }
        if self.scan_tables_path.as_os_str().is_empty() {
            return Err(LpxError::Configuration(
                "scan_tables_path must not be empty".into(),
            ));
        }
        if self.video_file_path.as_os_str().is_empty() {
            return Err(LpxError::Configuration(
                "video_file_path must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_toml_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            scan_tables_path = "tables.lpxt"
            video_file_path = "video.mp4"
            output_width = 640
            output_height = 480
            "#
        )
        .unwrap();

        let config = ServerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.loop_video);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.target_fps, 0.0);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let config = ServerConfig {
            scan_tables_path: "t".into(),
            video_file_path: "v".into(),
            port: 0,
            output_width: 640,
            output_height: 480,
            target_fps: 0.0,
            loop_video: true,
            log_level: "info".into(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_dimensions() {
        let config = ServerConfig {
            scan_tables_path: "t".into(),
            video_file_path: "v".into(),
            port: 8080,
            output_width: 0,
            output_height: 480,
            target_fps: 0.0,
            loop_video: true,
            log_level: "info".into(),
        };
        assert!(config.validate().is_err());
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which verification provider the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Domain-keyed deployment, no request auth.
    AwsDemo,
    /// Self-hosted deployment with basic auth.
    Sst,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::AwsDemo => "aws_demo",
            BackendKind::Sst => "sst",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws_demo" => Ok(BackendKind::AwsDemo),
            "sst" => Ok(BackendKind::Sst),
            other => Err(ConfigError::Invalid {
                key: "backend",
                reason: format!("unknown backend '{other}' (expected aws_demo or sst)"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsDemoSettings {
    /// Host substituted into the challenge URL template.
    pub domain: String,
}

impl Default for AwsDemoSettings {
    fn default() -> Self {
        Self {
            domain: "69hes0gg2k.execute-api.ap-southeast-1.amazonaws.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SstSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl Default for SstSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub backend: BackendKind,
    /// Frame source: an image file or a directory of images to replay.
    pub camera_device: String,
    /// Target frame rate of the media thread.
    pub fps: u32,
    /// Detection worker threads. Independent of `fps`.
    pub detection_workers: usize,
    /// Upper bound on how long shutdown waits for workers and the media thread.
    pub shutdown_timeout_ms: u64,
    /// JPEG quality for uploaded frames.
    pub jpeg_quality: u8,
    /// External detector program and arguments, run once per analysed frame.
    pub detector_command: Option<Vec<String>>,
    /// A detector run longer than this is killed and treated as no face.
    pub detector_timeout_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::AwsDemo,
            camera_device: "/dev/video0".to_string(),
            fps: 6,
            detection_workers: 2,
            shutdown_timeout_ms: 2000,
            jpeg_quality: 85,
            detector_command: None,
            detector_timeout_ms: 5000,
        }
    }
}

/// Persisted settings document (`tumtum.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub aws_demo: AwsDemoSettings,
    pub sst: SstSettings,
    pub daemon: DaemonSettings,
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// absent or invalid, then apply `TUMTUM_*` environment overrides.
    pub fn load_or_default(path: &Path) -> Self {
        let mut settings = if path.exists() {
            match Self::load(path) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring settings file, using defaults");
                    Self::default()
                }
            }
        } else {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            Self::default()
        };
        settings.apply_env();
        settings
    }

    /// Strict load: any read, parse or validation failure is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.fps == 0 {
            return Err(ConfigError::Invalid {
                key: "daemon.fps",
                reason: "must be at least 1".into(),
            });
        }
        if self.daemon.detection_workers == 0 {
            return Err(ConfigError::Invalid {
                key: "daemon.detection_workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.aws_demo.domain.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "aws_demo.domain",
                reason: "must not be empty".into(),
            });
        }
        if reqwest::Url::parse(&self.sst.base_url).is_err() {
            return Err(ConfigError::Invalid {
                key: "sst.base_url",
                reason: format!("'{}' is not a URL", self.sst.base_url),
            });
        }
        if self.daemon.detector_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "daemon.detector_timeout_ms",
                reason: "must be at least 1".into(),
            });
        }
        if matches!(&self.daemon.detector_command, Some(argv) if argv.is_empty()) {
            return Err(ConfigError::Invalid {
                key: "daemon.detector_command",
                reason: "must name a program".into(),
            });
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TUMTUM_BACKEND") {
            match v.parse() {
                Ok(kind) => self.daemon.backend = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring TUMTUM_BACKEND"),
            }
        }
        if let Ok(v) = std::env::var("TUMTUM_CAMERA_DEVICE") {
            self.daemon.camera_device = v;
        }
        self.daemon.fps = env_u32("TUMTUM_FPS", self.daemon.fps).max(1);
        self.daemon.detection_workers =
            env_usize("TUMTUM_DETECTION_WORKERS", self.daemon.detection_workers).max(1);
    }
}

/// Settings file location: `$TUMTUM_CONFIG`, else `$XDG_CONFIG_HOME/tumtum.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("TUMTUM_CONFIG") {
        return PathBuf::from(p);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("tumtum.toml")
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

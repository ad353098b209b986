use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub downloads: DownloadsConfig,
    pub encoder: EncoderConfig,
    pub helper: HelperConfig,
    pub http: HttpConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    pub path: PathBuf,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub binary_path: Option<PathBuf>,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    pub binary_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub request_timeout_secs: u64,
    pub manifest_cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downloads: DownloadsConfig {
                path: PathBuf::from("./downloads"),
                max_concurrent: 3,
            },
            encoder: EncoderConfig {
                binary_path: None,
                probe_timeout_secs: 5,
            },
            helper: HelperConfig { binary_path: None },
            http: HttpConfig {
                request_timeout_secs: 30,
                manifest_cache_capacity: 100,
            },
            transport: TransportConfig {
                max_frame_bytes: 1024 * 1024,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, EngineError> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)
                .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config).unwrap_or_default();
            std::fs::create_dir_all(&default_config.downloads.path)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}

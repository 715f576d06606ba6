//! Configuration for the feed client, stream player and presence synchronizer.
//!
//! The configuration is read from a TOML file. Every section and every field
//! has a default, so a missing or partial file is valid:
//!
//! ```toml
//! [feed]
//! endpoint = "wss://listen.moe/gateway_v2"
//!
//! [player]
//! restart_timeout = 20
//!
//! [presence]
//! enable = false
//! ```
//!
//! Each component receives only its own section at construction.

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use url::Url;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub player: PlayerConfig,
    pub presence: PresenceConfig,
}

/// Settings for the event feed client.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Websocket endpoint of the event feed.
    pub endpoint: Url,

    /// Heartbeat interval to use instead of the one announced by the server.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<Duration>,

    /// Delay before retrying after a connection attempt failed. Sessions that
    /// were established and then closed are reopened immediately.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_delay: Duration,
}

impl FeedConfig {
    pub const DEFAULT_ENDPOINT: &'static str = "wss://listen.moe/gateway_v2";
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_url(Self::DEFAULT_ENDPOINT),
            heartbeat: None,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Settings for the stream player and its watchdog.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Audio stream to play.
    pub stream_url: Url,

    /// Number of one-second ticks the engine may sit idle while unpaused
    /// before the stream is restarted.
    pub restart_timeout: u32,

    /// Volume change of a single raise or lower step, in percent.
    pub volume_step: u8,

    /// Seconds to stay behind the live edge when resuming from pause.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_pause_wait: Duration,

    /// Volume in percent when no volume was persisted yet.
    pub default_volume: u8,

    /// Upper bound for the volume, in percent.
    pub max_volume: u8,
}

impl PlayerConfig {
    pub const DEFAULT_STREAM_URL: &'static str = "https://listen.moe/stream";
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            stream_url: default_url(Self::DEFAULT_STREAM_URL),
            restart_timeout: 20,
            volume_step: 10,
            cache_pause_wait: Duration::from_secs(3),
            default_volume: 100,
            max_volume: 100,
        }
    }
}

/// Settings for the presence synchronizer.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub enable: bool,

    /// Application ID registered with the presence service.
    pub client_id: String,

    /// Appended to free-text fields that are too short to be accepted.
    pub placeholder: String,

    /// Fall back to the artist image when a song has no album image.
    pub use_artist: bool,

    /// Show a fallback image when a song has no image at all.
    pub use_fallback: bool,

    /// Fallback image as an asset key, for sinks speaking the primary
    /// protocol.
    pub fallback_image: String,

    /// Fallback image as an absolute URL, for compatible shims that cannot
    /// resolve asset keys.
    pub fallback_image_url: String,

    pub button_label: String,
    pub button_url: String,

    /// Delay before retrying when the sink is not running.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_delay: Duration,

    /// Maximum time to wait for the sink to acknowledge an update.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enable: true,
            client_id: "1042365983957975080".to_owned(),
            placeholder: " ♪".to_owned(),
            use_artist: true,
            use_fallback: true,
            fallback_image: "fallback2".to_owned(),
            fallback_image_url: "https://listen.moe/_nuxt/img/logo-square-64.248c1f3.png"
                .to_owned(),
            button_label: "Join radio".to_owned(),
            button_url: "https://listen.moe/".to_owned(),
            reconnect_delay: Duration::from_secs(120),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    ///
    /// When the file does not exist, the defaults are written to it so that
    /// users get a template to edit.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written, or if it is
    /// not valid TOML for this configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("writing default configuration to {}", path.display());
                let config = Self::default();
                config.write(path)?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses the configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the string is not valid TOML for this
    /// configuration, or if the stall threshold is zero.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.player.restart_timeout == 0 {
            return Err(Error::invalid_argument(
                "player.restart_timeout must be at least one tick",
            ));
        }
        Ok(config)
    }

    /// Writes the configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

// Only called with the compile-time constants above.
fn default_url(url: &str) -> Url {
    match Url::parse(url) {
        Ok(url) => url,
        Err(e) => unreachable!("invalid default url {url}: {e}"),
    }
}

//! Facade over the audio decode and render engine.
//!
//! The stream watchdog and the manual controls only ever talk to the engine
//! through [`Engine`]. All methods take `&self` and return immediately:
//! loading a stream happens in the background, and progress is observed
//! through [`Engine::is_idle`] and the watch channels.

use std::{collections::BTreeMap, time::Duration};

use tokio::sync::watch;
use url::Url;

use crate::error::Result;

/// Raw metadata tags carried by the audio stream, keyed by lower-case name.
pub type Tags = BTreeMap<String, String>;

/// Buffering state of the engine's download cache.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CacheState {
    /// Audio downloaded ahead of the playback position.
    pub buffered: Duration,

    /// Whether the cache is about to run dry.
    pub low: bool,
}

/// Controls of the audio engine, as seen by the player.
pub trait Engine: Send + Sync + 'static {
    /// Starts playing `url`, replacing whatever was playing before.
    ///
    /// # Errors
    ///
    /// Returns an error if playback cannot be set up. Failures while loading
    /// the stream in the background are logged and leave the engine idle.
    fn play(&self, url: &Url) -> Result<()>;

    /// Pauses rendering. Downloading goes on while the cache has room.
    fn pause(&self);

    /// Resumes rendering where it was paused.
    fn resume(&self);

    /// Whether the user paused playback. Survives stream restarts.
    fn is_paused(&self) -> bool;

    /// Whether no audio is being decoded and rendered.
    fn is_idle(&self) -> bool;

    /// Skips `offset` ahead of the current playback position.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is playing.
    fn seek(&self, offset: Duration) -> Result<()>;

    /// User volume in percent.
    fn volume(&self) -> u8;

    /// Sets the user volume in percent.
    fn set_volume(&self, volume: u8);

    /// Output stage volume in percent, applied on top of the user volume.
    fn output_volume(&self) -> u8;

    /// Sets the output stage volume in percent.
    fn set_output_volume(&self, volume: u8);

    /// Current cache state, if anything is playing.
    fn cache_state(&self) -> Option<CacheState>;

    /// Becomes `true` once decoded audio of the current stream is rendered.
    fn playing(&self) -> watch::Receiver<bool>;

    /// Latest metadata tags of the current stream.
    fn tags(&self) -> watch::Receiver<Tags>;
}

//! Events emitted towards the presentation layer.
//!
//! Components never call into the presentation layer directly. They send
//! events over an unbounded channel instead, so a slow consumer can never
//! stall the feed session, the watchdog or the presence task.
//!
//! # Example
//!
//! ```rust
//! use kiku::events::{self, Event};
//!
//! let (tx, mut rx) = events::channel();
//! # drop(tx);
//! while let Some(event) = rx.blocking_recv() {
//!     match event {
//!         Event::Status { component, status } => println!("{component}: {status}"),
//!         Event::NowPlaying(now_playing) => println!("{}", now_playing.song),
//!         Event::StreamMetadata(song) => println!("stream says: {song}"),
//!     }
//! }
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{now_playing::NowPlaying, song::Song, status::ConnectionStatus};

/// Sending half of the event channel.
pub type Sender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event channel.
pub type Receiver = mpsc::UnboundedReceiver<Event>;

/// Creates a new event channel.
#[must_use]
pub fn channel() -> (Sender, Receiver) {
    mpsc::unbounded_channel()
}

/// Components that report their status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// The event feed client.
    Feed,

    /// The presence synchronizer.
    Presence,

    /// The stream player and its watchdog.
    Stream,
}

impl Component {
    /// Channel name as shown by the presentation layer.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Feed => "Websocket",
            Self::Presence => "Presence",
            Self::Stream => "Stream",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Events that can be emitted by the components.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A component changed its running state or reason.
    Status {
        component: Component,
        status: ConnectionStatus,
    },

    /// The now-playing record was replaced.
    ///
    /// Emitted on every track change and on every heartbeat
    /// acknowledgement, the latter serving as a liveness signal.
    NowPlaying(Arc<NowPlaying>),

    /// The audio stream carried new metadata tags.
    StreamMetadata(Arc<Song>),
}

//! The shared now-playing record.
//!
//! A [`NowPlaying`] is never mutated once published. Every change builds a
//! complete new record and publishes it by replacing the shared reference,
//! so readers never see a song paired with the presence snapshot of the
//! previous one.
//!
//! Before the first track update there is no record at all. The feed status
//! reads "Initialising" instead.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    events::{self, Event},
    presence::PresenceSnapshot,
    protocol::feed::{RadioEvent, Requester, TrackUpdate},
    song::Song,
    util,
};

/// What the radio is playing, as last reported by the feed.
#[derive(Clone, Debug, PartialEq)]
pub struct NowPlaying {
    pub song: Song,

    /// When the track started, as reported by the feed.
    pub start_time: Option<String>,

    /// Listeners tuned in when the track started.
    pub listeners: u64,

    /// Listener who requested the track, if any.
    pub requester: Option<Requester>,

    /// Special programme on air, if any.
    pub event: Option<RadioEvent>,

    /// Epoch seconds of the last heartbeat acknowledgement, or of the track
    /// update if none arrived since.
    pub last_heartbeat: f64,

    /// Presence built for this song, whether or not the sink accepted it.
    /// `None` when presence is disabled or was not running.
    pub presence: Option<PresenceSnapshot>,
}

impl NowPlaying {
    /// Builds a record from a track update, stamped with the current time.
    #[must_use]
    pub fn new(update: TrackUpdate, presence: Option<PresenceSnapshot>) -> Self {
        let TrackUpdate {
            song,
            start_time,
            listeners,
            requester,
            event,
        } = update;

        Self {
            song,
            start_time,
            listeners,
            requester,
            event,
            last_heartbeat: util::now_from_epoch(),
            presence,
        }
    }

    /// Returns a copy with the heartbeat timestamp set to `at`.
    #[must_use]
    pub fn with_heartbeat(&self, at: f64) -> Self {
        Self {
            last_heartbeat: at,
            ..self.clone()
        }
    }
}

/// Single writer of the now-playing record.
#[derive(Debug)]
pub struct Publisher {
    current: watch::Sender<Option<Arc<NowPlaying>>>,
    events: Option<events::Sender>,
}

impl Publisher {
    /// Creates a publisher with no record yet.
    #[must_use]
    pub fn new(events: Option<events::Sender>) -> Self {
        Self {
            current: watch::Sender::new(None),
            events,
        }
    }

    /// Subscribes to record replacements.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<NowPlaying>>> {
        self.current.subscribe()
    }

    /// The record published last, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<NowPlaying>> {
        self.current.borrow().clone()
    }

    /// Replaces the record and forwards it to the presentation layer.
    pub fn publish(&self, now_playing: NowPlaying) {
        let now_playing = Arc::new(now_playing);
        self.current.send_replace(Some(Arc::clone(&now_playing)));

        if let Some(events) = &self.events {
            let _ = events.send(Event::NowPlaying(now_playing));
        }
    }

    /// Replaces the record with one carrying a fresh heartbeat timestamp.
    ///
    /// Does nothing before the first track update.
    pub fn heartbeat(&self) {
        if let Some(current) = self.current() {
            self.publish(current.with_heartbeat(util::now_from_epoch()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(title: &str) -> TrackUpdate {
        TrackUpdate {
            song: Song {
                title: Some(title.to_owned()),
                ..Default::default()
            },
            start_time: None,
            listeners: 1,
            requester: None,
            event: None,
        }
    }

    #[test]
    fn nothing_before_first_track() {
        let publisher = Publisher::new(None);
        publisher.heartbeat();
        assert!(publisher.current().is_none());
    }

    #[test]
    fn heartbeat_replaces_whole_record() {
        let (tx, mut rx) = events::channel();
        let publisher = Publisher::new(Some(tx));

        publisher.publish(NowPlaying::new(update("A"), None));
        let first = publisher.current().unwrap();
        publisher.heartbeat();
        let second = publisher.current().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.song, first.song);
        assert!(second.last_heartbeat >= first.last_heartbeat);

        assert!(matches!(rx.try_recv(), Ok(Event::NowPlaying(np)) if Arc::ptr_eq(&np, &first)));
        assert!(matches!(rx.try_recv(), Ok(Event::NowPlaying(np)) if Arc::ptr_eq(&np, &second)));
    }
}

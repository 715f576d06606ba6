//! Stream player: the watchdog over the audio engine and the controls
//! exposed to the presentation layer.
//!
//! The watchdog polls the engine once per second. While the engine sits
//! idle without being paused, it counts ticks; once the count exceeds the
//! configured threshold, the stream is restarted on the same URL. Counting
//! only begins after the engine first reported playback and a non-empty set
//! of stream tags, so that initial buffering is never taken for a stall.

use std::{sync::Arc, time::Duration};

use tokio::time::{self, MissedTickBehavior};

use crate::{
    config::PlayerConfig,
    engine::{Engine, Tags},
    error::Result,
    events::{self, Event},
    persist::Store,
    song::Song,
    status::Reporter,
    stream::StreamEngine,
};

/// Watchdog poll interval.
pub const TICK: Duration = Duration::from_secs(1);

const BUFFERING: &str = "Buffering...";
const PLAYING: &str = "playing";
const STALLED: &str = "stalled, restarting";

/// Stall counter of the watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watchdog {
    threshold: u32,
    idle_ticks: u32,
}

impl Watchdog {
    /// Creates a watchdog that restarts after more than `threshold`
    /// consecutive idle ticks.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            idle_ticks: 0,
        }
    }

    /// Accounts for one tick. Returns whether the stream must be restarted.
    pub fn tick(&mut self, idle: bool, paused: bool) -> bool {
        if !idle || paused {
            self.idle_ticks = 0;
            return false;
        }

        self.idle_ticks = self.idle_ticks.saturating_add(1);
        if self.idle_ticks > self.threshold {
            self.idle_ticks = 0;
            return true;
        }

        false
    }

    /// Consecutive idle ticks counted so far.
    #[must_use]
    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }
}

/// Plays the stream, supervises it, and exposes the manual controls.
pub struct Player<E: Engine = StreamEngine> {
    engine: Arc<E>,
    config: PlayerConfig,
    store: Option<Arc<Store>>,
    reporter: Reporter,
    events: Option<events::Sender>,
}

impl<E: Engine> Player<E> {
    /// Creates a player and restores the persisted volume on the engine.
    #[must_use]
    pub fn new(
        engine: Arc<E>,
        config: PlayerConfig,
        store: Option<Arc<Store>>,
        reporter: Reporter,
        events: Option<events::Sender>,
    ) -> Self {
        if let Some(store) = &store {
            match store.last_volume() {
                Ok(volume) => engine.set_volume(volume.min(config.max_volume)),
                Err(e) => warn!("failed to restore volume: {e}"),
            }
        }

        Self {
            engine,
            config,
            store,
            reporter,
            events,
        }
    }

    /// Starts the stream and supervises it until the task is dropped.
    pub async fn run(&self) {
        self.reporter.update(false, BUFFERING);
        if let Err(e) = self.engine.play(&self.config.stream_url) {
            error!("failed to start stream: {e}");
            self.reporter.update(false, e.to_string());
        }

        let mut playing = self.engine.playing();
        let mut tags = self.engine.tags();

        let mut started = *playing.borrow_and_update();
        let initial = tags.borrow_and_update().clone();
        let mut tagged = !initial.is_empty();
        if tagged {
            self.forward_tags(&initial);
            if started {
                self.reporter.update(true, PLAYING);
            }
        }

        let mut watchdog = Watchdog::new(self.config.restart_timeout);
        let mut ticks = time::interval_at(time::Instant::now() + TICK, TICK);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                Ok(()) = playing.changed() => {
                    if *playing.borrow_and_update() {
                        started = true;
                        if tagged {
                            self.reporter.update(true, PLAYING);
                        }
                    }
                }

                Ok(()) = tags.changed() => {
                    let tags = tags.borrow_and_update().clone();
                    if !tags.is_empty() {
                        if !tagged && started {
                            self.reporter.update(true, PLAYING);
                        }
                        tagged = true;
                        self.forward_tags(&tags);
                    }
                }

                _ = ticks.tick() => {
                    if started
                        && tagged
                        && watchdog.tick(self.engine.is_idle(), self.engine.is_paused())
                    {
                        warn!(
                            "stream idle for more than {} seconds while not paused, restarting",
                            self.config.restart_timeout
                        );
                        self.reporter.update(false, STALLED);
                        if let Err(e) = self.restart() {
                            error!("failed to restart stream: {e}");
                        }
                    }
                }
            }
        }
    }

    fn forward_tags(&self, tags: &Tags) {
        let song = Song::from_tags(tags);
        debug!("stream metadata: {song}");
        if let Some(events) = &self.events {
            let _ = events.send(Event::StreamMetadata(Arc::new(song)));
        }
    }

    /// Replays the stream from its live edge, keeping playback unpaused.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot start playback.
    /// Reopens the stream, leaving it unpaused.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot start playing.
    pub fn restart(&self) -> Result<()> {
        self.engine.play(&self.config.stream_url)?;
        if self.engine.is_paused() {
            self.engine.resume();
        }
        Ok(())
    }

    /// Resumes playback.
    pub fn play(&self) {
        self.engine.resume();
    }

    /// Pauses playback.
    pub fn pause(&self) {
        self.engine.pause();
    }

    /// Pauses, or resumes close to the live edge of the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if skipping ahead fails.
    pub fn toggle(&self) -> Result<()> {
        if self.engine.is_paused() {
            self.play();
            self.seek_to_end()
        } else {
            self.pause();
            Ok(())
        }
    }

    /// Skips ahead to the end of the cache minus the configured pre-roll.
    ///
    /// Does nothing when the engine cannot tell how much is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to skip.
    pub fn seek_to_end(&self) -> Result<()> {
        let Some(cache) = self.engine.cache_state() else {
            return Ok(());
        };

        let offset = cache.buffered.saturating_sub(self.config.cache_pause_wait);
        if offset.is_zero() {
            return Ok(());
        }

        self.engine.seek(offset)
    }

    /// Raises the volume by one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be persisted.
    pub fn raise_volume(&self) -> Result<u8> {
        let volume = self.engine.volume().saturating_add(self.config.volume_step);
        self.set_volume(volume)
    }

    /// Lowers the volume by one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be persisted.
    pub fn lower_volume(&self) -> Result<u8> {
        let volume = self.engine.volume().saturating_sub(self.config.volume_step);
        self.set_volume(volume)
    }

    /// Sets and persists the volume, capped at the configured maximum.
    /// Returns the volume that was set.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be persisted.
    pub fn set_volume(&self, volume: u8) -> Result<u8> {
        let volume = volume.min(self.config.max_volume);
        self.engine.set_volume(volume);
        debug!("volume: {volume}%");

        if let Some(store) = &self.store {
            store.set_last_volume(volume)?;
        }

        Ok(volume)
    }

    /// Sets the output stage volume. Not persisted.
    pub fn set_output_volume(&self, volume: u8) -> u8 {
        let volume = volume.min(100);
        self.engine.set_output_volume(volume);
        debug!("output volume: {volume}%");
        volume
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::{
        engine::{mock::MockEngine, CacheState},
        events::Component,
        status::ConnectionStatus,
    };

    use super::*;

    fn player(
        engine: &Arc<MockEngine>,
        store: Option<Arc<Store>>,
    ) -> (Player<MockEngine>, events::Receiver) {
        let (tx, rx) = events::channel();
        let reporter = Reporter::new(Component::Stream, Some(tx.clone()));
        let player = Player::new(
            Arc::clone(engine),
            PlayerConfig::default(),
            store,
            reporter,
            Some(tx),
        );
        (player, rx)
    }

    #[test]
    fn restarts_once_after_threshold() {
        let mut watchdog = Watchdog::new(20);
        let restarts = (0..21).filter(|_| watchdog.tick(true, false)).count();
        assert_eq!(restarts, 1);
        assert_eq!(watchdog.idle_ticks(), 0);

        assert!(!watchdog.tick(true, false));
        assert_eq!(watchdog.idle_ticks(), 1);
        assert!(!watchdog.tick(false, false));
        assert_eq!(watchdog.idle_ticks(), 0);
    }

    #[test]
    fn paused_never_stalls() {
        let mut watchdog = Watchdog::new(2);
        for _ in 0..10 {
            assert!(!watchdog.tick(true, true));
        }
        assert_eq!(watchdog.idle_ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_counting_before_playback_started() {
        let engine = Arc::new(MockEngine::default());
        engine.idle.store(true, Ordering::SeqCst);
        let (player, _rx) = player(&engine, None);

        let run = tokio::time::timeout(Duration::from_secs(60), player.run());
        assert!(run.await.is_err());

        // Only the initial play.
        assert_eq!(engine.plays(), 1);
        assert_eq!(
            player.reporter.status(),
            ConnectionStatus::new(false, BUFFERING)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_restarts_once() {
        let engine = Arc::new(MockEngine::default());
        let (player, mut rx) = player(&engine, None);
        engine.idle.store(true, Ordering::SeqCst);
        engine.paused.store(true, Ordering::SeqCst);

        // Idle ticks while paused do nothing, then 21 unpaused ones do.
        let watched = Arc::clone(&engine);
        let script = async move {
            time::sleep(Duration::from_millis(1_500)).await;
            watched.start();
            time::sleep(Duration::from_secs(20)).await;
            watched.paused.store(false, Ordering::SeqCst);
        };
        let run = tokio::time::timeout(Duration::from_millis(42_700), player.run());
        let (result, ()) = tokio::join!(run, script);
        assert!(result.is_err());

        // The initial play plus one restart.
        assert_eq!(engine.plays(), 2);
        assert_eq!(*engine.resumes.lock().unwrap(), 0);

        let mut song = None;
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::StreamMetadata(s) => song = Some(s),
                Event::Status { status, .. } => statuses.push(status.reason),
                Event::NowPlaying(_) => {}
            }
        }
        assert_eq!(song.unwrap().title(), "Stream title");
        assert_eq!(statuses, [BUFFERING, PLAYING, STALLED]);
    }

    #[test]
    fn restart_resumes_when_paused() {
        let engine = Arc::new(MockEngine::default());
        let (player, _rx) = player(&engine, None);
        engine.pause();

        player.restart().unwrap();
        assert_eq!(engine.plays(), 1);
        assert!(!engine.is_paused());
        assert_eq!(*engine.resumes.lock().unwrap(), 1);
    }

    #[test]
    fn toggle_resumes_near_live_edge() {
        let engine = Arc::new(MockEngine::default());
        let (player, _rx) = player(&engine, None);

        player.toggle().unwrap();
        assert!(engine.is_paused());

        *engine.cache.lock().unwrap() = Some(CacheState {
            buffered: Duration::from_secs(10),
            low: false,
        });
        player.toggle().unwrap();
        assert!(!engine.is_paused());
        assert_eq!(*engine.seeks.lock().unwrap(), [Duration::from_secs(7)]);

        // Less buffered than the pre-roll: nothing to skip.
        player.pause();
        *engine.cache.lock().unwrap() = Some(CacheState {
            buffered: Duration::from_secs(2),
            low: false,
        });
        player.toggle().unwrap();
        assert_eq!(engine.seeks.lock().unwrap().len(), 1);
    }

    #[test]
    fn volume_is_capped_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        let store = Arc::new(Store::open(&path, 40).unwrap());

        let engine = Arc::new(MockEngine::default());
        let (player, _rx) = player(&engine, Some(Arc::clone(&store)));
        assert_eq!(engine.volume(), 40);

        assert_eq!(player.raise_volume().unwrap(), 50);
        assert_eq!(player.set_volume(250).unwrap(), 100);
        assert_eq!(player.raise_volume().unwrap(), 100);
        assert_eq!(player.lower_volume().unwrap(), 90);

        let reopened = Store::open(&path, 40).unwrap();
        assert_eq!(reopened.last_volume().unwrap(), 90);

        assert_eq!(player.set_output_volume(150), 100);
        assert_eq!(engine.output_volume(), 100);
        assert_eq!(Store::open(&path, 40).unwrap().last_volume().unwrap(), 90);
    }
}

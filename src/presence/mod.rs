//! Mirrors the now-playing song to a rich presence sink.
//!
//! The sink is optional: when it is not running, the synchronizer reports
//! itself as running with an informational reason and retries later, while
//! the rest of the client carries on without it.
//!
//! # Protocol detection
//!
//! Sinks come in two variants that accept the same commands but differ in
//! their acknowledgements. The primary protocol echoes the accepted activity
//! in the `data` field, compatible shims do not. After every update the
//! acknowledgement is inspected:
//! * no data while assuming the primary protocol: switch to the fallback
//!   variant and resend
//! * data while assuming the fallback variant: switch back and resend
//!
//! A stable sink converges within one extra round trip. The variant is kept
//! across reconnections.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiku::{config::PresenceConfig, events::Component, presence::{IpcSink, Synchronizer}, status::Reporter};
//!
//! # async fn example(song: kiku::song::Song) -> kiku::error::Result<()> {
//! let config = PresenceConfig::default();
//! let sink = IpcSink::new(&config.client_id)?;
//! let presence = Synchronizer::new(config, sink, Reporter::new(Component::Presence, None));
//!
//! tokio::spawn({
//!     let presence = presence.clone();
//!     async move { presence.run().await }
//! });
//!
//! let snapshot = presence.update(&song).await;
//! # Ok(())
//! # }
//! ```

mod sink;
mod snapshot;

pub use sink::{IpcSink, Sink};
pub use snapshot::{sanitize, ActivityKind, Button, PresenceSnapshot, Variant};

#[cfg(test)]
pub(crate) use sink::mock;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::{
    config::PresenceConfig,
    error::{ErrorKind, Result},
    song::Song,
    status::Reporter,
    util,
};

/// Interval at which a connected synchronizer checks its own status.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const REASON_CONNECTED: &str = "connected";
const REASON_NOT_FOUND: &str = "Discord not found";
const REASON_BROKEN_PIPE: &str = "broken pipe";
const REASON_TIMEOUT: &str = "response timeout";

/// Cloneable handle on the presence synchronizer.
pub struct Synchronizer<S: Sink = IpcSink> {
    inner: Arc<Inner<S>>,
}

impl<S: Sink> Clone for Synchronizer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    config: PresenceConfig,
    sink: Arc<Mutex<S>>,

    /// Held for the whole of an update, so updates reach the sink in order.
    state: tokio::sync::Mutex<State>,

    reporter: Reporter,
}

#[derive(Debug, Default)]
struct State {
    variant: Variant,
    connected: bool,
}

impl<S: Sink> Synchronizer<S> {
    #[must_use]
    pub fn new(config: PresenceConfig, sink: S, reporter: Reporter) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink: Arc::new(Mutex::new(sink)),
                state: tokio::sync::Mutex::new(State::default()),
                reporter,
            }),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enable
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.reporter.is_running()
    }

    #[must_use]
    pub fn reporter(&self) -> &Reporter {
        &self.inner.reporter
    }

    /// Protocol variant the sink is currently believed to speak.
    pub async fn variant(&self) -> Variant {
        self.inner.state.lock().await.variant
    }

    /// Keeps the sink connected for as long as the process lives.
    ///
    /// When the sink is not running, the status stays running with an
    /// informational reason and the connection is retried after the
    /// configured delay. Once connected, the status is polled every second
    /// and a failed update triggers a reconnection.
    pub async fn run(&self) {
        let delay = self.inner.config.reconnect_delay;
        loop {
            match self.connect().await {
                Ok(()) => {
                    while self.is_running() {
                        sleep(POLL_INTERVAL).await;
                    }
                    self.disconnect().await;
                }
                Err(e) if e.kind == ErrorKind::Unavailable => {
                    info!("{e}, retrying in {}s", delay.as_secs());
                    self.inner.reporter.update(true, REASON_NOT_FOUND);
                    sleep(delay).await;
                }
                Err(e) => {
                    error!("presence connection failed: {e}");
                    self.inner.reporter.update(false, e.to_string());
                    sleep(delay).await;
                }
            }
        }
    }

    /// Connects to the sink.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the sink is not running, or an error if it
    /// does not respond in time.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.call(S::connect).await?;
        state.connected = true;
        drop(state);

        self.inner.reporter.update(true, REASON_CONNECTED);
        Ok(())
    }

    /// Closes the sink connection, which clears the activity.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.connected = false;
        if let Err(e) = self.call(S::close).await {
            debug!("closing presence connection: {e}");
        }
    }

    /// Mirrors `song` to the sink and returns the snapshot that was shown.
    ///
    /// While the sink is not connected, the snapshot is built but not sent.
    /// Failures do not stop the synchronizer: a broken pipe or a timeout
    /// marks it as not running with a matching reason, after which it
    /// reconnects.
    pub async fn update(&self, song: &Song) -> PresenceSnapshot {
        let now = util::now_from_epoch();
        let mut state = self.inner.state.lock().await;

        loop {
            let snapshot = PresenceSnapshot::build(song, state.variant, &self.inner.config, now);
            if !state.connected {
                return snapshot;
            }

            debug!("updating presence: {snapshot:?}");
            let ack = match self.send(&snapshot).await {
                Ok(ack) => ack,
                Err(e) => {
                    warn!("presence update failed: {e}");
                    let reason = match e.kind {
                        ErrorKind::Aborted => REASON_BROKEN_PIPE.to_owned(),
                        ErrorKind::DeadlineExceeded => REASON_TIMEOUT.to_owned(),
                        _ => e.to_string(),
                    };
                    state.connected = false;
                    self.inner.reporter.update(false, reason);
                    return snapshot;
                }
            };
            trace!("presence acknowledged: {ack}");

            let echoed = ack.get("data").is_some_and(is_truthy);
            state.variant = match (state.variant, echoed) {
                (Variant::Primary, false) => {
                    info!("presence sink does not echo activities, using fallback protocol");
                    Variant::Fallback
                }
                (Variant::Fallback, true) => {
                    info!("presence sink echoes activities, using primary protocol");
                    Variant::Primary
                }
                _ => return snapshot,
            };
        }
    }

    async fn send(&self, snapshot: &PresenceSnapshot) -> Result<Value> {
        let nonce = Uuid::new_v4().to_string();
        let command = snapshot.to_command(std::process::id(), &nonce)?;
        self.call(move |sink| sink.send_command(&command)).await
    }

    /// Runs a blocking sink call on the blocking thread pool, bounded by the
    /// configured timeout.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let sink = Arc::clone(&self.inner.sink);
        let task = tokio::task::spawn_blocking(move || {
            let mut sink = sink.lock()?;
            f(&mut *sink)
        });

        timeout(self.inner.config.timeout, task).await??
    }
}

/// Whether an acknowledgement field carries anything.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::atomic::Ordering};

    use serde_json::json;

    use super::{mock::MockSink, *};
    use crate::{
        events::Component,
        song::Artist,
        status::ConnectionStatus,
    };

    fn song(title: &str) -> Song {
        Song {
            title: Some(title.to_owned()),
            artists: vec![Artist {
                name: Some("B".to_owned()),
                ..Default::default()
            }],
            duration: Some(200),
            ..Default::default()
        }
    }

    fn synchronizer(sink: MockSink, config: PresenceConfig) -> Synchronizer<MockSink> {
        Synchronizer::new(config, sink, Reporter::new(Component::Presence, None))
    }

    #[tokio::test]
    async fn disconnected_update_builds_without_sending() {
        let sink = MockSink::available(true);
        let presence = synchronizer(sink.clone(), PresenceConfig::default());

        let snapshot = presence.update(&song("A")).await;
        assert_eq!(snapshot.details, "A ♪");
        assert!(sink.0.sent().is_empty());
    }

    #[tokio::test]
    async fn ack_without_data_switches_to_fallback_once() {
        let sink = MockSink::available(false);
        let presence = synchronizer(sink.clone(), PresenceConfig::default());
        presence.connect().await.unwrap();
        assert_eq!(
            presence.reporter().status(),
            ConnectionStatus::new(true, REASON_CONNECTED)
        );

        let snapshot = presence.update(&song("A")).await;
        assert_eq!(sink.0.kinds(), vec![0, 2]);
        assert_eq!(snapshot.variant, Variant::Fallback);
        assert_eq!(snapshot.kind, ActivityKind::Listening);
        assert_eq!(presence.variant().await, Variant::Fallback);

        // Converged: the next song is sent once.
        presence.update(&song("C")).await;
        assert_eq!(sink.0.kinds(), vec![0, 2, 2]);
    }

    #[tokio::test]
    async fn ack_with_data_switches_back_to_primary_once() {
        let sink = MockSink::available(false);
        let presence = synchronizer(sink.clone(), PresenceConfig::default());
        presence.connect().await.unwrap();
        presence.update(&song("A")).await;
        assert_eq!(presence.variant().await, Variant::Fallback);

        sink.0.echo.store(true, Ordering::SeqCst);
        let snapshot = presence.update(&song("C")).await;
        assert_eq!(sink.0.kinds(), vec![0, 2, 2, 0]);
        assert_eq!(snapshot.variant, Variant::Primary);
        assert_eq!(snapshot.kind, ActivityKind::Playing);
    }

    #[tokio::test]
    async fn primary_sink_is_sent_once() {
        let sink = MockSink::available(true);
        let presence = synchronizer(sink.clone(), PresenceConfig::default());
        presence.connect().await.unwrap();

        let snapshot = presence.update(&song("A")).await;
        assert_eq!(sink.0.kinds(), vec![0]);
        assert_eq!(snapshot.variant, Variant::Primary);

        let sent = sink.0.sent();
        assert_eq!(sent[0]["args"]["activity"]["state"], json!("B ♪"));
        assert_eq!(sent[0]["args"]["pid"], json!(std::process::id()));
    }

    #[tokio::test]
    async fn broken_pipe_stops_sending() {
        let sink = MockSink::available(true);
        let presence = synchronizer(sink.clone(), PresenceConfig::default());
        presence.connect().await.unwrap();

        *sink.0.fail_with.lock().unwrap() = Some(io::ErrorKind::BrokenPipe);
        presence.update(&song("A")).await;
        assert_eq!(
            presence.reporter().status(),
            ConnectionStatus::new(false, REASON_BROKEN_PIPE)
        );

        // Not connected anymore: built but not sent.
        let snapshot = presence.update(&song("C")).await;
        assert_eq!(snapshot.details, "C ♪");
        assert!(sink.0.sent().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let sink = MockSink::available(true);
        let presence = synchronizer(sink.clone(), PresenceConfig::default());
        presence.connect().await.unwrap();

        *sink.0.fail_with.lock().unwrap() = Some(io::ErrorKind::TimedOut);
        presence.update(&song("A")).await;
        assert_eq!(
            presence.reporter().status(),
            ConnectionStatus::new(false, REASON_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn missing_sink_is_retried_while_running() {
        let sink = MockSink::default();
        let config = PresenceConfig {
            reconnect_delay: Duration::from_millis(20),
            ..PresenceConfig::default()
        };
        let presence = synchronizer(sink.clone(), config);

        let task = tokio::spawn({
            let presence = presence.clone();
            async move { presence.run().await }
        });
        sleep(Duration::from_millis(200)).await;

        assert!(sink.0.connects.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            presence.reporter().status(),
            ConnectionStatus::new(true, REASON_NOT_FOUND)
        );

        // The sink shows up later and gets connected.
        sink.0.available.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(
            presence.reporter().status(),
            ConnectionStatus::new(true, REASON_CONNECTED)
        );

        task.abort();
    }

    #[test]
    fn truthiness_of_ack_data() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!({})));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!({ "details": "A" })));
    }
}

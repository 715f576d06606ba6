//! Event feed client.
//!
//! Keeps exactly one websocket session with the radio's event feed open for
//! as long as the process lives. Frames are dispatched strictly in arrival
//! order:
//!
//! * `hello` (op 0): (re)starts the heartbeat with the announced interval
//!   and marks the feed as running
//! * track update (op 1): builds a new [`NowPlaying`], first mirroring the
//!   song to the presence sink when that is running, and publishes it
//! * heartbeat acknowledgement (op 10): republishes the record with a fresh
//!   heartbeat timestamp
//! * anything else is ignored
//!
//! Sessions that end, cleanly or not, are reopened immediately. Only failed
//! connection attempts wait for the configured delay before retrying.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiku::{config::FeedConfig, events::Component, feed::Client, status::Reporter};
//!
//! # async fn example() {
//! let mut client: Client = Client::new(
//!     FeedConfig::default(),
//!     Reporter::new(Component::Feed, None),
//!     None,
//!     None,
//! );
//! let mut now_playing = client.subscribe();
//! tokio::spawn(async move { client.run().await });
//!
//! while now_playing.changed().await.is_ok() {
//!     if let Some(now_playing) = now_playing.borrow().as_ref() {
//!         println!("{}", now_playing.song);
//!     }
//! }
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    config::FeedConfig,
    error::{Error, Result},
    events,
    now_playing::{NowPlaying, Publisher},
    presence::{IpcSink, Sink, Synchronizer},
    protocol::feed::{Frame, HEARTBEAT},
    status::Reporter,
};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<Stream, Message>>>;

const REASON_CONNECTED: &str = "connected";
const REASON_CLOSED: &str = "connection closed";
const REASON_CLOSED_ERROR: &str = "connection closed (error)";

/// Event feed client, generic over the presence sink it mirrors songs to.
pub struct Client<S: Sink = IpcSink> {
    config: FeedConfig,
    reporter: Reporter,
    publisher: Publisher,
    presence: Option<Synchronizer<S>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl<S: Sink> Client<S> {
    /// Creates a client that is not connected yet.
    ///
    /// Songs are mirrored to `presence` when given, and records are forwarded
    /// to `events` when given.
    #[must_use]
    pub fn new(
        config: FeedConfig,
        reporter: Reporter,
        presence: Option<Synchronizer<S>>,
        events: Option<events::Sender>,
    ) -> Self {
        Self {
            config,
            reporter,
            publisher: Publisher::new(events),
            presence,
            heartbeat: None,
        }
    }

    /// Subscribes to now-playing replacements.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<NowPlaying>>> {
        self.publisher.subscribe()
    }

    /// Runs sessions until the process ends.
    pub async fn run(&mut self) {
        loop {
            let endpoint = self.config.endpoint.as_str();
            debug!("connecting to {endpoint}");

            let stream = match tokio_tungstenite::connect_async(endpoint).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    let delay = self.config.reconnect_delay;
                    error!("error connecting to feed: {e}; retrying in {}s", delay.as_secs());
                    self.reporter.update(false, format!("connection failed: {e}"));
                    sleep(delay).await;
                    continue;
                }
            };

            let result = self.session(stream).await;
            self.stop_heartbeat();

            match result {
                Ok(()) => {
                    info!("feed closed the connection, reconnecting");
                    self.reporter.update(false, REASON_CLOSED);
                }
                Err(e) => {
                    error!("feed connection failed: {e}");
                    self.reporter.update(false, REASON_CLOSED_ERROR);
                }
            }
        }
    }

    async fn session(&mut self, stream: Stream) -> Result<()> {
        let (tx, mut rx) = stream.split();
        let tx = Arc::new(Mutex::new(tx));

        while let Some(message) = rx.next().await {
            match message? {
                Message::Text(text) => self.handle_frame(text.as_str(), &tx).await?,
                Message::Close(frame) => {
                    debug!("connection closed by server: {frame:?}");
                    return Ok(());
                }
                message => trace!("ignoring message: {message:?}"),
            }
        }

        Ok(())
    }

    async fn handle_frame(&mut self, text: &str, tx: &WsSink) -> Result<()> {
        match Frame::parse(text)? {
            Frame::Hello { heartbeat } => {
                let interval = self.config.heartbeat.unwrap_or(heartbeat);
                if interval.is_zero() {
                    return Err(Error::invalid_argument("heartbeat interval is zero"));
                }

                self.start_heartbeat(interval, Arc::clone(tx));
                self.reporter.update(true, REASON_CONNECTED);
            }

            Frame::TrackUpdate(update) => {
                let presence = match &self.presence {
                    Some(presence) if presence.is_enabled() && presence.is_running() => {
                        Some(presence.update(&update.song).await)
                    }
                    _ => None,
                };

                let now_playing = NowPlaying::new(*update, presence);
                debug!("now playing: {}", now_playing.song);
                self.publisher.publish(now_playing);
            }

            Frame::HeartbeatAck => {
                trace!("heartbeat acknowledged");
                self.publisher.heartbeat();
            }

            Frame::Unknown { op, event } => {
                trace!("ignoring op {op} ({event:?})");
            }
        }

        Ok(())
    }

    /// Starts sending heartbeats, replacing any running heartbeat.
    ///
    /// The task ends by itself once a send fails, and is aborted when the
    /// session ends.
    fn start_heartbeat(&mut self, interval: Duration, tx: WsSink) {
        self.stop_heartbeat();
        debug!("sending heartbeats every {:.1}s", interval.as_secs_f32());

        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                trace!("sending heartbeat");
                if let Err(e) = tx.lock().await.send(Message::text(HEARTBEAT)).await {
                    debug!("heartbeat stopped: {e}");
                    break;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl<S: Sink> Drop for Client<S> {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

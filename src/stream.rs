//! Audio engine for a single live HTTP stream.
//!
//! The stream is downloaded into bounded memory storage, decoded by
//! Symphonia and rendered through rodio. The rodio output stream cannot be
//! sent across threads, so a dedicated thread opens it and keeps it alive
//! for as long as the engine exists; everything else only needs its handle.
//!
//! Loading a stream happens on the tokio runtime and never blocks the
//! caller. Failures while loading are logged and leave the engine idle,
//! which is what the watchdog looks for.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle};
use stream_download::{
    http::HttpStream,
    storage::{bounded::BoundedStorageProvider, memory::MemoryStorageProvider},
    StreamDownload, StreamState,
};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use url::Url;

use crate::{
    audio_file::AudioFile,
    decoder::Decoder,
    engine::{CacheState, Engine, Tags},
    error::{Error, Result},
    util::ToF32,
};

/// Memory kept of the stream ahead of and behind the playback position.
pub const STORAGE_LEN: usize = 4 * 1024 * 1024;

/// Bytes to download before decoding starts.
pub const PREFETCH_BYTES: u64 = 64 * 1024;

/// Time without a decoded packet after which the engine counts as idle.
pub const IDLE_AFTER: Duration = Duration::from_secs(1);

/// Buffered audio below which the cache counts as low.
pub const LOW_CACHE: Duration = Duration::from_secs(1);

/// Progress of one stream session, shared between the download, the
/// decoder and the engine.
#[derive(Debug, Default)]
pub struct Stats {
    /// Bytes downloaded so far.
    pub(crate) downloaded: AtomicU64,

    /// Bytes handed to the decoder so far.
    pub(crate) consumed: Arc<AtomicU64>,

    /// Pending skip request in microseconds.
    pub(crate) skip: AtomicU64,

    /// Audio decoded so far in microseconds, skipped samples included.
    pub(crate) decoded: AtomicU64,

    /// When the latest packet was decoded.
    last_packet: Mutex<Option<Instant>>,
}

impl Stats {
    /// Records a decoded packet holding `duration` of audio.
    pub fn packet_decoded(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.decoded.fetch_add(micros, Ordering::Relaxed);
        *self
            .last_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn is_stalled(&self, now: Instant) -> bool {
        self.last_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|last| now.saturating_duration_since(last) > IDLE_AFTER)
    }

    fn cache_state(&self) -> Option<CacheState> {
        cache_state(
            self.downloaded.load(Ordering::Relaxed),
            self.consumed.load(Ordering::Relaxed),
            Duration::from_micros(self.decoded.load(Ordering::Relaxed)),
        )
    }
}

/// Estimates buffered audio from byte counters and the duration of the
/// audio those bytes decoded to.
///
/// Time spent paused does not decode anything, so it leaves the estimate
/// unchanged. Returns `None` until enough has been decoded to estimate the
/// bitrate.
fn cache_state(downloaded: u64, consumed: u64, decoded: Duration) -> Option<CacheState> {
    if consumed == 0 || decoded < Duration::from_secs(1) {
        return None;
    }

    let rate = consumed.to_f32_lossy() / decoded.as_secs_f32();
    let ahead = downloaded.saturating_sub(consumed).to_f32_lossy();
    let buffered = Duration::from_secs_f32(ahead / rate);

    Some(CacheState {
        buffered,
        low: buffered < LOW_CACHE,
    })
}

/// Keeps the rodio output stream alive on its own thread.
struct Output {
    handle: OutputStreamHandle,
    stop: mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Output {
    fn open(device: Option<String>) -> Result<Self> {
        let (handle_tx, handle_rx) = mpsc::sync_channel(1);
        let (stop, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("audio-output".to_owned())
            .spawn(move || match open_device(device.as_deref()) {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Returns when the engine drops the sender.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("audio output closed");
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(e));
                }
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::internal("audio output thread exited"))??;

        Ok(Self {
            handle,
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_device(name: Option<&str>) -> Result<(OutputStream, OutputStreamHandle)> {
    let Some(name) = name else {
        return Ok(OutputStream::try_default()?);
    };

    let device = cpal::default_host()
        .output_devices()?
        .find(|device| device.name().is_ok_and(|device| device == name))
        .ok_or_else(|| Error::not_found(format!("audio device {name} not found")))?;
    info!("using audio device {name}");

    Ok(OutputStream::try_from_device(&device)?)
}

/// Lists the names of the available output devices.
///
/// # Errors
///
/// Returns an error if the audio host cannot enumerate its devices.
pub fn devices() -> Result<Vec<String>> {
    let devices = cpal::default_host()
        .output_devices()?
        .filter_map(|device| device.name().ok())
        .collect();
    Ok(devices)
}

struct Session {
    sink: Arc<rodio::Sink>,
    stats: Arc<Stats>,
    loader: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.loader.abort();
        self.sink.stop();
    }
}

/// [`Engine`] playing one HTTP stream at a time on a local output device.
pub struct StreamEngine {
    output: Output,
    runtime: Handle,
    client: reqwest::Client,

    session: Mutex<Option<Session>>,

    paused: AtomicBool,
    volume: AtomicU8,
    output_volume: AtomicU8,

    playing: Arc<watch::Sender<bool>>,
    tags: Arc<watch::Sender<Tags>>,
}

impl StreamEngine {
    /// Opens the audio output and returns an engine that is not playing.
    ///
    /// Uses the default output device unless `device` names another one.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no runtime, if the device is not found,
    /// or if the audio output cannot be opened.
    pub fn new(device: Option<String>, volume: u8) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::internal(e.to_string()))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal(e.to_string()))?;

        Ok(Self {
            output: Output::open(device)?,
            runtime,
            client,
            session: Mutex::new(None),
            paused: AtomicBool::new(false),
            volume: AtomicU8::new(volume),
            output_volume: AtomicU8::new(100),
            playing: Arc::new(watch::Sender::new(false)),
            tags: Arc::new(watch::Sender::new(Tags::new())),
        })
    }

    /// Effective sink volume as a factor.
    fn gain(&self) -> f32 {
        let volume = f32::from(self.volume.load(Ordering::Relaxed));
        let output = f32::from(self.output_volume.load(Ordering::Relaxed));
        volume * output / 10_000.0
    }

    fn apply_volume(&self) {
        if let Some(session) = &*self.lock() {
            session.sink.set_volume(self.gain());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for StreamEngine {
    fn play(&self, url: &Url) -> Result<()> {
        // Drop the old session before opening another connection.
        self.lock().take();

        let sink = Arc::new(rodio::Sink::try_new(&self.output.handle)?);
        sink.set_volume(self.gain());
        if self.paused.load(Ordering::Relaxed) {
            sink.pause();
        }

        self.playing.send_replace(false);
        self.tags.send_replace(Tags::new());

        let stats = Arc::new(Stats::default());
        let loader = self.runtime.spawn(load(
            self.client.clone(),
            url.clone(),
            Arc::clone(&sink),
            Arc::clone(&stats),
            Arc::clone(&self.playing),
            Arc::clone(&self.tags),
        ));

        info!("playing {url}");
        *self.lock() = Some(Session {
            sink,
            stats,
            loader,
        });

        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        if let Some(session) = &*self.lock() {
            session.sink.pause();
        }
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        if let Some(session) = &*self.lock() {
            session.sink.play();
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn is_idle(&self) -> bool {
        self.lock().as_ref().is_none_or(|session| {
            session.sink.empty() || session.stats.is_stalled(Instant::now())
        })
    }

    fn seek(&self, offset: Duration) -> Result<()> {
        let session = self.lock();
        let session = session
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("nothing is playing"))?;

        let micros = u64::try_from(offset.as_micros()).unwrap_or(u64::MAX);
        session.stats.skip.fetch_add(micros, Ordering::Relaxed);
        debug!("skipping {}s ahead", offset.as_secs_f32());

        Ok(())
    }

    fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn set_volume(&self, volume: u8) {
        self.volume.store(volume, Ordering::Relaxed);
        self.apply_volume();
    }

    fn output_volume(&self) -> u8 {
        self.output_volume.load(Ordering::Relaxed)
    }

    fn set_output_volume(&self, volume: u8) {
        self.output_volume.store(volume, Ordering::Relaxed);
        self.apply_volume();
    }

    fn cache_state(&self) -> Option<CacheState> {
        self.lock()
            .as_ref()
            .and_then(|session| session.stats.cache_state())
    }

    fn playing(&self) -> watch::Receiver<bool> {
        self.playing.subscribe()
    }

    fn tags(&self) -> watch::Receiver<Tags> {
        self.tags.subscribe()
    }
}

/// Downloads `url` and appends a decoder for it to `sink`.
async fn load(
    client: reqwest::Client,
    url: Url,
    sink: Arc<rodio::Sink>,
    stats: Arc<Stats>,
    playing: Arc<watch::Sender<bool>>,
    tags: Arc<watch::Sender<Tags>>,
) {
    if let Err(e) = try_load(client, url, sink, stats, playing, tags).await {
        error!("failed to load stream: {e}");
    }
}

async fn try_load(
    client: reqwest::Client,
    url: Url,
    sink: Arc<rodio::Sink>,
    stats: Arc<Stats>,
    playing: Arc<watch::Sender<bool>>,
    tags: Arc<watch::Sender<Tags>>,
) -> Result<()> {
    let stream = HttpStream::new(client, url).await?;
    debug!("connected to stream");

    let progress = Arc::clone(&stats);
    let callback = move |_: &HttpStream<_>, state: StreamState, _: &_| {
        progress
            .downloaded
            .store(state.current_position, Ordering::Relaxed);
    };

    let storage = BoundedStorageProvider::new(
        MemoryStorageProvider::default(),
        NonZeroUsize::new(STORAGE_LEN).ok_or_else(|| Error::internal("zero storage length"))?,
    );
    let download = StreamDownload::from_stream(
        stream,
        storage,
        stream_download::Settings::default()
            .on_progress(callback)
            .prefetch_bytes(PREFETCH_BYTES),
    )
    .await?;

    // Probing reads from the download, which blocks.
    let decoder = tokio::task::spawn_blocking(move || {
        let file = AudioFile::from_download(download, Arc::clone(&stats.consumed));
        Decoder::new(file, stats, playing, tags)
    })
    .await??;

    sink.append(decoder);
    Ok(())
}

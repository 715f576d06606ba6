use std::{error::Error, ops::ControlFlow, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};

use kiku::{
    config::Config,
    engine::Engine,
    events::{self, Component, Event},
    feed,
    now_playing::NowPlaying,
    persist::Store,
    player::Player,
    presence::{IpcSink, Synchronizer},
    signal,
    status::Reporter,
    stream::{self, StreamEngine},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Created with default settings when it does not exist.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("config.toml"))]
    config: String,

    /// State file
    ///
    /// Keeps the last volume across restarts.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("state.toml"))]
    state: String,

    /// Audio output device
    ///
    /// Specify "?" to list the available devices.
    ///
    /// [default: system default device]
    #[arg(short, long, env = "KIKU_DEVICE")]
    device: Option<String>,

    /// Disable rich presence, whatever the configuration says.
    #[arg(long, default_value_t = false)]
    no_presence: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive, so this arm means quiet.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Logs events. This is the whole presentation layer of the binary.
#[derive(Debug, Default)]
struct Presenter {
    /// Record shown last, to tell heartbeats apart from new songs.
    now_playing: Option<Arc<NowPlaying>>,
}

impl Presenter {
    fn present(&mut self, event: &Event) {
        match event {
            Event::Status { component, status } => info!("{component}: {status}"),
            Event::NowPlaying(now_playing) => self.present_now_playing(now_playing),
            Event::StreamMetadata(song) => debug!("stream metadata: {song}"),
        }
    }

    /// Whether `now_playing` only refreshes the heartbeat of the record shown
    /// last.
    fn is_heartbeat(&self, now_playing: &NowPlaying) -> bool {
        self.now_playing
            .as_ref()
            .is_some_and(|last| now_playing.with_heartbeat(last.last_heartbeat) == **last)
    }

    fn present_now_playing(&mut self, now_playing: &Arc<NowPlaying>) {
        if self.is_heartbeat(now_playing) {
            debug!("feed alive at {:.0}", now_playing.last_heartbeat);
        } else {
            let song = &now_playing.song;
            let mut line = format!("now playing: {song}");
            if let Some(albums) = song.albums_to_string() {
                line.push_str(&format!(" [{albums}]"));
            }
            if let Some(requester) = &now_playing.requester {
                line.push_str(&format!(", requested by {}", requester.display_name));
            }
            if let Some(name) = now_playing.event.as_ref().and_then(|event| event.name.as_ref()) {
                line.push_str(&format!(", {name}"));
            }
            line.push_str(&format!(" ({} listeners)", now_playing.listeners));
            info!("{line}");
        }

        self.now_playing = Some(Arc::clone(now_playing));
    }
}

/// Handles a line read from standard input.
fn command<E: Engine>(player: &Player<E>, line: &str) -> ControlFlow<()> {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (Some("p"), None) => player.toggle(),
        (Some("+"), None) => player.raise_volume().map(|volume| info!("volume: {volume}%")),
        (Some("-"), None) => player.lower_volume().map(|volume| info!("volume: {volume}%")),
        (Some("v"), Some(volume)) => match volume.parse() {
            Ok(volume) => player.set_volume(volume).map(|volume| info!("volume: {volume}%")),
            Err(e) => {
                warn!("invalid volume {volume}: {e}");
                Ok(())
            }
        },
        (Some("o"), Some(volume)) => {
            match volume.parse() {
                Ok(volume) => info!("output volume: {}%", player.set_output_volume(volume)),
                Err(e) => warn!("invalid volume {volume}: {e}"),
            }
            Ok(())
        }
        (Some("r"), None) => player.restart(),
        (Some("s"), None) => player.seek_to_end(),
        (Some("q"), None) => return ControlFlow::Break(()),
        (None, _) => Ok(()),
        _ => {
            info!("commands: p (play/pause), + / - (volume), v N (volume), o N (output volume), r (restart), s (live), q (quit)");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e}");
    }
    ControlFlow::Continue(())
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error when the configuration, the state file or the audio
/// output cannot be set up, or when signal handlers cannot be registered.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.device.as_deref() == Some("?") {
        for device in stream::devices()? {
            println!("{device}");
        }
        return Ok(());
    }

    let config = Config::from_file(&args.config)?;
    let store = Arc::new(Store::open(&args.state, config.player.default_volume)?);
    let (events, mut rx) = events::channel();

    let presence = if config.presence.enable && !args.no_presence {
        match IpcSink::new(&config.presence.client_id) {
            Ok(sink) => Some(Synchronizer::new(
                config.presence.clone(),
                sink,
                Reporter::new(Component::Presence, Some(events.clone())),
            )),
            Err(e) => {
                warn!("presence disabled: {e}");
                None
            }
        }
    } else {
        info!("presence disabled");
        None
    };

    let engine = Arc::new(StreamEngine::new(args.device, store.last_volume()?)?);
    let player = Arc::new(Player::new(
        engine,
        config.player.clone(),
        Some(store),
        Reporter::new(Component::Stream, Some(events.clone())),
        Some(events.clone()),
    ));

    let mut feed = feed::Client::new(
        config.feed.clone(),
        Reporter::new(Component::Feed, Some(events.clone())),
        presence.clone(),
        Some(events),
    );

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(async move { feed.run().await });
    tasks.spawn({
        let player = Arc::clone(&player);
        async move { player.run().await }
    });
    if let Some(presence) = presence.clone() {
        tasks.spawn(async move { presence.run().await });
    }

    let mut signals = signal::Handler::new()?;
    let mut presenter = Presenter::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut interactive = true;

    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break;
                }
                info!("received {signal}, restarting stream");
                if let Err(e) = player.restart() {
                    error!("{e}");
                }
            }

            Some(event) = rx.recv() => presenter.present(&event),

            line = stdin.next_line(), if interactive => match line {
                Ok(Some(line)) => {
                    if command(&player, line.trim()).is_break() {
                        info!("shutting down");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("standard input closed");
                    interactive = false;
                }
                Err(e) => {
                    warn!("cannot read standard input: {e}");
                    interactive = false;
                }
            },
        }
    }

    tasks.shutdown().await;
    if let Some(presence) = presence {
        presence.disconnect().await;
    }

    Ok(())
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use kiku::protocol::feed::TrackUpdate;
    use serde_json::json;

    use super::*;

    fn now_playing(title: &str) -> Arc<NowPlaying> {
        let update: TrackUpdate = serde_json::from_value(json!({
            "song": { "id": 1, "title": title, "duration": 200 },
            "startTime": "2024-01-01T00:00:00.000Z",
            "listeners": 10
        }))
        .unwrap();
        Arc::new(NowPlaying::new(update, None))
    }

    #[test]
    fn heartbeats_are_not_new_songs() {
        let mut presenter = Presenter::default();
        let first = now_playing("A");
        assert!(!presenter.is_heartbeat(&first));

        presenter.present(&Event::NowPlaying(Arc::clone(&first)));
        let ack = first.with_heartbeat(first.last_heartbeat + 35.0);
        assert!(presenter.is_heartbeat(&ack));
        assert!(!presenter.is_heartbeat(&now_playing("B")));

        presenter.present(&Event::NowPlaying(Arc::new(ack)));
        assert!(presenter.is_heartbeat(&first));
    }
}

//! Headless companion for an internet radio station.
//!
//! Three components run side by side, each on its own task:
//! * [`feed::Client`] keeps a websocket session to the station's event feed
//!   and publishes what is playing now,
//! * [`player::Player`] plays the audio stream and restarts it when it
//!   stalls,
//! * [`presence::Synchronizer`] mirrors the current song to a rich presence
//!   sink, detecting which protocol variant the sink speaks.
//!
//! Components report to the presentation layer through [`events`] only.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod audio_file;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod now_playing;
pub mod persist;
pub mod player;
pub mod presence;
pub mod protocol;
pub mod signal;
pub mod song;
pub mod status;
pub mod stream;
pub mod util;

//! Live stream decoder using Symphonia.
//!
//! The decoder probes the stream format, then feeds decoded samples to
//! rodio. While doing so it reports back to the engine:
//! * that audio is being rendered, on the first decoded packet,
//! * when the last packet was decoded and how much audio it held, for
//!   stall detection and cache estimation,
//! * metadata tags, whenever the stream carries a new revision.
//!
//! Live streams cannot seek. Skipping ahead is done by dropping decoded
//! samples, which drains the download cache faster than real time.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::{MetadataOptions, MetadataRevision, StandardTagKey},
    probe::Hint,
};
use tokio::sync::watch;

use crate::{
    audio_file::{AudioFile, BUFFER_LEN},
    engine::Tags,
    error::{Error, Result},
    stream::Stats,
};

/// Sample rate to assume when the codec does not tell.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Maximum number of consecutive corrupted packets to skip before giving up.
const MAX_RETRIES: usize = 3;

pub struct Decoder {
    demuxer: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,

    buffer: Option<SampleBuffer<f32>>,
    position: usize,

    channels: u16,
    sample_rate: u32,

    /// Samples still to drop before rendering resumes.
    skip: u64,

    stats: Arc<Stats>,
    playing: Arc<watch::Sender<bool>>,
    tags: Arc<watch::Sender<Tags>>,
}

impl Decoder {
    /// Probes `file` and sets up a decoder for its default track.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is not recognized, or if the stream
    /// has no track with a supported codec.
    pub fn new(
        file: AudioFile,
        stats: Arc<Stats>,
        playing: Arc<watch::Sender<bool>>,
        tags: Arc<watch::Sender<Tags>>,
    ) -> Result<Self> {
        // Symphonia asserts a 64 KiB minimum for its ring buffer.
        let buffer_len = usize::max(64 * 1024, BUFFER_LEN * 2);
        let stream =
            MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions { buffer_len });

        let mut probed = symphonia::default::get_probe().format(
            &Hint::new(),
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let demuxer = probed.format;
        let default_track = demuxer
            .default_track()
            .ok_or(Error::not_found("default track not found"))?;
        let decoder = symphonia::default::get_codecs()
            .make(&default_track.codec_params, &DecoderOptions::default())?;

        let codec_params = decoder.codec_params();
        let sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = codec_params.channels.map_or(2, |channels| {
            u16::try_from(channels.count()).unwrap_or(u16::MAX)
        });
        debug!("decoding {channels} channels at {sample_rate} Hz");

        // Tags found outside the container, like leading ID3 frames.
        let initial = probed
            .metadata
            .get()
            .and_then(|metadata| metadata.current().map(tags_from_revision));

        let mut decoder = Self {
            demuxer,
            decoder,
            buffer: None,
            position: 0,
            channels,
            sample_rate,
            skip: 0,
            stats,
            playing,
            tags,
        };

        if let Some(tags) = initial {
            decoder.send_tags(tags);
        }
        decoder.update_tags();

        Ok(decoder)
    }

    /// Publishes the latest metadata revision of the container, if new.
    fn update_tags(&mut self) {
        let mut metadata = self.demuxer.metadata();
        if metadata.is_latest() {
            return;
        }
        if let Some(revision) = metadata.skip_to_latest() {
            let tags = tags_from_revision(revision);
            self.send_tags(tags);
        }
    }

    fn send_tags(&self, tags: Tags) {
        if tags.is_empty() {
            return;
        }
        self.tags.send_if_modified(|current| {
            if *current == tags {
                false
            } else {
                trace!("stream tags: {tags:?}");
                *current = tags;
                true
            }
        });
    }

    /// Converts a pending skip request into a number of samples to drop.
    fn take_skip(&mut self) {
        let micros = self.stats.skip.swap(0, Ordering::Relaxed);
        if micros > 0 {
            let samples = Duration::from_micros(micros).as_secs_f64()
                * f64::from(self.sample_rate)
                * f64::from(self.channels);
            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let samples = samples as u64;
            debug!("skipping {samples} samples");
            self.skip = self.skip.saturating_add(samples);
        }
    }

    /// Decodes the next packet into the sample buffer.
    ///
    /// Returns `false` at the end of the stream or on an unrecoverable error.
    fn refill(&mut self) -> bool {
        let mut skipped = 0;
        loop {
            if skipped > MAX_RETRIES {
                error!("skipped too many packets, giving up");
                return false;
            }

            match self.demuxer.next_packet() {
                Ok(packet) => {
                    let decoded = match self.decoder.decode(&packet) {
                        Ok(decoded) => decoded,
                        Err(SymphoniaError::DecodeError(e)) => {
                            warn!("skipping malformed packet: {e}");
                            skipped += 1;
                            continue;
                        }
                        Err(e) => {
                            error!("{e}");
                            return false;
                        }
                    };

                    let spec = *decoded.spec();
                    #[expect(clippy::cast_precision_loss)]
                    let duration = Duration::from_secs_f64(
                        decoded.frames() as f64 / f64::from(spec.rate.max(1)),
                    );

                    let buffer = match self.buffer.as_mut() {
                        Some(buffer) => buffer,
                        // Sized for the largest packet the codec produces.
                        None => self.buffer.insert(SampleBuffer::new(
                            decoded.capacity() as u64,
                            spec,
                        )),
                    };
                    buffer.copy_interleaved_ref(decoded);
                    self.position = 0;

                    self.stats.packet_decoded(duration);
                    self.playing.send_if_modified(|playing| !std::mem::replace(playing, true));
                    self.update_tags();

                    return true;
                }

                Err(SymphoniaError::IoError(e)) => {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!("end of stream");
                    } else {
                        error!("{e}");
                    }
                    return false;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                }
                Err(e) => {
                    error!("{e}");
                    return false;
                }
            }
        }
    }

    fn next_sample(&mut self) -> Option<f32> {
        if self
            .buffer
            .as_ref()
            .is_none_or(|buffer| self.position >= buffer.len())
            && !self.refill()
        {
            return None;
        }

        let sample = *self
            .buffer
            .as_ref()
            .and_then(|buffer| buffer.samples().get(self.position))?;
        self.position += 1;

        Some(sample)
    }
}

/// Maps a metadata revision to tags keyed by lower-case name.
///
/// Title, artist and album are always stored under those names, whatever
/// the container calls them.
#[must_use]
pub fn tags_from_revision(revision: &MetadataRevision) -> Tags {
    revision
        .tags()
        .iter()
        .map(|tag| {
            let key = match tag.std_key {
                Some(StandardTagKey::TrackTitle) => "title".to_owned(),
                Some(StandardTagKey::Artist) => "artist".to_owned(),
                Some(StandardTagKey::Album) => "album".to_owned(),
                _ => tag.key.to_lowercase(),
            };
            (key, tag.value.to_string())
        })
        .collect()
}

impl rodio::Source for Decoder {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.buffer.as_ref().map(SampleBuffer::len)
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Iterator for Decoder {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        self.take_skip();
        while self.skip > 0 {
            self.next_sample()?;
            self.skip -= 1;
        }

        self.next_sample()
    }
}

#[cfg(test)]
mod tests {
    use symphonia::core::meta::{MetadataBuilder, Tag, Value};

    use super::*;

    #[test]
    fn maps_standard_keys() {
        let mut builder = MetadataBuilder::new();
        builder.add_tag(Tag::new(
            Some(StandardTagKey::TrackTitle),
            "TITLE",
            Value::String("Song".to_owned()),
        ));
        builder.add_tag(Tag::new(
            Some(StandardTagKey::Artist),
            "TPE1",
            Value::String("Artist".to_owned()),
        ));
        builder.add_tag(Tag::new(None, "ENCODER", Value::String("x".to_owned())));

        let tags = tags_from_revision(&builder.metadata());
        assert_eq!(tags.get("title").map(String::as_str), Some("Song"));
        assert_eq!(tags.get("artist").map(String::as_str), Some("Artist"));
        assert_eq!(tags.get("encoder").map(String::as_str), Some("x"));
        assert_eq!(tags.len(), 3);
    }
}

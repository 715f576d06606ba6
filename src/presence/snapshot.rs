//! Presence snapshots and their wire format.
//!
//! A [`PresenceSnapshot`] is always built in full from a [`Song`]. Sinks
//! replace the displayed activity atomically, so patching single fields of a
//! previous snapshot could show a mix of two songs.

use serde::Serialize;
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{config::PresenceConfig, error::Result, song::Song};

/// Free-text fields shorter than this are padded with the placeholder.
pub const MIN_TEXT_LEN: usize = 2;

/// Free-text fields of this length or longer are truncated.
pub const MAX_TEXT_LEN: usize = 128;

const ELLIPSIS: &str = "...";

/// Protocol spoken by the presence sink.
///
/// The primary protocol echoes the accepted activity in the `data` field of
/// its acknowledgement. Compatible shims do not, and expect the activity to
/// be announced as listening rather than playing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Variant {
    #[default]
    Primary,
    Fallback,
}

impl Variant {
    #[must_use]
    pub fn activity_kind(self) -> ActivityKind {
        match self {
            Self::Primary => ActivityKind::Playing,
            Self::Fallback => ActivityKind::Listening,
        }
    }
}

/// Activity type as understood by the sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ActivityKind {
    Playing = 0,
    Listening = 2,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PresenceSnapshot {
    pub variant: Variant,
    pub details: String,
    pub state: String,

    /// Epoch seconds at which the song ends, if its length is known.
    pub end: Option<i64>,

    pub large_image: Option<String>,
    pub large_text: String,
    pub small_image: Option<String>,
    pub small_text: String,
    pub buttons: Vec<Button>,
    pub kind: ActivityKind,
}

/// Makes free text acceptable to the sink.
///
/// Text is trimmed first. Text shorter than two characters gets the
/// placeholder appended and is trimmed again. Text of 128 characters or more
/// is cut to 125 characters followed by `...`.
#[must_use]
pub fn sanitize(text: &str, placeholder: &str) -> String {
    let text = text.trim();
    let len = text.chars().count();

    if len < MIN_TEXT_LEN {
        format!("{text}{placeholder}").trim().to_owned()
    } else if len >= MAX_TEXT_LEN {
        let mut truncated: String = text
            .chars()
            .take(MAX_TEXT_LEN - ELLIPSIS.len())
            .collect();
        truncated.push_str(ELLIPSIS);
        truncated
    } else {
        text.to_owned()
    }
}

impl PresenceSnapshot {
    /// Builds the snapshot of `song` for a sink speaking `variant`.
    ///
    /// `now` is the current time in epoch seconds.
    #[must_use]
    pub fn build(song: &Song, variant: Variant, config: &PresenceConfig, now: f64) -> Self {
        let clean = |text: &str| sanitize(text, &config.placeholder);
        let artists = song.artists_to_string().unwrap_or_default();

        Self {
            variant,
            details: clean(song.title()),
            state: clean(&artists),
            end: end_timestamp(song, now),
            large_image: large_image(song, variant, config),
            large_text: large_text(song, &config.placeholder),
            small_image: song.artist_image(),
            small_text: clean(&artists),
            buttons: vec![Button {
                label: config.button_label.clone(),
                url: config.button_url.clone(),
            }],
            kind: variant.activity_kind(),
        }
    }

    /// Maps the snapshot onto a `SET_ACTIVITY` command.
    ///
    /// The small image is left out when it equals the large image, and
    /// absent fields are left out entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be serialized.
    pub fn to_command(&self, pid: u32, nonce: &str) -> Result<Value> {
        let small_image = self
            .small_image
            .as_deref()
            .filter(|small| self.large_image.as_deref() != Some(*small));

        let command = Command {
            cmd: "SET_ACTIVITY",
            args: Args {
                pid,
                activity: Activity {
                    details: &self.details,
                    state: &self.state,
                    timestamps: self.end.map(|end| Timestamps { end }),
                    assets: Assets {
                        large_image: self.large_image.as_deref(),
                        large_text: &self.large_text,
                        small_image,
                        small_text: &self.small_text,
                    },
                    buttons: &self.buttons,
                    kind: self.kind,
                    instance: true,
                },
            },
            nonce,
        };

        Ok(serde_json::to_value(command)?)
    }
}

fn end_timestamp(song: &Song, now: f64) -> Option<i64> {
    song.duration().map(|duration| {
        // Epoch seconds stay far below the precision limit of an `f64`.
        #[expect(clippy::cast_possible_truncation)]
        let end = (now + duration.as_secs_f64()).round() as i64;
        end
    })
}

fn large_image(song: &Song, variant: Variant, config: &PresenceConfig) -> Option<String> {
    song.album_image()
        .or_else(|| config.use_artist.then(|| song.artist_image()).flatten())
        .or_else(|| {
            config.use_fallback.then(|| match variant {
                Variant::Primary => config.fallback_image.clone(),
                Variant::Fallback => config.fallback_image_url.clone(),
            })
        })
}

fn large_text(song: &Song, placeholder: &str) -> String {
    let mut text = String::new();
    if let Some(sources) = song.sources_to_string() {
        text.push('[');
        text.push_str(&sources);
        text.push_str("] ");
    }
    if let Some(albums) = song.albums_to_string() {
        text.push_str(&albums);
    }

    if text.is_empty() {
        sanitize(song.title(), placeholder)
    } else {
        sanitize(&text, placeholder)
    }
}

#[derive(Serialize)]
struct Command<'a> {
    cmd: &'static str,
    args: Args<'a>,
    nonce: &'a str,
}

#[derive(Serialize)]
struct Args<'a> {
    pid: u32,
    activity: Activity<'a>,
}

#[derive(Serialize)]
struct Activity<'a> {
    details: &'a str,
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamps: Option<Timestamps>,
    assets: Assets<'a>,
    buttons: &'a [Button],
    #[serde(rename = "type")]
    kind: ActivityKind,
    instance: bool,
}

#[derive(Serialize)]
struct Timestamps {
    end: i64,
}

#[derive(Serialize)]
struct Assets<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    large_image: Option<&'a str>,
    large_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    small_image: Option<&'a str>,
    small_text: &'a str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::song::{Album, Artist, Source};

    const PLACEHOLDER: &str = " ♪";

    fn song() -> Song {
        Song {
            id: 1,
            title: Some("A".to_owned()),
            artists: vec![Artist {
                name: Some("B".to_owned()),
                image: Some("b.jpg".to_owned()),
                ..Default::default()
            }],
            duration: Some(200),
            ..Default::default()
        }
    }

    #[test]
    fn short_text_gets_placeholder() {
        assert_eq!(sanitize("A", PLACEHOLDER), "A ♪");
        assert_eq!(sanitize("", PLACEHOLDER), "♪");
        assert_eq!(sanitize("  x  ", PLACEHOLDER), "x ♪");
        assert!(sanitize("B", PLACEHOLDER).ends_with(PLACEHOLDER.trim()));
    }

    #[test]
    fn long_text_is_truncated() {
        for len in [128, 129, 500] {
            let text = "ア".repeat(len);
            let clean = sanitize(&text, PLACEHOLDER);
            assert_eq!(clean.chars().count(), MAX_TEXT_LEN);
            assert!(clean.ends_with("..."));
        }
        let text = "x".repeat(127);
        assert_eq!(sanitize(&text, PLACEHOLDER), text);
    }

    #[test]
    fn sanitize_is_idempotent_within_bounds() {
        for text in ["ab", "  padded title  ", "A ♪", &"y".repeat(127)] {
            let once = sanitize(text, PLACEHOLDER);
            assert_eq!(sanitize(&once, PLACEHOLDER), once);
            assert_eq!(once, text.trim());
        }
    }

    #[test]
    fn builds_snapshot_for_song() {
        let config = PresenceConfig::default();
        let now = 1_700_000_000.4;
        let snapshot = PresenceSnapshot::build(&song(), Variant::Primary, &config, now);

        assert_eq!(snapshot.details, "A ♪");
        assert_eq!(snapshot.state, "B ♪");
        assert_eq!(snapshot.small_text, "B ♪");
        assert_eq!(snapshot.end, Some(1_700_000_200));
        assert_eq!(snapshot.kind, ActivityKind::Playing);
        assert_eq!(
            snapshot.large_image.as_deref(),
            Some("https://cdn.listen.moe/artists/b.jpg")
        );
        assert_eq!(snapshot.large_text, "A ♪");
        assert_eq!(snapshot.buttons.len(), 1);
    }

    #[test]
    fn unknown_duration_has_no_end() {
        let mut song = song();
        song.duration = None;
        let snapshot =
            PresenceSnapshot::build(&song, Variant::Primary, &PresenceConfig::default(), 0.0);
        assert_eq!(snapshot.end, None);
    }

    #[test]
    fn large_text_lists_sources_then_albums() {
        let mut song = song();
        song.sources = vec![Source {
            name: Some("Show".to_owned()),
            ..Default::default()
        }];
        song.albums = vec![Album {
            name: Some("OST".to_owned()),
            image: Some("ost.png".to_owned()),
            ..Default::default()
        }];

        let snapshot =
            PresenceSnapshot::build(&song, Variant::Primary, &PresenceConfig::default(), 0.0);
        assert_eq!(snapshot.large_text, "[Show] OST");
        assert_eq!(
            snapshot.large_image.as_deref(),
            Some("https://cdn.listen.moe/covers/ost.png")
        );
    }

    #[test]
    fn fallback_image_depends_on_variant() {
        let mut song = song();
        song.artists[0].image = None;
        let config = PresenceConfig::default();

        let primary = PresenceSnapshot::build(&song, Variant::Primary, &config, 0.0);
        assert_eq!(primary.large_image, Some(config.fallback_image.clone()));

        let fallback = PresenceSnapshot::build(&song, Variant::Fallback, &config, 0.0);
        assert_eq!(fallback.large_image, Some(config.fallback_image_url.clone()));
        assert_eq!(fallback.kind, ActivityKind::Listening);

        let config = PresenceConfig {
            use_fallback: false,
            ..PresenceConfig::default()
        };
        let none = PresenceSnapshot::build(&song, Variant::Primary, &config, 0.0);
        assert_eq!(none.large_image, None);
    }

    #[test]
    fn artist_image_fallback_can_be_disabled() {
        let config = PresenceConfig {
            use_artist: false,
            use_fallback: false,
            ..PresenceConfig::default()
        };
        let snapshot = PresenceSnapshot::build(&song(), Variant::Primary, &config, 0.0);
        assert_eq!(snapshot.large_image, None);
        assert!(snapshot.small_image.is_some());
    }

    #[test]
    fn command_omits_duplicate_small_image() {
        let snapshot =
            PresenceSnapshot::build(&song(), Variant::Fallback, &PresenceConfig::default(), 0.0);
        let command = snapshot.to_command(42, "nonce").unwrap();

        assert_eq!(command["cmd"], "SET_ACTIVITY");
        assert_eq!(command["nonce"], "nonce");
        assert_eq!(command["args"]["pid"], 42);

        let activity = &command["args"]["activity"];
        assert_eq!(activity["type"], 2);
        assert_eq!(activity["timestamps"], json!({ "end": 200 }));
        assert_eq!(
            activity["assets"]["large_image"],
            "https://cdn.listen.moe/artists/b.jpg"
        );
        assert!(activity["assets"].get("small_image").is_none());
        assert_eq!(
            activity["buttons"],
            json!([{ "label": "Join radio", "url": "https://listen.moe/" }])
        );
    }
}

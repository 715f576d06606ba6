//! Songs as described by the event feed.
//!
//! Songs are immutable once parsed. Image names are resolved against the
//! radio's CDN, and names render romaji-first where a romanisation exists.
//!
//! # Wire Format
//!
//! ```json
//! {
//!     "id": 1234,
//!     "title": "Song Title",
//!     "duration": 215,
//!     "artists": [
//!         {
//!             "id": 56,
//!             "name": "アーティスト",
//!             "nameRomaji": "Artist",
//!             "image": "artist.jpg",
//!             "characters": [{ "id": 7 }]
//!         }
//!     ],
//!     "albums": [{ "id": 89, "name": "Album", "nameRomaji": null, "image": "cover.jpg" }],
//!     "sources": [{ "id": 10, "name": "Anime", "nameRomaji": null, "image": null }]
//! }
//! ```
//!
//! Any list may be `null` or missing, and a `duration` of zero means the
//! length is unknown.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

/// Base URL of the image CDN.
pub const CDN_URL: &str = "https://cdn.listen.moe";

/// Separator used when joining names.
pub const SEPARATOR: &str = ", ";

/// Something credited on a song: an artist, an album or a source.
pub trait Credit {
    /// CDN directory holding the images of this kind of credit.
    const CDN_PATH: &'static str;

    fn name(&self) -> Option<&str>;
    fn name_romaji(&self) -> Option<&str>;
    fn image(&self) -> Option<&str>;

    /// Name to display, preferring the romanised name.
    fn display_name(&self) -> Option<&str> {
        self.name_romaji()
            .filter(|name| !name.is_empty())
            .or_else(|| self.name().filter(|name| !name.is_empty()))
    }

    /// Absolute URL of the image, if any.
    fn image_url(&self) -> Option<String> {
        self.image()
            .filter(|image| !image.is_empty())
            .map(|image| format!("{CDN_URL}/{}/{image}", Self::CDN_PATH))
    }
}

macro_rules! credit {
    ($(#[$meta:meta])* $name:ident, $path:literal $(, $extra:ident: $ty:ty)?) => {
        $(#[$meta])*
        #[serde_as]
        #[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            #[serde(default)]
            pub id: u64,
            #[serde(default)]
            pub name: Option<String>,
            #[serde(default)]
            pub name_romaji: Option<String>,
            #[serde(default)]
            pub image: Option<String>,
            $(
                #[serde(default)]
                #[serde_as(as = "DefaultOnNull")]
                pub $extra: $ty,
            )?
        }

        impl Credit for $name {
            const CDN_PATH: &'static str = $path;

            fn name(&self) -> Option<&str> {
                self.name.as_deref()
            }

            fn name_romaji(&self) -> Option<&str> {
                self.name_romaji.as_deref()
            }

            fn image(&self) -> Option<&str> {
                self.image.as_deref()
            }
        }
    };
}

credit!(
    /// A performing artist, optionally voicing characters.
    Artist, "artists", characters: Vec<Character>
);
credit!(
    /// An album the song appears on.
    Album, "covers"
);
credit!(
    /// The work (anime, game, ...) the song originates from.
    Source, "source"
);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct Character {
    pub id: u64,
}

#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    #[serde(default)]
    pub id: u64,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    #[serde_as(as = "DefaultOnNull")]
    pub artists: Vec<Artist>,

    #[serde(default)]
    #[serde_as(as = "DefaultOnNull")]
    pub albums: Vec<Album>,

    #[serde(default)]
    #[serde_as(as = "DefaultOnNull")]
    pub sources: Vec<Source>,

    /// Length in seconds. Zero or absent when unknown.
    #[serde(default)]
    pub duration: Option<u64>,
}

impl Song {
    /// Builds a song from the tags carried by the audio stream.
    ///
    /// Keys are expected in lower case (`title`, `artist`, `album`). Streams
    /// carry no identifiers, images or duration.
    #[must_use]
    pub fn from_tags(tags: &BTreeMap<String, String>) -> Self {
        let named = |key: &str| {
            tags.get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        };

        Self {
            title: named("title"),
            artists: named("artist")
                .map(|name| {
                    vec![Artist {
                        name: Some(name),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            albums: named("album")
                .map(|name| {
                    vec![Album {
                        name: Some(name),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Known length of the song.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn artists_to_string(&self) -> Option<String> {
        join(&self.artists)
    }

    #[must_use]
    pub fn albums_to_string(&self) -> Option<String> {
        join(&self.albums)
    }

    #[must_use]
    pub fn sources_to_string(&self) -> Option<String> {
        join(&self.sources)
    }

    #[must_use]
    pub fn album_image(&self) -> Option<String> {
        first_image(&self.albums)
    }

    #[must_use]
    pub fn artist_image(&self) -> Option<String> {
        first_image(&self.artists)
    }
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.artists_to_string() {
            Some(artists) => write!(f, "{artists} - {}", self.title()),
            None => f.write_str(self.title()),
        }
    }
}

fn join<T: Credit>(credits: &[T]) -> Option<String> {
    let names: Vec<_> = credits.iter().filter_map(Credit::display_name).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(SEPARATOR))
    }
}

fn first_image<T: Credit>(credits: &[T]) -> Option<String> {
    credits.iter().find_map(Credit::image_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SONG: &str = r#"{
        "id": 1234,
        "title": "Renai Circulation",
        "duration": 253,
        "artists": [
            {
                "id": 1,
                "name": "花澤香菜",
                "nameRomaji": "Kana Hanazawa",
                "image": null,
                "characters": [{ "id": 3 }]
            },
            { "id": 2, "name": "Other", "nameRomaji": null, "image": "other.jpg", "characters": [] }
        ],
        "albums": null,
        "sources": [{ "id": 9, "name": "Bakemonogatari", "nameRomaji": "", "image": "bake.png" }]
    }"#;

    #[test]
    fn parses_feed_song() {
        let song: Song = serde_json::from_str(SONG).unwrap();
        assert_eq!(song.title(), "Renai Circulation");
        assert_eq!(song.duration(), Some(Duration::from_secs(253)));
        assert_eq!(song.artists.len(), 2);
        assert_eq!(song.artists[0].characters, vec![Character { id: 3 }]);
        assert!(song.albums.is_empty());
    }

    #[test]
    fn names_prefer_romaji() {
        let song: Song = serde_json::from_str(SONG).unwrap();
        assert_eq!(
            song.artists_to_string().as_deref(),
            Some("Kana Hanazawa, Other")
        );
        assert_eq!(song.sources_to_string().as_deref(), Some("Bakemonogatari"));
        assert_eq!(song.albums_to_string(), None);
        assert_eq!(song.to_string(), "Kana Hanazawa, Other - Renai Circulation");
    }

    #[test]
    fn images_resolve_against_cdn() {
        let song: Song = serde_json::from_str(SONG).unwrap();
        assert_eq!(
            song.artist_image().as_deref(),
            Some("https://cdn.listen.moe/artists/other.jpg")
        );
        assert_eq!(song.album_image(), None);
    }

    #[test]
    fn zero_duration_is_unknown() {
        let song: Song = serde_json::from_str(r#"{"id": 1, "duration": 0}"#).unwrap();
        assert_eq!(song.duration(), None);
        assert_eq!(song.title(), "");
    }

    #[test]
    fn from_stream_tags() {
        let tags = BTreeMap::from([
            ("title".to_owned(), "Song".to_owned()),
            ("artist".to_owned(), " Someone ".to_owned()),
            ("album".to_owned(), String::new()),
        ]);
        let song = Song::from_tags(&tags);
        assert_eq!(song.title(), "Song");
        assert_eq!(song.artists_to_string().as_deref(), Some("Someone"));
        assert!(song.albums.is_empty());
        assert_eq!(song.duration(), None);
    }
}

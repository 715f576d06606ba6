//! Wire formats spoken with the radio service.
//!
//! * [`feed`] - Event feed frames received and sent over the websocket
//!
//! Song payloads carried by the feed live in [`crate::song`].

pub mod feed;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Parses and logs a JSON message.
///
/// Successfully parsed messages are logged at TRACE level. When parsing
/// fails, the raw JSON is logged at TRACE level if it is valid JSON, and at
/// ERROR level otherwise.
///
/// # Errors
///
/// Returns an error if `body` is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing message ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}

//! Byte source for the decoder, reading from a live stream download.
//!
//! A live stream has no end and no known length, so the source is never
//! seekable. Every byte handed to the decoder is counted, which lets the
//! engine tell how far playback trails the download.

use std::{
    io::{BufReader, Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use stream_download::{storage::StorageProvider, StreamDownload};
use symphonia::core::io::MediaSource;

/// Combines Read and Seek for use as a boxed media source.
pub trait ReadSeek: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Read buffer in front of the download (32 KiB).
///
/// Matches Symphonia's read pattern, which reads sequentially in increasing
/// chunks up to 32 KiB.
pub const BUFFER_LEN: usize = 32 * 1024;

pub struct AudioFile {
    inner: Box<dyn ReadSeek>,
    consumed: Arc<AtomicU64>,
}

impl AudioFile {
    /// Wraps `download` and counts the bytes read from it into `consumed`.
    pub fn from_download<P>(download: StreamDownload<P>, consumed: Arc<AtomicU64>) -> Self
    where
        P: StorageProvider + Sync + 'static,
        P::Reader: Sync,
    {
        Self::new(BufReader::with_capacity(BUFFER_LEN, download), consumed)
    }

    fn new(inner: impl ReadSeek + 'static, consumed: Arc<AtomicU64>) -> Self {
        Self {
            inner: Box::new(inner),
            consumed,
        }
    }
}

impl Read for AudioFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.consumed.fetch_add(read as u64, Ordering::Relaxed);
        Ok(read)
    }
}

/// Only relative seeks of zero are honoured, which Symphonia uses to query
/// the current position.
impl Seek for AudioFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.consumed.load(Ordering::Relaxed)),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "live streams cannot seek",
            )),
        }
    }
}

impl MediaSource for AudioFile {
    #[inline]
    fn is_seekable(&self) -> bool {
        false
    }

    #[inline]
    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn counts_consumed_bytes() {
        let consumed = Arc::new(AtomicU64::new(0));
        let mut file = AudioFile::new(Cursor::new(vec![0u8; 100]), Arc::clone(&consumed));

        let mut buf = [0u8; 30];
        file.read_exact(&mut buf).unwrap();
        file.read_exact(&mut buf).unwrap();

        assert_eq!(consumed.load(Ordering::Relaxed), 60);
        assert_eq!(file.stream_position().unwrap(), 60);
        assert!(file.seek(SeekFrom::Start(0)).is_err());
        assert!(!file.is_seekable());
    }
}

use time::OffsetDateTime;

/// Get the current system time in epoch format.
///
/// # Returns
///
/// Current system time in seconds from epoch, with sub-second precision.
#[must_use]
pub fn now_from_epoch() -> f64 {
    // Nanoseconds since epoch fit an `f64` well enough for second-level
    // timestamps.
    #[expect(clippy::cast_precision_loss)]
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() as f64;
    nanos / 1_000_000_000.0
}

/// Trait for converting numeric types to `f32`, allowing precision loss.
pub trait ToF32 {
    /// Converts the value to `f32`, potentially losing precision.
    fn to_f32_lossy(self) -> f32;
}

impl ToF32 for u64 {
    #[inline]
    #[expect(clippy::cast_precision_loss)]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

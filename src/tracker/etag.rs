//! ETag wire layout: `<build-epoch>-<fingerprint>[-<suffix>]`.
//!
//! Building writes each segment positionally into a buffer of the exact final
//! length. Matching never allocates: it gates on length first, then compares
//! the epoch prefix, the numeric middle segment and the suffix in place.

use std::fmt;
use std::sync::Arc;

use super::error::TrackerError;

const SEPARATOR: u8 = b'-';

/// Build identity embedded in every tag so a redeploy invalidates all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEpoch(Arc<str>);

impl BuildEpoch {
    /// Epoch stamped into the binary by the build script.
    pub fn current() -> Self {
        Self(Arc::from(env!("TRACKER_BUILD_TICKS")))
    }

    /// Validate an explicit epoch; it must be a non-empty decimal string.
    pub fn new(value: impl AsRef<str>) -> Result<Self, TrackerError> {
        let value = value.as_ref().trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TrackerError::configuration(format!(
                "build epoch `{value}` must be a non-empty decimal string"
            )));
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of decimal digits in `n`; zero has one digit.
#[inline]
pub fn digit_count(n: u64) -> usize {
    match n {
        0..=9 => 1,
        10..=99 => 2,
        100..=999 => 3,
        1_000..=9_999 => 4,
        10_000..=99_999 => 5,
        100_000..=999_999 => 6,
        1_000_000..=9_999_999 => 7,
        10_000_000..=99_999_999 => 8,
        100_000_000..=999_999_999 => 9,
        1_000_000_000..=9_999_999_999 => 10,
        10_000_000_000..=99_999_999_999 => 11,
        100_000_000_000..=999_999_999_999 => 12,
        1_000_000_000_000..=9_999_999_999_999 => 13,
        10_000_000_000_000..=99_999_999_999_999 => 14,
        100_000_000_000_000..=999_999_999_999_999 => 15,
        1_000_000_000_000_000..=9_999_999_999_999_999 => 16,
        10_000_000_000_000_000..=99_999_999_999_999_999 => 17,
        100_000_000_000_000_000..=999_999_999_999_999_999 => 18,
        1_000_000_000_000_000_000..=9_999_999_999_999_999_999 => 19,
        _ => 20,
    }
}

/// Exact length of the tag for the given segments.
#[inline]
pub fn etag_len(epoch: &str, fingerprint: u64, suffix: &str) -> usize {
    let suffix_len = if suffix.is_empty() {
        0
    } else {
        1 + suffix.len()
    };
    epoch.len() + 1 + digit_count(fingerprint) + suffix_len
}

/// Encode the tag. Pure: equal inputs always yield equal strings.
pub fn build_etag(epoch: &str, fingerprint: u64, suffix: &str) -> String {
    let mut tag = String::with_capacity(etag_len(epoch, fingerprint, suffix));
    tag.push_str(epoch);
    tag.push(SEPARATOR as char);

    let mut digits = [0u8; 20];
    tag.push_str(write_digits(fingerprint, &mut digits));

    if !suffix.is_empty() {
        tag.push(SEPARATOR as char);
        tag.push_str(suffix);
    }
    tag
}

fn write_digits(mut value: u64, buffer: &mut [u8; 20]) -> &str {
    let mut start = buffer.len();
    loop {
        start -= 1;
        buffer[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    // Only ASCII digits were written.
    std::str::from_utf8(&buffer[start..]).unwrap_or_default()
}

/// Compare an incoming tag against the tag `build_etag` would produce,
/// without building it.
pub fn etag_matches(incoming: &str, epoch: &str, fingerprint: u64, suffix: &str) -> bool {
    if incoming.len() != etag_len(epoch, fingerprint, suffix) {
        return false;
    }

    let bytes = incoming.as_bytes();
    let epoch_end = epoch.len();
    if &bytes[..epoch_end] != epoch.as_bytes() || bytes[epoch_end] != SEPARATOR {
        return false;
    }

    let digits_start = epoch_end + 1;
    let digits_end = digits_start + digit_count(fingerprint);
    if parse_digits(&bytes[digits_start..digits_end]) != Some(fingerprint) {
        return false;
    }

    if digits_end == bytes.len() {
        return true;
    }

    bytes[digits_end] == SEPARATOR && &bytes[digits_end + 1..] == suffix.as_bytes()
}

fn parse_digits(digits: &[u8]) -> Option<u64> {
    #[cfg(test)]
    spy::record_parse();

    digits.iter().try_fold(0u64, |acc, &byte| {
        if !byte.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(u64::from(byte - b'0'))
    })
}

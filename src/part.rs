//! Splitting objects into byte-range parts.
//!

use crate::error::Error::{ParameterError, TooManyParts};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The maximum number of parts in a multipart session.
pub const MAX_PARTS: u64 = 10000;

/// The minimum part size, 5 MiB.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// The maximum part size, 5 GiB.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// The part size used when none is given, 20 MiB.
pub const DEFAULT_PART_SIZE: u64 = 20 * 1024 * 1024;

/// One contiguous byte range of an object and its transfer state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Part {
    part_number: u64,
    range_start: u64,
    range_end: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_zero_size: bool,
    is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crc64: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    e_tag: Option<String>,
}

impl Part {
    /// Create a new incomplete part covering the inclusive range.
    pub fn new(part_number: u64, range_start: u64, range_end: u64) -> Self {
        Self {
            part_number,
            range_start,
            range_end,
            is_zero_size: false,
            is_completed: false,
            crc64: None,
            e_tag: None,
        }
    }

    /// The single part of an empty object.
    pub fn zero_size() -> Self {
        Self {
            is_zero_size: true,
            ..Self::new(1, 0, 0)
        }
    }

    /// Get the 1-based part number.
    pub fn part_number(&self) -> u64 {
        self.part_number
    }

    /// Get the first byte offset.
    pub fn range_start(&self) -> u64 {
        self.range_start
    }

    /// Get the last byte offset, inclusive.
    pub fn range_end(&self) -> u64 {
        self.range_end
    }

    /// Get the number of bytes in the part.
    pub fn size(&self) -> u64 {
        if self.is_zero_size {
            0
        } else {
            self.range_end - self.range_start + 1
        }
    }

    /// Whether this is the synthetic part of an empty object.
    pub fn is_zero_size(&self) -> bool {
        self.is_zero_size
    }

    /// Whether the part has been transferred.
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Get the CRC64 of the part contents.
    pub fn crc64(&self) -> Option<u64> {
        self.crc64
    }

    /// Get the identifier the store returned for this part.
    pub fn e_tag(&self) -> Option<&str> {
        self.e_tag.as_deref()
    }

    /// Format the range as an HTTP range, e.g. `bytes=0-1023`.
    pub fn format_range(&self) -> String {
        format!("bytes={}-{}", self.range_start, self.range_end)
    }

    /// Mark the part as completed.
    pub fn complete(mut self, e_tag: Option<String>, crc64: Option<u64>) -> Self {
        self.is_completed = true;
        self.e_tag = e_tag;
        self.crc64 = crc64;
        self
    }

    /// Whether the two parts cover the same byte range with the same number.
    pub fn same_range(&self, other: &Part) -> bool {
        self.part_number == other.part_number
            && self.range_start == other.range_start
            && self.range_end == other.range_end
            && self.is_zero_size == other.is_zero_size
    }
}

/// Clamp a part size into `[MIN_PART_SIZE, MAX_PART_SIZE]`.
pub fn clamp_part_size(part_size: u64) -> u64 {
    let clamped = part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
    if clamped != part_size {
        debug!(part_size, clamped, "part size is out of bounds");
    }

    clamped
}

/// Split an object into parts of `part_size` bytes where the last part holds the remainder.
pub fn plan_parts(object_size: u64, part_size: u64) -> Result<Vec<Part>> {
    if part_size == 0 {
        return Err(ParameterError("part size must not be zero".to_string()));
    }
    if object_size == 0 {
        return Ok(vec![Part::zero_size()]);
    }

    let n_parts = object_size.div_ceil(part_size);
    if n_parts > MAX_PARTS {
        return Err(TooManyParts(n_parts));
    }

    Ok((0..n_parts)
        .map(|i| {
            let range_start = i * part_size;
            let range_end = (range_start + part_size).min(object_size) - 1;
            Part::new(i + 1, range_start, range_end)
        })
        .collect())
}

//! Comma-separated frame-range expressions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::range::FrameRange;
use crate::core::error::FrameRangeError;

/// An ordered, possibly repeating, sequence of frame numbers parsed from an
/// expression such as `1-10x2,15,20-30:3`.
///
/// Segments are expanded left to right and concatenated without removing
/// duplicates. The sequence is materialized once at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FrameSet {
    expr: String,
    frames: Vec<i32>,
}

impl FrameSet {
    /// Parse a frame-range expression.
    ///
    /// # Errors
    /// Returns [`FrameRangeError::InvalidRangeExpression`] if any segment is
    /// malformed.
    pub fn parse(expr: &str) -> Result<Self, FrameRangeError> {
        let mut frames = Vec::new();
        for segment in expr.split(',') {
            frames.extend(FrameRange::parse(segment)?.into_frames());
        }
        Ok(Self {
            expr: expr.trim().to_string(),
            frames,
        })
    }

    /// Build a set from explicit frames, encoding them compactly.
    #[must_use]
    pub fn from_frames(frames: Vec<i32>) -> Self {
        Self {
            expr: compact_expression(&frames),
            frames,
        }
    }

    /// Number of frames, counting repeats.
    #[must_use]
    pub fn size(&self) -> usize {
        self.frames.len()
    }

    /// True when the set has no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame at position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<i32> {
        self.frames.get(index).copied()
    }

    /// Position of the first occurrence of `frame`, or -1 when absent.
    ///
    /// Prefer [`FrameSet::position`] in new code.
    #[must_use]
    pub fn index(&self, frame: i32) -> i32 {
        self.position(frame)
            .and_then(|i| i32::try_from(i).ok())
            .unwrap_or(-1)
    }

    /// Position of the first occurrence of `frame`.
    #[must_use]
    pub fn position(&self, frame: i32) -> Option<usize> {
        self.frames.iter().position(|&f| f == frame)
    }

    /// True if `frame` appears anywhere in the set.
    #[must_use]
    pub fn contains(&self, frame: i32) -> bool {
        self.frames.contains(&frame)
    }

    /// All frames in evaluation order.
    #[must_use]
    pub fn get_all(&self) -> &[i32] {
        &self.frames
    }

    /// Iterate frames in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.frames.iter().copied()
    }

    /// The expression this set was built from.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// A sorted copy with duplicates removed.
    #[must_use]
    pub fn normalize(&self) -> Self {
        let mut frames = self.frames.clone();
        frames.sort_unstable();
        frames.dedup();
        Self::from_frames(frames)
    }

    /// Compact expression covering `size` frames starting at `start_index`.
    ///
    /// The chunk is truncated at the end of the set. A chunk of one frame
    /// renders as that frame alone.
    ///
    /// # Errors
    /// Returns [`FrameRangeError::ChunkOutOfRange`] when `start_index` is not
    /// a valid position.
    pub fn chunk(&self, start_index: usize, size: usize) -> Result<String, FrameRangeError> {
        if start_index >= self.frames.len() {
            return Err(FrameRangeError::ChunkOutOfRange {
                index: start_index,
                len: self.frames.len(),
            });
        }
        let end = start_index.saturating_add(size.max(1)).min(self.frames.len());
        Ok(compact_expression(&self.frames[start_index..end]))
    }
}

/// Encode frames as the shortest run of `A-B`, `A-BxS` and single-frame
/// segments that parses back to the same sequence.
///
/// Two-frame runs with a step other than one are written as single frames.
#[must_use]
pub fn compact_expression(frames: &[i32]) -> String {
    let mut segments = Vec::new();
    let mut i = 0;
    while i < frames.len() {
        let start = frames[i];
        let Some(&next) = frames.get(i + 1) else {
            segments.push(start.to_string());
            break;
        };
        let step = i64::from(next) - i64::from(start);
        let mut last = i + 1;
        while let Some(&f) = frames.get(last + 1) {
            if i64::from(f) - i64::from(frames[last]) != step {
                break;
            }
            last += 1;
        }

        let run = last - i + 1;
        if step == 0 || (run == 2 && step.abs() != 1) {
            segments.push(start.to_string());
            i += 1;
        } else if step.abs() == 1 {
            segments.push(format!("{start}-{}", frames[last]));
            i = last + 1;
        } else {
            segments.push(format!("{start}-{}x{step}", frames[last]));
            i = last + 1;
        }
    }
    segments.join(",")
}

impl fmt::Display for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl FromStr for FrameSet {
    type Err = FrameRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FrameSet {
    type Error = FrameRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FrameSet> for String {
    fn from(set: FrameSet) -> Self {
        set.expr
    }
}

impl<'a> IntoIterator for &'a FrameSet {
    type Item = &'a i32;
    type IntoIter = std::slice::Iter<'a, i32>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_segments_without_dedup() {
        let set = FrameSet::parse("1-3, 2").unwrap();
        assert_eq!(set.get_all(), &[1, 2, 3, 2]);
        assert_eq!(set.index(2), 1);
        assert_eq!(set.index(42), -1);
    }

    #[test]
    fn normalize_sorts_and_dedups() {
        let set = FrameSet::parse("5,1-3,2").unwrap().normalize();
        assert_eq!(set.get_all(), &[1, 2, 3, 5]);
        assert_eq!(set.expr(), "1-3,5");
    }

    #[test]
    fn chunk_encodes_compactly() {
        let set = FrameSet::parse("1-20").unwrap();
        assert_eq!(set.chunk(0, 10).unwrap(), "1-10");
        assert_eq!(set.chunk(15, 10).unwrap(), "16-20");
        assert_eq!(set.chunk(4, 1).unwrap(), "5");

        let stepped = FrameSet::parse("1-20x2").unwrap();
        assert_eq!(stepped.chunk(0, 5).unwrap(), "1-9x2");

        let sparse = FrameSet::parse("1,3,7").unwrap();
        assert_eq!(sparse.chunk(0, 3).unwrap(), "1,3,7");
    }

    #[test]
    fn chunk_rejects_start_past_end() {
        let set = FrameSet::parse("1-3").unwrap();
        assert_eq!(
            set.chunk(3, 2),
            Err(FrameRangeError::ChunkOutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn compact_expression_handles_descending_runs() {
        assert_eq!(compact_expression(&[6, 5, 4, 3]), "6-3");
        assert_eq!(compact_expression(&[76, 73, 70]), "76-70x-3");
        assert_eq!(compact_expression(&[4, 4, 4]), "4,4,4");
        assert_eq!(compact_expression(&[]), "");
    }

    #[test]
    fn serde_uses_expression_text() {
        let set = FrameSet::parse("1-10x3").unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"1-10x3\"");
        let back: FrameSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get_all(), &[1, 4, 7, 10]);
        assert!(serde_json::from_str::<FrameSet>("\"1-10-20\"").is_err());
    }
}

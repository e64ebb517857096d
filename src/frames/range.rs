//! A single frame-range segment such as `1-10x2`.
//!
//! Grammar of one segment, matched as a whole:
//!
//! ```text
//! N          single frame
//! A-B        unit step toward B
//! A-BxS      every S-th frame
//! A-ByS      the frames `x` would skip
//! A-B:S      interleaved, coarse-to-fine
//! ```
//!
//! Every bound and step may be negative.

use std::fmt;
use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::{Captures, Regex};

use crate::core::error::FrameRangeError;

const SEGMENT_PATTERN: &str = r"^(?P<start>-?\d+)(?:-(?P<end>-?\d+)(?:(?P<op>[xy:])(?P<step>-?\d+))?)?$";

static SEGMENT: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(SEGMENT_PATTERN));

/// How a ranged segment walks from its start to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stepping {
    /// Plain `A-B`; unit step in the direction of travel.
    Unit,
    /// `A-BxS`.
    Step(i32),
    /// `A-ByS`.
    InvertedStep(i32),
    /// `A-B:S`.
    Interleave(i32),
}

/// One parsed, materialized segment of a frame-range expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRange {
    expr: String,
    frames: Vec<i32>,
}

impl FrameRange {
    /// Parse a single segment. Surrounding whitespace is ignored.
    ///
    /// # Errors
    /// Returns [`FrameRangeError::InvalidRangeExpression`] when the segment
    /// does not match the grammar or the step contradicts the direction.
    pub fn parse(segment: &str) -> Result<Self, FrameRangeError> {
        let expr = segment.trim();
        if expr.is_empty() {
            return Err(FrameRangeError::invalid(segment, "empty segment"));
        }

        let pattern = SEGMENT
            .as_ref()
            .map_err(|e| FrameRangeError::invalid(expr, format!("segment pattern: {e}")))?;
        let caps = pattern
            .captures(expr)
            .ok_or_else(|| FrameRangeError::invalid(expr, "unrecognized frame range syntax"))?;

        let start = group_int(expr, &caps, "start")?;
        let frames = match caps.name("end") {
            None => vec![start],
            Some(_) => {
                let end = group_int(expr, &caps, "end")?;
                let stepping = match caps.name("op").map(|m| m.as_str()) {
                    None => Stepping::Unit,
                    Some(op) => {
                        let step = group_int(expr, &caps, "step")?;
                        validate_step(expr, start, end, step)?;
                        match op {
                            "x" => Stepping::Step(step),
                            "y" => Stepping::InvertedStep(step),
                            _ => Stepping::Interleave(step),
                        }
                    }
                };
                expand(start, end, stepping)
            }
        };

        Ok(Self {
            expr: expr.to_string(),
            frames,
        })
    }

    /// Frames in evaluation order.
    #[must_use]
    pub fn frames(&self) -> &[i32] {
        &self.frames
    }

    /// The segment text this range was parsed from.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Consume the range, returning its frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<i32> {
        self.frames
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn group_int(expr: &str, caps: &Captures<'_>, group: &str) -> Result<i32, FrameRangeError> {
    let text = caps.name(group).map_or("", |m| m.as_str());
    text.parse()
        .map_err(|_| FrameRangeError::invalid(expr, format!("{group} `{text}` is not a valid frame number")))
}

fn validate_step(expr: &str, start: i32, end: i32, step: i32) -> Result<(), FrameRangeError> {
    if step == 0 {
        return Err(FrameRangeError::invalid(expr, "step cannot be zero"));
    }
    if step > 1 && end < start {
        return Err(FrameRangeError::invalid(
            expr,
            "end frame cannot be less than start frame for a positive step",
        ));
    }
    if step < 0 && end >= start {
        return Err(FrameRangeError::invalid(
            expr,
            "end frame cannot be greater than start frame for a negative step",
        ));
    }
    Ok(())
}

fn expand(start: i32, end: i32, stepping: Stepping) -> Vec<i32> {
    match stepping {
        Stepping::Unit => int_range(start, end, if end >= start { 1 } else { -1 }),
        Stepping::Step(step) => int_range(start, end, step),
        Stepping::InvertedStep(step) => {
            let stride = i64::from(step).abs();
            int_range(start, end, step.signum())
                .into_iter()
                .filter(|&f| (i64::from(f) - i64::from(start)) % stride != 0)
                .collect()
        }
        Stepping::Interleave(step) => interleave(start, end, step),
    }
}

/// Values from `start` toward `end` inclusive, `step` apart.
///
/// Empty when `start` already lies past `end` in the direction of `step`.
fn int_range(start: i32, end: i32, step: i32) -> Vec<i32> {
    let (end, step) = (i64::from(end), i64::from(step));
    let mut frames = Vec::new();
    let mut frame = i64::from(start);
    while (step > 0 && frame <= end) || (step < 0 && frame >= end) {
        // frame stays within [start, end], both of which fit in i32
        frames.push(i32::try_from(frame).unwrap_or_default());
        frame += step;
    }
    frames
}

/// Coarse-to-fine coverage: walk with `step`, then shift one frame toward
/// `end` and halve the step, until the step reaches zero. Each frame keeps
/// the position of its first visit.
fn interleave(start: i32, end: i32, step: i32) -> Vec<i32> {
    let mut frames = IndexSet::new();
    let unit = step.signum();
    let (mut start, mut step) = (start, step);
    while step != 0 {
        frames.extend(int_range(start, end, step));
        start = start.saturating_add(unit);
        step /= 2;
    }
    frames.into_iter().collect()
}

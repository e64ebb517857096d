//! Frame-range expression language.
//!
//! Clients address subsets of a layer's frames with compact expressions
//! such as `1-100x5,200`. The same evaluator is used for frame searches, for
//! eating and killing frames, and for chunked dispatch, so any client must
//! parse an expression exactly the way [`FrameSet::parse`] does.

pub mod range;
pub mod set;

pub use range::{FrameRange, Stepping};
pub use set::{compact_expression, FrameSet};

//! Wire framing shared by both roles.
//!
//! Two frame kinds delimit the byte stream: job batch frames
//! (coordinator to worker) and result frames (worker to coordinator).
//! Header fields are 16 bytes of left-justified, space-padded ASCII
//! decimal, so frames are human-inspectable and field offsets are fixed.

mod codec;
mod frame;

pub use codec::{BatchCodec, ResultCodec};
pub use frame::{FIELD_LEN, HEADER_LEN, JobBatch, JobId, MAX_FRAME_LEN, ResultFrame, WireJob};

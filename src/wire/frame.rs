//! Frame building blocks: fixed-width decimal header fields and the frame
//! types they describe.

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Width of one decimal header field, in bytes.
pub const FIELD_LEN: usize = 16;

/// Width of a two-field header. Batch headers, item headers and result
/// headers all use this shape.
pub const HEADER_LEN: usize = 2 * FIELD_LEN;

/// Upper bound on any declared length. A corrupted header would otherwise
/// leave a decoder waiting forever for bytes that cannot arrive.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Process-unique, monotonically increasing job identifier. Never reused;
/// ordering carries no meaning beyond uniqueness.
pub type JobId = u64;

/// Append one header field to `dst`: the value in ASCII decimal,
/// left-justified and space-padded to [`FIELD_LEN`] bytes. Fails for
/// values wider than the 16-digit field; lengths are capped far below
/// that by [`MAX_FRAME_LEN`], so in practice only a job id can get here.
pub fn put_field(
    dst: &mut BytesMut,
    field: &'static str,
    value: u64,
) -> Result<(), ProtocolError> {
    let mut out = [b' '; FIELD_LEN];
    let text = value.to_string();
    if text.len() > FIELD_LEN {
        return Err(ProtocolError::FieldOverflow { field, value });
    }
    out[..text.len()].copy_from_slice(text.as_bytes());
    dst.put_slice(&out);
    Ok(())
}

/// Parse one header field from the first [`FIELD_LEN`] bytes of `src`.
///
/// Callers must have checked that `src` holds at least [`FIELD_LEN`] bytes.
/// Anything other than decimal digits followed by space padding is a
/// protocol violation.
pub fn parse_field(src: &[u8], field: &'static str) -> Result<u64, ProtocolError> {
    let raw = &src[..FIELD_LEN];
    let text =
        std::str::from_utf8(raw).map_err(|_| ProtocolError::bad_field(field, raw))?;
    text.trim_end_matches(' ')
        .parse::<u64>()
        .map_err(|_| ProtocolError::bad_field(field, raw))
}

/// One job as it travels inside a batch frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireJob {
    pub id: JobId,
    pub payload: Bytes,
}

/// An ordered batch of jobs bound for one worker, sent as a single frame.
///
/// On the wire: `[item width][item count]` followed by `item count` items,
/// each occupying exactly the declared width:
/// `[job id][payload length][payload][zero padding]`. Items are
/// length-prefixed, so payloads may contain any bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobBatch {
    pub jobs: Vec<WireJob>,
}

impl JobBatch {
    pub fn new(jobs: Vec<WireJob>) -> Self {
        Self { jobs }
    }

    /// Uniform width of every item in this batch: the widest payload plus
    /// its two header fields. Varies across batches.
    pub fn item_len(&self) -> usize {
        HEADER_LEN
            + self
                .jobs
                .iter()
                .map(|job| job.payload.len())
                .max()
                .unwrap_or(0)
    }

    /// Total frame size on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.item_len() * self.jobs.len()
    }
}

/// One completed job's result, sent back unpadded:
/// `[job id][payload length][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    pub id: JobId,
    pub payload: Bytes,
}

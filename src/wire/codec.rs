//! Codecs for the two frame kinds.
//!
//! Decoding follows the tokio-util contract: `Ok(None)` means the buffer
//! does not yet hold a complete unit and nothing was consumed, so a buffer
//! may carry a partial trailing frame and/or several concatenated frames.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{
    FIELD_LEN, HEADER_LEN, JobBatch, MAX_FRAME_LEN, ResultFrame, WireJob, parse_field, put_field,
};
use crate::error::ProtocolError;

/// Decoder position in a batch stream.
#[derive(Debug)]
enum BatchState {
    /// Awaiting the 32-byte batch header.
    Header,
    /// Awaiting the next fixed-width item of the current batch.
    Items { item_len: usize, remaining: u64 },
}

/// Codec for job batch frames.
///
/// Encodes a whole [`JobBatch`]; decodes one [`WireJob`] at a time so the
/// worker can gate admission per job while the rest of the batch is still
/// buffered.
#[derive(Debug)]
pub struct BatchCodec {
    state: BatchState,
}

impl BatchCodec {
    pub fn new() -> Self {
        Self {
            state: BatchState::Header,
        }
    }
}

impl Default for BatchCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BatchCodec {
    type Item = WireJob;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireJob>, ProtocolError> {
        loop {
            match self.state {
                BatchState::Header => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let item_len = parse_field(&src[..], "max_item_len")?;
                    let count = parse_field(&src[FIELD_LEN..], "item_count")?;
                    if item_len > MAX_FRAME_LEN {
                        return Err(ProtocolError::FrameTooLarge { declared: item_len });
                    }
                    if count > 0 && (item_len as usize) < HEADER_LEN {
                        return Err(ProtocolError::ItemTooNarrow {
                            declared: item_len,
                            min: HEADER_LEN as u64,
                        });
                    }
                    src.advance(HEADER_LEN);
                    if count == 0 {
                        // Empty batch: nothing to yield, look for the next header.
                        continue;
                    }
                    self.state = BatchState::Items {
                        item_len: item_len as usize,
                        remaining: count,
                    };
                }
                BatchState::Items { item_len, remaining } => {
                    if src.len() < item_len {
                        src.reserve(item_len - src.len());
                        return Ok(None);
                    }
                    let id = parse_field(&src[..], "job_id")?;
                    let payload_len = parse_field(&src[FIELD_LEN..], "payload_len")? as usize;
                    if HEADER_LEN + payload_len > item_len {
                        return Err(ProtocolError::ItemOverflow {
                            declared: payload_len as u64,
                            item_len: item_len as u64,
                        });
                    }

                    let mut item = src.split_to(item_len);
                    item.advance(HEADER_LEN);
                    item.truncate(payload_len);

                    self.state = if remaining > 1 {
                        BatchState::Items {
                            item_len,
                            remaining: remaining - 1,
                        }
                    } else {
                        BatchState::Header
                    };
                    return Ok(Some(WireJob {
                        id,
                        payload: item.freeze(),
                    }));
                }
            }
        }
    }
}

impl Encoder<JobBatch> for BatchCodec {
    type Error = ProtocolError;

    fn encode(&mut self, batch: JobBatch, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let item_len = batch.item_len();
        // Same cap the decoder enforces; fail at the sender instead of
        // poisoning the receiving end of the connection.
        if item_len as u64 > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                declared: item_len as u64,
            });
        }
        dst.reserve(batch.encoded_len());
        put_field(dst, "max_item_len", item_len as u64)?;
        put_field(dst, "item_count", batch.jobs.len() as u64)?;
        for job in &batch.jobs {
            put_field(dst, "job_id", job.id)?;
            put_field(dst, "payload_len", job.payload.len() as u64)?;
            dst.put_slice(&job.payload);
            dst.put_bytes(0, item_len - HEADER_LEN - job.payload.len());
        }
        Ok(())
    }
}

/// Codec for result frames. Stateless: a 32-byte header, then exactly the
/// declared number of payload bytes, no padding.
#[derive(Debug, Default)]
pub struct ResultCodec;

impl Decoder for ResultCodec {
    type Item = ResultFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ResultFrame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let id = parse_field(&src[..], "job_id")?;
        let payload_len = parse_field(&src[FIELD_LEN..], "payload_len")?;
        if payload_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                declared: payload_len,
            });
        }
        let payload_len = payload_len as usize;
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(ResultFrame { id, payload }))
    }
}

impl Encoder<ResultFrame> for ResultCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: ResultFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() as u64 > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                declared: frame.payload.len() as u64,
            });
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        put_field(dst, "job_id", frame.id)?;
        put_field(dst, "payload_len", frame.payload.len() as u64)?;
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::Bytes;

    fn job(id: u64, payload: &'static [u8]) -> WireJob {
        WireJob {
            id,
            payload: Bytes::from_static(payload),
        }
    }

    fn encode_batch(batch: &JobBatch) -> BytesMut {
        let mut buf = BytesMut::new();
        BatchCodec::new().encode(batch.clone(), &mut buf).unwrap();
        buf
    }

    fn decode_all(codec: &mut BatchCodec, buf: &mut BytesMut) -> Vec<WireJob> {
        let mut jobs = Vec::new();
        while let Some(job) = codec.decode(buf).unwrap() {
            jobs.push(job);
        }
        jobs
    }

    #[test]
    fn batch_roundtrip() {
        let batch = JobBatch::new(vec![job(7, b"alpha"), job(8, b"be"), job(9, b"gammagamma")]);
        let mut buf = encode_batch(&batch);

        let decoded = decode_all(&mut BatchCodec::new(), &mut buf);
        assert_eq!(decoded, batch.jobs);
        assert!(buf.is_empty());
    }

    #[test]
    fn batch_payloads_may_contain_zero_bytes() {
        let batch = JobBatch::new(vec![job(1, b"a\x00b\x00"), job(2, b"\x00")]);
        let mut buf = encode_batch(&batch);

        let decoded = decode_all(&mut BatchCodec::new(), &mut buf);
        assert_eq!(decoded, batch.jobs);
    }

    #[test]
    fn batch_encoding_layout_is_stable() {
        let batch = JobBatch::new(vec![job(5, b"hi")]);
        let buf = encode_batch(&batch);

        // item width 34 = 32-byte item header + 2-byte payload, one item
        assert_eq!(&buf[..16], b"34              ");
        assert_eq!(&buf[16..32], b"1               ");
        assert_eq!(&buf[32..48], b"5               ");
        assert_eq!(&buf[48..64], b"2               ");
        assert_eq!(&buf[64..66], b"hi");
        assert_eq!(buf.len(), 66);
    }

    #[test]
    fn items_are_padded_to_uniform_width() {
        let batch = JobBatch::new(vec![job(1, b"wide payload"), job(2, b"x")]);
        let buf = encode_batch(&batch);

        let item_len = batch.item_len();
        assert_eq!(buf.len(), HEADER_LEN + 2 * item_len);
        // Narrow item's padding is zero bytes.
        let second = &buf[HEADER_LEN + item_len..];
        assert!(second[HEADER_LEN + 1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncated_batch_at_every_offset_needs_more_data() {
        let batch = JobBatch::new(vec![job(10, b"first"), job(11, b"second!")]);
        let full = encode_batch(&batch);
        let item_len = batch.item_len();

        for cut in 0..full.len() {
            let mut codec = BatchCodec::new();
            let mut buf = BytesMut::from(&full[..cut]);
            let decoded = decode_all(&mut codec, &mut buf);

            let complete = cut.saturating_sub(HEADER_LEN) / item_len;
            assert_eq!(decoded.len(), complete, "cut at {cut}");
            assert_eq!(decoded, batch.jobs[..complete]);
        }
    }

    #[test]
    fn partial_second_item_is_not_decoded() {
        let batch = JobBatch::new(vec![job(1, b"aaaa"), job(2, b"bbbb")]);
        let full = encode_batch(&batch);
        let item_len = batch.item_len();

        // One and a half items' worth of bytes after the batch header.
        let cut = HEADER_LEN + item_len + item_len / 2;
        let mut codec = BatchCodec::new();
        let mut buf = BytesMut::from(&full[..cut]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(batch.jobs[0].clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // The remaining bytes complete the second item.
        buf.extend_from_slice(&full[cut..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(batch.jobs[1].clone()));
    }

    #[test]
    fn concatenated_batches_decode_in_sequence() {
        let first = JobBatch::new(vec![job(1, b"one"), job(2, b"two")]);
        let second = JobBatch::new(vec![job(3, b"a much wider payload")]);

        let mut buf = encode_batch(&first);
        let mut codec = BatchCodec::new();
        codec.encode(second.clone(), &mut buf).unwrap();

        let decoded = decode_all(&mut codec, &mut buf);
        assert_eq!(decoded.len(), 3);
        assert_eq!(&decoded[..2], &first.jobs[..]);
        assert_eq!(decoded[2], second.jobs[0]);
    }

    #[test]
    fn empty_batch_yields_nothing_and_advances() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "max_item_len", 0).unwrap();
        put_field(&mut buf, "item_count", 0).unwrap();
        let follow = JobBatch::new(vec![job(4, b"after")]);
        let mut codec = BatchCodec::new();
        codec.encode(follow.clone(), &mut buf).unwrap();

        let decoded = decode_all(&mut codec, &mut buf);
        assert_eq!(decoded, follow.jobs);
    }

    #[test]
    fn garbage_batch_header_is_an_error() {
        let mut buf = BytesMut::from(&b"not a number    not a number    "[..]);
        let err = BatchCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::BadHeaderField { .. }));
    }

    #[test]
    fn oversized_item_width_is_an_error() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "max_item_len", MAX_FRAME_LEN + 1).unwrap();
        put_field(&mut buf, "item_count", 1).unwrap();
        let err = BatchCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn item_width_below_header_is_an_error() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "max_item_len", 16).unwrap();
        put_field(&mut buf, "item_count", 1).unwrap();
        let err = BatchCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::ItemTooNarrow { .. }));
    }

    #[test]
    fn item_payload_wider_than_item_is_an_error() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "max_item_len", 40).unwrap(); // room for 8 payload bytes
        put_field(&mut buf, "item_count", 1).unwrap();
        put_field(&mut buf, "job_id", 1).unwrap();
        put_field(&mut buf, "payload_len", 9).unwrap(); // exceeds the item width
        buf.put_bytes(b'x', 8);

        let err = BatchCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::ItemOverflow { .. }));
    }

    #[test]
    fn result_roundtrip() {
        let frame = ResultFrame {
            id: 99,
            payload: Bytes::from_static(b"outcome bytes \x00 included"),
        };
        let mut buf = BytesMut::new();
        ResultCodec.encode(frame.clone(), &mut buf).unwrap();

        assert_eq!(ResultCodec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn short_result_header_needs_more_data() {
        let mut buf = BytesMut::from(&[b' '; HEADER_LEN - 1][..]);
        assert_eq!(ResultCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), HEADER_LEN - 1);
    }

    #[test]
    fn partial_result_payload_needs_more_data() {
        let frame = ResultFrame {
            id: 3,
            payload: Bytes::from_static(b"0123456789"),
        };
        let mut full = BytesMut::new();
        ResultCodec.encode(frame.clone(), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(ResultCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(ResultCodec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn concatenated_results_decode_in_a_loop() {
        let frames = vec![
            ResultFrame {
                id: 1,
                payload: Bytes::from_static(b"one"),
            },
            ResultFrame {
                id: 2,
                payload: Bytes::new(),
            },
            ResultFrame {
                id: 3,
                payload: Bytes::from_static(b"three"),
            },
        ];
        let mut buf = BytesMut::new();
        for frame in &frames {
            ResultCodec.encode(frame.clone(), &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(frame) = ResultCodec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn oversized_result_length_is_an_error() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, "job_id", 1).unwrap();
        put_field(&mut buf, "payload_len", MAX_FRAME_LEN + 1).unwrap();
        let err = ResultCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn oversized_batch_payload_fails_at_encode() {
        let wide = Bytes::from(vec![0u8; MAX_FRAME_LEN as usize + 1]);
        let batch = JobBatch::new(vec![WireJob { id: 1, payload: wide }]);

        let mut buf = BytesMut::new();
        let err = BatchCodec::new().encode(batch, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_result_payload_fails_at_encode() {
        let frame = ResultFrame {
            id: 1,
            payload: Bytes::from(vec![0u8; MAX_FRAME_LEN as usize + 1]),
        };

        let mut buf = BytesMut::new();
        let err = ResultCodec.encode(frame, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }
}

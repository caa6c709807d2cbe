use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::core::{Error, MAX_EXTRA_DATA};
use super::crc::crc16;
use super::frame::{Frame, Header, CRC_LEN, FRAME_OVERHEAD, FRAME_START, HEADER_LEN, OFFSET_HEADER_CRC};

/// Output of the frame assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A frame whose header and extra data both passed their CRCs
    Frame(Frame),
    /// The header was good but the extra data failed its CRC
    CorruptData(Header),
}

/// Counters kept while hunting for frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Bytes discarded while scanning for a start marker
    pub dropped_bytes: u64,
    /// Candidate headers that failed their CRC
    pub header_errors: u64,
    /// Frames whose extra data failed its CRC
    pub data_errors: u64,
    /// Complete frames produced
    pub frames: u64,
}

/// Streaming frame codec
///
/// Decoding scans for the start marker and validates the header CRC as
/// soon as the header is complete. A bad header only consumes its marker:
/// scanning resumes at the next byte, since the bytes after a false marker
/// may well hold the real frame.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    stats: CodecStats,
}

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec::default()
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    fn discard(&mut self, src: &mut BytesMut, count: usize) {
        if count > 0 {
            trace!(count, "discarding bytes before marker");
            self.stats.dropped_bytes += count as u64;
            src.advance(count);
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Assembled;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Hunt for a start marker
            match src.iter().position(|b| *b == FRAME_START) {
                Some(pos) => self.discard(src, pos),
                None => {
                    let len = src.len();
                    self.discard(src, len);
                    return Ok(None);
                }
            }

            if src.len() < FRAME_OVERHEAD {
                // Need more data to check the header
                return Ok(None);
            }

            let header_bytes = [src[1], src[2], src[3], src[4]];
            let received = u16::from_be_bytes([src[OFFSET_HEADER_CRC], src[OFFSET_HEADER_CRC + 1]]);
            let header = Header::from_bytes(header_bytes);

            if crc16(&header_bytes) != received || header.length as usize > MAX_EXTRA_DATA {
                debug!(channel = %header.channel, "header CRC mismatch, rescanning after marker");
                self.stats.header_errors += 1;
                self.stats.dropped_bytes += 1;
                src.advance(1);
                continue;
            }

            let data_len = header.length as usize;
            let total = if data_len == 0 {
                FRAME_OVERHEAD
            } else {
                FRAME_OVERHEAD + data_len + CRC_LEN
            };
            if src.len() < total {
                // Need more data to read the extra data
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut frame_bytes = src.split_to(total);
            frame_bytes.advance(HEADER_LEN + CRC_LEN);

            let data: Bytes = if data_len == 0 {
                Bytes::new()
            } else {
                let data = frame_bytes.split_to(data_len).freeze();
                let received = u16::from_be_bytes([frame_bytes[0], frame_bytes[1]]);
                if crc16(&data) != received {
                    debug!(channel = %header.channel, len = data_len, "extra data CRC mismatch");
                    self.stats.data_errors += 1;
                    return Ok(Some(Assembled::CorruptData(header)));
                }
                data
            };

            self.stats.frames += 1;
            return Ok(Some(Assembled::Frame(Frame { header, data })));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

//! Opus/PCM transcoding and MQTT-gateway device packet framing (C1).
//!
//! Frames are fixed at 60 ms, 16 kHz mono, 16-bit little-endian PCM. The
//! Opus wrapper mirrors the `OpusCodec` pattern used elsewhere in the
//! corpus for PCM16 <-> Opus transcoding, but fixes sample rate/channels
//! to the gateway's single supported format rather than taking them as
//! constructor arguments.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};
use thiserror::Error;

pub const SAMPLE_RATE_HZ: u32 = 16_000;
pub const FRAME_DURATION_MS: u32 = 60;
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE_HZ as usize * FRAME_DURATION_MS as usize) / 1000;

const MAX_OPUS_FRAME_BYTES: usize = 4000;
const MAX_DECODED_SAMPLES: usize = FRAME_SAMPLES * 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("opus encode failed: {0}")]
    Encode(String),
    #[error("opus decode failed: {0}")]
    Decode(String),
    #[error("device packet header too short: got {0} bytes, need at least 16")]
    HeaderTooShort(usize),
    #[error("device packet payload length {declared} exceeds remaining bytes {available}")]
    PayloadLengthMismatch { declared: u32, available: usize },
}

/// Opus encoder/decoder fixed to the gateway's 16 kHz mono format.
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
}

impl OpusCodec {
    pub fn new() -> Result<Self, CodecError> {
        let sample_rate = SampleRate::Hz16000;
        let channels = Channels::Mono;

        let encoder = Encoder::new(sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::Encode(format!("encoder init: {e}")))?;
        let decoder = Decoder::new(sample_rate, channels)
            .map_err(|e| CodecError::Decode(format!("decoder init: {e}")))?;

        Ok(Self { encoder, decoder })
    }

    /// Encode one 60 ms PCM frame to an Opus packet. `pcm` shorter than
    /// `FRAME_SAMPLES` is zero-padded per the last-frame invariant;
    /// longer input is an error (callers must pre-chunk).
    pub fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() > FRAME_SAMPLES {
            return Err(CodecError::Encode(format!(
                "frame has {} samples, expected at most {FRAME_SAMPLES}",
                pcm.len()
            )));
        }
        let mut padded;
        let input = if pcm.len() == FRAME_SAMPLES {
            pcm
        } else {
            padded = vec![0i16; FRAME_SAMPLES];
            padded[..pcm.len()].copy_from_slice(pcm);
            &padded[..]
        };

        let mut output = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let len = self
            .encoder
            .encode(input, &mut output)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        output.truncate(len);
        Ok(output)
    }

    /// Decode a single Opus packet to PCM16 samples.
    pub fn decode_frame(&mut self, opus_data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut output = vec![0i16; MAX_DECODED_SAMPLES];
        let packet = audiopus::packet::Packet::try_from(opus_data)
            .map_err(|e| CodecError::Decode(format!("invalid packet: {e}")))?;
        let mut_signals = MutSignals::try_from(output.as_mut_slice())
            .map_err(|e| CodecError::Decode(format!("output buffer: {e}")))?;

        let decoded = self
            .decoder
            .decode(Some(packet), mut_signals, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        output.truncate(decoded);
        Ok(output)
    }
}

/// Split PCM samples into fixed 60 ms frames, zero-padding the final
/// partial frame, and encode each to Opus via `sink`.
pub fn encode_pcm_to_opus_stream(
    codec: &mut OpusCodec,
    pcm: &[i16],
    mut sink: impl FnMut(Vec<u8>) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
    for chunk in pcm.chunks(FRAME_SAMPLES) {
        let encoded = codec.encode_frame(chunk)?;
        sink(encoded)?;
    }
    Ok(())
}

pub fn decode_opus_frames(codec: &mut OpusCodec, frames: &[Vec<u8>]) -> Result<Vec<i16>, CodecError> {
    let mut pcm = Vec::with_capacity(frames.len() * FRAME_SAMPLES);
    for frame in frames {
        pcm.extend(codec.decode_frame(frame)?);
    }
    Ok(pcm)
}

/// A device audio packet received over the MQTT-gateway transport variant:
/// 8 reserved bytes, a 4-byte big-endian millisecond timestamp, a 4-byte
/// big-endian payload length, then the Opus payload itself.
#[derive(Debug, Clone)]
pub struct DevicePacket {
    pub timestamp_ms: u32,
    pub payload: Vec<u8>,
}

const HEADER_LEN: usize = 16;

impl DevicePacket {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::HeaderTooShort(bytes.len()));
        }
        let timestamp_ms = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let length = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let available = bytes.len() - HEADER_LEN;
        if length as usize > available {
            return Err(CodecError::PayloadLengthMismatch { declared: length, available });
        }
        let payload = bytes[HEADER_LEN..HEADER_LEN + length as usize].to_vec();
        Ok(Self { timestamp_ms, payload })
    }
}

/// Bounded reorder buffer that restores monotone delivery of device
/// packets keyed by timestamp. Holds at most `CAPACITY` out-of-order
/// entries; once full, a packet later than every buffered entry is
/// dropped rather than evicting older audio (favors continuity over
/// completeness for the tail of a burst).
pub struct ReorderBuffer {
    pending: BTreeMap<u32, Vec<u8>>,
    next_expected: Option<u32>,
}

const CAPACITY: usize = 20;

impl ReorderBuffer {
    pub fn new() -> Self {
        Self { pending: BTreeMap::new(), next_expected: None }
    }

    /// Admit a packet, returning any payloads now ready for delivery to
    /// the ASR queue in timestamp order.
    pub fn push(&mut self, packet: DevicePacket) -> Vec<Vec<u8>> {
        let expected = *self.next_expected.get_or_insert(packet.timestamp_ms);

        if packet.timestamp_ms < expected {
            // Late arrival for a timestamp we already flushed; drop.
            return Vec::new();
        }

        if self.pending.len() >= CAPACITY && !self.pending.contains_key(&packet.timestamp_ms) {
            let overflow_is_latest = self
                .pending
                .keys()
                .next_back()
                .map(|&max| packet.timestamp_ms >= max)
                .unwrap_or(false);
            if overflow_is_latest {
                return Vec::new();
            }
        }

        self.pending.insert(packet.timestamp_ms, packet.payload);
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while let Some((&ts, _)) = self.pending.iter().next() {
            let expected = *self.next_expected.as_ref().unwrap();
            if ts != expected && !self.pending_is_contiguous_start(ts, expected) {
                break;
            }
            let (_, payload) = self.pending.pop_first().unwrap();
            ready.push(payload);
            self.next_expected = Some(ts.saturating_add(FRAME_DURATION_MS));
        }
        ready
    }

    fn pending_is_contiguous_start(&self, ts: u32, expected: u32) -> bool {
        // Once the buffer is at capacity we flush the earliest entry even
        // if a gap remains, rather than stalling forever on a lost packet.
        ts > expected && self.pending.len() >= CAPACITY
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_header() {
        let mut bytes = vec![0u8; 16];
        bytes[8..12].copy_from_slice(&1000u32.to_be_bytes());
        bytes[12..16].copy_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        let packet = DevicePacket::parse(&bytes).unwrap();
        assert_eq!(packet.timestamp_ms, 1000);
        assert_eq!(packet.payload, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_short_header() {
        let bytes = vec![0u8; 10];
        assert!(matches!(DevicePacket::parse(&bytes), Err(CodecError::HeaderTooShort(10))));
    }

    #[test]
    fn rejects_length_exceeding_remaining_bytes() {
        let mut bytes = vec![0u8; 16];
        bytes[12..16].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(
            DevicePacket::parse(&bytes),
            Err(CodecError::PayloadLengthMismatch { declared: 100, available: 0 })
        ));
    }

    #[test]
    fn reorder_buffer_restores_monotone_order() {
        let mut buf = ReorderBuffer::new();
        let mk = |ts: u32, tag: u8| DevicePacket { timestamp_ms: ts, payload: vec![tag] };

        let mut out = Vec::new();
        out.extend(buf.push(mk(0, 0)));
        out.extend(buf.push(mk(120, 2)));
        out.extend(buf.push(mk(60, 1)));

        assert_eq!(out, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn reorder_buffer_caps_at_capacity() {
        let mut buf = ReorderBuffer::new();
        buf.push(DevicePacket { timestamp_ms: 0, payload: vec![0] });
        for i in 1..CAPACITY as u32 + 5 {
            buf.push(DevicePacket { timestamp_ms: (i + 1) * FRAME_DURATION_MS, payload: vec![i as u8] });
        }
        assert!(buf.pending.len() <= CAPACITY);
    }
}

use base64::Engine;
use bytes::{Bytes, BytesMut};

/// One Twilio media packet: 20 ms of 8 kHz mu-law.
pub const TWILIO_PACKET_BYTES: usize = 160;
/// Caller audio is forwarded to the agent in chunks of 20 packets (400 ms).
pub const DEFAULT_CHUNK_BYTES: usize = 20 * TWILIO_PACKET_BYTES;

/// Decodes one G.711 mu-law byte to a linear PCM16 sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i16;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if sign != 0 { -magnitude } else { magnitude }
}

/// Root-mean-square level of a mu-law buffer, on the PCM16 scale.
pub fn rms_level(mulaw: &[u8]) -> u16 {
    if mulaw.is_empty() {
        return 0;
    }
    let sum: f64 = mulaw
        .iter()
        .map(|&b| {
            let s = mulaw_to_linear(b) as f64;
            s * s
        })
        .sum();
    (sum / mulaw.len() as f64).sqrt().min(u16::MAX as f64) as u16
}

pub fn decode_payload(base64_fragment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(base64_fragment)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Regroups small media packets into fixed-size chunks.
#[derive(Debug)]
pub struct FrameChunker {
    buffer: BytesMut,
    chunk_bytes: usize,
}

impl FrameChunker {
    pub fn new(chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        Self {
            buffer: BytesMut::with_capacity(chunk_bytes * 2),
            chunk_bytes,
        }
    }

    /// Appends `data` and returns every complete chunk now available.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_bytes {
            chunks.push(self.buffer.split_to(self.chunk_bytes).freeze());
        }
        chunks
    }

    /// Takes whatever partial chunk is left.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityChange {
    Started,
    Stopped,
}

/// Energy-based caller speech detector, run on each inbound packet.
///
/// Speech starts after `start_packets` consecutive packets at or above the
/// threshold, and stops after `hangover_packets` consecutive quiet ones. A
/// threshold of zero disables detection.
#[derive(Debug, Clone)]
pub struct CallerActivity {
    threshold: u16,
    start_packets: u32,
    hangover_packets: u32,
    loud_run: u32,
    quiet_run: u32,
    speaking: bool,
}

impl CallerActivity {
    pub fn new(threshold: u16) -> Self {
        Self::with_timing(threshold, 2, 15)
    }

    pub fn with_timing(threshold: u16, start_packets: u32, hangover_packets: u32) -> Self {
        Self {
            threshold,
            start_packets: start_packets.max(1),
            hangover_packets: hangover_packets.max(1),
            loud_run: 0,
            quiet_run: 0,
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn observe(&mut self, mulaw: &[u8]) -> Option<ActivityChange> {
        if self.threshold == 0 || mulaw.is_empty() {
            return None;
        }

        if rms_level(mulaw) >= self.threshold {
            self.loud_run += 1;
            self.quiet_run = 0;
            if !self.speaking && self.loud_run >= self.start_packets {
                self.speaking = true;
                return Some(ActivityChange::Started);
            }
        } else {
            self.quiet_run += 1;
            self.loud_run = 0;
            if self.speaking && self.quiet_run >= self.hangover_packets {
                self.speaking = false;
                return Some(ActivityChange::Stopped);
            }
        }
        None
    }
}

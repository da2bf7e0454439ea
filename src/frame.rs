//! Encoded samples and the record header stored in front of each queued frame.

use anyhow::Result;
use bytes::Bytes;

/// H.264 NAL unit types that the recorder distinguishes.
pub mod nal_unit_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
}

/// Elementary stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
}

/// One encoded sample as delivered by a capture driver.
///
/// Video payloads are single NAL units without start code, audio payloads
/// are raw AAC access units.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    /// Capture time in nanoseconds.
    pub sample_time: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn video(sample_time: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Video,
            sample_time,
            payload: payload.into(),
        }
    }

    pub fn audio(sample_time: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Audio,
            sample_time,
            payload: payload.into(),
        }
    }

    /// NAL unit type of a video frame (low 5 bits of the first byte).
    pub fn nal_type(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Video => self.payload.first().map(|b| b & 0x1F),
            FrameKind::Audio => None,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.nal_type() == Some(nal_unit_type::IDR_SLICE)
    }
}

/// Sample type word of a record header.
///
/// Zero for audio. For video the NAL unit type sits in the low 5 bits,
/// with two flag bits on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleType(u32);

impl SampleType {
    const NAL_MASK: u32 = 0x1F;
    /// Key frame that begins a new fragment.
    pub const FRAGMENT_START: u32 = 0x40;
    /// First fragment after an overflow gap.
    pub const RESTART: u32 = 0x80;

    pub const AUDIO: SampleType = SampleType(0);

    pub fn video(nal_type: u8) -> Self {
        SampleType(u32::from(nal_type) & Self::NAL_MASK)
    }

    pub fn is_audio(self) -> bool {
        self.0 == 0
    }

    pub fn kind(self) -> FrameKind {
        if self.is_audio() {
            FrameKind::Audio
        } else {
            FrameKind::Video
        }
    }

    pub fn nal_type(self) -> u8 {
        (self.0 & Self::NAL_MASK) as u8
    }

    pub fn is_key_frame(self) -> bool {
        self.nal_type() == nal_unit_type::IDR_SLICE
    }

    pub fn is_fragment_start(self) -> bool {
        self.0 & Self::FRAGMENT_START != 0
    }

    pub fn is_restart(self) -> bool {
        self.0 & Self::RESTART != 0
    }

    pub fn with_fragment_start(self) -> Self {
        SampleType(self.0 | Self::FRAGMENT_START)
    }

    pub fn with_restart(self) -> Self {
        SampleType(self.0 | Self::RESTART)
    }

    pub fn to_wire(self) -> u32 {
        self.0
    }

    pub fn from_wire(v: u32) -> Result<Self> {
        if v & !(Self::NAL_MASK | Self::FRAGMENT_START | Self::RESTART) != 0 {
            anyhow::bail!("Unknown sample type bits: {:#x}", v);
        }
        if v != 0 && v & Self::NAL_MASK == 0 {
            anyhow::bail!("Flagged sample without NAL type: {:#x}", v);
        }
        Ok(SampleType(v))
    }
}

/// Size of an encoded [`RecordHeader`].
pub const RECORD_HEADER_SIZE: usize = 16;

/// Header written in front of every frame in a cyclic queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub sample_time: u64,
    /// Payload bytes following the header.
    pub size: u32,
    pub sample_type: SampleType,
}

impl RecordHeader {
    /// Total bytes the record occupies in a queue.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.size as usize
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..8].copy_from_slice(&self.sample_time.to_le_bytes());
        header[8..12].copy_from_slice(&self.size.to_le_bytes());
        header[12..16].copy_from_slice(&self.sample_type.to_wire().to_le_bytes());
        header
    }

    pub fn decode(header: &[u8; RECORD_HEADER_SIZE]) -> Result<Self> {
        let decoded = Self::decode_trusted(header);
        SampleType::from_wire(decoded.sample_type.to_wire())?;
        Ok(decoded)
    }

    /// Decode a header this crate wrote itself, skipping validation.
    pub(crate) fn decode_trusted(header: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let sample_time = u64::from_le_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6],
            header[7],
        ]);
        let size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let sample_type = SampleType(u32::from_le_bytes([header[12], header[13], header[14], header[15]]));
        Self {
            sample_time,
            size,
            sample_type,
        }
    }
}

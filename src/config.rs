//! Recording configuration: persisted parameters, validation and the
//! derived queue/timing plan.

use std::collections::HashMap;

use anyhow::Result;

use crate::error::RecorderError;
use crate::frame::RECORD_HEADER_SIZE;

/// Longest fragment the recorder produces (ms).
pub const MAX_FRAGMENT_DURATION_MS: u32 = 4000;
/// Longest run of same-kind samples inside a fragment (ms).
pub const MAX_RUN_DURATION_MS: u32 = 500;
/// Default size of one delivered chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 262_144;
/// Default memory pool shared by all recording queues.
pub const DEFAULT_POOL_SIZE: usize = 8 * 1024 * 1024;

const NS_PER_MS: u64 = 1_000_000;

/// H.264 profile (accessory protocol option bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    ConstrainedBaseline,
    Main,
    High,
}

impl H264Profile {
    pub fn to_wire(&self) -> u8 {
        match self {
            H264Profile::ConstrainedBaseline => 1 << 0,
            H264Profile::Main => 1 << 1,
            H264Profile::High => 1 << 2,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(H264Profile::ConstrainedBaseline),
            0x02 => Ok(H264Profile::Main),
            0x04 => Ok(H264Profile::High),
            _ => anyhow::bail!("Unknown H.264 profile: {}", v),
        }
    }
}

/// H.264 level (accessory protocol option bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Level {
    L3_1,
    L3_2,
    L4,
}

impl H264Level {
    pub fn to_wire(&self) -> u8 {
        match self {
            H264Level::L3_1 => 1 << 0,
            H264Level::L3_2 => 1 << 1,
            H264Level::L4 => 1 << 2,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(H264Level::L3_1),
            0x02 => Ok(H264Level::L3_2),
            0x04 => Ok(H264Level::L4),
            _ => anyhow::bail!("Unknown H.264 level: {}", v),
        }
    }
}

/// Audio codec of the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    AacLc,
    AacEld,
}

impl AudioCodec {
    pub fn to_wire(&self) -> u8 {
        match self {
            AudioCodec::AacEld => 3,
            AudioCodec::AacLc => 8,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            3 => Ok(AudioCodec::AacEld),
            8 => Ok(AudioCodec::AacLc),
            _ => anyhow::bail!("Unsupported audio codec: {}", v),
        }
    }

    /// Samples per access unit, used as the duration of a fragment's last
    /// audio sample.
    pub fn frame_samples(&self) -> u32 {
        match self {
            AudioCodec::AacLc => 1024,
            AudioCodec::AacEld => 480,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitRateMode {
    Variable,
    Constant,
}

impl BitRateMode {
    pub fn to_wire(&self) -> u8 {
        match self {
            BitRateMode::Variable => 1 << 0,
            BitRateMode::Constant => 1 << 1,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(BitRateMode::Variable),
            0x02 => Ok(BitRateMode::Constant),
            _ => anyhow::bail!("Unknown bit rate mode: {}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    Khz8,
    Khz16,
    Khz24,
    Khz32,
    Khz44_1,
    Khz48,
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Khz8 => 8000,
            SampleRate::Khz16 => 16000,
            SampleRate::Khz24 => 24000,
            SampleRate::Khz32 => 32000,
            SampleRate::Khz44_1 => 44100,
            SampleRate::Khz48 => 48000,
        }
    }

    pub fn to_wire(&self) -> u8 {
        match self {
            SampleRate::Khz8 => 1 << 0,
            SampleRate::Khz16 => 1 << 1,
            SampleRate::Khz24 => 1 << 2,
            SampleRate::Khz32 => 1 << 3,
            SampleRate::Khz44_1 => 1 << 4,
            SampleRate::Khz48 => 1 << 5,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(SampleRate::Khz8),
            0x02 => Ok(SampleRate::Khz16),
            0x04 => Ok(SampleRate::Khz24),
            0x08 => Ok(SampleRate::Khz32),
            0x10 => Ok(SampleRate::Khz44_1),
            0x20 => Ok(SampleRate::Khz48),
            _ => anyhow::bail!("Unknown sample rate: {}", v),
        }
    }
}

/// Event types that may trigger a recording (bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTriggers(u8);

impl EventTriggers {
    pub const MOTION: EventTriggers = EventTriggers(1 << 0);
    pub const DOORBELL: EventTriggers = EventTriggers(1 << 1);

    pub fn contains(&self, other: EventTriggers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: EventTriggers) -> Self {
        EventTriggers(self.0 | other.0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Selected video stream parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoParams {
    pub profile: H264Profile,
    pub level: H264Level,
    pub bit_rate_kbps: u32,
    pub i_frame_interval_ms: u32,
    pub width: u16,
    pub height: u16,
    pub max_frame_rate: u8,
}

/// Selected audio stream parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub codec: AudioCodec,
    pub channels: u8,
    pub bit_rate_mode: BitRateMode,
    pub sample_rate: SampleRate,
    pub bit_rate_kbps: u32,
}

/// Recording configuration selected by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingParams {
    pub prebuffer_duration_ms: u32,
    pub event_triggers: EventTriggers,
    pub fragment_duration_ms: u32,
    pub video: VideoParams,
    pub audio: AudioParams,
}

impl Default for RecordingParams {
    fn default() -> Self {
        Self {
            prebuffer_duration_ms: 4000,
            event_triggers: EventTriggers::MOTION,
            fragment_duration_ms: MAX_FRAGMENT_DURATION_MS,
            video: VideoParams {
                profile: H264Profile::Main,
                level: H264Level::L4,
                bit_rate_kbps: 2000,
                i_frame_interval_ms: 4000,
                width: 1920,
                height: 1080,
                max_frame_rate: 30,
            },
            audio: AudioParams {
                codec: AudioCodec::AacLc,
                channels: 1,
                bit_rate_mode: BitRateMode::Variable,
                sample_rate: SampleRate::Khz16,
                bit_rate_kbps: 32,
            },
        }
    }
}

/// Video codec code of H.264.
const VIDEO_CODEC_H264: u8 = 1;
/// Non-interleaved packetization.
const PACKETIZATION_NON_INTERLEAVED: u8 = 1;

impl RecordingParams {
    /// Size of the persisted encoding.
    pub const ENCODED_SIZE: usize = 34;

    /// Fixed little-endian layout; field order and widths are part of the
    /// persisted format.
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.prebuffer_duration_ms.to_le_bytes());
        buf[4] = self.event_triggers.bits();
        buf[5..9].copy_from_slice(&self.fragment_duration_ms.to_le_bytes());
        buf[9] = VIDEO_CODEC_H264;
        buf[10] = self.video.profile.to_wire();
        buf[11] = self.video.level.to_wire();
        buf[12] = PACKETIZATION_NON_INTERLEAVED;
        buf[13..17].copy_from_slice(&self.video.bit_rate_kbps.to_le_bytes());
        buf[17..21].copy_from_slice(&self.video.i_frame_interval_ms.to_le_bytes());
        buf[21..23].copy_from_slice(&self.video.width.to_le_bytes());
        buf[23..25].copy_from_slice(&self.video.height.to_le_bytes());
        buf[25] = self.video.max_frame_rate;
        buf[26] = self.audio.codec.to_wire();
        buf[27] = self.audio.channels;
        buf[28] = self.audio.bit_rate_mode.to_wire();
        buf[29] = self.audio.sample_rate.to_wire();
        buf[30..34].copy_from_slice(&self.audio.bit_rate_kbps.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::ENCODED_SIZE {
            anyhow::bail!("Recording configuration has {} bytes, expected {}", data.len(), Self::ENCODED_SIZE);
        }
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);

        if data[9] != VIDEO_CODEC_H264 {
            anyhow::bail!("Unsupported video codec: {}", data[9]);
        }
        if data[12] != PACKETIZATION_NON_INTERLEAVED {
            anyhow::bail!("Unsupported packetization mode: {}", data[12]);
        }
        Ok(Self {
            prebuffer_duration_ms: u32_at(0),
            event_triggers: EventTriggers(data[4]),
            fragment_duration_ms: u32_at(5),
            video: VideoParams {
                profile: H264Profile::from_wire(data[10])?,
                level: H264Level::from_wire(data[11])?,
                bit_rate_kbps: u32_at(13),
                i_frame_interval_ms: u32_at(17),
                width: u16_at(21),
                height: u16_at(23),
                max_frame_rate: data[25],
            },
            audio: AudioParams {
                codec: AudioCodec::from_wire(data[26])?,
                channels: data[27],
                bit_rate_mode: BitRateMode::from_wire(data[28])?,
                sample_rate: SampleRate::from_wire(data[29])?,
                bit_rate_kbps: u32_at(30),
            },
        })
    }

    /// Check the parameters against the recorder's bounds.
    pub fn validate(&self) -> std::result::Result<(), RecorderError> {
        let video = &self.video;
        if video.width == 0 || video.height == 0 {
            return Err(RecorderError::invalid_config(format!(
                "resolution {}x{}",
                video.width, video.height
            )));
        }
        // Half a frame time must stay below the run duration.
        if video.max_frame_rate < 2 {
            return Err(RecorderError::invalid_config(format!(
                "frame rate {}",
                video.max_frame_rate
            )));
        }
        if video.bit_rate_kbps == 0 {
            return Err(RecorderError::invalid_config("video bit rate 0"));
        }
        if video.i_frame_interval_ms == 0 {
            return Err(RecorderError::invalid_config("i-frame interval 0"));
        }
        let half_frame_ms = self.frame_time_ms() / 2;
        if self.fragment_duration_ms <= half_frame_ms
            || self.fragment_duration_ms > MAX_FRAGMENT_DURATION_MS
        {
            return Err(RecorderError::invalid_config(format!(
                "fragment duration {} ms",
                self.fragment_duration_ms
            )));
        }

        let audio = &self.audio;
        if audio.channels == 0 || audio.channels > 7 {
            return Err(RecorderError::invalid_config(format!("{} audio channels", audio.channels)));
        }
        if audio.bit_rate_kbps == 0 && audio.bit_rate_mode == BitRateMode::Constant {
            return Err(RecorderError::invalid_config("constant audio bit rate 0"));
        }
        Ok(())
    }

    /// Frame interval at the maximum frame rate (ms).
    pub fn frame_time_ms(&self) -> u32 {
        1000 / u32::from(self.video.max_frame_rate.max(1))
    }

    /// Validate and derive queue sizes and timing for a memory pool.
    pub fn plan(&self, pool_size: usize) -> std::result::Result<RecordingPlan, RecorderError> {
        self.validate()?;

        // Two seconds of each stream.
        let video_queue_size = self.video.bit_rate_kbps as usize * (2000 / 8);
        let mut audio_kbps = self.audio.bit_rate_kbps;
        if self.audio.bit_rate_mode == BitRateMode::Variable {
            audio_kbps = audio_kbps.max(32);
        }
        let audio_queue_size = audio_kbps as usize * (2000 / 8);
        let sync_size = video_queue_size + audio_queue_size;
        if pool_size <= sync_size + RECORD_HEADER_SIZE {
            return Err(RecorderError::invalid_config(format!(
                "memory pool of {} bytes cannot hold {} bytes of synchronization queues",
                pool_size, sync_size
            )));
        }

        let frame_time_ms = u64::from(self.frame_time_ms());
        let fragment_ms = u64::from(self.fragment_duration_ms);
        let i_frame_interval_ms = self.video.i_frame_interval_ms.min(self.fragment_duration_ms);

        // An extra key frame is needed when the regular ones miss the
        // fragment boundary by more than a frame.
        let extra_key_frame_margin_ns =
            if (fragment_ms + frame_time_ms / 2) % u64::from(i_frame_interval_ms) > frame_time_ms {
                frame_time_ms * NS_PER_MS
            } else {
                0
            };

        Ok(RecordingPlan {
            video_queue_size,
            audio_queue_size,
            main_queue_size: pool_size - sync_size,
            i_frame_interval_ms,
            fragment_duration_ns: (fragment_ms - frame_time_ms / 2) * NS_PER_MS,
            run_duration_ns: (u64::from(MAX_RUN_DURATION_MS) - frame_time_ms / 2) * NS_PER_MS,
            prebuffer_margin_ns: (u64::from(self.prebuffer_duration_ms) + fragment_ms) * NS_PER_MS,
            extra_key_frame_margin_ns,
            video_timescale: u32::from(self.video.max_frame_rate) * 100,
            audio_timescale: self.audio.sample_rate.hz(),
        })
    }
}

/// Queue sizes and timing derived from [`RecordingParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPlan {
    pub video_queue_size: usize,
    pub audio_queue_size: usize,
    pub main_queue_size: usize,
    pub i_frame_interval_ms: u32,
    pub fragment_duration_ns: u64,
    pub run_duration_ns: u64,
    pub prebuffer_margin_ns: u64,
    pub extra_key_frame_margin_ns: u64,
    pub video_timescale: u32,
    pub audio_timescale: u32,
}

/// Persistent key/value storage for recorder settings.
pub trait ConfigStore: Send {
    /// Selected recording configuration, if the controller chose one.
    fn recording_config(&self) -> Result<Option<RecordingParams>>;
    fn set_recording_config(&mut self, params: &RecordingParams) -> Result<()>;
    fn recording_active(&self) -> Result<bool>;
    fn set_recording_active(&mut self, active: bool) -> Result<()>;
    fn audio_enabled(&self) -> Result<bool>;
    fn set_audio_enabled(&mut self, enabled: bool) -> Result<()>;
}

const KEY_RECORDING_CONFIG: &str = "recording.config";
const KEY_RECORDING_ACTIVE: &str = "recording.active";
const KEY_AUDIO_ENABLED: &str = "recording.audio";

/// In-memory [`ConfigStore`] keeping the encoded values.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<&'static str, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a selected configuration and recording switched on.
    pub fn with_config(params: &RecordingParams) -> Self {
        let mut store = Self::new();
        store.values.insert(KEY_RECORDING_CONFIG, params.encode().to_vec());
        store.values.insert(KEY_RECORDING_ACTIVE, vec![1]);
        store
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.values.get(key).map(Vec::as_slice) {
            None => Ok(default),
            Some([0]) => Ok(false),
            Some([1]) => Ok(true),
            Some(other) => anyhow::bail!("Invalid flag value for {}: {:?}", key, other),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn recording_config(&self) -> Result<Option<RecordingParams>> {
        self.values
            .get(KEY_RECORDING_CONFIG)
            .map(|bytes| RecordingParams::decode(bytes))
            .transpose()
    }

    fn set_recording_config(&mut self, params: &RecordingParams) -> Result<()> {
        self.values.insert(KEY_RECORDING_CONFIG, params.encode().to_vec());
        Ok(())
    }

    fn recording_active(&self) -> Result<bool> {
        self.flag(KEY_RECORDING_ACTIVE, false)
    }

    fn set_recording_active(&mut self, active: bool) -> Result<()> {
        self.values.insert(KEY_RECORDING_ACTIVE, vec![u8::from(active)]);
        Ok(())
    }

    fn audio_enabled(&self) -> Result<bool> {
        self.flag(KEY_AUDIO_ENABLED, true)
    }

    fn set_audio_enabled(&mut self, enabled: bool) -> Result<()> {
        self.values.insert(KEY_AUDIO_ENABLED, vec![u8::from(enabled)]);
        Ok(())
    }
}

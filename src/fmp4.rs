//! Fragmented MP4 boxes for H.264 + AAC recordings.
//!
//! The movie header (`ftyp` + `moov`) describes one video track and an
//! optional audio track. Each fragment header (`moof` + `mdat` header)
//! describes runs of samples whose bytes follow verbatim, in run order.
//!
//! The parser half of this module walks the same boxes back; it is used to
//! check the writer and by tooling that inspects recordings.

use bytes::Bytes;

use crate::config::AudioCodec;
use crate::frame::FrameKind;

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// Sample flag words used in `trun` and `tfhd`.
pub mod sample_flags {
    /// Sync sample (depends on nothing).
    pub const KEY_FRAME: u32 = 0x0200_0000;
    /// Non-sync sample that depends on others.
    pub const NON_KEY_FRAME: u32 = 0x0101_0000;
}

/// `trun` flag bits.
mod trun_flags {
    pub const DATA_OFFSET: u32 = 0x01;
    pub const FIRST_SAMPLE_FLAGS: u32 = 0x04;
    pub const SAMPLE_DURATION: u32 = 0x100;
    pub const SAMPLE_SIZE: u32 = 0x200;
    pub const SAMPLE_FLAGS: u32 = 0x400;
    pub const SAMPLE_COMPOSITION_OFFSET: u32 = 0x800;
}

/// `tfhd` flag bits.
mod tfhd_flags {
    pub const DEFAULT_SAMPLE_FLAGS: u32 = 0x20;
    pub const DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;
}

const UNITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

fn write_box(buf: &mut Vec<u8>, box_type: &[u8; 4], content: &[u8]) {
    let size = 8 + content.len();
    buf.extend_from_slice(&(size as u32).to_be_bytes());
    buf.extend_from_slice(box_type);
    buf.extend_from_slice(content);
}

fn full_box(content: &mut Vec<u8>, version: u8, flags: u32) {
    content.push(version);
    content.extend_from_slice(&flags.to_be_bytes()[1..]);
}

/// AAC sampling frequency index.
fn frequency_index(sample_rate: u32) -> u32 {
    match sample_rate {
        8000 => 11,
        16000 => 8,
        24000 => 6,
        32000 => 5,
        44100 => 4,
        48000 => 3,
        _ => 8,
    }
}

/// Audio track of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
    /// bit/s
    pub bit_rate: u32,
}

impl AudioTrack {
    /// AudioSpecificConfig carried in the decoder specific descriptor.
    pub fn decoder_specific_info(&self) -> Vec<u8> {
        let freq = frequency_index(self.sample_rate);
        let channels = u32::from(self.channels);
        match self.codec {
            AudioCodec::AacLc => {
                let config = (2u32 << 11) | (freq << 7) | (channels << 3);
                (config as u16).to_be_bytes().to_vec()
            }
            AudioCodec::AacEld => {
                // Escaped object type 39, frame length 480.
                let config = (31u32 << 27) | (7 << 21) | (freq << 17) | (channels << 13) | (1 << 12);
                config.to_be_bytes().to_vec()
            }
        }
    }

    fn stream_type(&self) -> u8 {
        // Audio stream (0x05) with the upstream bit set for LC.
        match self.codec {
            AudioCodec::AacLc => (0x05 << 2) | 1,
            AudioCodec::AacEld => 0x05 << 2,
        }
    }
}

/// Parameters of the movie header.
#[derive(Debug, Clone)]
pub struct MovieConfig {
    pub width: u16,
    pub height: u16,
    /// Video timescale, also used as movie timescale.
    pub timescale: u32,
    pub sps: Bytes,
    pub pps: Bytes,
    /// `None` when audio is not recorded.
    pub audio: Option<AudioTrack>,
}

impl MovieConfig {
    /// Write `ftyp` + `moov`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        self.write_ftyp(buf);
        self.write_moov(buf);
    }

    fn write_ftyp(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();
        content.extend_from_slice(b"mp42"); // major brand
        content.extend_from_slice(&1u32.to_be_bytes()); // minor version
        for brand in [b"isom", b"mp42", b"avc1"] {
            content.extend_from_slice(brand);
        }
        write_box(buf, b"ftyp", &content);
    }

    fn write_moov(&self, buf: &mut Vec<u8>) {
        let mut moov_content = Vec::new();
        self.write_mvhd(&mut moov_content);
        self.write_trak(&mut moov_content, FrameKind::Video);
        if self.audio.is_some() {
            self.write_trak(&mut moov_content, FrameKind::Audio);
        }
        self.write_mvex(&mut moov_content);
        write_box(buf, b"moov", &moov_content);
    }

    fn write_mvhd(&self, buf: &mut Vec<u8>) {
        let mut c = Vec::new();
        full_box(&mut c, 0, 0);
        c.extend_from_slice(&0u32.to_be_bytes()); // creation time
        c.extend_from_slice(&0u32.to_be_bytes()); // modification time
        c.extend_from_slice(&self.timescale.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes()); // duration
        c.extend_from_slice(&0x00010000u32.to_be_bytes()); // rate 1.0
        c.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        c.extend_from_slice(&[0; 10]); // reserved
        for m in &UNITY_MATRIX {
            c.extend_from_slice(&m.to_be_bytes());
        }
        c.extend_from_slice(&[0; 24]); // pre_defined
        c.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes()); // next track id
        write_box(buf, b"mvhd", &c);
    }

    fn write_trak(&self, buf: &mut Vec<u8>, kind: FrameKind) {
        let mut trak_content = Vec::new();
        self.write_tkhd(&mut trak_content, kind);
        self.write_mdia(&mut trak_content, kind);
        write_box(buf, b"trak", &trak_content);
    }

    fn write_tkhd(&self, buf: &mut Vec<u8>, kind: FrameKind) {
        let (track_id, volume, width, height) = match kind {
            FrameKind::Video => (
                VIDEO_TRACK_ID,
                0u16,
                u32::from(self.width) << 16,
                u32::from(self.height) << 16,
            ),
            FrameKind::Audio => (AUDIO_TRACK_ID, 0x0100, 0, 0),
        };

        let mut c = Vec::new();
        full_box(&mut c, 0, 7); // enabled, in movie, in preview
        c.extend_from_slice(&0u32.to_be_bytes()); // creation time
        c.extend_from_slice(&0u32.to_be_bytes()); // modification time
        c.extend_from_slice(&track_id.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes()); // reserved
        c.extend_from_slice(&0u32.to_be_bytes()); // duration
        c.extend_from_slice(&[0; 8]); // reserved
        c.extend_from_slice(&0u16.to_be_bytes()); // layer
        c.extend_from_slice(&0u16.to_be_bytes()); // alternate group
        c.extend_from_slice(&volume.to_be_bytes());
        c.extend_from_slice(&0u16.to_be_bytes()); // reserved
        for m in &UNITY_MATRIX {
            c.extend_from_slice(&m.to_be_bytes());
        }
        c.extend_from_slice(&width.to_be_bytes());
        c.extend_from_slice(&height.to_be_bytes());
        write_box(buf, b"tkhd", &c);
    }

    fn write_mdia(&self, buf: &mut Vec<u8>, kind: FrameKind) {
        let mut mdia_content = Vec::new();

        let timescale = match (kind, &self.audio) {
            (FrameKind::Audio, Some(audio)) => audio.sample_rate,
            _ => self.timescale,
        };
        let mut c = Vec::new();
        full_box(&mut c, 0, 0);
        c.extend_from_slice(&0u32.to_be_bytes()); // creation time
        c.extend_from_slice(&0u32.to_be_bytes()); // modification time
        c.extend_from_slice(&timescale.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes()); // duration
        c.extend_from_slice(&0x55c4u16.to_be_bytes()); // language: und
        c.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
        write_box(&mut mdia_content, b"mdhd", &c);

        let (handler, name): (&[u8; 4], &[u8; 14]) = match kind {
            FrameKind::Video => (b"vide", b"Video Handler\0"),
            FrameKind::Audio => (b"soun", b"Sound Handler\0"),
        };
        let mut c = Vec::new();
        full_box(&mut c, 0, 0);
        c.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        c.extend_from_slice(handler);
        c.extend_from_slice(&[0; 12]); // reserved
        c.extend_from_slice(name);
        write_box(&mut mdia_content, b"hdlr", &c);

        self.write_minf(&mut mdia_content, kind);
        write_box(buf, b"mdia", &mdia_content);
    }

    fn write_minf(&self, buf: &mut Vec<u8>, kind: FrameKind) {
        let mut minf_content = Vec::new();

        let mut c = Vec::new();
        match kind {
            FrameKind::Video => {
                full_box(&mut c, 0, 1);
                c.extend_from_slice(&0u16.to_be_bytes()); // graphics mode
                c.extend_from_slice(&[0; 6]); // opcolor
                write_box(&mut minf_content, b"vmhd", &c);
            }
            FrameKind::Audio => {
                full_box(&mut c, 0, 0);
                c.extend_from_slice(&0u16.to_be_bytes()); // balance
                c.extend_from_slice(&0u16.to_be_bytes()); // reserved
                write_box(&mut minf_content, b"smhd", &c);
            }
        }

        // dinf / dref with one self-contained url entry
        let mut url = Vec::new();
        full_box(&mut url, 0, 1);
        let mut dref = Vec::new();
        full_box(&mut dref, 0, 0);
        dref.extend_from_slice(&1u32.to_be_bytes()); // entry count
        write_box(&mut dref, b"url ", &url);
        let mut dinf = Vec::new();
        write_box(&mut dinf, b"dref", &dref);
        write_box(&mut minf_content, b"dinf", &dinf);

        let mut stbl = Vec::new();
        self.write_stsd(&mut stbl, kind);
        for box_type in [b"stsz", b"stsc", b"stts", b"stco"] {
            let mut c = Vec::new();
            full_box(&mut c, 0, 0);
            if box_type == b"stsz" {
                c.extend_from_slice(&0u32.to_be_bytes()); // sample size
            }
            c.extend_from_slice(&0u32.to_be_bytes()); // entry count
            write_box(&mut stbl, box_type, &c);
        }
        write_box(&mut minf_content, b"stbl", &stbl);

        write_box(buf, b"minf", &minf_content);
    }

    fn write_stsd(&self, buf: &mut Vec<u8>, kind: FrameKind) {
        let mut c = Vec::new();
        full_box(&mut c, 0, 0);
        c.extend_from_slice(&1u32.to_be_bytes()); // entry count
        match (kind, &self.audio) {
            (FrameKind::Audio, Some(audio)) => write_mp4a(&mut c, audio),
            _ => self.write_avc1(&mut c),
        }
        write_box(buf, b"stsd", &c);
    }

    fn write_avc1(&self, buf: &mut Vec<u8>) {
        let mut c = Vec::new();
        c.extend_from_slice(&[0; 6]); // reserved
        c.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        c.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
        c.extend_from_slice(&0u16.to_be_bytes()); // reserved
        c.extend_from_slice(&[0; 12]); // pre_defined
        c.extend_from_slice(&self.width.to_be_bytes());
        c.extend_from_slice(&self.height.to_be_bytes());
        c.extend_from_slice(&0x00480000u32.to_be_bytes()); // 72 dpi
        c.extend_from_slice(&0x00480000u32.to_be_bytes()); // 72 dpi
        c.extend_from_slice(&0u32.to_be_bytes()); // reserved
        c.extend_from_slice(&1u16.to_be_bytes()); // frame count
        let mut compressor = [0u8; 32];
        let name = b"h264";
        compressor[0] = name.len() as u8;
        compressor[1..1 + name.len()].copy_from_slice(name);
        c.extend_from_slice(&compressor);
        c.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
        c.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre_defined

        let sps_byte = |i: usize| self.sps.get(i).copied().unwrap_or(0);
        let mut avcc = Vec::new();
        avcc.push(1); // configuration version
        avcc.push(sps_byte(1)); // profile
        avcc.push(sps_byte(2)); // profile compatibility
        avcc.push(sps_byte(3)); // level
        avcc.push(0xFC | 3); // 4-byte NAL length
        avcc.push(0xE1); // one SPS
        avcc.extend_from_slice(&(self.sps.len() as u16).to_be_bytes());
        avcc.extend_from_slice(&self.sps);
        avcc.push(1); // one PPS
        avcc.extend_from_slice(&(self.pps.len() as u16).to_be_bytes());
        avcc.extend_from_slice(&self.pps);
        write_box(&mut c, b"avcC", &avcc);

        write_box(buf, b"avc1", &c);
    }

    fn write_mvex(&self, buf: &mut Vec<u8>) {
        let mut mvex_content = Vec::new();

        let mut c = Vec::new();
        full_box(&mut c, 0, 0);
        c.extend_from_slice(&0u32.to_be_bytes()); // fragment duration
        write_box(&mut mvex_content, b"mehd", &c);

        let mut track_ids = vec![VIDEO_TRACK_ID];
        if self.audio.is_some() {
            track_ids.push(AUDIO_TRACK_ID);
        }
        for track_id in track_ids {
            let mut c = Vec::new();
            full_box(&mut c, 0, 0);
            c.extend_from_slice(&track_id.to_be_bytes());
            c.extend_from_slice(&1u32.to_be_bytes()); // default sample description index
            c.extend_from_slice(&0u32.to_be_bytes()); // default sample duration
            c.extend_from_slice(&0u32.to_be_bytes()); // default sample size
            c.extend_from_slice(&0u32.to_be_bytes()); // default sample flags
            write_box(&mut mvex_content, b"trex", &c);
        }

        write_box(buf, b"mvex", &mvex_content);
    }
}

fn write_mp4a(buf: &mut Vec<u8>, audio: &AudioTrack) {
    let mut c = Vec::new();
    c.extend_from_slice(&[0; 6]); // reserved
    c.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    c.extend_from_slice(&[0; 8]); // version, revision, vendor
    c.extend_from_slice(&u16::from(audio.channels).to_be_bytes());
    c.extend_from_slice(&16u16.to_be_bytes()); // sample size
    c.extend_from_slice(&0u16.to_be_bytes()); // compression id
    c.extend_from_slice(&0u16.to_be_bytes()); // packet size
    c.extend_from_slice(&(audio.sample_rate << 16).to_be_bytes());

    let dsi = audio.decoder_specific_info();
    let dsl = dsi.len() as u8;
    let mut esds = Vec::new();
    full_box(&mut esds, 0, 0);
    // ES descriptor
    esds.extend_from_slice(&[0x03, 23 + dsl]);
    esds.extend_from_slice(&0u16.to_be_bytes()); // ES id
    esds.push(0); // flags
    // Decoder config descriptor
    esds.extend_from_slice(&[0x04, 15 + dsl]);
    esds.push(0x40); // MPEG-4 audio
    esds.push(audio.stream_type());
    esds.extend_from_slice(&[0, 0, 0]); // buffer size
    esds.extend_from_slice(&audio.bit_rate.to_be_bytes()); // max bit rate
    esds.extend_from_slice(&audio.bit_rate.to_be_bytes()); // average bit rate
    // Decoder specific info
    esds.extend_from_slice(&[0x05, dsl]);
    esds.extend_from_slice(&dsi);
    // SL config descriptor
    esds.extend_from_slice(&[0x06, 1, 2]);
    write_box(&mut c, b"esds", &esds);

    write_box(buf, b"mp4a", &c);
}

/// One sample of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub size: u32,
    /// Duration in track timescale ticks.
    pub duration: u32,
    pub key_frame: bool,
}

/// Contiguous same-kind samples of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub kind: FrameKind,
    /// Decode time of the first sample in track timescale ticks.
    pub decode_time: u64,
    pub samples: Vec<SampleInfo>,
}

impl Run {
    pub fn new(kind: FrameKind, decode_time: u64) -> Self {
        Self {
            kind,
            decode_time,
            samples: Vec::new(),
        }
    }

    pub fn data_size(&self) -> usize {
        self.samples.iter().map(|s| s.size as usize).sum()
    }

    fn track_id(&self) -> u32 {
        match self.kind {
            FrameKind::Video => VIDEO_TRACK_ID,
            FrameKind::Audio => AUDIO_TRACK_ID,
        }
    }

    /// Write the `trun` box; returns the position of its data offset field
    /// within `buf`.
    fn write_trun(&self, buf: &mut Vec<u8>) -> usize {
        let mut flags = trun_flags::DATA_OFFSET | trun_flags::SAMPLE_DURATION | trun_flags::SAMPLE_SIZE;
        let mut first_sample_flags = None;
        let mut per_sample_flags = false;
        if self.kind == FrameKind::Video {
            if self.samples.iter().skip(1).any(|s| s.key_frame) {
                flags |= trun_flags::SAMPLE_FLAGS;
                per_sample_flags = true;
            } else if self.samples.first().is_some_and(|s| s.key_frame) {
                flags |= trun_flags::FIRST_SAMPLE_FLAGS;
                first_sample_flags = Some(sample_flags::KEY_FRAME);
            }
        }

        let mut c = Vec::new();
        full_box(&mut c, 0, flags);
        c.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes()); // data offset, patched later
        if let Some(first) = first_sample_flags {
            c.extend_from_slice(&first.to_be_bytes());
        }
        for sample in &self.samples {
            c.extend_from_slice(&sample.duration.to_be_bytes());
            c.extend_from_slice(&sample.size.to_be_bytes());
            if per_sample_flags {
                let f = if sample.key_frame {
                    sample_flags::KEY_FRAME
                } else {
                    sample_flags::NON_KEY_FRAME
                };
                c.extend_from_slice(&f.to_be_bytes());
            }
        }

        let data_offset_pos = buf.len() + 16;
        write_box(buf, b"trun", &c);
        data_offset_pos
    }
}

/// Everything in front of a fragment's sample bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sequence_number: u32,
    pub runs: Vec<Run>,
}

impl FragmentHeader {
    /// Sample bytes that follow the header.
    pub fn data_size(&self) -> usize {
        self.runs.iter().map(Run::data_size).sum()
    }

    pub fn sample_count(&self, kind: FrameKind) -> usize {
        self.runs
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.samples.len())
            .sum()
    }

    /// Write `moof` and the `mdat` box header.
    pub fn write(&self, buf: &mut Vec<u8>) {
        // Offset of each run's bytes inside the mdat payload, in run order.
        let mut run_offsets = Vec::with_capacity(self.runs.len());
        let mut running = 0usize;
        for run in &self.runs {
            run_offsets.push(running);
            running += run.data_size();
        }

        let mut moof_content = Vec::new();
        let mut c = Vec::new();
        full_box(&mut c, 0, 0);
        c.extend_from_slice(&self.sequence_number.to_be_bytes());
        write_box(&mut moof_content, b"mfhd", &c);

        // (position in moof content, run index)
        let mut fixups: Vec<(usize, usize)> = Vec::new();
        for kind in [FrameKind::Video, FrameKind::Audio] {
            let runs: Vec<usize> = (0..self.runs.len())
                .filter(|&i| self.runs[i].kind == kind)
                .collect();
            let Some(&first) = runs.first() else {
                continue;
            };

            let mut traf = Vec::new();
            let mut c = Vec::new();
            let mut flags = tfhd_flags::DEFAULT_BASE_IS_MOOF;
            if kind == FrameKind::Video {
                flags |= tfhd_flags::DEFAULT_SAMPLE_FLAGS;
            }
            full_box(&mut c, 0, flags);
            c.extend_from_slice(&self.runs[first].track_id().to_be_bytes());
            if kind == FrameKind::Video {
                c.extend_from_slice(&sample_flags::NON_KEY_FRAME.to_be_bytes());
            }
            write_box(&mut traf, b"tfhd", &c);

            let mut c = Vec::new();
            full_box(&mut c, 1, 0);
            c.extend_from_slice(&self.runs[first].decode_time.to_be_bytes());
            write_box(&mut traf, b"tfdt", &c);

            for &i in &runs {
                let pos = self.runs[i].write_trun(&mut traf);
                // traf box header precedes its content
                fixups.push((moof_content.len() + 8 + pos, i));
            }
            write_box(&mut moof_content, b"traf", &traf);
        }

        let moof_size = 8 + moof_content.len();
        for (pos, i) in fixups {
            let data_offset = (moof_size + 8 + run_offsets[i]) as u32;
            moof_content[pos..pos + 4].copy_from_slice(&data_offset.to_be_bytes());
        }
        write_box(buf, b"moof", &moof_content);

        // mdat header only; the sample bytes are streamed after it
        buf.extend_from_slice(&((8 + running) as u32).to_be_bytes());
        buf.extend_from_slice(b"mdat");
    }
}

// ============================================================================
// Box parsing
// ============================================================================

/// Location of a box inside a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    pub offset: usize,
    pub size: usize,
    pub header_size: usize,
}

impl BoxHeader {
    /// Content bytes (after the header) within the given data slice.
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset + self.header_size;
        let end = (self.offset + self.size).min(data.len());
        if start >= end {
            &[]
        } else {
            &data[start..end]
        }
    }
}

/// Top-level boxes in a byte slice. A box whose size runs past the end of
/// the slice is reported with its declared size.
pub fn iter_boxes(data: &[u8]) -> Vec<BoxHeader> {
    let mut boxes = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let size = be_u32(data, offset) as usize;
        let box_type = [data[offset + 4], data[offset + 5], data[offset + 6], data[offset + 7]];
        if size < 8 {
            break;
        }
        boxes.push(BoxHeader {
            box_type,
            offset,
            size,
            header_size: 8,
        });
        offset += size;
    }
    boxes
}

/// First top-level box of a type.
pub fn find_box(data: &[u8], box_type: &[u8; 4]) -> Option<BoxHeader> {
    iter_boxes(data).into_iter().find(|b| &b.box_type == box_type)
}

/// All top-level boxes of a type.
pub fn find_boxes(data: &[u8], box_type: &[u8; 4]) -> Vec<BoxHeader> {
    iter_boxes(data)
        .into_iter()
        .filter(|b| &b.box_type == box_type)
        .collect()
}

/// Content of the box at the end of a path of nested boxes.
pub fn find_box_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let Some((first, rest)) = path.split_first() else {
        return Some(data);
    };
    let content = find_box(data, first)?.content(data);
    find_box_path(content, rest)
}

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn be_u64(data: &[u8], offset: usize) -> u64 {
    (u64::from(be_u32(data, offset)) << 32) | u64::from(be_u32(data, offset + 4))
}

fn ensure_len(data: &[u8], len: usize, what: &str) -> anyhow::Result<()> {
    if data.len() < len {
        anyhow::bail!("{} too short: {} bytes", what, data.len());
    }
    Ok(())
}

/// Audio track found in a movie header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAudioTrack {
    pub timescale: u32,
    pub channels: u16,
    pub sample_rate: u32,
    pub stream_type: u8,
    pub bit_rate: u32,
    pub decoder_specific_info: Vec<u8>,
}

/// Information recovered from a movie header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMovie {
    pub major_brand: [u8; 4],
    pub timescale: u32,
    pub video_timescale: u32,
    pub width: u16,
    pub height: u16,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub audio: Option<ParsedAudioTrack>,
    /// Track ids with a `trex` entry.
    pub trex_track_ids: Vec<u32>,
}

/// Parse `ftyp` + `moov`.
pub fn parse_movie_header(data: &[u8]) -> anyhow::Result<ParsedMovie> {
    let ftyp = find_box(data, b"ftyp").ok_or_else(|| anyhow::anyhow!("Could not find ftyp box"))?;
    let ftyp = ftyp.content(data);
    ensure_len(ftyp, 8, "ftyp")?;
    let major_brand = [ftyp[0], ftyp[1], ftyp[2], ftyp[3]];

    let moov = find_box_path(data, &[b"moov"]).ok_or_else(|| anyhow::anyhow!("Could not find moov box"))?;
    let mvhd = find_box_path(moov, &[b"mvhd"]).ok_or_else(|| anyhow::anyhow!("Could not find mvhd box"))?;
    ensure_len(mvhd, 16, "mvhd")?;
    let timescale = be_u32(mvhd, 12);

    let mut video = None;
    let mut audio = None;
    for trak in find_boxes(moov, b"trak") {
        let trak = trak.content(moov);
        let mdhd = find_box_path(trak, &[b"mdia", b"mdhd"])
            .ok_or_else(|| anyhow::anyhow!("Could not find mdhd box"))?;
        ensure_len(mdhd, 16, "mdhd")?;
        let track_timescale = be_u32(mdhd, 12);

        let stsd = find_box_path(trak, &[b"mdia", b"minf", b"stbl", b"stsd"])
            .ok_or_else(|| anyhow::anyhow!("Could not find stsd box"))?;
        ensure_len(stsd, 8, "stsd")?;
        let entries = &stsd[8..];

        if let Some(avc1) = find_box(entries, b"avc1") {
            video = Some(parse_avc1(avc1.content(entries), track_timescale)?);
        } else if let Some(mp4a) = find_box(entries, b"mp4a") {
            audio = Some(parse_mp4a(mp4a.content(entries), track_timescale)?);
        } else {
            anyhow::bail!("Unknown sample entry in stsd");
        }
    }
    let (video_timescale, width, height, sps, pps) =
        video.ok_or_else(|| anyhow::anyhow!("Movie header has no video track"))?;

    let mvex = find_box_path(moov, &[b"mvex"]).ok_or_else(|| anyhow::anyhow!("Could not find mvex box"))?;
    let mut trex_track_ids = Vec::new();
    for trex in find_boxes(mvex, b"trex") {
        let trex = trex.content(mvex);
        ensure_len(trex, 8, "trex")?;
        trex_track_ids.push(be_u32(trex, 4));
    }

    Ok(ParsedMovie {
        major_brand,
        timescale,
        video_timescale,
        width,
        height,
        sps,
        pps,
        audio,
        trex_track_ids,
    })
}

type ParsedVideo = (u32, u16, u16, Vec<u8>, Vec<u8>);

fn parse_avc1(avc1: &[u8], timescale: u32) -> anyhow::Result<ParsedVideo> {
    // 78 bytes of visual sample entry fields precede the child boxes.
    ensure_len(avc1, 78, "avc1")?;
    let width = be_u16(avc1, 24);
    let height = be_u16(avc1, 26);

    let children = &avc1[78..];
    let avcc = find_box(children, b"avcC").ok_or_else(|| anyhow::anyhow!("Could not find avcC box"))?;
    let avcc = avcc.content(children);
    ensure_len(avcc, 8, "avcC")?;
    let sps_len = be_u16(avcc, 6) as usize;
    ensure_len(avcc, 8 + sps_len + 3, "avcC")?;
    let sps = avcc[8..8 + sps_len].to_vec();
    let pps_at = 8 + sps_len + 1;
    let pps_len = be_u16(avcc, pps_at) as usize;
    ensure_len(avcc, pps_at + 2 + pps_len, "avcC")?;
    let pps = avcc[pps_at + 2..pps_at + 2 + pps_len].to_vec();

    Ok((timescale, width, height, sps, pps))
}

fn parse_mp4a(mp4a: &[u8], timescale: u32) -> anyhow::Result<ParsedAudioTrack> {
    // 28 bytes of audio sample entry fields precede the child boxes.
    ensure_len(mp4a, 28, "mp4a")?;
    let channels = be_u16(mp4a, 16);
    let sample_rate = be_u32(mp4a, 24) >> 16;

    let children = &mp4a[28..];
    let esds = find_box(children, b"esds").ok_or_else(|| anyhow::anyhow!("Could not find esds box"))?;
    let esds = esds.content(children);
    // version/flags, ES descriptor header, ES id, flags, decoder config header
    ensure_len(esds, 4 + 2 + 3 + 2 + 13 + 2, "esds")?;
    if esds[4] != 0x03 || esds[9] != 0x04 {
        anyhow::bail!("Unexpected esds descriptor layout");
    }
    let stream_type = esds[12];
    let bit_rate = be_u32(esds, 20);
    if esds[24] != 0x05 {
        anyhow::bail!("Missing decoder specific info");
    }
    let dsl = esds[25] as usize;
    ensure_len(esds, 26 + dsl, "esds")?;
    let decoder_specific_info = esds[26..26 + dsl].to_vec();

    Ok(ParsedAudioTrack {
        timescale,
        channels,
        sample_rate,
        stream_type,
        bit_rate,
        decoder_specific_info,
    })
}

/// A sample entry from a `trun` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    pub duration: u32,
    pub size: u32,
    /// Effective flags after applying first-sample and default flags.
    pub flags: u32,
    pub composition_offset: i32,
}

impl SampleEntry {
    pub fn is_key_frame(&self) -> bool {
        self.flags & 0x0001_0000 == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRun {
    /// Offset of the run's bytes from the start of the `moof` box.
    pub data_offset: u32,
    pub samples: Vec<SampleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTrackFragment {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub runs: Vec<ParsedRun>,
}

/// Information recovered from a fragment (`moof` + `mdat`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFragment {
    pub sequence_number: u32,
    pub moof_size: usize,
    /// Declared `mdat` size including its header.
    pub mdat_size: usize,
    pub tracks: Vec<ParsedTrackFragment>,
}

impl ParsedFragment {
    pub fn track(&self, track_id: u32) -> Option<&ParsedTrackFragment> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }
}

/// Parse a fragment. `data` starts at the `moof` box; the `mdat` payload may
/// be absent or truncated.
pub fn parse_fragment(data: &[u8]) -> anyhow::Result<ParsedFragment> {
    let moof_header = find_box(data, b"moof").ok_or_else(|| anyhow::anyhow!("Could not find moof box"))?;
    let moof = moof_header.content(data);

    let mfhd = find_box_path(moof, &[b"mfhd"]).ok_or_else(|| anyhow::anyhow!("Could not find mfhd box"))?;
    ensure_len(mfhd, 8, "mfhd")?;
    let sequence_number = be_u32(mfhd, 4);

    let mut tracks = Vec::new();
    for traf in find_boxes(moof, b"traf") {
        tracks.push(parse_traf(traf.content(moof))?);
    }

    let mdat = find_box(data, b"mdat").ok_or_else(|| anyhow::anyhow!("Could not find mdat box"))?;

    Ok(ParsedFragment {
        sequence_number,
        moof_size: moof_header.size,
        mdat_size: mdat.size,
        tracks,
    })
}

fn parse_traf(traf: &[u8]) -> anyhow::Result<ParsedTrackFragment> {
    let tfhd = find_box_path(traf, &[b"tfhd"]).ok_or_else(|| anyhow::anyhow!("Could not find tfhd box"))?;
    ensure_len(tfhd, 8, "tfhd")?;
    let tfhd_flags = be_u32(tfhd, 0) & 0x00FF_FFFF;
    let track_id = be_u32(tfhd, 4);
    let mut offset = 8;
    for (bit, len) in [(0x01, 8), (0x02, 4), (0x08, 4), (0x10, 4)] {
        if tfhd_flags & bit != 0 {
            offset += len;
        }
    }
    let default_flags = if tfhd_flags & tfhd_flags::DEFAULT_SAMPLE_FLAGS != 0 {
        ensure_len(tfhd, offset + 4, "tfhd")?;
        be_u32(tfhd, offset)
    } else {
        0
    };

    let tfdt = find_box_path(traf, &[b"tfdt"]).ok_or_else(|| anyhow::anyhow!("Could not find tfdt box"))?;
    ensure_len(tfdt, 8, "tfdt")?;
    let base_decode_time = if tfdt[0] == 1 {
        ensure_len(tfdt, 12, "tfdt")?;
        be_u64(tfdt, 4)
    } else {
        u64::from(be_u32(tfdt, 4))
    };

    let mut runs = Vec::new();
    for trun in find_boxes(traf, b"trun") {
        runs.push(parse_trun(trun.content(traf), default_flags)?);
    }

    Ok(ParsedTrackFragment {
        track_id,
        base_decode_time,
        runs,
    })
}

fn parse_trun(trun: &[u8], default_flags: u32) -> anyhow::Result<ParsedRun> {
    ensure_len(trun, 8, "trun")?;
    let flags = be_u32(trun, 0) & 0x00FF_FFFF;
    let sample_count = be_u32(trun, 4) as usize;
    let mut offset = 8;

    let mut data_offset = 0;
    if flags & trun_flags::DATA_OFFSET != 0 {
        ensure_len(trun, offset + 4, "trun")?;
        data_offset = be_u32(trun, offset);
        offset += 4;
    }
    let mut first_sample_flags = None;
    if flags & trun_flags::FIRST_SAMPLE_FLAGS != 0 {
        ensure_len(trun, offset + 4, "trun")?;
        first_sample_flags = Some(be_u32(trun, offset));
        offset += 4;
    }

    let fields = [
        trun_flags::SAMPLE_DURATION,
        trun_flags::SAMPLE_SIZE,
        trun_flags::SAMPLE_FLAGS,
        trun_flags::SAMPLE_COMPOSITION_OFFSET,
    ];
    let entry_len = fields.iter().filter(|&&f| flags & f != 0).count() * 4;
    ensure_len(trun, offset + sample_count * entry_len, "trun")?;

    let mut samples = Vec::with_capacity(sample_count);
    for i in 0..sample_count {
        let mut read = |bit: u32| {
            if flags & bit != 0 {
                let v = be_u32(trun, offset);
                offset += 4;
                Some(v)
            } else {
                None
            }
        };
        let duration = read(trun_flags::SAMPLE_DURATION).unwrap_or(0);
        let size = read(trun_flags::SAMPLE_SIZE).unwrap_or(0);
        let sample_flags = read(trun_flags::SAMPLE_FLAGS);
        let composition_offset = read(trun_flags::SAMPLE_COMPOSITION_OFFSET).unwrap_or(0) as i32;

        let flags = match (sample_flags, first_sample_flags) {
            (Some(f), _) => f,
            (None, Some(first)) if i == 0 => first,
            _ => default_flags,
        };
        samples.push(SampleEntry {
            duration,
            size,
            flags,
            composition_offset,
        });
    }

    Ok(ParsedRun {
        data_offset,
        samples,
    })
}

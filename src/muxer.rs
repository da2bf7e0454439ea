//! Fragment assembly from the main queue.
//!
//! The first chunk of a stream is the movie header. After that, every
//! complete fragment (a fragment-start key frame up to, but excluding, the
//! next one) is emitted as a fragment header followed by the queued sample
//! bytes, sliced into chunks of bounded size.

use bytes::{Bytes, BytesMut};

use crate::config::AudioCodec;
use crate::fmp4::{FragmentHeader, Run, SampleInfo};
use crate::frame::FrameKind;
use crate::queue::ScanCursor;
use crate::state::RecorderState;
use crate::sync::Pipeline;

/// Duration of the last video sample of a fragment, in video ticks
/// (one frame at the maximum frame rate).
const DEFAULT_VIDEO_DURATION: u32 = 100;

const NS_PER_SEC: u128 = 1_000_000_000;

/// One slice of the recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedChunk {
    /// 0 for the movie header.
    pub fragment_number: u32,
    /// Starts at 1 in every fragment.
    pub chunk_number: u32,
    pub is_last: bool,
    /// Bytes of the whole fragment, on its first chunk only.
    pub total_size: Option<usize>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPoll {
    Ready(MuxedChunk),
    /// Parameter sets or a complete fragment are not queued yet.
    NotReady,
}

/// Per-stream fragmenting state.
#[derive(Debug)]
pub struct FragmentMuxer {
    fragment_number: u32,
    chunk_number: u32,
    /// Sample bytes of the current fragment not yet emitted.
    fragment_remaining: usize,
    first_fragment_time: u64,
    cursor: ScanCursor,
}

impl Default for FragmentMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentMuxer {
    pub fn new() -> Self {
        Self {
            fragment_number: 0,
            chunk_number: 1,
            fragment_remaining: 0,
            first_fragment_time: 0,
            cursor: ScanCursor::default(),
        }
    }

    pub fn fragment_number(&self) -> u32 {
        self.fragment_number
    }

    pub fn chunk_number(&self) -> u32 {
        self.chunk_number
    }

    /// Produce the next chunk of at most `max_size` bytes. A fragment header
    /// is never split, so a first chunk may exceed `max_size`.
    pub fn next_chunk(&mut self, pipeline: &Pipeline, max_size: usize) -> ChunkPoll {
        // A peer asking for data implies an active trigger.
        pipeline.main().transition(RecorderState::Monitoring, RecorderState::Recording);

        let poll = if self.fragment_number == 0 {
            self.movie_header(pipeline)
        } else {
            self.fragment_chunk(pipeline, max_size)
        };
        if poll == ChunkPoll::NotReady {
            tracing::debug!("Fragment {} not ready", self.fragment_number);
        }
        poll
    }

    /// Drop the unread rest of a partially emitted frame.
    pub fn discard_partial(&mut self, pipeline: &Pipeline) {
        pipeline.main().skip_partial(&mut self.cursor);
        self.fragment_remaining = 0;
    }

    fn movie_header(&mut self, pipeline: &Pipeline) -> ChunkPoll {
        let Some(config) = pipeline.movie_config() else {
            return ChunkPoll::NotReady;
        };

        // Everything in front of the first fragment start is dropped.
        let main = pipeline.main();
        let mut cursor = main.begin_scan();
        loop {
            let before = cursor;
            let Some(header) = main.scan_frame(&mut cursor) else {
                return ChunkPoll::NotReady;
            };
            if header.sample_type.is_fragment_start() {
                main.commit(&before);
                self.cursor = before;
                self.first_fragment_time = header.sample_time;
                break;
            }
        }

        let mut buf = Vec::new();
        config.write(&mut buf);
        tracing::info!(
            "movie header: {}x{} H264{} ({} bytes)",
            config.width,
            config.height,
            if config.audio.is_some() { " + AAC" } else { "" },
            buf.len()
        );

        let chunk = MuxedChunk {
            fragment_number: 0,
            chunk_number: 1,
            is_last: true,
            total_size: Some(buf.len()),
            bytes: Bytes::from(buf),
        };
        self.fragment_number = 1;
        self.chunk_number = 1;
        ChunkPoll::Ready(chunk)
    }

    fn fragment_chunk(&mut self, pipeline: &Pipeline, max_size: usize) -> ChunkPoll {
        let mut out = BytesMut::new();
        let mut total_size = None;

        if self.fragment_remaining == 0 {
            let Some(header) = self.scan_fragment(pipeline) else {
                return ChunkPoll::NotReady;
            };
            let mut buf = Vec::new();
            header.write(&mut buf);
            self.fragment_remaining = header.data_size();
            total_size = Some(buf.len() + self.fragment_remaining);
            out.extend_from_slice(&buf);
        }

        let main = pipeline.main();
        let skip_audio = !pipeline.audio_enabled();
        while self.fragment_remaining > 0 && out.len() < max_size {
            let room = (max_size - out.len()).min(self.fragment_remaining);
            let n = main.read_chunk(&mut self.cursor, &mut out, room, skip_audio);
            assert!(n > 0, "fragment data missing from the main queue");
            if self.cursor.remaining() == 0 {
                main.commit(&self.cursor);
            }
            self.fragment_remaining -= n;
        }

        let is_last = self.fragment_remaining == 0;
        let chunk = MuxedChunk {
            fragment_number: self.fragment_number,
            chunk_number: self.chunk_number,
            is_last,
            total_size,
            bytes: out.freeze(),
        };
        if is_last {
            self.fragment_number += 1;
            self.chunk_number = 1;
        } else {
            self.chunk_number += 1;
        }
        ChunkPoll::Ready(chunk)
    }

    /// Build the sample tables of the next complete fragment.
    fn scan_fragment(&mut self, pipeline: &Pipeline) -> Option<FragmentHeader> {
        let main = pipeline.main();
        let skip_audio = !pipeline.audio_enabled();
        let audio_duration = default_audio_duration(pipeline.audio_codec());

        let mut cursor = self.cursor;
        let mut runs: Vec<Run> = Vec::new();
        // (run, sample, timestamp) of the latest sample per kind
        let mut latest: [Option<(usize, usize, u64)>; 2] = [None, None];
        let mut video_count = 0usize;
        let mut audio_count = 0usize;
        let mut restart = false;

        loop {
            let header = main.scan_frame(&mut cursor)?;
            let kind = header.sample_type.kind();
            let (frequency, default_duration, slot) = match kind {
                FrameKind::Video => {
                    if header.sample_type.is_fragment_start() && video_count > 0 {
                        break;
                    }
                    restart |= header.sample_type.is_restart();
                    video_count += 1;
                    (pipeline.video_timescale(), DEFAULT_VIDEO_DURATION, 0)
                }
                // Skipped audio does not split the video run around it.
                FrameKind::Audio if skip_audio => continue,
                FrameKind::Audio => {
                    audio_count += 1;
                    (pipeline.audio_timescale(), audio_duration, 1)
                }
            };

            let timestamp = timestamp(header.sample_time, self.first_fragment_time, frequency);
            if let Some((run, sample, previous)) = latest[slot] {
                let delta = timestamp.saturating_sub(previous);
                runs[run].samples[sample].duration = u32::try_from(delta).unwrap_or(u32::MAX);
            }
            if runs.last().map(|r| r.kind) != Some(kind) {
                runs.push(Run::new(kind, timestamp));
            }
            let run = runs.len() - 1;
            runs[run].samples.push(SampleInfo {
                size: header.size,
                duration: default_duration,
                key_frame: header.sample_type.is_key_frame(),
            });
            latest[slot] = Some((run, runs[run].samples.len() - 1, timestamp));
        }

        if restart {
            // Fragments lost to the overflow show up as a sequence gap.
            self.fragment_number += 1;
        }
        let header = FragmentHeader {
            sequence_number: self.fragment_number,
            runs,
        };
        tracing::info!(
            "fragment {} @ {} ({} H264, {} AAC, {} runs, {} bytes)",
            header.sequence_number,
            header.runs.first().map_or(0, |r| r.decode_time),
            video_count,
            audio_count,
            header.runs.len(),
            header.data_size()
        );
        Some(header)
    }
}

fn default_audio_duration(codec: AudioCodec) -> u32 {
    codec.frame_samples()
}

/// Sample time (ns) in ticks of `frequency`, relative to `origin`.
fn timestamp(sample_time: u64, origin: u64, frequency: u32) -> u64 {
    let elapsed = u128::from(sample_time.saturating_sub(origin));
    let ticks = (elapsed * u128::from(frequency) + NS_PER_SEC / 2) / NS_PER_SEC;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

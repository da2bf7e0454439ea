//! Synthetic camera recorder: drives the recording pipeline with generated
//! H.264/AAC frames and writes every recorded event to an .mp4 file.
//!
//! Usage:
//!   synthetic-recorder [options]
//!
//! Options:
//!   --output-dir <dir>      Output directory (default: .)
//!   --prefix <name>         Output file prefix (default: event)
//!   --resolution <WxH>      Video resolution (default: 1280x720)
//!   --fps <n>               Frame rate (default: 30)
//!   --fragment-ms <ms>      Fragment duration (default: 4000)
//!   --event-every <secs>    Seconds between motion events (default: 10)
//!   --event-length <secs>   Seconds each event is streamed (default: 6)
//!   --duration <secs>       Stop after N seconds (default: Ctrl+C)
//!   --no-audio              Leave audio out of the recordings

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camrec::{
    AudioStreamParams, CaptureDriver, CloseReason, ConfigStore, DataChunk, DataType, Frame, FrameSink, MemoryStore,
    RecorderBuilder, RecordingParams, StreamHandle, StreamKind, Transport, VideoStreamParams,
};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Args {
    output_dir: PathBuf,
    prefix: String,
    width: u16,
    height: u16,
    fps: u8,
    fragment_ms: u32,
    event_every: u64,
    event_length: u64,
    duration: Option<u64>,
    audio: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        output_dir: PathBuf::from("."),
        prefix: "event".to_string(),
        width: 1280,
        height: 720,
        fps: 30,
        fragment_ms: 4000,
        event_every: 10,
        event_length: 6,
        duration: None,
        audio: true,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--output-dir" if i + 1 < args.len() => {
                result.output_dir = PathBuf::from(&args[i + 1]);
                i += 2;
            }
            "--prefix" if i + 1 < args.len() => {
                result.prefix = args[i + 1].clone();
                i += 2;
            }
            "--resolution" if i + 1 < args.len() => {
                if let Some((w, h)) = args[i + 1].split_once('x') {
                    result.width = w.parse().unwrap_or(result.width);
                    result.height = h.parse().unwrap_or(result.height);
                }
                i += 2;
            }
            "--fps" if i + 1 < args.len() => {
                result.fps = args[i + 1].parse().unwrap_or(result.fps);
                i += 2;
            }
            "--fragment-ms" if i + 1 < args.len() => {
                result.fragment_ms = args[i + 1].parse().unwrap_or(result.fragment_ms);
                i += 2;
            }
            "--event-every" if i + 1 < args.len() => {
                result.event_every = args[i + 1].parse().unwrap_or(result.event_every);
                i += 2;
            }
            "--event-length" if i + 1 < args.len() => {
                result.event_length = args[i + 1].parse().unwrap_or(result.event_length);
                i += 2;
            }
            "--duration" if i + 1 < args.len() => {
                result.duration = args[i + 1].parse().ok();
                i += 2;
            }
            "--no-audio" => {
                result.audio = false;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    result
}

fn print_usage() {
    println!("Synthetic Recorder - records generated camera events as fragmented MP4");
    println!();
    println!("Usage: synthetic-recorder [options]");
    println!();
    println!("Options:");
    println!("  --output-dir <dir>      Output directory (default: .)");
    println!("  --prefix <name>         Output file prefix (default: event)");
    println!("  --resolution <WxH>      Video resolution (default: 1280x720)");
    println!("  --fps <n>               Frame rate (default: 30)");
    println!("  --fragment-ms <ms>      Fragment duration (default: 4000)");
    println!("  --event-every <secs>    Seconds between motion events (default: 10)");
    println!("  --event-length <secs>   Seconds each event is streamed (default: 6)");
    println!("  --duration <secs>       Stop after N seconds (default: Ctrl+C)");
    println!("  --no-audio              Leave audio out of the recordings");
}

// ---------------------------------------------------------------------------
// Synthetic capture
// ---------------------------------------------------------------------------

const SPS: [u8; 10] = [0x67, 0x4D, 0x00, 0x28, 0xE9, 0x00, 0xA0, 0x0B, 0x74, 0x20];
const PPS: [u8; 4] = [0x68, 0xEE, 0x3C, 0x80];

struct CaptureStream {
    cancel: CancellationToken,
    key_frame: Arc<AtomicBool>,
}

/// Generates encoded-looking frames on tokio timers. Both streams share one
/// clock origin.
struct SyntheticDriver {
    origin: Instant,
    next_handle: u64,
    streams: HashMap<StreamHandle, CaptureStream>,
}

impl SyntheticDriver {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            next_handle: 0,
            streams: HashMap::new(),
        }
    }

    fn register(&mut self) -> (StreamHandle, CancellationToken, Arc<AtomicBool>) {
        self.next_handle += 1;
        let handle = StreamHandle(self.next_handle);
        let cancel = CancellationToken::new();
        let key_frame = Arc::new(AtomicBool::new(false));
        self.streams.insert(
            handle,
            CaptureStream {
                cancel: cancel.clone(),
                key_frame: key_frame.clone(),
            },
        );
        (handle, cancel, key_frame)
    }
}

impl CaptureDriver for SyntheticDriver {
    fn start_video(&mut self, params: &VideoStreamParams, sink: FrameSink) -> Result<StreamHandle> {
        let (handle, cancel, key_frame) = self.register();
        let origin = self.origin;
        let frame_time = Duration::from_secs(1) / u32::from(params.max_frame_rate.max(1));
        let i_frame_interval = Duration::from_millis(u64::from(params.i_frame_interval_ms));
        let frame_size = (params.bit_rate / 8 / u32::from(params.max_frame_rate.max(1))).max(16) as usize;
        tracing::info!(
            "Synthetic video {}x{} @ {} fps, {} bit/s",
            params.width,
            params.height,
            params.max_frame_rate,
            params.bit_rate
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_time);
            let mut last_key: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    now = ticker.tick() => {
                        let t = now.duration_since(origin).as_nanos() as u64;
                        let key = key_frame.swap(false, Ordering::Relaxed)
                            || last_key.map_or(true, |k| now.duration_since(k) >= i_frame_interval);
                        if key {
                            last_key = Some(now);
                            sink.push(Frame::video(t, SPS.to_vec()));
                            sink.push(Frame::video(t, PPS.to_vec()));
                        }
                        let size = if key { frame_size * 4 } else { frame_size };
                        sink.push(Frame::video(t, slice(key, size)));
                    }
                }
            }
        });
        Ok(handle)
    }

    fn start_audio(&mut self, params: &AudioStreamParams, sink: FrameSink) -> Result<StreamHandle> {
        let (handle, cancel, _) = self.register();
        let origin = self.origin;
        let samples = params.codec.frame_samples();
        let frame_time = Duration::from_secs_f64(f64::from(samples) / f64::from(params.sample_rate));
        let frame_size = ((params.bit_rate.max(32_000) as f64 * frame_time.as_secs_f64()) / 8.0) as usize;
        tracing::info!("Synthetic audio {:?} @ {} Hz", params.codec, params.sample_rate);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_time);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    now = ticker.tick() => {
                        let t = now.duration_since(origin).as_nanos() as u64;
                        let mut payload = vec![0u8; frame_size.max(4)];
                        rand::rng().fill(&mut payload[..]);
                        sink.push(Frame::audio(t, payload));
                    }
                }
            }
        });
        Ok(handle)
    }

    fn stop(&mut self, handle: StreamHandle) {
        if let Some(stream) = self.streams.remove(&handle) {
            stream.cancel.cancel();
        }
    }

    fn request_key_frame(&mut self, handle: StreamHandle) {
        if let Some(stream) = self.streams.get(&handle) {
            stream.key_frame.store(true, Ordering::Relaxed);
        }
    }
}

/// One slice NAL unit of `size` bytes with random payload.
fn slice(key: bool, size: usize) -> Vec<u8> {
    let mut nal = vec![0u8; size.max(2)];
    rand::rng().fill(&mut nal[1..]);
    nal[0] = if key { 0x65 } else { 0x41 };
    nal
}

// ---------------------------------------------------------------------------
// File transport
// ---------------------------------------------------------------------------

/// Writes each recording stream to its own file.
struct FileTransport {
    dir: PathBuf,
    prefix: String,
    count: usize,
    file: Option<(PathBuf, tokio::fs::File)>,
    next_chunk: Option<(u32, u32)>,
}

impl FileTransport {
    fn new(dir: PathBuf, prefix: String) -> Self {
        Self {
            dir,
            prefix,
            count: 0,
            file: None,
            next_chunk: None,
        }
    }
}

impl Transport for FileTransport {
    async fn send(&mut self, chunk: DataChunk) -> Result<()> {
        if chunk.data_type == DataType::MediaInitialization {
            self.count += 1;
            let path = self.dir.join(format!("{}_{:03}.mp4", self.prefix, self.count));
            let file = tokio::fs::File::create(&path).await?;
            tracing::info!("Recording event to {}", path.display());
            self.file = Some((path, file));
        } else if let Some((data, chunk_number)) = self.next_chunk {
            // Skipped fragments after an overflow are allowed, chunks are not.
            if chunk.data_sequence_number < data
                || (chunk.chunk_sequence_number != 1 && chunk_number != chunk.chunk_sequence_number)
            {
                anyhow::bail!(
                    "Out of order chunk {}.{}, expected {}.{}",
                    chunk.data_sequence_number,
                    chunk.chunk_sequence_number,
                    data,
                    chunk_number
                );
            }
        }
        self.next_chunk = Some(if chunk.is_last_chunk {
            (chunk.data_sequence_number + 1, 1)
        } else {
            (chunk.data_sequence_number, chunk.chunk_sequence_number + 1)
        });

        let Some((_, file)) = self.file.as_mut() else {
            anyhow::bail!("Fragment received before the movie header");
        };
        file.write_all(&chunk.data).await?;
        if chunk.is_last_chunk {
            file.flush().await?;
        }
        Ok(())
    }

    fn cancel(&mut self, reason: CloseReason) {
        if let Some((path, _)) = self.file.take() {
            tracing::warn!("Recording {} cancelled: {}", path.display(), reason);
        }
        self.next_chunk = None;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camrec=info".parse()?)
                .add_directive("synthetic_recorder=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args();
    tokio::fs::create_dir_all(&args.output_dir).await?;

    let mut params = RecordingParams::default();
    params.video.width = args.width;
    params.video.height = args.height;
    params.video.max_frame_rate = args.fps;
    params.fragment_duration_ms = args.fragment_ms;
    params.validate()?;

    println!();
    println!("========================================");
    println!("Synthetic Recorder");
    println!("========================================");
    println!("Video:      {}x{} @ {} fps", args.width, args.height, args.fps);
    println!("Audio:      {}", if args.audio { "AAC-LC 16 kHz" } else { "off" });
    println!("Fragments:  {} ms", args.fragment_ms);
    println!("Events:     every {} s, {} s long", args.event_every, args.event_length);
    println!("Output:     {}", args.output_dir.display());
    println!("========================================");
    println!();

    let mut store = MemoryStore::with_config(&params);
    store.set_audio_enabled(args.audio)?;
    let (recorder, receivers) = RecorderBuilder::new()
        .frame_channel_depth(64)
        .build(SyntheticDriver::new(), store);

    let cancel = CancellationToken::new();
    let transport = FileTransport::new(args.output_dir.clone(), args.prefix.clone());
    let (handle, task) = camrec::spawn(recorder, receivers, transport, cancel.clone());

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, stopping");
            ctrl_c_cancel.cancel();
        }
    });
    if let Some(secs) = args.duration {
        let duration_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            duration_cancel.cancel();
        });
    }

    let mut events = tokio::time::interval_at(
        Instant::now() + Duration::from_secs(args.event_every),
        Duration::from_secs(args.event_every.max(args.event_length + 1)),
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = events.tick() => {}
        }
        match handle.trigger().await {
            Ok(true) => tracing::info!("Motion detected"),
            Ok(false) => continue,
            Err(e) => {
                tracing::error!("Trigger failed: {}", e);
                break;
            }
        }
        if let Err(reason) = handle.open_stream(StreamKind::CameraRecording).await {
            tracing::warn!("Recording stream rejected: {}", reason);
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(args.event_length)) => {}
        }
        handle.close_stream(CloseReason::Normal).await?;
        tracing::info!("Event finished, resolution {}", handle.resolution().await?);
    }

    cancel.cancel();
    let _ = task.await;
    Ok(())
}

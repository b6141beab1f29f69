//! Capture session: decode loop and session controller
//!
//! Architecture:
//! ```text
//! generator (child process)
//!       │ raw LE samples on stdout
//!       ▼
//! decode thread ("cavatina-decode")
//!       │ read_exact chunk → normalize to [0, 1]
//!       ▼
//! FrameProducer.try_publish()      (lock-free, never blocks)
//!       │
//!       ▼
//! FrameConsumer ◀── CaptureSession::try_pop() ◀── renderer tick
//! ```
//!
//! The session controller brackets the generator process, the pipe, the
//! decode thread, and the ring as one unit: they are created together in
//! `start` and torn down together in `stop`. The decode loop ending on its
//! own (generator exited, pipe error) flips `is_running` to false; `stop`
//! afterwards is still required and still idempotent.

use std::io::Read;
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::config::{BitFormat, CaptureConfig, ConfigError, FrameLayout};
use crate::generator::{ConfigArtifact, Generator, SpawnError};
use crate::ring::{frame_ring_pair, FrameConsumer, FrameProducer, PopResult};

/// Error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("a capture session is already running")]
    AlreadyRunning,

    #[error("output buffer holds {got} values but frames carry {needed} bars")]
    OutputTooSmall { needed: usize, got: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("failed to spawn decode thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Runtime counters from the decode loop.
///
/// `frames_dropped` counts decoded frames the ring rejected because the
/// consumer was not keeping up; they are included in `frames_decoded`.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_read: AtomicU64,
}

/// Everything that exists only while the session is running
struct ActiveCapture {
    generator: Arc<Generator>,
    artifact: ConfigArtifact,
    consumer: FrameConsumer,
    decode_thread: JoinHandle<()>,
    bars: usize,
}

/// A capture session: one generator process feeding one frame ring.
///
/// `start` and `stop` bracket the whole pipeline. `try_pop` never blocks
/// and never allocates, so it is safe to call from a render loop.
pub struct CaptureSession {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    active: Option<ActiveCapture>,
}

impl CaptureSession {
    /// Create a stopped session with the default configuration
    pub fn new() -> Self {
        Self::with_config(CaptureConfig::default())
    }

    /// Create a stopped session with a custom configuration
    pub fn with_config(config: CaptureConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
            active: None,
        }
    }

    /// Start the generator and the decode thread.
    ///
    /// Fails with [`CaptureError::AlreadyRunning`] if the session is active;
    /// the running session is not disturbed. Any startup failure unwinds
    /// fully: the child is terminated, the config artifact deleted, and the
    /// session stays stopped.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        let layout = self.config.layout();
        let artifact = ConfigArtifact::write(layout.bars, layout.format)?;
        let (generator, pipe) = Generator::spawn(&self.config.program, artifact.path())?;
        let generator = Arc::new(generator);
        let (producer, consumer) = frame_ring_pair(self.config.ring_frames, layout.bars);

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let loop_generator = Arc::clone(&generator);
        let decode_thread = match thread::Builder::new()
            .name("cavatina-decode".to_string())
            .spawn(move || run_decode_loop(pipe, layout, producer, loop_generator, running, stats))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::Release);
                generator.shutdown();
                return Err(CaptureError::Thread(err));
            }
        };

        info!(
            "capture started: {} bars, {} ({} bytes/frame), generator `{}` pid {}",
            layout.bars,
            layout.format,
            layout.chunk_len(),
            self.config.program,
            generator.pid()
        );

        self.active = Some(ActiveCapture {
            generator,
            artifact,
            consumer,
            decode_thread,
            bars: layout.bars,
        });
        Ok(())
    }

    /// Stop the session, blocking until the generator is reaped and the
    /// decode thread has exited. Idempotent: stopping a stopped session is
    /// a no-op, including after the decode loop ended on its own.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveCapture {
            generator,
            artifact,
            consumer,
            decode_thread,
            ..
        } = active;

        self.running.store(false, Ordering::Release);
        // Terminating the writer closes the pipe and unblocks the decode
        // read; only then can the join complete.
        generator.shutdown();
        if decode_thread.join().is_err() {
            warn!("decode thread panicked during shutdown");
        }
        drop(consumer);
        drop(artifact);

        info!(
            "capture stopped: {} frames decoded, {} dropped",
            self.stats.frames_decoded.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed)
        );
    }

    /// Copy the oldest buffered frame into `out` without blocking.
    ///
    /// Returns `Empty` when nothing is buffered, including on a stopped
    /// session. Frames buffered before the generator exited remain poppable
    /// until consumed or `stop`.
    pub fn try_pop(&mut self, out: &mut [f32]) -> Result<PopResult, CaptureError> {
        let needed = self.bars();
        if out.len() < needed {
            return Err(CaptureError::OutputTooSmall {
                needed,
                got: out.len(),
            });
        }
        match self.active.as_mut() {
            Some(active) => Ok(active.consumer.try_pop(out)),
            None => Ok(PopResult::Empty),
        }
    }

    /// Bars per frame; before `start` this is what the configuration will
    /// resolve to, so a renderer can size its buffer up front.
    pub fn bars(&self) -> usize {
        match &self.active {
            Some(active) => active.bars,
            None => self.config.effective_bars(),
        }
    }

    /// Whether the decode loop is live. Flips to false on its own when the
    /// generator exits or the stream fails.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cumulative decode-loop counters
    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decode exactly one chunk into normalized bar values.
///
/// Every byte pattern maps into `[0, 1]`, so arbitrary input cannot panic
/// or produce out-of-range bars. `chunk` must be `layout.chunk_len()` bytes
/// and `frame` must hold `layout.bars` values.
fn decode_frame(chunk: &[u8], layout: FrameLayout, frame: &mut [f32]) {
    let full_scale = layout.format.full_scale();
    match layout.format {
        BitFormat::Bits16 => {
            for (bar, sample) in frame.iter_mut().zip(chunk.chunks_exact(2)) {
                *bar = u16::from_le_bytes([sample[0], sample[1]]) as f32 / full_scale;
            }
        }
        BitFormat::Bits8 => {
            for (bar, &sample) in frame.iter_mut().zip(chunk) {
                *bar = sample as f32 / full_scale;
            }
        }
    }
}

/// Run the blocking read/decode/publish loop on the dedicated thread
fn run_decode_loop(
    mut pipe: ChildStdout,
    layout: FrameLayout,
    mut producer: FrameProducer,
    generator: Arc<Generator>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
) {
    let chunk_len = layout.chunk_len();
    let mut chunk = vec![0u8; chunk_len];
    let mut frame = vec![0.0f32; layout.bars];

    while running.load(Ordering::Acquire) {
        // read_exact retries short reads and EINTR; a failure here is
        // terminal for the session, not something to retry
        match pipe.read_exact(&mut chunk) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("generator stream ended");
                break;
            }
            Err(err) => {
                warn!("generator read failed: {}", err);
                break;
            }
        }
        stats.bytes_read.fetch_add(chunk_len as u64, Ordering::Relaxed);

        decode_frame(&chunk, layout, &mut frame);
        stats.frames_decoded.fetch_add(1, Ordering::Relaxed);

        if !producer.try_publish(&frame) {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    running.store(false, Ordering::Release);
    drop(pipe);
    generator.reap();
    debug!("decode loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BitFormat;

    fn layout(format: BitFormat, bars: usize) -> FrameLayout {
        FrameLayout { bars, format }
    }

    #[test]
    fn test_decode_16bit_extremes() {
        let mut frame = [0.5; 2];
        decode_frame(&[0x00, 0x00, 0xFF, 0xFF], layout(BitFormat::Bits16, 2), &mut frame);
        assert_eq!(frame[0], 0.0);
        assert_eq!(frame[1], 1.0);
    }

    #[test]
    fn test_decode_16bit_little_endian() {
        let mut frame = [0.0; 2];
        // 0x8000 and 0x0080, low byte first
        decode_frame(&[0x00, 0x80, 0x80, 0x00], layout(BitFormat::Bits16, 2), &mut frame);
        assert_eq!(frame[0], 32768.0 / 65535.0);
        assert_eq!(frame[1], 128.0 / 65535.0);
    }

    #[test]
    fn test_decode_8bit_extremes() {
        let mut frame = [0.5; 2];
        decode_frame(&[0x00, 0xFF], layout(BitFormat::Bits8, 2), &mut frame);
        assert_eq!(frame[0], 0.0);
        assert_eq!(frame[1], 1.0);
    }

    #[test]
    fn test_decode_any_bytes_stay_normalized() {
        let chunk: Vec<u8> = (0..=255).collect();
        let mut frame = [0.0; 128];
        decode_frame(&chunk, layout(BitFormat::Bits16, 128), &mut frame);
        assert!(frame.iter().all(|bar| (0.0..=1.0).contains(bar)));

        let mut frame = [0.0; 256];
        decode_frame(&chunk, layout(BitFormat::Bits8, 256), &mut frame);
        assert!(frame.iter().all(|bar| (0.0..=1.0).contains(bar)));
    }

    #[test]
    fn test_stopped_session_queries() {
        let mut session = CaptureSession::new();
        assert!(!session.is_running());
        assert_eq!(session.bars(), crate::config::DEFAULT_BARS);

        let mut out = vec![0.0; session.bars()];
        assert_eq!(session.try_pop(&mut out).unwrap(), PopResult::Empty);

        // Stopping a never-started session is a no-op
        session.stop();
        session.stop();
    }

    #[test]
    fn test_undersized_output_buffer() {
        let mut session = CaptureSession::with_config(CaptureConfig {
            bars: 8,
            ..CaptureConfig::default()
        });
        let mut out = [0.0; 4];
        assert!(matches!(
            session.try_pop(&mut out),
            Err(CaptureError::OutputTooSmall { needed: 8, got: 4 })
        ));
    }

    #[test]
    fn test_bars_reports_resolved_default_before_start() {
        let session = CaptureSession::with_config(CaptureConfig {
            bars: 0,
            ..CaptureConfig::default()
        });
        assert_eq!(session.bars(), crate::config::DEFAULT_BARS);
    }
}

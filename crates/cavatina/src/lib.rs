//! Cavatina: spectrum capture pipeline
//!
//! Supervises a cava-style spectrum generator as a child process, decodes
//! its raw binary frame stream on a background thread, and hands the newest
//! frames to a polling renderer through a lock-free SPSC ring:
//!
//! ```text
//! CaptureConfig ──▶ CaptureSession::start()
//!                        │ writes config artifact, spawns generator
//!                        ▼
//!              generator ──pipe──▶ decode thread ──▶ frame ring
//!                                                       │
//!                renderer tick ──▶ try_pop() ◀──────────┘
//! ```
//!
//! The renderer side never blocks and never allocates; the decode side
//! drops frames instead of backing up when the renderer polls slower than
//! the generator produces. Delivery of every frame is explicitly not
//! guaranteed.
//!
//! ```no_run
//! use cavatina::{CaptureSession, PopResult};
//!
//! let mut session = CaptureSession::new();
//! session.start()?;
//! let mut frame = vec![0.0f32; session.bars()];
//! while session.is_running() {
//!     if session.try_pop(&mut frame)? == PopResult::Popped {
//!         // hand `frame` to the renderer
//!     }
//! }
//! session.stop();
//! # Ok::<(), cavatina::CaptureError>(())
//! ```

pub mod capture;
pub mod config;
pub mod generator;
pub mod ring;

pub use capture::{CaptureError, CaptureSession, CaptureStats};
pub use config::{
    BitFormat, CaptureConfig, ConfigError, FrameLayout, DEFAULT_BARS, DEFAULT_PROGRAM,
    DEFAULT_RING_FRAMES,
};
pub use generator::{ConfigArtifact, Generator, SpawnError};
pub use ring::{frame_ring_pair, FrameConsumer, FrameProducer, PopResult};

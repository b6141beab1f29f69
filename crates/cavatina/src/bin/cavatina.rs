//! Terminal spectrum meter
//!
//! Reference consumer for the capture pipeline: starts a session, polls one
//! frame per render tick, and redraws a single line of block glyphs. Exits
//! when the generator stream ends or the time limit elapses.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use cavatina::{CaptureConfig, CaptureSession, PopResult};

/// Cavatina - poll a spectrum generator and draw bars in the terminal
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Sample depth of the generator stream ("8bit" or "16bit")
    #[arg(long, default_value = "16bit")]
    format: String,

    /// Bars per frame (0 selects the library default of 128)
    #[arg(long, default_value_t = 64)]
    bars: usize,

    /// Ring capacity hint in frames
    #[arg(long, default_value_t = 16)]
    ring: usize,

    /// Generator executable to launch
    #[arg(long, default_value = "cava")]
    program: String,

    /// Stop after this many seconds (0 = run until the generator exits)
    #[arg(long, default_value_t = 0)]
    seconds: u64,

    /// Render ticks per second
    #[arg(long, default_value_t = 60)]
    fps: u32,
}

const GLYPHS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = CaptureConfig {
        bit_format: args.format.parse()?,
        bars: args.bars,
        ring_frames: args.ring,
        program: args.program,
    };

    let mut session = CaptureSession::with_config(config);
    session.start()?;

    let mut frame = vec![0.0f32; session.bars()];
    let mut line = String::with_capacity(frame.len() * 4);
    let tick = Duration::from_secs(1) / args.fps.max(1);
    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));

    let stdout = std::io::stdout();
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        match session.try_pop(&mut frame)? {
            PopResult::Popped => {
                line.clear();
                for &bar in &frame {
                    let index = (bar * (GLYPHS.len() - 1) as f32).round() as usize;
                    line.push(GLYPHS[index.min(GLYPHS.len() - 1)]);
                }
                let mut out = stdout.lock();
                write!(out, "\r{line}")?;
                out.flush()?;
            }
            PopResult::Empty => {
                if !session.is_running() {
                    break;
                }
            }
        }
        std::thread::sleep(tick);
    }
    println!();

    session.stop();
    Ok(())
}

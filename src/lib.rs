//! # chain-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Multi-track audio processing: declare a *chainsetup* - inputs, outputs,
//! per-chain operator pipelines, controllers - and run it. The engine
//! streams one period at a time from inputs, through each chain's
//! operators, into outputs, while a background proxy thread keeps blocking
//! file I/O away from the engine thread.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chain_audio::{Chainsetup, Engine, Environment};
//!
//! // take.wav through a 50% gain into out.wav
//! let options: Vec<String> = [
//!     "-i:take.wav", "-o:out.wav", "-ea:50",
//! ].iter().map(|s| s.to_string()).collect();
//!
//! let mut setup = Chainsetup::from_options(&options, Environment::detect())?;
//! setup.enable()?;
//!
//! let (mut engine, handle) = Engine::new();
//! // handle.stop() / handle.seek(frames) work from other threads
//! let stats = engine.run(&mut setup)?;
//! setup.disable()?;
//!
//! println!("{} periods, {} frames", stats.ticks, stats.frames_processed);
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Engine thread**: runs the per-period schedule and never performs
//!   blocking file I/O
//! - **Proxy rings**: lock-free SPSC rings of sample buffers absorb the
//!   speed difference between files and the engine clock
//! - **Proxy server thread**: owns the non-realtime objects and does their
//!   I/O, filling read rings and draining write rings
//!
//! Whether objects run behind the proxy is decided per setup by the
//! buffering-mode selector from the declared topology (see
//! [`buffering::select_mode`]).

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod buffer;
pub mod buffering;
mod chain;
mod engine;
mod env;
mod error;
pub mod format;
pub mod object;
pub mod op;
mod proxy;
pub mod setup;

pub use buffer::SampleBuffer;
pub use buffering::{BufferingMode, BufferingOverrides, BufferingParams};
pub use chain::{Chain, Slot};
pub use engine::{Engine, EngineHandle, EngineStats};
pub use env::Environment;
pub use error::EngineError;
pub use format::{AudioFormat, SampleFormat};
pub use object::{AudioObject, Caps, IoMode, ObjectRegistry};
pub use op::{Controller, ControllerBinding, Operator};
pub use proxy::{ProxyRing, ProxyServer, RingDirection};
pub use setup::Chainsetup;

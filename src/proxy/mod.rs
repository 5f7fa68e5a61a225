//! Double-buffered I/O: rings and the proxy server.
//!
//! Non-realtime audio objects (files, mostly) must never block the engine
//! thread. When a chainsetup enables double buffering, each such object is
//! handed to the [`ProxyServer`]'s worker thread and exchanged for a
//! [`ProxyRing`] of pre-allocated sample buffers; the engine then reads and
//! writes ring slots while the worker does the actual file I/O.

mod ring;
mod server;

pub use ring::{ProxyRing, RingDirection, DEFAULT_SLOTS};
pub use server::ProxyServer;

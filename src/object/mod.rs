//! Audio object contract and built-in implementations.
//!
//! An [`AudioObject`] is any source or sink of sample periods: a file, a
//! device, a loop device, or a test double. The engine and the proxy server
//! drive objects exclusively through this trait; which thread owns an
//! object decides which thread is allowed to touch it.
//!
//! Built-ins:
//!
//! - [`NullObject`]: infinite silence in, bit bucket out (`null` /
//!   `rtnull` for the realtime-tagged variant)
//! - [`WavFile`]: RIFF WAVE reader and writer
//! - [`LoopDevice`]: feeds one chain's output into another chain's input
//! - [`MockDevice`]: deterministic, hardware-free double for tests
//!
//! New object types are created through the [`ObjectRegistry`], a factory
//! keyed by type name or file extension.

mod loopdev;
mod mock;
mod null;
mod wave;

pub use loopdev::LoopDevice;
pub use mock::{MockDevice, MockStats};
pub use null::NullObject;
pub use wave::WavFile;

use crate::error::EngineError;
use crate::format::AudioFormat;
use crate::SampleBuffer;

/// Direction an object is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Source: the engine reads periods from the object.
    Read,
    /// Sink: the engine writes periods to the object, truncating.
    Write,
    /// Sink opened for update (no truncation).
    ReadWrite,
}

/// Static capabilities of an audio object.
///
/// Capabilities steer buffering-mode selection and proxy wiring: realtime
/// and loop devices always stream directly into the engine, everything else
/// may be routed through the proxy server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps {
    /// Supports repositioning with `seek`.
    pub seekable: bool,
    /// Read/write never blocks on external hardware pacing.
    pub nonblocking: bool,
    /// Stream has a finite, known length.
    pub finite_length: bool,
    /// Format is frozen once the object is open.
    pub format_locked: bool,
    /// Driven by an external hardware clock.
    pub realtime: bool,
    /// Simultaneously an input and an output of the same chainsetup.
    pub loop_device: bool,
}

/// Uniform contract for all audio sources and sinks.
///
/// # Contract
///
/// - `set_format` before `open` always succeeds; after `open` it fails
///   unless the object's format is not locked.
/// - Once open, the reported format stays frozen until `close`.
/// - `read` after `finished` returns 0 frames.
/// - `seek` on a non-seekable object may be a no-op; it returns the
///   resulting position either way.
/// - Data-path failures are absorbed: the object flips `finished`, logs,
///   and keeps satisfying the contract.
///
/// Objects are `Send` because ownership migrates between the control
/// thread, the engine thread, and the proxy worker; exactly one thread
/// holds an object at any time.
impl std::fmt::Debug for dyn AudioObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioObject").field("label", &self.label()).finish()
    }
}

pub trait AudioObject: Send {
    /// String identifier used in logs, errors, and saved chainsetups.
    fn label(&self) -> &str;

    /// The direction this object is configured for.
    fn io_mode(&self) -> IoMode;

    /// Sets the direction. Called by the chainsetup before `open`.
    fn set_io_mode(&mut self, mode: IoMode);

    /// Static capabilities.
    fn caps(&self) -> Caps;

    /// Currently configured (or negotiated, once open) format.
    fn format(&self) -> &AudioFormat;

    /// Reconfigures the sample format.
    fn set_format(&mut self, format: AudioFormat) -> Result<(), EngineError>;

    /// Sets the period length in frames.
    fn set_buffersize(&mut self, frames: usize);

    /// Period length in frames.
    fn buffersize(&self) -> usize;

    /// Opens the object. May fail with a setup error.
    fn open(&mut self) -> Result<(), EngineError>;

    /// Closes the object. Idempotent.
    fn close(&mut self);

    /// Whether the object is open.
    fn is_open(&self) -> bool;

    /// Reads up to one period into `buf`, returning the frame count read.
    ///
    /// The buffer's valid length is set to the returned count. Returns 0
    /// once `finished`.
    fn read(&mut self, buf: &mut SampleBuffer) -> usize;

    /// Writes the valid frames of `buf`.
    fn write(&mut self, buf: &SampleBuffer);

    /// Repositions to `frame`, returning the resulting position.
    fn seek(&mut self, frame: u64) -> u64;

    /// Current position in frames.
    fn position(&self) -> u64;

    /// Total length in frames, or `None` for infinite streams.
    fn length(&self) -> Option<u64>;

    /// Whether the stream is exhausted (or failed).
    fn finished(&self) -> bool;
}

type Constructor = Box<dyn Fn(&str) -> Result<Box<dyn AudioObject>, EngineError> + Send + Sync>;

enum Matcher {
    /// Exact type name, compared against the first comma-separated field.
    Name(&'static str),
    /// Case-insensitive filename extension including the dot.
    Extension(&'static str),
}

/// Factory registry mapping object specifications to constructors.
///
/// A specification is either a type name (`null`, `rtnull`) or a filename
/// whose extension selects the object type (`take1.wav`). Runtime-created
/// instances are owned via `Box<dyn AudioObject>`; there is no cloning of
/// prototypes.
pub struct ObjectRegistry {
    entries: Vec<(Matcher, Constructor)>,
}

impl ObjectRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Creates a registry with all built-in object types registered.
    pub fn with_builtin_types() -> Self {
        let mut registry = Self::new();
        registry.register_name("null", |_| Ok(Box::new(NullObject::new(false))));
        registry.register_name("rtnull", |_| Ok(Box::new(NullObject::new(true))));
        registry.register_extension(".wav", |spec| Ok(Box::new(WavFile::new(spec))));
        registry
    }

    /// Registers a constructor for an exact type name.
    pub fn register_name(
        &mut self,
        name: &'static str,
        ctor: impl Fn(&str) -> Result<Box<dyn AudioObject>, EngineError> + Send + Sync + 'static,
    ) {
        self.entries.push((Matcher::Name(name), Box::new(ctor)));
    }

    /// Registers a constructor for a filename extension (with leading dot).
    pub fn register_extension(
        &mut self,
        extension: &'static str,
        ctor: impl Fn(&str) -> Result<Box<dyn AudioObject>, EngineError> + Send + Sync + 'static,
    ) {
        self.entries
            .push((Matcher::Extension(extension), Box::new(ctor)));
    }

    /// Creates an object from a specification string.
    pub fn create(&self, spec: &str) -> Result<Box<dyn AudioObject>, EngineError> {
        let type_field = spec.split(',').next().unwrap_or(spec);
        let lowered = type_field.to_ascii_lowercase();
        for (matcher, ctor) in &self.entries {
            let hit = match matcher {
                Matcher::Name(name) => *name == type_field,
                Matcher::Extension(ext) => lowered.ends_with(ext),
            };
            if hit {
                return ctor(spec);
            }
        }
        Err(EngineError::UnknownObjectType {
            spec: spec.to_string(),
        })
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::with_builtin_types()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creates_null_by_name() {
        let registry = ObjectRegistry::with_builtin_types();
        let obj = registry.create("null").unwrap();
        assert_eq!(obj.label(), "null");
        assert!(!obj.caps().realtime);
    }

    #[test]
    fn test_registry_creates_rtnull_with_realtime_caps() {
        let registry = ObjectRegistry::with_builtin_types();
        let obj = registry.create("rtnull").unwrap();
        assert!(obj.caps().realtime);
    }

    #[test]
    fn test_registry_matches_wav_extension() {
        let registry = ObjectRegistry::with_builtin_types();
        let obj = registry.create("session/Take1.WAV").unwrap();
        assert_eq!(obj.label(), "session/Take1.WAV");
    }

    #[test]
    fn test_registry_rejects_unknown_spec() {
        let registry = ObjectRegistry::with_builtin_types();
        let err = registry.create("take1.ogg").unwrap_err();
        assert!(matches!(err, EngineError::UnknownObjectType { .. }));
    }

    #[test]
    fn test_registry_custom_name() {
        let mut registry = ObjectRegistry::new();
        registry.register_name("silence", |_| Ok(Box::new(NullObject::new(false))));
        assert!(registry.create("silence").is_ok());
        assert!(registry.create("null").is_err());
    }

    #[test]
    fn test_objects_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Box<dyn AudioObject>>();
    }
}

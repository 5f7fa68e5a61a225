//! Null audio object: infinite silence source, bit-bucket sink.

use crate::error::EngineError;
use crate::format::AudioFormat;
use crate::object::{AudioObject, Caps, IoMode};
use crate::SampleBuffer;

/// An object that reads silence and discards writes.
///
/// The non-realtime variant (`null`) is the default output target and the
/// standard sink for batch processing runs. The realtime variant (`rtnull`)
/// reports device capabilities and is used to stand in for a hardware
/// device in topology decisions and tests; it does not actually pace I/O.
pub struct NullObject {
    label: &'static str,
    realtime: bool,
    mode: IoMode,
    format: AudioFormat,
    buffersize: usize,
    position: u64,
    open: bool,
}

impl NullObject {
    /// Creates a null object; `realtime` selects the `rtnull` variant.
    pub fn new(realtime: bool) -> Self {
        Self {
            label: if realtime { "rtnull" } else { "null" },
            realtime,
            mode: IoMode::Write,
            format: AudioFormat::default(),
            buffersize: 0,
            position: 0,
            open: false,
        }
    }
}

impl AudioObject for NullObject {
    fn label(&self) -> &str {
        self.label
    }

    fn io_mode(&self) -> IoMode {
        self.mode
    }

    fn set_io_mode(&mut self, mode: IoMode) {
        self.mode = mode;
    }

    fn caps(&self) -> Caps {
        Caps {
            seekable: true,
            nonblocking: true,
            finite_length: false,
            format_locked: false,
            realtime: self.realtime,
            loop_device: false,
        }
    }

    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn set_format(&mut self, format: AudioFormat) -> Result<(), EngineError> {
        self.format = format;
        Ok(())
    }

    fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames;
    }

    fn buffersize(&self) -> usize {
        self.buffersize
    }

    fn open(&mut self) -> Result<(), EngineError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> usize {
        buf.make_silent();
        buf.set_frames(self.buffersize.min(buf.capacity()));
        buf.set_sample_rate(self.format.sample_rate);
        self.position += buf.frames() as u64;
        buf.frames()
    }

    fn write(&mut self, buf: &SampleBuffer) {
        self.position += buf.frames() as u64;
    }

    fn seek(&mut self, frame: u64) -> u64 {
        self.position = frame;
        self.position
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> Option<u64> {
        None
    }

    fn finished(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_delivers_silence() {
        let mut obj = NullObject::new(false);
        obj.set_buffersize(128);
        obj.set_io_mode(IoMode::Read);
        obj.open().unwrap();

        let mut buf = SampleBuffer::new(2, 128, 44100);
        buf.channel_mut(0).fill(1.0);
        let frames = obj.read(&mut buf);
        assert_eq!(frames, 128);
        assert!(buf.channel(0).iter().all(|&s| s == 0.0));
        assert_eq!(obj.position(), 128);
    }

    #[test]
    fn test_write_advances_position() {
        let mut obj = NullObject::new(false);
        obj.set_buffersize(64);
        obj.open().unwrap();

        let buf = SampleBuffer::new(2, 64, 44100);
        obj.write(&buf);
        obj.write(&buf);
        assert_eq!(obj.position(), 128);
        assert!(!obj.finished());
    }

    #[test]
    fn test_infinite_and_seekable() {
        let mut obj = NullObject::new(false);
        assert_eq!(obj.length(), None);
        assert_eq!(obj.seek(4410), 4410);
        assert_eq!(obj.position(), 4410);
    }
}

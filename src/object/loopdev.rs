//! Loop device: routes one chain's output into another chain's input.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::error::EngineError;
use crate::format::AudioFormat;
use crate::object::{AudioObject, Caps, IoMode};
use crate::SampleBuffer;

/// Sample FIFO headroom, in periods. The engine runs loop-writing chains
/// before loop-reading chains, so one period would do; the headroom absorbs
/// chains that are temporarily silent.
const FIFO_PERIODS: usize = 8;

/// An audio object that is simultaneously an input and an output.
///
/// A loop device appears in both the input and the output tables of a
/// chainsetup under the same identity (`loop,<id>`); the chainsetup owns it
/// once, in a dedicated map. Samples written by the sink side become
/// readable on the source side within the same engine tick. When the FIFO
/// runs dry the device delivers silence instead of finishing, so a loop
/// never terminates the engine on its own.
pub struct LoopDevice {
    id: u32,
    label: String,
    format: AudioFormat,
    buffersize: usize,
    fifo: HeapRb<f32>,
    position: u64,
    open: bool,
}

impl LoopDevice {
    /// Creates a loop device with the given identifier.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            label: format!("loop,{id}"),
            format: AudioFormat::default(),
            buffersize: 0,
            // Reallocated to the real period size at open.
            fifo: HeapRb::new(1),
            position: 0,
            open: false,
        }
    }

    /// The loop identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Interleaved samples currently queued.
    pub fn queued_samples(&self) -> usize {
        self.fifo.occupied_len()
    }
}

impl AudioObject for LoopDevice {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        IoMode::ReadWrite
    }

    fn set_io_mode(&mut self, _mode: IoMode) {
        // A loop device is always both directions.
    }

    fn caps(&self) -> Caps {
        Caps {
            seekable: false,
            nonblocking: true,
            finite_length: false,
            format_locked: false,
            realtime: false,
            loop_device: true,
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
        if !self.open {
            let capacity = (self.buffersize * self.format.channels).max(1) * FIFO_PERIODS;
            self.fifo = HeapRb::new(capacity);
            self.position = 0;
            self.open = true;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        while self.fifo.try_pop().is_some() {}
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> usize {
        let frames = self.buffersize.min(buf.capacity());
        buf.set_frames(frames);
        buf.set_sample_rate(self.format.sample_rate);
        let channels = self.format.channels;
        for frame in 0..frames {
            for ch in 0..channels {
                let sample = self.fifo.try_pop().unwrap_or(0.0);
                if ch < buf.channel_count() {
                    buf.channel_mut(ch)[frame] = sample;
                }
            }
        }
        self.position += frames as u64;
        frames
    }

    fn write(&mut self, buf: &SampleBuffer) {
        let channels = self.format.channels;
        let mut dropped = 0usize;
        for frame in 0..buf.frames() {
            for ch in 0..channels {
                let src = ch.min(buf.channel_count() - 1);
                if self.fifo.try_push(buf.channel(src)[frame]).is_err() {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(label = %self.label, dropped, "loop device FIFO overflow");
        }
        self.position += buf.frames() as u64;
    }

    fn seek(&mut self, _frame: u64) -> u64 {
        // Not seekable; a seek drops whatever is queued.
        while self.fifo.try_pop().is_some() {}
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

    fn open_loop(buffersize: usize) -> LoopDevice {
        let mut dev = LoopDevice::new(1);
        dev.set_format(AudioFormat::default()).unwrap();
        dev.set_buffersize(buffersize);
        dev.open().unwrap();
        dev
    }

    #[test]
    fn test_write_then_read_same_tick() {
        let mut dev = open_loop(64);
        let mut buf = SampleBuffer::new(2, 64, 44100);
        buf.channel_mut(0).fill(0.5);
        buf.channel_mut(1).fill(-0.5);
        dev.write(&buf);

        let mut out = SampleBuffer::new(2, 64, 44100);
        assert_eq!(dev.read(&mut out), 64);
        assert!(out.channel(0).iter().all(|&s| s == 0.5));
        assert!(out.channel(1).iter().all(|&s| s == -0.5));
    }

    #[test]
    fn test_empty_loop_reads_silence_and_never_finishes() {
        let mut dev = open_loop(32);
        let mut out = SampleBuffer::new(2, 32, 44100);
        out.channel_mut(0).fill(1.0);
        assert_eq!(dev.read(&mut out), 32);
        assert!(out.channel(0).iter().all(|&s| s == 0.0));
        assert!(!dev.finished());
    }

    #[test]
    fn test_partial_data_padded_with_silence() {
        let mut dev = open_loop(64);
        let mut half = SampleBuffer::new(2, 64, 44100);
        half.channel_mut(0).fill(0.25);
        half.channel_mut(1).fill(0.25);
        half.set_frames(16);
        dev.write(&half);

        let mut out = SampleBuffer::new(2, 64, 44100);
        assert_eq!(dev.read(&mut out), 64);
        assert!(out.channel(0)[..16].iter().all(|&s| s == 0.25));
        assert!(out.channel(0)[16..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_seek_drops_queued_samples() {
        let mut dev = open_loop(32);
        let mut buf = SampleBuffer::new(2, 32, 44100);
        buf.channel_mut(0).fill(0.7);
        dev.write(&buf);
        assert!(dev.queued_samples() > 0);
        dev.seek(0);
        assert_eq!(dev.queued_samples(), 0);
    }

    #[test]
    fn test_label_encodes_id() {
        let dev = LoopDevice::new(7);
        assert_eq!(dev.label(), "loop,7");
        assert_eq!(dev.id(), 7);
        assert!(dev.caps().loop_device);
    }
}

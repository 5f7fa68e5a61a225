//! Mock audio object for testing without files or hardware.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::EngineError;
use crate::format::AudioFormat;
use crate::object::{AudioObject, Caps, IoMode};
use crate::SampleBuffer;

/// Shared observation point for a [`MockDevice`].
///
/// Devices are moved into the engine or the proxy worker when a chainsetup
/// is enabled; tests keep a clone of this handle to observe what happened
/// from the outside.
#[derive(Debug, Default)]
pub struct MockStats {
    /// Total frames produced by `read`.
    pub frames_read: AtomicU64,
    /// Total frames consumed by `write`.
    pub frames_written: AtomicU64,
    /// Number of `open` calls.
    pub opens: AtomicU64,
    /// Number of `close` calls.
    pub closes: AtomicU64,
    /// Whether the device is currently open.
    pub is_open: AtomicBool,
    /// Channel-0 samples seen by `write`, when capturing is enabled.
    pub captured: Mutex<Vec<f32>>,
}

/// A deterministic, hardware-free audio object.
///
/// As a source it produces a ramp where every sample equals its absolute
/// frame index, which makes positions directly observable downstream (after
/// a seek to frame `n`, the next period starts with the value `n`). As a
/// sink it counts frames and optionally captures samples.
///
/// # Example
///
/// ```
/// use chain_audio::object::{AudioObject, IoMode, MockDevice};
/// use chain_audio::SampleBuffer;
///
/// let mut mock = MockDevice::source("m-in", 100);
/// mock.open().unwrap();
/// mock.set_buffersize(64);
/// let mut buf = SampleBuffer::new(2, 64, 44100);
/// assert_eq!(mock.read(&mut buf), 64);
/// assert_eq!(buf.channel(0)[10], 10.0);
/// ```
pub struct MockDevice {
    label: String,
    mode: IoMode,
    format: AudioFormat,
    buffersize: usize,
    realtime: bool,
    fail_open: bool,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
    capture: bool,
    rate_override: Option<u32>,
    length: Option<u64>,
    position: u64,
    finished: bool,
    stats: Arc<MockStats>,
}

impl MockDevice {
    /// Creates a finite mock source producing `frames` ramp frames.
    pub fn source(label: &str, frames: u64) -> Self {
        Self {
            label: label.to_string(),
            mode: IoMode::Read,
            format: AudioFormat::default(),
            buffersize: 0,
            realtime: false,
            fail_open: false,
            read_delay: None,
            write_delay: None,
            capture: false,
            rate_override: None,
            length: Some(frames),
            position: 0,
            finished: false,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Creates an infinite mock source.
    pub fn infinite_source(label: &str) -> Self {
        let mut mock = Self::source(label, 0);
        mock.length = None;
        mock
    }

    /// Creates a mock sink.
    pub fn sink(label: &str) -> Self {
        let mut mock = Self::source(label, 0);
        mock.mode = IoMode::Write;
        mock.length = None;
        mock
    }

    /// Tags the device as a realtime device (external hardware clock).
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Makes `open` fail with a setup error.
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Stalls every `read` by `delay`, simulating slow media.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Stalls every `write` by `delay`, pacing whoever drives this sink.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Records channel-0 samples passed to `write` in [`MockStats::captured`].
    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Pins the reported sample rate, ignoring later `set_format` calls.
    ///
    /// Used to simulate an object that negotiates its own rate (the way a
    /// file header or a device would override the requested one).
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.rate_override = Some(rate);
        self.format.sample_rate = rate;
        self
    }

    /// Returns the shared observation handle.
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl AudioObject for MockDevice {
    fn label(&self) -> &str {
        &self.label
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
            nonblocking: self.realtime,
            finite_length: self.length.is_some(),
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
        if let Some(rate) = self.rate_override {
            self.format.sample_rate = rate;
        }
        Ok(())
    }

    fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames;
    }

    fn buffersize(&self) -> usize {
        self.buffersize
    }

    fn open(&mut self) -> Result<(), EngineError> {
        if self.fail_open {
            return Err(EngineError::object_open(
                &self.label,
                std::io::Error::new(std::io::ErrorKind::NotFound, "mock open failure"),
            ));
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.stats.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.stats.is_open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.stats.is_open.load(Ordering::SeqCst)
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> usize {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        if self.finished {
            buf.set_frames(0);
            return 0;
        }
        let frames = match self.length {
            Some(total) => {
                let remaining = total.saturating_sub(self.position);
                (self.buffersize as u64).min(remaining) as usize
            }
            None => self.buffersize,
        };
        if frames == 0 {
            self.finished = true;
            buf.set_frames(0);
            return 0;
        }
        buf.set_frames(frames);
        buf.set_sample_rate(self.format.sample_rate);
        for ch in 0..buf.channel_count() {
            let start = self.position;
            for (i, sample) in buf.channel_mut(ch).iter_mut().enumerate() {
                *sample = (start + i as u64) as f32;
            }
        }
        self.position += frames as u64;
        if let Some(total) = self.length {
            if self.position >= total {
                self.finished = true;
            }
        }
        self.stats.frames_read.fetch_add(frames as u64, Ordering::SeqCst);
        frames
    }

    fn write(&mut self, buf: &SampleBuffer) {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        if self.capture {
            let mut captured = self.stats.captured.lock().unwrap();
            captured.extend_from_slice(buf.channel(0));
        }
        self.position += buf.frames() as u64;
        self.stats
            .frames_written
            .fetch_add(buf.frames() as u64, Ordering::SeqCst);
    }

    fn seek(&mut self, frame: u64) -> u64 {
        self.position = match self.length {
            Some(total) => frame.min(total),
            None => frame,
        };
        self.finished = matches!(self.length, Some(total) if self.position >= total);
        self.position
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_values_match_positions() {
        let mut mock = MockDevice::source("m", 100);
        mock.set_buffersize(32);
        mock.open().unwrap();
        let mut buf = SampleBuffer::new(2, 32, 44100);
        mock.read(&mut buf);
        mock.read(&mut buf);
        assert_eq!(buf.channel(0)[0], 32.0);
        assert_eq!(buf.channel(1)[31], 63.0);
    }

    #[test]
    fn test_finite_source_finishes_exactly() {
        let mut mock = MockDevice::source("m", 70);
        mock.set_buffersize(32);
        mock.open().unwrap();
        let mut buf = SampleBuffer::new(2, 32, 44100);
        assert_eq!(mock.read(&mut buf), 32);
        assert_eq!(mock.read(&mut buf), 32);
        assert_eq!(mock.read(&mut buf), 6);
        assert!(mock.finished());
        assert_eq!(mock.read(&mut buf), 0);
        assert_eq!(mock.stats().frames_read.load(Ordering::SeqCst), 70);
    }

    #[test]
    fn test_seek_clears_finished() {
        let mut mock = MockDevice::source("m", 10);
        mock.set_buffersize(16);
        mock.open().unwrap();
        let mut buf = SampleBuffer::new(2, 16, 44100);
        mock.read(&mut buf);
        assert!(mock.finished());
        assert_eq!(mock.seek(4), 4);
        assert!(!mock.finished());
        assert_eq!(mock.read(&mut buf), 6);
        assert_eq!(buf.channel(0)[0], 4.0);
    }

    #[test]
    fn test_sink_counts_and_captures() {
        let mut mock = MockDevice::sink("out").with_capture();
        let stats = mock.stats();
        mock.open().unwrap();
        let mut buf = SampleBuffer::new(1, 8, 44100);
        buf.channel_mut(0).fill(0.5);
        mock.write(&buf);
        mock.write(&buf);
        assert_eq!(stats.frames_written.load(Ordering::SeqCst), 16);
        assert_eq!(stats.captured.lock().unwrap().len(), 16);
    }

    #[test]
    fn test_open_failure() {
        let mut mock = MockDevice::source("m", 10).with_open_failure();
        assert!(matches!(
            mock.open(),
            Err(EngineError::ObjectOpen { .. })
        ));
    }

    #[test]
    fn test_open_close_tracked_through_stats() {
        let mut mock = MockDevice::source("m", 10);
        let stats = mock.stats();
        mock.open().unwrap();
        assert!(stats.is_open.load(Ordering::SeqCst));
        mock.close();
        assert!(!stats.is_open.load(Ordering::SeqCst));
        assert_eq!(stats.opens.load(Ordering::SeqCst), 1);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_realtime_tagging() {
        let mock = MockDevice::source("m", 10).realtime();
        assert!(mock.caps().realtime);
    }
}

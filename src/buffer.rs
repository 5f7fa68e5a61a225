//! Sample buffer: one period of planar float audio.

/// A fixed-capacity block of floating-point samples, stored planar
/// (one `Vec<f32>` per channel).
///
/// `SampleBuffer` is the unit of data moved through the engine: one buffer
/// holds one period (*buffersize* frames) for every channel. Buffers are
/// allocated when a chainsetup is enabled and reused for every period; the
/// valid frame count may be shorter than the capacity on the last period of
/// a finite stream.
///
/// # Example
///
/// ```
/// use chain_audio::SampleBuffer;
///
/// let mut buf = SampleBuffer::new(2, 1024, 44100);
/// assert_eq!(buf.channel_count(), 2);
/// assert_eq!(buf.frames(), 1024);
///
/// buf.channel_mut(0)[0] = 0.5;
/// buf.set_frames(512); // partial period
/// assert_eq!(buf.frames(), 512);
/// ```
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    channels: Vec<Vec<f32>>,
    /// Valid frame count; always <= capacity.
    frames: usize,
    capacity: usize,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Creates a zero-filled buffer with the given channel count, frame
    /// capacity, and sample rate.
    pub fn new(channels: usize, frames: usize, sample_rate: u32) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
            frames,
            capacity: frames,
            sample_rate,
        }
    }

    /// Returns the number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Returns the number of valid frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Returns the allocated frame capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Sets the sample rate tag. Does not resample.
    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
    }

    /// Sets the valid frame count, clamped to the capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity);
    }

    /// Reallocates the buffer for a new channel count and frame capacity.
    pub fn resize(&mut self, channels: usize, frames: usize) {
        self.channels = vec![vec![0.0; frames]; channels];
        self.frames = frames;
        self.capacity = frames;
    }

    /// Returns the samples of one channel (valid frames only).
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index][..self.frames]
    }

    /// Returns the samples of one channel mutably (valid frames only).
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index][..self.frames]
    }

    /// Iterates over all channels (valid frames only).
    pub fn iter_channels(&self) -> impl Iterator<Item = &[f32]> {
        let frames = self.frames;
        self.channels.iter().map(move |c| &c[..frames])
    }

    /// Iterates over all channels mutably (valid frames only).
    pub fn iter_channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let frames = self.frames;
        self.channels.iter_mut().map(move |c| &mut c[..frames])
    }

    /// Zero-fills every channel up to the full capacity and restores the
    /// valid frame count to the capacity.
    pub fn make_silent(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
        self.frames = self.capacity;
    }

    /// Copies the contents and valid length of `other` into this buffer.
    ///
    /// Reallocates if the channel counts or capacities differ.
    pub fn copy_from(&mut self, other: &SampleBuffer) {
        if self.channels.len() != other.channels.len() || self.capacity < other.frames {
            self.resize(other.channels.len(), other.capacity);
        }
        for (dst, src) in self.channels.iter_mut().zip(other.channels.iter()) {
            dst[..other.frames].copy_from_slice(&src[..other.frames]);
        }
        self.frames = other.frames;
        self.sample_rate = other.sample_rate;
    }
}

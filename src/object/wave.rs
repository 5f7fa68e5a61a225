//! RIFF WAVE file object.
//!
//! Supports PCM (format tag 1) and IEEE float (tag 3) sample data at 8, 16,
//! 24 and 32 bits, little-endian, multichannel interleaved. When writing, a
//! provisional header is emitted on open and the chunk sizes are patched on
//! close, so an interrupted run still leaves a parseable file prefix.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::EngineError;
use crate::format::{encode_frames, AudioFormat, SampleFormat};
use crate::object::{AudioObject, Caps, IoMode};
use crate::SampleBuffer;

const FORMAT_TAG_PCM: u16 = 1;
const FORMAT_TAG_IEEE_FLOAT: u16 = 3;
const HEADER_BYTES: u64 = 44;

enum Io {
    Reader {
        file: BufReader<File>,
        data_start: u64,
        data_frames: u64,
    },
    Writer {
        file: BufWriter<File>,
        frames_written: u64,
    },
}

/// A RIFF WAVE file source or sink.
pub struct WavFile {
    label: String,
    path: PathBuf,
    mode: IoMode,
    format: AudioFormat,
    buffersize: usize,
    io: Option<Io>,
    position: u64,
    finished: bool,
}

impl WavFile {
    /// Creates a wave file object for the given path. Nothing is opened
    /// until the chainsetup is enabled.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path,
            mode: IoMode::Read,
            format: AudioFormat::default(),
            buffersize: 0,
            io: None,
            position: 0,
            finished: false,
        }
    }

    fn open_reader(&mut self) -> Result<(), EngineError> {
        let file = File::open(&self.path).map_err(|e| EngineError::object_open(&self.label, e))?;
        let mut reader = BufReader::new(file);

        let mut riff = [0u8; 12];
        reader
            .read_exact(&mut riff)
            .map_err(|e| EngineError::object_open(&self.label, e))?;
        if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
            return Err(EngineError::UnsupportedFormat {
                label: self.label.clone(),
                detail: "not a RIFF WAVE file".to_string(),
            });
        }

        let mut format: Option<AudioFormat> = None;
        let (data_start, data_bytes) = loop {
            let mut header = [0u8; 8];
            reader
                .read_exact(&mut header)
                .map_err(|e| EngineError::object_open(&self.label, e))?;
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;

            match &header[0..4] {
                b"fmt " => {
                    let mut fmt_block = vec![0u8; size as usize];
                    reader
                        .read_exact(&mut fmt_block)
                        .map_err(|e| EngineError::object_open(&self.label, e))?;
                    format = Some(self.parse_fmt_block(&fmt_block)?);
                }
                b"data" => {
                    let start = reader
                        .stream_position()
                        .map_err(|e| EngineError::object_open(&self.label, e))?;
                    break (start, size);
                }
                _ => {
                    // Skip unknown chunks; RIFF pads chunks to even sizes.
                    let skip = size + (size & 1);
                    reader
                        .seek(SeekFrom::Current(skip as i64))
                        .map_err(|e| EngineError::object_open(&self.label, e))?;
                }
            }
        };

        let format = format.ok_or_else(|| EngineError::UnsupportedFormat {
            label: self.label.clone(),
            detail: "no fmt chunk before data chunk".to_string(),
        })?;
        let data_frames = data_bytes / format.frame_bytes() as u64;

        self.format = format;
        self.io = Some(Io::Reader {
            file: reader,
            data_start,
            data_frames,
        });
        self.position = 0;
        self.finished = data_frames == 0;
        tracing::debug!(
            label = %self.label,
            format = %self.format.to_spec_string(),
            frames = data_frames,
            "opened wave file for reading"
        );
        Ok(())
    }

    fn parse_fmt_block(&self, block: &[u8]) -> Result<AudioFormat, EngineError> {
        if block.len() < 16 {
            return Err(EngineError::UnsupportedFormat {
                label: self.label.clone(),
                detail: "fmt chunk too short".to_string(),
            });
        }
        let tag = u16::from_le_bytes([block[0], block[1]]);
        let channels = u16::from_le_bytes([block[2], block[3]]) as usize;
        let sample_rate = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        let bits = u16::from_le_bytes([block[14], block[15]]);

        let sample_format = match (tag, bits) {
            (FORMAT_TAG_PCM, 8) => SampleFormat::U8,
            (FORMAT_TAG_PCM, 16) => SampleFormat::S16Le,
            (FORMAT_TAG_PCM, 24) => SampleFormat::S24Le,
            (FORMAT_TAG_PCM, 32) => SampleFormat::S32Le,
            (FORMAT_TAG_IEEE_FLOAT, 32) => SampleFormat::F32Le,
            (tag, bits) => {
                return Err(EngineError::UnsupportedFormat {
                    label: self.label.clone(),
                    detail: format!("wFormatTag {tag} at {bits} bits"),
                })
            }
        };
        if channels == 0 {
            return Err(EngineError::UnsupportedFormat {
                label: self.label.clone(),
                detail: "zero channels".to_string(),
            });
        }
        Ok(AudioFormat {
            sample_format,
            channels,
            sample_rate,
            interleaved: true,
        })
    }

    fn open_writer(&mut self) -> Result<(), EngineError> {
        let file =
            File::create(&self.path).map_err(|e| EngineError::object_open(&self.label, e))?;
        let mut writer = BufWriter::new(file);
        Self::write_header(&mut writer, &self.format, 0)
            .map_err(|e| EngineError::object_open(&self.label, e))?;
        self.io = Some(Io::Writer {
            file: writer,
            frames_written: 0,
        });
        self.position = 0;
        self.finished = false;
        tracing::debug!(
            label = %self.label,
            format = %self.format.to_spec_string(),
            "opened wave file for writing"
        );
        Ok(())
    }

    fn write_header(
        writer: &mut BufWriter<File>,
        format: &AudioFormat,
        data_bytes: u32,
    ) -> std::io::Result<()> {
        let tag = match format.sample_format {
            SampleFormat::F32Le => FORMAT_TAG_IEEE_FLOAT,
            _ => FORMAT_TAG_PCM,
        };
        let block_align = format.frame_bytes() as u16;
        let byte_rate = format.sample_rate * u32::from(block_align);

        writer.write_all(b"RIFF")?;
        writer.write_all(&(36 + data_bytes).to_le_bytes())?;
        writer.write_all(b"WAVE")?;

        writer.write_all(b"fmt ")?;
        writer.write_all(&16u32.to_le_bytes())?;
        writer.write_all(&tag.to_le_bytes())?;
        writer.write_all(&(format.channels as u16).to_le_bytes())?;
        writer.write_all(&format.sample_rate.to_le_bytes())?;
        writer.write_all(&byte_rate.to_le_bytes())?;
        writer.write_all(&block_align.to_le_bytes())?;
        writer.write_all(&format.sample_format.bits().to_le_bytes())?;

        writer.write_all(b"data")?;
        writer.write_all(&data_bytes.to_le_bytes())?;
        Ok(())
    }

    fn finalize_writer(&mut self, mut writer: BufWriter<File>, frames_written: u64) {
        let data_bytes = (frames_written * self.format.frame_bytes() as u64) as u32;
        let patch = (|| -> std::io::Result<()> {
            writer.seek(SeekFrom::Start(4))?;
            writer.write_all(&(36 + data_bytes).to_le_bytes())?;
            writer.seek(SeekFrom::Start(40))?;
            writer.write_all(&data_bytes.to_le_bytes())?;
            writer.flush()
        })();
        if let Err(e) = patch {
            tracing::warn!(label = %self.label, error = %e, "failed to finalize wave header");
        }
    }
}

impl AudioObject for WavFile {
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
            nonblocking: false,
            finite_length: true,
            format_locked: true,
            realtime: false,
            loop_device: false,
        }
    }

    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn set_format(&mut self, format: AudioFormat) -> Result<(), EngineError> {
        if self.io.is_some() {
            return Err(EngineError::FormatLocked {
                label: self.label.clone(),
            });
        }
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
        if self.io.is_some() {
            return Ok(());
        }
        match self.mode {
            IoMode::Read => self.open_reader(),
            IoMode::Write | IoMode::ReadWrite => self.open_writer(),
        }
    }

    fn close(&mut self) {
        if let Some(io) = self.io.take() {
            if let Io::Writer {
                file,
                frames_written,
            } = io
            {
                self.finalize_writer(file, frames_written);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.io.is_some()
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> usize {
        if self.finished {
            buf.set_frames(0);
            return 0;
        }
        let Some(Io::Reader {
            file, data_frames, ..
        }) = &mut self.io
        else {
            buf.set_frames(0);
            return 0;
        };

        let remaining = data_frames.saturating_sub(self.position);
        let frames = (self.buffersize as u64).min(remaining) as usize;
        if frames == 0 {
            self.finished = true;
            buf.set_frames(0);
            return 0;
        }

        let mut bytes = vec![0u8; frames * self.format.frame_bytes()];
        match file.read_exact(&mut bytes) {
            Ok(()) => {
                if buf.channel_count() < self.format.channels {
                    buf.resize(self.format.channels, buf.capacity());
                }
                crate::format::decode_frames(&bytes, &self.format, frames, buf);
                buf.set_sample_rate(self.format.sample_rate);
                self.position += frames as u64;
                if self.position >= *data_frames {
                    self.finished = true;
                }
                frames
            }
            Err(e) => {
                tracing::warn!(label = %self.label, error = %e, "wave read failed");
                self.finished = true;
                buf.set_frames(0);
                0
            }
        }
    }

    fn write(&mut self, buf: &SampleBuffer) {
        if self.finished {
            return;
        }
        let bytes = encode_frames(buf, &self.format);
        let Some(Io::Writer {
            file,
            frames_written,
        }) = &mut self.io
        else {
            return;
        };
        match file.write_all(&bytes) {
            Ok(()) => {
                *frames_written += buf.frames() as u64;
                self.position += buf.frames() as u64;
            }
            Err(e) => {
                tracing::warn!(label = %self.label, error = %e, "wave write failed");
                self.finished = true;
            }
        }
    }

    fn seek(&mut self, frame: u64) -> u64 {
        let frame_bytes = self.format.frame_bytes() as u64;
        match &mut self.io {
            Some(Io::Reader {
                file,
                data_start,
                data_frames,
            }) => {
                let target = frame.min(*data_frames);
                match file.seek(SeekFrom::Start(*data_start + target * frame_bytes)) {
                    Ok(_) => {
                        self.position = target;
                        self.finished = target >= *data_frames;
                    }
                    Err(e) => {
                        tracing::warn!(label = %self.label, error = %e, "wave seek failed");
                        self.finished = true;
                    }
                }
            }
            Some(Io::Writer {
                file,
                frames_written,
            }) => {
                let target = frame.min(*frames_written);
                match file.seek(SeekFrom::Start(HEADER_BYTES + target * frame_bytes)) {
                    Ok(_) => self.position = target,
                    Err(e) => {
                        tracing::warn!(label = %self.label, error = %e, "wave seek failed");
                    }
                }
            }
            None => self.position = frame,
        }
        self.position
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> Option<u64> {
        match &self.io {
            Some(Io::Reader { data_frames, .. }) => Some(*data_frames),
            Some(Io::Writer { frames_written, .. }) => Some(*frames_written),
            None => None,
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

impl Drop for WavFile {
    fn drop(&mut self) {
        self.close();
    }
}

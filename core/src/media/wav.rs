//! WAV / raw PCM audio source with 16-bit normalization.
//!
//! Samples in 24-bit, 32-bit integer or 32-bit float WAV files are converted
//! to 16-bit little-endian PCM as they are read.

use super::error::MediaError;
use super::validate::validate_file_path;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_BIT_DEPTH: u16 = 16;

const WAV_HEADER_SIZE: usize = 44;
const MIN_FMT_CHUNK_SIZE: u32 = 16;
const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;

/// Sample encoding of the underlying data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm16,
    Pcm24,
    Pcm32,
    Float32,
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::Pcm24 => 3,
            AudioFormat::Pcm32 | AudioFormat::Float32 => 4,
        }
    }
}

fn wav_error(message: impl Into<String>) -> MediaError {
    MediaError::conversion(0, "audio", "wav", message)
}

/// Sequential reader over the audio data region of a WAV or raw PCM stream
pub struct AudioFileSource<R> {
    reader: R,
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
    format: AudioFormat,
    data_start: u64,
    data_size: u64,
    remaining: u64,
}

impl AudioFileSource<BufReader<File>> {
    /// Open a `.wav`, `.pcm` or `.raw` file after path validation
    pub fn open(file_path: &str, base_dir: Option<&Path>) -> Result<Self, MediaError> {
        let path = validate_file_path(file_path, base_dir).map_err(|e| e.at(0, "audio"))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let file = File::open(&path)
            .map_err(|e| MediaError::file(0, "audio", file_path, format!("failed to open: {e}")))?;
        let reader = BufReader::new(file);
        match ext.as_str() {
            "wav" => Self::from_wav(reader).map_err(|e| MediaError { origin: file_path.to_string(), ..e }),
            "pcm" | "raw" => Self::from_raw_pcm(reader, DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS),
            other => Err(MediaError::validation(
                0,
                "audio",
                file_path,
                format!("unsupported audio file extension '{other}' (expected wav, pcm or raw)"),
            )),
        }
    }
}

impl<R: Read + Seek> AudioFileSource<R> {
    /// Parse a RIFF/WAVE header and position at the start of the `data` chunk
    pub fn from_wav(mut reader: R) -> Result<Self, MediaError> {
        let mut riff = [0u8; 12];
        reader
            .read_exact(&mut riff)
            .map_err(|e| wav_error(format!("failed to read RIFF header: {e}")))?;
        if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
            return Err(wav_error("not a RIFF/WAVE file"));
        }

        let mut fmt: Option<(u16, u32, u16, AudioFormat)> = None;
        loop {
            let mut header = [0u8; 8];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(wav_error("data chunk not found"))
                }
                Err(e) => return Err(wav_error(format!("failed to read chunk header: {e}"))),
            }
            let id = &header[0..4];
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            match id {
                b"fmt " => fmt = Some(parse_fmt_chunk(&mut reader, size)?),
                b"data" => {
                    let (channels, sample_rate, bit_depth, format) =
                        fmt.ok_or_else(|| wav_error("data chunk before fmt chunk"))?;
                    let data_start = reader
                        .stream_position()
                        .map_err(|e| wav_error(format!("failed to locate data chunk: {e}")))?;
                    return Ok(Self {
                        reader,
                        sample_rate,
                        channels,
                        bit_depth,
                        format,
                        data_start,
                        data_size: size as u64,
                        remaining: size as u64,
                    });
                }
                _ => {
                    // RIFF chunks are padded to an even size
                    let skip = size as i64 + (size % 2) as i64;
                    reader
                        .seek(SeekFrom::Current(skip))
                        .map_err(|e| wav_error(format!("failed to skip chunk: {e}")))?;
                }
            }
        }
    }

    /// Headerless 16-bit PCM; the whole stream is audio data
    pub fn from_raw_pcm(mut reader: R, sample_rate: u32, channels: u16) -> Result<Self, MediaError> {
        let data_start = reader
            .stream_position()
            .map_err(|e| wav_error(format!("failed to read position: {e}")))?;
        let end = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| wav_error(format!("failed to measure stream: {e}")))?;
        reader
            .seek(SeekFrom::Start(data_start))
            .map_err(|e| wav_error(format!("failed to seek: {e}")))?;
        let data_size = end - data_start;
        Ok(Self {
            reader,
            sample_rate,
            channels,
            bit_depth: DEFAULT_BIT_DEPTH,
            format: AudioFormat::Pcm16,
            data_start,
            data_size,
            remaining: data_size,
        })
    }

    /// Read up to `size` source bytes, returned as 16-bit PCM; `None` at end of data.
    ///
    /// The request is rounded down to whole samples (at least one) so samples
    /// never straddle two reads.
    pub fn read_chunk(&mut self, size: usize) -> Result<Option<Vec<u8>>, MediaError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let sample = self.format.bytes_per_sample();
        let aligned = (size / sample).max(1) * sample;
        let want = aligned.min(self.remaining as usize);

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .map_err(|e| wav_error(format!("failed to read audio data: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            self.remaining = 0;
            return Ok(None);
        }
        buf.truncate(filled);
        self.remaining -= filled as u64;
        Ok(Some(convert_to_pcm16(&buf, self.format)))
    }

    /// Remaining data as 16-bit PCM
    pub fn read_all(&mut self) -> Result<Vec<u8>, MediaError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk(64 * 1024)? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Seek back to the first byte of audio data
    pub fn reset(&mut self) -> Result<(), MediaError> {
        self.reader
            .seek(SeekFrom::Start(self.data_start))
            .map_err(|e| wav_error(format!("failed to seek to data start: {e}")))?;
        self.remaining = self.data_size;
        Ok(())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.data_size == 0 || self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let frame = (self.format.bytes_per_sample() * self.channels as usize) as u64;
        (self.data_size / frame) as f64 / self.sample_rate as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Bit depth of the source data (output is always 16-bit)
    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }
}

fn parse_fmt_chunk<R: Read + Seek>(reader: &mut R, size: u32) -> Result<(u16, u32, u16, AudioFormat), MediaError> {
    if size < MIN_FMT_CHUNK_SIZE {
        return Err(wav_error("fmt chunk too small"));
    }
    // Only the fixed PCM fields are read; extension bytes and padding are skipped
    let mut data = [0u8; MIN_FMT_CHUNK_SIZE as usize];
    reader
        .read_exact(&mut data)
        .map_err(|e| wav_error(format!("failed to read fmt chunk: {e}")))?;
    let skip = (size - MIN_FMT_CHUNK_SIZE) as i64 + (size % 2) as i64;
    if skip > 0 {
        reader
            .seek(SeekFrom::Current(skip))
            .map_err(|e| wav_error(format!("failed to skip fmt extension: {e}")))?;
    }

    let audio_format = u16::from_le_bytes([data[0], data[1]]);
    let channels = u16::from_le_bytes([data[2], data[3]]);
    let sample_rate = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let bit_depth = u16::from_le_bytes([data[14], data[15]]);

    let format = match (audio_format, bit_depth) {
        (FORMAT_PCM, 16) => AudioFormat::Pcm16,
        (FORMAT_PCM, 24) => AudioFormat::Pcm24,
        (FORMAT_PCM, 32) => AudioFormat::Pcm32,
        (FORMAT_PCM, other) => return Err(wav_error(format!("unsupported PCM bit depth: {other}"))),
        (FORMAT_IEEE_FLOAT, 32) => AudioFormat::Float32,
        (FORMAT_IEEE_FLOAT, other) => {
            return Err(wav_error(format!("unsupported float bit depth: {other}")))
        }
        (code, _) => {
            return Err(wav_error(format!(
                "unsupported audio format code: {code} (only PCM and IEEE float supported)"
            )))
        }
    };
    Ok((channels, sample_rate, bit_depth, format))
}

/// Convert raw samples to 16-bit little-endian PCM; trailing partial samples are dropped
pub fn convert_to_pcm16(data: &[u8], format: AudioFormat) -> Vec<u8> {
    match format {
        AudioFormat::Pcm16 => data.to_vec(),
        AudioFormat::Pcm24 => data
            .chunks_exact(3)
            .flat_map(|s| {
                // sign-extend by placing the 24 bits in the top of an i32
                let v = i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8;
                ((v >> 8) as i16).to_le_bytes()
            })
            .collect(),
        AudioFormat::Pcm32 => data
            .chunks_exact(4)
            .flat_map(|s| ((i32::from_le_bytes([s[0], s[1], s[2], s[3]]) >> 16) as i16).to_le_bytes())
            .collect(),
        AudioFormat::Float32 => data
            .chunks_exact(4)
            .flat_map(|s| {
                let f = f32::from_le_bytes([s[0], s[1], s[2], s[3]]).clamp(-1.0, 1.0);
                ((f * 32767.0) as i16).to_le_bytes()
            })
            .collect(),
    }
}

/// Prepend a 44-byte canonical WAV header to PCM data
pub fn wrap_pcm_in_wav(pcm: &[u8], sample_rate: u32, bits_per_sample: u16, channels: u16) -> Vec<u8> {
    let data_size = pcm.len() as u32;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut wav = Vec::with_capacity(WAV_HEADER_SIZE + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&MIN_FMT_CHUNK_SIZE.to_le_bytes());
    wav.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

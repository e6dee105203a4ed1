//! Mapping buffer layout.
//!
//! A buffer is a stream of little-endian 16-bit words: a 256-word buffer
//! header followed by `numPixels` pixel blocks. Each pixel block starts with
//! its own 256-word header and is `blockSize` words long. 32-bit fields are
//! stored as low word, high word.

use crate::Result;
use log::warn;

pub const BUFFER_HEADER_WORDS: usize = 256;
pub const PIXEL_HEADER_WORDS: usize = 256;

pub const BUFFER_TAG0: u16 = 0x55AA;
pub const BUFFER_TAG1: u16 = 0xAA55;
pub const PIXEL_TAG0: u16 = 0x33CC;
pub const PIXEL_TAG1: u16 = 0xCC33;

/// Length of one statistics tick in seconds.
pub const TICK_SECONDS: f64 = 320e-9;

mod offset {
    pub const TAG0: usize = 0;
    pub const TAG1: usize = 1;
    pub const HEADER_SIZE: usize = 2;
    pub const MAPPING_MODE: usize = 3;
    pub const RUN_NUMBER: usize = 4;
    pub const BUFFER_NUMBER: usize = 5;
    pub const BUFFER_ID: usize = 7;
    pub const NUM_PIXELS: usize = 8;
    pub const FIRST_PIXEL: usize = 9;
    pub const MODULE_NUMBER: usize = 11;
    pub const CHANNEL_ID: usize = 12;
    pub const CHANNEL_ELEMENT: usize = 13;
    pub const CHANNEL_SIZE: usize = 20;
    pub const BUFFER_ERRORS: usize = 24;

    pub const PIXEL_NUMBER: usize = 4;
    pub const BLOCK_SIZE: usize = 6;
    pub const SPECTRUM_SIZE: usize = 8;
    pub const REALTIME: usize = 32;
    pub const TRIGGER_LIVETIME: usize = 34;
    pub const TRIGGERS: usize = 36;
    pub const OUTPUT_COUNTS: usize = 38;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingMode {
    FullSpectrum = 1,
    MultiRoi = 2,
    List = 3,
}

impl TryFrom<u16> for MappingMode {
    type Error = crate::HandelError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MappingMode::FullSpectrum),
            2 => Ok(MappingMode::MultiRoi),
            3 => Ok(MappingMode::List),
            other => Err(err!(Decode, "unknown mapping mode {other}")),
        }
    }
}

/// Which half of the A/B pair a buffer came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BufferId {
    #[default]
    A,
    B,
}

impl BufferId {
    pub fn flip(self) -> Self {
        match self {
            BufferId::A => BufferId::B,
            BufferId::B => BufferId::A,
        }
    }

    pub fn letter(self) -> char {
        match self {
            BufferId::A => 'a',
            BufferId::B => 'b',
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferHeader {
    pub header_size: u16,
    pub mode: MappingMode,
    pub run_number: u16,
    pub buffer_number: u32,
    pub buffer_id: BufferId,
    pub num_pixels: u16,
    pub first_pixel: u32,
    pub module_number: u16,
    pub channel_id: u16,
    pub channel_element: u16,
    pub channel_size: u16,
    pub buffer_errors: u16,
}

/// Raw statistics words of one pixel on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PixelStats {
    pub realtime: u32,
    pub trigger_livetime: u32,
    pub triggers: u32,
    pub output_counts: u32,
}

impl PixelStats {
    pub fn realtime_sec(&self) -> f64 {
        f64::from(self.realtime) * TICK_SECONDS
    }

    pub fn trigger_livetime_sec(&self) -> f64 {
        f64::from(self.trigger_livetime) * TICK_SECONDS
    }

    pub fn energy_livetime_sec(&self) -> f64 {
        let trigger_livetime = self.trigger_livetime_sec();
        if self.triggers == 0 {
            trigger_livetime
        } else {
            trigger_livetime * f64::from(self.output_counts) / f64::from(self.triggers)
        }
    }

    /// Input count rate.
    pub fn icr(&self) -> f64 {
        rate(self.triggers, self.trigger_livetime_sec())
    }

    /// Output count rate.
    pub fn ocr(&self) -> f64 {
        rate(self.output_counts, self.realtime_sec())
    }
}

fn rate(counts: u32, seconds: f64) -> f64 {
    if seconds > 0.0 {
        f64::from(counts) / seconds
    } else {
        0.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PixelData {
    Spectrum(Vec<u32>),
    Rois(Vec<u32>),
}

impl PixelData {
    pub fn counts(&self) -> &[u32] {
        match self {
            PixelData::Spectrum(c) | PixelData::Rois(c) => c,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pixel {
    pub number: u32,
    pub block_size: u32,
    pub stats: PixelStats,
    pub data: PixelData,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MappingBuffer {
    pub header: BufferHeader,
    pub pixels: Vec<Pixel>,
}

fn word(words: &[u16], at: usize) -> Result<u16> {
    words
        .get(at)
        .copied()
        .ok_or_else(|| err!(Decode, "word {at} is past the end of a {}-word buffer", words.len()))
}

fn dword(words: &[u16], at: usize) -> Result<u32> {
    Ok(u32::from(word(words, at)?) | (u32::from(word(words, at + 1)?) << 16))
}

fn put_dword(words: &mut [u16], at: usize, value: u32) {
    words[at] = (value & 0xFFFF) as u16;
    words[at + 1] = (value >> 16) as u16;
}

/// Reinterpret little-endian bytes as 16-bit words.
pub fn words_from_le_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn parse_buffer_header(words: &[u16]) -> Result<BufferHeader> {
    let tag0 = word(words, offset::TAG0)?;
    if tag0 != BUFFER_TAG0 {
        bail!(Decode, "bad buffer tag {tag0:#06x}");
    }
    let header_size = word(words, offset::HEADER_SIZE)?;
    if usize::from(header_size) < offset::BUFFER_ERRORS + 1 || usize::from(header_size) > words.len() {
        bail!(Decode, "buffer header size {header_size} does not fit a {}-word buffer", words.len());
    }
    let buffer_id = match word(words, offset::BUFFER_ID)? {
        0 => BufferId::A,
        1 => BufferId::B,
        other => bail!(Decode, "bad buffer id {other}"),
    };
    Ok(BufferHeader {
        header_size,
        mode: MappingMode::try_from(word(words, offset::MAPPING_MODE)?)?,
        run_number: word(words, offset::RUN_NUMBER)?,
        buffer_number: dword(words, offset::BUFFER_NUMBER)?,
        buffer_id,
        num_pixels: word(words, offset::NUM_PIXELS)?,
        first_pixel: dword(words, offset::FIRST_PIXEL)?,
        module_number: word(words, offset::MODULE_NUMBER)?,
        channel_id: word(words, offset::CHANNEL_ID)?,
        channel_element: word(words, offset::CHANNEL_ELEMENT)?,
        channel_size: word(words, offset::CHANNEL_SIZE)?,
        buffer_errors: word(words, offset::BUFFER_ERRORS)?,
    })
}

/// Decode the pixel block starting at word 0 of `block`, which runs to the
/// end of the buffer.
///
/// Only reads past the end of the buffer are errors. A payload that overruns
/// its block or the buffer is clipped to the words that exist.
fn parse_pixel(block: &[u16], mode: MappingMode) -> Result<Pixel> {
    let header_size = usize::from(word(block, offset::HEADER_SIZE)?);
    if header_size <= offset::OUTPUT_COUNTS + 1 {
        bail!(Decode, "pixel header size {header_size} is too small");
    }
    let number = dword(block, offset::PIXEL_NUMBER)?;
    let block_size = dword(block, offset::BLOCK_SIZE)?;
    if block_size == 0 {
        bail!(Decode, "pixel {number}: block size is zero");
    }
    let spectrum_size = usize::from(word(block, offset::SPECTRUM_SIZE)?);
    let stats = PixelStats {
        realtime: dword(block, offset::REALTIME)?,
        trigger_livetime: dword(block, offset::TRIGGER_LIVETIME)?,
        triggers: dword(block, offset::TRIGGERS)?,
        output_counts: dword(block, offset::OUTPUT_COUNTS)?,
    };

    let payload_words = match mode {
        MappingMode::FullSpectrum => spectrum_size,
        MappingMode::MultiRoi => 2 * spectrum_size,
        MappingMode::List => bail!(Decode, "list mode buffers have no pixel blocks"),
    };
    if header_size + payload_words > block_size as usize {
        warn!(
            "pixel {number}: header {header_size} + data {payload_words} overruns block size {block_size}"
        );
    }
    let available = block.len().saturating_sub(header_size);
    if payload_words > available {
        warn!("pixel {number}: {payload_words} data words requested, {available} left in the buffer");
    }
    let payload = block
        .get(header_size..header_size + payload_words.min(available))
        .unwrap_or_default();
    let data = match mode {
        MappingMode::FullSpectrum => PixelData::Spectrum(payload.iter().map(|&w| u32::from(w)).collect()),
        _ => PixelData::Rois(
            payload
                .chunks_exact(2)
                .map(|pair| u32::from(pair[0]) | (u32::from(pair[1]) << 16))
                .collect(),
        ),
    };
    Ok(Pixel {
        number,
        block_size,
        stats,
        data,
    })
}

/// Decode a whole buffer. Every size field is checked against the buffer
/// length before it is used.
pub fn parse_buffer(words: &[u16]) -> Result<MappingBuffer> {
    let header = parse_buffer_header(words)?;
    let mut pixels = Vec::with_capacity(usize::from(header.num_pixels));
    if header.mode != MappingMode::List {
        let mut start = usize::from(header.header_size);
        for k in 0..header.num_pixels {
            let block = words.get(start..).unwrap_or_default();
            let pixel = parse_pixel(block, header.mode).map_err(|e| {
                e.context(format!("buffer {} pixel slot {k}", header.buffer_number))
            })?;
            start += pixel.block_size as usize;
            pixels.push(pixel);
        }
    }
    Ok(MappingBuffer { header, pixels })
}

/// Write a buffer of `words_per_buffer` words holding `pixels`.
///
/// `header.num_pixels` is taken from `pixels`. Used by the simulated
/// backend and by tests.
pub fn encode_buffer(
    header: &BufferHeader,
    pixels: &[Pixel],
    words_per_buffer: usize,
) -> Result<Vec<u16>> {
    let header_size = usize::from(header.header_size);
    let mut words = vec![0u16; words_per_buffer];
    if header_size > words_per_buffer || header_size <= offset::BUFFER_ERRORS {
        bail!(Encode, "buffer header size {header_size} does not fit {words_per_buffer} words");
    }
    let num_pixels = u16::try_from(pixels.len())
        .map_err(|_| err!(Encode, "{} pixels do not fit one buffer", pixels.len()))?;
    words[offset::TAG0] = BUFFER_TAG0;
    words[offset::TAG1] = BUFFER_TAG1;
    words[offset::HEADER_SIZE] = header.header_size;
    words[offset::MAPPING_MODE] = header.mode as u16;
    words[offset::RUN_NUMBER] = header.run_number;
    put_dword(&mut words, offset::BUFFER_NUMBER, header.buffer_number);
    words[offset::BUFFER_ID] = match header.buffer_id {
        BufferId::A => 0,
        BufferId::B => 1,
    };
    words[offset::NUM_PIXELS] = num_pixels;
    put_dword(&mut words, offset::FIRST_PIXEL, header.first_pixel);
    words[offset::MODULE_NUMBER] = header.module_number;
    words[offset::CHANNEL_ID] = header.channel_id;
    words[offset::CHANNEL_ELEMENT] = header.channel_element;
    words[offset::CHANNEL_SIZE] = header.channel_size;
    words[offset::BUFFER_ERRORS] = header.buffer_errors;

    let mut start = header_size;
    for pixel in pixels {
        let block_size = pixel.block_size as usize;
        let counts = pixel.data.counts();
        let payload_words = match pixel.data {
            PixelData::Spectrum(_) => counts.len(),
            PixelData::Rois(_) => 2 * counts.len(),
        };
        if PIXEL_HEADER_WORDS + payload_words > block_size || start + block_size > words_per_buffer {
            bail!(Encode, "pixel {} does not fit the buffer", pixel.number);
        }
        let spectrum_size = u16::try_from(counts.len())
            .map_err(|_| err!(Encode, "pixel {} has too many bins", pixel.number))?;
        let block = &mut words[start..start + block_size];
        block[offset::TAG0] = PIXEL_TAG0;
        block[offset::TAG1] = PIXEL_TAG1;
        block[offset::HEADER_SIZE] = PIXEL_HEADER_WORDS as u16;
        block[offset::MAPPING_MODE] = header.mode as u16;
        put_dword(block, offset::PIXEL_NUMBER, pixel.number);
        put_dword(block, offset::BLOCK_SIZE, pixel.block_size);
        block[offset::SPECTRUM_SIZE] = spectrum_size;
        put_dword(block, offset::REALTIME, pixel.stats.realtime);
        put_dword(block, offset::TRIGGER_LIVETIME, pixel.stats.trigger_livetime);
        put_dword(block, offset::TRIGGERS, pixel.stats.triggers);
        put_dword(block, offset::OUTPUT_COUNTS, pixel.stats.output_counts);
        let payload = &mut block[PIXEL_HEADER_WORDS..];
        match &pixel.data {
            // Bins are 16 bits wide on the wire.
            PixelData::Spectrum(bins) => {
                for (slot, &bin) in payload.iter_mut().zip(bins) {
                    *slot = bin.min(u32::from(u16::MAX)) as u16;
                }
            }
            PixelData::Rois(rois) => {
                for (i, &roi) in rois.iter().enumerate() {
                    put_dword(payload, 2 * i, roi);
                }
            }
        }
        start += block_size;
    }
    Ok(words)
}

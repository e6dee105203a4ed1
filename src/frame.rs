use ndarray::Array2;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-pixel statistics attached to a spectra frame, one per channel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelAttributes {
    pub realtime: f64,
    pub trigger_livetime: f64,
    pub triggers: i32,
    pub output_counts: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameData {
    /// Raw buffer words, shape `[words_per_buffer, n_channels]`.
    Raw(Array2<u16>),
    /// One spectrum per channel, shape `[spectrum_size, n_channels]`.
    Spectra(Array2<u32>),
}

/// A decoded unit of acquisition output handed to consumers.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Unique and increasing over the life of the process.
    pub id: u64,
    /// Pixel number for mapping spectra, `None` otherwise.
    pub pixel: Option<u32>,
    pub data: FrameData,
    /// Empty for raw frames.
    pub attributes: Vec<ChannelAttributes>,
}

impl Frame {
    pub fn raw(words: Array2<u16>) -> Self {
        Frame {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            pixel: None,
            data: FrameData::Raw(words),
            attributes: Vec::new(),
        }
    }

    pub fn spectra(
        pixel: Option<u32>,
        spectra: Array2<u32>,
        attributes: Vec<ChannelAttributes>,
    ) -> Self {
        Frame {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            pixel,
            data: FrameData::Spectra(spectra),
            attributes,
        }
    }

    /// Number of channel columns.
    pub fn n_channels(&self) -> usize {
        match &self.data {
            FrameData::Raw(a) => a.ncols(),
            FrameData::Spectra(a) => a.ncols(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match &self.data {
            FrameData::Raw(a) => a.len() * std::mem::size_of::<u16>(),
            FrameData::Spectra(a) => a.len() * std::mem::size_of::<u32>(),
        }
    }
}

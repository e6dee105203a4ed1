use crate::config::FrameMode;
use crate::frame::{ChannelAttributes, Frame, FrameData};
use anyhow::{anyhow, Result};
use hdf5::{Dataset, File, Group, H5Type};
use ndarray::{s, Array2, Array3, ArrayView2};
use std::path::Path;

/// Records decoded frames to an HDF5 file, one group per frame kind.
///
/// Frames are stored channel-major: `data[frame, channel, bin]`.
pub struct FrameWriter {
    pub file: File,
    mode: FrameMode,
    raw: Option<BlockData<u16>>,
    spectra: Option<BlockData<u32>>,
}

impl FrameWriter {
    pub fn new(
        path: impl AsRef<Path>,
        mode: FrameMode,
        n_channels: usize,
        frame_len: usize,
        max_frames: usize,
        buffer_capacity: usize,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let (raw, spectra) = match mode {
            FrameMode::RawBuffers => {
                let group = file.create_group("raw")?;
                let data = BlockData::new(&group, n_channels, frame_len, max_frames, buffer_capacity)?;
                (Some(data), None)
            }
            FrameMode::McaSpectra => {
                let group = file.create_group("spectra")?;
                let data = BlockData::new(&group, n_channels, frame_len, max_frames, buffer_capacity)?;
                (None, Some(data))
            }
        };
        Ok(Self {
            file,
            mode,
            raw,
            spectra,
        })
    }

    pub fn append(&mut self, frame: &Frame) -> Result<()> {
        match (&frame.data, &mut self.raw, &mut self.spectra) {
            (FrameData::Raw(words), Some(raw), _) => raw.append(frame, words.t()),
            (FrameData::Spectra(counts), _, Some(spectra)) => spectra.append(frame, counts.t()),
            _ => Err(anyhow!("frame {} does not match {:?} output", frame.id, self.mode)),
        }
    }

    pub fn flush_all(&mut self) -> Result<()> {
        if let Some(raw) = &mut self.raw {
            raw.flush()?;
        }
        if let Some(spectra) = &mut self.spectra {
            spectra.flush()?;
        }
        Ok(())
    }
}

/// Datasets and write buffer for one frame kind.
struct BlockData<T> {
    current_frame: usize,
    max_frames: usize,
    ids: Dataset,
    data: Dataset,
    realtime: Dataset,
    trigger_livetime: Dataset,
    triggers: Dataset,
    output_counts: Dataset,
    buffer_capacity: usize,
    buffer_count: usize,
    id_buffer: Array2<u64>,
    data_buffer: Array3<T>,
    attr_buffer: Vec<ChannelAttributes>,
    n_channels: usize,
    frame_len: usize,
}

impl<T: H5Type + Clone + Default> BlockData<T> {
    fn new(
        group: &Group,
        n_channels: usize,
        frame_len: usize,
        max_frames: usize,
        buffer_capacity: usize,
    ) -> Result<Self> {
        let buffer_capacity = buffer_capacity.clamp(1, max_frames.max(1));
        let ids = group
            .new_dataset::<u64>()
            .shape((max_frames, 1))
            .chunk((buffer_capacity, 1))
            .create("frame_id")?;
        let data = group
            .new_dataset::<T>()
            .shape((max_frames, n_channels, frame_len))
            .chunk((buffer_capacity, n_channels, frame_len))
            .create("data")?;
        let per_channel = |name: &str| -> Result<Dataset> {
            Ok(group
                .new_dataset::<f64>()
                .shape((max_frames, n_channels))
                .chunk((buffer_capacity, n_channels))
                .create(name)?)
        };
        let realtime = per_channel("realtime")?;
        let trigger_livetime = per_channel("trigger_livetime")?;
        let counts = |name: &str| -> Result<Dataset> {
            Ok(group
                .new_dataset::<i32>()
                .shape((max_frames, n_channels))
                .chunk((buffer_capacity, n_channels))
                .create(name)?)
        };
        let triggers = counts("triggers")?;
        let output_counts = counts("output_counts")?;

        Ok(Self {
            current_frame: 0,
            max_frames,
            ids,
            data,
            realtime,
            trigger_livetime,
            triggers,
            output_counts,
            buffer_capacity,
            buffer_count: 0,
            id_buffer: Array2::zeros((buffer_capacity, 1)),
            data_buffer: Array3::from_elem((buffer_capacity, n_channels, frame_len), T::default()),
            attr_buffer: Vec::with_capacity(buffer_capacity * n_channels),
            n_channels,
            frame_len,
        })
    }

    fn append(&mut self, frame: &Frame, data: ArrayView2<'_, T>) -> Result<()> {
        let (channels, len) = data.dim();
        if channels != self.n_channels || len > self.frame_len {
            return Err(anyhow!(
                "frame {} is {channels}x{len}, dataset holds {}x{}",
                frame.id,
                self.n_channels,
                self.frame_len
            ));
        }
        if self.current_frame + self.buffer_count >= self.max_frames {
            return Err(anyhow!("maximum number of frames reached"));
        }

        self.id_buffer[[self.buffer_count, 0]] = frame.id;
        self.data_buffer
            .slice_mut(s![self.buffer_count, .., 0..len])
            .assign(&data);
        if frame.attributes.len() == self.n_channels {
            self.attr_buffer.extend_from_slice(&frame.attributes);
        } else {
            self.attr_buffer
                .extend(std::iter::repeat(ChannelAttributes::default()).take(self.n_channels));
        }
        self.buffer_count += 1;

        if self.buffer_count == self.buffer_capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer_count == 0 {
            return Ok(());
        }
        let rows = self.current_frame..self.current_frame + self.buffer_count;

        let ids = self.id_buffer.slice(s![0..self.buffer_count, ..]).to_owned();
        self.ids.write_slice(&ids, (rows.clone(), ..))?;
        let data = self
            .data_buffer
            .slice(s![0..self.buffer_count, .., ..])
            .to_owned();
        self.data.write_slice(&data, (rows.clone(), .., ..))?;

        let shape = (self.buffer_count, self.n_channels);
        let column = |f: fn(&ChannelAttributes) -> f64| {
            Array2::from_shape_vec(shape, self.attr_buffer.iter().map(f).collect())
        };
        self.realtime
            .write_slice(&column(|a| a.realtime)?, (rows.clone(), ..))?;
        self.trigger_livetime
            .write_slice(&column(|a| a.trigger_livetime)?, (rows.clone(), ..))?;
        let column = |f: fn(&ChannelAttributes) -> i32| {
            Array2::from_shape_vec(shape, self.attr_buffer.iter().map(f).collect())
        };
        self.triggers
            .write_slice(&column(|a| a.triggers)?, (rows.clone(), ..))?;
        self.output_counts
            .write_slice(&column(|a| a.output_counts)?, (rows, ..))?;

        self.current_frame += self.buffer_count;
        self.buffer_count = 0;
        self.attr_buffer.clear();
        self.data_buffer.fill(T::default());
        Ok(())
    }
}

//! The polling worker.
//!
//! One thread per driver instance sleeps on its command channel until an
//! acquisition starts, then polls the hardware every `poll_time` under the
//! driver lock. Mapping runs are read out buffer pair by buffer pair and
//! decoded into [`Frame`]s; MCA runs are read once all channels finish.

use crate::channels::ALL_CHANNELS;
use crate::config::{FrameMode, PollingSettings};
use crate::frame::{ChannelAttributes, Frame};
use crate::mapping::{self, BufferId, PixelData};
use crate::{Counter, Handel, Result, SharedHandel, Value};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Acquisition flavour, selecting the backend `mapping_mode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectMode {
    Mca,
    McaMapping,
    ScaMapping,
    ListMapping,
}

impl CollectMode {
    pub fn mapping_mode(self) -> f64 {
        match self {
            CollectMode::Mca => 0.0,
            CollectMode::McaMapping => 1.0,
            CollectMode::ScaMapping => 2.0,
            CollectMode::ListMapping => 3.0,
        }
    }

    pub fn is_mapping(self) -> bool {
        self != CollectMode::Mca
    }
}

#[derive(Debug)]
pub enum Command {
    Start(CollectMode),
    Shutdown,
}

/// Readout results shared with callers while a run is in progress.
#[derive(Debug, Default)]
pub struct LiveData {
    /// detChans in readout order; column `i` of every frame is `channels[i]`.
    pub channels: Vec<i32>,
    /// Most recent spectrum per channel.
    pub spectra: Vec<Vec<u32>>,
    pub counter: Counter,
}

impl LiveData {
    pub fn spectrum(&self, det_chan: i32) -> Option<&[u32]> {
        let i = self.channels.iter().position(|&c| c == det_chan)?;
        self.spectra.get(i).map(Vec::as_slice)
    }
}

pub(crate) fn lock(handel: &SharedHandel) -> Result<MutexGuard<'_, Handel>> {
    handel
        .lock()
        .map_err(|_| err!(Unknown, "the driver lock is poisoned"))
}

/// What one buffer pair decoded to.
#[derive(Debug, Default)]
pub struct Decoded {
    pub frames: Vec<Frame>,
    pub pixels: usize,
    /// First pixel spectrum per channel, for full-spectrum buffers.
    pub first_spectra: Vec<Option<Vec<u32>>>,
}

/// Decode one buffer per channel, all from the same A/B half.
pub fn decode_buffers(buffers: &[Vec<u16>], mode: FrameMode, publish: bool) -> Result<Decoded> {
    let parsed = buffers
        .iter()
        .enumerate()
        .map(|(i, words)| {
            mapping::parse_buffer(words).map_err(|e| e.context(format!("channel {i}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let pixels = parsed.iter().map(|b| b.pixels.len()).min().unwrap_or(0);
    if parsed.iter().any(|b| b.pixels.len() != pixels) {
        warn!(
            "channels disagree on pixel count: {:?}",
            parsed.iter().map(|b| b.pixels.len()).collect::<Vec<_>>()
        );
    }
    let first_spectra = parsed
        .iter()
        .map(|b| match b.pixels.first().map(|p| &p.data) {
            Some(PixelData::Spectrum(s)) => Some(s.clone()),
            _ => None,
        })
        .collect();

    let mut frames = Vec::new();
    if publish {
        match mode {
            FrameMode::RawBuffers => {
                let words = buffers.iter().map(Vec::len).max().unwrap_or(0);
                let mut raw = Array2::<u16>::zeros((words, buffers.len()));
                for (c, buffer) in buffers.iter().enumerate() {
                    for (w, &word) in buffer.iter().enumerate() {
                        raw[[w, c]] = word;
                    }
                }
                frames.push(Frame::raw(raw));
            }
            FrameMode::McaSpectra => {
                for k in 0..pixels {
                    let size = parsed
                        .iter()
                        .map(|b| b.pixels[k].data.counts().len())
                        .max()
                        .unwrap_or(0);
                    let mut spectra = Array2::<u32>::zeros((size, parsed.len()));
                    let mut attributes = Vec::with_capacity(parsed.len());
                    for (c, buffer) in parsed.iter().enumerate() {
                        let pixel = &buffer.pixels[k];
                        for (bin, &counts) in pixel.data.counts().iter().enumerate() {
                            spectra[[bin, c]] = counts;
                        }
                        attributes.push(ChannelAttributes {
                            realtime: pixel.stats.realtime_sec(),
                            trigger_livetime: pixel.stats.trigger_livetime_sec(),
                            triggers: clamp_count(i64::from(pixel.stats.triggers), "triggers", c as i32),
                            output_counts: clamp_count(
                                i64::from(pixel.stats.output_counts),
                                "output_counts",
                                c as i32,
                            ),
                        });
                    }
                    let number = parsed.first().map(|b| b.pixels[k].number);
                    frames.push(Frame::spectra(number, spectra, attributes));
                }
            }
        }
    }

    Ok(Decoded {
        frames,
        pixels,
        first_spectra,
    })
}

/// Why an acquisition loop returned.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Finished,
    Shutdown,
}

pub struct Poller {
    handel: SharedHandel,
    live: Arc<Mutex<LiveData>>,
    frames: Sender<Frame>,
    commands: Receiver<Command>,
    settings: PollingSettings,
    polling: Arc<AtomicBool>,
    acquiring: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(
        handel: SharedHandel,
        live: Arc<Mutex<LiveData>>,
        frames: Sender<Frame>,
        commands: Receiver<Command>,
        settings: PollingSettings,
        polling: Arc<AtomicBool>,
        acquiring: Arc<AtomicBool>,
    ) -> Self {
        Poller {
            handel,
            live,
            frames,
            commands,
            settings,
            polling,
            acquiring,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn poll_time(&self) -> Duration {
        Duration::from_millis(self.settings.poll_time_ms.max(1))
    }

    fn run(self) {
        debug!("polling worker started");
        while self.polling.load(Ordering::SeqCst) {
            match self.commands.recv_timeout(self.poll_time()) {
                Ok(Command::Start(mode)) => {
                    self.acquiring.store(true, Ordering::SeqCst);
                    let exit = match mode {
                        CollectMode::Mca => self.acquire_mca(),
                        _ => self.acquire_mapping(mode),
                    };
                    self.acquiring.store(false, Ordering::SeqCst);
                    match exit {
                        Ok(Exit::Finished) => info!("{mode:?} acquisition finished"),
                        Ok(Exit::Shutdown) => break,
                        Err(e) => error!("{mode:?} acquisition failed: {e}"),
                    }
                }
                Ok(Command::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("polling worker exiting");
    }

    /// Sleep one period, then report whether the worker should stop.
    fn wait_tick(&self) -> bool {
        thread::sleep(self.poll_time());
        if !self.polling.load(Ordering::SeqCst) {
            return true;
        }
        match self.commands.try_recv() {
            Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => true,
            Ok(Command::Start(mode)) => {
                warn!("ignoring {mode:?} start, an acquisition is already running");
                false
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    fn channels(&self) -> Result<Vec<i32>> {
        let handel = lock(&self.handel)?;
        let mut channels = handel.channels().singles();
        channels.sort_unstable();
        Ok(channels)
    }

    fn reset_live(&self, channels: &[i32]) -> Result<()> {
        let mut live = self.live_data()?;
        live.channels = channels.to_vec();
        live.spectra = vec![Vec::new(); channels.len()];
        live.counter.reset();
        Ok(())
    }

    fn live_data(&self) -> Result<MutexGuard<'_, LiveData>> {
        self.live
            .lock()
            .map_err(|_| err!(Unknown, "the live data lock is poisoned"))
    }

    fn publish(&self, frames: Vec<Frame>) {
        for frame in frames {
            if self.frames.send(frame).is_err() {
                trace!("no frame consumer, dropping frame");
            }
        }
    }

    fn acquire_mca(&self) -> Result<Exit> {
        let channels = self.channels()?;
        self.reset_live(&channels)?;

        loop {
            if self.wait_tick() {
                return Ok(Exit::Shutdown);
            }
            let mut handel = lock(&self.handel)?;
            if !any_run_active(&mut handel, &channels)? {
                break;
            }
        }

        let mut handel = lock(&self.handel)?;
        // The hardware ended the run; clear the driver's run bookkeeping too.
        handel.stop_run(ALL_CHANNELS)?;
        let mut spectra = Vec::with_capacity(channels.len());
        let mut attributes = Vec::with_capacity(channels.len());
        for &ch in &channels {
            spectra.push(handel.get_run_data(ch, "mca")?.into_counts()?);
            attributes.push(ChannelAttributes {
                realtime: handel.get_run_data(ch, "realtime")?.as_f64()?,
                trigger_livetime: handel.get_run_data(ch, "trigger_livetime")?.as_f64()?,
                triggers: clamp_count(handel.get_run_data(ch, "triggers")?.as_i64()?, "triggers", ch),
                output_counts: clamp_count(
                    handel.get_run_data(ch, "output_counts")?.as_i64()?,
                    "output_counts",
                    ch,
                ),
            });
        }
        drop(handel);

        let bins = spectra.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = Array2::<u32>::zeros((bins, channels.len()));
        for (c, spectrum) in spectra.iter().enumerate() {
            for (bin, &counts) in spectrum.iter().enumerate() {
                data[[bin, c]] = counts;
            }
        }
        let frame = Frame::spectra(None, data, attributes);
        {
            let mut live = self.live_data()?;
            live.counter.record_read(frame.size_bytes(), Duration::ZERO);
            live.spectra = spectra;
        }
        if self.settings.array_callbacks {
            self.publish(vec![frame]);
        }
        Ok(Exit::Finished)
    }

    fn acquire_mapping(&self, mode: CollectMode) -> Result<Exit> {
        let channels = self.channels()?;
        self.reset_live(&channels)?;
        let mut current = vec![BufferId::A; channels.len()];

        loop {
            if self.wait_tick() {
                return Ok(Exit::Shutdown);
            }
            self.read_pair(mode, &channels, &mut current)?;

            let stopping = {
                let mut handel = lock(&self.handel)?;
                let preset = self.settings.pixels_per_run as usize;
                if preset > 0 && self.live_data()?.counter.pixels >= preset {
                    info!("{preset} pixels acquired, stopping the run");
                    handel.stop_run(ALL_CHANNELS)?;
                    true
                } else if !any_run_active(&mut handel, &channels)? {
                    handel.stop_run(ALL_CHANNELS)?;
                    true
                } else {
                    false
                }
            };
            if stopping {
                while self.read_pair(mode, &channels, &mut current)? {}
                return Ok(Exit::Finished);
            }
        }
    }

    /// Read and decode the current buffer of every channel if all of them
    /// are full. Returns whether a pair was read.
    fn read_pair(
        &self,
        mode: CollectMode,
        channels: &[i32],
        current: &mut [BufferId],
    ) -> Result<bool> {
        let mut handel = lock(&self.handel)?;

        let mut full = Vec::with_capacity(channels.len());
        for (&ch, &id) in channels.iter().zip(current.iter()) {
            let progress = if mode == CollectMode::ListMapping {
                format!("list_buffer_len_{}", id.letter())
            } else {
                "current_pixel".to_string()
            };
            let at = handel.get_run_data(ch, &progress)?;
            trace!("detChan {ch}: {progress} = {at}");
            full.push(buffer_full(&mut handel, ch, id)?);
        }

        if mode == CollectMode::ListMapping && full.contains(&true) && full.contains(&false) {
            self.align_list_buffers(&mut handel, channels, current, &mut full)?;
        }
        if full.is_empty() || !full.iter().all(|&f| f) {
            return Ok(false);
        }

        let started = Instant::now();
        let mut buffers = Vec::with_capacity(channels.len());
        for (&ch, id) in channels.iter().zip(current.iter_mut()) {
            let words = handel
                .get_run_data(ch, &format!("buffer_{}", id.letter()))?
                .into_words()?;
            let mut done = Value::Char(id.letter());
            handel.board_operation(ch, "buffer_done", &mut done)?;
            buffers.push(words);
            *id = id.flip();
        }
        let elapsed = started.elapsed();
        drop(handel);

        let bytes = buffers.iter().map(|b| b.len() * 2).sum();
        let decoded = decode_buffers(&buffers, self.settings.frame_mode, self.settings.array_callbacks);
        let mut live = self.live_data()?;
        // The pair is acknowledged, so it counts as read even if it is corrupt.
        live.counter.record_read(bytes, elapsed);
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(
                    "buffer pair {} dropped, {bytes} bytes undecoded: {e}",
                    live.counter.buffer_counter
                );
                return Ok(true);
            }
        };
        live.counter.pixels += decoded.pixels;
        if mode == CollectMode::McaMapping {
            for (slot, spectrum) in live.spectra.iter_mut().zip(decoded.first_spectra) {
                if let Some(spectrum) = spectrum {
                    *slot = spectrum;
                }
            }
        }
        debug!(
            "buffer pair {} read: {} pixels, {} bytes",
            live.counter.buffer_counter, decoded.pixels, bytes
        );
        drop(live);
        self.publish(decoded.frames);
        Ok(true)
    }

    /// Force every channel that is not yet full to switch buffers, then spin
    /// until all report full or the spin limit runs out.
    fn align_list_buffers(
        &self,
        handel: &mut Handel,
        channels: &[i32],
        current: &[BufferId],
        full: &mut [bool],
    ) -> Result<()> {
        for (i, &ch) in channels.iter().enumerate() {
            if !full[i] {
                handel.board_operation(ch, "buffer_switch", &mut Value::None)?;
            }
        }
        for _ in 0..self.settings.switch_spin_limit {
            for (i, &ch) in channels.iter().enumerate() {
                if !full[i] {
                    full[i] = buffer_full(handel, ch, current[i])?;
                }
            }
            if full.iter().all(|&f| f) {
                return Ok(());
            }
            thread::yield_now();
        }
        warn!(
            "list buffers not aligned after {} polls",
            self.settings.switch_spin_limit
        );
        Ok(())
    }
}

fn buffer_full(handel: &mut Handel, det_chan: i32, id: BufferId) -> Result<bool> {
    handel
        .get_run_data(det_chan, &format!("buffer_full_{}", id.letter()))?
        .as_bool()
}

/// Saturate a count into the `i32` frame attribute.
fn clamp_count(value: i64, what: &str, chan: i32) -> i32 {
    i32::try_from(value).unwrap_or_else(|_| {
        warn!("channel {chan}: {what} = {value} does not fit an i32, saturating");
        if value < 0 {
            i32::MIN
        } else {
            i32::MAX
        }
    })
}

fn any_run_active(handel: &mut Handel, channels: &[i32]) -> Result<bool> {
    for &ch in channels {
        if handel.get_run_data(ch, "run_active")?.as_bool()? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameData;
    use crate::mapping::{
        encode_buffer, BufferHeader, MappingMode, Pixel, PixelStats, BUFFER_HEADER_WORDS,
        PIXEL_HEADER_WORDS,
    };

    fn buffer(channel: u16, pixels: &[(u32, Vec<u32>)]) -> Vec<u16> {
        let bins = pixels.first().map_or(0, |(_, s)| s.len());
        let block = (PIXEL_HEADER_WORDS + bins) as u32;
        let header = BufferHeader {
            header_size: BUFFER_HEADER_WORDS as u16,
            mode: MappingMode::FullSpectrum,
            run_number: 1,
            buffer_number: 0,
            buffer_id: BufferId::A,
            num_pixels: pixels.len() as u16,
            first_pixel: pixels.first().map_or(0, |p| p.0),
            module_number: 0,
            channel_id: channel,
            channel_element: channel,
            channel_size: 1,
            buffer_errors: 0,
        };
        let pixels: Vec<Pixel> = pixels
            .iter()
            .map(|(number, spectrum)| Pixel {
                number: *number,
                block_size: block,
                stats: PixelStats {
                    realtime: 1_000_000,
                    trigger_livetime: 900_000,
                    triggers: 50,
                    output_counts: 40,
                },
                data: PixelData::Spectrum(spectrum.clone()),
            })
            .collect();
        let words = BUFFER_HEADER_WORDS + pixels.len() * block as usize;
        encode_buffer(&header, &pixels, words).unwrap()
    }

    #[test]
    fn spectra_frames_have_one_column_per_channel() {
        let buffers = vec![
            buffer(0, &[(7, vec![1, 2, 3, 4]), (8, vec![5, 6, 7, 8])]),
            buffer(1, &[(7, vec![10, 20, 30, 40]), (8, vec![0, 0, 0, 9])]),
        ];
        let decoded = decode_buffers(&buffers, FrameMode::McaSpectra, true).unwrap();
        assert_eq!(decoded.pixels, 2);
        assert_eq!(decoded.frames.len(), 2);

        let frame = &decoded.frames[1];
        assert_eq!(frame.pixel, Some(8));
        let FrameData::Spectra(data) = &frame.data else {
            panic!("expected spectra");
        };
        assert_eq!(data.dim(), (4, 2));
        assert_eq!(data[[3, 1]], 9);
        assert_eq!(data[[0, 0]], 5);
        assert_eq!(frame.attributes[0].triggers, 50);
        assert_eq!(frame.attributes[1].output_counts, 40);
        approx::assert_relative_eq!(frame.attributes[0].realtime, 0.32, epsilon = 1e-9);

        assert_eq!(decoded.first_spectra[1], Some(vec![10, 20, 30, 40]));
    }

    #[test]
    fn raw_frames_hold_whole_buffers() {
        let buffers = vec![buffer(0, &[(0, vec![1; 8])]), buffer(1, &[(0, vec![2; 8])])];
        let decoded = decode_buffers(&buffers, FrameMode::RawBuffers, true).unwrap();
        assert_eq!(decoded.frames.len(), 1);
        let FrameData::Raw(data) = &decoded.frames[0].data else {
            panic!("expected raw words");
        };
        assert_eq!(data.dim(), (buffers[0].len(), 2));
        assert_eq!(data[[0, 1]], mapping::BUFFER_TAG0);
    }

    #[test]
    fn empty_buffers_decode_to_nothing() {
        let buffers = vec![buffer(0, &[]), buffer(1, &[])];
        let decoded = decode_buffers(&buffers, FrameMode::McaSpectra, true).unwrap();
        assert_eq!(decoded.pixels, 0);
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn callbacks_off_publishes_nothing() {
        let buffers = vec![buffer(0, &[(0, vec![1; 8])])];
        let decoded = decode_buffers(&buffers, FrameMode::McaSpectra, false).unwrap();
        assert_eq!(decoded.pixels, 1);
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn oversized_counts_saturate() {
        assert_eq!(clamp_count(i64::from(u32::MAX), "triggers", 0), i32::MAX);
        assert_eq!(clamp_count(i64::MIN, "output_counts", 1), i32::MIN);
        assert_eq!(clamp_count(1234, "triggers", 0), 1234);
    }
}

//! An in-memory FalconX.
//!
//! Every channel keeps a register map, an MCA and a pair of mapping buffers.
//! Time only advances when the driver polls: each `run_active` query in MCA
//! mode accumulates one 10 ms tick, and each `buffer_full_{a|b}` query in
//! mapping mode fills the requested buffer if the run still has pixels left.

use crate::detector::{DetectorKind, Polarity, GAIN_MAX, GAIN_MIN};
use crate::firmware::{FirmwareFile, FirmwareForm};
use crate::mapping::{
    encode_buffer, BufferHeader, BufferId, MappingMode, Pixel, PixelData, PixelStats,
    BUFFER_HEADER_WORDS, PIXEL_HEADER_WORDS, TICK_SECONDS,
};
use crate::psl::{ChannelContext, Psl};
use crate::registry::indexed;
use crate::{Detector, Module, Result, Value};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

pub const PRODUCT: &str = "falconxn";
pub const CLOCK_SPEED_MHZ: f64 = 250.0;
pub const MAX_SCAS: usize = 16;
pub const FIRMWARE_VERSION: &str = "simulated-20.1";

/// Realtime covered by one MCA poll.
const TICK: f64 = 0.01;
/// Dwell time of one mapping pixel.
const PIXEL_DWELL: f64 = 0.1;
const LIVE_FRACTION: f64 = 0.96;
const OUTPUT_FRACTION: f64 = 0.9;
const LIST_BUFFER_WORDS: usize = 4096;

/// Default acquisition values, in catalog order.
const CATALOG: &[(&str, f64)] = &[
    ("analog_gain", 1.0),
    ("analog_offset", 0.0),
    ("detector_polarity", 1.0),
    ("termination", 0.0),
    ("attenuation", 0.0),
    ("coupling", 0.0),
    ("decay_time", 0.0),
    ("reset_delay", 0.0),
    ("peaking_time", 1.0),
    ("detection_threshold", 0.01),
    ("min_pulse_pair_separation", 25.0),
    ("detection_filter", 2.0),
    ("mca_bin_width", 10.0),
    ("number_mca_channels", 4096.0),
    ("mca_start_channel", 0.0),
    ("preset_type", 0.0),
    ("preset_value", 0.0),
    ("scale_factor", 2.0),
    ("mapping_mode", 0.0),
    ("num_map_pixels", 0.0),
    ("num_map_pixels_per_buffer", 4.0),
    ("pixel_advance_mode", 0.0),
    ("sync_count", 1.0),
    ("number_of_scas", 0.0),
    ("sca_trigger_mode", 1.0),
    ("sca_pulse_duration", 400.0),
];

/// Names that may be dropped from a channel's defaults.
const REMOVABLE: &[&str] = &["sca_trigger_mode", "sca_pulse_duration", "scale_factor"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Preset {
    None,
    Realtime,
    Livetime,
    OutputEvents,
    InputCounts,
}

impl Preset {
    fn from_value(v: f64) -> Self {
        match v as i64 {
            1 => Preset::Realtime,
            2 => Preset::Livetime,
            3 => Preset::OutputEvents,
            4 => Preset::InputCounts,
            _ => Preset::None,
        }
    }
}

#[derive(Debug, Default)]
struct MappingState {
    full: [bool; 2],
    buffers: [Vec<u16>; 2],
    list_len: [usize; 2],
    next_pixel: u32,
    buffer_number: u32,
}

fn slot(id: BufferId) -> usize {
    match id {
        BufferId::A => 0,
        BufferId::B => 1,
    }
}

#[derive(Debug)]
struct SimChannel {
    module: String,
    mod_chan: usize,
    registers: BTreeMap<String, f64>,
    dsp: Option<String>,
    running: bool,
    run_number: u16,
    mca: Vec<u32>,
    stats: PixelStats,
    mapping: MappingState,
    trace: Vec<u32>,
}

impl SimChannel {
    fn register(&self, name: &str) -> f64 {
        self.registers.get(name).copied().unwrap_or_else(|| {
            CATALOG
                .iter()
                .find(|(n, _)| *n == name)
                .map_or(0.0, |(_, v)| *v)
        })
    }

    fn bins(&self) -> usize {
        self.register("number_mca_channels") as usize
    }

    fn mapping_mode(&self) -> Option<MappingMode> {
        match self.register("mapping_mode") as u16 {
            1 => Some(MappingMode::FullSpectrum),
            2 => Some(MappingMode::MultiRoi),
            3 => Some(MappingMode::List),
            _ => None,
        }
    }

    fn reset_run(&mut self) {
        self.mca = vec![0; self.bins()];
        self.stats = PixelStats::default();
        self.mapping = MappingState::default();
    }

    fn preset_reached(&self) -> bool {
        let target = self.register("preset_value");
        if target <= 0.0 {
            return false;
        }
        match Preset::from_value(self.register("preset_type")) {
            Preset::None => false,
            Preset::Realtime => self.stats.realtime_sec() >= target,
            Preset::Livetime => self.stats.trigger_livetime_sec() >= target,
            Preset::OutputEvents => f64::from(self.stats.output_counts) >= target,
            Preset::InputCounts => f64::from(self.stats.triggers) >= target,
        }
    }
}

/// Simulated FalconX family backend.
pub struct SimulatedFalconX {
    rng: StdRng,
    /// Counts per second seen by every channel unless a module overrides it.
    count_rate: f64,
    module_rates: HashMap<String, f64>,
    modules: HashMap<String, Vec<i32>>,
    channels: HashMap<i32, SimChannel>,
    chan_data: HashMap<(String, usize), Vec<u8>>,
}

impl Default for SimulatedFalconX {
    fn default() -> Self {
        Self::new(0x5EED)
    }
}

impl SimulatedFalconX {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            count_rate: 10_000.0,
            module_rates: HashMap::new(),
            modules: HashMap::new(),
            channels: HashMap::new(),
            chan_data: HashMap::new(),
        }
    }

    pub fn with_count_rate(mut self, counts_per_second: f64) -> Self {
        self.count_rate = counts_per_second;
        self
    }

    fn channel(&self, det_chan: i32) -> Result<&SimChannel> {
        self.channels
            .get(&det_chan)
            .ok_or_else(|| err!(InvalidDetChan, "{PRODUCT}: detChan {det_chan} is not set up"))
    }

    fn channel_mut(&mut self, det_chan: i32) -> Result<&mut SimChannel> {
        self.channels
            .get_mut(&det_chan)
            .ok_or_else(|| err!(InvalidDetChan, "{PRODUCT}: detChan {det_chan} is not set up"))
    }

    fn rate_for(&self, module: &str) -> f64 {
        self.module_rates.get(module).copied().unwrap_or(self.count_rate)
    }

    /// Channels started and stopped together with `det_chan`.
    fn run_group(&self, det_chan: i32, module: &Module) -> Vec<i32> {
        if module.multi_channel {
            module.channels.iter().copied().filter(|&c| c >= 0).collect()
        } else {
            vec![det_chan]
        }
    }

    /// Draw `events` energies into `spectrum`: one line near 40 % of full
    /// scale over a flat background.
    fn scatter(rng: &mut StdRng, spectrum: &mut [u32], events: u32) {
        let bins = spectrum.len();
        if bins == 0 {
            return;
        }
        let centre = bins as f64 * 0.4;
        let sigma = (bins as f64 / 50.0).max(1.0);
        for _ in 0..events {
            let bin = if rng.random::<f64>() < 0.7 {
                let spread: f64 = (0..4).map(|_| rng.random::<f64>()).sum::<f64>() - 2.0;
                (centre + spread * 3f64.sqrt() * sigma).clamp(0.0, (bins - 1) as f64) as usize
            } else {
                rng.random_range(0..bins)
            };
            spectrum[bin] = spectrum[bin].saturating_add(1);
        }
    }

    fn tick_stats(seconds: f64, rate: f64) -> PixelStats {
        let ticks = |s: f64| (s / TICK_SECONDS).round() as u32;
        let triggers = (rate * seconds).round() as u32;
        PixelStats {
            realtime: ticks(seconds),
            trigger_livetime: ticks(seconds * LIVE_FRACTION),
            triggers,
            output_counts: (f64::from(triggers) * OUTPUT_FRACTION).round() as u32,
        }
    }

    /// Advance an MCA run by one tick.
    fn accumulate(&mut self, det_chan: i32) -> Result<()> {
        let rate = self.rate_for(&self.channel(det_chan)?.module);
        let Self { rng, channels, .. } = self;
        let Some(ch) = channels.get_mut(&det_chan) else {
            return Ok(());
        };
        let tick = Self::tick_stats(TICK, rate);
        Self::scatter(rng, &mut ch.mca, tick.output_counts);
        ch.stats.realtime += tick.realtime;
        ch.stats.trigger_livetime += tick.trigger_livetime;
        ch.stats.triggers += tick.triggers;
        ch.stats.output_counts += tick.output_counts;
        if ch.preset_reached() {
            debug!("{PRODUCT}: detChan {det_chan} reached its preset");
            ch.running = false;
        }
        Ok(())
    }

    /// Fill mapping buffer `id` of `det_chan` if the run has pixels left.
    fn fill_buffer(&mut self, det_chan: i32, id: BufferId) -> Result<()> {
        let rate = self.rate_for(&self.channel(det_chan)?.module);
        let Self { rng, channels, .. } = self;
        let Some(ch) = channels.get_mut(&det_chan) else {
            return Ok(());
        };
        let Some(mode) = ch.mapping_mode() else {
            bail!(IllegalOperation, "detChan {det_chan} is not in a mapping mode");
        };
        if !ch.running || ch.mapping.full[slot(id)] {
            return Ok(());
        }

        let header = |num_pixels: u16, first_pixel: u32, ch: &SimChannel| BufferHeader {
            header_size: BUFFER_HEADER_WORDS as u16,
            mode,
            run_number: ch.run_number,
            buffer_number: ch.mapping.buffer_number,
            buffer_id: id,
            num_pixels,
            first_pixel,
            module_number: 0,
            channel_id: ch.mod_chan as u16,
            channel_element: ch.mod_chan as u16,
            channel_size: 1,
            buffer_errors: 0,
        };

        if mode == MappingMode::List {
            // Odd channels only fill when switched, so streams need aligning.
            if ch.mod_chan % 2 == 1 && ch.mapping.list_len[slot(id)] == 0 {
                ch.mapping.list_len[slot(id)] = LIST_BUFFER_WORDS / 2;
                return Ok(());
            }
            let words = Self::list_words(rng, &header(0, 0, &*ch))?;
            ch.mapping.list_len[slot(id)] = LIST_BUFFER_WORDS;
            ch.mapping.buffers[slot(id)] = words;
            ch.mapping.full[slot(id)] = true;
            ch.mapping.buffer_number += 1;
            return Ok(());
        }

        let per_buffer = (ch.register("num_map_pixels_per_buffer") as u32).max(1);
        let total = ch.register("num_map_pixels") as u32;
        let first = ch.mapping.next_pixel;
        let count = if total > 0 {
            per_buffer.min(total.saturating_sub(first))
        } else {
            per_buffer
        };
        if count == 0 {
            ch.running = false;
            return Ok(());
        }

        let bins = ch.bins();
        let scas: Vec<(usize, usize)> = (0..ch.register("number_of_scas") as usize)
            .map(|i| {
                (
                    ch.register(&format!("sca{i}_lo")) as usize,
                    ch.register(&format!("sca{i}_hi")) as usize,
                )
            })
            .collect();
        let payload = match mode {
            MappingMode::MultiRoi => 2 * scas.len(),
            _ => bins,
        };
        let block_size = (PIXEL_HEADER_WORDS + payload) as u32;

        let mut pixels = Vec::with_capacity(count as usize);
        for number in first..first + count {
            let stats = Self::tick_stats(PIXEL_DWELL, rate);
            let mut spectrum = vec![0u32; bins];
            Self::scatter(rng, &mut spectrum, stats.output_counts);
            let data = match mode {
                MappingMode::MultiRoi => PixelData::Rois(
                    scas.iter()
                        .map(|&(lo, hi)| spectrum.iter().take(hi + 1).skip(lo).sum())
                        .collect(),
                ),
                _ => PixelData::Spectrum(spectrum),
            };
            pixels.push(Pixel {
                number,
                block_size,
                stats,
                data,
            });
        }
        let words_per_buffer = BUFFER_HEADER_WORDS + per_buffer as usize * block_size as usize;
        let num_pixels = count as u16;
        let words = encode_buffer(&header(num_pixels, first, &*ch), &pixels, words_per_buffer)?;

        ch.mapping.buffers[slot(id)] = words;
        ch.mapping.full[slot(id)] = true;
        ch.mapping.next_pixel += count;
        ch.mapping.buffer_number += 1;
        if total > 0 && ch.mapping.next_pixel >= total {
            debug!("{PRODUCT}: detChan {det_chan} mapped all {total} pixels");
            ch.running = false;
        }
        Ok(())
    }

    /// A list-mode buffer: the header then random event words.
    fn list_words(rng: &mut StdRng, header: &BufferHeader) -> Result<Vec<u16>> {
        let mut words = encode_buffer(header, &[], BUFFER_HEADER_WORDS + LIST_BUFFER_WORDS)?;
        for w in &mut words[BUFFER_HEADER_WORDS..] {
            *w = rng.random();
        }
        Ok(words)
    }

    /// Write one register and return the value the hardware took.
    fn apply(&mut self, det_chan: i32, name: &str, value: f64) -> Result<f64> {
        let ch = self.channel_mut(det_chan)?;
        let known = CATALOG.iter().any(|(n, _)| *n == name)
            || indexed(name, "sca", "_lo").is_some_and(|i| i < MAX_SCAS)
            || indexed(name, "sca", "_hi").is_some_and(|i| i < MAX_SCAS);
        if !known {
            bail!(BadName, "{PRODUCT}: unknown acquisition value '{name}'");
        }
        let coerced = match name {
            "number_mca_channels" => {
                let bins = ((value / 128.0).round() * 128.0).clamp(128.0, 4096.0);
                ch.mca.resize(bins as usize, 0);
                bins
            }
            "number_of_scas" => value.round().clamp(0.0, MAX_SCAS as f64),
            "mapping_mode" | "preset_type" | "pixel_advance_mode" => {
                let limit = if name == "preset_type" { 4.0 } else { 3.0 };
                if !(0.0..=limit).contains(&value) {
                    bail!(BadValue, "{PRODUCT}: {name} = {value} is out of range");
                }
                value.round()
            }
            "analog_gain" => {
                if !(GAIN_MIN..=GAIN_MAX).contains(&value) {
                    bail!(BadValue, "{PRODUCT}: analog_gain {value} is out of range");
                }
                value
            }
            "sync_count" => {
                if value < 1.0 {
                    bail!(BadValue, "{PRODUCT}: sync_count must be at least 1");
                }
                value.round()
            }
            _ if name.starts_with("sca") => value.round().max(0.0),
            _ => value,
        };
        // The hardware counts sync pulses from zero.
        let stored = if name == "sync_count" { coerced - 1.0 } else { coerced };
        ch.registers.insert(name.to_string(), stored);
        Ok(coerced)
    }

    fn read(&self, det_chan: i32, name: &str) -> Result<f64> {
        let ch = self.channel(det_chan)?;
        match name {
            "clock_speed" => Ok(CLOCK_SPEED_MHZ),
            "max_number_of_scas" => Ok(MAX_SCAS as f64),
            "sync_count" => Ok(ch.register(name) + 1.0),
            _ => ch
                .registers
                .get(name)
                .copied()
                .ok_or_else(|| err!(BadName, "{PRODUCT}: no acquisition value '{name}'")),
        }
    }

    fn buffer_id(value: &Value) -> Result<BufferId> {
        let letter = match value {
            Value::Char(c) => *c,
            Value::Text(s) => s.trim().chars().next().unwrap_or(' '),
            Value::Int(0) => 'a',
            Value::Int(1) => 'b',
            other => bail!(BadValue, "{PRODUCT}: '{other}' is not a buffer id"),
        };
        match letter.to_ascii_lowercase() {
            'a' => Ok(BufferId::A),
            'b' => Ok(BufferId::B),
            other => Err(err!(BadValue, "{PRODUCT}: '{other}' is not a buffer id")),
        }
    }
}

impl Psl for SimulatedFalconX {
    fn product(&self) -> &'static str {
        PRODUCT
    }

    fn setup_module(&mut self, module: &Module) -> Result<()> {
        match module.interface.name() {
            Some(name) => info!("{PRODUCT}: connecting module '{}' over {name}", module.alias),
            None => bail!(NoInterface, "module '{}' has no interface", module.alias),
        }
        let det_chans = module.channels.iter().copied().filter(|&c| c >= 0).collect();
        self.modules.insert(module.alias.clone(), det_chans);
        Ok(())
    }

    fn end_module(&mut self, module: &Module) -> Result<()> {
        if self.modules.remove(&module.alias).is_none() {
            warn!("{PRODUCT}: module '{}' was not set up", module.alias);
        }
        Ok(())
    }

    fn setup_det_chan(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()> {
        let mut ch = SimChannel {
            module: ctx.module.alias.clone(),
            mod_chan: ctx.mod_chan,
            registers: BTreeMap::new(),
            dsp: None,
            running: false,
            run_number: 0,
            mca: Vec::new(),
            stats: PixelStats::default(),
            mapping: MappingState::default(),
            trace: Vec::new(),
        };
        ch.reset_run();
        self.channels.insert(ctx.det_chan, ch);
        Ok(())
    }

    fn end_det_chan(&mut self, det_chan: i32, _module: &Module, _detector: &Detector) -> Result<()> {
        if self.channels.remove(&det_chan).is_none() {
            warn!("{PRODUCT}: detChan {det_chan} was not set up");
        }
        Ok(())
    }

    fn user_setup(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()> {
        let ptime = ctx.defaults.get("peaking_time").unwrap_or(1.0) * 1e-6;
        let dsp = match ctx.firmware.map(|f| &f.form) {
            Some(FirmwareForm::Bundle(bundle)) => bundle.filename.clone(),
            Some(FirmwareForm::Piecewise(_)) => ctx
                .firmware
                .map(|f| f.file_for(FirmwareFile::Dsp, ptime).map(str::to_string))
                .transpose()?,
            _ => None,
        };
        if let Some(dsp) = &dsp {
            debug!("{PRODUCT}: detChan {} loads '{dsp}'", ctx.det_chan);
        }
        self.channel_mut(ctx.det_chan)?.dsp = dsp;

        let entries: Vec<(String, f64)> = ctx
            .defaults
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.data))
            .collect();
        for (name, value) in entries {
            self.apply(ctx.det_chan, &name, value)
                .map_err(|e| e.context(format!("defaults '{}'", ctx.defaults.alias)))?;
            ctx.defaults.mark_synced(&name);
        }
        let ch = self.channel_mut(ctx.det_chan)?;
        ch.reset_run();
        Ok(())
    }

    fn board_operation(
        &mut self,
        det_chan: i32,
        module: &Module,
        name: &str,
        value: &mut Value,
    ) -> Result<()> {
        match name {
            "apply" => Ok(()),
            "get_connected" => {
                *value = Value::Bool(self.modules.contains_key(&module.alias));
                Ok(())
            }
            "get_firmware_version" => {
                *value = Value::from(FIRMWARE_VERSION);
                Ok(())
            }
            "get_dsp_file" => {
                let dsp = self.channel(det_chan)?.dsp.clone();
                *value = dsp.map(Value::from).unwrap_or_default();
                Ok(())
            }
            "buffer_done" => {
                let id = Self::buffer_id(value)?;
                let ch = self.channel_mut(det_chan)?;
                ch.mapping.full[slot(id)] = false;
                ch.mapping.list_len[slot(id)] = 0;
                Ok(())
            }
            "buffer_switch" => {
                self.channel(det_chan)?;
                let Self { rng, channels, .. } = self;
                let Some(ch) = channels.get_mut(&det_chan) else {
                    return Ok(());
                };
                for id in [BufferId::A, BufferId::B] {
                    let s = slot(id);
                    if ch.mapping.list_len[s] == 0 || ch.mapping.full[s] {
                        continue;
                    }
                    let header = BufferHeader {
                        header_size: BUFFER_HEADER_WORDS as u16,
                        mode: MappingMode::List,
                        run_number: ch.run_number,
                        buffer_number: ch.mapping.buffer_number,
                        buffer_id: id,
                        num_pixels: 0,
                        first_pixel: 0,
                        module_number: 0,
                        channel_id: ch.mod_chan as u16,
                        channel_element: ch.mod_chan as u16,
                        channel_size: 1,
                        buffer_errors: 0,
                    };
                    ch.mapping.buffers[s] = Self::list_words(rng, &header)?;
                    ch.mapping.list_len[s] = LIST_BUFFER_WORDS;
                    ch.mapping.full[s] = true;
                    ch.mapping.buffer_number += 1;
                }
                Ok(())
            }
            "mapping_pixel_next" => {
                self.channel_mut(det_chan)?.mapping.next_pixel += 1;
                Ok(())
            }
            _ => bail!(BadName, "{PRODUCT}: unknown board operation '{name}'"),
        }
    }

    fn default_alias(&self) -> &str {
        "defaults_falconxn"
    }

    fn num_defaults(&self) -> usize {
        CATALOG.len()
    }

    fn default_values(&self) -> Vec<(String, f64)> {
        CATALOG.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    fn set_detector_type_value(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()> {
        let detector = ctx.detector;
        let k = ctx.detector_chan;
        let type_value = detector.type_value.unwrap_or(0.0) * 1e6;
        let name = match detector.kind {
            DetectorKind::Reset => "reset_delay",
            DetectorKind::RcFeedback => "decay_time",
            DetectorKind::Unknown => {
                bail!(MissingType, "detector '{}' has no type", detector.alias)
            }
        };
        let polarity = match detector.polarity.get(k).copied().flatten() {
            Some(Polarity::Pos) => 1.0,
            Some(Polarity::Neg) => 0.0,
            None => bail!(MissingPol, "detector '{}' channel {k} has no polarity", detector.alias),
        };
        for (name, value) in [(name, type_value), ("detector_polarity", polarity)] {
            let value = self.apply(ctx.det_chan, name, value)?;
            ctx.defaults.set(name, value)?;
        }
        Ok(())
    }

    fn set_acquisition_values(
        &mut self,
        ctx: &mut ChannelContext<'_>,
        name: &str,
        value: &mut f64,
    ) -> Result<()> {
        *value = self.apply(ctx.det_chan, name, *value)?;
        Ok(())
    }

    fn get_acquisition_values(&mut self, ctx: &mut ChannelContext<'_>, name: &str) -> Result<f64> {
        self.read(ctx.det_chan, name)
    }

    fn gain_calibrate(
        &mut self,
        ctx: &mut ChannelContext<'_>,
        delta_gain: f64,
    ) -> Result<Option<f64>> {
        if delta_gain <= 0.0 {
            bail!(BadValue, "{PRODUCT}: gain scale {delta_gain} must be positive");
        }
        let k = ctx.detector_chan;
        let gain = ctx.detector.gain.get(k).copied().flatten().unwrap_or(1.0) * delta_gain;
        if !(GAIN_MIN..=GAIN_MAX).contains(&gain) {
            bail!(BadValue, "{PRODUCT}: calibrated gain {gain} is out of range");
        }
        let analog = self.read(ctx.det_chan, "analog_gain").unwrap_or(1.0) * delta_gain;
        let analog = self.apply(ctx.det_chan, "analog_gain", analog)?;
        ctx.defaults.set("analog_gain", analog)?;
        ctx.defaults.mark_synced("analog_gain");
        Ok(Some(gain))
    }

    fn start_run(&mut self, det_chan: i32, module: &Module, resume: bool) -> Result<()> {
        for c in self.run_group(det_chan, module) {
            let ch = self.channel_mut(c)?;
            if !resume {
                ch.reset_run();
                ch.run_number = ch.run_number.wrapping_add(1);
            }
            ch.running = true;
        }
        debug!("{PRODUCT}: run started on detChan {det_chan} (resume: {resume})");
        Ok(())
    }

    fn stop_run(&mut self, det_chan: i32, module: &Module) -> Result<()> {
        for c in self.run_group(det_chan, module) {
            self.channel_mut(c)?.running = false;
        }
        debug!("{PRODUCT}: run stopped on detChan {det_chan}");
        Ok(())
    }

    fn get_run_data(&mut self, det_chan: i32, _module: &Module, name: &str) -> Result<Value> {
        if name == "run_active" {
            let ch = self.channel(det_chan)?;
            if ch.running && ch.mapping_mode().is_none() {
                self.accumulate(det_chan)?;
            }
            return Ok(Value::Int(i64::from(self.channel(det_chan)?.running)));
        }
        if let Some(id) = name
            .strip_prefix("buffer_full_")
            .map(|s| Self::buffer_id(&Value::from(s)))
            .transpose()?
        {
            self.fill_buffer(det_chan, id)?;
            return Ok(Value::Bool(self.channel(det_chan)?.mapping.full[slot(id)]));
        }

        let ch = self.channel(det_chan)?;
        let value = match name {
            "mca_length" => Value::from(ch.mca.len()),
            "mca" => Value::Counts(ch.mca.clone()),
            "realtime" => Value::Double(ch.stats.realtime_sec()),
            "trigger_livetime" => Value::Double(ch.stats.trigger_livetime_sec()),
            "energy_livetime" => Value::Double(ch.stats.energy_livetime_sec()),
            "triggers" => Value::from(ch.stats.triggers),
            "output_counts" => Value::from(ch.stats.output_counts),
            "input_count_rate" => Value::Double(ch.stats.icr()),
            "output_count_rate" => Value::Double(ch.stats.ocr()),
            "current_pixel" => Value::from(ch.mapping.next_pixel),
            "buffer_len" => {
                let words = ch.mapping.buffers.iter().map(Vec::len).max().unwrap_or(0);
                Value::from(words)
            }
            "buffer_a" | "buffer_b" => {
                let id = if name.ends_with('a') { BufferId::A } else { BufferId::B };
                Value::Words(ch.mapping.buffers[slot(id)].clone())
            }
            "list_buffer_len_a" => Value::from(ch.mapping.list_len[0]),
            "list_buffer_len_b" => Value::from(ch.mapping.list_len[1]),
            _ => bail!(BadName, "{PRODUCT}: unknown run data '{name}'"),
        };
        Ok(value)
    }

    fn do_special_run(
        &mut self,
        ctx: &mut ChannelContext<'_>,
        name: &str,
        info: &[f64],
    ) -> Result<()> {
        match name {
            "adc_trace" => {
                let points = info.first().copied().unwrap_or(0.0);
                if points < 1.0 {
                    bail!(BadValue, "{PRODUCT}: adc_trace needs a positive length");
                }
                let Self { rng, channels, .. } = self;
                let ch = channels.get_mut(&ctx.det_chan).ok_or_else(|| {
                    err!(InvalidDetChan, "{PRODUCT}: detChan {} is not set up", ctx.det_chan)
                })?;
                // Reset-preamp ramp with a little noise.
                ch.trace = (0..points as usize)
                    .map(|i| 8000 + (i % 512) as u32 * 8 + rng.random_range(0..16))
                    .collect();
                Ok(())
            }
            _ => bail!(BadName, "{PRODUCT}: unknown special run '{name}'"),
        }
    }

    fn get_special_run_data(
        &mut self,
        det_chan: i32,
        _module: &Module,
        name: &str,
    ) -> Result<Value> {
        let ch = self.channel(det_chan)?;
        match name {
            "adc_trace" => Ok(Value::Counts(ch.trace.clone())),
            "adc_trace_length" => Ok(Value::from(ch.trace.len())),
            _ => bail!(BadName, "{PRODUCT}: unknown special run data '{name}'"),
        }
    }

    fn can_remove_name(&self, name: &str) -> bool {
        REMOVABLE.contains(&name)
            || indexed(name, "sca", "_lo").is_some()
            || indexed(name, "sca", "_hi").is_some()
    }

    fn free_scas(&mut self, module: &Module) -> Result<()> {
        for det_chan in module.channels.iter().filter(|&&c| c >= 0) {
            if let Some(ch) = self.channels.get_mut(det_chan) {
                ch.registers.retain(|name, _| {
                    indexed(name, "sca", "_lo").is_none() && indexed(name, "sca", "_hi").is_none()
                });
            }
        }
        Ok(())
    }

    fn ini_read(&mut self, module: &Module, name: &str, value: &Value) -> Result<bool> {
        if name != "count_rate" {
            return Ok(false);
        }
        let rate = value.as_f64()?;
        if rate < 0.0 {
            bail!(BadValue, "module '{}': count_rate must not be negative", module.alias);
        }
        self.module_rates.insert(module.alias.clone(), rate);
        Ok(true)
    }

    fn ini_write(&self, module: &Module) -> Vec<(String, String)> {
        self.module_rates
            .get(&module.alias)
            .map(|rate| vec![("count_rate".to_string(), rate.to_string())])
            .unwrap_or_default()
    }

    fn load_chan_data(&mut self, module: &str, mod_chan: usize, data: &[u8]) -> Result<()> {
        self.chan_data
            .insert((module.to_string(), mod_chan), data.to_vec());
        Ok(())
    }

    fn save_chan_data(&self, module: &str, mod_chan: usize) -> Option<Vec<u8>> {
        self.chan_data.get(&(module.to_string(), mod_chan)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(channels: &[i32]) -> Module {
        Module {
            alias: "m".into(),
            number_of_channels: channels.len(),
            channels: channels.to_vec(),
            multi_channel: channels.len() > 1,
            ..Default::default()
        }
    }

    fn sim_with_channel(det_chan: i32) -> SimulatedFalconX {
        let mut sim = SimulatedFalconX::new(1);
        let mut ch = SimChannel {
            module: "m".into(),
            mod_chan: 0,
            registers: BTreeMap::new(),
            dsp: None,
            running: false,
            run_number: 0,
            mca: Vec::new(),
            stats: PixelStats::default(),
            mapping: MappingState::default(),
            trace: Vec::new(),
        };
        ch.reset_run();
        sim.channels.insert(det_chan, ch);
        sim
    }

    #[test]
    fn sync_count_is_stored_zero_based() {
        let mut sim = sim_with_channel(0);
        assert_eq!(sim.apply(0, "sync_count", 3.0).unwrap(), 3.0);
        assert_eq!(sim.channels[&0].registers["sync_count"], 2.0);
        assert_eq!(sim.read(0, "sync_count").unwrap(), 3.0);
        assert!(sim.apply(0, "sync_count", 0.0).is_err());
    }

    #[test]
    fn values_are_coerced() {
        let mut sim = sim_with_channel(0);
        assert_eq!(sim.apply(0, "number_mca_channels", 1000.0).unwrap(), 1024.0);
        assert_eq!(sim.apply(0, "number_of_scas", 99.0).unwrap(), MAX_SCAS as f64);
        assert_eq!(sim.read(0, "clock_speed").unwrap(), CLOCK_SPEED_MHZ);
        assert!(sim.apply(0, "no_such_value", 1.0).is_err());
    }

    #[test]
    fn realtime_preset_stops_the_run() {
        let mut sim = sim_with_channel(0);
        sim.apply(0, "preset_type", 1.0).unwrap();
        sim.apply(0, "preset_value", 0.045).unwrap();
        let m = module(&[0]);
        sim.start_run(0, &m, false).unwrap();
        let mut polls = 0;
        while sim.get_run_data(0, &m, "run_active").unwrap() == Value::Int(1) {
            polls += 1;
            assert!(polls < 100);
        }
        assert_eq!(polls, 4);
        let Value::Counts(mca) = sim.get_run_data(0, &m, "mca").unwrap() else {
            panic!("mca is not a count array");
        };
        assert!(mca.iter().sum::<u32>() > 0);
    }

    #[test]
    fn mapping_buffers_fill_until_pixels_run_out() {
        let mut sim = sim_with_channel(0);
        sim.apply(0, "mapping_mode", 1.0).unwrap();
        sim.apply(0, "number_mca_channels", 256.0).unwrap();
        sim.apply(0, "num_map_pixels", 5.0).unwrap();
        sim.apply(0, "num_map_pixels_per_buffer", 4.0).unwrap();
        let m = module(&[0]);
        sim.start_run(0, &m, false).unwrap();

        assert_eq!(sim.get_run_data(0, &m, "buffer_full_a").unwrap(), Value::Bool(true));
        let Value::Words(words) = sim.get_run_data(0, &m, "buffer_a").unwrap() else {
            panic!("buffer is not a word array");
        };
        let buffer = crate::mapping::parse_buffer(&words).unwrap();
        assert_eq!(buffer.pixels.len(), 4);

        assert_eq!(sim.get_run_data(0, &m, "buffer_full_b").unwrap(), Value::Bool(true));
        assert_eq!(sim.get_run_data(0, &m, "current_pixel").unwrap(), Value::from(5u32));
        assert_eq!(sim.get_run_data(0, &m, "run_active").unwrap(), Value::Int(0));

        let mut done = Value::Char('a');
        sim.board_operation(0, &m, "buffer_done", &mut done).unwrap();
        assert_eq!(sim.get_run_data(0, &m, "buffer_full_a").unwrap(), Value::Bool(false));
    }

    #[test]
    fn removable_names() {
        let sim = SimulatedFalconX::default();
        assert!(sim.can_remove_name("sca3_lo"));
        assert!(!sim.can_remove_name("preset_type"));
    }
}

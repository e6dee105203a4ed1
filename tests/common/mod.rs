#![allow(dead_code)]

use handel::mapping::{
    encode_buffer, BufferHeader, BufferId, MappingMode, Pixel, PixelData, PixelStats,
    BUFFER_HEADER_WORDS, PIXEL_HEADER_WORDS,
};
use handel::psl::{ChannelContext, Psl};
use handel::{Detector, Handel, Module, Result, SimulatedFalconX, Value};
use std::collections::{HashSet, VecDeque};

/// Two-channel reset detector `det1`.
pub fn add_detector(handel: &mut Handel) {
    handel.new_detector("det1").unwrap();
    handel.add_detector_item("det1", "number_of_channels", 2).unwrap();
    handel.add_detector_item("det1", "type", "reset").unwrap();
    handel.add_detector_item("det1", "type_value", 1.0e-6).unwrap();
    for chan in 0..2 {
        handel
            .add_detector_item("det1", &format!("channel{chan}_gain"), 1.0)
            .unwrap();
        handel
            .add_detector_item("det1", &format!("channel{chan}_polarity"), "+")
            .unwrap();
    }
}

/// Two-channel FalconX module `mod1` on detChans 0 and 1.
pub fn add_module(handel: &mut Handel) {
    handel.new_module("mod1").unwrap();
    for (name, value) in [
        ("module_type", Value::from("falconx4")),
        ("number_of_channels", Value::from(2)),
        ("interface", Value::from("inet")),
        ("inet_address", Value::from("10.0.0.1")),
        ("inet_port", Value::from(8756)),
        ("inet_timeout", Value::from(1000)),
        ("channel0_alias", Value::from(0)),
        ("channel1_alias", Value::from(1)),
        ("channel0_detector", Value::from("det1:0")),
        ("channel1_detector", Value::from("det1:1")),
    ] {
        handel.add_module_item("mod1", name, value).unwrap();
    }
}

/// A configured but not started system backed by the simulator.
pub fn simulated_system() -> Handel {
    let mut handel = Handel::new().with_backend(SimulatedFalconX::new(7));
    add_detector(&mut handel);
    add_module(&mut handel);
    handel
}

/// Backend that accepts everything and refuses to drop any acquisition value.
#[derive(Default)]
pub struct StrictBackend {
    pub setups: usize,
}

impl Psl for StrictBackend {
    fn product(&self) -> &'static str {
        "falconxn"
    }

    fn setup_module(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn end_module(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn setup_det_chan(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<()> {
        self.setups += 1;
        Ok(())
    }

    fn end_det_chan(&mut self, _det_chan: i32, _module: &Module, _detector: &Detector) -> Result<()> {
        Ok(())
    }

    fn user_setup(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<()> {
        Ok(())
    }

    fn board_operation(
        &mut self,
        _det_chan: i32,
        _module: &Module,
        _name: &str,
        _value: &mut Value,
    ) -> Result<()> {
        Ok(())
    }

    fn default_alias(&self) -> &str {
        "defaults_strict"
    }

    fn num_defaults(&self) -> usize {
        2
    }

    fn default_values(&self) -> Vec<(String, f64)> {
        vec![("preset_type".into(), 0.0), ("peaking_time".into(), 1.0)]
    }

    fn set_detector_type_value(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<()> {
        Ok(())
    }

    fn set_acquisition_values(
        &mut self,
        _ctx: &mut ChannelContext<'_>,
        _name: &str,
        _value: &mut f64,
    ) -> Result<()> {
        Ok(())
    }

    fn get_acquisition_values(&mut self, ctx: &mut ChannelContext<'_>, name: &str) -> Result<f64> {
        Ok(ctx.defaults.get(name).unwrap_or(0.0))
    }

    fn gain_calibrate(&mut self, _ctx: &mut ChannelContext<'_>, _delta: f64) -> Result<Option<f64>> {
        Ok(None)
    }

    fn start_run(&mut self, _det_chan: i32, _module: &Module, _resume: bool) -> Result<()> {
        Ok(())
    }

    fn stop_run(&mut self, _det_chan: i32, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn get_run_data(&mut self, _det_chan: i32, _module: &Module, _name: &str) -> Result<Value> {
        Ok(Value::None)
    }

    fn do_special_run(
        &mut self,
        _ctx: &mut ChannelContext<'_>,
        _name: &str,
        _info: &[f64],
    ) -> Result<()> {
        Ok(())
    }

    fn get_special_run_data(
        &mut self,
        _det_chan: i32,
        _module: &Module,
        _name: &str,
    ) -> Result<Value> {
        Ok(Value::None)
    }

    fn load_chan_data(&mut self, _module: &str, _mod_chan: usize, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn save_chan_data(&self, _module: &str, _mod_chan: usize) -> Option<Vec<u8>> {
        None
    }
}

/// A full-spectrum mapping buffer holding one pixel per spectrum.
pub fn mapping_buffer(first_pixel: u32, spectra: &[Vec<u32>]) -> Vec<u16> {
    let bins = spectra.first().map_or(0, Vec::len);
    let block_size = (PIXEL_HEADER_WORDS + bins) as u32;
    let header = BufferHeader {
        header_size: BUFFER_HEADER_WORDS as u16,
        mode: MappingMode::FullSpectrum,
        run_number: 1,
        buffer_number: 0,
        buffer_id: BufferId::A,
        num_pixels: spectra.len() as u16,
        first_pixel,
        module_number: 0,
        channel_id: 0,
        channel_element: 0,
        channel_size: 1,
        buffer_errors: 0,
    };
    let pixels: Vec<Pixel> = spectra
        .iter()
        .enumerate()
        .map(|(k, spectrum)| Pixel {
            number: first_pixel + k as u32,
            block_size,
            stats: PixelStats {
                realtime: 3_125_000,
                trigger_livetime: 3_000_000,
                triggers: 100,
                output_counts: 90,
            },
            data: PixelData::Spectrum(spectrum.clone()),
        })
        .collect();
    let words = BUFFER_HEADER_WORDS + pixels.len() * block_size as usize;
    encode_buffer(&header, &pixels, words).unwrap()
}

/// Mapping backend that serves a fixed list of buffers, the same buffer to
/// every channel. A buffer is consumed once every channel has acknowledged
/// it; the run ends when the list is empty.
#[derive(Default)]
pub struct ScriptedBackend {
    pub buffers: VecDeque<Vec<u16>>,
    channels: HashSet<i32>,
    acked: HashSet<i32>,
    running: bool,
}

impl ScriptedBackend {
    pub fn new(buffers: Vec<Vec<u16>>) -> Self {
        Self {
            buffers: buffers.into(),
            ..Default::default()
        }
    }
}

impl Psl for ScriptedBackend {
    fn product(&self) -> &'static str {
        "falconxn"
    }

    fn setup_module(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn end_module(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn setup_det_chan(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()> {
        self.channels.insert(ctx.det_chan);
        Ok(())
    }

    fn end_det_chan(&mut self, det_chan: i32, _module: &Module, _detector: &Detector) -> Result<()> {
        self.channels.remove(&det_chan);
        Ok(())
    }

    fn user_setup(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<()> {
        Ok(())
    }

    fn board_operation(
        &mut self,
        det_chan: i32,
        _module: &Module,
        name: &str,
        _value: &mut Value,
    ) -> Result<()> {
        if name == "buffer_done" {
            self.acked.insert(det_chan);
            if self.acked.len() == self.channels.len() {
                self.acked.clear();
                self.buffers.pop_front();
            }
        }
        Ok(())
    }

    fn default_alias(&self) -> &str {
        "defaults_scripted"
    }

    fn num_defaults(&self) -> usize {
        1
    }

    fn default_values(&self) -> Vec<(String, f64)> {
        vec![("mapping_mode".into(), 0.0)]
    }

    fn set_detector_type_value(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<()> {
        Ok(())
    }

    fn set_acquisition_values(
        &mut self,
        _ctx: &mut ChannelContext<'_>,
        _name: &str,
        _value: &mut f64,
    ) -> Result<()> {
        Ok(())
    }

    fn get_acquisition_values(&mut self, ctx: &mut ChannelContext<'_>, name: &str) -> Result<f64> {
        Ok(ctx.defaults.get(name).unwrap_or(0.0))
    }

    fn gain_calibrate(&mut self, _ctx: &mut ChannelContext<'_>, _delta: f64) -> Result<Option<f64>> {
        Ok(None)
    }

    fn start_run(&mut self, _det_chan: i32, _module: &Module, _resume: bool) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop_run(&mut self, _det_chan: i32, _module: &Module) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn get_run_data(&mut self, _det_chan: i32, _module: &Module, name: &str) -> Result<Value> {
        let available = self.running && !self.buffers.is_empty();
        Ok(match name {
            "run_active" => Value::from(available),
            "current_pixel" => Value::from(0),
            "buffer_full_a" | "buffer_full_b" => Value::from(available),
            "buffer_a" | "buffer_b" => Value::Words(self.buffers.front().cloned().unwrap_or_default()),
            _ => Value::None,
        })
    }

    fn do_special_run(
        &mut self,
        _ctx: &mut ChannelContext<'_>,
        _name: &str,
        _info: &[f64],
    ) -> Result<()> {
        Ok(())
    }

    fn get_special_run_data(
        &mut self,
        _det_chan: i32,
        _module: &Module,
        _name: &str,
    ) -> Result<Value> {
        Ok(Value::None)
    }

    fn load_chan_data(&mut self, _module: &str, _mod_chan: usize, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn save_chan_data(&self, _module: &str, _mod_chan: usize) -> Option<Vec<u8>> {
        None
    }
}

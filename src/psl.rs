//! The product-specific backend ("PSL") seam.
//!
//! The core never talks to hardware. Each product family registers one
//! [`Psl`] implementation; modules reach it through their product tag and
//! every channel operation is forwarded to it with the resolved records.

use crate::{Detector, FirmwareSet, Module, Result, Value, XiaDefaults};

/// Everything a backend needs to act on one detChan.
pub struct ChannelContext<'a> {
    pub det_chan: i32,
    pub mod_chan: usize,
    pub module: &'a Module,
    pub detector: &'a Detector,
    /// Physical channel inside `detector`.
    pub detector_chan: usize,
    pub firmware: Option<&'a FirmwareSet>,
    pub defaults: &'a mut XiaDefaults,
}

/// Operation table of a product family.
///
/// Backends own their per-module and per-channel state; it is created in
/// `setup_module`/`setup_det_chan` and released in `end_det_chan`/`end_module`.
pub trait Psl: Send {
    /// Canonical product string this backend serves.
    fn product(&self) -> &'static str;

    /// Whether the channels of `module` start and stop together.
    fn is_multi_channel(&self, module: &Module) -> bool {
        module.number_of_channels > 1
    }

    fn setup_module(&mut self, module: &Module) -> Result<()>;
    fn end_module(&mut self, module: &Module) -> Result<()>;
    fn setup_det_chan(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()>;
    fn end_det_chan(&mut self, det_chan: i32, module: &Module, detector: &Detector) -> Result<()>;

    /// Load firmware and push the channel's defaults to the hardware.
    fn user_setup(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()>;

    fn board_operation(
        &mut self,
        det_chan: i32,
        module: &Module,
        name: &str,
        value: &mut Value,
    ) -> Result<()>;

    /// Name under which the backend's default catalog is known.
    fn default_alias(&self) -> &str;
    fn num_defaults(&self) -> usize;
    /// Default acquisition values, in catalog order.
    fn default_values(&self) -> Vec<(String, f64)>;

    fn set_detector_type_value(&mut self, ctx: &mut ChannelContext<'_>) -> Result<()>;

    /// Apply `name`; the backend may coerce `value` to what the hardware took.
    fn set_acquisition_values(
        &mut self,
        ctx: &mut ChannelContext<'_>,
        name: &str,
        value: &mut f64,
    ) -> Result<()>;
    fn get_acquisition_values(&mut self, ctx: &mut ChannelContext<'_>, name: &str) -> Result<f64>;

    /// Scale the channel gain by `delta_gain`. Returns the new detector gain
    /// when it changed.
    fn gain_calibrate(
        &mut self,
        ctx: &mut ChannelContext<'_>,
        delta_gain: f64,
    ) -> Result<Option<f64>>;

    fn gain_operation(
        &mut self,
        _ctx: &mut ChannelContext<'_>,
        name: &str,
        _value: &mut Value,
    ) -> Result<()> {
        bail!(BadName, "{}: unknown gain operation '{name}'", self.product())
    }

    fn start_run(&mut self, det_chan: i32, module: &Module, resume: bool) -> Result<()>;
    fn stop_run(&mut self, det_chan: i32, module: &Module) -> Result<()>;
    fn get_run_data(&mut self, det_chan: i32, module: &Module, name: &str) -> Result<Value>;

    fn do_special_run(
        &mut self,
        ctx: &mut ChannelContext<'_>,
        name: &str,
        info: &[f64],
    ) -> Result<()>;
    fn get_special_run_data(
        &mut self,
        det_chan: i32,
        module: &Module,
        name: &str,
    ) -> Result<Value>;

    /// Whether `name` may be dropped from a channel's defaults.
    fn can_remove_name(&self, _name: &str) -> bool {
        false
    }

    fn free_scas(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    /// Offer a module item the core does not know. Returns `true` if taken.
    fn ini_read(&mut self, _module: &Module, _name: &str, _value: &Value) -> Result<bool> {
        Ok(false)
    }

    /// Extra module items to persist.
    fn ini_write(&self, _module: &Module) -> Vec<(String, String)> {
        Vec::new()
    }

    fn load_chan_data(&mut self, module: &str, mod_chan: usize, data: &[u8]) -> Result<()>;
    fn save_chan_data(&self, module: &str, mod_chan: usize) -> Option<Vec<u8>>;
}

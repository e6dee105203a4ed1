//! Per-detChan acquisition operations.
//!
//! A detChan may name a single channel or a set. Setters walk every member of
//! a set and stop at the first failure; getters need a single channel.

use crate::channels::ElementType;
use crate::handel::SystemState;
use crate::{Handel, Result, Value};
use log::{debug, info};

impl Handel {
    fn require_running(&self, what: &str) -> Result<()> {
        if self.state != SystemState::Running {
            bail!(IllegalOperation, "{what} needs a started system, state is {}", self.state);
        }
        Ok(())
    }

    /// Single detChans addressed by `det_chan`.
    fn targets(&self, det_chan: i32) -> Result<Vec<i32>> {
        match self.channels.element_type(det_chan)? {
            ElementType::Single => Ok(vec![det_chan]),
            ElementType::Set => self.channels.resolve(det_chan),
        }
    }

    fn require_single(&self, det_chan: i32, what: &str) -> Result<()> {
        if self.channels.element_type(det_chan)? != ElementType::Single {
            bail!(BadType, "{what} needs a single detChan, {det_chan} is a set");
        }
        Ok(())
    }

    /// Apply `name` to every channel addressed by `det_chan`.
    ///
    /// `value` is updated with what the backend reports back. Every member
    /// of a set receives the caller's original value.
    pub fn set_acquisition_values(&mut self, det_chan: i32, name: &str, value: &mut f64) -> Result<()> {
        self.require_running("set_acquisition_values")?;
        let name = crate::registry::canonical_name(name)?;
        let requested = *value;
        for ch in self.targets(det_chan)? {
            let mut v = requested;
            self.with_channel(ch, |psl, ctx| {
                psl.set_acquisition_values(ctx, &name, &mut v)?;
                ctx.defaults.set(&name, v)?;
                ctx.defaults.mark_synced(&name);
                Ok(())
            })
            .map_err(|e| e.context(format!("detChan {ch}: setting '{name}'")))?;
            debug!("detChan {ch}: {name} = {v}");
            *value = v;
        }
        Ok(())
    }

    pub fn get_acquisition_values(&mut self, det_chan: i32, name: &str) -> Result<f64> {
        self.require_running("get_acquisition_values")?;
        self.require_single(det_chan, "get_acquisition_values")?;
        self.with_channel(det_chan, |psl, ctx| psl.get_acquisition_values(ctx, name))
            .map_err(|e| e.context(format!("detChan {det_chan}: reading '{name}'")))
    }

    /// Drop `name` from the channel defaults and re-run channel setup.
    pub fn remove_acquisition_values(&mut self, det_chan: i32, name: &str) -> Result<()> {
        self.require_running("remove_acquisition_values")?;
        for ch in self.targets(det_chan)? {
            self.with_channel(ch, |psl, ctx| {
                if !psl.can_remove_name(name) {
                    bail!(NoRemove, "'{name}' cannot be removed from detChan {}", ctx.det_chan);
                }
                ctx.defaults.remove(name)?;
                psl.setup_det_chan(ctx)?;
                psl.user_setup(ctx)
            })?;
            info!("detChan {ch}: removed acquisition value '{name}'");
        }
        Ok(())
    }

    /// Scale the gain of every addressed channel and record the new detector
    /// gain the backend reports.
    pub fn gain_calibrate(&mut self, det_chan: i32, delta_gain: f64) -> Result<()> {
        self.require_running("gain_calibrate")?;
        for ch in self.targets(det_chan)? {
            let updated = self.with_channel(ch, |psl, ctx| {
                let gain = psl.gain_calibrate(ctx, delta_gain)?;
                Ok(gain.map(|g| (ctx.detector.alias.clone(), ctx.detector_chan, g)))
            })?;
            if let Some((alias, k, gain)) = updated {
                let detector = self.detectors.get_mut(&alias)?;
                if let Some(slot) = detector.gain.get_mut(k) {
                    *slot = Some(gain);
                }
                debug!("detChan {ch}: detector '{alias}' channel {k} gain is now {gain}");
            }
        }
        Ok(())
    }

    pub fn gain_operation(&mut self, det_chan: i32, name: &str, value: &mut Value) -> Result<()> {
        self.require_running("gain_operation")?;
        let requested = value.clone();
        for ch in self.targets(det_chan)? {
            let mut v = requested.clone();
            self.with_channel(ch, |psl, ctx| psl.gain_operation(ctx, name, &mut v))?;
            *value = v;
        }
        Ok(())
    }

    pub fn board_operation(&mut self, det_chan: i32, name: &str, value: &mut Value) -> Result<()> {
        self.require_running("board_operation")?;
        let requested = value.clone();
        for ch in self.targets(det_chan)? {
            let mut v = requested.clone();
            self.with_module(ch, |psl, module, _| {
                psl.board_operation(ch, module, name, &mut v)
            })
            .map_err(|e| e.context(format!("detChan {ch}: board operation '{name}'")))?;
            *value = v;
        }
        Ok(())
    }

    /// Start a run. Channels of a multi-channel module start together, so a
    /// module that is already running is skipped.
    pub fn start_run(&mut self, det_chan: i32, resume: bool) -> Result<()> {
        self.require_running("start_run")?;
        for ch in self.targets(det_chan)? {
            self.with_module(ch, |psl, module, mod_chan| {
                if module.multi_channel {
                    if module.run_active.iter().any(|&a| a) {
                        info!("detChan {ch}: module '{}' is already running", module.alias);
                        return Ok(());
                    }
                    psl.start_run(ch, module, resume)?;
                    module.run_active.fill(true);
                } else {
                    psl.start_run(ch, module, resume)?;
                    module.run_active[mod_chan] = true;
                }
                Ok(())
            })
            .map_err(|e| e.context(format!("detChan {ch}: start_run")))?;
        }
        Ok(())
    }

    pub fn stop_run(&mut self, det_chan: i32) -> Result<()> {
        self.require_running("stop_run")?;
        for ch in self.targets(det_chan)? {
            self.with_module(ch, |psl, module, mod_chan| {
                if module.multi_channel {
                    if !module.run_active.iter().any(|&a| a) {
                        debug!("detChan {ch}: module '{}' is not running", module.alias);
                        return Ok(());
                    }
                    psl.stop_run(ch, module)?;
                    module.run_active.fill(false);
                } else {
                    psl.stop_run(ch, module)?;
                    module.run_active[mod_chan] = false;
                }
                Ok(())
            })
            .map_err(|e| e.context(format!("detChan {ch}: stop_run")))?;
        }
        Ok(())
    }

    pub fn get_run_data(&mut self, det_chan: i32, name: &str) -> Result<Value> {
        self.require_running("get_run_data")?;
        self.require_single(det_chan, "get_run_data")?;
        self.with_module(det_chan, |psl, module, _| psl.get_run_data(det_chan, module, name))
            .map_err(|e| e.context(format!("detChan {det_chan}: run data '{name}'")))
    }

    pub fn do_special_run(&mut self, det_chan: i32, name: &str, info: &[f64]) -> Result<()> {
        self.require_running("do_special_run")?;
        for ch in self.targets(det_chan)? {
            self.with_channel(ch, |psl, ctx| psl.do_special_run(ctx, name, info))
                .map_err(|e| e.context(format!("detChan {ch}: special run '{name}'")))?;
        }
        Ok(())
    }

    pub fn get_special_run_data(&mut self, det_chan: i32, name: &str) -> Result<Value> {
        self.require_running("get_special_run_data")?;
        self.require_single(det_chan, "get_special_run_data")?;
        self.with_module(det_chan, |psl, module, _| {
            psl.get_special_run_data(det_chan, module, name)
        })
    }

    /// Whether the run bookkeeping marks `det_chan` as acquiring.
    pub fn is_run_active(&self, det_chan: i32) -> bool {
        self.channels
            .find_alias(det_chan)
            .ok()
            .and_then(|alias| self.modules.find(alias))
            .and_then(|m| m.module_channel(det_chan).map(|c| m.run_active[c]))
            .unwrap_or(false)
    }
}

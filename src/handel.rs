use crate::channels::{DetChanDirectory, ElementType, ALL_CHANNELS, NO_MODULE_CHANNEL};
use crate::module::ModuleItem;
use crate::psl::{ChannelContext, Psl};
use crate::registry::{Record, Registry};
use crate::{
    validate, Detector, ErrorKind, FirmwareSet, HandelError, Module, Result, Value, XiaDefaults,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemState {
    Dead,
    Starting,
    Running,
    Ending,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SystemState::Dead => "DEAD",
            SystemState::Starting => "STARTING",
            SystemState::Running => "RUNNING",
            SystemState::Ending => "ENDING",
        })
    }
}

/// One driver instance: the registries, the detChan directory, the system
/// state and the table of product backends.
pub struct Handel {
    pub(crate) state: SystemState,
    pub(crate) detectors: Registry<Detector>,
    pub(crate) firmware: Registry<FirmwareSet>,
    pub(crate) defaults: Registry<XiaDefaults>,
    pub(crate) modules: Registry<Module>,
    pub(crate) channels: DetChanDirectory,
    pub(crate) backends: HashMap<&'static str, Box<dyn Psl>>,
}

/// A driver behind the coarse lock shared with the polling worker.
pub type SharedHandel = Arc<Mutex<Handel>>;

impl Default for Handel {
    fn default() -> Self {
        Self::new()
    }
}

impl Handel {
    pub fn new() -> Self {
        Self {
            state: SystemState::Dead,
            detectors: Registry::new(),
            firmware: Registry::new(),
            defaults: Registry::new(),
            modules: Registry::new(),
            channels: DetChanDirectory::new(),
            backends: HashMap::new(),
        }
    }

    pub fn with_backend(mut self, psl: impl Psl + 'static) -> Self {
        self.register_backend(Box::new(psl));
        self
    }

    pub fn register_backend(&mut self, psl: Box<dyn Psl>) {
        let product = psl.product();
        if self.backends.insert(product, psl).is_some() {
            warn!("replacing the backend registered for '{product}'");
        }
    }

    pub fn into_shared(self) -> SharedHandel {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn channels(&self) -> &DetChanDirectory {
        &self.channels
    }

    fn require_dead(&self, what: &str) -> Result<()> {
        if self.state != SystemState::Dead {
            bail!(
                NoModify,
                "cannot {what} while the system is {}; call end_system first",
                self.state
            );
        }
        Ok(())
    }

    /// Drop every configured record. A started system is ended first.
    pub fn init(&mut self) {
        if self.state != SystemState::Dead {
            if let Err(e) = self.end_system() {
                error!("ending the system during init: {e}");
            }
        }
        self.channels.clear();
        self.modules.clear();
        self.defaults.clear();
        self.firmware.clear();
        self.detectors.clear();
        debug!("registries cleared");
    }

    pub fn exit(&mut self) {
        info!("exiting");
        self.init();
    }

    // detectors

    pub fn new_detector(&mut self, alias: &str) -> Result<()> {
        self.require_dead("create a detector")?;
        self.detectors.create(alias)?;
        Ok(())
    }

    pub fn add_detector_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("add detector items")?;
        self.detectors
            .get_mut(alias)?
            .add_item(name, &value.into())
            .map_err(|e| e.context(format!("detector '{alias}' item '{name}'")))
    }

    pub fn modify_detector_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("modify detector items")?;
        self.detectors
            .get_mut(alias)?
            .modify_item(name, &value.into())
            .map_err(|e| e.context(format!("detector '{alias}' item '{name}'")))
    }

    pub fn get_detector_item(&self, alias: &str, name: &str) -> Result<Value> {
        self.detectors.get(alias)?.get_item(name)
    }

    pub fn remove_detector(&mut self, alias: &str) -> Result<()> {
        self.require_dead("remove a detector")?;
        self.detectors.remove(alias).map(drop)
    }

    pub fn remove_all_detectors(&mut self) -> Result<()> {
        self.require_dead("remove detectors")?;
        self.detectors.clear();
        Ok(())
    }

    pub fn num_detectors(&self) -> usize {
        self.detectors.len()
    }

    pub fn list_detectors(&self) -> Vec<String> {
        self.detectors.aliases()
    }

    pub fn detector_alias(&self, index: usize) -> Result<&str> {
        self.detectors.alias_at(index)
    }

    pub fn detector(&self, alias: &str) -> Option<&Detector> {
        self.detectors.find(alias)
    }

    pub fn detector_from_detchan(&self, det_chan: i32) -> Result<String> {
        let (_, detector) = self.find_module_and_detector(det_chan)?;
        Ok(detector.alias.clone())
    }

    // firmware

    pub fn new_firmware(&mut self, alias: &str) -> Result<()> {
        self.require_dead("create a firmware set")?;
        self.firmware.create(alias)?;
        Ok(())
    }

    pub fn add_firmware_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("add firmware items")?;
        self.firmware
            .get_mut(alias)?
            .add_item(name, &value.into())
            .map_err(|e| e.context(format!("firmware '{alias}' item '{name}'")))
    }

    pub fn modify_firmware_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("modify firmware items")?;
        self.firmware
            .get_mut(alias)?
            .modify_item(name, &value.into())
            .map_err(|e| e.context(format!("firmware '{alias}' item '{name}'")))
    }

    pub fn get_firmware_item(&self, alias: &str, name: &str) -> Result<Value> {
        self.firmware.get(alias)?.get_item(name)
    }

    pub fn remove_firmware(&mut self, alias: &str) -> Result<()> {
        self.require_dead("remove a firmware set")?;
        self.firmware.remove(alias).map(drop)
    }

    pub fn remove_all_firmware(&mut self) -> Result<()> {
        self.require_dead("remove firmware sets")?;
        self.firmware.clear();
        Ok(())
    }

    pub fn num_firmware_sets(&self) -> usize {
        self.firmware.len()
    }

    pub fn list_firmware(&self) -> Vec<String> {
        self.firmware.aliases()
    }

    pub fn firmware_set(&self, alias: &str) -> Option<&FirmwareSet> {
        self.firmware.find(alias)
    }

    // defaults

    pub fn new_default(&mut self, alias: &str) -> Result<()> {
        self.require_dead("create a defaults set")?;
        self.defaults.create(alias)?;
        Ok(())
    }

    pub fn add_default_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("add default items")?;
        self.defaults
            .get_mut(alias)?
            .add_item(name, &value.into())
            .map_err(|e| e.context(format!("defaults '{alias}' item '{name}'")))
    }

    pub fn modify_default_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("modify default items")?;
        self.defaults
            .get_mut(alias)?
            .modify_item(name, &value.into())
            .map_err(|e| e.context(format!("defaults '{alias}' item '{name}'")))
    }

    pub fn get_default_item(&self, alias: &str, name: &str) -> Result<Value> {
        self.defaults.get(alias)?.get_item(name)
    }

    pub fn remove_default(&mut self, alias: &str) -> Result<()> {
        self.require_dead("remove a defaults set")?;
        self.defaults.remove(alias).map(drop)
    }

    pub fn remove_all_defaults(&mut self) -> Result<()> {
        self.require_dead("remove defaults sets")?;
        self.defaults.clear();
        Ok(())
    }

    pub fn num_defaults(&self) -> usize {
        self.defaults.len()
    }

    pub fn list_defaults(&self) -> Vec<String> {
        self.defaults.aliases()
    }

    pub fn defaults_set(&self, alias: &str) -> Option<&XiaDefaults> {
        self.defaults.find(alias)
    }

    // modules

    pub fn new_module(&mut self, alias: &str) -> Result<()> {
        self.require_dead("create a module")?;
        self.modules.create(alias)?;
        Ok(())
    }

    pub fn add_module_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("add module items")?;
        self.set_module_item(alias, name, value.into(), false)
            .map_err(|e| e.context(format!("module '{alias}' item '{name}'")))
    }

    pub fn modify_module_item(&mut self, alias: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require_dead("modify module items")?;
        self.set_module_item(alias, name, value.into(), true)
            .map_err(|e| e.context(format!("module '{alias}' item '{name}'")))
    }

    fn set_module_item(&mut self, alias: &str, name: &str, value: Value, modify: bool) -> Result<()> {
        let Handel {
            modules,
            channels,
            backends,
            ..
        } = self;
        let module = modules.get_mut(alias)?;
        let item = match name.parse::<ModuleItem>() {
            Ok(item) => item,
            Err(e) if e.kind() == ErrorKind::BadName => {
                let backend = module.product.and_then(|p| backends.get_mut(p));
                if let Some(psl) = backend {
                    if psl.ini_read(module, name, &value)? {
                        return Ok(());
                    }
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match item {
            ModuleItem::ChannelAlias(chan) => {
                module.check_ordering(item)?;
                let det_chan = value.as_i64()?;
                let det_chan = i32::try_from(det_chan)
                    .ok()
                    .filter(|&d| d >= ALL_CHANNELS)
                    .ok_or_else(|| err!(BadValue, "{det_chan} is not a valid detChan"))?;
                let old = module.channels[chan];
                if det_chan == old {
                    return Ok(());
                }
                if det_chan >= 0 {
                    channels.add_single(det_chan, &module.alias)?;
                }
                if old >= 0 {
                    channels.remove(old)?;
                }
                module.channels[chan] = det_chan;
                Ok(())
            }
            ModuleItem::DataChan(_) | ModuleItem::DataAll => {
                module.check_ordering(item)?;
                let product = module
                    .product
                    .ok_or_else(|| err!(NeedsBoardType, "module has no module_type"))?;
                let psl = backends
                    .get_mut(product)
                    .ok_or_else(|| err!(UnknownBoard, "no backend registered for '{product}'"))?;
                let data = value.as_bytes()?;
                let targets = match item {
                    ModuleItem::DataChan(chan) => vec![chan],
                    _ => (0..module.number_of_channels).collect(),
                };
                for chan in targets {
                    psl.load_chan_data(&module.alias, chan, data)?;
                }
                Ok(())
            }
            _ => module.set(item, &value, modify),
        }
    }

    pub fn get_module_item(&self, alias: &str, name: &str) -> Result<Value> {
        let module = self.modules.get(alias)?;
        let item: ModuleItem = name.parse()?;
        match item {
            ModuleItem::DataChan(chan) => {
                module.check_channel(chan)?;
                let psl = self.backend_for(module)?;
                psl.save_chan_data(&module.alias, chan)
                    .map(Value::Bytes)
                    .ok_or_else(|| err!(UnknownItem, "module '{alias}' channel {chan} has no data"))
            }
            _ => module.get(item),
        }
    }

    /// Remove a module and release its detChans. Keeps going on errors and
    /// reports the first one.
    pub fn remove_module(&mut self, alias: &str) -> Result<()> {
        self.require_dead("remove a module")?;
        let module = self.modules.remove(alias)?;
        let mut first: Option<HandelError> = None;
        for &det_chan in module.channels.iter().filter(|&&c| c >= 0) {
            if let Err(e) = self.channels.remove(det_chan) {
                warn!("module '{}': releasing detChan {det_chan}: {e}", module.alias);
                first.get_or_insert(e);
            }
        }
        if let Some(psl) = module.product.and_then(|p| self.backends.get_mut(p)) {
            if let Err(e) = psl.free_scas(&module) {
                warn!("module '{}': freeing SCAs: {e}", module.alias);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn remove_all_modules(&mut self) -> Result<()> {
        let mut first = None;
        for alias in self.modules.aliases() {
            if let Err(e) = self.remove_module(&alias) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn list_modules(&self) -> Vec<String> {
        self.modules.aliases()
    }

    pub fn module(&self, alias: &str) -> Option<&Module> {
        self.modules.find(alias)
    }

    pub fn module_from_detchan(&self, det_chan: i32) -> Result<String> {
        Ok(self.channels.find_alias(det_chan)?.to_string())
    }

    /// Module channel index of `det_chan`, or 999 when it is not bound.
    pub fn get_module_channel(&self, det_chan: i32) -> usize {
        self.channels
            .find_alias(det_chan)
            .ok()
            .and_then(|alias| self.modules.find(alias))
            .and_then(|m| m.module_channel(det_chan))
            .unwrap_or(NO_MODULE_CHANNEL)
    }

    pub fn find_module_and_detector(&self, det_chan: i32) -> Result<(&Module, &Detector)> {
        let alias = self.channels.find_alias(det_chan)?;
        let module = self
            .modules
            .get(alias)
            .map_err(|_| err!(NoModule, "detChan {det_chan} refers to missing module '{alias}'"))?;
        let chan = module
            .module_channel(det_chan)
            .ok_or_else(|| err!(InvalidDetChan, "module '{alias}' does not own detChan {det_chan}"))?;
        let det_alias = module.detector[chan]
            .as_deref()
            .ok_or_else(|| err!(NoAlias, "module '{alias}' channel {chan} has no detector"))?;
        Ok((module, self.detectors.get(det_alias)?))
    }

    // detChan sets

    pub fn add_channel_set_elem(&mut self, set: i32, elem: i32) -> Result<()> {
        self.require_dead("edit detChan sets")?;
        if self.channels.is_free(set) {
            self.channels.add_set(set)?;
        }
        self.channels.set_add(set, elem)
    }

    pub fn remove_channel_set_elem(&mut self, set: i32, elem: i32) -> Result<()> {
        self.require_dead("edit detChan sets")?;
        self.channels.set_remove(set, elem)
    }

    pub fn remove_channel_set(&mut self, set: i32) -> Result<()> {
        self.require_dead("remove a detChan set")?;
        if self.channels.element_type(set)? != ElementType::Set || set == ALL_CHANNELS {
            bail!(WrongType, "detChan {set} is not a user set");
        }
        self.channels.remove(set)
    }

    // lifecycle

    /// Validate the configuration and bring every module and detChan up.
    ///
    /// On failure the system is left DEAD and the first error is returned.
    pub fn start_system(&mut self) -> Result<()> {
        if self.state != SystemState::Dead {
            bail!(IllegalOperation, "start_system while {}", self.state);
        }
        self.state = SystemState::Starting;
        info!(
            "starting system: {} detectors, {} firmware sets, {} modules",
            self.detectors.len(),
            self.firmware.len(),
            self.modules.len()
        );
        match self.bring_up() {
            Ok(()) => {
                self.state = SystemState::Running;
                info!("system running");
                Ok(())
            }
            Err(e) => {
                error!("start_system failed: {e}");
                self.state = SystemState::Dead;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<()> {
        validate::validate_configuration(self)?;
        for alias in self.modules.aliases() {
            self.setup_defaults(&alias)?;
            self.setup_module(&alias)?;
        }
        for det_chan in self.channels.singles() {
            debug!("setting up detChan {det_chan}");
            self.with_channel(det_chan, |psl, ctx| {
                psl.setup_det_chan(ctx)?;
                psl.set_detector_type_value(ctx)?;
                psl.user_setup(ctx)
            })
            .map_err(|e| e.context(format!("setting up detChan {det_chan}")))?;
        }
        Ok(())
    }

    /// Give every bound module channel its own defaults set: the backend's
    /// catalog overwritten by whatever the user configured.
    fn setup_defaults(&mut self, alias: &str) -> Result<()> {
        let Handel {
            modules,
            defaults,
            backends,
            ..
        } = self;
        let module = modules.get_mut(alias)?;
        let psl = backend_mut(backends, module)?;
        let mut catalog = XiaDefaults::with_alias(psl.default_alias().to_string());
        for (name, value) in psl.default_values() {
            catalog.set(&name, value)?;
        }
        if catalog.len() != psl.num_defaults() {
            warn!(
                "{}: catalog lists {} values but reports {}",
                psl.product(),
                catalog.len(),
                psl.num_defaults()
            );
        }

        for chan in 0..module.number_of_channels {
            if module.channels[chan] < 0 {
                continue;
            }
            let target = XiaDefaults::module_channel_alias(&module.alias, chan);
            let empty = XiaDefaults::default();
            let user = match &module.defaults[chan] {
                Some(user_alias) => defaults.get(user_alias)?.clone(),
                None => defaults.find(&target).cloned().unwrap_or(empty),
            };
            let merged = XiaDefaults::merged(&target, &catalog, &user)?;
            match defaults.find_mut(&target) {
                Some(existing) => *existing = merged,
                None => defaults.insert(merged)?,
            }
            debug!("module '{}' channel {chan} uses defaults '{target}'", module.alias);
            module.defaults[chan] = Some(target);
        }
        Ok(())
    }

    fn setup_module(&mut self, alias: &str) -> Result<()> {
        let Handel {
            modules, backends, ..
        } = self;
        let module = modules.get_mut(alias)?;
        let psl = backend_mut(backends, module)?;
        psl.setup_module(module)
            .map_err(|e| e.context(format!("setting up module '{alias}'")))?;
        module.multi_channel = psl.is_multi_channel(module);
        module.run_active = vec![false; module.number_of_channels];
        Ok(())
    }

    /// Tear every detChan and module down. Both phases always run; the
    /// first failure is returned.
    pub fn end_system(&mut self) -> Result<()> {
        match self.state {
            SystemState::Dead => {
                debug!("end_system: already DEAD");
                return Ok(());
            }
            SystemState::Ending => bail!(IllegalOperation, "end_system while ENDING"),
            SystemState::Starting | SystemState::Running => {}
        }
        self.state = SystemState::Ending;
        info!("ending system");

        let mut first: Option<HandelError> = None;
        for det_chan in self.channels.singles() {
            let result = self
                .find_module_and_detector(det_chan)
                .map(|(m, d)| (m.clone(), d.clone()))
                .and_then(|(module, detector)| {
                    let psl = backend_mut(&mut self.backends, &module)?;
                    psl.end_det_chan(det_chan, &module, &detector)
                });
            if let Err(e) = result {
                warn!("ending detChan {det_chan}: {e}");
                first.get_or_insert(e);
            }
        }

        let Handel {
            modules, backends, ..
        } = self;
        for module in modules.iter_mut() {
            let result = backend_mut(backends, module).and_then(|psl| {
                psl.free_scas(module)?;
                psl.end_module(module)
            });
            if let Err(e) = result {
                warn!("ending module '{}': {e}", module.alias);
                first.get_or_insert(e);
            }
            module.run_active.fill(false);
        }

        self.state = SystemState::Dead;
        first.map_or(Ok(()), Err)
    }

    // dispatch helpers

    pub(crate) fn backend_for(&self, module: &Module) -> Result<&dyn Psl> {
        let product = module
            .product
            .ok_or_else(|| err!(NeedsBoardType, "module '{}' has no module_type", module.alias))?;
        self.backends
            .get(product)
            .map(|b| b.as_ref())
            .ok_or_else(|| err!(UnknownBoard, "no backend registered for '{product}'"))
    }

    /// Resolve `det_chan` to its records and hand them to `op`.
    pub(crate) fn with_channel<R>(
        &mut self,
        det_chan: i32,
        op: impl FnOnce(&mut dyn Psl, &mut ChannelContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let Handel {
            detectors,
            firmware,
            defaults,
            modules,
            channels,
            backends,
            ..
        } = self;
        let alias = channels.find_alias(det_chan)?;
        let module = modules
            .get(alias)
            .map_err(|_| err!(NoModule, "detChan {det_chan} refers to missing module '{alias}'"))?;
        let mod_chan = module
            .module_channel(det_chan)
            .ok_or_else(|| err!(InvalidDetChan, "module '{alias}' does not own detChan {det_chan}"))?;
        let det_alias = module.detector[mod_chan]
            .as_deref()
            .ok_or_else(|| err!(NoAlias, "module '{alias}' channel {mod_chan} has no detector"))?;
        let detector_chan = module.detector_chan[mod_chan].unwrap_or(0);
        let detector = detectors.get(det_alias)?;
        let firmware = match &module.firmware[mod_chan] {
            Some(fw) => Some(firmware.get(fw)?),
            None => None,
        };
        let defaults_alias = module.defaults[mod_chan].as_deref().ok_or_else(|| {
            err!(NoAlias, "module '{alias}' channel {mod_chan} has no defaults")
        })?;
        let defaults = defaults.get_mut(defaults_alias)?;
        let product = module
            .product
            .ok_or_else(|| err!(NeedsBoardType, "module '{alias}' has no module_type"))?;
        let psl = backends
            .get_mut(product)
            .ok_or_else(|| err!(UnknownBoard, "no backend registered for '{product}'"))?;

        let mut ctx = ChannelContext {
            det_chan,
            mod_chan,
            module,
            detector,
            detector_chan,
            firmware,
            defaults,
        };
        op(psl.as_mut(), &mut ctx)
    }

    /// Resolve `det_chan` to its module, module channel and backend.
    pub(crate) fn with_module<R>(
        &mut self,
        det_chan: i32,
        op: impl FnOnce(&mut dyn Psl, &mut Module, usize) -> Result<R>,
    ) -> Result<R> {
        let Handel {
            modules,
            channels,
            backends,
            ..
        } = self;
        let alias = channels.find_alias(det_chan)?;
        let module = modules
            .get_mut(alias)
            .map_err(|_| err!(NoModule, "detChan {det_chan} refers to missing module '{alias}'"))?;
        let mod_chan = module
            .module_channel(det_chan)
            .ok_or_else(|| err!(InvalidDetChan, "module '{alias}' does not own detChan {det_chan}"))?;
        let psl = backend_mut(backends, module)?;
        op(psl, module, mod_chan)
    }
}

fn backend_mut<'a>(
    backends: &'a mut HashMap<&'static str, Box<dyn Psl>>,
    module: &Module,
) -> Result<&'a mut dyn Psl> {
    let product = module
        .product
        .ok_or_else(|| err!(NeedsBoardType, "module '{}' has no module_type", module.alias))?;
    match backends.get_mut(product) {
        Some(psl) => Ok(psl.as_mut()),
        None => Err(err!(UnknownBoard, "no backend registered for '{product}'")),
    }
}

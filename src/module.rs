use crate::registry::{canonical_alias, canonical_name, indexed, Record};
use crate::{Result, Value};
use std::str::FromStr;

/// Module type tags accepted in `module_type`, with the backend product each
/// one selects.
pub const KNOWN_PRODUCTS: &[(&str, &str)] = &[
    ("falconx", "falconxn"),
    ("falconx1", "falconxn"),
    ("falconx4", "falconxn"),
    ("falconx8", "falconxn"),
    ("falconxn", "falconxn"),
];

/// Backend product selected by a `module_type` tag.
pub fn product_for(tag: &str) -> Result<&'static str> {
    let tag = tag.trim().to_ascii_lowercase();
    KNOWN_PRODUCTS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, product)| *product)
        .ok_or_else(|| err!(UnknownBoard, "unknown module type '{tag}'"))
}

/// Transport used by the backend to reach the module.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Interface {
    #[default]
    None,
    Inet {
        address: Option<String>,
        port: Option<u16>,
        timeout: Option<u32>,
    },
    Usb2 {
        device_number: Option<u32>,
    },
}

impl Interface {
    fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "inet" => Ok(Interface::Inet {
                address: None,
                port: None,
                timeout: None,
            }),
            "usb2" => Ok(Interface::Usb2 {
                device_number: None,
            }),
            other => Err(err!(BadInterface, "unknown interface '{other}'")),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Interface::None => None,
            Interface::Inet { .. } => Some("inet"),
            Interface::Usb2 { .. } => Some("usb2"),
        }
    }
}

/// Firmware files currently loaded on a module channel.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CurrentFirmware {
    pub fippi: Option<String>,
    pub user_fippi: Option<String>,
    pub dsp: Option<String>,
    pub user_dsp: Option<String>,
    pub mmu: Option<String>,
    pub sys_fpga: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleItem {
    ModuleType,
    NumberOfChannels,
    Interface,
    InetAddress,
    InetPort,
    InetTimeout,
    DeviceNumber,
    ChannelAlias(usize),
    ChannelDetector(usize),
    FirmwareSetAll,
    FirmwareSetChan(usize),
    DefaultAll,
    DefaultChan(usize),
    DataAll,
    DataChan(usize),
}

impl ModuleItem {
    /// Items that require `module_type` and `number_of_channels` first.
    pub fn is_channel_bound(self) -> bool {
        !matches!(
            self,
            Self::ModuleType
                | Self::NumberOfChannels
                | Self::Interface
                | Self::InetAddress
                | Self::InetPort
                | Self::InetTimeout
                | Self::DeviceNumber
        )
    }

    pub fn channel(self) -> Option<usize> {
        match self {
            Self::ChannelAlias(n)
            | Self::ChannelDetector(n)
            | Self::FirmwareSetChan(n)
            | Self::DefaultChan(n)
            | Self::DataChan(n) => Some(n),
            _ => None,
        }
    }
}

impl FromStr for ModuleItem {
    type Err = crate::HandelError;

    fn from_str(name: &str) -> Result<Self> {
        let name = canonical_name(name)?;
        let item = match name.as_str() {
            "module_type" => Self::ModuleType,
            "number_of_channels" => Self::NumberOfChannels,
            "interface" => Self::Interface,
            "inet_address" => Self::InetAddress,
            "inet_port" => Self::InetPort,
            "inet_timeout" => Self::InetTimeout,
            "device_number" => Self::DeviceNumber,
            "firmware_set_all" => Self::FirmwareSetAll,
            "default_all" => Self::DefaultAll,
            "data_all" => Self::DataAll,
            _ => {
                if let Some(n) = indexed(&name, "channel", "_alias") {
                    Self::ChannelAlias(n)
                } else if let Some(n) = indexed(&name, "channel", "_detector") {
                    Self::ChannelDetector(n)
                } else if let Some(n) = indexed(&name, "firmware_set_chan", "") {
                    Self::FirmwareSetChan(n)
                } else if let Some(n) = indexed(&name, "default_chan", "") {
                    Self::DefaultChan(n)
                } else if let Some(n) = indexed(&name, "data_chan", "") {
                    Self::DataChan(n)
                } else {
                    bail!(BadName, "'{name}' is not a module item");
                }
            }
        };
        Ok(item)
    }
}

/// Split `"{detector-alias}:{k}"` into its two halves.
pub fn parse_detector_ref(value: &str) -> Result<(String, usize)> {
    let Some((alias, chan)) = value.trim().rsplit_once(':') else {
        bail!(BadValue, "'{value}' is not of the form alias:channel");
    };
    let alias = canonical_alias(alias)?;
    let chan = chan
        .trim()
        .parse::<usize>()
        .map_err(|_| err!(BadValue, "'{chan}' is not a detector channel"))?;
    Ok((alias, chan))
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Module {
    pub alias: String,
    /// Tag as given by the user, written back verbatim.
    pub type_tag: Option<String>,
    pub product: Option<&'static str>,
    pub number_of_channels: usize,
    pub interface: Interface,
    pub channels: Vec<i32>,
    pub detector: Vec<Option<String>>,
    pub detector_chan: Vec<Option<usize>>,
    pub firmware: Vec<Option<String>>,
    pub defaults: Vec<Option<String>>,
    pub current_firmware: Vec<CurrentFirmware>,
    pub run_active: Vec<bool>,
    pub multi_channel: bool,
}

impl Record for Module {
    const KIND: &'static str = "module";

    fn with_alias(alias: String) -> Self {
        Self {
            alias,
            ..Default::default()
        }
    }

    fn alias(&self) -> &str {
        &self.alias
    }
}

impl Module {
    /// Fails with `NeedsBoardType` until both the type and channel count are set.
    pub fn check_ordering(&self, item: ModuleItem) -> Result<()> {
        if !item.is_channel_bound() {
            return Ok(());
        }
        if self.product.is_none() {
            bail!(
                NeedsBoardType,
                "module '{}': module_type must be set before {item:?}",
                self.alias
            );
        }
        if self.number_of_channels == 0 {
            bail!(
                NeedsBoardType,
                "module '{}': number_of_channels must be set before {item:?}",
                self.alias
            );
        }
        if let Some(chan) = item.channel() {
            self.check_channel(chan)?;
        }
        Ok(())
    }

    pub fn check_channel(&self, chan: usize) -> Result<()> {
        if chan >= self.number_of_channels {
            bail!(
                BadChannel,
                "module '{}' has {} channels, channel {chan} is out of range",
                self.alias,
                self.number_of_channels
            );
        }
        Ok(())
    }

    /// Module channel that owns `det_chan`.
    pub fn module_channel(&self, det_chan: i32) -> Option<usize> {
        self.channels.iter().position(|&c| c == det_chan && c >= 0)
    }

    /// Apply an item that does not touch the channel directory or backend.
    pub fn set(&mut self, item: ModuleItem, value: &Value, modify: bool) -> Result<()> {
        self.check_ordering(item)?;
        match item {
            ModuleItem::ModuleType => {
                if modify || self.product.is_some() {
                    bail!(NoModify, "module '{}': module_type is already set", self.alias);
                }
                let tag = value.as_str()?.trim().to_ascii_lowercase();
                self.product = Some(product_for(&tag)?);
                self.type_tag = Some(tag);
            }
            ModuleItem::NumberOfChannels => {
                if modify || self.number_of_channels != 0 {
                    bail!(
                        NoModify,
                        "module '{}': number_of_channels is already set",
                        self.alias
                    );
                }
                let n = value.as_usize()?;
                if n == 0 {
                    bail!(BadValue, "module '{}': number_of_channels must be > 0", self.alias);
                }
                self.number_of_channels = n;
                self.channels = vec![-1; n];
                self.detector = vec![None; n];
                self.detector_chan = vec![None; n];
                self.firmware = vec![None; n];
                self.defaults = vec![None; n];
                self.current_firmware = vec![CurrentFirmware::default(); n];
                self.run_active = vec![false; n];
            }
            ModuleItem::Interface => {
                self.interface = Interface::parse(value.as_str()?)?;
            }
            ModuleItem::InetAddress | ModuleItem::InetPort | ModuleItem::InetTimeout => {
                let alias = self.alias.clone();
                match &mut self.interface {
                    Interface::Inet {
                        address,
                        port,
                        timeout,
                    } => match item {
                        ModuleItem::InetAddress => {
                            *address = Some(value.as_str()?.trim().to_string());
                        }
                        ModuleItem::InetPort => {
                            let p = value.as_i64()?;
                            *port = Some(u16::try_from(p).map_err(|_| {
                                err!(BadValue, "module '{alias}': inet_port {p} is out of range")
                            })?);
                        }
                        _ => {
                            let t = value.as_i64()?;
                            *timeout = Some(u32::try_from(t).map_err(|_| {
                                err!(BadValue, "module '{alias}': inet_timeout {t} is out of range")
                            })?);
                        }
                    },
                    Interface::None => bail!(
                        MissingInterface,
                        "module '{alias}': set interface = inet before {item:?}"
                    ),
                    other => bail!(
                        WrongInterface,
                        "module '{alias}': {item:?} does not apply to a {:?} interface",
                        other.name()
                    ),
                }
            }
            ModuleItem::DeviceNumber => match &mut self.interface {
                Interface::Usb2 { device_number } => {
                    let n = value.as_i64()?;
                    *device_number = Some(
                        u32::try_from(n).map_err(|_| err!(BadValue, "bad device_number {n}"))?,
                    );
                }
                Interface::None => bail!(
                    MissingInterface,
                    "module '{}': set interface = usb2 before device_number",
                    self.alias
                ),
                _ => bail!(
                    WrongInterface,
                    "module '{}': device_number needs a usb2 interface",
                    self.alias
                ),
            },
            ModuleItem::ChannelDetector(chan) => {
                let (alias, det_chan) = parse_detector_ref(value.as_str()?)?;
                self.detector[chan] = Some(alias);
                self.detector_chan[chan] = Some(det_chan);
            }
            ModuleItem::FirmwareSetAll => {
                let alias = canonical_alias(value.as_str()?)?;
                self.firmware.fill(Some(alias));
            }
            ModuleItem::FirmwareSetChan(chan) => {
                self.firmware[chan] = Some(canonical_alias(value.as_str()?)?);
            }
            ModuleItem::DefaultAll => {
                let alias = canonical_alias(value.as_str()?)?;
                self.defaults.fill(Some(alias));
            }
            ModuleItem::DefaultChan(chan) => {
                self.defaults[chan] = Some(canonical_alias(value.as_str()?)?);
            }
            ModuleItem::ChannelAlias(_) | ModuleItem::DataAll | ModuleItem::DataChan(_) => {
                bail!(
                    IllegalOperation,
                    "module '{}': {item:?} must go through the system",
                    self.alias
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, item: ModuleItem) -> Result<Value> {
        if let Some(chan) = item.channel() {
            self.check_channel(chan)?;
        }
        let unset = || err!(UnknownItem, "module '{}': {item:?} is not set", self.alias);
        match item {
            ModuleItem::ModuleType => self.type_tag.clone().map(Value::from).ok_or_else(unset),
            ModuleItem::NumberOfChannels => Ok(Value::from(self.number_of_channels)),
            ModuleItem::Interface => self
                .interface
                .name()
                .map(Value::from)
                .ok_or_else(|| err!(MissingInterface, "module '{}' has no interface", self.alias)),
            ModuleItem::InetAddress | ModuleItem::InetPort | ModuleItem::InetTimeout => {
                match &self.interface {
                    Interface::Inet {
                        address,
                        port,
                        timeout,
                    } => match item {
                        ModuleItem::InetAddress => {
                            address.clone().map(Value::from).ok_or_else(unset)
                        }
                        ModuleItem::InetPort => port.map(Value::from).ok_or_else(unset),
                        _ => timeout.map(Value::from).ok_or_else(unset),
                    },
                    Interface::None => Err(err!(
                        MissingInterface,
                        "module '{}' has no interface",
                        self.alias
                    )),
                    _ => Err(err!(WrongInterface, "module '{}' is not inet", self.alias)),
                }
            }
            ModuleItem::DeviceNumber => match &self.interface {
                Interface::Usb2 { device_number } => {
                    device_number.map(Value::from).ok_or_else(unset)
                }
                _ => Err(err!(WrongInterface, "module '{}' is not usb2", self.alias)),
            },
            ModuleItem::ChannelAlias(chan) => Ok(Value::from(self.channels[chan])),
            ModuleItem::ChannelDetector(chan) => {
                match (&self.detector[chan], self.detector_chan[chan]) {
                    (Some(alias), Some(k)) => Ok(Value::from(format!("{alias}:{k}"))),
                    _ => Err(unset()),
                }
            }
            ModuleItem::FirmwareSetAll => self.firmware.first().cloned().flatten().map(Value::from).ok_or_else(unset),
            ModuleItem::FirmwareSetChan(chan) => {
                self.firmware[chan].clone().map(Value::from).ok_or_else(unset)
            }
            ModuleItem::DefaultAll => self.defaults.first().cloned().flatten().map(Value::from).ok_or_else(unset),
            ModuleItem::DefaultChan(chan) => {
                self.defaults[chan].clone().map(Value::from).ok_or_else(unset)
            }
            ModuleItem::DataAll | ModuleItem::DataChan(_) => Err(err!(
                IllegalOperation,
                "module '{}': channel data is owned by the backend",
                self.alias
            )),
        }
    }

    /// Checks made before the system is started.
    pub fn validate(&self) -> Result<()> {
        if self.product.is_none() {
            bail!(MissingType, "module '{}': module_type is not set", self.alias);
        }
        if self.number_of_channels == 0 {
            bail!(BadChannel, "module '{}': number_of_channels is not set", self.alias);
        }
        match &self.interface {
            Interface::None => {
                bail!(MissingInterface, "module '{}' has no interface", self.alias)
            }
            Interface::Inet { address, port, .. } => {
                if address.is_none() || port.is_none() {
                    bail!(
                        BadInterface,
                        "module '{}': inet needs inet_address and inet_port",
                        self.alias
                    );
                }
            }
            Interface::Usb2 { device_number } => {
                if device_number.is_none() {
                    bail!(BadInterface, "module '{}': usb2 needs device_number", self.alias);
                }
            }
        }
        Ok(())
    }

    /// Items in the order they are written to a configuration file.
    pub fn items(&self) -> Vec<(String, String)> {
        let mut items = vec![("alias".to_string(), self.alias.clone())];
        if let Some(tag) = &self.type_tag {
            items.push(("module_type".into(), tag.clone()));
        }
        if self.number_of_channels > 0 {
            items.push((
                "number_of_channels".into(),
                self.number_of_channels.to_string(),
            ));
        }
        match &self.interface {
            Interface::None => {}
            Interface::Inet {
                address,
                port,
                timeout,
            } => {
                items.push(("interface".into(), "inet".into()));
                if let Some(a) = address {
                    items.push(("inet_address".into(), a.clone()));
                }
                if let Some(p) = port {
                    items.push(("inet_port".into(), p.to_string()));
                }
                if let Some(t) = timeout {
                    items.push(("inet_timeout".into(), t.to_string()));
                }
            }
            Interface::Usb2 { device_number } => {
                items.push(("interface".into(), "usb2".into()));
                if let Some(n) = device_number {
                    items.push(("device_number".into(), n.to_string()));
                }
            }
        }
        for chan in 0..self.number_of_channels {
            items.push((format!("channel{chan}_alias"), self.channels[chan].to_string()));
            if let (Some(det), Some(k)) = (&self.detector[chan], self.detector_chan[chan]) {
                items.push((format!("channel{chan}_detector"), format!("{det}:{k}")));
            }
        }
        for chan in 0..self.number_of_channels {
            if let Some(fw) = &self.firmware[chan] {
                items.push((format!("firmware_set_chan{chan}"), fw.clone()));
            }
        }
        for chan in 0..self.number_of_channels {
            if let Some(d) = &self.defaults[chan] {
                items.push((format!("default_chan{chan}"), d.clone()));
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn set(module: &mut Module, name: &str, value: impl Into<Value>) -> Result<()> {
        module.set(name.parse()?, &value.into(), false)
    }

    #[test]
    fn channel_items_need_type_and_count() {
        let mut m = Module::with_alias("mod1".into());
        let err = set(&mut m, "channel0_detector", "det1:0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NeedsBoardType);
        set(&mut m, "module_type", "falconx4").unwrap();
        let err = set(&mut m, "channel0_detector", "det1:0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NeedsBoardType);
        set(&mut m, "number_of_channels", 4).unwrap();
        set(&mut m, "channel0_detector", "DET1:0").unwrap();
        assert_eq!(m.detector[0].as_deref(), Some("det1"));
        let err = set(&mut m, "channel5_detector", "det1:0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadChannel);
    }

    #[test]
    fn type_and_count_are_immutable() {
        let mut m = Module::with_alias("mod1".into());
        set(&mut m, "module_type", "falconxn").unwrap();
        set(&mut m, "number_of_channels", 2).unwrap();
        let err = m
            .set(ModuleItem::ModuleType, &Value::from("falconx8"), true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoModify);
        let err = set(&mut m, "number_of_channels", 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoModify);
    }

    #[test]
    fn unknown_product_is_rejected() {
        let mut m = Module::with_alias("mod1".into());
        let err = set(&mut m, "module_type", "saturn").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownBoard);
        assert_eq!(product_for("FalconX8").unwrap(), "falconxn");
    }

    #[test]
    fn interface_fields_follow_the_tag() {
        let mut m = Module::with_alias("mod1".into());
        let err = set(&mut m, "inet_address", "10.0.0.1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingInterface);
        set(&mut m, "interface", "usb2").unwrap();
        let err = set(&mut m, "inet_port", 8756).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongInterface);
        set(&mut m, "interface", "inet").unwrap();
        set(&mut m, "inet_port", 8756).unwrap();
        assert_eq!(m.get(ModuleItem::InetPort).unwrap(), Value::Int(8756));
        let err = set(&mut m, "interface", "epp").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInterface);
    }

    #[test]
    fn detector_reference_split() {
        assert_eq!(
            parse_detector_ref("det:with:colon:3").unwrap(),
            ("det:with:colon".to_string(), 3)
        );
        assert!(parse_detector_ref("det1").is_err());
        assert!(parse_detector_ref("det1:x").is_err());
    }
}

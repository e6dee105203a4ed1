use crate::registry::{canonical_name, indexed, Record};
use crate::{Result, Value};
use std::fmt;
use std::str::FromStr;

/// Largest channel count a single detector may declare.
pub const MAX_DET_CHAN: usize = 64;
/// Valid preamplifier gain range, mV/keV.
pub const GAIN_MIN: f64 = 0.0001;
pub const GAIN_MAX: f64 = 10000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DetectorKind {
    Reset,
    RcFeedback,
    #[default]
    Unknown,
}

impl FromStr for DetectorKind {
    type Err = crate::HandelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "rc_feedback" | "rcfeedback" => Ok(Self::RcFeedback),
            other => Err(err!(BadValue, "unknown detector type '{other}'")),
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reset => "reset",
            Self::RcFeedback => "rc_feedback",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Neg = 0,
    Pos = 1,
}

impl Polarity {
    pub fn parse(value: &Value) -> Result<Self> {
        if let Ok(n) = value.as_i64() {
            return match n {
                0 => Ok(Self::Neg),
                1 => Ok(Self::Pos),
                _ => Err(err!(BadValue, "polarity must be 0 or 1, got {n}")),
            };
        }
        match value.as_str()?.trim().to_ascii_lowercase().as_str() {
            "+" | "pos" | "positive" => Ok(Self::Pos),
            "-" | "neg" | "negative" => Ok(Self::Neg),
            other => Err(err!(BadValue, "unknown polarity '{other}'")),
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pos => "+",
            Self::Neg => "-",
        })
    }
}

/// Item names understood by [`Detector::add_item`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorItem {
    NumberOfChannels,
    Type,
    TypeValue,
    Gain(usize),
    Polarity(usize),
}

impl FromStr for DetectorItem {
    type Err = crate::HandelError;

    fn from_str(name: &str) -> Result<Self> {
        let name = canonical_name(name)?;
        match name.as_str() {
            "number_of_channels" => return Ok(Self::NumberOfChannels),
            "type" => return Ok(Self::Type),
            "type_value" => return Ok(Self::TypeValue),
            _ => {}
        }
        if let Some(n) = indexed(&name, "channel", "_gain") {
            return Ok(Self::Gain(n));
        }
        if let Some(n) = indexed(&name, "channel", "_polarity") {
            return Ok(Self::Polarity(n));
        }
        Err(err!(BadName, "'{name}' is not a detector item"))
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Detector {
    pub alias: String,
    pub nchan: usize,
    pub kind: DetectorKind,
    pub type_value: Option<f64>,
    pub gain: Vec<Option<f64>>,
    pub polarity: Vec<Option<Polarity>>,
}

impl Record for Detector {
    const KIND: &'static str = "detector";

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

impl Detector {
    fn check_channel(&self, chan: usize) -> Result<()> {
        if self.nchan == 0 {
            bail!(
                BadChannel,
                "detector '{}': number_of_channels must be set before channel{chan} items",
                self.alias
            );
        }
        if chan >= self.nchan {
            bail!(
                BadChannel,
                "detector '{}' has {} channels, channel{chan} is out of range",
                self.alias,
                self.nchan
            );
        }
        Ok(())
    }

    pub fn add_item(&mut self, name: &str, value: &Value) -> Result<()> {
        let item: DetectorItem = name.parse()?;
        if item == DetectorItem::NumberOfChannels && self.nchan != 0 {
            bail!(
                NoModify,
                "detector '{}': number_of_channels is already set",
                self.alias
            );
        }
        self.set(item, value)
    }

    pub fn modify_item(&mut self, name: &str, value: &Value) -> Result<()> {
        let item: DetectorItem = name.parse()?;
        if item == DetectorItem::NumberOfChannels {
            bail!(
                NoModify,
                "detector '{}': number_of_channels cannot be modified",
                self.alias
            );
        }
        self.set(item, value)
    }

    fn set(&mut self, item: DetectorItem, value: &Value) -> Result<()> {
        match item {
            DetectorItem::NumberOfChannels => {
                let n = value.as_usize()?;
                if n == 0 || n > MAX_DET_CHAN {
                    bail!(
                        BadValue,
                        "detector '{}': number_of_channels {n} is outside 1..={MAX_DET_CHAN}",
                        self.alias
                    );
                }
                self.nchan = n;
                self.gain = vec![None; n];
                self.polarity = vec![None; n];
            }
            DetectorItem::Type => {
                self.kind = match value {
                    Value::Text(s) => s.parse()?,
                    other => bail!(BadValue, "detector type must be text, got {other:?}"),
                };
            }
            DetectorItem::TypeValue => {
                let v = value.as_f64()?;
                if v < 0.0 {
                    bail!(BadValue, "detector '{}': type_value {v} is negative", self.alias);
                }
                self.type_value = Some(v);
            }
            DetectorItem::Gain(chan) => {
                self.check_channel(chan)?;
                let gain = value.as_f64()?;
                if !(GAIN_MIN..=GAIN_MAX).contains(&gain) {
                    bail!(
                        BadValue,
                        "detector '{}': channel{chan} gain {gain} is outside [{GAIN_MIN}, {GAIN_MAX}]",
                        self.alias
                    );
                }
                self.gain[chan] = Some(gain);
            }
            DetectorItem::Polarity(chan) => {
                self.check_channel(chan)?;
                self.polarity[chan] = Some(Polarity::parse(value)?);
            }
        }
        Ok(())
    }

    pub fn get_item(&self, name: &str) -> Result<Value> {
        let item: DetectorItem = name.parse()?;
        let missing = || err!(UnknownItem, "detector '{}': '{name}' is not set", self.alias);
        match item {
            DetectorItem::NumberOfChannels => Ok(Value::from(self.nchan)),
            DetectorItem::Type => Ok(Value::from(self.kind.to_string())),
            DetectorItem::TypeValue => self.type_value.map(Value::from).ok_or_else(missing),
            DetectorItem::Gain(chan) => {
                self.check_channel(chan)?;
                self.gain[chan].map(Value::from).ok_or_else(missing)
            }
            DetectorItem::Polarity(chan) => {
                self.check_channel(chan)?;
                self.polarity[chan]
                    .map(|p| Value::from(p as i32))
                    .ok_or_else(missing)
            }
        }
    }

    /// Checks made before the system is started.
    pub fn validate(&self) -> Result<()> {
        if self.nchan == 0 {
            bail!(BadChannel, "detector '{}': number_of_channels not set", self.alias);
        }
        if self.kind == DetectorKind::Unknown {
            bail!(MissingType, "detector '{}': type is not set", self.alias);
        }
        for chan in 0..self.nchan {
            if self.polarity[chan].is_none() {
                bail!(
                    MissingPol,
                    "detector '{}': channel{chan} polarity is not set",
                    self.alias
                );
            }
            match self.gain[chan] {
                Some(g) if (GAIN_MIN..=GAIN_MAX).contains(&g) => {}
                Some(g) => bail!(
                    MissingGain,
                    "detector '{}': channel{chan} gain {g} is out of range",
                    self.alias
                ),
                None => bail!(
                    MissingGain,
                    "detector '{}': channel{chan} gain is not set",
                    self.alias
                ),
            }
        }
        Ok(())
    }

    /// Items in the order they are written to a configuration file.
    pub fn items(&self) -> Vec<(String, String)> {
        let mut items = vec![("alias".to_string(), self.alias.clone())];
        if self.nchan > 0 {
            items.push(("number_of_channels".to_string(), self.nchan.to_string()));
        }
        if self.kind != DetectorKind::Unknown {
            items.push(("type".to_string(), self.kind.to_string()));
        }
        if let Some(v) = self.type_value {
            items.push(("type_value".to_string(), format!("{v:e}")));
        }
        for chan in 0..self.nchan {
            if let Some(g) = self.gain[chan] {
                items.push((format!("channel{chan}_gain"), g.to_string()));
            }
            if let Some(p) = self.polarity[chan] {
                items.push((format!("channel{chan}_polarity"), p.to_string()));
            }
        }
        items
    }
}

//! The `handel_ini` configuration file.
//!
//! A file is a list of `[section]` headers, each holding records framed by
//! `START x` / `END x` lines with one `name = value` item per line. Lines
//! starting with `*` are comments.

use crate::{chan_data, Handel, HandelError, Result, Value};
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const FILE_TYPE: &str = "handel_ini";

pub const DETECTOR_SECTION: &str = "detector definitions";
pub const FIRMWARE_SECTION: &str = "firmware definitions";
pub const DEFAULTS_SECTION: &str = "default definitions";
pub const MODULE_SECTION: &str = "module definitions";
pub const CHANNEL_DATA_SECTION: &str = "module channel data";

/// Sections in the order they are written and applied.
pub const SECTIONS: [&str; 5] = [
    DETECTOR_SECTION,
    FIRMWARE_SECTION,
    DEFAULTS_SECTION,
    MODULE_SECTION,
    CHANNEL_DATA_SECTION,
];

#[derive(Clone, Debug, PartialEq)]
pub struct IniItem {
    pub name: String,
    pub value: String,
    pub line: usize,
}

/// One `START` .. `END` block.
#[derive(Clone, Debug, PartialEq)]
pub struct IniRecord {
    pub label: String,
    pub line: usize,
    pub items: Vec<IniItem>,
}

impl IniRecord {
    /// Value of the first item called `name`; `FileRa` when absent.
    pub fn get(&self, name: &str) -> Result<&str> {
        self.items
            .iter()
            .find(|item| item.name.eq_ignore_ascii_case(name))
            .map(|item| item.value.as_str())
            .ok_or_else(|| err!(FileRa, "record at line {} has no '{name}'", self.line))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IniSection {
    pub name: String,
    pub line: usize,
    pub records: Vec<IniRecord>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct IniDocument {
    pub sections: Vec<IniSection>,
}

impl IniDocument {
    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

fn format_error(line: usize, text: &str, what: &str) -> HandelError {
    let excerpt: String = text.chars().take(60).collect();
    err!(FormatError, "line {line}: {what}: '{excerpt}'")
}

/// Split a configuration file into sections and records in one pass.
pub fn parse(text: &str) -> Result<IniDocument> {
    let mut doc = IniDocument::default();
    let mut open: Option<IniRecord> = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('*') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if open.is_some() {
                return Err(format_error(line_no, line, "section header inside a record"));
            }
            doc.sections.push(IniSection {
                name: name.trim().to_ascii_lowercase(),
                line: line_no,
                records: Vec::new(),
            });
            continue;
        }

        if let Some(label) = keyword_arg(line, "START") {
            if open.is_some() {
                return Err(format_error(line_no, line, "START inside an open record"));
            }
            if doc.sections.is_empty() {
                return Err(format_error(line_no, line, "record outside any section"));
            }
            open = Some(IniRecord {
                label: label.to_string(),
                line: line_no,
                items: Vec::new(),
            });
            continue;
        }

        if let Some(label) = keyword_arg(line, "END") {
            let record = open
                .take()
                .ok_or_else(|| format_error(line_no, line, "END without START"))?;
            if !record.label.eq_ignore_ascii_case(label) {
                return Err(format_error(
                    line_no,
                    line,
                    &format!("END does not match START {} at line {}", record.label, record.line),
                ));
            }
            if let Some(section) = doc.sections.last_mut() {
                section.records.push(record);
            }
            continue;
        }

        let Some(record) = open.as_mut() else {
            return Err(format_error(line_no, line, "text outside a record"));
        };
        let Some((name, value)) = line.split_once('=') else {
            return Err(format_error(line_no, line, "expected name = value"));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(format_error(line_no, line, "empty item name"));
        }
        record.items.push(IniItem {
            name: name.to_string(),
            value: value.trim().to_string(),
            line: line_no,
        });
    }

    if let Some(record) = open {
        return Err(format_error(record.line, &format!("START {}", record.label), "record is never closed"));
    }
    Ok(doc)
}

/// `"START #1"` -> `Some("#1")`.
fn keyword_arg<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.starts_with(char::is_whitespace).then(|| rest.trim())
}

/// Find `name` by trying, in order: the name itself, `$XIAHOME/name`,
/// `$DXPHOME/name`, the variable `name`, then that variable's value under
/// `$XIAHOME` and `$DXPHOME`.
pub fn resolve_path(name: &str) -> Option<PathBuf> {
    let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
    let xia_home = var("XIAHOME");
    let dxp_home = var("DXPHOME");
    let indirect = if name.is_empty() || name.contains(['=', '\0']) {
        None
    } else {
        var(name)
    };

    let mut candidates = vec![PathBuf::from(name)];
    candidates.extend(xia_home.iter().map(|home| Path::new(home).join(name)));
    candidates.extend(dxp_home.iter().map(|home| Path::new(home).join(name)));
    if let Some(target) = &indirect {
        candidates.push(PathBuf::from(target));
        candidates.extend(xia_home.iter().map(|home| Path::new(home).join(target)));
        candidates.extend(dxp_home.iter().map(|home| Path::new(home).join(target)));
    }
    candidates.into_iter().find(|path| path.is_file())
}

/// Write `contents` next to `path` and rename it into place.
fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let result = fs::write(&tmp, contents).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        bail!(BadFileWrite, "writing {}: {e}", path.display());
    }
    Ok(())
}

fn check_file_type(file_type: &str) -> Result<()> {
    if !file_type.eq_ignore_ascii_case(FILE_TYPE) {
        bail!(FileType, "unsupported configuration file type '{file_type}'");
    }
    Ok(())
}

fn write_record(out: &mut String, label: &str, items: &[(String, String)]) {
    let _ = writeln!(out, "START {label}");
    for (name, value) in items {
        let _ = writeln!(out, "{name} = {value}");
    }
    let _ = writeln!(out, "END {label}");
    out.push('\n');
}

impl Handel {
    /// Replace the configuration with the contents of `path`.
    ///
    /// The registries are cleared first, so on failure they stay empty.
    pub fn load_system(&mut self, file_type: &str, path: impl AsRef<Path>) -> Result<()> {
        check_file_type(file_type)?;
        self.init();
        let name = path.as_ref().to_string_lossy();
        let resolved = resolve_path(&name)
            .ok_or_else(|| err!(OpenFile, "cannot find configuration file '{name}'"))?;
        info!("loading configuration from {}", resolved.display());

        let result = fs::read_to_string(&resolved)
            .map_err(HandelError::from)
            .and_then(|text| parse(&text))
            .and_then(|doc| self.apply_document(&doc));
        if let Err(e) = result {
            warn!("loading {} failed, configuration cleared: {e}", resolved.display());
            self.init();
            return Err(e.context(resolved.display()));
        }
        Ok(())
    }

    fn apply_document(&mut self, doc: &IniDocument) -> Result<()> {
        for section in &doc.sections {
            if !SECTIONS.contains(&section.name.as_str()) {
                warn!("line {}: ignoring unknown section [{}]", section.line, section.name);
            }
        }
        for name in SECTIONS {
            let Some(section) = doc.section(name) else {
                warn!("configuration has no [{name}] section");
                continue;
            };
            debug!("[{name}]: {} records", section.records.len());
            for record in &section.records {
                let applied = if name == CHANNEL_DATA_SECTION {
                    self.apply_channel_data(record)
                } else {
                    self.apply_record(name, record)
                };
                applied.map_err(|e| e.context(format!("[{name}] record at line {}", record.line)))?;
            }
        }
        Ok(())
    }

    fn apply_record(&mut self, section: &str, record: &IniRecord) -> Result<()> {
        let alias = record
            .get("alias")
            .map_err(|_| err!(FormatError, "record at line {} has no alias", record.line))?;
        match section {
            DETECTOR_SECTION => self.new_detector(alias)?,
            FIRMWARE_SECTION => self.new_firmware(alias)?,
            DEFAULTS_SECTION => self.new_default(alias)?,
            _ => self.new_module(alias)?,
        }
        for item in record.items.iter().filter(|i| !i.name.eq_ignore_ascii_case("alias")) {
            let value = Value::from(item.value.as_str());
            let added = match section {
                DETECTOR_SECTION => self.add_detector_item(alias, &item.name, value),
                FIRMWARE_SECTION => self.add_firmware_item(alias, &item.name, value),
                DEFAULTS_SECTION => self.add_default_item(alias, &item.name, value),
                _ => self.add_module_item(alias, &item.name, value),
            };
            added.map_err(|e| e.context(format!("line {}", item.line)))?;
        }
        Ok(())
    }

    fn apply_channel_data(&mut self, record: &IniRecord) -> Result<()> {
        let alias = record.label.as_str();
        let nchan = self.modules.get(alias)?.number_of_channels;
        for chan in 0..nchan {
            let len = match record.get(&chan_data::len_key(chan)) {
                Ok(len) => len,
                Err(e) if e.kind() == crate::ErrorKind::FileRa => continue,
                Err(e) => return Err(e),
            };
            let len: usize = len
                .parse()
                .map_err(|_| err!(FormatError, "'{len}' is not a data length"))?;
            let text = record.get(&chan_data::data_key(chan))?;
            let blob = chan_data::decode(text, len)
                .map_err(|e| e.context(format!("module '{alias}' channel {chan}")))?;
            self.add_module_item(alias, &chan_data::data_key(chan), Value::Bytes(blob))?;
        }
        Ok(())
    }

    /// Render the configuration in file form.
    pub fn to_ini_string(&self) -> Result<String> {
        let mut out = String::from("* handel configuration\n\n");

        let _ = writeln!(out, "[{DETECTOR_SECTION}]\n");
        for (n, detector) in self.detectors.iter().enumerate() {
            write_record(&mut out, &format!("#{}", n + 1), &detector.items());
        }
        let _ = writeln!(out, "[{FIRMWARE_SECTION}]\n");
        for (n, firmware) in self.firmware.iter().enumerate() {
            write_record(&mut out, &format!("#{}", n + 1), &firmware.items());
        }
        let _ = writeln!(out, "[{DEFAULTS_SECTION}]\n");
        for (n, defaults) in self.defaults.iter().enumerate() {
            write_record(&mut out, &format!("#{}", n + 1), &defaults.items());
        }
        let _ = writeln!(out, "[{MODULE_SECTION}]\n");
        for (n, module) in self.modules.iter().enumerate() {
            let mut items = module.items();
            if let Ok(psl) = self.backend_for(module) {
                items.extend(psl.ini_write(module));
            }
            write_record(&mut out, &format!("#{}", n + 1), &items);
        }

        let _ = writeln!(out, "[{CHANNEL_DATA_SECTION}]\n");
        for module in self.modules.iter() {
            let Ok(psl) = self.backend_for(module) else {
                continue;
            };
            let mut items = Vec::new();
            for chan in 0..module.number_of_channels {
                if let Some(blob) = psl.save_chan_data(&module.alias, chan) {
                    items.extend(chan_data::lines(chan, &blob)?);
                }
            }
            if !items.is_empty() {
                write_record(&mut out, &module.alias, &items);
            }
        }
        Ok(out)
    }

    /// Write the configuration to `path` through a temporary file.
    pub fn save_system(&self, file_type: &str, path: impl AsRef<Path>) -> Result<()> {
        check_file_type(file_type)?;
        let path = path.as_ref();
        let text = self.to_ini_string()?;
        write_atomically(path, &text)?;
        info!("saved configuration to {}", path.display());
        Ok(())
    }
}

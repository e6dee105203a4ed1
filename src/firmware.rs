use crate::registry::{canonical_name, indexed, Record};
use crate::{Result, Value};
use std::str::FromStr;

/// One peaking-time range record of a piecewise firmware set.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Firmware {
    pub ptrr: u16,
    pub min_ptime: Option<f64>,
    pub max_ptime: Option<f64>,
    pub fippi: Option<String>,
    pub user_fippi: Option<String>,
    pub dsp: Option<String>,
    pub num_filter: usize,
    pub filter_info: Vec<u16>,
}

impl Firmware {
    fn new(ptrr: u16) -> Self {
        Self {
            ptrr,
            ..Default::default()
        }
    }

    fn range(&self) -> (f64, f64) {
        (
            self.min_ptime.unwrap_or(f64::NAN),
            self.max_ptime.unwrap_or(f64::NAN),
        )
    }

    fn contains(&self, ptime: f64) -> bool {
        let (min, max) = self.range();
        ptime >= min && ptime <= max
    }
}

/// A firmware bundle file plus its optional extras.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Bundle {
    pub filename: Option<String>,
    pub tmp_path: Option<String>,
    pub keywords: Vec<String>,
    pub num_keywords: Option<usize>,
    pub mmu: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub enum FirmwareForm {
    #[default]
    Empty,
    Bundle(Bundle),
    Piecewise(Vec<Firmware>),
}

/// Which file of a PTRR entry to resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareFile {
    Fippi,
    UserFippi,
    Dsp,
}

impl FromStr for FirmwareFile {
    type Err = crate::HandelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fippi" => Ok(Self::Fippi),
            "user_fippi" => Ok(Self::UserFippi),
            "dsp" => Ok(Self::Dsp),
            other => Err(err!(BadName, "'{other}' is not a firmware file kind")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareItem {
    Filename,
    Mmu,
    TmpPath,
    NumKeywords,
    Keyword,
    KeywordAt(usize),
    Ptrr,
    MinPeakingTime,
    MaxPeakingTime,
    File(FirmwareFile),
    NumFilter,
    FilterInfo,
    FilterInfoAt(usize),
}

impl FirmwareItem {
    fn is_bundle(self) -> bool {
        matches!(
            self,
            Self::Filename | Self::Mmu | Self::TmpPath | Self::NumKeywords | Self::Keyword | Self::KeywordAt(_)
        )
    }
}

impl FromStr for FirmwareItem {
    type Err = crate::HandelError;

    fn from_str(name: &str) -> Result<Self> {
        let name = canonical_name(name)?;
        let item = match name.as_str() {
            "filename" => Self::Filename,
            "mmu" => Self::Mmu,
            "fdd_tmp_path" => Self::TmpPath,
            "num_keywords" => Self::NumKeywords,
            "keyword" => Self::Keyword,
            "ptrr" => Self::Ptrr,
            "min_peaking_time" => Self::MinPeakingTime,
            "max_peaking_time" => Self::MaxPeakingTime,
            "fippi" | "user_fippi" | "dsp" => Self::File(name.parse()?),
            "num_filter" => Self::NumFilter,
            "filter_info" => Self::FilterInfo,
            _ => {
                if let Some(n) = indexed(&name, "keyword", "") {
                    Self::KeywordAt(n)
                } else if let Some(n) = indexed(&name, "filter_info", "") {
                    Self::FilterInfoAt(n)
                } else {
                    bail!(BadName, "'{name}' is not a firmware item");
                }
            }
        };
        Ok(item)
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct FirmwareSet {
    pub alias: String,
    pub form: FirmwareForm,
    /// PTRR that PTRR-scoped items apply to.
    current_ptrr: Option<u16>,
}

impl Record for FirmwareSet {
    const KIND: &'static str = "firmware set";

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

fn text(value: &Value) -> Result<String> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        bail!(NullValue, "empty file name");
    }
    Ok(s.to_string())
}

fn word(value: &Value) -> Result<u16> {
    let v = value.as_i64()?;
    u16::try_from(v).map_err(|_| err!(BadValue, "{v} does not fit in 16 bits"))
}

impl FirmwareSet {
    fn bundle_mut(&mut self) -> Result<&mut Bundle> {
        if let FirmwareForm::Empty = self.form {
            self.form = FirmwareForm::Bundle(Bundle::default());
        }
        match &mut self.form {
            FirmwareForm::Bundle(bundle) => Ok(bundle),
            _ => Err(err!(
                FirmBoth,
                "firmware '{}' already defines PTRR entries, it cannot also name a bundle",
                self.alias
            )),
        }
    }

    fn ptrrs_mut(&mut self) -> Result<&mut Vec<Firmware>> {
        if let FirmwareForm::Empty = self.form {
            self.form = FirmwareForm::Piecewise(Vec::new());
        }
        match &mut self.form {
            FirmwareForm::Piecewise(list) => Ok(list),
            _ => Err(err!(
                FirmBoth,
                "firmware '{}' already names a bundle file, it cannot also define PTRR entries",
                self.alias
            )),
        }
    }

    fn current_mut(&mut self) -> Result<&mut Firmware> {
        let alias = self.alias.clone();
        let Some(ptrr) = self.current_ptrr else {
            bail!(LookingPtrr, "firmware '{alias}': no ptrr selected");
        };
        self.ptrrs_mut()?
            .iter_mut()
            .find(|f| f.ptrr == ptrr)
            .ok_or_else(|| err!(LookingPtrr, "firmware '{alias}': ptrr {ptrr} not found"))
    }

    pub fn ptrrs(&self) -> &[Firmware] {
        match &self.form {
            FirmwareForm::Piecewise(list) => list,
            _ => &[],
        }
    }

    pub fn bundle(&self) -> Option<&Bundle> {
        match &self.form {
            FirmwareForm::Bundle(bundle) => Some(bundle),
            _ => None,
        }
    }

    pub fn add_item(&mut self, name: &str, value: &Value) -> Result<()> {
        let item: FirmwareItem = name.parse()?;
        if item == FirmwareItem::Ptrr {
            let ptrr = word(value)?;
            let list = self.ptrrs_mut()?;
            if list.iter().any(|f| f.ptrr == ptrr) {
                bail!(BadPtrr, "firmware '{}': ptrr {ptrr} already exists", self.alias);
            }
            list.push(Firmware::new(ptrr));
            self.current_ptrr = Some(ptrr);
            return Ok(());
        }
        self.set(item, value)
    }

    pub fn modify_item(&mut self, name: &str, value: &Value) -> Result<()> {
        let item: FirmwareItem = name.parse()?;
        if item == FirmwareItem::Ptrr {
            let ptrr = word(value)?;
            if !self.ptrrs().iter().any(|f| f.ptrr == ptrr) {
                bail!(LookingPtrr, "firmware '{}': ptrr {ptrr} not found", self.alias);
            }
            self.current_ptrr = Some(ptrr);
            return Ok(());
        }
        self.set(item, value)
    }

    fn set(&mut self, item: FirmwareItem, value: &Value) -> Result<()> {
        if item.is_bundle() {
            let bundle = self.bundle_mut()?;
            match item {
                FirmwareItem::Filename => bundle.filename = Some(text(value)?),
                FirmwareItem::Mmu => bundle.mmu = Some(text(value)?),
                FirmwareItem::TmpPath => bundle.tmp_path = Some(text(value)?),
                FirmwareItem::NumKeywords => {
                    let n = value.as_usize()?;
                    bundle.num_keywords = Some(n);
                    bundle.keywords.resize(n, String::new());
                }
                FirmwareItem::Keyword => bundle.keywords.push(text(value)?),
                FirmwareItem::KeywordAt(i) => {
                    let n = bundle.num_keywords.unwrap_or(0);
                    if i >= n {
                        bail!(BadIndex, "keyword{i} is beyond num_keywords = {n}");
                    }
                    bundle.keywords[i] = text(value)?;
                }
                _ => unreachable!("bundle item"),
            }
            return Ok(());
        }

        let entry = self.current_mut()?;
        match item {
            FirmwareItem::MinPeakingTime => entry.min_ptime = Some(value.as_f64()?),
            FirmwareItem::MaxPeakingTime => entry.max_ptime = Some(value.as_f64()?),
            FirmwareItem::File(FirmwareFile::Fippi) => entry.fippi = Some(text(value)?),
            FirmwareItem::File(FirmwareFile::UserFippi) => entry.user_fippi = Some(text(value)?),
            FirmwareItem::File(FirmwareFile::Dsp) => entry.dsp = Some(text(value)?),
            FirmwareItem::NumFilter => {
                let n = value.as_usize()?;
                entry.num_filter = n;
                entry.filter_info.resize(n, 0);
            }
            FirmwareItem::FilterInfo => {
                let info = match value {
                    Value::Words(w) => w.clone(),
                    other => vec![word(other)?],
                };
                entry.num_filter = info.len();
                entry.filter_info = info;
            }
            FirmwareItem::FilterInfoAt(i) => {
                if i >= entry.num_filter {
                    bail!(
                        BadIndex,
                        "filter_info{i} is beyond num_filter = {}",
                        entry.num_filter
                    );
                }
                entry.filter_info[i] = word(value)?;
            }
            _ => unreachable!("ptrr item"),
        }
        Ok(())
    }

    pub fn get_item(&self, name: &str) -> Result<Value> {
        let item: FirmwareItem = name.parse()?;
        let unset = || err!(UnknownItem, "firmware '{}': '{name}' is not set", self.alias);
        if item.is_bundle() {
            let bundle = self
                .bundle()
                .ok_or_else(|| err!(NoFilename, "firmware '{}' is not a bundle", self.alias))?;
            return match item {
                FirmwareItem::Filename => bundle
                    .filename
                    .clone()
                    .map(Value::from)
                    .ok_or_else(|| err!(NoFilename, "firmware '{}' has no filename", self.alias)),
                FirmwareItem::Mmu => bundle.mmu.clone().map(Value::from).ok_or_else(unset),
                FirmwareItem::TmpPath => bundle
                    .tmp_path
                    .clone()
                    .map(Value::from)
                    .ok_or_else(|| err!(NoTmpPath, "firmware '{}' has no fdd_tmp_path", self.alias)),
                FirmwareItem::NumKeywords => Ok(Value::from(bundle.keywords.len())),
                FirmwareItem::Keyword => Ok(Value::from(bundle.keywords.join(" "))),
                FirmwareItem::KeywordAt(i) => bundle
                    .keywords
                    .get(i)
                    .cloned()
                    .map(Value::from)
                    .ok_or_else(|| err!(BadIndex, "keyword{i} is out of range")),
                _ => unreachable!("bundle item"),
            };
        }

        let ptrr = self
            .current_ptrr
            .ok_or_else(|| err!(LookingPtrr, "firmware '{}': no ptrr selected", self.alias))?;
        if item == FirmwareItem::Ptrr {
            return Ok(Value::from(ptrr));
        }
        let entry = self
            .ptrrs()
            .iter()
            .find(|f| f.ptrr == ptrr)
            .ok_or_else(|| err!(LookingPtrr, "firmware '{}': ptrr {ptrr} not found", self.alias))?;
        match item {
            FirmwareItem::MinPeakingTime => entry.min_ptime.map(Value::from).ok_or_else(unset),
            FirmwareItem::MaxPeakingTime => entry.max_ptime.map(Value::from).ok_or_else(unset),
            FirmwareItem::File(FirmwareFile::Fippi) => {
                entry.fippi.clone().map(Value::from).ok_or_else(unset)
            }
            FirmwareItem::File(FirmwareFile::UserFippi) => {
                entry.user_fippi.clone().map(Value::from).ok_or_else(unset)
            }
            FirmwareItem::File(FirmwareFile::Dsp) => {
                entry.dsp.clone().map(Value::from).ok_or_else(unset)
            }
            FirmwareItem::NumFilter => Ok(Value::from(entry.num_filter)),
            FirmwareItem::FilterInfo => Ok(Value::Words(entry.filter_info.clone())),
            FirmwareItem::FilterInfoAt(i) => entry
                .filter_info
                .get(i)
                .map(|w| Value::from(*w))
                .ok_or_else(|| err!(BadIndex, "filter_info{i} is out of range")),
            _ => unreachable!("ptrr item"),
        }
    }

    /// Sort the PTRR entries by minimum peaking time and check their shape.
    pub fn validate(&mut self) -> Result<()> {
        let alias = self.alias.clone();
        match &mut self.form {
            FirmwareForm::Empty => bail!(
                MissingFirm,
                "firmware '{alias}' names neither a bundle file nor any ptrr"
            ),
            FirmwareForm::Bundle(bundle) => {
                if bundle.filename.is_none() {
                    bail!(NoFilename, "firmware '{alias}' has bundle items but no filename");
                }
            }
            FirmwareForm::Piecewise(list) => {
                insertion_sort_by_min(list);
                for fw in list.iter() {
                    let (min, max) = match (fw.min_ptime, fw.max_ptime) {
                        (Some(min), Some(max)) => (min, max),
                        _ => bail!(
                            BadValue,
                            "firmware '{alias}': ptrr {} is missing its peaking time range",
                            fw.ptrr
                        ),
                    };
                    if min > max {
                        bail!(
                            BadValue,
                            "firmware '{alias}': ptrr {} has min_peaking_time {min} > max_peaking_time {max}",
                            fw.ptrr
                        );
                    }
                    if fw.dsp.is_none() {
                        bail!(MissingFirm, "firmware '{alias}': ptrr {} has no dsp", fw.ptrr);
                    }
                    if fw.fippi.is_none() && fw.user_fippi.is_none() {
                        bail!(
                            MissingFirm,
                            "firmware '{alias}': ptrr {} has neither fippi nor user_fippi",
                            fw.ptrr
                        );
                    }
                }
                for pair in list.windows(2) {
                    let (_, prev_max) = pair[0].range();
                    let (next_min, _) = pair[1].range();
                    if prev_max >= next_min {
                        bail!(
                            PtrOverlap,
                            "firmware '{alias}': ptrr {} [.., {prev_max}] overlaps ptrr {} [{next_min}, ..]",
                            pair[0].ptrr,
                            pair[1].ptrr
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Entry whose peaking time range contains `ptime` (seconds).
    pub fn firmware_for(&self, ptime: f64) -> Result<&Firmware> {
        self.ptrrs()
            .iter()
            .find(|fw| fw.contains(ptime))
            .ok_or_else(|| {
                err!(
                    BadValue,
                    "firmware '{}': no ptrr covers peaking time {ptime}",
                    self.alias
                )
            })
    }

    /// File name of `kind` valid at peaking time `ptime`.
    pub fn file_for(&self, kind: FirmwareFile, ptime: f64) -> Result<&str> {
        let fw = self.firmware_for(ptime)?;
        let file = match kind {
            FirmwareFile::Fippi => fw.fippi.as_deref(),
            FirmwareFile::UserFippi => fw.user_fippi.as_deref(),
            FirmwareFile::Dsp => fw.dsp.as_deref(),
        };
        file.ok_or_else(|| {
            err!(
                BadValue,
                "firmware '{}': ptrr {} has no {kind:?} file",
                self.alias,
                fw.ptrr
            )
        })
    }

    pub fn items(&self) -> Vec<(String, String)> {
        let mut items = vec![("alias".to_string(), self.alias.clone())];
        match &self.form {
            FirmwareForm::Empty => {}
            FirmwareForm::Bundle(bundle) => {
                if let Some(f) = &bundle.filename {
                    items.push(("filename".into(), f.clone()));
                }
                if let Some(m) = &bundle.mmu {
                    items.push(("mmu".into(), m.clone()));
                }
                if let Some(p) = &bundle.tmp_path {
                    items.push(("fdd_tmp_path".into(), p.clone()));
                }
                if !bundle.keywords.is_empty() {
                    items.push(("num_keywords".into(), bundle.keywords.len().to_string()));
                    for (i, kw) in bundle.keywords.iter().enumerate().filter(|(_, kw)| !kw.is_empty()) {
                        items.push((format!("keyword{i}"), kw.clone()));
                    }
                }
            }
            FirmwareForm::Piecewise(list) => {
                for fw in list {
                    items.push(("ptrr".into(), fw.ptrr.to_string()));
                    if let Some(v) = fw.min_ptime {
                        items.push(("min_peaking_time".into(), v.to_string()));
                    }
                    if let Some(v) = fw.max_ptime {
                        items.push(("max_peaking_time".into(), v.to_string()));
                    }
                    if let Some(f) = &fw.fippi {
                        items.push(("fippi".into(), f.clone()));
                    }
                    if let Some(f) = &fw.user_fippi {
                        items.push(("user_fippi".into(), f.clone()));
                    }
                    if let Some(f) = &fw.dsp {
                        items.push(("dsp".into(), f.clone()));
                    }
                    items.push(("num_filter".into(), fw.num_filter.to_string()));
                    for (i, info) in fw.filter_info.iter().enumerate() {
                        items.push((format!("filter_info{i}"), info.to_string()));
                    }
                }
            }
        }
        items
    }
}

fn insertion_sort_by_min(list: &mut [Firmware]) {
    for i in 1..list.len() {
        let mut j = i;
        while j > 0 && list[j - 1].range().0 > list[j].range().0 {
            list.swap(j - 1, j);
            j -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn add_ptrr(set: &mut FirmwareSet, ptrr: u16, min: f64, max: f64) {
        set.add_item("ptrr", &Value::from(ptrr)).unwrap();
        set.add_item("min_peaking_time", &Value::from(min)).unwrap();
        set.add_item("max_peaking_time", &Value::from(max)).unwrap();
        set.add_item("fippi", &Value::from(format!("f{ptrr}.fip"))).unwrap();
        set.add_item("dsp", &Value::from(format!("d{ptrr}.hex"))).unwrap();
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut set = FirmwareSet::with_alias("fw".into());
        add_ptrr(&mut set, 1, 1e-6, 3e-6);
        add_ptrr(&mut set, 2, 2e-6, 5e-6);
        assert_eq!(set.validate().unwrap_err().kind(), ErrorKind::PtrOverlap);
    }

    #[test]
    fn entries_are_sorted_then_resolved() {
        let mut set = FirmwareSet::with_alias("fw".into());
        add_ptrr(&mut set, 2, 4e-6, 8e-6);
        add_ptrr(&mut set, 1, 1e-6, 3e-6);
        set.validate().unwrap();
        assert_eq!(set.ptrrs()[0].ptrr, 1);
        assert_eq!(set.file_for(FirmwareFile::Dsp, 5e-6).unwrap(), "d2.hex");
        assert_eq!(set.file_for(FirmwareFile::Fippi, 1e-6).unwrap(), "f1.fip");
        let err = set.file_for(FirmwareFile::Dsp, 3.5e-6).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadValue);
    }

    #[test]
    fn forms_are_exclusive() {
        let mut set = FirmwareSet::with_alias("fw".into());
        set.add_item("filename", &Value::from("falconxn.fdd")).unwrap();
        let err = set.add_item("ptrr", &Value::from(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FirmBoth);

        let mut set = FirmwareSet::with_alias("fw".into());
        add_ptrr(&mut set, 0, 1e-6, 2e-6);
        let err = set.add_item("filename", &Value::from("x.fdd")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FirmBoth);
    }

    #[test]
    fn ptrr_cursor() {
        let mut set = FirmwareSet::with_alias("fw".into());
        let err = set.add_item("dsp", &Value::from("d.hex")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LookingPtrr);

        add_ptrr(&mut set, 0, 1e-6, 2e-6);
        add_ptrr(&mut set, 1, 3e-6, 4e-6);
        let err = set.add_item("ptrr", &Value::from(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPtrr);

        set.modify_item("ptrr", &Value::from(0)).unwrap();
        set.modify_item("dsp", &Value::from("new.hex")).unwrap();
        assert_eq!(set.ptrrs()[0].dsp.as_deref(), Some("new.hex"));
        assert_eq!(set.ptrrs()[1].dsp.as_deref(), Some("d1.hex"));
        let err = set.modify_item("ptrr", &Value::from(7)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LookingPtrr);
    }

    #[test]
    fn piecewise_entries_need_files() {
        let mut set = FirmwareSet::with_alias("fw".into());
        set.add_item("ptrr", &Value::from(0)).unwrap();
        set.add_item("min_peaking_time", &Value::from(1e-6)).unwrap();
        set.add_item("max_peaking_time", &Value::from(2e-6)).unwrap();
        set.add_item("user_fippi", &Value::from("u.fip")).unwrap();
        assert_eq!(set.validate().unwrap_err().kind(), ErrorKind::MissingFirm);
        set.add_item("dsp", &Value::from("d.hex")).unwrap();
        set.validate().unwrap();
    }

    #[test]
    fn bundle_needs_filename() {
        let mut set = FirmwareSet::with_alias("fw".into());
        set.add_item("mmu", &Value::from("mmu.bin")).unwrap();
        assert_eq!(set.validate().unwrap_err().kind(), ErrorKind::NoFilename);
        assert_eq!(
            set.get_item("fdd_tmp_path").unwrap_err().kind(),
            ErrorKind::NoTmpPath
        );
        set.add_item("num_keywords", &Value::from(2)).unwrap();
        set.add_item("keyword1", &Value::from("dxp")).unwrap();
        let err = set.add_item("keyword2", &Value::from("x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadIndex);
    }
}

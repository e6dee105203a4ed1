use crate::registry::{canonical_name, Record};
use crate::{Result, Value};

/// Synchronization state of one acquisition value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AcqValueState {
    #[default]
    Unknown,
    Modified,
    Synced,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DefaultEntry {
    pub name: String,
    pub data: f64,
    pub pending: f64,
    pub state: AcqValueState,
}

/// A named, ordered map of acquisition value names to doubles.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct XiaDefaults {
    pub alias: String,
    entries: Vec<DefaultEntry>,
}

impl Record for XiaDefaults {
    const KIND: &'static str = "defaults set";

    fn with_alias(alias: String) -> Self {
        Self {
            alias,
            entries: Vec::new(),
        }
    }

    fn alias(&self) -> &str {
        &self.alias
    }
}

impl XiaDefaults {
    /// Alias given to the defaults created for a module channel that did not
    /// name one.
    pub fn module_channel_alias(module: &str, chan: usize) -> String {
        format!("defaults_{module}_channel{chan}")
    }

    pub fn entries(&self) -> &[DefaultEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, name: &str) -> Option<&DefaultEntry> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut DefaultEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entry(name).map(|e| e.data)
    }

    /// Insert `name`, or replace its value in place keeping its position.
    ///
    /// The state is left untouched when the value does not change.
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        let name = canonical_name(name)?;
        match self.entry_mut(&name) {
            Some(entry) => {
                if entry.data != value {
                    entry.data = value;
                    entry.pending = value;
                    entry.state = AcqValueState::Modified;
                }
            }
            None => self.entries.push(DefaultEntry {
                name,
                data: value,
                pending: value,
                state: AcqValueState::Modified,
            }),
        }
        Ok(())
    }

    pub fn mark_synced(&mut self, name: &str) {
        if let Some(entry) = self.entry_mut(name) {
            entry.state = AcqValueState::Synced;
        }
    }

    /// Unlink `name` from the list.
    pub fn remove(&mut self, name: &str) -> Result<DefaultEntry> {
        match self
            .entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
        {
            Some(i) => Ok(self.entries.remove(i)),
            None => Err(err!(BadName, "defaults '{}' has no entry '{name}'", self.alias)),
        }
    }

    pub fn add_item(&mut self, name: &str, value: &Value) -> Result<()> {
        self.set(name, value.as_f64()?)
    }

    pub fn modify_item(&mut self, name: &str, value: &Value) -> Result<()> {
        if self.entry(name).is_none() {
            bail!(BadName, "defaults '{}' has no entry '{name}'", self.alias);
        }
        self.set(name, value.as_f64()?)
    }

    pub fn get_item(&self, name: &str) -> Result<Value> {
        self.get(name)
            .map(Value::from)
            .ok_or_else(|| err!(BadName, "defaults '{}' has no entry '{name}'", self.alias))
    }

    /// Overwrite this set with every entry of `other`, in `other`'s order.
    pub fn overlay(&mut self, other: &XiaDefaults) -> Result<()> {
        for entry in &other.entries {
            self.set(&entry.name, entry.data)?;
        }
        Ok(())
    }

    /// `first` overwritten by `second`, stored under `alias`.
    pub fn merged(alias: &str, first: &XiaDefaults, second: &XiaDefaults) -> Result<XiaDefaults> {
        let mut out = XiaDefaults::with_alias(alias.to_string());
        out.overlay(first)?;
        out.overlay(second)?;
        Ok(out)
    }

    pub fn items(&self) -> Vec<(String, String)> {
        let mut items = vec![("alias".to_string(), self.alias.clone())];
        items.extend(
            self.entries
                .iter()
                .map(|e| (e.name.clone(), format!("{}", e.data))),
        );
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn set_of(alias: &str, entries: &[(&str, f64)]) -> XiaDefaults {
        let mut d = XiaDefaults::with_alias(alias.into());
        for (name, value) in entries {
            d.set(name, *value).unwrap();
        }
        d
    }

    #[test]
    fn replace_keeps_position() {
        let mut d = set_of("d", &[("peaking_time", 1.0), ("gap_time", 0.1)]);
        d.set("PEAKING_TIME", 2.0).unwrap();
        assert_eq!(d.entries()[0].name, "peaking_time");
        assert_eq!(d.get("peaking_time"), Some(2.0));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn setting_same_value_is_idempotent() {
        let mut d = set_of("d", &[("preset_value", 5.0)]);
        d.mark_synced("preset_value");
        d.set("preset_value", 5.0).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d.entries()[0].state, AcqValueState::Synced);
    }

    #[test]
    fn merge_prefers_second() {
        let catalog = set_of("catalog", &[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let user = set_of("user", &[("b", 20.0), ("d", 40.0)]);
        let out = XiaDefaults::merged("out", &catalog, &user).unwrap();
        let names: Vec<_> = out.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(out.get("b"), Some(20.0));
    }

    #[test]
    fn modify_requires_existing_entry() {
        let mut d = set_of("d", &[("a", 1.0)]);
        let err = d.modify_item("z", &Value::from(1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadName);
        d.remove("a").unwrap();
        assert!(d.is_empty());
    }
}

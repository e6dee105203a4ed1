//! Ordered, alias-keyed collections shared by the detector, firmware,
//! defaults and module registries.

use crate::Result;

/// Longest alias accepted by any registry.
pub const MAX_ALIAS_LEN: usize = 80;

/// A record stored in a [`Registry`].
pub trait Record {
    /// What the registry holds, used in log and error messages.
    const KIND: &'static str;

    fn with_alias(alias: String) -> Self;
    fn alias(&self) -> &str;
}

/// Canonical form of a user supplied alias.
///
/// Every insert and every lookup goes through here, so stored aliases are
/// always lower case and comparisons never need to re-normalize.
pub fn canonical_alias(alias: &str) -> Result<String> {
    let alias = alias.trim();
    if alias.is_empty() {
        bail!(NullAlias, "alias is empty");
    }
    if alias.len() > MAX_ALIAS_LEN {
        bail!(
            AliasSize,
            "alias '{alias}' is {} characters, the maximum is {MAX_ALIAS_LEN}",
            alias.len()
        );
    }
    if !alias.is_ascii() {
        bail!(BadValue, "alias '{alias}' is not ASCII");
    }
    Ok(alias.to_ascii_lowercase())
}

/// Canonical form of an item name.
pub fn canonical_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        bail!(NullName, "item name is empty");
    }
    Ok(name.to_ascii_lowercase())
}

/// Split `{prefix}{n}{suffix}` names such as `channel3_gain` into `3`.
pub fn indexed(name: &str, prefix: &str, suffix: &str) -> Option<usize> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registry<T> {
    items: Vec<T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Record> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record under `alias`.
    pub fn create(&mut self, alias: &str) -> Result<&mut T> {
        let alias = canonical_alias(alias)?;
        if self.position(&alias).is_some() {
            bail!(AliasExists, "{} '{alias}' already exists", T::KIND);
        }
        log::debug!("creating {} '{alias}'", T::KIND);
        self.items.push(T::with_alias(alias));
        let last = self.items.len() - 1;
        Ok(&mut self.items[last])
    }

    /// Append an already built record, keeping aliases unique.
    pub fn insert(&mut self, item: T) -> Result<()> {
        if self.position(item.alias()).is_some() {
            bail!(AliasExists, "{} '{}' already exists", T::KIND, item.alias());
        }
        self.items.push(item);
        Ok(())
    }

    fn position(&self, canonical: &str) -> Option<usize> {
        self.items.iter().position(|item| item.alias() == canonical)
    }

    pub fn find(&self, alias: &str) -> Option<&T> {
        let alias = canonical_alias(alias).ok()?;
        self.position(&alias).map(|i| &self.items[i])
    }

    pub fn find_mut(&mut self, alias: &str) -> Option<&mut T> {
        let alias = canonical_alias(alias).ok()?;
        self.position(&alias).map(|i| &mut self.items[i])
    }

    /// Like [`find`](Self::find) but fails with `NoAlias`.
    pub fn get(&self, alias: &str) -> Result<&T> {
        let canonical = canonical_alias(alias)?;
        self.position(&canonical)
            .map(|i| &self.items[i])
            .ok_or_else(|| err!(NoAlias, "no {} named '{canonical}'", T::KIND))
    }

    pub fn get_mut(&mut self, alias: &str) -> Result<&mut T> {
        let canonical = canonical_alias(alias)?;
        match self.position(&canonical) {
            Some(i) => Ok(&mut self.items[i]),
            None => Err(err!(NoAlias, "no {} named '{canonical}'", T::KIND)),
        }
    }

    pub fn remove(&mut self, alias: &str) -> Result<T> {
        let canonical = canonical_alias(alias)?;
        match self.position(&canonical) {
            Some(i) => {
                log::debug!("removing {} '{canonical}'", T::KIND);
                Ok(self.items.remove(i))
            }
            None => Err(err!(NoAlias, "no {} named '{canonical}'", T::KIND)),
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Alias of the record at `index`, in insertion order.
    pub fn alias_at(&self, index: usize) -> Result<&str> {
        self.items
            .get(index)
            .map(|item| item.alias())
            .ok_or_else(|| {
                err!(
                    BadIndex,
                    "index {index} is out of range for {} {}s",
                    self.items.len(),
                    T::KIND
                )
            })
    }

    pub fn aliases(&self) -> Vec<String> {
        self.items.iter().map(|i| i.alias().to_string()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[derive(Debug)]
    struct Thing(String);

    impl Record for Thing {
        const KIND: &'static str = "thing";

        fn with_alias(alias: String) -> Self {
            Thing(alias)
        }

        fn alias(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut reg = Registry::<Thing>::new();
        reg.create("Det1").unwrap();
        assert_eq!(reg.find("DET1").unwrap().alias(), "det1");
        assert_eq!(reg.find("det1").unwrap().alias(), "det1");
        let err = reg.create("dEt1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AliasExists);
    }

    #[test]
    fn alias_bounds() {
        let mut reg = Registry::<Thing>::new();
        assert_eq!(reg.create("").unwrap_err().kind(), ErrorKind::NullAlias);
        let long = "x".repeat(MAX_ALIAS_LEN + 1);
        assert_eq!(reg.create(&long).unwrap_err().kind(), ErrorKind::AliasSize);
    }

    #[test]
    fn insertion_order_is_kept() {
        let mut reg = Registry::<Thing>::new();
        for alias in ["b", "a", "c"] {
            reg.create(alias).unwrap();
        }
        assert_eq!(reg.aliases(), vec!["b", "a", "c"]);
        reg.remove("A").unwrap();
        assert_eq!(reg.alias_at(1).unwrap(), "c");
        assert_eq!(reg.alias_at(2).unwrap_err().kind(), ErrorKind::BadIndex);
    }

    #[test]
    fn indexed_names() {
        assert_eq!(indexed("channel12_gain", "channel", "_gain"), Some(12));
        assert_eq!(indexed("channel_gain", "channel", "_gain"), None);
        assert_eq!(indexed("default_chan3", "default_chan", ""), Some(3));
        assert_eq!(indexed("default_chanx", "default_chan", ""), None);
    }
}

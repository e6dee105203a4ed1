//! The detChan directory: a flat map from detector-channel ids to either a
//! single module channel or a set of other ids.

use crate::Result;
use std::collections::{BTreeMap, HashMap};

/// Id of the synthetic set holding every single detChan.
pub const ALL_CHANNELS: i32 = -1;

/// Returned by `get_module_channel` when a detChan is not bound to a module.
pub const NO_MODULE_CHANNEL: usize = 999;

#[derive(Clone, Debug, PartialEq)]
pub enum DetChanEntry {
    Single { module: String },
    Set { members: Vec<i32> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Single,
    Set,
}

impl DetChanEntry {
    pub fn element_type(&self) -> ElementType {
        match self {
            DetChanEntry::Single { .. } => ElementType::Single,
            DetChanEntry::Set { .. } => ElementType::Set,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct DetChanDirectory {
    entries: BTreeMap<i32, DetChanEntry>,
}

impl DetChanDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_free(&self, id: i32) -> bool {
        !self.entries.contains_key(&id)
    }

    pub fn get(&self, id: i32) -> Option<&DetChanEntry> {
        self.entries.get(&id)
    }

    pub fn element_type(&self, id: i32) -> Result<ElementType> {
        self.entries
            .get(&id)
            .map(DetChanEntry::element_type)
            .ok_or_else(|| err!(InvalidDetChan, "detChan {id} does not exist"))
    }

    pub fn add(&mut self, id: i32, entry: DetChanEntry) -> Result<()> {
        match entry {
            DetChanEntry::Single { module } => self.add_single(id, &module),
            DetChanEntry::Set { members } => {
                self.add_set(id)?;
                for member in members {
                    self.set_add(id, member)?;
                }
                Ok(())
            }
        }
    }

    /// Bind `id` to a module channel and add it to the all-channels set.
    pub fn add_single(&mut self, id: i32, module: &str) -> Result<()> {
        if id < 0 {
            bail!(InvalidDetChan, "detChan {id} is reserved");
        }
        if !self.is_free(id) {
            bail!(BadValue, "detChan {id} is already in use");
        }
        self.entries.insert(
            id,
            DetChanEntry::Single {
                module: module.to_string(),
            },
        );
        match self.entries.entry(ALL_CHANNELS).or_insert_with(|| {
            log::debug!("creating the all-channels set");
            DetChanEntry::Set {
                members: Vec::new(),
            }
        }) {
            DetChanEntry::Set { members } => members.push(id),
            DetChanEntry::Single { .. } => unreachable!("detChan -1 is always a set"),
        }
        Ok(())
    }

    pub fn add_set(&mut self, id: i32) -> Result<()> {
        if id == ALL_CHANNELS {
            bail!(InvalidDetChan, "detChan {ALL_CHANNELS} is reserved");
        }
        if !self.is_free(id) {
            bail!(BadValue, "detChan {id} is already in use");
        }
        self.entries.insert(
            id,
            DetChanEntry::Set {
                members: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove `id` and every reference to it. Removing the last single
    /// detChan also removes the all-channels set.
    pub fn remove(&mut self, id: i32) -> Result<()> {
        if self.entries.remove(&id).is_none() {
            bail!(InvalidDetChan, "detChan {id} does not exist");
        }
        for entry in self.entries.values_mut() {
            if let DetChanEntry::Set { members } = entry {
                members.retain(|&m| m != id);
            }
        }
        if id != ALL_CHANNELS && self.singles().is_empty() && !self.is_free(ALL_CHANNELS) {
            log::debug!("last single detChan removed, dropping the all-channels set");
            self.entries.remove(&ALL_CHANNELS);
        }
        Ok(())
    }

    fn user_set_mut(&mut self, set_id: i32) -> Result<&mut Vec<i32>> {
        if set_id == ALL_CHANNELS {
            bail!(InvalidDetChan, "the all-channels set cannot be edited");
        }
        match self.entries.get_mut(&set_id) {
            Some(DetChanEntry::Set { members }) => Ok(members),
            Some(DetChanEntry::Single { .. }) => {
                Err(err!(WrongType, "detChan {set_id} is not a set"))
            }
            None => Err(err!(InvalidDetChan, "detChan set {set_id} does not exist")),
        }
    }

    pub fn set_add(&mut self, set_id: i32, member: i32) -> Result<()> {
        if self.is_free(member) {
            bail!(InvalidDetChan, "detChan {member} does not exist");
        }
        let members = self.user_set_mut(set_id)?;
        if !members.contains(&member) {
            members.push(member);
        }
        Ok(())
    }

    pub fn set_remove(&mut self, set_id: i32, member: i32) -> Result<()> {
        let members = self.user_set_mut(set_id)?;
        match members.iter().position(|&m| m == member) {
            Some(i) => {
                members.remove(i);
                Ok(())
            }
            None => Err(err!(BadValue, "detChan {member} is not in set {set_id}")),
        }
    }

    /// Module alias of a single detChan.
    pub fn find_alias(&self, id: i32) -> Result<&str> {
        match self.entries.get(&id) {
            Some(DetChanEntry::Single { module }) => Ok(module),
            Some(DetChanEntry::Set { .. }) => Err(err!(WrongType, "detChan {id} is a set")),
            None => Err(err!(InvalidDetChan, "detChan {id} does not exist")),
        }
    }

    pub fn members(&self, set_id: i32) -> Result<&[i32]> {
        match self.entries.get(&set_id) {
            Some(DetChanEntry::Set { members }) => Ok(members),
            Some(DetChanEntry::Single { .. }) => {
                Err(err!(WrongType, "detChan {set_id} is not a set"))
            }
            None => Err(err!(InvalidDetChan, "detChan {set_id} does not exist")),
        }
    }

    /// Every single detChan, in id order.
    pub fn singles(&self) -> Vec<i32> {
        self.entries
            .iter()
            .filter(|(_, e)| e.element_type() == ElementType::Single)
            .map(|(&id, _)| id)
            .collect()
    }

    /// User defined sets, excluding the all-channels set.
    pub fn sets(&self) -> Vec<(i32, Vec<i32>)> {
        self.entries
            .iter()
            .filter_map(|(&id, e)| match e {
                DetChanEntry::Set { members } if id != ALL_CHANNELS => Some((id, members.clone())),
                _ => None,
            })
            .collect()
    }

    /// Single detChans reachable from `id`, each once, in visit order.
    pub fn resolve(&self, id: i32) -> Result<Vec<i32>> {
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            match self.entries.get(&next) {
                Some(DetChanEntry::Single { .. }) => {
                    if !out.contains(&next) {
                        out.push(next);
                    }
                }
                Some(DetChanEntry::Set { members }) => {
                    if seen.contains(&next) {
                        continue;
                    }
                    seen.push(next);
                    stack.extend(members.iter().rev());
                }
                None => bail!(InvalidDetChan, "detChan {next} does not exist"),
            }
        }
        Ok(out)
    }

    /// Reject sets whose transitive membership loops back on itself.
    pub fn validate_sets(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Done,
        }

        let mut marks: HashMap<i32, Mark> = HashMap::new();
        for (&root, entry) in &self.entries {
            if entry.element_type() != ElementType::Set || marks.contains_key(&root) {
                continue;
            }
            // (set id, index of the next member to visit)
            let mut path: Vec<(i32, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::Open);
            while let Some(&(set_id, next)) = path.last() {
                let members = self.members(set_id)?;
                if next >= members.len() {
                    marks.insert(set_id, Mark::Done);
                    path.pop();
                    continue;
                }
                let member = members[next];
                if let Some(top) = path.last_mut() {
                    top.1 += 1;
                }
                match self.entries.get(&member) {
                    Some(DetChanEntry::Set { .. }) => match marks.get(&member) {
                        Some(Mark::Open) => bail!(
                            InfiniteLoop,
                            "detChan set {member} contains itself through set {set_id}"
                        ),
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(member, Mark::Open);
                            path.push((member, 0));
                        }
                    },
                    Some(DetChanEntry::Single { .. }) => {}
                    None => bail!(
                        InvalidDetChan,
                        "detChan set {set_id} refers to missing detChan {member}"
                    ),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn singles_join_the_all_channels_set() {
        let mut dir = DetChanDirectory::new();
        assert!(dir.is_free(ALL_CHANNELS));
        dir.add_single(0, "mod1").unwrap();
        dir.add_single(1, "mod1").unwrap();
        assert_eq!(dir.members(ALL_CHANNELS).unwrap(), &[0, 1]);
        assert_eq!(dir.find_alias(1).unwrap(), "mod1");
        assert_eq!(
            dir.add_single(1, "mod2").unwrap_err().kind(),
            ErrorKind::BadValue
        );
    }

    #[test]
    fn all_channels_set_goes_with_last_single() {
        let mut dir = DetChanDirectory::new();
        dir.add_single(3, "m").unwrap();
        dir.add_single(4, "m").unwrap();
        dir.add_set(10).unwrap();
        dir.set_add(10, 3).unwrap();
        dir.remove(3).unwrap();
        assert!(!dir.is_free(ALL_CHANNELS));
        assert_eq!(dir.members(10).unwrap(), &[] as &[i32]);
        dir.remove(4).unwrap();
        assert!(dir.is_free(ALL_CHANNELS));
    }

    #[test]
    fn cycles_are_detected() {
        let mut dir = DetChanDirectory::new();
        dir.add_single(0, "m").unwrap();
        dir.add_set(100).unwrap();
        dir.add_set(101).unwrap();
        dir.set_add(100, 101).unwrap();
        dir.set_add(101, 100).unwrap();
        dir.set_add(101, 0).unwrap();
        assert_eq!(
            dir.validate_sets().unwrap_err().kind(),
            ErrorKind::InfiniteLoop
        );
        // resolution still terminates
        assert_eq!(dir.resolve(100).unwrap(), vec![0]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut dir = DetChanDirectory::new();
        dir.add_set(7).unwrap();
        dir.set_add(7, 7).unwrap();
        assert_eq!(
            dir.validate_sets().unwrap_err().kind(),
            ErrorKind::InfiniteLoop
        );
    }

    #[test]
    fn shared_subsets_are_not_cycles() {
        let mut dir = DetChanDirectory::new();
        dir.add_single(0, "m").unwrap();
        dir.add_single(1, "m").unwrap();
        dir.add_set(20).unwrap();
        dir.set_add(20, 0).unwrap();
        dir.set_add(20, 1).unwrap();
        dir.add_set(21).unwrap();
        dir.set_add(21, 20).unwrap();
        dir.add_set(22).unwrap();
        dir.set_add(22, 20).unwrap();
        dir.set_add(22, 21).unwrap();
        dir.validate_sets().unwrap();
        assert_eq!(dir.resolve(22).unwrap(), vec![0, 1]);
    }

    #[test]
    fn set_edits_are_checked() {
        let mut dir = DetChanDirectory::new();
        dir.add_single(0, "m").unwrap();
        assert_eq!(dir.set_add(5, 0).unwrap_err().kind(), ErrorKind::InvalidDetChan);
        assert_eq!(dir.set_add(0, 0).unwrap_err().kind(), ErrorKind::WrongType);
        assert_eq!(
            dir.set_add(ALL_CHANNELS, 0).unwrap_err().kind(),
            ErrorKind::InvalidDetChan
        );
        dir.add_set(5).unwrap();
        assert_eq!(dir.set_add(5, 9).unwrap_err().kind(), ErrorKind::InvalidDetChan);
        assert_eq!(dir.set_remove(5, 0).unwrap_err().kind(), ErrorKind::BadValue);
    }
}

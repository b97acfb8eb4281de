#![allow(clippy::module_name_repetitions)]
//! Ordered environment accumulator with set-if-absent semantics.
//!
//! The launcher composes the child environment from several sources in a fixed
//! order (process env, mesh-env file, mesh config, derived values). The first
//! writer of a key wins; later writers are ignored. This lets operators pin any
//! key from the outside and keeps derivation order-independent for callers.

use std::collections::BTreeSet;
use std::process::Command;

use crate::util::env_flag_value;

#[derive(Debug, Default, Clone)]
pub struct EnvSet {
    entries: Vec<(String, String)>,
    index: BTreeSet<String>,
    seeded: usize,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the launcher's own environment. Keys with empty values are
    /// skipped so that `FOO=` in the container spec does not pin FOO; this
    /// matches how operators blank out platform-injected keys.
    pub fn from_process_env() -> Self {
        let mut set = Self::new();
        for (k, v) in std::env::vars() {
            if v.is_empty() {
                continue;
            }
            set.set(&k, &v);
        }
        set.seeded = set.entries.len();
        set
    }

    /// Insert key=value unless the key is already present. Returns true when
    /// this call performed the write. An already-present key blocks the write
    /// even when its stored value is empty.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        if self.index.contains(key) {
            return false;
        }
        self.index.insert(key.to_string());
        self.entries.push((key.to_string(), value.to_string()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        if !self.index.contains(key) {
            return None;
        }
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    /// Boolean view of a key: absent, empty and common "off" spellings are false.
    pub fn flag(&self, key: &str) -> bool {
        env_flag_value(self.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries added after the process-env seed, in insertion order.
    /// Used for launch previews and the saved launch script.
    pub fn derived(&self) -> &[(String, String)] {
        &self.entries[self.seeded..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace a Command's environment with exactly this set.
    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.env_clear();
        for (k, v) in &self.entries {
            cmd.env(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_writer_wins() {
        let mut env = EnvSet::new();
        assert!(env.set("XDS_ADDR", "istiod.example:15012"));
        assert!(!env.set("XDS_ADDR", "other:15010"));
        assert_eq!(env.get("XDS_ADDR"), Some("istiod.example:15012"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_empty_stored_value_still_blocks() {
        let mut env = EnvSet::new();
        assert!(env.set("MARKER", ""));
        assert!(!env.set("MARKER", "later"));
        assert_eq!(env.get("MARKER"), Some(""));
        assert!(env.contains("MARKER"));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut env = EnvSet::new();
        env.set("B", "2");
        env.set("A", "1");
        env.set("C", "3");
        let keys: Vec<&str> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_flag_spellings() {
        let mut env = EnvSet::new();
        env.set("ON", "1");
        env.set("OFF", "0");
        env.set("EMPTY", "");
        assert!(env.flag("ON"));
        assert!(!env.flag("OFF"));
        assert!(!env.flag("EMPTY"));
        assert!(!env.flag("ABSENT"));
    }

    #[test]
    fn test_derived_slice_tracks_post_seed_entries() {
        let mut env = EnvSet::new();
        env.set("SEEDED", "x");
        env.seeded = env.entries.len();
        env.set("DERIVED_A", "1");
        env.set("DERIVED_B", "2");
        let derived: Vec<&str> = env.derived().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(derived, vec!["DERIVED_A", "DERIVED_B"]);
    }

    #[test]
    fn test_apply_to_clears_then_sets() {
        let mut env = EnvSet::new();
        env.set("ONLY_KEY", "only-value");
        let mut cmd = Command::new("true");
        env.apply_to(&mut cmd);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(envs.len(), 1);
        assert_eq!(
            envs[0].0.to_str(),
            Some("ONLY_KEY"),
            "env_clear should leave only explicit entries"
        );
    }
}

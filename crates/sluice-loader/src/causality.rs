//! Causality grouping over mutation keys.
//!
//! Two transactions sharing any primary- or unique-key value must apply in
//! receipt order; disjoint transactions may run on different workers. The
//! table maps every seen key to its group representative, so hashing the
//! representative pins a whole group to one worker.

use rustc_hash::FxHashMap;

/// Key-to-group-representative table owned by the dispatcher.
#[derive(Debug, Default)]
pub struct Causality {
    relations: FxHashMap<String, String>,
}

impl Causality {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `keys` touch more than one existing group: dispatching
    /// the transaction would need two workers at once, so the caller must
    /// drain and [`Causality::reset`] first.
    #[must_use]
    pub fn detect_conflict(&self, keys: &[String]) -> bool {
        let mut seen: Option<&str> = None;
        for key in keys {
            if let Some(rep) = self.relations.get(key) {
                match seen {
                    Some(prev) if prev != rep => return true,
                    _ => seen = Some(rep),
                }
            }
        }
        false
    }

    /// Registers `keys` under one group and returns its representative:
    /// the representative of the first already-known key, or the first key
    /// for a brand-new group. Call only when [`Causality::detect_conflict`]
    /// is false.
    pub fn add(&mut self, keys: &[String]) -> Option<String> {
        let first = keys.first()?;
        let rep = keys
            .iter()
            .find_map(|k| self.relations.get(k).cloned())
            .unwrap_or_else(|| first.clone());
        for key in keys {
            self.relations.insert(key.clone(), rep.clone());
        }
        Some(rep)
    }

    /// The representative a key belongs to, if seen.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.relations.get(key).map(String::as_str)
    }

    /// Forgets everything; used at DDL barriers and after drains.
    pub fn reset(&mut self) {
        self.relations.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|k| (*k).to_string()).collect()
    }

    #[test]
    fn test_disjoint_keys_form_separate_groups() {
        let mut c = Causality::new();
        let r1 = c.add(&keys(&["t:id=1"])).unwrap();
        let r2 = c.add(&keys(&["t:id=2"])).unwrap();
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_shared_key_joins_existing_group() {
        let mut c = Causality::new();
        let r1 = c.add(&keys(&["t:id=1", "t:a1=10"])).unwrap();
        // Shares a1=10, lands in the same group.
        let r2 = c.add(&keys(&["t:id=9", "t:a1=10"])).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(c.get("t:id=9"), Some(r1.as_str()));
    }

    #[test]
    fn test_conflict_requires_two_groups() {
        let mut c = Causality::new();
        c.add(&keys(&["t:id=1"]));
        c.add(&keys(&["t:id=2"]));
        // Touches both groups at once.
        assert!(c.detect_conflict(&keys(&["t:id=1", "t:id=2"])));
        // Touching one group, or none, is fine.
        assert!(!c.detect_conflict(&keys(&["t:id=1", "t:a1=77"])));
        assert!(!c.detect_conflict(&keys(&["t:id=3"])));
    }

    #[test]
    fn test_reset_clears_groups() {
        let mut c = Causality::new();
        c.add(&keys(&["t:id=1"]));
        c.reset();
        assert!(c.is_empty());
        assert_eq!(c.get("t:id=1"), None);
    }

    #[test]
    fn test_pk_swap_chain_stays_in_one_group() {
        // The unique-index swap: three updates chained through a1 values.
        let mut c = Causality::new();
        let r1 = c
            .add(&keys(&["t:id=1", "t:a1=10", "t:a1=30"]))
            .unwrap();
        assert!(!c.detect_conflict(&keys(&["t:id=2", "t:a1=20", "t:a1=10"])));
        let r2 = c
            .add(&keys(&["t:id=2", "t:a1=20", "t:a1=10"]))
            .unwrap();
        let r3 = c
            .add(&keys(&["t:id=1", "t:a1=30", "t:a1=20"]))
            .unwrap();
        assert_eq!(r1, r2);
        assert_eq!(r2, r3);
    }
}

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// A multiset that only exposes membership transitions: a value is present while at least one
///  independent reason for its presence exists. `inc` and `dec` report whether the value's
///  membership changed, which is what drives propagation of membership changes.
///
/// Counts never go negative: decrementing an absent value is a no-op that reports no change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountingSet<T: Ord> {
    counts: BTreeMap<T, usize>,
}

impl <T: Ord + Clone + Debug> CountingSet<T> {
    pub fn new() -> CountingSet<T> {
        CountingSet {
            counts: BTreeMap::new(),
        }
    }

    /// returns `true` iff the value transitioned from absent to present
    pub fn inc(&mut self, value: T) -> bool {
        let count = self.counts.entry(value).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// returns `true` iff the value transitioned from present to absent
    pub fn dec<Q>(&mut self, value: &Q) -> bool
    where T: Borrow<Q>, Q: Ord + ?Sized
    {
        match self.counts.get_mut(value) {
            None => false,
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(value);
                    true
                }
                else {
                    false
                }
            }
        }
    }

    /// Increments all values, returning those that became present
    pub fn inc_all<'a>(&mut self, values: impl IntoIterator<Item = &'a T>) -> Vec<T>
    where T: 'a
    {
        values.into_iter()
            .filter(|v| self.inc((*v).clone()))
            .cloned()
            .collect()
    }

    /// Decrements all values, returning those that became absent
    pub fn dec_all<'a>(&mut self, values: impl IntoIterator<Item = &'a T>) -> Vec<T>
    where T: 'a
    {
        values.into_iter()
            .filter(|v| self.dec(*v))
            .cloned()
            .collect()
    }

    pub fn contains<Q>(&self, value: &Q) -> bool
    where T: Borrow<Q>, Q: Ord + ?Sized
    {
        self.counts.contains_key(value)
    }

    pub fn count<Q>(&self, value: &Q) -> usize
    where T: Borrow<Q>, Q: Ord + ?Sized
    {
        self.counts.get(value).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &T> {
        self.counts.keys()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_inc_dec_transitions() {
        let mut set = CountingSet::new();
        assert!(set.inc("a"));
        assert!(!set.inc("a"));
        assert!(set.inc("b"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.count("a"), 2);

        assert!(!set.dec("a"));
        assert!(set.contains("a"));
        assert!(set.dec("a"));
        assert!(!set.contains("a"));
        assert_eq!(set.count("a"), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_never_negative() {
        let mut set = CountingSet::<String>::new();
        assert!(!set.dec("x"));
        assert!(!set.dec("x"));
        assert!(set.inc("x".to_string()));
        assert!(set.dec("x"));
        assert!(!set.dec("x"));
        assert!(set.is_empty());
    }

    #[rstest]
    #[case::disjoint(vec!["a", "b"], vec!["a", "b"])]
    #[case::duplicates_in_batch(vec!["a", "a", "b"], vec!["a", "b"])]
    #[case::empty(vec![], vec![])]
    fn test_inc_all(#[case] values: Vec<&str>, #[case] expected_new: Vec<&str>) {
        let mut set = CountingSet::new();
        let values = values.into_iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let expected = expected_new.into_iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(set.inc_all(values.iter()), expected);
        assert_eq!(set.dec_all(values.iter()), expected);
        assert!(set.is_empty());
    }
}

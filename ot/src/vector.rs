//! State vectors: per-user request counts forming a causal timestamp.
use crate::{Error, Result, UserId};
use std::collections::BTreeMap;

/// Outcome of comparing two state vectors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VectorOrder {
    /// All components equal.
    Equal,
    /// Every component ≤ the other's, at least one strictly smaller.
    Less,
    /// Every component ≥ the other's, at least one strictly greater.
    Greater,
    /// Neither ≤ nor ≥: the vectors belong to concurrent states.
    Concurrent,
}

/// A partial function from user id to a non-negative request count.
///
/// Absent components are zero. Vectors are plain values; the core treats a
/// vector referenced by a [`crate::Request`] as immutable.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StateVector {
    components: BTreeMap<UserId, u32>,
}

impl StateVector {
    /// Returns the zero vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the component for `user`, zero if absent.
    pub fn get(&self, user: UserId) -> u32 {
        self.components.get(&user).copied().unwrap_or_default()
    }

    /// Sets the component for `user`. A zero value removes the entry so
    /// that equal vectors compare equal structurally.
    pub fn set(&mut self, user: UserId, value: u32) {
        if value == 0 {
            self.components.remove(&user);
        } else {
            self.components.insert(user, value);
        }
    }

    /// Adds `count` to the component for `user`.
    pub fn add(&mut self, user: UserId, count: u32) {
        if count > 0 {
            *self.components.entry(user).or_default() += count;
        }
    }

    /// Componentwise sum.
    pub fn sum(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for (user, count) in &other.components {
            result.add(*user, *count);
        }
        result
    }

    /// Componentwise difference. Fails with [`Error::InvalidVector`] if any
    /// component of `other` exceeds the corresponding component of `self`.
    pub fn checked_sub(&self, other: &Self) -> Result<Self> {
        let mut result = Self::new();
        for (user, count) in &self.components {
            let sub = other.get(*user);
            if sub > *count {
                return Err(Error::InvalidVector(format!(
                    "component for user {} would become negative",
                    user
                )));
            }
            result.set(*user, count - sub);
        }
        for user in other.components.keys() {
            if self.get(*user) < other.get(*user) {
                return Err(Error::InvalidVector(format!(
                    "component for user {} would become negative",
                    user
                )));
            }
        }
        Ok(result)
    }

    /// Componentwise maximum, the causal join.
    pub fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for (user, count) in &other.components {
            if *count > result.get(*user) {
                result.set(*user, *count);
            }
        }
        result
    }

    /// Componentwise minimum, the causal meet. Used as the vacuum bound.
    pub fn meet(&self, other: &Self) -> Self {
        let mut result = Self::new();
        for (user, count) in &self.components {
            let min = (*count).min(other.get(*user));
            result.set(*user, min);
        }
        result
    }

    /// Causal comparison of two vectors.
    pub fn compare(&self, other: &Self) -> VectorOrder {
        let mut less = false;
        let mut greater = false;
        for user in self.components.keys().chain(other.components.keys()) {
            let a = self.get(*user);
            let b = other.get(*user);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => VectorOrder::Equal,
            (true, false) => VectorOrder::Less,
            (false, true) => VectorOrder::Greater,
            (true, true) => VectorOrder::Concurrent,
        }
    }

    /// Whether `self` is causally before `other`.
    pub fn causally_before(&self, other: &Self) -> bool {
        self.compare(other) == VectorOrder::Less
    }

    /// The number of non-zero components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether all components are zero.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// The sum of all components, used as a transformation-distance metric.
    pub fn total(&self) -> u64 {
        self.components.values().map(|c| *c as u64).sum()
    }

    /// Iterates non-zero components in ascending user order.
    pub fn iter(&self) -> impl Iterator<Item = (UserId, u32)> + '_ {
        self.components.iter().map(|(user, count)| (*user, *count))
    }

    /// Parses the wire form produced by [`std::fmt::Display`]: space
    /// separated `id:count` pairs in ascending id order.
    pub fn parse(input: &str) -> Result<Self> {
        let mut result = Self::new();
        for pair in input.split(' ').filter(|p| !p.is_empty()) {
            let (id, count) = pair
                .split_once(':')
                .ok_or_else(|| Error::InvalidVector(format!("malformed pair {:?}", pair)))?;
            let id: u32 = id
                .parse()
                .map_err(|_| Error::InvalidVector(format!("malformed user id {:?}", id)))?;
            let count: u32 = count
                .parse()
                .map_err(|_| Error::InvalidVector(format!("malformed count {:?}", count)))?;
            result.set(UserId(id), count);
        }
        Ok(result)
    }
}

impl std::fmt::Display for StateVector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for (user, count) in &self.components {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", user, count)?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(UserId, u32)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (UserId, u32)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (user, count) in iter {
            vector.set(user, count);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_vector() -> impl Strategy<Value = StateVector> {
        prop::collection::btree_map(0u32..5, 1u32..20, 0..5)
            .prop_map(|m| m.into_iter().map(|(u, c)| (UserId(u), c)).collect())
    }

    proptest! {
        #[test]
        fn join_idempotence(a in arb_vector()) {
            prop_assert_eq!(a.join(&a), a);
        }

        #[test]
        fn join_commutativity(a in arb_vector(), b in arb_vector()) {
            prop_assert_eq!(a.join(&b), b.join(&a));
        }

        #[test]
        fn join_associativity(a in arb_vector(), b in arb_vector(), c in arb_vector()) {
            prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        }

        #[test]
        fn meet_commutativity(a in arb_vector(), b in arb_vector()) {
            prop_assert_eq!(a.meet(&b), b.meet(&a));
        }

        #[test]
        fn sub_then_add_roundtrips(a in arb_vector(), b in arb_vector()) {
            let joined = a.join(&b);
            // b ≤ joined, so the difference exists and adding it back is exact.
            let diff = joined.checked_sub(&b).unwrap();
            prop_assert_eq!(b.sum(&diff), joined);
        }

        #[test]
        fn wire_roundtrip(a in arb_vector()) {
            prop_assert_eq!(StateVector::parse(&a.to_string()).unwrap(), a);
        }
    }

    #[test]
    fn compare_orders() {
        let a: StateVector = [(UserId(1), 2), (UserId(2), 1)].into_iter().collect();
        let b: StateVector = [(UserId(1), 2), (UserId(2), 3)].into_iter().collect();
        let c: StateVector = [(UserId(1), 3), (UserId(2), 1)].into_iter().collect();
        assert_eq!(a.compare(&a), VectorOrder::Equal);
        assert_eq!(a.compare(&b), VectorOrder::Less);
        assert_eq!(b.compare(&a), VectorOrder::Greater);
        assert_eq!(b.compare(&c), VectorOrder::Concurrent);
        assert!(a.causally_before(&b));
        assert!(!b.causally_before(&b));
    }

    #[test]
    fn sub_rejects_concurrent_bound() {
        let a: StateVector = [(UserId(1), 2)].into_iter().collect();
        let b: StateVector = [(UserId(2), 1)].into_iter().collect();
        assert!(matches!(a.checked_sub(&b), Err(Error::InvalidVector(_))));
    }

    #[test]
    fn zero_components_are_normalised() {
        let mut a = StateVector::new();
        a.set(UserId(7), 3);
        a.set(UserId(7), 0);
        assert_eq!(a, StateVector::new());
        assert_eq!(a.to_string(), "");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(StateVector::parse("1:2 3").is_err());
        assert!(StateVector::parse("x:1").is_err());
        assert!(StateVector::parse("1:-4").is_err());
    }
}

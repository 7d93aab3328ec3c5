//! Vector clocks summarising observed causal history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::ActorId;

/// `actor -> seq` vector. Components only ever grow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clock(BTreeMap<ActorId, u64>);

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observed sequence for an actor, zero when never seen.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Raise an actor's component; lower observations are ignored.
    pub fn observe(&mut self, actor: ActorId, seq: u64) {
        let entry = self.0.entry(actor).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Pointwise-max merge.
    pub fn merge(&mut self, other: &Clock) {
        for (actor, seq) in &other.0 {
            self.observe(actor.clone(), *seq);
        }
    }

    /// Copy with the given actor's component removed. Used when emitting a
    /// change's deps: the actor's own dependency is implicit in its seq.
    pub fn without(&self, actor: &ActorId) -> Clock {
        let mut out = self.clone();
        out.0.remove(actor);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.0.iter().map(|(a, s)| (a, *s))
    }
}

impl FromIterator<(ActorId, u64)> for Clock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::new(s).unwrap()
    }

    #[test]
    fn observe_never_decreases() {
        let mut clock = Clock::new();
        clock.observe(actor("a"), 4);
        clock.observe(actor("a"), 2);
        assert_eq!(clock.get(&actor("a")), 4);
        assert_eq!(clock.get(&actor("b")), 0);
    }

    #[test]
    fn merge_is_pointwise_max() {
        let mut left: Clock = [(actor("a"), 3), (actor("b"), 1)].into_iter().collect();
        let right: Clock = [(actor("b"), 5), (actor("c"), 2)].into_iter().collect();
        left.merge(&right);
        assert_eq!(left.get(&actor("a")), 3);
        assert_eq!(left.get(&actor("b")), 5);
        assert_eq!(left.get(&actor("c")), 2);
    }

    #[test]
    fn without_drops_own_component() {
        let clock: Clock = [(actor("local"), 4), (actor("remote2"), 41)]
            .into_iter()
            .collect();
        let deps = clock.without(&actor("local"));
        assert_eq!(deps.get(&actor("local")), 0);
        assert_eq!(deps.get(&actor("remote2")), 41);
        // The source clock is untouched.
        assert_eq!(clock.get(&actor("local")), 4);
    }
}

//! Per-call-site type feedback.

use std::collections::{BTreeSet, HashMap};

use crate::value::Kind;

/// Kinds observed at one `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SiteProfile {
    pub receiver_kinds: BTreeSet<Kind>,
    pub arg_kinds: Vec<BTreeSet<Kind>>,
}

impl SiteProfile {
    pub fn record(&mut self, receiver: Kind, args: &[Kind]) {
        self.receiver_kinds.insert(receiver);
        if self.arg_kinds.len() < args.len() {
            self.arg_kinds.resize(args.len(), BTreeSet::new());
        }
        for (set, kind) in self.arg_kinds.iter_mut().zip(args) {
            set.insert(*kind);
        }
    }

    /// The receiver kind, if only one was ever seen.
    pub fn monomorphic_receiver(&self) -> Option<Kind> {
        single(&self.receiver_kinds)
    }

    pub fn monomorphic_arg(&self, index: usize) -> Option<Kind> {
        self.arg_kinds.get(index).and_then(single)
    }
}

fn single(set: &BTreeSet<Kind>) -> Option<Kind> {
    if set.len() == 1 {
        set.iter().next().copied()
    } else {
        None
    }
}

/// Profiles keyed by the instruction index of the `send`.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    sites: HashMap<usize, SiteProfile>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ip: usize, receiver: Kind, args: &[Kind]) {
        self.sites.entry(ip).or_default().record(receiver, args);
    }

    pub fn site(&self, ip: usize) -> Option<&SiteProfile> {
        self.sites.get(&ip)
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monomorphic_until_a_second_kind_shows_up() {
        let mut profile = Profile::new();
        profile.record(3, Kind::Fixnum, &[Kind::Fixnum]);
        profile.record(3, Kind::Fixnum, &[Kind::Fixnum]);
        let site = profile.site(3).unwrap();
        assert_eq!(site.monomorphic_receiver(), Some(Kind::Fixnum));
        assert_eq!(site.monomorphic_arg(0), Some(Kind::Fixnum));

        profile.record(3, Kind::Float, &[Kind::Fixnum]);
        let site = profile.site(3).unwrap();
        assert_eq!(site.monomorphic_receiver(), None);
        assert_eq!(site.monomorphic_arg(0), Some(Kind::Fixnum));
        assert_eq!(site.monomorphic_arg(1), None);
        assert!(profile.site(4).is_none());
    }
}

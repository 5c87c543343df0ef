//! Component B: the zone tree.
//!
//! One [`ZoneTree`] holds the apex node plus every subdomain node under it,
//! ordered canonically (RFC 4034 §6) so the denial builder can walk
//! "previous"/"next" by tree position rather than following pointers
//! (spec §9's design note on representing rings implicitly).
//!
//! Snapshots are published through [`arc_swap::ArcSwap`]: a commit clones
//! the ordered map, mutates the clone, and swaps it in atomically, so a
//! concurrent reader always sees either the whole pre-commit or whole
//! post-commit tree, never a partial one (spec §5, "shared resources").

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use domain::base::cmp::CanonicalOrd;

use crate::rr::{RRSetStore, StoredName};

/// A name ordered per RFC 4034 §6 canonical ordering rather than the
/// presentation-order `Ord` some name types provide.
#[derive(Clone, Debug)]
pub struct CanonicalName(pub StoredName);

impl PartialEq for CanonicalName {
    fn eq(&self, other: &Self) -> bool {
        self.0.canonical_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for CanonicalName {}

impl PartialOrd for CanonicalName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.canonical_cmp(&other.0)
    }
}

/// A single node of the zone tree: a name plus its RRSet store.
pub struct ZoneNode {
    pub name: StoredName,
    pub rrsets: RRSetStore,
}

impl ZoneNode {
    pub fn new(name: StoredName) -> Self {
        Self {
            name,
            rrsets: RRSetStore::new(),
        }
    }
}

type Snapshot = BTreeMap<CanonicalName, Arc<ZoneNode>>;

/// All nodes — apex and subdomains — belonging to one origin.
///
/// The apex itself is stored as an ordinary entry keyed by its own name, so
/// canonical iteration naturally starts (or, after wraparound, ends) there.
pub struct ZoneTree {
    apex: StoredName,
    nodes: ArcSwap<Snapshot>,
}

impl ZoneTree {
    pub fn new(apex: StoredName) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            CanonicalName(apex.clone()),
            Arc::new(ZoneNode::new(apex.clone())),
        );
        Self {
            apex,
            nodes: ArcSwap::from_pointee(nodes),
        }
    }

    pub fn apex_name(&self) -> &StoredName {
        &self.apex
    }

    /// `find-exact(name)`.
    pub fn find_exact(&self, name: &StoredName) -> Option<Arc<ZoneNode>> {
        self.nodes.load().get(&CanonicalName(name.clone())).cloned()
    }

    /// `subdomain-exists(apex, name)`. The apex itself always "exists".
    pub fn subdomain_exists(&self, name: &StoredName) -> bool {
        self.find_exact(name).is_some()
    }

    /// `find-zone-with-subdomains(apex) -> list in canonical order`.
    pub fn all_in_canonical_order(&self) -> Vec<Arc<ZoneNode>> {
        self.nodes.load().values().cloned().collect()
    }

    /// `find-next-subdomain(apex, after-name)`. Wraps to the apex after the
    /// canonically-last name.
    pub fn find_next(&self, after: &StoredName) -> Option<Arc<ZoneNode>> {
        let snapshot = self.nodes.load();
        let key = CanonicalName(after.clone());
        snapshot
            .range((std::ops::Bound::Excluded(&key), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| snapshot.iter().next())
            .map(|(_, node)| node.clone())
    }

    /// `find-previous-subdomain(apex, before-name)`. Wraps to the
    /// canonically-last name before the apex.
    pub fn find_previous(&self, before: &StoredName) -> Option<Arc<ZoneNode>> {
        let snapshot = self.nodes.load();
        let key = CanonicalName(before.clone());
        snapshot
            .range((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(&key)))
            .next_back()
            .or_else(|| snapshot.iter().next_back())
            .map(|(_, node)| node.clone())
    }

    /// `get-or-add-subdomain(apex, name)`.
    pub fn get_or_add(&self, name: &StoredName) -> Arc<ZoneNode> {
        if let Some(existing) = self.find_exact(name) {
            return existing;
        }
        let mut next: Snapshot = (**self.nodes.load()).clone();
        let node = next
            .entry(CanonicalName(name.clone()))
            .or_insert_with(|| Arc::new(ZoneNode::new(name.clone())))
            .clone();
        self.nodes.store(Arc::new(next));
        node
    }

    /// `remove-subdomain(name)`. Removing the apex itself is a no-op: the
    /// apex node is never absent from its own tree.
    pub fn remove(&self, name: &StoredName) {
        if name == &self.apex {
            return;
        }
        let mut next: Snapshot = (**self.nodes.load()).clone();
        next.remove(&CanonicalName(name.clone()));
        self.nodes.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::rr::StoredName;

    fn name(s: &str) -> StoredName {
        StoredName::from_str(s).unwrap()
    }

    #[test]
    fn starts_with_only_the_apex() {
        let tree = ZoneTree::new(name("example."));
        assert_eq!(tree.len(), 1);
        assert!(tree.subdomain_exists(&name("example.")));
        assert!(!tree.subdomain_exists(&name("www.example.")));
    }

    #[test]
    fn next_wraps_to_apex_and_previous_wraps_to_last() {
        let tree = ZoneTree::new(name("example."));
        tree.get_or_add(&name("a.example."));
        tree.get_or_add(&name("z.example."));

        let next_after_z = tree.find_next(&name("z.example.")).unwrap();
        assert_eq!(next_after_z.name, name("example."));

        let prev_before_a = tree.find_previous(&name("a.example.")).unwrap();
        assert_eq!(prev_before_a.name, name("example."));

        let prev_before_apex = tree.find_previous(&name("example.")).unwrap();
        assert_eq!(prev_before_apex.name, name("z.example."));
    }

    #[test]
    fn get_or_add_is_idempotent() {
        let tree = ZoneTree::new(name("example."));
        let first = tree.get_or_add(&name("www.example."));
        let second = tree.get_or_add(&name("www.example."));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn remove_drops_subdomain_but_not_apex() {
        let tree = ZoneTree::new(name("example."));
        tree.get_or_add(&name("www.example."));
        tree.remove(&name("www.example."));
        assert!(!tree.subdomain_exists(&name("www.example.")));

        tree.remove(&name("example."));
        assert!(tree.subdomain_exists(&name("example.")));
    }
}

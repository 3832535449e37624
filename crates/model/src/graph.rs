//! Replacement graph of a package.
//!
//! Two pieces of logic live here because both the relational loader and the
//! cache builder must agree on them exactly:
//!
//! - [`HeadCandidates`] picks the single bundle of a channel that nothing
//!   replaces.
//! - [`ReplacementWalk`] follows `replaces` from a head, handing out the depth
//!   of every hop and of every skipped bundle, and rejects cycles.

use crate::error::{ErrorKind, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Identity of a bundle node in a channel graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleKey {
    pub bundle_path: String,
    pub version: String,
    pub csv_name: String,
}
impl BundleKey {
    pub fn new(csv_name: impl Into<String>, version: impl Into<String>, bundle_path: impl Into<String>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            version: version.into(),
            csv_name: csv_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub head: BundleKey,
    /// Every bundle in the channel mapped to the bundles it replaces.
    pub nodes: BTreeMap<BundleKey, BTreeSet<BundleKey>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub default_channel: String,
    pub channels: BTreeMap<String, Channel>,
}

/// Accumulates head candidates for one channel.
///
/// Every real bundle seen is a candidate until some edge names it as a
/// replacement target. Edges and bundles may be observed in any order.
#[derive(Debug, Default)]
pub struct HeadCandidates {
    candidates: BTreeSet<String>,
    replaced: BTreeSet<String>,
}
impl HeadCandidates {
    /// Record a bundle that exists in the store (placeholders for skipped
    /// bundles never become heads).
    pub fn observe(&mut self, bundle: &str) {
        if !self.replaced.contains(bundle) {
            self.candidates.insert(bundle.to_string());
        }
    }

    /// Record that some member of the channel replaces (or skips) `target`.
    pub fn replaced(&mut self, target: &str) {
        self.candidates.remove(target);
        self.replaced.insert(target.to_string());
    }

    pub fn resolve(self) -> Result<String> {
        let mut candidates = self.candidates.into_iter();
        match (candidates.next(), candidates.next()) {
            (None, _) => exn::bail!(ErrorKind::NoChannelHead),
            (Some(head), None) => Ok(head),
            (Some(first), Some(second)) => {
                let all: Vec<String> = [first, second].into_iter().chain(candidates).collect();
                exn::bail!(ErrorKind::MultipleChannelHeads(all))
            },
        }
    }
}

/// One advance of a [`ReplacementWalk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Depth shared by every skipped placeholder and the next real member.
    pub depth: u32,
    /// Bundles skipped by the current member.
    pub skips: Vec<String>,
    /// The bundle the current member replaces, or `None` at the tail.
    pub next: Option<String>,
}

/// Cursor over a channel's replacement chain.
///
/// Starts at the head (depth 0). Each call to [`advance`](Self::advance) takes
/// the current member's `replaces`/`skips` and moves the cursor one hop
/// towards the tail. Skipped bundles share the depth of the next real hop, so
/// after walking N real members the cursor sits at depth N-1.
#[derive(Debug, Clone)]
pub struct ReplacementWalk {
    current: String,
    depth: u32,
    seen: HashSet<String>,
    finished: bool,
}
impl ReplacementWalk {
    pub fn new(head: impl Into<String>) -> Self {
        let current = head.into();
        Self {
            seen: HashSet::from([current.clone()]),
            current,
            depth: 0,
            finished: false,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Move past the current member given its outgoing edges.
    ///
    /// Fails with [`ErrorKind::Cycle`] if `replaces` names a bundle already
    /// visited on this walk. Once a hop returns `next: None` the walk is over
    /// and further calls return an empty hop.
    pub fn advance(&mut self, replaces: Option<&str>, skips: &[String]) -> Result<Hop> {
        let depth = self.depth + 1;
        if self.finished {
            return Ok(Hop { depth, skips: Vec::new(), next: None });
        }
        let skips = skips.iter().filter(|s| !s.is_empty()).cloned().collect();
        let next = match replaces.filter(|r| !r.is_empty()) {
            None => {
                self.finished = true;
                None
            },
            Some(target) if self.seen.contains(target) => {
                exn::bail!(ErrorKind::Cycle { bundle: self.current.clone(), replaces: target.to_string() })
            },
            Some(target) => {
                self.seen.insert(target.to_string());
                self.current = target.to_string();
                self.depth = depth;
                Some(target.to_string())
            },
        };
        Ok(Hop { depth, skips, next })
    }
}

/// Walk an in-memory channel and return the depth of every bundle reached,
/// skipped placeholders included (a bundle reached more than once keeps its
/// smallest depth).
///
/// `edges` returns `(replaces, skips)` for a member, or `None` if the member
/// is unknown, in which case the walk stops there.
pub fn assign_depths<'a, F>(head: &str, mut edges: F) -> Result<BTreeMap<String, u32>>
where
    F: FnMut(&str) -> Option<(Option<&'a str>, &'a [String])>,
{
    let mut depths = BTreeMap::from([(head.to_string(), 0)]);
    let mut walk = ReplacementWalk::new(head);
    while let Some((replaces, skips)) = edges(walk.current()) {
        let hop = walk.advance(replaces, skips)?;
        for skip in hop.skips {
            depths.entry(skip).and_modify(|d| *d = (*d).min(hop.depth)).or_insert(hop.depth);
        }
        match hop.next {
            Some(next) => {
                depths.entry(next).and_modify(|d| *d = (*d).min(hop.depth)).or_insert(hop.depth);
            },
            None => break,
        }
    }
    Ok(depths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_single_head() {
        let mut heads = HeadCandidates::default();
        heads.observe("acme.v2");
        heads.observe("acme.v1");
        heads.replaced("acme.v1");
        heads.replaced("acme.v1-rc1");
        assert_eq!(heads.resolve().unwrap(), "acme.v2");
    }

    #[test]
    fn test_replacement_before_observation() {
        let mut heads = HeadCandidates::default();
        heads.replaced("acme.v1");
        heads.observe("acme.v1");
        heads.observe("acme.v2");
        assert_eq!(heads.resolve().unwrap(), "acme.v2");
    }

    #[test]
    fn test_no_head() {
        let mut heads = HeadCandidates::default();
        heads.observe("a");
        heads.observe("b");
        heads.replaced("a");
        heads.replaced("b");
        let err = heads.resolve().unwrap_err();
        assert_eq!(*err, ErrorKind::NoChannelHead);
    }

    #[test]
    fn test_multiple_heads() {
        let mut heads = HeadCandidates::default();
        heads.observe("b");
        heads.observe("a");
        let err = heads.resolve().unwrap_err();
        assert_eq!(*err, ErrorKind::MultipleChannelHeads(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_walk_depths() {
        let mut walk = ReplacementWalk::new("h");
        let hop = walk.advance(Some("m"), &[]).unwrap();
        assert_eq!(hop, Hop { depth: 1, skips: vec![], next: Some("m".to_string()) });
        let hop = walk.advance(Some("t"), &["s".to_string(), String::new()]).unwrap();
        assert_eq!(hop, Hop { depth: 2, skips: vec!["s".to_string()], next: Some("t".to_string()) });
        let hop = walk.advance(None, &[]).unwrap();
        assert_eq!(hop.next, None);
        assert!(walk.is_finished());
        // Three real members: the tail sits at depth 2.
        assert_eq!(walk.depth(), 2);
        assert_eq!(walk.current(), "t");
    }

    #[test]
    fn test_walk_rejects_cycle() {
        let mut walk = ReplacementWalk::new("a.v2");
        walk.advance(Some("a.v1"), &[]).unwrap();
        let err = walk.advance(Some("a.v2"), &[]).unwrap_err();
        assert_eq!(*err, ErrorKind::Cycle { bundle: "a.v1".to_string(), replaces: "a.v2".to_string() });
    }

    #[test]
    fn test_assign_depths_with_skip() {
        let edges: HashMap<&str, (Option<&str>, Vec<String>)> = HashMap::from([
            ("acme.v2", (Some("acme.v1"), vec!["acme.v1-rc1".to_string()])),
            ("acme.v1", (None, vec![])),
        ]);
        let depths = assign_depths("acme.v2", |name| edges.get(name).map(|(r, s)| (*r, s.as_slice()))).unwrap();
        assert_eq!(depths["acme.v2"], 0);
        assert_eq!(depths["acme.v1"], 1);
        assert_eq!(depths["acme.v1-rc1"], 1);
    }

    #[test]
    fn test_assign_depths_stops_at_unknown_member() {
        let edges: HashMap<&str, (Option<&str>, Vec<String>)> =
            HashMap::from([("b.v3", (Some("b.v2"), vec![]))]);
        let depths = assign_depths("b.v3", |name| edges.get(name).map(|(r, s)| (*r, s.as_slice()))).unwrap();
        assert_eq!(depths.len(), 2);
        assert_eq!(depths["b.v2"], 1);
    }

    #[test]
    fn test_assign_depths_rejects_cycle() {
        let edges: HashMap<&str, (Option<&str>, Vec<String>)> =
            HashMap::from([("a", (Some("b"), vec![])), ("b", (Some("a"), vec![]))]);
        let err = assign_depths("a", |name| edges.get(name).map(|(r, s)| (*r, s.as_slice()))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cycle { .. }));
    }
}

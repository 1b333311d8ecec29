// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Commit graph traversal.
//!
//! Walks are lazy pull-based iterators in reverse committer-date order with
//! the commit id as a deterministic tie break. A shallow boundary commit is
//! yielded but its parents are treated as absent, so no walk ever reaches
//! below the boundary.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::hash::ObjectId;
use crate::object::Commit;
use crate::odb::ObjectDb;
use crate::odb::OdbResult;
use crate::op_context::OpContext;

struct QueueItem {
    when: i64,
    id: ObjectId,
    commit: Arc<Commit>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.id == other.id
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.id).cmp(&(other.when, other.id))
    }
}

/// Lazy walk over the ancestors of a set of heads, newest first. Finite and
/// non-restartable; call [`RevWalk::close`] (or drop) to release the store
/// handle.
pub struct RevWalk<'a> {
    odb: &'a ObjectDb,
    ctx: OpContext,
    shallow: Option<ObjectId>,
    queue: BinaryHeap<QueueItem>,
    queued: HashSet<ObjectId>,
}

impl<'a> RevWalk<'a> {
    pub fn ancestors(
        odb: &'a ObjectDb,
        ctx: &OpContext,
        heads: &[ObjectId],
        shallow: Option<ObjectId>,
    ) -> OdbResult<Self> {
        let mut walk = Self {
            odb,
            ctx: ctx.clone(),
            shallow,
            queue: BinaryHeap::new(),
            queued: HashSet::new(),
        };
        for head in heads {
            walk.push(*head)?;
        }
        Ok(walk)
    }

    fn push(&mut self, id: ObjectId) -> OdbResult<()> {
        if id.is_zero() || !self.queued.insert(id) {
            return Ok(());
        }
        let commit = self.odb.commit(&id)?;
        self.queue.push(QueueItem {
            when: commit.committer.when.millis_since_epoch,
            id,
            commit,
        });
        Ok(())
    }

    /// Releases the walk. Equivalent to dropping, spelled out so callers
    /// can make the end of the traversal explicit.
    pub fn close(self) {}
}

impl Iterator for RevWalk<'_> {
    type Item = OdbResult<(ObjectId, Arc<Commit>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.ctx.check() {
            return Some(Err(err.into()));
        }
        let item = self.queue.pop()?;
        // Parents below the shallow boundary are deliberately absent.
        if Some(item.id) != self.shallow {
            for parent in &item.commit.parents {
                if let Err(err) = self.push(*parent) {
                    return Some(Err(err));
                }
            }
        }
        Some(Ok((item.id, item.commit)))
    }
}

/// Whether `ancestor` is reachable from `descendant` via parent links,
/// modulo the shallow boundary. A commit is its own ancestor.
pub fn is_ancestor(
    odb: &ObjectDb,
    ctx: &OpContext,
    ancestor: &ObjectId,
    descendant: &ObjectId,
    shallow: Option<ObjectId>,
) -> OdbResult<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    for item in RevWalk::ancestors(odb, ctx, &[*descendant], shallow)? {
        let (id, _) = item?;
        if id == *ancestor {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fast-forward test: the ref at `old` may move to `new` without losing
/// history iff `old` is an ancestor of `new`.
pub fn is_fast_forward(
    odb: &ObjectDb,
    ctx: &OpContext,
    old: &ObjectId,
    new: &ObjectId,
    shallow: Option<ObjectId>,
) -> OdbResult<bool> {
    is_ancestor(odb, ctx, old, new, shallow)
}

/// All commits reachable from `head`, including `head`.
pub fn reachable_set(
    odb: &ObjectDb,
    ctx: &OpContext,
    head: &ObjectId,
    shallow: Option<ObjectId>,
) -> OdbResult<HashSet<ObjectId>> {
    let mut set = HashSet::new();
    for item in RevWalk::ancestors(odb, ctx, &[*head], shallow)? {
        set.insert(item?.0);
    }
    Ok(set)
}

/// The nearest common ancestor of `a` and `b`, or `None` for unrelated
/// histories. "Nearest" picks the first common commit encountered walking
/// from `b` in reverse date order, which is deterministic for fixed inputs.
pub fn merge_base(
    odb: &ObjectDb,
    ctx: &OpContext,
    a: &ObjectId,
    b: &ObjectId,
    shallow: Option<ObjectId>,
) -> OdbResult<Option<ObjectId>> {
    let ancestors_of_a = reachable_set(odb, ctx, a, shallow)?;
    for item in RevWalk::ancestors(odb, ctx, &[*b], shallow)? {
        let (id, _) = item?;
        if ancestors_of_a.contains(&id) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Commits reachable from `include` but not from any of `exclude`
/// (`exclude.. include`), newest first.
pub fn walk_range(
    odb: &ObjectDb,
    ctx: &OpContext,
    exclude: &[ObjectId],
    include: &[ObjectId],
    shallow: Option<ObjectId>,
) -> OdbResult<Vec<(ObjectId, Arc<Commit>)>> {
    let mut excluded = HashSet::new();
    for head in exclude {
        excluded.extend(reachable_set(odb, ctx, head, shallow)?);
    }
    let mut result = Vec::new();
    for item in RevWalk::ancestors(odb, ctx, include, shallow)? {
        let (id, commit) = item?;
        if !excluded.contains(&id) {
            result.push((id, commit));
        }
    }
    Ok(result)
}

/// Commits reachable from exactly one of `a` and `b` (`a...b`), newest
/// first.
pub fn walk_symmetric_difference(
    odb: &ObjectDb,
    ctx: &OpContext,
    a: &ObjectId,
    b: &ObjectId,
    shallow: Option<ObjectId>,
) -> OdbResult<Vec<(ObjectId, Arc<Commit>)>> {
    let from_a = reachable_set(odb, ctx, a, shallow)?;
    let from_b = reachable_set(odb, ctx, b, shallow)?;
    let mut result = Vec::new();
    for item in RevWalk::ancestors(odb, ctx, &[*a, *b], shallow)? {
        let (id, commit) = item?;
        if from_a.contains(&id) != from_b.contains(&id) {
            result.push((id, commit));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use smallvec::SmallVec;

    use super::*;
    use crate::config::ChunkConfig;
    use crate::object::Object;
    use crate::object::Signature;
    use crate::object::Timestamp;
    use crate::object::Tree;

    struct Graph {
        _dir: tempfile::TempDir,
        odb: ObjectDb,
        when: i64,
    }

    impl Graph {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let odb = ObjectDb::init(&dir.path().join("objects"), ChunkConfig::default()).unwrap();
            Self {
                _dir: dir,
                odb,
                when: 1_000_000,
            }
        }

        fn commit(&mut self, parents: &[ObjectId]) -> ObjectId {
            self.when += 1000;
            let signature = Signature {
                name: "t".to_owned(),
                email: "t@example.com".to_owned(),
                when: Timestamp {
                    millis_since_epoch: self.when,
                    tz_offset: 0,
                },
            };
            let tree = self
                .odb
                .put_encoded(&Object::Tree(Tree::default()))
                .unwrap();
            self.odb
                .put_encoded(&Object::Commit(Commit {
                    tree,
                    parents: SmallVec::from_slice(parents),
                    author: signature.clone(),
                    committer: signature,
                    message: format!("commit at {}", self.when),
                    extra_headers: vec![],
                }))
                .unwrap()
        }
    }

    #[test]
    fn test_linear_walk_order() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let c1 = g.commit(&[c0]);
        let c2 = g.commit(&[c1]);

        let ctx = OpContext::background();
        let ids: Vec<ObjectId> = RevWalk::ancestors(&g.odb, &ctx, &[c2], None)
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(ids, vec![c2, c1, c0]);
    }

    #[test]
    fn test_ancestry_and_fast_forward() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let c1 = g.commit(&[c0]);
        let side = g.commit(&[c0]);

        let ctx = OpContext::background();
        assert!(is_ancestor(&g.odb, &ctx, &c0, &c1, None).unwrap());
        assert!(is_ancestor(&g.odb, &ctx, &c1, &c1, None).unwrap());
        assert!(!is_ancestor(&g.odb, &ctx, &c1, &c0, None).unwrap());
        assert!(!is_ancestor(&g.odb, &ctx, &c1, &side, None).unwrap());
        assert!(is_fast_forward(&g.odb, &ctx, &c0, &side, None).unwrap());
    }

    #[test]
    fn test_merge_base() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let c1 = g.commit(&[c0]);
        let a = g.commit(&[c1]);
        let b = g.commit(&[c1]);
        let unrelated = g.commit(&[]);

        let ctx = OpContext::background();
        assert_eq!(merge_base(&g.odb, &ctx, &a, &b, None).unwrap(), Some(c1));
        assert_eq!(merge_base(&g.odb, &ctx, &a, &c0, None).unwrap(), Some(c0));
        assert_eq!(merge_base(&g.odb, &ctx, &a, &unrelated, None).unwrap(), None);
    }

    #[test]
    fn test_walk_range() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let c1 = g.commit(&[c0]);
        let c2 = g.commit(&[c1]);
        let c3 = g.commit(&[c2]);

        let ctx = OpContext::background();
        let range: Vec<ObjectId> = walk_range(&g.odb, &ctx, &[c1], &[c3], None)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(range, vec![c3, c2]);
    }

    #[test]
    fn test_symmetric_difference_excludes_common_history() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let a1 = g.commit(&[c0]);
        let a2 = g.commit(&[a1]);
        let b1 = g.commit(&[c0]);

        let ctx = OpContext::background();
        let diff: HashSet<ObjectId> = walk_symmetric_difference(&g.odb, &ctx, &a2, &b1, None)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(diff, HashSet::from([a1, a2, b1]));
    }

    #[test]
    fn test_shallow_boundary_stops_walks() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let c1 = g.commit(&[c0]);
        let c2 = g.commit(&[c1]);

        // With c1 as the shallow marker, c0 is never visited even though it
        // exists locally.
        let ctx = OpContext::background();
        let ids: Vec<ObjectId> = RevWalk::ancestors(&g.odb, &ctx, &[c2], Some(c1))
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(ids, vec![c2, c1]);
        assert!(!is_ancestor(&g.odb, &ctx, &c0, &c2, Some(c1)).unwrap());
    }

    #[test]
    fn test_cancellation_propagates() {
        let mut g = Graph::new();
        let c0 = g.commit(&[]);
        let ctx = OpContext::background();
        let mut walk = RevWalk::ancestors(&g.odb, &ctx, &[c0], None).unwrap();
        ctx.cancel();
        assert!(walk.next().unwrap().is_err());
    }
}

//! The concurrent lock-coupling binary search tree engine.
//!
//! Every node is protected by its own [`node_lock::RwLock`]; the tree is
//! navigated with hand-over-hand (lock-coupling) traversal so operations on
//! keys in disjoint subtrees proceed without contending on a single global
//! lock. The sentinel root (empty name, empty value) anchors the top of the
//! tree and is never removed, removing the root-replacement special case
//! from `add`/`remove`.

use std::fmt;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::node_lock::RwLock;

/// A single entry in the tree: an owned key, an owned value, and the two
/// child links. Guarded as a unit by `lock` — the only mutators of a node's
/// fields are `add` (a child pointer of the *parent*, under the parent's
/// write lock) and `remove` (a child pointer of the parent, and the
/// name/value of the spliced-out successor, under the relevant write
/// locks).
struct Node {
    lock: RwLock<NodeInner>,
}

struct NodeInner {
    name: String,
    value: String,
    left: Link,
    right: Link,
}

type Link = Option<Arc<Node>>;

/// Which child edge of a node a key falls on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Left,
    Right,
}

impl NodeInner {
    fn side_for(&self, name: &str) -> Side {
        if name < self.name.as_str() {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn child(&self, side: Side) -> Link {
        match side {
            Side::Left => self.left.clone(),
            Side::Right => self.right.clone(),
        }
    }

    fn set_child(&mut self, side: Side, child: Link) {
        match side {
            Side::Left => self.left = child,
            Side::Right => self.right = child,
        }
    }
}

impl Drop for Node {
    /// Unlinks and drops this node's children iteratively rather than
    /// letting the nested `Option<Arc<Node>>` fields recurse one Rust stack
    /// frame per node. Insertion order is adversary-controlled (spec.md
    /// Non-goals: no balancing), so a sorted run of inserts builds a
    /// right-leaning chain whose naive recursive drop would overflow the
    /// stack; this walks the subtree with an explicit work-list instead.
    ///
    /// Each popped child is unwrapped with `Arc::try_unwrap`: if this was
    /// the last owning reference, its own children are taken and pushed
    /// before it is allowed to drop, so when it does drop (immediately,
    /// falling off the end of the loop body) its fields are already empty
    /// and this same `Drop::drop` reenters trivially rather than recursing.
    /// If another thread still holds a clone mid-traversal, `try_unwrap`
    /// fails and that subtree is left for its own refcount to reach zero
    /// later — correct, since it is not actually being destroyed now.
    fn drop(&mut self) {
        tracing::trace!(name = %self.lock.data_ptr_name_for_log(), "node destroyed");

        let mut pending: Vec<Arc<Node>> = Vec::new();
        let inner = self.lock.get_mut();
        pending.extend(inner.left.take());
        pending.extend(inner.right.take());

        while let Some(child) = pending.pop() {
            if let Ok(mut owned) = Arc::try_unwrap(child) {
                let inner = owned.lock.get_mut();
                pending.extend(inner.left.take());
                pending.extend(inner.right.take());
                // `owned` drops here with both children already taken.
            }
        }
    }
}

impl RwLock<NodeInner> {
    /// Best-effort label for a trace line on destruction; reading through
    /// the raw pointer here is sound because `Drop::drop` runs only when
    /// the last owning `Arc` is gone, i.e. nothing else can be observing
    /// this node's fields concurrently.
    fn data_ptr_name_for_log(&self) -> String {
        unsafe { (*self.data_ptr()).name.clone() }
    }
}

impl Node {
    fn sentinel() -> Arc<Node> {
        Arc::new(Node {
            lock: RwLock::new(NodeInner {
                name: String::new(),
                value: String::new(),
                left: None,
                right: None,
            }),
        })
    }

    /// Allocates a new node with no children. Mirrors the reference
    /// implementation's `node_create`: name and value are copied into owned
    /// buffers, and a failure to reserve space for either unwinds cleanly
    /// (the partially built buffers are simply dropped) without touching
    /// the tree.
    fn try_create(name: &str, value: &str) -> Result<Arc<Node>, TreeError> {
        let mut name_buf = String::new();
        name_buf
            .try_reserve_exact(name.len())
            .map_err(|_| TreeError::AllocationFailed)?;
        name_buf.push_str(name);

        let mut value_buf = String::new();
        value_buf
            .try_reserve_exact(value.len())
            .map_err(|_| TreeError::AllocationFailed)?;
        value_buf.push_str(value);

        Ok(Arc::new(Node {
            lock: RwLock::new(NodeInner {
                name: name_buf,
                value: value_buf,
                left: None,
                right: None,
            }),
        }))
    }
}

/// A node held under either lock mode, bundled with the `Arc` that keeps it
/// alive independent of the lock state. Dropping a `Locked` releases the
/// lock in the same acquire/release discipline as [`node_lock::RwLock`]'s
/// RAII guards; it exists because the lock-coupling search primitive must
/// carry a held lock across a function return, which a borrow-based guard
/// cannot do once its owning `Arc` would otherwise need to outlive the
/// borrow it came from.
enum Locked {
    Read(Arc<Node>),
    Write(Arc<Node>),
}

impl Locked {
    fn read(node: Arc<Node>) -> Self {
        node.lock.read_lock_raw();
        Locked::Read(node)
    }

    fn write(node: Arc<Node>) -> Self {
        node.lock.write_lock_raw();
        Locked::Write(node)
    }

    fn node(&self) -> &Node {
        match self {
            Locked::Read(n) | Locked::Write(n) => n,
        }
    }

    fn arc(&self) -> Arc<Node> {
        match self {
            Locked::Read(n) | Locked::Write(n) => n.clone(),
        }
    }

    fn inner(&self) -> &NodeInner {
        // SAFETY: `self` holds at least a read lock on `self.node()`, which
        // the lock state machine guarantees excludes any concurrent writer.
        unsafe { &*self.node().lock.data_ptr() }
    }

    fn inner_mut(&mut self) -> &mut NodeInner {
        match self {
            // SAFETY: a write lock on `self.node()` is held, which the lock
            // state machine guarantees excludes any concurrent reader or
            // writer.
            Locked::Write(n) => unsafe { &mut *n.lock.data_ptr() },
            Locked::Read(_) => unreachable!("inner_mut called on a read-locked node"),
        }
    }
}

impl Drop for Locked {
    fn drop(&mut self) {
        match self {
            Locked::Read(n) => n.lock.read_unlock_raw(),
            Locked::Write(n) => n.lock.write_unlock_raw(),
        }
    }
}

/// The outcome of rewriting the edge that a successor walk is currently
/// addressing — the `pnext` of the reference implementation, modeled as an
/// accessor rather than raw pointer arithmetic.
enum Edge {
    /// The edge is `target`'s own right-child slot; `target` is still
    /// write-locked by the caller, so this can be rewritten through the
    /// ordinary `Locked` API.
    TargetRight,
    /// The edge is the left-child slot of a node whose write lock has
    /// already been released during the successor walk. Rewriting it
    /// through a raw pointer is sound only because `target` remains
    /// write-locked for the duration of the walk, which blocks every other
    /// operation from reaching into this subtree (see `splice_successor`).
    PriorLeft(Arc<Node>),
}

/// Result of the write-mode search: the parent is always write-locked on
/// return; the target is write-locked too if the key was found.
struct WriteSearch {
    parent: Locked,
    target: Option<Locked>,
}

/// Lock-coupling search in read mode (§4.2 "read" row): releases `parent`
/// as soon as the child is secured, and returns with only the target (if
/// found) locked.
fn search_read(name: &str, parent: Locked) -> Option<Locked> {
    let side = parent.inner().side_for(name);
    let next = parent.inner().child(side);

    match next {
        None => {
            drop(parent);
            None
        }
        Some(next_arc) => {
            let next_locked = Locked::read(next_arc);
            drop(parent);

            if next_locked.inner().name == name {
                Some(next_locked)
            } else {
                search_read(name, next_locked)
            }
        }
    }
}

/// Lock-coupling search in write mode (§4.2 "write" row): acquires the
/// child's write lock before releasing the parent, and releases the parent
/// only once it is known not to be the parent of the eventual target.
fn search_write(name: &str, parent: Locked) -> WriteSearch {
    let side = parent.inner().side_for(name);
    let next = parent.inner().child(side);

    match next {
        None => WriteSearch {
            parent,
            target: None,
        },
        Some(next_arc) => {
            let next_locked = Locked::write(next_arc);

            if next_locked.inner().name == name {
                WriteSearch {
                    parent,
                    target: Some(next_locked),
                }
            } else {
                drop(parent);
                search_write(name, next_locked)
            }
        }
    }
}

/// Errors observable at the core boundary (§7).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    /// The empty string is reserved for the sentinel root; callers must
    /// never query/add/remove it (§9 open question, resolved).
    #[error("key must not be the empty string")]
    EmptyKey,
    /// Resource exhaustion while allocating a new node's buffers, reported
    /// distinctly from "already present" (§9 open question, resolved).
    #[error("allocation failed while creating a new node")]
    AllocationFailed,
}

/// Outcome of [`Tree::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Found(String),
    NotFound,
}

/// Outcome of [`Tree::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

/// Outcome of [`Tree::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotPresent,
}

/// The shared, concurrent key-value store. Cheaply cloneable via the
/// `Arc<Node>` root; typical usage wraps a single `Tree` in an `Arc` and
/// shares it across worker threads (see `src/bin/dbsrv.rs`).
pub struct Tree {
    root: Arc<Node>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree").finish_non_exhaustive()
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree {
            root: Node::sentinel(),
        }
    }

    fn check_key(name: &str) -> Result<(), TreeError> {
        if name.is_empty() {
            Err(TreeError::EmptyKey)
        } else {
            Ok(())
        }
    }

    /// Read-locks the sentinel, searches in read mode, and copies the value
    /// out before releasing the target's lock (§4.3).
    pub fn query(&self, name: &str) -> Result<QueryOutcome, TreeError> {
        Self::check_key(name)?;
        tracing::trace!(%name, "query");

        let root_locked = Locked::read(self.root.clone());
        match search_read(name, root_locked) {
            Some(target) => {
                let value = target.inner().value.clone();
                drop(target);
                Ok(QueryOutcome::Found(value))
            }
            None => Ok(QueryOutcome::NotFound),
        }
    }

    /// Write-locks the sentinel, searches in write mode, and either reports
    /// the existing key or attaches a freshly allocated node to the
    /// would-be parent (§4.4).
    pub fn add(&self, name: &str, value: &str) -> Result<AddOutcome, TreeError> {
        Self::check_key(name)?;
        tracing::trace!(%name, "add");

        let root_locked = Locked::write(self.root.clone());
        let WriteSearch { mut parent, target } = search_write(name, root_locked);

        if let Some(target) = target {
            drop(target);
            drop(parent);
            return Ok(AddOutcome::AlreadyPresent);
        }

        let new_node = match Node::try_create(name, value) {
            Ok(node) => node,
            Err(e) => {
                drop(parent);
                tracing::warn!(%name, error = %e, "failed to allocate node");
                return Err(e);
            }
        };

        let side = parent.inner().side_for(name);
        parent.inner_mut().set_child(side, Some(new_node));
        drop(parent);

        Ok(AddOutcome::Added)
    }

    /// Write-locks the sentinel, searches in write mode, and either reports
    /// the absent key or unlinks the target, handling all three structural
    /// cases of §4.5.
    pub fn remove(&self, name: &str) -> Result<RemoveOutcome, TreeError> {
        Self::check_key(name)?;
        tracing::trace!(%name, "remove");

        let root_locked = Locked::write(self.root.clone());
        let WriteSearch { mut parent, target } = search_write(name, root_locked);

        let mut target = match target {
            Some(target) => target,
            None => {
                drop(parent);
                return Ok(RemoveOutcome::NotPresent);
            }
        };

        let side = parent.inner().side_for(&target.inner().name);
        let has_left = target.inner().left.is_some();
        let has_right = target.inner().right.is_some();

        if !has_right {
            let left = target.inner_mut().left.take();
            parent.inner_mut().set_child(side, left);
            drop(target);
            drop(parent);
        } else if !has_left {
            let right = target.inner_mut().right.take();
            parent.inner_mut().set_child(side, right);
            drop(target);
            drop(parent);
        } else {
            // Two-children case: parent is no longer structurally involved.
            drop(parent);
            Self::splice_successor(target);
        }

        tracing::debug!(%name, "removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Splices the in-order successor of `target` into `target`'s place by
    /// swapping key/value ownership, per §4.5's two-children case. `target`
    /// remains write-locked for the whole walk: it is the anchor that
    /// prevents any other writer from observing an inconsistent
    /// intermediate state of the right subtree's left spine, since reaching
    /// into that subtree at all requires passing through `target` with a
    /// write lock, which no other thread can obtain while we hold it.
    fn splice_successor(mut target: Locked) {
        let right_arc = target
            .inner()
            .right
            .clone()
            .expect("two-children case guarantees a right child");

        let mut next = Locked::write(right_arc);
        let mut edge = Edge::TargetRight;

        loop {
            let left_child = next.inner().left.clone();
            let Some(left_arc) = left_child else {
                break;
            };

            let next_left_locked = Locked::write(left_arc);
            let prior_arc = next.arc();
            drop(next);
            edge = Edge::PriorLeft(prior_arc);
            next = next_left_locked;
        }

        mem::swap(&mut target.inner_mut().name, &mut next.inner_mut().name);
        mem::swap(&mut target.inner_mut().value, &mut next.inner_mut().value);
        let successor_right = next.inner_mut().right.take();

        match edge {
            Edge::TargetRight => {
                target.inner_mut().right = successor_right;
            }
            Edge::PriorLeft(owner_arc) => {
                // SAFETY: see `Edge::PriorLeft`'s documentation above.
                unsafe {
                    (*owner_arc.lock.data_ptr()).left = successor_right;
                }
            }
        }

        drop(next);
        drop(target);
    }

    /// Quiescent in-order traversal used by tests to check the BST-ordering
    /// and idempotency invariants (§8). Not part of the external interface:
    /// spec.md explicitly excludes range scans/iteration as a feature, and
    /// this only ever runs with no concurrent mutators in flight.
    #[cfg(test)]
    pub(crate) fn in_order_keys(&self) -> Vec<String> {
        fn walk(node: Locked, out: &mut Vec<String>) {
            let (left, right, name) = {
                let inner = node.inner();
                (inner.left.clone(), inner.right.clone(), inner.name.clone())
            };
            if let Some(l) = left {
                walk(Locked::read(l), out);
            }
            if !name.is_empty() {
                out.push(name);
            }
            if let Some(r) = right {
                walk(Locked::read(r), out);
            }
            drop(node);
        }

        let mut out = Vec::new();
        walk(Locked::read(self.root.clone()), &mut out);
        out
    }

    /// Checks lock hygiene (§8 property 6): true once every reachable node
    /// has `num_readers == 0` and is not write-locked. Only meaningful at
    /// quiescence.
    #[cfg(test)]
    pub(crate) fn all_unlocked(&self) -> bool {
        fn walk(node: &Node) -> bool {
            let raw = node.lock.raw(Ordering::SeqCst);
            if raw != 0 {
                return false;
            }
            // SAFETY: called only from tests at quiescence, with no writer
            // or reader lock outstanding (just checked above).
            let inner = unsafe { &*node.lock.data_ptr() };
            inner.left.as_deref().map(walk).unwrap_or(true)
                && inner.right.as_deref().map(walk).unwrap_or(true)
        }
        walk(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    fn found(outcome: Result<QueryOutcome, TreeError>) -> Option<String> {
        match outcome.unwrap() {
            QueryOutcome::Found(v) => Some(v),
            QueryOutcome::NotFound => None,
        }
    }

    #[test]
    fn add_then_query() {
        let tree = Tree::new();
        assert_eq!(tree.add("apple", "red").unwrap(), AddOutcome::Added);
        assert_eq!(found(tree.query("apple")), Some("red".to_owned()));
    }

    #[test]
    fn duplicate_add_is_noop() {
        let tree = Tree::new();
        assert_eq!(tree.add("apple", "red").unwrap(), AddOutcome::Added);
        assert_eq!(
            tree.add("apple", "green").unwrap(),
            AddOutcome::AlreadyPresent
        );
        assert_eq!(found(tree.query("apple")), Some("red".to_owned()));
    }

    #[test]
    fn query_and_remove_absent_key() {
        let tree = Tree::new();
        assert_eq!(found(tree.query("banana")), None);
        assert_eq!(
            tree.remove("banana").unwrap(),
            RemoveOutcome::NotPresent
        );
    }

    #[test]
    fn remove_leaf_and_one_child_cases() {
        let tree = Tree::new();
        for (k, v) in [
            ("m", "1"),
            ("f", "2"),
            ("t", "3"),
            ("a", "4"),
            ("h", "5"),
            ("p", "6"),
            ("z", "7"),
        ] {
            assert_eq!(tree.add(k, v).unwrap(), AddOutcome::Added);
        }

        assert_eq!(tree.remove("m").unwrap(), RemoveOutcome::Removed);
        assert_eq!(found(tree.query("m")), None);
        assert_eq!(found(tree.query("p")), Some("6".to_owned()));
        assert_eq!(
            tree.in_order_keys(),
            vec!["a", "f", "h", "p", "t", "z"]
        );
    }

    #[test]
    fn remove_two_children_case() {
        let tree = Tree::new();
        for (k, v) in [
            ("d", "d-val"),
            ("b", "b-val"),
            ("f", "f-val"),
            ("a", "a-val"),
            ("c", "c-val"),
            ("e", "e-val"),
            ("g", "g-val"),
        ] {
            assert_eq!(tree.add(k, v).unwrap(), AddOutcome::Added);
        }

        assert_eq!(tree.remove("d").unwrap(), RemoveOutcome::Removed);
        assert_eq!(
            tree.in_order_keys(),
            vec!["a", "b", "c", "e", "f", "g"]
        );
        assert_eq!(found(tree.query("e")), Some("e-val".to_owned()));
        assert!(tree.all_unlocked());
    }

    #[test]
    fn empty_key_rejected() {
        let tree = Tree::new();
        assert_eq!(tree.query("").unwrap_err(), TreeError::EmptyKey);
        assert_eq!(tree.add("", "v").unwrap_err(), TreeError::EmptyKey);
        assert_eq!(tree.remove("").unwrap_err(), TreeError::EmptyKey);
    }

    /// Builds a right-leaning chain of `n` nodes directly (an `add`-driven
    /// sorted insertion would take this same shape, per spec.md's
    /// Non-goals: no balancing, but costs O(n^2) lock-coupling hops to
    /// build; this wires the child links up front in O(n) instead, since
    /// the chain's *shape* is what the drop path needs, not how it got
    /// built).
    fn build_right_chain(n: usize) -> Tree {
        let mut next: Link = None;
        for i in (0..n).rev() {
            let mut node = Node::try_create(&format!("k{i:08}"), "v").unwrap();
            Arc::get_mut(&mut node).unwrap().lock.get_mut().right = next.take();
            next = Some(node);
        }

        let mut root = Node::sentinel();
        Arc::get_mut(&mut root).unwrap().lock.get_mut().right = next;
        Tree { root }
    }

    /// A sorted run of inserts degenerates into a right-leaning chain (no
    /// balancing, per spec.md's Non-goals); dropping the tree must not
    /// recurse one stack frame per node or this overflows the stack.
    #[test]
    fn drop_does_not_recurse_on_a_deep_chain() {
        let tree = build_right_chain(300_000);
        drop(tree);
    }

    #[test]
    fn concurrent_random_ops_preserve_ordering() {
        let tree = Arc::new(Tree::new());
        const THREADS: usize = 4;
        const OPS: usize = 2_000;
        const KEYSPACE: usize = 50;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let tree = tree.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..OPS {
                        let key = format!("k{:03}", rng.gen_range(0..KEYSPACE));
                        match rng.gen_range(0..3) {
                            0 => {
                                let _ = tree.add(&key, "v");
                            }
                            1 => {
                                let _ = tree.remove(&key);
                            }
                            _ => {
                                let _ = tree.query(&key);
                            }
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let keys = tree.in_order_keys();
        let sorted: BTreeSet<_> = keys.iter().cloned().collect();
        assert_eq!(keys.len(), sorted.len(), "keys must be unique");
        assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "in-order traversal must be strictly increasing"
        );
        assert!(tree.all_unlocked());
    }
}

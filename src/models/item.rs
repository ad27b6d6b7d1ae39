//! The item tree: a seed URL and everything discovered from it.
//!
//! An [`Item`] records the provenance of every URL in one crawl subtree.
//! The seed is the root; children are assets and outlinks discovered while
//! processing their parent. The tree is arena-backed: the item owns a flat
//! vector of nodes and parent/child links are indices into it, so dropping
//! a seed drops all descendants and no reference cycles exist.
//!
//! Consistency is part of the contract: every constructor and mutator
//! re-validates the invariants, and a violating tree never escapes them.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use super::url::{Url, UrlKind};

/// Index of a node within its item's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of an item node in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Initial state, whether from the queue, HQ, or feedback.
    Fresh,
    /// The URL has been parsed and validated.
    PreProcessed,
    /// A response has been fetched and attached.
    Archived,
    /// Post-processing finished without redirects or discoveries.
    PostProcessed,
    /// The item failed; the error is attached to the node.
    Failed,
    /// Terminal: the source has been told this item is done.
    Completed,
    /// Post-processing observed a redirect and attached the target URL.
    GotRedirected,
    /// Post-processing discovered child URLs.
    GotChildren,
}

impl ItemStatus {
    /// Returns the lowercase label used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::PreProcessed => "pre_processed",
            Self::Archived => "archived",
            Self::PostProcessed => "post_processed",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::GotRedirected => "got_redirected",
            Self::GotChildren => "got_children",
        }
    }

    /// True for states no stage may move an item out of.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// No state is skipped, except that any non-terminal state may fail.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        if next == Self::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Fresh, Self::PreProcessed)
                | (Self::PreProcessed, Self::Archived)
                | (
                    Self::Archived,
                    Self::PostProcessed | Self::GotRedirected | Self::GotChildren
                )
                | (
                    Self::PostProcessed | Self::GotRedirected | Self::GotChildren,
                    Self::Completed
                )
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an item entered the pipeline from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSource {
    /// Inserted directly, source not otherwise defined.
    Insert,
    /// Pulled from the local queue.
    Queue,
    /// Pulled from the remote coordinator.
    Hq,
    /// Generated by post-processing (children, redirects).
    Postprocess,
    /// Re-injected by the feedback loop.
    Feedback,
}

impl ItemSource {
    /// Returns the lowercase label used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Queue => "queue",
            Self::Hq => "hq",
            Self::Postprocess => "postprocess",
            Self::Feedback => "feedback",
        }
    }
}

impl fmt::Display for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The first violated consistency invariant found in a tree.
///
/// Any of these indicates a bug in the mutating code, not bad input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyViolation {
    /// A node carries an empty URL.
    #[error("node {node} has an empty url")]
    EmptyUrl {
        /// Offending node.
        node: NodeId,
    },

    /// A node carries an empty identifier.
    #[error("node {node} has an empty id")]
    EmptyId {
        /// Offending node.
        node: NodeId,
    },

    /// A non-seed node has no parent.
    #[error("node {node} is a child but has no parent")]
    ChildWithoutParent {
        /// Offending node.
        node: NodeId,
    },

    /// A seed node has a parent.
    #[error("node {node} is a seed but has a parent")]
    SeedWithParent {
        /// Offending node.
        node: NodeId,
    },

    /// A non-seed node carries seed provenance.
    #[error("node {node} is a child but has a seed_via")]
    SeedViaOnChild {
        /// Offending node.
        node: NodeId,
    },

    /// Parent and child do not reference each other.
    #[error("nodes {parent} and {child} are not bidirectionally linked")]
    BrokenLink {
        /// Parent side of the link.
        parent: NodeId,
        /// Child side of the link.
        child: NodeId,
    },

    /// A child's hop count is neither its parent's nor parent's + 1.
    #[error("node {node} has {hops} hops but its parent has {parent_hops}")]
    HopsOutOfRange {
        /// Offending node.
        node: NodeId,
        /// The child's hop count.
        hops: u32,
        /// The parent's hop count.
        parent_hops: u32,
    },
}

/// Errors from item tree operations.
#[derive(Debug, Clone, Error)]
pub enum ItemError {
    /// The operation is only valid on a seed node.
    #[error("item is not a seed")]
    NotASeed,

    /// Hop deltas are 0 (inherit) or 1 (increment), nothing else.
    #[error("invalid hop delta {0}: must be 0 or 1")]
    InvalidHopDelta(u32),

    /// The state machine rejects this transition.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ItemStatus,
        /// Requested state.
        to: ItemStatus,
    },

    /// A mutation left the tree inconsistent. Fatal: indicates a bug.
    #[error("item consistency violated: {0}")]
    Inconsistent(#[from] ConsistencyViolation),
}

/// One node of the item tree.
#[derive(Debug)]
pub struct Node {
    id: String,
    url: Url,
    seed: bool,
    seed_via: Option<String>,
    kind: UrlKind,
    status: ItemStatus,
    source: ItemSource,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    redirection: Option<Url>,
    pending_children: Vec<Url>,
    children_captured: usize,
    err: Option<String>,
}

impl Node {
    /// Returns the unique identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a short prefix of the identifier for logging.
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(5)]
    }

    /// Returns the URL record.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the URL record mutably.
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// True for the root of a crawl subtree.
    #[must_use]
    pub fn is_seed(&self) -> bool {
        self.seed
    }

    /// Seed provenance; non-empty only on seeds.
    #[must_use]
    pub fn seed_via(&self) -> Option<&str> {
        self.seed_via.as_deref()
    }

    /// Returns the URL classification.
    #[must_use]
    pub fn kind(&self) -> UrlKind {
        self.kind
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        self.status
    }

    /// Returns where the item entered the pipeline from.
    #[must_use]
    pub fn source(&self) -> ItemSource {
        self.source
    }

    /// Returns the parent node, `None` iff this is the seed.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns the ordered child nodes.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Returns the attached redirection target, if any.
    #[must_use]
    pub fn redirection(&self) -> Option<&Url> {
        self.redirection.as_ref()
    }

    /// Attaches or clears the redirection target.
    pub fn set_redirection(&mut self, redirection: Option<Url>) {
        self.redirection = redirection;
    }

    /// Takes the redirection target out of the node.
    pub fn take_redirection(&mut self) -> Option<Url> {
        self.redirection.take()
    }

    /// Child URLs handed over by the archiver, not yet tree nodes.
    #[must_use]
    pub fn pending_children(&self) -> &[Url] {
        &self.pending_children
    }

    /// Hands over a child URL discovered by the archiver.
    pub fn push_pending_child(&mut self, url: Url) {
        self.pending_children.push(url);
    }

    /// Takes the handed-over child URLs.
    pub fn take_pending_children(&mut self) -> Vec<Url> {
        std::mem::take(&mut self.pending_children)
    }

    /// Number of children the archiver already captured itself.
    #[must_use]
    pub fn children_captured(&self) -> usize {
        self.children_captured
    }

    /// Records children captured by the archiver.
    pub fn set_children_captured(&mut self, count: usize) {
        self.children_captured = count;
    }

    /// Last observed error, informational only.
    #[must_use]
    pub fn err(&self) -> Option<&str> {
        self.err.as_deref()
    }
}

/// A seed item and the subtree it exclusively owns.
///
/// Mutated only by the stage currently holding it; ownership passes
/// between stages via channels, so no locks are needed.
#[derive(Debug)]
pub struct Item {
    nodes: Vec<Node>,
    queue_id: Option<String>,
}

impl Item {
    /// Creates a seed item rooted at `url`.
    ///
    /// `via` is free-text provenance (where the seed came from).
    #[must_use]
    pub fn new_seed(url: Url, via: Option<String>, source: ItemSource) -> Self {
        let root = Node {
            id: Uuid::new_v4().to_string(),
            url,
            seed: true,
            seed_via: via.filter(|via| !via.is_empty()),
            kind: UrlKind::Seed,
            status: ItemStatus::Fresh,
            source,
            parent: None,
            children: Vec::new(),
            redirection: None,
            pending_children: Vec::new(),
            children_captured: 0,
            err: None,
        };
        Self {
            nodes: vec![root],
            queue_id: None,
        }
    }

    /// Records the durable source row this item was claimed from, so the
    /// feedback loop can mark it done on completion.
    #[must_use]
    pub fn with_queue_id(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    /// Returns the durable source row id, if the item was claimed from one.
    #[must_use]
    pub fn queue_id(&self) -> Option<&str> {
        self.queue_id.as_deref()
    }

    /// Returns the seed root.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Returns the number of nodes in the tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a node by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this item; ids are not portable
    /// across trees.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Returns a node mutably.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this item.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Appends a child under `parent`.
    ///
    /// The child's hop count is derived from the parent's per the delta:
    /// 0 inherits (assets, depth-0 same-domain outlinks), 1 increments
    /// (all other outlinks). The new node starts `Fresh` with source
    /// `Postprocess`, and the whole tree is re-validated before the id is
    /// handed back.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::InvalidHopDelta`] for deltas other than 0 or 1,
    /// or [`ItemError::Inconsistent`] if the mutation violated an
    /// invariant (a bug in the caller).
    pub fn add_child(
        &mut self,
        parent: NodeId,
        mut url: Url,
        kind: UrlKind,
        hop_delta: u32,
    ) -> Result<NodeId, ItemError> {
        if hop_delta > 1 {
            return Err(ItemError::InvalidHopDelta(hop_delta));
        }
        let parent_hops = self.node(parent).url().hops();
        url.set_hops(parent_hops + hop_delta);

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id: Uuid::new_v4().to_string(),
            url,
            seed: false,
            seed_via: None,
            kind,
            status: ItemStatus::Fresh,
            source: ItemSource::Postprocess,
            parent: Some(parent),
            children: Vec::new(),
            redirection: None,
            pending_children: Vec::new(),
            children_captured: 0,
            err: None,
        });
        self.nodes[parent.0].children.push(id);

        self.check_consistency()?;
        Ok(id)
    }

    /// Advances a node through the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::InvalidTransition`] when the move is not
    /// permitted; the node is left unchanged.
    pub fn set_status(&mut self, id: NodeId, next: ItemStatus) -> Result<(), ItemError> {
        let node = &mut self.nodes[id.0];
        if !node.status.can_transition_to(next) {
            return Err(ItemError::InvalidTransition {
                from: node.status,
                to: next,
            });
        }
        node.status = next;
        Ok(())
    }

    /// Attaches an error message to a node. Informational only; advancing
    /// to `Failed` is a separate [`set_status`](Self::set_status) call.
    pub fn set_error(&mut self, id: NodeId, err: impl Into<String>) {
        self.nodes[id.0].err = Some(err.into());
    }

    /// Walks parent links from `id` up to the seed root.
    #[must_use]
    pub fn seed_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            current = parent;
        }
        current
    }

    /// Distance of `id` from the seed: 0 for the seed itself.
    #[must_use]
    pub fn depth(&self, id: NodeId) -> u32 {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Depth of the deepest descendant below `id`: 0 for a leaf.
    #[must_use]
    pub fn max_depth_from(&self, id: NodeId) -> u32 {
        self.nodes[id.0]
            .children
            .iter()
            .map(|&child| 1 + self.max_depth_from(child))
            .max()
            .unwrap_or(0)
    }

    /// Depth of the deepest node in the tree.
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth_from(self.root())
    }

    /// Returns all nodes at `level` below `from`, which must be the seed.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::NotASeed`] when `from` is not the seed root.
    pub fn nodes_at_level(&self, from: NodeId, level: u32) -> Result<Vec<NodeId>, ItemError> {
        if !self.nodes[from.0].seed {
            return Err(ItemError::NotASeed);
        }
        let mut result = Vec::new();
        self.collect_at_level(from, 0, level, &mut result);
        Ok(result)
    }

    fn collect_at_level(&self, node: NodeId, current: u32, target: u32, out: &mut Vec<NodeId>) {
        if current == target {
            out.push(node);
            return;
        }
        for &child in &self.nodes[node.0].children {
            self.collect_at_level(child, current + 1, target, out);
        }
    }

    /// Iterates over all node ids in the tree.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Checks the consistency invariants over the whole tree, returning
    /// the first violation found.
    ///
    /// # Errors
    ///
    /// Returns the violated [`ConsistencyViolation`]; any violation is a
    /// bug in the mutating code.
    pub fn check_consistency(&self) -> Result<(), ConsistencyViolation> {
        for (index, node) in self.nodes.iter().enumerate() {
            let id = NodeId(index);
            if node.url.raw().is_empty() {
                return Err(ConsistencyViolation::EmptyUrl { node: id });
            }
            if node.id.is_empty() {
                return Err(ConsistencyViolation::EmptyId { node: id });
            }
            match (node.seed, node.parent) {
                (false, None) => {
                    return Err(ConsistencyViolation::ChildWithoutParent { node: id })
                }
                (true, Some(_)) => return Err(ConsistencyViolation::SeedWithParent { node: id }),
                _ => {}
            }
            if !node.seed && node.seed_via.is_some() {
                return Err(ConsistencyViolation::SeedViaOnChild { node: id });
            }
            if let Some(parent) = node.parent {
                let parent_node = &self.nodes[parent.0];
                if !parent_node.children.contains(&id) {
                    return Err(ConsistencyViolation::BrokenLink { parent, child: id });
                }
                let hops = node.url.hops();
                let parent_hops = parent_node.url.hops();
                if hops != parent_hops && hops != parent_hops + 1 {
                    return Err(ConsistencyViolation::HopsOutOfRange {
                        node: id,
                        hops,
                        parent_hops,
                    });
                }
            }
            for &child in &node.children {
                let linked = self
                    .nodes
                    .get(child.0)
                    .is_some_and(|child_node| child_node.parent == Some(id));
                if !linked {
                    return Err(ConsistencyViolation::BrokenLink { parent: id, child });
                }
            }
        }
        Ok(())
    }
}

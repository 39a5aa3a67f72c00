//! Topic tree
//!
//! A hierarchy of concrete topics. Each node knows its fully-qualified name,
//! an optional retained message and the subscribers registered at exactly
//! that node. Wildcards are never stored; they are evaluated by `resolve`
//! against whatever nodes already exist.
//!
//! Children are kept in insertion order so that wildcard fan-out visits
//! them in the order the topics were created.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::validation::TopicLevel;

/// Names of the nodes a pattern resolved to, in fan-out order
pub type Resolved = SmallVec<[String; 8]>;

/// One level of the topic hierarchy
#[derive(Debug)]
pub struct TopicNode<S> {
    name: String,
    retained: Option<String>,
    subscribers: Vec<S>,
    children: Vec<TopicNode<S>>,
    /// Segment -> position in `children`
    index: AHashMap<CompactString, usize>,
}

impl<S> TopicNode<S> {
    fn new(name: String) -> Self {
        Self {
            name,
            retained: None,
            subscribers: Vec::new(),
            children: Vec::new(),
            index: AHashMap::new(),
        }
    }

    /// Fully-qualified name (segments joined with `/`)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retained(&self) -> Option<&str> {
        self.retained.as_deref()
    }

    /// Replace the retained message, returning the previous one
    pub fn set_retained(&mut self, message: String) -> Option<String> {
        self.retained.replace(message)
    }

    pub fn subscribers(&self) -> &[S] {
        &self.subscribers
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn child_name(&self, is_root: bool, segment: &str) -> String {
        if is_root {
            segment.to_string()
        } else {
            format!("{}/{}", self.name, segment)
        }
    }

    fn add_child(&mut self, segment: &str, name: String) -> usize {
        let idx = self.children.len();
        self.children.push(TopicNode::new(name));
        self.index.insert(CompactString::new(segment), idx);
        idx
    }

    fn is_prunable(&self) -> bool {
        self.retained.is_none() && self.subscribers.is_empty() && self.children.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, child) in self.children.iter().enumerate() {
            let segment = child.name.rsplit('/').next().unwrap_or_default();
            self.index.insert(CompactString::new(segment), i);
        }
    }
}

impl<S: Copy + PartialEq> TopicNode<S> {
    pub fn has_subscriber(&self, subscriber: S) -> bool {
        self.subscribers.contains(&subscriber)
    }

    /// Add a subscriber; returns false if it was already present
    pub fn add_subscriber(&mut self, subscriber: S) -> bool {
        if self.has_subscriber(subscriber) {
            return false;
        }
        self.subscribers.push(subscriber);
        true
    }

    /// Remove a subscriber; returns false if it was not present
    pub fn remove_subscriber(&mut self, subscriber: S) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| *s != subscriber);
        self.subscribers.len() != before
    }
}

/// Outcome of a successful resolve
#[derive(Debug, Default)]
pub struct Resolution {
    /// Matched nodes in fan-out order
    pub matched: Resolved,
    /// Nodes created during this resolve, in creation order
    pub created: Vec<String>,
}

/// Hierarchical topic namespace
#[derive(Debug)]
pub struct TopicTree<S> {
    root: TopicNode<S>,
    len: usize,
}

impl<S> TopicTree<S> {
    pub fn new() -> Self {
        Self {
            root: TopicNode::new(String::new()),
            len: 0,
        }
    }

    /// Number of topic nodes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolve a parsed pattern into the concrete nodes it denotes
    ///
    /// Literal levels descend into the named child, creating it when
    /// `create` is set and the pattern has no wildcard. A missing literal
    /// on the direct path fails with the name that was looked up; inside a
    /// wildcard fan-out it only prunes that branch.
    pub fn resolve(&mut self, levels: &[TopicLevel<'_>], create: bool) -> Result<Resolution, String> {
        let create = create && levels.iter().all(|l| matches!(l, TopicLevel::Normal(_)));
        let mut resolution = Resolution::default();
        if levels.is_empty() {
            return Ok(resolution);
        }
        Self::resolve_recursive(&mut self.root, true, levels, create, true, &mut resolution)?;
        self.len += resolution.created.len();
        Ok(resolution)
    }

    fn resolve_recursive(
        node: &mut TopicNode<S>,
        is_root: bool,
        levels: &[TopicLevel<'_>],
        create: bool,
        direct: bool,
        resolution: &mut Resolution,
    ) -> Result<(), String> {
        let Some((level, rest)) = levels.split_first() else {
            return Ok(());
        };

        match level {
            TopicLevel::Normal(segment) => {
                let existing = node.index.get(*segment).copied();
                let idx = match existing {
                    Some(idx) => idx,
                    None => {
                        let name = node.child_name(is_root, segment);
                        if !create {
                            return if direct { Err(name) } else { Ok(()) };
                        }
                        tracing::debug!("Creating topic {}", name);
                        resolution.created.push(name.clone());
                        node.add_child(segment, name)
                    }
                };
                let child = &mut node.children[idx];
                if rest.is_empty() {
                    resolution.matched.push(child.name.clone());
                    Ok(())
                } else {
                    Self::resolve_recursive(child, false, rest, create, direct, resolution)
                }
            }
            TopicLevel::SingleWildcard => {
                for child in node.children.iter_mut() {
                    if rest.is_empty() {
                        resolution.matched.push(child.name.clone());
                    } else {
                        Self::resolve_recursive(child, false, rest, false, false, resolution)?;
                    }
                }
                Ok(())
            }
            TopicLevel::MultiWildcard => {
                Self::collect_descendants(node, &mut resolution.matched);
                Ok(())
            }
        }
    }

    /// Pre-order: each child, then that child's subtree
    fn collect_descendants(node: &TopicNode<S>, out: &mut Resolved) {
        for child in &node.children {
            out.push(child.name.clone());
            Self::collect_descendants(child, out);
        }
    }

    /// Look up a node by its fully-qualified name
    pub fn get(&self, name: &str) -> Option<&TopicNode<S>> {
        let mut node = &self.root;
        for segment in name.split('/') {
            let idx = *node.index.get(segment)?;
            node = &node.children[idx];
        }
        Some(node)
    }

    /// Look up a node mutably by its fully-qualified name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TopicNode<S>> {
        let mut node = &mut self.root;
        for segment in name.split('/') {
            let idx = *node.index.get(segment)?;
            node = &mut node.children[idx];
        }
        Some(node)
    }

    /// All topic names in pre-order
    pub fn names(&self) -> Vec<String> {
        let mut out = Resolved::new();
        Self::collect_descendants(&self.root, &mut out);
        out.into_vec()
    }

    /// Visit every node mutably
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut TopicNode<S>),
    {
        fn walk<S, F: FnMut(&mut TopicNode<S>)>(node: &mut TopicNode<S>, f: &mut F) {
            for child in node.children.iter_mut() {
                f(child);
                walk(child, f);
            }
        }
        walk(&mut self.root, &mut f);
    }

    /// Remove every node that has no subscribers, no retained message and
    /// no children, repeating up the hierarchy. Returns the number removed.
    pub fn prune_empty(&mut self) -> usize {
        let removed = Self::prune_recursive(&mut self.root);
        self.len -= removed;
        removed
    }

    fn prune_recursive(node: &mut TopicNode<S>) -> usize {
        let mut removed = 0;
        for child in node.children.iter_mut() {
            removed += Self::prune_recursive(child);
        }
        let before = node.children.len();
        node.children.retain(|c| !c.is_prunable());
        if node.children.len() != before {
            removed += before - node.children.len();
            node.rebuild_index();
        }
        removed
    }

    /// Drop every node
    pub fn clear(&mut self) {
        self.root = TopicNode::new(String::new());
        self.len = 0;
    }
}

impl<S: Copy + PartialEq> TopicTree<S> {
    /// Remove a subscriber from every node, returning how many lists changed
    pub fn remove_subscriber_everywhere(&mut self, subscriber: S) -> usize {
        let mut count = 0;
        self.for_each_mut(|node| {
            if node.remove_subscriber(subscriber) {
                count += 1;
            }
        });
        count
    }
}

impl<S> Default for TopicTree<S> {
    fn default() -> Self {
        Self::new()
    }
}

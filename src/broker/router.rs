//! Message Router
//!
//! Implements subscribe, unsubscribe, publish and LIST on top of the topic
//! tree. A single lock guards the tree, the standing wildcard patterns and
//! every connection's topic list, so each operation is atomic with respect
//! to the others. Frames are queued with `try_send` after the lock has been
//! released.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, QueueOutcome};
use crate::protocol::Frame;
use crate::topic::{Resolution, TopicPattern, TopicTree};

/// Topic-level rejections reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    InvalidTopic(&'static str),
    NoSuchTopic(String),
    AlreadySubscribed(String),
    NotSubscribed(String),
    UnknownConnection(ConnectionId),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::InvalidTopic(reason) => write!(f, "invalid topic: {}", reason),
            RouterError::NoSuchTopic(name) => write!(f, "no such topic: {}", name),
            RouterError::AlreadySubscribed(name) => write!(f, "already subscribed to {}", name),
            RouterError::NotSubscribed(name) => write!(f, "not subscribed to {}", name),
            RouterError::UnknownConnection(id) => write!(f, "unknown connection {}", id),
        }
    }
}

impl std::error::Error for RouterError {}

struct RouterState {
    tree: TopicTree<ConnectionId>,
    /// Wildcard subscriptions applied to nodes created later
    standing: Vec<(ConnectionId, TopicPattern)>,
}

/// Routes frames between publishers and subscribers
pub struct MessageRouter {
    state: Mutex<RouterState>,
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            state: Mutex::new(RouterState {
                tree: TopicTree::new(),
                standing: Vec::new(),
            }),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Subscribe a connection to every node `pattern` denotes
    ///
    /// Literal patterns create missing nodes. Wildcard patterns match only
    /// existing nodes and stay registered for nodes created later. Retained
    /// messages on matched nodes are queued to the subscriber as PUBRET.
    /// Returns the number of nodes subscribed.
    pub fn subscribe(&self, id: ConnectionId, pattern: &str) -> Result<usize, RouterError> {
        let pattern = TopicPattern::parse(pattern).map_err(RouterError::InvalidTopic)?;
        let handle = self
            .registry
            .get(id)
            .ok_or(RouterError::UnknownConnection(id))?;

        let mut retained = Vec::new();
        let count = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if pattern.is_wildcard()
                && state
                    .standing
                    .iter()
                    .any(|(sid, p)| *sid == id && *p == pattern)
            {
                return Err(RouterError::AlreadySubscribed(pattern.to_string()));
            }

            let resolution = match state.tree.resolve(&pattern.levels(), true) {
                Ok(resolution) => resolution,
                Err(_) if pattern.is_wildcard() => Resolution::default(),
                Err(missing) => return Err(RouterError::NoSuchTopic(missing)),
            };

            {
                let mut topics = handle.topics.lock();
                if let Some(dup) = resolution.matched.iter().find(|n| topics.contains(n)) {
                    return Err(RouterError::AlreadySubscribed(dup.clone()));
                }

                for name in &resolution.matched {
                    let Some(node) = state.tree.get_mut(name) else {
                        continue;
                    };
                    node.add_subscriber(id);
                    topics.push(name.clone());
                    if let Some(message) = node.retained() {
                        retained.push(Frame::publish(name.as_str(), message, true));
                    }
                }
            }

            if pattern.is_wildcard() {
                state.standing.push((id, pattern.clone()));
            }
            self.apply_standing(state, &resolution.created);
            resolution.matched.len()
        };

        debug!("Connection {} subscribed to {} ({} topics)", id, pattern, count);
        for frame in retained {
            self.deliver(&handle, frame);
        }
        Ok(count)
    }

    /// Unsubscribe a connection from every node `pattern` denotes
    ///
    /// Fails without changing anything if any matched node is not
    /// subscribed. Returns the number of nodes unsubscribed.
    pub fn unsubscribe(&self, id: ConnectionId, pattern: &str) -> Result<usize, RouterError> {
        let pattern = TopicPattern::parse(pattern).map_err(RouterError::InvalidTopic)?;
        let handle = self
            .registry
            .get(id)
            .ok_or(RouterError::UnknownConnection(id))?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let standing = if pattern.is_wildcard() {
            state
                .standing
                .iter()
                .position(|(sid, p)| *sid == id && *p == pattern)
        } else {
            None
        };

        let matched = match state.tree.resolve(&pattern.levels(), false) {
            Ok(resolution) => resolution.matched,
            Err(_) if pattern.is_wildcard() => Default::default(),
            Err(missing) => return Err(RouterError::NoSuchTopic(missing)),
        };

        let mut topics = handle.topics.lock();
        if let Some(missing) = matched.iter().find(|n| !topics.contains(n)) {
            return Err(RouterError::NotSubscribed(missing.clone()));
        }
        if matched.is_empty() && standing.is_none() {
            return Err(RouterError::NotSubscribed(pattern.to_string()));
        }

        for name in &matched {
            if let Some(node) = state.tree.get_mut(name) {
                node.remove_subscriber(id);
            }
            topics.retain(|t| t != name);
        }
        if let Some(idx) = standing {
            state.standing.remove(idx);
        }

        debug!("Connection {} unsubscribed from {} ({} topics)", id, pattern, matched.len());
        Ok(matched.len())
    }

    /// Publish a frame to every node its topic denotes
    ///
    /// Each delivered copy carries the matched node's full name as topic.
    /// With `retain`, the message replaces the retained value of every
    /// matched node. Returns the number of frames queued.
    pub fn publish(&self, frame: &Frame, retain: bool) -> Result<usize, RouterError> {
        let pattern = TopicPattern::parse(&frame.topic).map_err(RouterError::InvalidTopic)?;

        let mut outgoing: Vec<(ConnectionId, Frame)> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let resolution = state
                .tree
                .resolve(&pattern.levels(), true)
                .map_err(RouterError::NoSuchTopic)?;
            self.apply_standing(state, &resolution.created);

            for name in &resolution.matched {
                let Some(node) = state.tree.get_mut(name) else {
                    continue;
                };
                let copy = Frame::new(frame.request.clone(), name.as_str(), frame.message.as_str());
                for &sid in node.subscribers() {
                    outgoing.push((sid, copy.clone()));
                }
                if retain {
                    node.set_retained(frame.message.clone());
                }
            }
        }

        let mut queued = 0;
        let mut stale = Vec::new();
        for (sid, copy) in outgoing {
            let Some(handle) = self.registry.get(sid) else {
                stale.push((sid, copy.topic));
                continue;
            };
            let topic = copy.topic.clone();
            match self.deliver(&handle, copy) {
                QueueOutcome::Queued => queued += 1,
                QueueOutcome::Dropped => {}
                QueueOutcome::Closed => stale.push((sid, topic)),
            }
        }

        if !stale.is_empty() {
            let mut state = self.state.lock();
            for (sid, name) in stale {
                if let Some(node) = state.tree.get_mut(&name) {
                    if node.remove_subscriber(sid) {
                        debug!("Pruned stale subscriber {} from {}", sid, name);
                    }
                }
            }
        }

        trace!("Published to {} ({} frames queued)", frame.topic, queued);
        Ok(queued)
    }

    /// Comma-joined list of the connection's subscribed node names
    pub fn list(&self, id: ConnectionId) -> Result<String, RouterError> {
        let handle = self
            .registry
            .get(id)
            .ok_or(RouterError::UnknownConnection(id))?;
        let _state = self.state.lock();
        let topics = handle.topics.lock();
        Ok(topics.join(", "))
    }

    /// Drop a connection from every subscriber list and standing pattern
    ///
    /// Returns the number of subscriber lists it was removed from.
    pub fn purge(&self, id: ConnectionId) -> usize {
        let mut state = self.state.lock();
        state.standing.retain(|(sid, _)| *sid != id);
        state.tree.remove_subscriber_everywhere(id)
    }

    /// Remove topic nodes with no subscribers, retained value or children
    pub fn prune_empty(&self) -> usize {
        self.state.lock().tree.prune_empty()
    }

    pub fn topic_count(&self) -> usize {
        self.state.lock().tree.len()
    }

    /// Every topic name in pre-order
    pub fn topic_names(&self) -> Vec<String> {
        self.state.lock().tree.names()
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .tree
            .get(topic)
            .and_then(|node| node.retained().map(str::to_string))
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        let state = self.state.lock();
        state
            .tree
            .get(topic)
            .map(|node| node.subscribers().to_vec())
            .unwrap_or_default()
    }

    /// Release the whole topic tree
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.tree.clear();
        state.standing.clear();
    }

    /// Subscribe standing wildcard patterns to freshly created nodes
    fn apply_standing(&self, state: &mut RouterState, created: &[String]) {
        if state.standing.is_empty() {
            return;
        }
        for name in created {
            for (sid, pattern) in &state.standing {
                if !pattern.matches(name) {
                    continue;
                }
                let Some(handle) = self.registry.get(*sid) else {
                    continue;
                };
                let Some(node) = state.tree.get_mut(name) else {
                    continue;
                };
                if node.add_subscriber(*sid) {
                    handle.topics.lock().push(name.clone());
                    debug!("Connection {} subscribed to {} via {}", sid, name, pattern);
                }
            }
        }
    }

    fn deliver(&self, handle: &ConnectionHandle, frame: Frame) -> QueueOutcome {
        let outcome = handle.deliver(frame);
        if outcome == QueueOutcome::Dropped {
            warn!("Outbound queue full for connection {}, frame dropped", handle.id());
        }
        outcome
    }
}

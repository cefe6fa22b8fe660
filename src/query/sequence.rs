//! Causal-chain traversal.
//!
//! Walks `parent_event_id` links downward (children) breadth-first from a root
//! event. Self-referential links are rejected at write time, but longer cycles
//! are not, so traversal carries a visited set and a depth bound and is
//! guaranteed to terminate regardless of what the link graph looks like.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::events::model::BacktestEvent;

#[derive(Debug, Clone, Serialize)]
pub struct SequenceNode {
    pub event: BacktestEvent,
    pub depth: u32,
    pub parent_event_id: Option<String>,
    pub child_event_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSequence {
    pub root_event_id: String,
    pub max_depth: u32,
    /// Nodes in BFS order (root first, then depth 1, ...).
    pub nodes: Vec<SequenceNode>,
    /// True when traversal stopped expanding because of the depth bound.
    pub truncated: bool,
}

/// BFS over the child index built from `events`. `max_depth` 0 returns just
/// the root.
pub fn traverse(events: &[BacktestEvent], root_event_id: &str, max_depth: u32) -> EventSequence {
    let by_id: HashMap<&str, &BacktestEvent> = events
        .iter()
        .map(|e| (e.event_id.as_str(), e))
        .collect();

    // Child index: parent id -> children, in event stream order.
    let mut children: HashMap<&str, Vec<&BacktestEvent>> = HashMap::new();
    for event in events {
        if let Some(parent) = event.parent_event_id.as_deref() {
            children.entry(parent).or_default().push(event);
        }
    }

    let mut nodes = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<(&str, u32)> = VecDeque::new();
    let mut truncated = false;

    if by_id.contains_key(root_event_id) {
        queue.push_back((root_event_id, 0));
        visited.insert(root_event_id);
    }

    while let Some((event_id, depth)) = queue.pop_front() {
        let Some(event) = by_id.get(event_id) else {
            continue;
        };
        let kids = children.get(event_id).map(Vec::as_slice).unwrap_or(&[]);

        if depth < max_depth {
            for child in kids {
                // The visited set makes A -> B -> A safe.
                if visited.insert(child.event_id.as_str()) {
                    queue.push_back((child.event_id.as_str(), depth + 1));
                }
            }
        } else if !kids.is_empty() {
            truncated = true;
        }

        nodes.push(SequenceNode {
            event: (*event).clone(),
            depth,
            parent_event_id: event.parent_event_id.clone(),
            child_event_ids: kids.iter().map(|c| c.event_id.clone()).collect(),
        });
    }

    EventSequence {
        root_event_id: root_event_id.to_string(),
        max_depth,
        nodes,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{Category, EventType, Severity};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn event(secs: u32, parent: Option<&str>) -> BacktestEvent {
        let mut e = BacktestEvent::new(
            "r1",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap(),
            EventType::StateChange,
            Severity::Info,
            Category::Analysis,
            json!({}),
        );
        e.parent_event_id = parent.map(String::from);
        e
    }

    #[test]
    fn test_bfs_order_and_depths() {
        let root = event(1, None);
        let a = event(2, Some(&root.event_id));
        let b = event(3, Some(&root.event_id));
        let a1 = event(4, Some(&a.event_id));
        let events = vec![root.clone(), a.clone(), b.clone(), a1.clone()];

        let seq = traverse(&events, &root.event_id, 10);
        let ids: Vec<_> = seq.nodes.iter().map(|n| n.event.event_id.clone()).collect();
        assert_eq!(ids, vec![root.event_id, a.event_id, b.event_id, a1.event_id]);
        let depths: Vec<_> = seq.nodes.iter().map(|n| n.depth).collect();
        assert_eq!(depths, vec![0, 1, 1, 2]);
        assert!(!seq.truncated);
    }

    #[test]
    fn test_max_depth_truncates() {
        let root = event(1, None);
        let a = event(2, Some(&root.event_id));
        let a1 = event(3, Some(&a.event_id));
        let events = vec![root.clone(), a, a1];

        let seq = traverse(&events, &root.event_id, 1);
        assert_eq!(seq.nodes.len(), 2);
        assert!(seq.truncated);

        let just_root = traverse(&events, &root.event_id, 0);
        assert_eq!(just_root.nodes.len(), 1);
        assert!(just_root.truncated);
    }

    #[test]
    fn test_cycle_terminates() {
        // A -> B -> A, the cycle self-reference checks don't catch.
        let mut a = event(1, None);
        let b = event(2, Some(&a.event_id));
        a.parent_event_id = Some(b.event_id.clone());
        let events = vec![a.clone(), b.clone()];

        let seq = traverse(&events, &a.event_id, 100);
        assert_eq!(seq.nodes.len(), 2);
    }

    #[test]
    fn test_unknown_root_yields_empty() {
        let events = vec![event(1, None)];
        let seq = traverse(&events, "missing", 5);
        assert!(seq.nodes.is_empty());
    }
}

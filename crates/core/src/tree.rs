//! Branching conversation history.
//!
//! A [`BranchTree`] stores every message of one conversation as a flat
//! arena: `id → Node` plus `id → ordered child ids`. Parent links are plain
//! string ids, so the structure has no reference cycles and serializes as-is.
//!
//! The *active path* is the root-to-leaf route currently selected; it is
//! what gets sent to the model. Invariants maintained by every operation:
//!
//! - `active_path[0] == root_id`
//! - each consecutive pair in `active_path` is a registered parent → child edge
//! - every id in `children[x]` has `parent_id == x`
//! - deleting a node deletes its whole subtree
//!
//! Failure policy: operations addressed at an unknown id are no-ops that
//! leave the tree untouched. Only [`BranchTree::append`] fails loudly,
//! because it is the primary write path.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TreeError;
use crate::message::Role;

/// One message in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Sibling navigation direction for [`BranchTree::switch_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
}

/// What [`BranchTree::retry_user_message`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// The user message already had an assistant reply; a parallel
    /// assistant branch was added next to it.
    NewSibling { node_id: String },
    /// The user message had no assistant reply yet; one was created.
    FreshChild { node_id: String },
}

impl RetryOutcome {
    pub fn node_id(&self) -> &str {
        match self {
            Self::NewSibling { node_id } | Self::FreshChild { node_id } => node_id,
        }
    }
}

/// `(j, n)` sibling position for one depth of the active path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchIndicator {
    /// 1-indexed depth in the active path (root = 1)
    pub depth: usize,
    pub node_id: String,
    pub role: Role,
    /// 1-indexed position among siblings
    pub index: usize,
    /// Number of siblings, including this node
    pub count: usize,
}

/// The node graph of one conversation plus its active path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTree {
    root_id: String,
    nodes: BTreeMap<String, Node>,
    children: BTreeMap<String, Vec<String>>,
    active_path: Vec<String>,
}

impl BranchTree {
    /// Create a tree holding only a system root with the given content.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let root_id = Uuid::new_v4().to_string();
        let root = Node {
            id: root_id.clone(),
            parent_id: None,
            role: Role::System,
            content: system_prompt.into(),
            updated_at: Utc::now(),
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(root_id.clone(), root);
        let mut children = BTreeMap::new();
        children.insert(root_id.clone(), Vec::new());
        Self {
            active_path: vec![root_id.clone()],
            root_id,
            nodes,
            children,
        }
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn active_path(&self) -> &[String] {
        &self.active_path
    }

    /// Id of the last node on the active path.
    pub fn active_tail(&self) -> &str {
        self.active_path
            .last()
            .map(String::as_str)
            .unwrap_or(&self.root_id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes on the active path, root first.
    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.active_path.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Ids from the root down to `node_id`, inclusive.
    pub fn path_to(&self, node_id: &str) -> Option<Vec<String>> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(node_id)?;
        loop {
            path.push(cursor.id.clone());
            // Guards against a hand-edited file with a parent cycle.
            if path.len() > self.nodes.len() {
                return None;
            }
            match &cursor.parent_id {
                Some(parent) => cursor = self.nodes.get(parent)?,
                None => break,
            }
        }
        path.reverse();
        Some(path)
    }

    /// `(j, n)` for the node at `depth` (1-indexed, root = 1).
    pub fn branch_indicator(&self, depth: usize) -> Option<(usize, usize)> {
        if depth == 0 || depth > self.active_path.len() {
            return None;
        }
        if depth == 1 {
            return Some((1, 1));
        }
        let current = &self.active_path[depth - 1];
        let siblings = self.children_of(&self.active_path[depth - 2]);
        let index = siblings.iter().position(|id| id == current)?;
        Some((index + 1, siblings.len()))
    }

    /// The indicator for every depth of the active path.
    pub fn branch_table(&self) -> Vec<BranchIndicator> {
        (1..=self.active_path.len())
            .filter_map(|depth| {
                let (index, count) = self.branch_indicator(depth)?;
                let node = self.nodes.get(&self.active_path[depth - 1])?;
                Some(BranchIndicator {
                    depth,
                    node_id: node.id.clone(),
                    role: node.role,
                    index,
                    count,
                })
            })
            .collect()
    }

    // ── Mutations ─────────────────────────────────────────────────────

    /// Add a child under `parent_id` and make it the active tail.
    pub fn append(
        &mut self,
        parent_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<String, TreeError> {
        if !self.nodes.contains_key(parent_id) {
            return Err(TreeError::UnknownNode(parent_id.to_string()));
        }
        let id = self.insert_child(parent_id, role, content.into());
        if self.active_tail() == parent_id {
            self.active_path.push(id.clone());
        } else if let Some(mut path) = self.path_to(parent_id) {
            path.push(id.clone());
            self.active_path = path;
        }
        Ok(id)
    }

    /// Add a child under `node_id`, discarding any active suffix beyond it.
    pub fn append_at(
        &mut self,
        node_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Option<String> {
        let mut path = self.path_to(node_id)?;
        let id = self.insert_child(node_id, role, content.into());
        path.push(id.clone());
        self.active_path = path;
        Some(id)
    }

    /// Move to the previous/next sibling at `depth` (1-indexed).
    ///
    /// `Right` past the last sibling creates a new empty assistant node and
    /// selects it; this is how regeneration produces parallel branches.
    /// Returns the id of the newly selected node.
    pub fn switch_branch(&mut self, depth: usize, direction: Direction) -> Option<String> {
        if depth < 2 || depth > self.active_path.len() {
            return None;
        }
        let current = self.active_path[depth - 1].clone();
        let parent = self.active_path[depth - 2].clone();
        let siblings = self.children.get(&parent)?.clone();
        let index = siblings.iter().position(|id| *id == current)?;

        let selected = match direction {
            Direction::Left => {
                if index == 0 {
                    return None;
                }
                siblings[index - 1].clone()
            }
            Direction::Right => match siblings.get(index + 1) {
                Some(next) => next.clone(),
                None => self.insert_child(&parent, Role::Assistant, String::new()),
            },
        };

        self.active_path.truncate(depth - 1);
        self.active_path.push(selected.clone());
        let tail = self.descend(&selected);
        self.active_path.extend(tail);
        Some(selected)
    }

    /// Remove `node_id` and its entire subtree.
    ///
    /// If the node was on the active path, the path is truncated to its
    /// parent. The root cannot be deleted.
    pub fn delete_branch(&mut self, node_id: &str) -> bool {
        if node_id == self.root_id {
            return false;
        }
        let Some(parent) = self.nodes.get(node_id).map(|n| n.parent_id.clone()) else {
            return false;
        };

        let doomed = self.collect_subtree(node_id);
        for id in &doomed {
            self.nodes.remove(id);
            self.children.remove(id);
        }
        if let Some(siblings) = parent.as_ref().and_then(|p| self.children.get_mut(p)) {
            siblings.retain(|id| id != node_id);
        }
        if let Some(pos) = self.active_path.iter().position(|id| id == node_id) {
            self.active_path.truncate(pos);
        }
        true
    }

    /// Keep `active_path[0..depth)` and delete the subtree that followed.
    pub fn truncate_after(&mut self, depth: usize) -> bool {
        if depth == 0 || depth >= self.active_path.len() {
            return false;
        }
        let doomed = self.active_path[depth].clone();
        self.delete_branch(&doomed)
    }

    /// Start a new assistant reply to `user_node_id` and select it.
    pub fn retry_user_message(&mut self, user_node_id: &str) -> Option<RetryOutcome> {
        let node = self.nodes.get(user_node_id)?;
        if node.role != Role::User {
            return None;
        }
        let has_reply = self.children_of(user_node_id).iter().any(|id| {
            self.nodes
                .get(id)
                .is_some_and(|child| child.role == Role::Assistant)
        });

        let mut path = self.path_to(user_node_id)?;
        let node_id = self.insert_child(user_node_id, Role::Assistant, String::new());
        path.push(node_id.clone());
        self.active_path = path;

        Some(if has_reply {
            RetryOutcome::NewSibling { node_id }
        } else {
            RetryOutcome::FreshChild { node_id }
        })
    }

    /// Make `node_id` part of the active path, continuing below it along
    /// the most recent children.
    pub fn select(&mut self, node_id: &str) -> bool {
        let Some(mut path) = self.path_to(node_id) else {
            return false;
        };
        path.extend(self.descend(node_id));
        self.active_path = path;
        true
    }

    /// Overwrite a node's content in place.
    pub fn update_content(&mut self, node_id: &str, content: impl Into<String>) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.content = content.into();
                node.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Check every structural invariant. Used after loading from disk.
    pub fn validate(&self) -> Result<(), TreeError> {
        let root = self
            .nodes
            .get(&self.root_id)
            .ok_or_else(|| TreeError::Corrupt("root node missing".into()))?;
        if root.parent_id.is_some() {
            return Err(TreeError::Corrupt("root has a parent".into()));
        }

        for (id, node) in &self.nodes {
            if id != &node.id {
                return Err(TreeError::Corrupt(format!("node key {id} holds {}", node.id)));
            }
            match &node.parent_id {
                None if id != &self.root_id => {
                    return Err(TreeError::Corrupt(format!("second root {id}")));
                }
                Some(parent) if !self.children_of(parent).contains(id) => {
                    return Err(TreeError::Corrupt(format!(
                        "{id} missing from child list of {parent}"
                    )));
                }
                _ => {}
            }
        }

        for (parent, kids) in &self.children {
            for kid in kids {
                let node = self
                    .nodes
                    .get(kid)
                    .ok_or_else(|| TreeError::Corrupt(format!("dangling child {kid}")))?;
                if node.parent_id.as_deref() != Some(parent.as_str()) {
                    return Err(TreeError::Corrupt(format!(
                        "{kid} listed under {parent} but points elsewhere"
                    )));
                }
            }
        }

        if self.active_path.first() != Some(&self.root_id) {
            return Err(TreeError::Corrupt("active path does not start at root".into()));
        }
        for pair in self.active_path.windows(2) {
            if !self.children_of(&pair[0]).contains(&pair[1]) {
                return Err(TreeError::Corrupt(format!(
                    "active path edge {} -> {} is not registered",
                    pair[0], pair[1]
                )));
            }
        }

        if self.path_to(&self.active_path[self.active_path.len() - 1]).is_none() {
            return Err(TreeError::Corrupt("parent cycle".into()));
        }
        Ok(())
    }

    // ── Internal ──────────────────────────────────────────────────────

    fn insert_child(&mut self, parent_id: &str, role: Role, content: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                parent_id: Some(parent_id.to_string()),
                role,
                content,
                updated_at: Utc::now(),
            },
        );
        self.children
            .entry(parent_id.to_string())
            .or_default()
            .push(id.clone());
        self.children.insert(id.clone(), Vec::new());
        id
    }

    /// Follow the last child at each level below `from` (exclusive).
    fn descend(&self, from: &str) -> Vec<String> {
        let mut tail = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = from;
        while let Some(next) = self.children_of(cursor).last() {
            if !seen.insert(next.as_str()) {
                break;
            }
            tail.push(next.clone());
            cursor = next.as_str();
        }
        tail
    }

    /// Breadth-first collection of `node_id` and all its descendants.
    fn collect_subtree(&self, node_id: &str) -> Vec<String> {
        let mut collected = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([node_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            queue.extend(self.children_of(&id).iter().cloned());
            collected.push(id);
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root → user → assistant, all on the active path.
    fn simple_tree() -> (BranchTree, String, String) {
        let mut tree = BranchTree::new("You are a narrator.");
        let root = tree.root_id().to_string();
        let user = tree.append(&root, Role::User, "Hello").unwrap();
        let reply = tree.append(&user, Role::Assistant, "Hi!").unwrap();
        (tree, user, reply)
    }

    #[test]
    fn new_tree_has_root_on_active_path() {
        let tree = BranchTree::new("sys");
        assert_eq!(tree.active_path(), &[tree.root_id().to_string()]);
        assert_eq!(tree.node(tree.root_id()).unwrap().role, Role::System);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn append_extends_active_path() {
        let (tree, user, reply) = simple_tree();
        assert_eq!(tree.active_path().len(), 3);
        assert_eq!(tree.active_path()[1], user);
        assert_eq!(tree.active_tail(), reply);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn append_to_unknown_parent_fails() {
        let mut tree = BranchTree::new("sys");
        let err = tree.append("missing", Role::User, "x").unwrap_err();
        assert_eq!(err, TreeError::UnknownNode("missing".into()));
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn append_to_non_tail_reroutes_path() {
        let (mut tree, user, reply) = simple_tree();
        let other = tree.append(&user, Role::Assistant, "Alt").unwrap();
        assert_eq!(tree.active_path().len(), 3);
        assert_eq!(tree.active_tail(), other);
        assert!(tree.contains(&reply));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn append_at_discards_suffix() {
        let (mut tree, _user, _reply) = simple_tree();
        let root = tree.root_id().to_string();
        let new_user = tree.append_at(&root, Role::User, "Different start").unwrap();
        assert_eq!(tree.active_path(), &[root.clone(), new_user]);
        assert_eq!(tree.children_of(&root).len(), 2);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn append_at_unknown_is_noop() {
        let (mut tree, _, _) = simple_tree();
        let before = tree.active_path().to_vec();
        assert!(tree.append_at("nope", Role::User, "x").is_none());
        assert_eq!(tree.active_path(), before.as_slice());
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn switch_right_on_last_sibling_creates_new_each_time() {
        let (mut tree, user, reply) = simple_tree();

        let first = tree.switch_branch(3, Direction::Right).unwrap();
        assert_ne!(first, reply);
        assert_eq!(tree.node(&first).unwrap().role, Role::Assistant);
        assert!(tree.node(&first).unwrap().content.is_empty());
        assert_eq!(tree.children_of(&user).len(), 2);
        assert_eq!(tree.active_tail(), first);

        let second = tree.switch_branch(3, Direction::Right).unwrap();
        assert_ne!(second, first);
        assert_eq!(tree.children_of(&user).len(), 3);
        assert_eq!(tree.branch_indicator(3), Some((3, 3)));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn switch_left_and_right_between_existing_siblings() {
        let (mut tree, _user, reply) = simple_tree();
        let alt = tree.switch_branch(3, Direction::Right).unwrap();

        assert_eq!(tree.switch_branch(3, Direction::Left), Some(reply.clone()));
        assert_eq!(tree.active_tail(), reply);
        assert_eq!(tree.branch_indicator(3), Some((1, 2)));

        // Left at the first sibling is a no-op.
        assert_eq!(tree.switch_branch(3, Direction::Left), None);
        assert_eq!(tree.active_tail(), reply);

        // Right to an existing sibling does not create a node.
        let count = tree.node_count();
        assert_eq!(tree.switch_branch(3, Direction::Right), Some(alt));
        assert_eq!(tree.node_count(), count);
    }

    #[test]
    fn switch_descends_along_latest_children() {
        let (mut tree, user, reply) = simple_tree();
        let follow_up = tree.append(&reply, Role::User, "And then?").unwrap();
        let _alt = tree.switch_branch(3, Direction::Right).unwrap();
        tree.switch_branch(3, Direction::Left).unwrap();
        assert_eq!(tree.active_path().len(), 4);
        assert_eq!(tree.active_path()[1], user);
        assert_eq!(tree.active_tail(), follow_up);
    }

    #[test]
    fn switch_on_root_or_bad_depth_is_noop() {
        let (mut tree, _, _) = simple_tree();
        let count = tree.node_count();
        assert!(tree.switch_branch(1, Direction::Right).is_none());
        assert!(tree.switch_branch(0, Direction::Right).is_none());
        assert!(tree.switch_branch(9, Direction::Right).is_none());
        assert_eq!(tree.node_count(), count);
    }

    #[test]
    fn delete_branch_removes_every_descendant() {
        let (mut tree, user, reply) = simple_tree();
        let deep = tree.append(&reply, Role::User, "more").unwrap();
        let deeper = tree.append(&deep, Role::Assistant, "even more").unwrap();
        let root = tree.root_id().to_string();

        assert!(tree.delete_branch(&user));
        for id in [&user, &reply, &deep, &deeper] {
            assert!(!tree.contains(id));
        }
        assert!(tree.children_of(&root).is_empty());
        assert_eq!(tree.active_path(), &[root]);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn delete_branch_off_active_path_keeps_path() {
        let (mut tree, user, reply) = simple_tree();
        let alt = tree.append(&user, Role::Assistant, "alt").unwrap();
        tree.select(&reply);
        assert!(tree.delete_branch(&alt));
        assert_eq!(tree.active_tail(), reply);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn delete_root_or_unknown_is_noop() {
        let (mut tree, _, _) = simple_tree();
        let root = tree.root_id().to_string();
        assert!(!tree.delete_branch(&root));
        assert!(!tree.delete_branch("ghost"));
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn truncate_after_drops_following_subtree() {
        let (mut tree, user, reply) = simple_tree();
        assert!(tree.truncate_after(2));
        assert_eq!(tree.active_tail(), user);
        assert!(!tree.contains(&reply));
        assert!(tree.children_of(&user).is_empty());
        assert!(!tree.truncate_after(0));
        assert!(!tree.truncate_after(2));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn retry_without_reply_creates_fresh_child() {
        let mut tree = BranchTree::new("sys");
        let root = tree.root_id().to_string();
        let user = tree.append(&root, Role::User, "Hi").unwrap();

        let outcome = tree.retry_user_message(&user).unwrap();
        assert!(matches!(outcome, RetryOutcome::FreshChild { .. }));
        assert_eq!(tree.children_of(&user), &[outcome.node_id().to_string()]);
        assert_eq!(tree.active_tail(), outcome.node_id());
    }

    #[test]
    fn retry_with_reply_adds_sibling_branch() {
        let (mut tree, user, reply) = simple_tree();
        let outcome = tree.retry_user_message(&user).unwrap();
        assert!(matches!(outcome, RetryOutcome::NewSibling { .. }));
        assert_eq!(tree.children_of(&user).len(), 2);
        assert_eq!(tree.children_of(&user)[0], reply);
        assert_eq!(tree.active_tail(), outcome.node_id());
        assert_eq!(tree.branch_indicator(3), Some((2, 2)));
    }

    #[test]
    fn retry_on_non_user_or_unknown_is_noop() {
        let (mut tree, _user, reply) = simple_tree();
        assert!(tree.retry_user_message(&reply).is_none());
        assert!(tree.retry_user_message("ghost").is_none());
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn branch_table_reports_every_depth() {
        let (mut tree, _user, _reply) = simple_tree();
        tree.switch_branch(3, Direction::Right);
        let table = tree.branch_table();
        assert_eq!(table.len(), 3);
        assert_eq!((table[0].index, table[0].count), (1, 1));
        assert_eq!((table[1].index, table[1].count), (1, 1));
        assert_eq!((table[2].index, table[2].count), (2, 2));
        assert_eq!(table[2].role, Role::Assistant);
    }

    #[test]
    fn update_content_touches_only_target() {
        let (mut tree, user, reply) = simple_tree();
        assert!(tree.update_content(&reply, "Edited"));
        assert_eq!(tree.node(&reply).unwrap().content, "Edited");
        assert_eq!(tree.node(&user).unwrap().content, "Hello");
        assert!(!tree.update_content("ghost", "x"));
    }

    #[test]
    fn serde_roundtrip_preserves_structure() {
        let (tree, _, _) = simple_tree();
        let json = serde_json::to_string(&tree).unwrap();
        let loaded: BranchTree = serde_json::from_str(&json).unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.active_path(), tree.active_path());
    }

    #[test]
    fn validate_detects_broken_edges() {
        let (tree, _, reply) = simple_tree();
        let mut json = serde_json::to_value(&tree).unwrap();
        json["active_path"].as_array_mut().unwrap().push(reply.into());
        let broken: BranchTree = serde_json::from_value(json).unwrap();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn invariants_hold_under_mixed_operations() {
        let mut tree = BranchTree::new("sys");
        // Small deterministic LCG so the sequence is reproducible.
        let mut seed: u64 = 0x5eed;
        let mut next = |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound.max(1)
        };

        for step in 0..400 {
            let len = tree.active_path().len();
            let depth = next(len) + 1;
            match next(6) {
                0 | 1 => {
                    let parent = tree.active_tail().to_string();
                    let role = if step % 2 == 0 { Role::User } else { Role::Assistant };
                    tree.append(&parent, role, format!("msg {step}")).unwrap();
                }
                2 => {
                    tree.switch_branch(depth, Direction::Right);
                }
                3 => {
                    tree.switch_branch(depth, Direction::Left);
                }
                4 => {
                    let target = tree.active_path()[depth - 1].clone();
                    tree.delete_branch(&target);
                }
                _ => {
                    tree.truncate_after(depth);
                }
            }
            assert_eq!(tree.active_path()[0], tree.root_id());
            assert!(tree.validate().is_ok(), "invariant broken at step {step}");
        }
    }
}

//! The source tree: priority-ordered groups of job sources.
//!
//! Nodes live in an arena ([`SlotMap`]) and refer to each other by
//! [`NodeId`], so the tree can be restructured while jobs keep pointing at
//! the leaf that issued them. Each chain has exactly one root group.
//!
//! The tree is plain data owned by the dispatch engine task. Nothing here
//! talks to the network; leaves only mirror the liveness their source tasks
//! report.

use std::collections::BTreeMap;
use std::sync::Arc;

use slotmap::SlotMap;

use crate::config::{ChainConfig, GroupConfig, GroupSettings, NodeConfig, SourceConfig};
use crate::error::{DispatchError, Result};
use crate::job_source::Liveness;

slotmap::new_key_type! {
    /// Stable identifier of a tree node.
    pub struct NodeId;
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub parent: Option<NodeId>,
    /// Insertion order, the tie-break between equal priorities.
    seq: u64,
    /// Set on roots only.
    chain: Option<String>,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub enum NodeKind {
    Group { children: Vec<NodeId> },
    Source(LeafState),
}

#[derive(Debug)]
pub struct LeafState {
    pub config: Arc<SourceConfig>,
    pub liveness: Liveness,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Source(_))
    }

    fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Group { children } => children,
            NodeKind::Source(_) => &[],
        }
    }
}

/// Point-in-time view of a subtree, for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub liveness: Liveness,
    pub is_source: bool,
    /// The leaf currently selected for the chain.
    pub active: bool,
    pub children: Vec<NodeSnapshot>,
}

#[derive(Debug, Default)]
pub struct SourceTree {
    nodes: SlotMap<NodeId, Node>,
    roots: BTreeMap<String, NodeId>,
    next_seq: u64,
    revision: u64,
}

impl SourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tree for every configured chain.
    pub fn build(chains: &[ChainConfig]) -> Result<Self> {
        let mut tree = Self::new();
        for chain in chains {
            tree.add_root(&chain.name, &chain.root)?;
        }
        Ok(tree)
    }

    /// Counter bumped by every structural or settings change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn leaf(&self, id: NodeId) -> Option<&LeafState> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Source(leaf) => Some(leaf),
            NodeKind::Group { .. } => None,
        }
    }

    pub fn root(&self, chain: &str) -> Option<NodeId> {
        self.roots.get(chain).copied()
    }

    /// Chain names with their roots, in name order.
    pub fn chains(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.roots.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Install the root group of a chain, with its whole subtree.
    pub fn add_root(&mut self, chain: &str, config: &GroupConfig) -> Result<NodeId> {
        if self.roots.contains_key(chain) {
            return Err(DispatchError::InvalidTopology(format!(
                "chain {:?} already has a root",
                chain
            )));
        }
        let id = self.insert_group(None, config);
        if let Some(node) = self.nodes.get_mut(id) {
            node.chain = Some(chain.to_string());
        }
        self.roots.insert(chain.to_string(), id);
        self.revision += 1;
        Ok(id)
    }

    /// Add a subtree below an existing group.
    pub fn add_node(&mut self, parent: NodeId, config: &NodeConfig) -> Result<NodeId> {
        match self.nodes.get(parent).map(|n| &n.kind) {
            Some(NodeKind::Group { .. }) => {}
            Some(NodeKind::Source(_)) => {
                return Err(DispatchError::InvalidTopology(
                    "sources cannot have children".into(),
                ))
            }
            None => return Err(DispatchError::UnknownNode),
        }

        let id = match config {
            NodeConfig::Group(group) => self.insert_group(Some(parent), group),
            NodeConfig::Source(source) => self.insert_source(parent, Arc::new(source.clone())),
        };
        self.revision += 1;
        Ok(id)
    }

    /// Remove a node and its subtree. Returns the removed leaves.
    ///
    /// Roots cannot be removed.
    pub fn remove(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.nodes.get(id).ok_or(DispatchError::UnknownNode)?;
        let Some(parent) = node.parent else {
            return Err(DispatchError::InvalidTopology(
                "the root of a chain cannot be removed".into(),
            ));
        };

        let leaves = self.leaves_under(id);
        if let Some(NodeKind::Group { children }) = self.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            children.retain(|child| *child != id);
        }

        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(next) {
                stack.extend_from_slice(node.children());
            }
        }

        self.revision += 1;
        Ok(leaves)
    }

    /// Record a leaf's reported liveness. Returns whether it changed.
    pub fn set_liveness(&mut self, id: NodeId, liveness: Liveness) -> bool {
        match self.nodes.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Source(leaf)) if leaf.liveness != liveness => {
                leaf.liveness = liveness;
                true
            }
            _ => false,
        }
    }

    pub fn apply_group_settings(&mut self, id: NodeId, settings: &GroupSettings) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(DispatchError::UnknownNode)?;
        if node.is_leaf() {
            return Err(DispatchError::InvalidSettings(
                "group settings applied to a source".into(),
            ));
        }
        node.name = settings.name.clone();
        node.priority = settings.priority;
        node.enabled = settings.enabled;
        self.revision += 1;
        Ok(())
    }

    /// Swap a leaf's configuration snapshot.
    ///
    /// The protocol of an existing source cannot change; replace the node
    /// instead.
    pub fn apply_source_config(&mut self, id: NodeId, config: Arc<SourceConfig>) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(DispatchError::UnknownNode)?;
        let NodeKind::Source(leaf) = &mut node.kind else {
            return Err(DispatchError::InvalidSettings(
                "source settings applied to a group".into(),
            ));
        };
        if leaf.config.protocol != config.protocol {
            return Err(DispatchError::InvalidSettings(format!(
                "cannot change protocol of {:?} in place",
                node.name
            )));
        }

        node.name = config.name.clone();
        node.priority = config.priority;
        node.enabled = config.enabled;
        leaf.config = config;
        self.revision += 1;
        Ok(())
    }

    /// Chain served by the tree containing `id`.
    pub fn chain_of(&self, mut id: NodeId) -> Option<&str> {
        loop {
            let node = self.nodes.get(id)?;
            match node.parent {
                Some(parent) => id = parent,
                None => return node.chain.as_deref(),
            }
        }
    }

    /// Liveness of a node; for groups, aggregated over enabled children.
    ///
    /// A group is Alive if any enabled child is Alive, Unknown if none is
    /// Alive but some are Unknown, and Dead otherwise.
    pub fn liveness(&self, id: NodeId) -> Liveness {
        let Some(node) = self.nodes.get(id) else {
            return Liveness::Dead;
        };
        match &node.kind {
            NodeKind::Source(leaf) => leaf.liveness,
            NodeKind::Group { children } => {
                let mut aggregate = Liveness::Dead;
                for &child in children {
                    if !self.nodes.get(child).is_some_and(|c| c.enabled) {
                        continue;
                    }
                    match self.liveness(child) {
                        Liveness::Alive => return Liveness::Alive,
                        Liveness::Unknown => aggregate = Liveness::Unknown,
                        Liveness::Dead => {}
                    }
                }
                aggregate
            }
        }
    }

    /// Pick the leaf that should serve `chain`.
    ///
    /// Walks the tree depth-first, visiting children in ascending priority
    /// (insertion order breaks ties) and skipping disabled or dead nodes.
    /// Leaves of unknown liveness are eligible.
    pub fn select_active(&self, chain: &str) -> Option<NodeId> {
        self.select_from(self.root(chain)?)
    }

    fn select_from(&self, id: NodeId) -> Option<NodeId> {
        let node = self.nodes.get(id)?;
        if !node.enabled {
            return None;
        }
        match &node.kind {
            NodeKind::Source(leaf) => (leaf.liveness != Liveness::Dead).then_some(id),
            NodeKind::Group { children } => self
                .ordered(children)
                .into_iter()
                .find_map(|child| self.select_from(child)),
        }
    }

    fn ordered(&self, children: &[NodeId]) -> Vec<NodeId> {
        let mut ordered: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|c| self.nodes.contains_key(*c))
            .collect();
        ordered.sort_by_key(|c| {
            let node = &self.nodes[*c];
            (node.priority, node.seq)
        });
        ordered
    }

    /// All leaves in the subtree rooted at `id`.
    pub fn leaves_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(next) else {
                continue;
            };
            if node.is_leaf() {
                leaves.push(next);
            } else {
                stack.extend(node.children().iter().rev());
            }
        }
        leaves
    }

    /// Every leaf in the tree with its configuration.
    pub fn leaves(&self) -> Vec<(NodeId, Arc<SourceConfig>)> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| match &node.kind {
                NodeKind::Source(leaf) => Some((id, leaf.config.clone())),
                NodeKind::Group { .. } => None,
            })
            .collect()
    }

    /// Slash-separated names from the root down to `id`.
    pub fn path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut next = Some(id);
        while let Some(current) = next {
            let Some(node) = self.nodes.get(current) else {
                break;
            };
            names.push(node.name.as_str());
            next = node.parent;
        }
        names.reverse();
        names.join("/")
    }

    pub fn snapshot(&self, id: NodeId, active: Option<NodeId>) -> Option<NodeSnapshot> {
        let node = self.nodes.get(id)?;
        let children = self
            .ordered(node.children())
            .into_iter()
            .filter_map(|child| self.snapshot(child, active))
            .collect();
        Some(NodeSnapshot {
            id,
            name: node.name.clone(),
            priority: node.priority,
            enabled: node.enabled,
            liveness: self.liveness(id),
            is_source: node.is_leaf(),
            active: active == Some(id),
            children,
        })
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_group(&mut self, parent: Option<NodeId>, config: &GroupConfig) -> NodeId {
        let seq = self.next_seq();
        let id = self.nodes.insert(Node {
            name: config.name.clone(),
            priority: config.priority,
            enabled: config.enabled,
            parent,
            seq,
            chain: None,
            kind: NodeKind::Group {
                children: Vec::new(),
            },
        });
        if let Some(parent) = parent {
            self.attach(parent, id);
        }

        for child in &config.children {
            match child {
                NodeConfig::Group(group) => {
                    self.insert_group(Some(id), group);
                }
                NodeConfig::Source(source) => {
                    self.insert_source(id, Arc::new(source.clone()));
                }
            }
        }
        id
    }

    fn insert_source(&mut self, parent: NodeId, config: Arc<SourceConfig>) -> NodeId {
        let seq = self.next_seq();
        let id = self.nodes.insert(Node {
            name: config.name.clone(),
            priority: config.priority,
            enabled: config.enabled,
            parent: Some(parent),
            seq,
            chain: None,
            kind: NodeKind::Source(LeafState {
                config,
                liveness: Liveness::Unknown,
            }),
        });
        self.attach(parent, id);
        id
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(NodeKind::Group { children }) = self.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            children.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use test_case::test_case;

    fn source(name: &str, priority: u32) -> NodeConfig {
        NodeConfig::Source(
            SourceConfig::new(name, Protocol::Stratum, "localhost", 3333).with_priority(priority),
        )
    }

    fn group(name: &str, priority: u32, children: Vec<NodeConfig>) -> GroupConfig {
        let mut group = GroupConfig::new(name, priority);
        group.children = children;
        group
    }

    fn tree_with(root: GroupConfig) -> SourceTree {
        SourceTree::build(&[ChainConfig {
            name: "Bitcoin".to_string(),
            root,
        }])
        .unwrap()
    }

    fn find(tree: &SourceTree, name: &str) -> NodeId {
        tree.nodes
            .iter()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
            .unwrap()
    }

    fn selected_name(tree: &SourceTree) -> Option<String> {
        tree.select_active("Bitcoin")
            .map(|id| tree.get(id).unwrap().name.clone())
    }

    #[test]
    fn test_dead_primary_fails_over_to_backup() {
        let mut tree = tree_with(group("Root", 0, vec![source("A", 1), source("B", 2)]));
        tree.set_liveness(find(&tree, "A"), Liveness::Dead);
        tree.set_liveness(find(&tree, "B"), Liveness::Alive);

        assert_eq!(selected_name(&tree).as_deref(), Some("B"));
    }

    #[test_case(Liveness::Unknown, Liveness::Unknown, Some("A") ; "unknown leaves are eligible")]
    #[test_case(Liveness::Alive, Liveness::Alive, Some("A") ; "lowest priority wins")]
    #[test_case(Liveness::Dead, Liveness::Unknown, Some("B") ; "dead primary skipped")]
    #[test_case(Liveness::Dead, Liveness::Dead, None ; "all dead")]
    fn test_selection_by_liveness(a: Liveness, b: Liveness, expected: Option<&str>) {
        let mut tree = tree_with(group("Root", 0, vec![source("B", 2), source("A", 1)]));
        tree.set_liveness(find(&tree, "A"), a);
        tree.set_liveness(find(&tree, "B"), b);

        assert_eq!(selected_name(&tree).as_deref(), expected);
    }

    #[test]
    fn test_equal_priority_uses_insertion_order() {
        let tree = tree_with(group(
            "Root",
            0,
            vec![source("first", 5), source("second", 5), source("third", 5)],
        ));
        assert_eq!(selected_name(&tree).as_deref(), Some("first"));
    }

    #[test]
    fn test_disabled_nodes_are_skipped() {
        let mut tree = tree_with(group(
            "Root",
            0,
            vec![
                NodeConfig::Group(group("Primary", 1, vec![source("A", 1)])),
                source("B", 2),
            ],
        ));
        let primary = find(&tree, "Primary");
        tree.apply_group_settings(
            primary,
            &GroupSettings {
                name: "Primary".into(),
                priority: 1,
                enabled: false,
            },
        )
        .unwrap();

        assert_eq!(selected_name(&tree).as_deref(), Some("B"));
    }

    #[test]
    fn test_nested_group_failover_is_transitive() {
        let mut tree = tree_with(group(
            "Root",
            0,
            vec![
                NodeConfig::Group(group("Pools", 1, vec![source("A", 1), source("B", 2)])),
                NodeConfig::Group(group("Backup", 2, vec![source("C", 1)])),
            ],
        ));
        let pools = find(&tree, "Pools");

        tree.set_liveness(find(&tree, "A"), Liveness::Dead);
        assert_eq!(selected_name(&tree).as_deref(), Some("B"));
        assert_eq!(tree.liveness(pools), Liveness::Unknown);

        tree.set_liveness(find(&tree, "B"), Liveness::Dead);
        assert_eq!(tree.liveness(pools), Liveness::Dead);
        assert_eq!(selected_name(&tree).as_deref(), Some("C"));

        tree.set_liveness(find(&tree, "B"), Liveness::Alive);
        assert_eq!(tree.liveness(pools), Liveness::Alive);
        assert_eq!(selected_name(&tree).as_deref(), Some("B"));
    }

    #[test]
    fn test_group_liveness_ignores_disabled_children() {
        let mut root = group("Root", 0, vec![source("A", 1), source("B", 2)]);
        if let NodeConfig::Source(b) = &mut root.children[1] {
            b.enabled = false;
        }
        let mut tree = tree_with(root);
        let root = tree.root("Bitcoin").unwrap();

        tree.set_liveness(find(&tree, "B"), Liveness::Alive);
        tree.set_liveness(find(&tree, "A"), Liveness::Dead);
        assert_eq!(tree.liveness(root), Liveness::Dead);
        assert_eq!(tree.select_active("Bitcoin"), None);
    }

    #[test]
    fn test_remove_subtree_returns_leaves() {
        let mut tree = tree_with(group(
            "Root",
            0,
            vec![
                NodeConfig::Group(group("Pools", 1, vec![source("A", 1), source("B", 2)])),
                source("C", 2),
            ],
        ));
        let a = find(&tree, "A");
        let b = find(&tree, "B");
        let revision = tree.revision();

        let mut removed = tree.remove(find(&tree, "Pools")).unwrap();
        removed.sort();
        let mut expected = vec![a, b];
        expected.sort();

        assert_eq!(removed, expected);
        assert!(tree.get(a).is_none());
        assert!(tree.revision() > revision);
        assert_eq!(selected_name(&tree).as_deref(), Some("C"));
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut tree = tree_with(group("Root", 0, vec![source("A", 1)]));
        let root = tree.root("Bitcoin").unwrap();
        assert!(matches!(
            tree.remove(root),
            Err(DispatchError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_add_node_below_source_is_rejected() {
        let mut tree = tree_with(group("Root", 0, vec![source("A", 1)]));
        let a = find(&tree, "A");
        assert!(tree.add_node(a, &source("B", 1)).is_err());

        let root = tree.root("Bitcoin").unwrap();
        let b = tree.add_node(root, &source("B", 0)).unwrap();
        assert_eq!(tree.chain_of(b), Some("Bitcoin"));
        assert_eq!(tree.select_active("Bitcoin"), Some(b));
    }

    #[test]
    fn test_source_config_swap_keeps_protocol() {
        let mut tree = tree_with(group("Root", 0, vec![source("A", 1)]));
        let a = find(&tree, "A");

        let renamed = SourceConfig::new("A2", Protocol::Stratum, "localhost", 3334).with_priority(7);
        tree.apply_source_config(a, Arc::new(renamed)).unwrap();
        assert_eq!(tree.get(a).unwrap().name, "A2");
        assert_eq!(tree.get(a).unwrap().priority, 7);
        assert_eq!(tree.leaf(a).unwrap().config.port, 3334);

        let getwork = SourceConfig::new("A2", Protocol::Getwork, "localhost", 8332);
        assert!(matches!(
            tree.apply_source_config(a, Arc::new(getwork)),
            Err(DispatchError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_path_and_snapshot() {
        let tree = tree_with(group(
            "Root",
            0,
            vec![NodeConfig::Group(group("Pools", 1, vec![source("A", 1)]))],
        ));
        let a = find(&tree, "A");
        assert_eq!(tree.path(a), "Root/Pools/A");

        let root = tree.root("Bitcoin").unwrap();
        let snapshot = tree.snapshot(root, Some(a)).unwrap();
        assert_eq!(snapshot.children[0].name, "Pools");
        assert!(snapshot.children[0].children[0].active);
        assert!(snapshot.children[0].children[0].is_source);
    }

    #[test]
    fn test_duplicate_chain_is_rejected() {
        let chain = ChainConfig {
            name: "Bitcoin".into(),
            root: group("Root", 0, vec![]),
        };
        assert!(SourceTree::build(&[chain.clone(), chain]).is_err());
    }
}

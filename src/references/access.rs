//! Accessible References
//!
//! Which nodes a block may read from: its ancestors (through edges and
//! enclosing groups), the entry block, and every member of every group it
//! sits in.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::normalize::normalize_name;
use crate::workflow::Workflow;

/// Nodes a block may reference, indexed by normalized prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessibleSet {
    nodes: BTreeSet<String>,
    prefixes: HashMap<String, String>,
}

impl AccessibleSet {
    fn insert(&mut self, id: &str, reference_name: &str) {
        self.nodes.insert(id.to_string());
        for label in [reference_name, id] {
            let prefix = normalize_name(label);
            if !prefix.is_empty() {
                self.prefixes.entry(prefix).or_insert_with(|| id.to_string());
            }
        }
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    /// Node id behind a normalized prefix, if accessible.
    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.prefixes.get(prefix).map(String::as_str)
    }

    /// Accessible node ids, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Accessible prefixes, sorted.
    pub fn prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = self.prefixes.keys().map(String::as_str).collect();
        prefixes.sort_unstable();
        prefixes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Computes the accessible set of `node` by reverse traversal.
///
/// Members reach their group (and through it the group's ancestors); the
/// group's interior is never reachable from outside it.
pub fn compute_accessible(workflow: &Workflow, node: &str) -> AccessibleSet {
    let mut found: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([node]);

    while let Some(current) = queue.pop_front() {
        let upstream = workflow
            .predecessors(current)
            .iter()
            .map(String::as_str)
            .chain(workflow.parent(current));
        for source in upstream {
            if found.insert(source.to_string()) {
                queue.push_back(source);
            }
        }
    }

    found.insert(workflow.entry().to_string());

    for group in workflow.enclosing_groups(node) {
        if let Some(info) = workflow.group(group) {
            found.extend(info.scope.order.iter().cloned());
        }
    }

    found.remove(node);

    let mut set = AccessibleSet::default();
    for id in &found {
        set.insert(id, workflow.reference_name(id));
    }
    set
}

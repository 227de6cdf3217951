//! Compiled Workflow
//!
//! A validated, immutable view of a [`WorkflowDefinition`] with handlers
//! bound to blocks, each scope laid out for the planner, and a lazily
//! filled cache of per-block accessible references.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::OnceCell;

use super::model::{Block, GroupKind, Iteration, WorkflowDefinition};
use super::planner::{PlanEdge, ScopePlan};
use super::validator::validate_workflow;
use crate::error::StructuralError;
use crate::handlers::{BlockHandler, HandlerRegistry};
use crate::references::access::{compute_accessible, AccessibleSet};

/// A loop or parallel group with its interior plan.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub kind: GroupKind,
    pub iteration: Iteration,
    pub max_concurrency: Option<usize>,
    pub scope: Arc<ScopePlan>,
}

impl GroupInfo {
    pub fn reference_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A workflow ready to run.
pub struct Workflow {
    definition: WorkflowDefinition,
    block_index: HashMap<String, usize>,
    handlers: HashMap<String, Arc<dyn BlockHandler>>,
    groups: HashMap<String, GroupInfo>,
    parents: HashMap<String, String>,
    predecessors: HashMap<String, Vec<String>>,
    root: Arc<ScopePlan>,
    entry: String,
    prefixes: HashMap<String, String>,
    accessible: HashMap<String, OnceCell<Arc<AccessibleSet>>>,
}

/// Nodes reachable from `entry` along root edges.
fn reachable_from(entry: &str, edges: &[PlanEdge]) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([entry.to_string()]);
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current.clone()) {
            continue;
        }
        for edge in edges.iter().filter(|e| e.source == current) {
            queue.push_back(edge.target.clone());
        }
    }
    seen
}

impl Workflow {
    /// Validates a definition and binds every block to its handler.
    pub fn compile(
        definition: WorkflowDefinition,
        registry: &HandlerRegistry,
    ) -> Result<Self, StructuralError> {
        let mut layout = validate_workflow(&definition, registry)?;

        let mut handlers = HashMap::new();
        let mut block_index = HashMap::new();
        for (index, block) in definition.blocks.iter().enumerate() {
            let handler = registry.get(&block.block_type).ok_or_else(|| {
                StructuralError::UnknownBlockType {
                    block: block.id.clone(),
                    block_type: block.block_type.clone(),
                }
            })?;
            handlers.insert(block.id.clone(), handler);
            block_index.insert(block.id.clone(), index);
        }

        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for scope in layout.scopes.values() {
            for edge in &scope.edges {
                predecessors
                    .entry(edge.target.clone())
                    .or_default()
                    .push(edge.source.clone());
            }
        }

        let root_layout = layout.scopes.remove(&None).unwrap_or_default();
        let reachable = reachable_from(&layout.entry, &root_layout.edges);
        for node in root_layout.order.iter().filter(|n| !reachable.contains(*n)) {
            debug!("Node '{}' is unreachable from the entry block and never runs", node);
        }
        let root = Arc::new(ScopePlan::new(
            None,
            root_layout
                .order
                .into_iter()
                .filter(|n| reachable.contains(n))
                .collect(),
            root_layout
                .edges
                .into_iter()
                .filter(|e| reachable.contains(&e.source) && reachable.contains(&e.target))
                .collect(),
        ));

        let mut groups = HashMap::new();
        let declared = definition
            .loops
            .iter()
            .map(|g| (&g.id, &g.name, GroupKind::Loop, &g.iteration, None::<usize>))
            .chain(definition.parallels.iter().map(|g| {
                (
                    &g.id,
                    &g.name,
                    GroupKind::Parallel,
                    &g.iteration,
                    g.max_concurrency,
                )
            }));
        for (id, name, kind, iteration, max_concurrency) in declared {
            let scope_layout = layout.scopes.remove(&Some(id.clone())).unwrap_or_default();
            let scope = ScopePlan::new(Some(id.clone()), scope_layout.order, scope_layout.edges);
            groups.insert(
                id.clone(),
                GroupInfo {
                    id: id.clone(),
                    name: name.clone(),
                    kind,
                    iteration: iteration.clone(),
                    max_concurrency,
                    scope: Arc::new(scope),
                },
            );
        }

        let accessible = block_index
            .keys()
            .chain(groups.keys())
            .map(|id| (id.clone(), OnceCell::new()))
            .collect();

        info!(
            "Compiled workflow '{}': {} blocks, {} groups, {} reachable root nodes",
            definition.id,
            definition.blocks.len(),
            groups.len(),
            root.len()
        );

        Ok(Self {
            entry: layout.entry,
            parents: layout.parents,
            prefixes: layout.prefixes,
            definition,
            block_index,
            handlers,
            groups,
            predecessors,
            root,
            accessible,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// The definition this workflow was compiled from.
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Id of the entry block.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.block_index
            .get(id)
            .and_then(|index| self.definition.blocks.get(*index))
    }

    pub fn handler(&self, id: &str) -> Option<Arc<dyn BlockHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn group(&self, id: &str) -> Option<&GroupInfo> {
        self.groups.get(id)
    }

    pub fn is_group(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    /// Group directly containing a node.
    pub fn parent(&self, id: &str) -> Option<&str> {
        self.parents.get(id).map(String::as_str)
    }

    /// Groups enclosing a node, outermost first.
    pub fn enclosing_groups(&self, id: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.parent(id);
        while let Some(group) = current {
            chain.push(group);
            current = self.parent(group);
        }
        chain.reverse();
        chain
    }

    /// Number of groups enclosing a node.
    pub fn depth(&self, id: &str) -> usize {
        self.enclosing_groups(id).len()
    }

    /// Same-scope dependency sources of a node.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn root_scope(&self) -> &Arc<ScopePlan> {
        &self.root
    }

    /// Plan of the root (`None`) or a group's interior.
    pub fn scope(&self, group: Option<&str>) -> Option<&Arc<ScopePlan>> {
        match group {
            None => Some(&self.root),
            Some(id) => self.groups.get(id).map(|g| &g.scope),
        }
    }

    /// Node owning a normalized reference prefix.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<&str> {
        self.prefixes.get(prefix).map(String::as_str)
    }

    /// Human label of a block or group, falling back to its id.
    pub fn reference_name<'a>(&'a self, id: &'a str) -> &'a str {
        if let Some(block) = self.block(id) {
            block.reference_name()
        } else if let Some(group) = self.group(id) {
            group.reference_name()
        } else {
            id
        }
    }

    /// References a node may use. Computed on first request, then cached.
    pub fn accessible(&self, id: &str) -> Arc<AccessibleSet> {
        match self.accessible.get(id) {
            Some(cell) => Arc::clone(cell.get_or_init(|| Arc::new(compute_accessible(self, id)))),
            None => Arc::new(AccessibleSet::default()),
        }
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.definition.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.blocks.is_empty()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.definition.id)
            .field("entry", &self.entry)
            .field("blocks", &self.definition.blocks.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{LoopGroup, ParallelGroup};

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn nested() -> WorkflowDefinition {
        WorkflowDefinition::new("wf")
            .with_block(Block::new("start", "starter").with_name("Start"))
            .with_block(Block::new("x", "response"))
            .with_block(Block::new("inner", "response").with_name("Inner Step"))
            .with_block(Block::new("after", "response"))
            .with_block(Block::new("orphan", "response"))
            .with_loop(LoopGroup::new(
                "outer",
                ids(&["x", "par"]),
                Iteration::Count { count: 2 },
            ))
            .with_parallel(ParallelGroup::new(
                "par",
                ids(&["inner"]),
                Iteration::Count { count: 3 },
            ))
            .connect("start", "outer")
            .connect("x", "par")
            .connect("outer", "after")
            .connect("orphan", "after")
    }

    #[test]
    fn test_compile_binds_handlers() {
        let registry = HandlerRegistry::with_builtins();
        let workflow = Workflow::compile(nested(), &registry).unwrap();

        assert_eq!(workflow.entry(), "start");
        assert!(workflow.handler("start").unwrap().is_entry());
        assert!(workflow.handler("outer").is_none());
        assert_eq!(workflow.len(), 5);
    }

    #[test]
    fn test_root_scope_drops_unreachable() {
        let registry = HandlerRegistry::with_builtins();
        let workflow = Workflow::compile(nested(), &registry).unwrap();

        let root = workflow.root_scope();
        assert_eq!(root.order, ids(&["start", "outer", "after"]));
        assert_eq!(root.incoming("after").len(), 1);
    }

    #[test]
    fn test_group_nesting_queries() {
        let registry = HandlerRegistry::with_builtins();
        let workflow = Workflow::compile(nested(), &registry).unwrap();

        assert_eq!(workflow.enclosing_groups("inner"), vec!["outer", "par"]);
        assert_eq!(workflow.depth("inner"), 2);
        assert_eq!(workflow.depth("after"), 0);
        assert_eq!(workflow.parent("par"), Some("outer"));

        let outer = workflow.group("outer").unwrap();
        assert_eq!(outer.kind, GroupKind::Loop);
        assert_eq!(outer.scope.order, ids(&["x", "par"]));
        assert_eq!(workflow.scope(Some("par")).unwrap().order, ids(&["inner"]));
        assert!(workflow.scope(Some("nope")).is_none());
    }

    #[test]
    fn test_prefix_resolution() {
        let registry = HandlerRegistry::with_builtins();
        let workflow = Workflow::compile(nested(), &registry).unwrap();

        assert_eq!(workflow.resolve_prefix("innerstep"), Some("inner"));
        assert_eq!(workflow.resolve_prefix("inner"), Some("inner"));
        assert_eq!(workflow.reference_name("inner"), "Inner Step");
        assert_eq!(workflow.reference_name("outer"), "outer");
    }

    #[test]
    fn test_accessible_is_cached() {
        let registry = HandlerRegistry::with_builtins();
        let workflow = Workflow::compile(nested(), &registry).unwrap();

        let first = workflow.accessible("after");
        let second = workflow.accessible("after");
        assert!(Arc::ptr_eq(&first, &second));
    }
}

//! Execution Planner
//!
//! Tracks one scope of a run (the root graph, or one iteration of a loop or
//! parallel group):
//! - Dependency satisfaction over the scope's edges
//! - Conditional routing (live vs. dead edges)
//! - Skip propagation
//! - Per-node status and timing

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

/// Source handle that carries a failed block's error downstream.
pub const ERROR_HANDLE: &str = "error";

/// A dependency edge inside one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanEdge {
    pub source: String,
    pub target: String,
    pub handle: Option<String>,
}

impl PlanEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, handle: Option<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            handle,
        }
    }

    /// Whether the edge carries control given the handle its source selected.
    ///
    /// An untagged edge follows every normal outcome; a tagged edge follows
    /// only its own handle; `error` edges follow only failures.
    pub fn is_live(&self, selected: Option<&str>) -> bool {
        match (selected, self.handle.as_deref()) {
            (None, Some(ERROR_HANDLE)) => false,
            (None, _) => true,
            (Some(ERROR_HANDLE), handle) => handle == Some(ERROR_HANDLE),
            (Some(_), None) => true,
            (Some(selected), Some(handle)) => selected == handle,
        }
    }
}

/// Static plan of one scope: its nodes in topological order and its edges.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopePlan {
    /// Owning group, `None` for the root graph
    pub group: Option<String>,
    /// Nodes (blocks and nested groups) in topological order
    pub order: Vec<String>,
    incoming: HashMap<String, Vec<PlanEdge>>,
    outgoing: HashMap<String, Vec<PlanEdge>>,
    sinks: Vec<String>,
}

impl ScopePlan {
    /// Builds a plan. `order` must already be topologically sorted and every
    /// edge must have both ends in `order`.
    pub fn new(group: Option<String>, order: Vec<String>, edges: Vec<PlanEdge>) -> Self {
        let mut incoming: HashMap<String, Vec<PlanEdge>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<PlanEdge>> = HashMap::new();
        for edge in edges {
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
            incoming.entry(edge.target.clone()).or_default().push(edge);
        }

        let sinks = order
            .iter()
            .filter(|id| !outgoing.contains_key(*id))
            .cloned()
            .collect();

        Self {
            group,
            order,
            incoming,
            outgoing,
            sinks,
        }
    }

    pub fn incoming(&self, node: &str) -> &[PlanEdge] {
        self.incoming.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing(&self, node: &str) -> &[PlanEdge] {
        self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with no outgoing edge, in topological order.
    pub fn sinks(&self) -> &[String] {
        &self.sinks
    }

    /// Whether a failure of `node` can be routed along an `error` edge.
    pub fn has_error_route(&self, node: &str) -> bool {
        self.outgoing(node)
            .iter()
            .any(|e| e.handle.as_deref() == Some(ERROR_HANDLE))
    }

    pub fn contains(&self, node: &str) -> bool {
        self.order.iter().any(|n| n == node)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Status of a node during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    /// Waiting for dependencies
    Pending,
    /// Dispatched (or, for groups, iterating)
    Running,
    /// Finished normally
    Completed,
    /// Disabled; passes readiness through without running
    Bypassed,
    /// No live incoming edge
    Skipped,
    /// Failed with error message
    Failed(String),
}

impl NodeStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

/// Timing for a single node.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub duration_ms: Option<u128>,
    pub status: NodeStatus,
}

impl NodeMetrics {
    fn new() -> Self {
        Self {
            start_time: None,
            end_time: None,
            duration_ms: None,
            status: NodeStatus::Pending,
        }
    }

    fn finish(&mut self, status: NodeStatus) {
        let now = Instant::now();
        self.end_time = Some(now);
        if let Some(start) = self.start_time {
            self.duration_ms = Some(now.duration_since(start).as_millis());
        }
        self.status = status;
    }
}

/// Ready-set bookkeeping for one scope instance.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    scope: Arc<ScopePlan>,
    metrics: HashMap<String, NodeMetrics>,
    selected: HashMap<String, Option<String>>,
}

impl ExecutionPlanner {
    pub fn new(scope: Arc<ScopePlan>) -> Self {
        let metrics = scope
            .order
            .iter()
            .map(|id| (id.clone(), NodeMetrics::new()))
            .collect();

        Self {
            scope,
            metrics,
            selected: HashMap::new(),
        }
    }

    pub fn scope(&self) -> &ScopePlan {
        &self.scope
    }

    pub fn status(&self, node: &str) -> Option<&NodeStatus> {
        self.metrics.get(node).map(|m| &m.status)
    }

    fn is_settled(&self, node: &str) -> bool {
        self.status(node).map(NodeStatus::is_settled).unwrap_or(true)
    }

    fn edge_is_live(&self, edge: &PlanEdge) -> bool {
        match self.status(&edge.source) {
            Some(NodeStatus::Completed) => {
                let selected = self.selected.get(&edge.source).cloned().flatten();
                edge.is_live(selected.as_deref())
            }
            Some(NodeStatus::Bypassed) => edge.is_live(None),
            _ => false,
        }
    }

    /// Pending nodes whose incoming edges are all settled with at least one
    /// live, in topological order.
    pub fn ready_nodes(&self) -> Vec<String> {
        self.scope
            .order
            .iter()
            .filter(|id| self.status(id) == Some(&NodeStatus::Pending))
            .filter(|id| {
                let incoming = self.scope.incoming(id);
                incoming.iter().all(|e| self.is_settled(&e.source))
                    && (incoming.is_empty() || incoming.iter().any(|e| self.edge_is_live(e)))
            })
            .cloned()
            .collect()
    }

    /// Marks as skipped every pending node whose incoming edges are all
    /// settled and dead. Returns the newly skipped nodes.
    pub fn settle_skips(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        let order = self.scope.order.clone();

        // Sources precede targets, so one pass propagates transitively.
        for id in order {
            if self.status(&id) != Some(&NodeStatus::Pending) {
                continue;
            }
            let incoming = self.scope.incoming(&id);
            if incoming.is_empty() {
                continue;
            }
            let all_settled = incoming.iter().all(|e| self.is_settled(&e.source));
            let any_live = incoming.iter().any(|e| self.edge_is_live(e));
            if all_settled && !any_live {
                debug!("Node '{}' has no live incoming edge, skipping", id);
                if let Some(metrics) = self.metrics.get_mut(&id) {
                    metrics.status = NodeStatus::Skipped;
                }
                skipped.push(id);
            }
        }

        skipped
    }

    pub fn mark_running(&mut self, node: &str) {
        if let Some(metrics) = self.metrics.get_mut(node) {
            metrics.start_time = Some(Instant::now());
            metrics.status = NodeStatus::Running;
        }
    }

    /// Marks a node completed with the output handle it selected.
    pub fn mark_completed(&mut self, node: &str, handle: Option<String>) {
        self.selected.insert(node.to_string(), handle);
        if let Some(metrics) = self.metrics.get_mut(node) {
            metrics.finish(NodeStatus::Completed);
        }
    }

    pub fn mark_bypassed(&mut self, node: &str) {
        if let Some(metrics) = self.metrics.get_mut(node) {
            metrics.status = NodeStatus::Bypassed;
        }
    }

    pub fn mark_failed(&mut self, node: &str, error: String) {
        if let Some(metrics) = self.metrics.get_mut(node) {
            metrics.finish(NodeStatus::Failed(error));
        }
    }

    /// Handle selected by a completed node.
    pub fn selected_handle(&self, node: &str) -> Option<&str> {
        self.selected.get(node).and_then(|h| h.as_deref())
    }

    /// Returns true while any node is pending or running.
    pub fn has_work_remaining(&self) -> bool {
        self.metrics.values().any(|m| !m.status.is_settled())
    }

    pub fn running_count(&self) -> usize {
        self.metrics
            .values()
            .filter(|m| m.status == NodeStatus::Running)
            .count()
    }

    /// Returns the current progress as (settled, total).
    pub fn progress(&self) -> (usize, usize) {
        let settled = self
            .metrics
            .values()
            .filter(|m| m.status.is_settled())
            .count();
        (settled, self.metrics.len())
    }

    pub fn get_metrics(&self) -> &HashMap<String, NodeMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: &str, target: &str) -> PlanEdge {
        PlanEdge::new(source, target, None)
    }

    fn tagged(source: &str, handle: &str, target: &str) -> PlanEdge {
        PlanEdge::new(source, target, Some(handle.to_string()))
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn chain() -> ExecutionPlanner {
        let scope = ScopePlan::new(
            None,
            ids(&["start", "a", "b"]),
            vec![edge("start", "a"), edge("a", "b")],
        );
        ExecutionPlanner::new(Arc::new(scope))
    }

    fn branching() -> ExecutionPlanner {
        // cond -> (if) x -> z, cond -> (else) y -> z
        let scope = ScopePlan::new(
            None,
            ids(&["cond", "x", "y", "z", "w"]),
            vec![
                tagged("cond", "condition-if", "x"),
                tagged("cond", "condition-else", "y"),
                edge("x", "z"),
                edge("y", "z"),
                edge("y", "w"),
            ],
        );
        ExecutionPlanner::new(Arc::new(scope))
    }

    #[test]
    fn test_edge_liveness() {
        let plain = edge("a", "b");
        let branch = tagged("a", "condition-if", "b");
        let error = tagged("a", ERROR_HANDLE, "b");

        assert!(plain.is_live(None));
        assert!(plain.is_live(Some("condition-if")));
        assert!(!plain.is_live(Some(ERROR_HANDLE)));

        assert!(branch.is_live(None));
        assert!(branch.is_live(Some("condition-if")));
        assert!(!branch.is_live(Some("condition-else")));

        assert!(!error.is_live(None));
        assert!(error.is_live(Some(ERROR_HANDLE)));
    }

    #[test]
    fn test_scope_sinks_and_routes() {
        let scope = ScopePlan::new(
            None,
            ids(&["a", "b", "c"]),
            vec![edge("a", "b"), tagged("a", ERROR_HANDLE, "c")],
        );
        assert_eq!(scope.sinks(), &ids(&["b", "c"])[..]);
        assert!(scope.has_error_route("a"));
        assert!(!scope.has_error_route("b"));
        assert_eq!(scope.incoming("b").len(), 1);
    }

    #[test]
    fn test_planner_ready_in_dependency_order() {
        let mut planner = chain();
        assert_eq!(planner.ready_nodes(), ids(&["start"]));

        planner.mark_running("start");
        assert!(planner.ready_nodes().is_empty());

        planner.mark_completed("start", None);
        assert_eq!(planner.ready_nodes(), ids(&["a"]));
        assert_eq!(planner.progress(), (1, 3));
    }

    #[test]
    fn test_planner_bypass_passes_readiness() {
        let mut planner = chain();
        planner.mark_completed("start", None);
        planner.mark_bypassed("a");
        assert_eq!(planner.ready_nodes(), ids(&["b"]));
    }

    #[test]
    fn test_planner_skip_propagation() {
        let mut planner = branching();
        planner.mark_completed("cond", Some("condition-if".to_string()));

        let skipped = planner.settle_skips();
        assert_eq!(skipped, ids(&["y", "w"]));
        assert_eq!(planner.status("y"), Some(&NodeStatus::Skipped));

        // z still has a live path through x
        assert_eq!(planner.ready_nodes(), ids(&["x"]));
        planner.mark_completed("x", None);
        assert!(planner.settle_skips().is_empty());
        assert_eq!(planner.ready_nodes(), ids(&["z"]));
    }

    #[test]
    fn test_planner_everything_downstream_skipped() {
        let mut planner = branching();
        planner.mark_completed("cond", Some("condition-none".to_string()));

        let skipped = planner.settle_skips();
        assert_eq!(skipped, ids(&["x", "y", "z", "w"]));
        assert!(!planner.has_work_remaining());
    }

    #[test]
    fn test_planner_error_route() {
        let scope = ScopePlan::new(
            None,
            ids(&["a", "ok", "handler"]),
            vec![edge("a", "ok"), tagged("a", ERROR_HANDLE, "handler")],
        );
        let mut planner = ExecutionPlanner::new(Arc::new(scope));

        planner.mark_completed("a", Some(ERROR_HANDLE.to_string()));
        assert_eq!(planner.settle_skips(), ids(&["ok"]));
        assert_eq!(planner.ready_nodes(), ids(&["handler"]));
        assert_eq!(planner.selected_handle("a"), Some(ERROR_HANDLE));
    }

    #[test]
    fn test_planner_failed_node() {
        let mut planner = chain();
        planner.mark_running("start");
        planner.mark_failed("start", "boom".to_string());

        match planner.status("start") {
            Some(NodeStatus::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("Expected Failed status, got {:?}", other),
        }
        assert_eq!(planner.running_count(), 0);
    }

    #[test]
    fn test_planner_has_work_remaining() {
        let mut planner = chain();
        assert!(planner.has_work_remaining());

        for id in ["start", "a", "b"] {
            planner.mark_running(id);
            planner.mark_completed(id, None);
        }
        assert!(!planner.has_work_remaining());
        assert_eq!(planner.progress(), (3, 3));
    }

    #[test]
    fn test_planner_metrics_duration() {
        let mut planner = chain();
        planner.mark_running("start");
        std::thread::sleep(std::time::Duration::from_millis(10));
        planner.mark_completed("start", None);

        let metrics = planner.get_metrics().get("start").unwrap();
        assert!(metrics.start_time.is_some());
        assert!(metrics.duration_ms.unwrap() >= 10);
    }

    #[test]
    fn test_planner_independent_nodes_ready_together() {
        let scope = ScopePlan::new(None, ids(&["a", "b", "c"]), Vec::new());
        let planner = ExecutionPlanner::new(Arc::new(scope));
        assert_eq!(planner.ready_nodes(), ids(&["a", "b", "c"]));
    }
}

//! Workflow Validation
//!
//! Structural checks run once when a workflow is loaded:
//! - Node ids (blocks and groups) are present and unique
//! - Every block type has a registered handler
//! - Edges and group members point at existing nodes
//! - Groups are disjoint except by explicit nesting
//! - Exactly one entry block, outside every group, with no incoming edges
//! - No edge crosses a group boundary
//! - Reference names are unambiguous and avoid the system prefixes
//! - Each scope is acyclic (topological sort)

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use serde_json::Value;

use super::model::{GroupKind, Iteration, WorkflowDefinition};
use super::planner::PlanEdge;
use crate::error::StructuralError;
use crate::handlers::HandlerRegistry;
use crate::references::normalize::{is_system_prefix, normalize_name, START_PREFIX};

/// Topologically sorted contents of one scope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopeLayout {
    pub order: Vec<String>,
    pub edges: Vec<PlanEdge>,
}

/// Everything validation learned about the graph's shape.
#[derive(Debug, Clone)]
pub struct GraphLayout {
    /// The entry block id
    pub entry: String,
    /// Node id to the id of the group directly containing it
    pub parents: HashMap<String, String>,
    /// Scope (None = root, Some(group id)) to its sorted layout
    pub scopes: HashMap<Option<String>, ScopeLayout>,
    /// Normalized reference name (and id) to node id
    pub prefixes: HashMap<String, String>,
}

/// Ids of every node in definition order: blocks, then loops, then parallels.
fn node_ids(def: &WorkflowDefinition) -> Vec<String> {
    def.blocks
        .iter()
        .map(|b| b.id.clone())
        .chain(def.loops.iter().map(|g| g.id.clone()))
        .chain(def.parallels.iter().map(|g| g.id.clone()))
        .collect()
}

/// Group id, members and kind for every group.
fn groups(def: &WorkflowDefinition) -> Vec<(&str, &[String], GroupKind)> {
    def.loops
        .iter()
        .map(|g| (g.id.as_str(), g.nodes.as_slice(), GroupKind::Loop))
        .chain(
            def.parallels
                .iter()
                .map(|g| (g.id.as_str(), g.nodes.as_slice(), GroupKind::Parallel)),
        )
        .collect()
}

fn validate_ids(def: &WorkflowDefinition) -> Result<HashSet<String>, StructuralError> {
    let mut seen = HashSet::new();
    for id in node_ids(def) {
        if id.trim().is_empty() {
            return Err(StructuralError::EmptyBlockId);
        }
        if !seen.insert(id.clone()) {
            return Err(StructuralError::DuplicateId(id));
        }
    }
    Ok(seen)
}

fn validate_iteration(group: &str, iteration: &Iteration) -> Result<(), StructuralError> {
    if let Iteration::Collection { items } = iteration {
        if !matches!(items, Value::Array(_) | Value::String(_)) {
            return Err(StructuralError::InvalidIteration {
                group: group.to_string(),
                reason: "items must be an array, a JSON array string, or a reference".to_string(),
            });
        }
    }
    Ok(())
}

/// Builds the member-to-group map, rejecting unknown, overlapping and
/// self-containing memberships.
fn build_parents(
    def: &WorkflowDefinition,
    known: &HashSet<String>,
) -> Result<HashMap<String, String>, StructuralError> {
    let mut parents: HashMap<String, String> = HashMap::new();

    for (group, nodes, _) in groups(def) {
        for member in nodes {
            if member == group {
                return Err(StructuralError::SelfNestedGroup(group.to_string()));
            }
            if !known.contains(member) {
                return Err(StructuralError::UnknownGroupMember {
                    group: group.to_string(),
                    member: member.clone(),
                });
            }
            if let Some(first) = parents.get(member) {
                if first != group {
                    return Err(StructuralError::OverlappingGroups {
                        node: member.clone(),
                        first: first.clone(),
                        second: group.to_string(),
                    });
                }
            }
            parents.insert(member.clone(), group.to_string());
        }
    }

    // Nesting must be a tree: walking up from any group ends at the root.
    for (group, _, _) in groups(def) {
        let mut current = parents.get(group);
        let mut steps = 0;
        while let Some(parent) = current {
            if parent == group || steps > parents.len() {
                return Err(StructuralError::SelfNestedGroup(group.to_string()));
            }
            current = parents.get(parent);
            steps += 1;
        }
    }

    Ok(parents)
}

fn find_entry(
    def: &WorkflowDefinition,
    registry: &HandlerRegistry,
    parents: &HashMap<String, String>,
) -> Result<String, StructuralError> {
    let entries: Vec<String> = def
        .blocks
        .iter()
        .filter(|b| {
            registry
                .get(&b.block_type)
                .map(|h| h.is_entry())
                .unwrap_or(false)
        })
        .map(|b| b.id.clone())
        .collect();

    let entry = match entries.len() {
        0 => return Err(StructuralError::MissingEntryBlock),
        1 => entries[0].clone(),
        _ => return Err(StructuralError::MultipleEntryBlocks(entries)),
    };

    if let Some(group) = parents.get(&entry) {
        return Err(StructuralError::EntryInsideGroup {
            block: entry,
            group: group.clone(),
        });
    }

    if let Some(edge) = def.edges.iter().find(|e| e.target == entry) {
        return Err(StructuralError::EntryHasIncomingEdge {
            block: entry,
            edge: edge.label(),
        });
    }

    Ok(entry)
}

/// Sorts every edge into the scope it lives in.
fn classify_edges(
    def: &WorkflowDefinition,
    known: &HashSet<String>,
    parents: &HashMap<String, String>,
) -> Result<HashMap<Option<String>, Vec<PlanEdge>>, StructuralError> {
    let mut by_scope: HashMap<Option<String>, Vec<PlanEdge>> = HashMap::new();

    for edge in &def.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !known.contains(endpoint) {
                return Err(StructuralError::UnknownEdgeEndpoint {
                    edge: edge.label(),
                    endpoint: endpoint.clone(),
                });
            }
        }

        let source_scope = parents.get(&edge.source);
        let target_scope = parents.get(&edge.target);

        if source_scope == target_scope {
            by_scope
                .entry(source_scope.cloned())
                .or_default()
                .push(PlanEdge::new(
                    edge.source.clone(),
                    edge.target.clone(),
                    edge.source_handle.clone(),
                ));
        } else if target_scope == Some(&edge.source) {
            debug!(
                "Edge '{}' marks '{}' as an entry of group '{}'",
                edge.label(),
                edge.target,
                edge.source
            );
        } else {
            let group = target_scope.or(source_scope).cloned().unwrap_or_default();
            return Err(StructuralError::EdgeCrossesGroup {
                edge: edge.label(),
                group,
            });
        }
    }

    Ok(by_scope)
}

/// Maps normalized reference names and ids to node ids.
///
/// Only the entry block may take the `start` prefix.
fn build_prefixes(
    def: &WorkflowDefinition,
    entry: &str,
) -> Result<HashMap<String, String>, StructuralError> {
    let named = def
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), b.name.as_str()))
        .chain(def.loops.iter().map(|g| (g.id.as_str(), g.name.as_str())))
        .chain(def.parallels.iter().map(|g| (g.id.as_str(), g.name.as_str())));

    let mut prefixes: HashMap<String, String> = HashMap::new();
    for (id, name) in named {
        for label in [name, id] {
            let prefix = normalize_name(label);
            if prefix.is_empty() {
                continue;
            }
            if is_system_prefix(&prefix) && !(prefix == START_PREFIX && id == entry) {
                return Err(StructuralError::ReservedReferenceName {
                    node: id.to_string(),
                    name: prefix,
                });
            }
            match prefixes.get(&prefix) {
                Some(existing) if existing != id => {
                    return Err(StructuralError::DuplicateReferenceName {
                        name: prefix,
                        first: existing.clone(),
                        second: id.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    prefixes.insert(prefix, id.to_string());
                }
            }
        }
    }

    Ok(prefixes)
}

/// Sorts one scope with Kahn's algorithm; ties keep definition order.
fn topological_sort(nodes: &[String], edges: &[PlanEdge]) -> Result<Vec<String>, StructuralError> {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
            *degree += 1;
        }
        successors
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n) == Some(&0))
        .collect();

    let mut sorted: Vec<String> = Vec::new();
    while let Some(current) = queue.pop_front() {
        sorted.push(current.to_string());
        for next in successors.get(current).cloned().unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if sorted.len() != nodes.len() {
        let mut remaining: Vec<String> = nodes
            .iter()
            .filter(|n| !sorted.contains(n))
            .cloned()
            .collect();
        remaining.sort();
        return Err(StructuralError::CyclicDependency(remaining));
    }

    Ok(sorted)
}

/// Validates the whole definition and lays out its scopes.
pub fn validate_workflow(
    def: &WorkflowDefinition,
    registry: &HandlerRegistry,
) -> Result<GraphLayout, StructuralError> {
    info!(
        "Validating workflow '{}' with {} blocks, {} loops, {} parallels",
        def.id,
        def.blocks.len(),
        def.loops.len(),
        def.parallels.len()
    );

    if def.blocks.is_empty() {
        return Err(StructuralError::EmptyWorkflow);
    }

    let known = validate_ids(def)?;

    for block in &def.blocks {
        if !registry.contains(&block.block_type) {
            return Err(StructuralError::UnknownBlockType {
                block: block.id.clone(),
                block_type: block.block_type.clone(),
            });
        }
        if !block.enabled {
            debug!("Block '{}' is disabled", block.id);
        }
    }

    for group in &def.loops {
        validate_iteration(&group.id, &group.iteration)?;
    }
    for group in &def.parallels {
        validate_iteration(&group.id, &group.iteration)?;
        if group.max_concurrency == Some(0) {
            return Err(StructuralError::InvalidIteration {
                group: group.id.clone(),
                reason: "max_concurrency must be at least 1".to_string(),
            });
        }
    }

    let parents = build_parents(def, &known)?;
    let entry = find_entry(def, registry, &parents)?;
    let mut edges = classify_edges(def, &known, &parents)?;
    let prefixes = build_prefixes(def, &entry)?;

    let mut members: HashMap<Option<String>, Vec<String>> = HashMap::new();
    for id in node_ids(def) {
        members.entry(parents.get(&id).cloned()).or_default().push(id);
    }
    for (group, _, _) in groups(def) {
        members.entry(Some(group.to_string())).or_default();
    }

    let mut scopes = HashMap::new();
    for (scope, nodes) in members {
        let scope_edges = edges.remove(&scope).unwrap_or_default();
        let order = topological_sort(&nodes, &scope_edges)?;
        if let Some(group) = &scope {
            if order.is_empty() {
                warn!("Group '{}' has no members", group);
            }
        }
        scopes.insert(
            scope,
            ScopeLayout {
                order,
                edges: scope_edges,
            },
        );
    }

    info!(
        "Workflow validated: entry '{}', {} scopes",
        entry,
        scopes.len()
    );

    Ok(GraphLayout {
        entry,
        parents,
        scopes,
        prefixes,
    })
}

/// Quick validation that returns every problem found as a message.
///
/// Checks only local properties; useful for editor feedback.
pub fn quick_validate(def: &WorkflowDefinition, registry: &HandlerRegistry) -> Vec<String> {
    let mut errors = Vec::new();

    if def.blocks.is_empty() {
        errors.push(StructuralError::EmptyWorkflow.to_string());
        return errors;
    }

    let mut seen = HashSet::new();
    for id in node_ids(def) {
        if id.trim().is_empty() {
            errors.push(StructuralError::EmptyBlockId.to_string());
        } else if !seen.insert(id.clone()) {
            errors.push(StructuralError::DuplicateId(id).to_string());
        }
    }

    for block in &def.blocks {
        if !registry.contains(&block.block_type) {
            errors.push(
                StructuralError::UnknownBlockType {
                    block: block.id.clone(),
                    block_type: block.block_type.clone(),
                }
                .to_string(),
            );
        }
    }

    for edge in &def.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint) {
                errors.push(
                    StructuralError::UnknownEdgeEndpoint {
                        edge: edge.label(),
                        endpoint: endpoint.clone(),
                    }
                    .to_string(),
                );
            }
        }
    }

    for (group, nodes, _) in groups(def) {
        for member in nodes {
            if !seen.contains(member) {
                errors.push(
                    StructuralError::UnknownGroupMember {
                        group: group.to_string(),
                        member: member.clone(),
                    }
                    .to_string(),
                );
            }
        }
    }

    errors
}

//! Fetch-plan resolution.
//!
//! [`resolve`] turns a root entity type, an optional entity graph, and a
//! [`GraphSemantic`] into a [`FetchPlan`]: an EAGER/LAZY decision for every
//! attribute reachable through eager associations, addressed by path relative
//! to the root (`"pets"`, `"pets.master"`).
//!
//! Rules, applied per attribute:
//!
//! 1. Identifier and version attributes are always EAGER.
//! 2. An attribute named by the graph is EAGER; resolution continues into its
//!    subgraph.
//! 3. Otherwise `Load` keeps the mapping default and `Fetch` makes it LAZY.
//! 4. An eager association with no subgraph expands into its target with no
//!    graph, unless the target already appears on the current path.

use persist_core::{
    AttributeNode, Error, FetchType, GraphNode, GraphSemantic, MetadataProvider, NavigableRole,
    Result, RootGraph,
};
use std::fmt;

/// Whether an attribute is loaded with its owner or on first access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchDecision {
    Eager,
    Lazy,
}

impl FetchDecision {
    pub const fn is_eager(self) -> bool {
        matches!(self, FetchDecision::Eager)
    }
}

impl From<FetchType> for FetchDecision {
    fn from(fetch: FetchType) -> Self {
        match fetch {
            FetchType::Eager => FetchDecision::Eager,
            FetchType::Lazy => FetchDecision::Lazy,
        }
    }
}

impl fmt::Display for FetchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchDecision::Eager => "EAGER",
            FetchDecision::Lazy => "LAZY",
        })
    }
}

/// Structural role of a resolved attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchKind {
    Identifier,
    Basic,
    ToOne { target: String },
    Collection { target: String },
}

/// Decision for one attribute, plus the plan for its target when it is an
/// expanded eager association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeFetch {
    name: String,
    role: NavigableRole,
    decision: FetchDecision,
    kind: FetchKind,
    child: Option<FetchNode>,
}

impl AttributeFetch {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &NavigableRole {
        &self.role
    }

    pub fn decision(&self) -> FetchDecision {
        self.decision
    }

    pub fn kind(&self) -> &FetchKind {
        &self.kind
    }

    pub fn is_association(&self) -> bool {
        matches!(
            self.kind,
            FetchKind::ToOne { .. } | FetchKind::Collection { .. }
        )
    }

    /// Plan for the association target. `None` for lazy associations and for
    /// eager ones cut to avoid a cycle.
    pub fn child(&self) -> Option<&FetchNode> {
        self.child.as_ref()
    }
}

/// Resolved decisions for one entity type at one position in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchNode {
    entity: String,
    role: NavigableRole,
    attributes: Vec<AttributeFetch>,
}

impl FetchNode {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn role(&self) -> &NavigableRole {
        &self.role
    }

    /// Attribute decisions, identifier first, then declaration order.
    pub fn attributes(&self) -> &[AttributeFetch] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeFetch> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Associations this node loads eagerly.
    pub fn eager_associations(&self) -> impl Iterator<Item = &AttributeFetch> {
        self.attributes
            .iter()
            .filter(|a| a.is_association() && a.decision.is_eager())
    }

    fn collect(&self, prefix: &str, out: &mut Vec<(String, FetchDecision)>) {
        for attribute in &self.attributes {
            let path = join_path(prefix, &attribute.name);
            out.push((path.clone(), attribute.decision));
            if let Some(child) = &attribute.child {
                child.collect(&path, out);
            }
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A resolved fetch plan for one root entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    semantic: GraphSemantic,
    root: FetchNode,
}

impl FetchPlan {
    pub fn root(&self) -> &FetchNode {
        &self.root
    }

    pub fn entity(&self) -> &str {
        &self.root.entity
    }

    pub fn semantic(&self) -> GraphSemantic {
        self.semantic
    }

    /// Decision at a path relative to the root, such as `"pets.master"`.
    pub fn decision(&self, path: &str) -> Option<FetchDecision> {
        let mut node = &self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let attribute = node.attribute(segment)?;
            if segments.peek().is_none() {
                return Some(attribute.decision);
            }
            node = attribute.child.as_ref()?;
        }
        None
    }

    /// Every resolved `(path, decision)` in depth-first order.
    pub fn decisions(&self) -> Vec<(String, FetchDecision)> {
        let mut out = Vec::new();
        self.root.collect("", &mut out);
        out
    }

    /// Paths of associations loaded eagerly.
    pub fn eager_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_eager(&self.root, "", &mut paths);
        paths
    }
}

fn collect_eager(node: &FetchNode, prefix: &str, out: &mut Vec<String>) {
    for attribute in node.eager_associations() {
        let path = join_path(prefix, &attribute.name);
        out.push(path.clone());
        if let Some(child) = &attribute.child {
            collect_eager(child, &path, out);
        }
    }
}

/// Resolve the fetch plan for `entity` under `graph` and `semantic`.
///
/// With no graph, `Load` yields the mapping defaults and `Fetch` makes every
/// non-identifier, non-version attribute lazy.
pub fn resolve(
    metadata: &dyn MetadataProvider,
    entity: &str,
    graph: Option<&RootGraph>,
    semantic: GraphSemantic,
) -> Result<FetchPlan> {
    if let Some(graph) = graph {
        if !graph.applies_to(entity) {
            return Err(Error::Mapping(format!(
                "graph rooted at '{}' cannot be applied to '{entity}'",
                graph.entity()
            )));
        }
    }
    let role = NavigableRole::new(entity);
    let mut path = vec![entity.to_string()];
    let root = walk(
        metadata,
        entity,
        graph.map(RootGraph::root),
        semantic,
        &role,
        &mut path,
    )?;
    tracing::trace!(entity = entity, semantic = ?semantic, "Resolved fetch plan");
    Ok(FetchPlan { semantic, root })
}

/// Compose several graphs by deep union, then resolve.
pub fn resolve_composed(
    metadata: &dyn MetadataProvider,
    entity: &str,
    graphs: &[&RootGraph],
    semantic: GraphSemantic,
) -> Result<FetchPlan> {
    if graphs.is_empty() {
        return resolve(metadata, entity, None, semantic);
    }
    let merged = RootGraph::merge(None, graphs)?;
    resolve(metadata, entity, Some(&merged), semantic)
}

fn walk(
    metadata: &dyn MetadataProvider,
    entity: &str,
    node: Option<&GraphNode>,
    semantic: GraphSemantic,
    role: &NavigableRole,
    path: &mut Vec<String>,
) -> Result<FetchNode> {
    let descriptor = metadata.descriptor(entity)?;
    let identifier = descriptor.identifier();
    let version = descriptor.version_attribute().map(|v| v.name().to_string());

    let mut attributes = Vec::with_capacity(descriptor.attributes().len() + 1);
    attributes.push(AttributeFetch {
        name: identifier.name().to_string(),
        role: role.append(identifier.name()),
        decision: FetchDecision::Eager,
        kind: FetchKind::Identifier,
        child: None,
    });

    for attribute in descriptor.attributes() {
        let named = node.and_then(|n| n.find_attribute_node(attribute.name()));
        let decision = if named.is_some() || version.as_deref() == Some(attribute.name()) {
            FetchDecision::Eager
        } else {
            match semantic {
                GraphSemantic::Load => attribute.fetch_type().into(),
                GraphSemantic::Fetch => FetchDecision::Lazy,
            }
        };
        let attribute_role = role.append(attribute.name());

        let kind = match (attribute.target(), attribute.is_collection()) {
            (Some(target), true) => FetchKind::Collection {
                target: target.to_string(),
            },
            (Some(target), false) => FetchKind::ToOne {
                target: target.to_string(),
            },
            (None, _) => FetchKind::Basic,
        };

        let child = match attribute.target() {
            Some(target) if decision.is_eager() => {
                let subgraph = named.and_then(AttributeNode::subgraph);
                if subgraph.is_none() && path.iter().any(|t| t == target) {
                    None
                } else {
                    path.push(target.to_string());
                    let child = walk(metadata, target, subgraph, semantic, &attribute_role, path);
                    path.pop();
                    Some(child?)
                }
            }
            _ => None,
        };

        attributes.push(AttributeFetch {
            name: attribute.name().to_string(),
            role: attribute_role,
            decision,
            kind,
            child,
        });
    }

    Ok(FetchNode {
        entity: entity.to_string(),
        role: role.clone(),
        attributes,
    })
}

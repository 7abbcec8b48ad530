//! Entity graphs: reusable fetch templates.
//!
//! A [`RootGraph`] is a named tree of [`AttributeNode`]s rooted at one
//! entity type. Registered graphs are immutable; callers derive mutable
//! copies with [`RootGraph::make_root_graph`] or [`RootGraph::make_sub_graph`]
//! and refine them per load.
//!
//! ```ignore
//! let mut graph = RootGraph::new(Some("parent-with-pets"), "Parent");
//! graph.add_attribute_nodes(&metamodel, &["pets"])?;
//! graph.add_path(&metamodel, "children.parent")?;
//! metamodel.register_graph(&graph)?;
//! ```

use crate::error::{Error, Result};
use crate::metadata::MetadataProvider;
use std::collections::BTreeMap;
use std::fmt;

/// How attributes a graph does not name are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphSemantic {
    /// Unnamed attributes are lazy regardless of mapping defaults.
    Fetch,
    /// Unnamed attributes keep their mapping defaults.
    Load,
}

impl GraphSemantic {
    /// The standard hint name carrying this semantic.
    pub const fn hint_name(self) -> &'static str {
        match self {
            GraphSemantic::Fetch => "jakarta.persistence.fetchgraph",
            GraphSemantic::Load => "jakarta.persistence.loadgraph",
        }
    }

    /// Resolve a hint name (either the `jakarta` or legacy `javax` prefix).
    pub fn from_hint_name(hint: &str) -> Option<Self> {
        let suffix = hint
            .strip_prefix("jakarta.persistence.")
            .or_else(|| hint.strip_prefix("javax.persistence."))?;
        match suffix {
            "fetchgraph" => Some(GraphSemantic::Fetch),
            "loadgraph" => Some(GraphSemantic::Load),
            _ => None,
        }
    }
}

/// An attribute named by a graph, optionally with a nested graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeNode {
    name: String,
    subgraph: Option<GraphNode>,
}

impl AttributeNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subgraph(&self) -> Option<&GraphNode> {
        self.subgraph.as_ref()
    }
}

/// A set of attribute nodes for one entity type.
#[derive(Clone, PartialEq, Eq)]
pub struct GraphNode {
    entity: String,
    attributes: BTreeMap<String, AttributeNode>,
    mutable: bool,
}

impl GraphNode {
    /// Create an empty, mutable node for `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            attributes: BTreeMap::new(),
            mutable: true,
        }
    }

    /// Entity type this node describes.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attribute nodes in name order.
    pub fn attribute_nodes(&self) -> impl Iterator<Item = &AttributeNode> {
        self.attributes.values()
    }

    pub fn find_attribute_node(&self, name: &str) -> Option<&AttributeNode> {
        self.attributes.get(name)
    }

    pub fn contains_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.mutable {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "graph node for '{}' is immutable; make a mutable copy first",
                self.entity
            )))
        }
    }

    /// Name an attribute. Adding an attribute twice is a no-op.
    pub fn add_attribute_node(
        &mut self,
        metadata: &dyn MetadataProvider,
        name: &str,
    ) -> Result<&mut AttributeNode> {
        self.ensure_mutable()?;
        let descriptor = metadata.descriptor(&self.entity)?;
        if descriptor.identifier().name() != name {
            descriptor.require_attribute(name)?;
        }
        Ok(self
            .attributes
            .entry(name.to_string())
            .or_insert_with(|| AttributeNode {
                name: name.to_string(),
                subgraph: None,
            }))
    }

    /// Name several attributes.
    pub fn add_attribute_nodes(
        &mut self,
        metadata: &dyn MetadataProvider,
        names: &[&str],
    ) -> Result<()> {
        for name in names {
            self.add_attribute_node(metadata, name)?;
        }
        Ok(())
    }

    /// Name an association and return the nested node for its target.
    pub fn add_sub_graph(
        &mut self,
        metadata: &dyn MetadataProvider,
        name: &str,
    ) -> Result<&mut GraphNode> {
        let target = metadata
            .descriptor(&self.entity)?
            .require_attribute(name)?
            .target()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Mapping(format!(
                    "{}.{name} is not an association and cannot have a subgraph",
                    self.entity
                ))
            })?;
        let mutable = self.mutable;
        let node = self.add_attribute_node(metadata, name)?;
        Ok(node.subgraph.get_or_insert_with(|| GraphNode {
            entity: target,
            attributes: BTreeMap::new(),
            mutable,
        }))
    }

    /// Name a dotted path such as `"children.parent"`, creating subgraphs
    /// for every segment but the last.
    pub fn add_path(&mut self, metadata: &dyn MetadataProvider, path: &str) -> Result<()> {
        let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();
        let mut node = self;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.add_attribute_node(metadata, segment)?;
            } else {
                node = node.add_sub_graph(metadata, segment)?;
            }
        }
        Ok(())
    }

    /// Deep union with `other`: attributes are unioned and nested graphs for
    /// the same attribute are merged recursively.
    pub fn merge(&mut self, other: &GraphNode) -> Result<()> {
        self.ensure_mutable()?;
        if self.entity != other.entity {
            return Err(Error::Mapping(format!(
                "cannot merge a graph for '{}' into a graph for '{}'",
                other.entity, self.entity
            )));
        }
        for (name, incoming) in &other.attributes {
            match self.attributes.get_mut(name) {
                None => {
                    let mut copy = incoming.clone();
                    if let Some(sub) = copy.subgraph.as_mut() {
                        sub.set_mutable(true);
                    }
                    self.attributes.insert(name.clone(), copy);
                }
                Some(existing) => {
                    let Some(theirs) = &incoming.subgraph else {
                        continue;
                    };
                    match existing.subgraph.as_mut() {
                        Some(mine) => mine.merge(theirs)?,
                        None => {
                            let mut copy = theirs.clone();
                            copy.set_mutable(true);
                            existing.subgraph = Some(copy);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn set_mutable(&mut self, mutable: bool) {
        self.mutable = mutable;
        for node in self.attributes.values_mut() {
            if let Some(sub) = node.subgraph.as_mut() {
                sub.set_mutable(mutable);
            }
        }
    }

    fn copy_with(&self, mutable: bool) -> GraphNode {
        let mut copy = self.clone();
        copy.set_mutable(mutable);
        copy
    }

    fn render(&self, out: &mut String) {
        out.push('(');
        for (i, node) in self.attributes.values().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&node.name);
            if let Some(sub) = &node.subgraph {
                sub.render(out);
            }
        }
        out.push(')');
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.entity.clone();
        self.render(&mut out);
        f.write_str(&out)
    }
}

/// A named graph rooted at an entity type.
#[derive(Clone, PartialEq, Eq)]
pub struct RootGraph {
    name: Option<String>,
    root: GraphNode,
}

impl RootGraph {
    /// Create an empty, mutable root graph.
    pub fn new(name: Option<&str>, entity: impl Into<String>) -> Self {
        Self {
            name: name.map(str::to_string),
            root: GraphNode::new(entity),
        }
    }

    /// An immutable graph naming every non-identifier attribute of `entity`.
    pub fn all_attributes(
        metadata: &dyn MetadataProvider,
        entity: &str,
        name: Option<&str>,
    ) -> Result<Self> {
        let mut graph = RootGraph::new(name, entity);
        let names: Vec<String> = metadata
            .attributes_of(entity)?
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        for attribute in &names {
            graph.root.add_attribute_node(metadata, attribute)?;
        }
        graph.root.set_mutable(false);
        Ok(graph)
    }

    /// Union several graphs for the same entity into one immutable graph.
    pub fn merge(name: Option<&str>, graphs: &[&RootGraph]) -> Result<Self> {
        let first = graphs
            .first()
            .ok_or_else(|| Error::Mapping("cannot merge an empty list of graphs".to_string()))?;
        let mut merged = first.make_root_graph(name, true);
        for graph in &graphs[1..] {
            merged.root.merge(&graph.root)?;
        }
        merged.root.set_mutable(false);
        Ok(merged)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Root entity type.
    pub fn entity(&self) -> &str {
        self.root.entity()
    }

    /// Whether this graph can be used to load `entity`.
    pub fn applies_to(&self, entity: &str) -> bool {
        self.root.entity() == entity
    }

    pub fn is_mutable(&self) -> bool {
        self.root.is_mutable()
    }

    pub fn root(&self) -> &GraphNode {
        &self.root
    }

    /// Mutable access to the root node; fails for immutable graphs.
    pub fn root_mut(&mut self) -> Result<&mut GraphNode> {
        self.root.ensure_mutable()?;
        Ok(&mut self.root)
    }

    pub fn attribute_nodes(&self) -> impl Iterator<Item = &AttributeNode> {
        self.root.attribute_nodes()
    }

    pub fn find_attribute_node(&self, name: &str) -> Option<&AttributeNode> {
        self.root.find_attribute_node(name)
    }

    pub fn contains_attribute(&self, name: &str) -> bool {
        self.root.contains_attribute(name)
    }

    pub fn add_attribute_nodes(
        &mut self,
        metadata: &dyn MetadataProvider,
        names: &[&str],
    ) -> Result<()> {
        self.root.add_attribute_nodes(metadata, names)
    }

    pub fn add_sub_graph(
        &mut self,
        metadata: &dyn MetadataProvider,
        name: &str,
    ) -> Result<&mut GraphNode> {
        self.root.add_sub_graph(metadata, name)
    }

    pub fn add_path(&mut self, metadata: &dyn MetadataProvider, path: &str) -> Result<()> {
        self.root.add_path(metadata, path)
    }

    /// Copy this graph under a new name with the requested mutability.
    pub fn make_root_graph(&self, name: Option<&str>, mutable: bool) -> RootGraph {
        RootGraph {
            name: name.map(str::to_string),
            root: self.root.copy_with(mutable),
        }
    }

    /// Copy the root node as a free-standing subgraph.
    pub fn make_sub_graph(&self, mutable: bool) -> GraphNode {
        self.root.copy_with(mutable)
    }

    /// Immutable copy, suitable for registration and sharing.
    pub fn make_immutable_copy(&self, name: Option<&str>) -> RootGraph {
        self.make_root_graph(name.or(self.name.as_deref()), false)
    }
}

impl fmt::Debug for RootGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RootGraph[{}]{:?}",
            self.name.as_deref().unwrap_or("<anonymous>"),
            self.root
        )
    }
}

//! Structural paths locating attributes relative to a root entity.

use std::fmt;
use std::sync::Arc;

/// Segment inserted around composite identifiers; never shown in paths.
pub const IDENTIFIER_MAPPER_PROPERTY: &str = "_identifierMapper";

/// A dot-separated path such as `Order.lines.product`.
///
/// The full path is derived once from the parent chain. Appending
/// [`IDENTIFIER_MAPPER_PROPERTY`] yields a role whose full path equals its
/// parent's, so lookups by logical property path stay stable whether or not
/// an identifier wrapper sits in between.
#[derive(Clone)]
pub struct NavigableRole {
    parent: Option<Arc<NavigableRole>>,
    local_name: String,
    full_path: String,
}

impl NavigableRole {
    /// Create a root role for an entity.
    pub fn new(full_path: impl Into<String>) -> Self {
        let full_path = full_path.into();
        Self {
            parent: None,
            local_name: full_path.clone(),
            full_path,
        }
    }

    /// The empty root role.
    pub fn root() -> Self {
        Self::new("")
    }

    /// Create a child role.
    pub fn with_parent(parent: &NavigableRole, navigable_name: impl Into<String>) -> Self {
        let local_name = navigable_name.into();
        let full_path = if local_name == IDENTIFIER_MAPPER_PROPERTY {
            parent.full_path.clone()
        } else {
            let prefix = parent.full_path();
            if prefix.is_empty() {
                local_name.clone()
            } else {
                format!("{prefix}.{local_name}")
            }
        };
        Self {
            parent: Some(Arc::new(parent.clone())),
            local_name,
            full_path,
        }
    }

    /// Append a property, returning the child role.
    pub fn append(&self, property: impl Into<String>) -> Self {
        Self::with_parent(self, property)
    }

    pub fn parent(&self) -> Option<&NavigableRole> {
        self.parent.as_deref()
    }

    pub fn navigable_name(&self) -> &str {
        &self.local_name
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    /// A role with no parent and an empty name.
    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.local_name.is_empty()
    }

    /// The path relative to the root entity, e.g. `lines.product` for
    /// `Order.lines.product`.
    pub fn relative_path(&self) -> &str {
        if self.parent.is_none() {
            return "";
        }
        let mut root = self;
        while let Some(parent) = root.parent() {
            root = parent;
        }
        let prefix = root.full_path();
        if prefix.is_empty() {
            return &self.full_path;
        }
        self.full_path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or("")
    }

    /// Number of segments between this role and its root.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }
}

impl PartialEq for NavigableRole {
    fn eq(&self, other: &Self) -> bool {
        self.full_path == other.full_path
    }
}

impl Eq for NavigableRole {}

impl std::hash::Hash for NavigableRole {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full_path.hash(state);
    }
}

impl fmt::Debug for NavigableRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NavigableRole[{}]", self.full_path)
    }
}

impl fmt::Display for NavigableRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path)
    }
}

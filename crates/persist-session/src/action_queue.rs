//! Ordered queue of pending writes and its batched execution.
//!
//! The flush planner fills the queue in dependency order; [`ActionQueue::execute`]
//! drains it front to back. Consecutive statements that share table, kind,
//! and column layout go out as one batch of at most `write_batch_size`
//! statements. The first failure abandons the rest of the queue.

use crate::identity_map::EntityKey;
use persist_core::{Error, NavigableRole, Result, SqlExecutor, Value, WriteKind, WriteStatement};
use std::fmt;

/// What an action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
    /// A join-table link insert or delete.
    Collection,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Insert => "insert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Collection => "collection",
        })
    }
}

/// One changed column of an update, with its old and new value.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChange {
    pub attribute: String,
    pub column: String,
    pub old: Value,
    pub new: Value,
}

/// What an action writes.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTarget {
    Entity(EntityKey),
    Collection { role: NavigableRole, owner: EntityKey },
}

impl ActionTarget {
    pub fn key(&self) -> &EntityKey {
        match self {
            ActionTarget::Entity(key) | ActionTarget::Collection { owner: key, .. } => key,
        }
    }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    id: usize,
    kind: ActionKind,
    target: ActionTarget,
    statement: WriteStatement,
    changes: Vec<ColumnChange>,
    depends_on: Vec<usize>,
}

impl Action {
    pub fn new(kind: ActionKind, target: ActionTarget, statement: WriteStatement) -> Self {
        Self {
            id: 0,
            kind,
            target,
            statement,
            changes: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_changes(mut self, changes: Vec<ColumnChange>) -> Self {
        self.changes = changes;
        self
    }

    /// Record that this action must run after action `id`.
    #[must_use]
    pub fn after(mut self, id: usize) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// Position in the queue.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn target(&self) -> &ActionTarget {
        &self.target
    }

    pub fn statement(&self) -> &WriteStatement {
        &self.statement
    }

    /// Changed columns of an update; empty for other kinds.
    pub fn changes(&self) -> &[ColumnChange] {
        &self.changes
    }

    pub fn depends_on(&self) -> &[usize] {
        &self.depends_on
    }

    /// Whether affecting no row means the row was changed concurrently.
    fn requires_row(&self) -> bool {
        matches!(self.target, ActionTarget::Entity(_))
            && matches!(self.statement.kind, WriteKind::Update | WriteKind::Delete)
    }

    fn stale_error(&self) -> Error {
        let key = self.target.key();
        Error::StaleState {
            entity: key.entity().to_string(),
            id: key.id().clone(),
            expected_version: self
                .statement
                .version_check
                .as_ref()
                .map(|(_, version)| version.clone()),
        }
    }
}

/// Result of executing a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of entity updates executed, fix-ups included.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Number of link rows written or removed.
    pub collection_actions: usize,
    /// Round trips to the executor.
    pub batches: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of actions performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.collection_actions
    }
}

/// Dependency-ordered list of pending writes.
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    actions: Vec<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action, returning its id.
    pub fn push(&mut self, mut action: Action) -> usize {
        let id = self.actions.len();
        action.id = id;
        self.actions.push(action);
        id
    }

    pub fn get(&self, id: usize) -> Option<&Action> {
        self.actions.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of actions of `kind`.
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Check that every action comes after the actions it depends on.
    pub fn validate_order(&self) -> Result<()> {
        for action in &self.actions {
            if let Some(dep) = action.depends_on.iter().find(|&&dep| dep >= action.id) {
                return Err(Error::InvalidState(format!(
                    "action {} ({} {}) is queued before its dependency {dep}",
                    action.id,
                    action.kind,
                    action.target.key()
                )));
            }
        }
        Ok(())
    }

    /// Group consecutive compatible actions into batches.
    fn batches(&self, max: usize) -> Vec<&[Action]> {
        let mut batches = Vec::new();
        let mut start = 0;
        while start < self.actions.len() {
            let first = &self.actions[start];
            let mut end = start + 1;
            while end < self.actions.len()
                && end - start < max
                && self.actions[end].kind == first.kind
                && self.actions[end].statement.is_batchable_with(&first.statement)
            {
                end += 1;
            }
            batches.push(&self.actions[start..end]);
            start = end;
        }
        batches
    }

    /// Execute every action in order.
    ///
    /// An entity update or delete that affects no row fails with
    /// `StaleState`. Any failure stops execution; nothing is retried.
    #[tracing::instrument(level = "debug", skip(self, executor))]
    pub fn execute<E: SqlExecutor + ?Sized>(
        &self,
        executor: &mut E,
        write_batch_size: usize,
    ) -> Result<FlushResult> {
        self.validate_order()?;
        let mut result = FlushResult::default();

        for batch in self.batches(write_batch_size.max(1)) {
            let first = &batch[0];
            tracing::debug!(
                table = %first.statement.table,
                kind = %first.kind,
                count = batch.len(),
                "Executing write batch"
            );

            let affected = if batch.len() == 1 {
                vec![executor.execute_write(&first.statement)?]
            } else {
                let statements: Vec<WriteStatement> =
                    batch.iter().map(|a| a.statement.clone()).collect();
                executor.execute_batch(&statements)?
            };
            result.batches += 1;

            if affected.len() != batch.len() {
                return Err(Error::InvalidState(format!(
                    "executor reported {} results for a batch of {}",
                    affected.len(),
                    batch.len()
                )));
            }

            for (action, rows) in batch.iter().zip(affected) {
                if rows == 0 && action.requires_row() {
                    tracing::debug!(key = %action.target.key(), "Write affected no row");
                    return Err(action.stale_error());
                }
                match action.kind {
                    ActionKind::Insert => result.inserted += 1,
                    ActionKind::Update => result.updated += 1,
                    ActionKind::Delete => result.deleted += 1,
                    ActionKind::Collection => result.collection_actions += 1,
                }
            }
        }

        Ok(result)
    }
}

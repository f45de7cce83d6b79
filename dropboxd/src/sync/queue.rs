use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

/// Front entry of the queue, in drain priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Local relative path for add/update, remote index key for delete.
    pub path: String,
}

/// Pending work derived from one diff run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueue {
    #[serde(default)]
    pub add: VecDeque<String>,
    #[serde(default)]
    pub update: VecDeque<String>,
    #[serde(default)]
    pub delete: VecDeque<String>,
}

impl UploadQueue {
    /// Next operation to run: adds first, then updates, deletes last.
    pub fn peek(&self) -> Option<Operation> {
        let (kind, path) = if let Some(path) = self.add.front() {
            (OperationKind::Add, path)
        } else if let Some(path) = self.update.front() {
            (OperationKind::Update, path)
        } else {
            (OperationKind::Delete, self.delete.front()?)
        };
        Some(Operation {
            kind,
            path: path.clone(),
        })
    }

    /// Drops the entry returned by the last [`peek`](Self::peek).
    pub fn complete(&mut self, kind: OperationKind) -> Option<String> {
        match kind {
            OperationKind::Add => self.add.pop_front(),
            OperationKind::Update => self.update.pop_front(),
            OperationKind::Delete => self.delete.pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.update.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

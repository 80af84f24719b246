use std::collections::HashMap;

use rusqlite::types::Value;
use serde::Serialize;

use super::source::Origin;
use crate::{AppError, AppResult};

/// A primary row's identity in the database it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemapKey {
    pub origin: Origin,
    pub original_id: i64,
}

impl RemapKey {
    pub fn new(origin: Origin, original_id: i64) -> Self {
        Self {
            origin,
            original_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemapEntry {
    pub new_id: i64,
    pub is_winner: bool,
}

/// What a child row's parent reference resolves to in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapLookup {
    /// Parent survived; re-point the child at this id.
    Winner(i64),
    /// Parent lost to the other source's row; the child is dropped.
    Loser(i64),
    /// Parent never reached the output.
    Dangling,
}

/// Maps `(origin, original id)` to the primary row's id in the output.
///
/// For an overlapping business key both sides point at the same new id and
/// only the winner's side carries `is_winner`.
#[derive(Debug, Clone, Default)]
pub struct IdRemap {
    entries: HashMap<RemapKey, RemapEntry>,
}

impl IdRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register_winner(&mut self, origin: Origin, original_id: i64, new_id: i64) -> AppResult<()> {
        self.register(RemapKey::new(origin, original_id), RemapEntry { new_id, is_winner: true })
    }

    pub fn register_loser(&mut self, origin: Origin, original_id: i64, new_id: i64) -> AppResult<()> {
        self.register(RemapKey::new(origin, original_id), RemapEntry { new_id, is_winner: false })
    }

    fn register(&mut self, key: RemapKey, entry: RemapEntry) -> AppResult<()> {
        if let Some(existing) = self.entries.get(&key) {
            if *existing == entry {
                return Ok(());
            }
            return Err(AppError::new(
                "MERGE/REMAP_CONFLICT",
                "Original id is already mapped to a different output row",
            )
            .with_context("origin", key.origin.as_str())
            .with_context("original_id", key.original_id.to_string())
            .with_context("existing_new_id", existing.new_id.to_string())
            .with_context("new_id", entry.new_id.to_string()));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn get(&self, origin: Origin, original_id: i64) -> Option<RemapEntry> {
        self.entries.get(&RemapKey::new(origin, original_id)).copied()
    }

    pub fn lookup(&self, origin: Origin, original_id: i64) -> RemapLookup {
        match self.get(origin, original_id) {
            Some(RemapEntry { new_id, is_winner: true }) => RemapLookup::Winner(new_id),
            Some(RemapEntry { new_id, is_winner: false }) => RemapLookup::Loser(new_id),
            None => RemapLookup::Dangling,
        }
    }

    /// Resolve a raw foreign-key cell. Only integer references (or text that
    /// parses as one) can point at a primary row.
    pub fn resolve(&self, origin: Origin, value: &Value) -> RemapLookup {
        let original_id = match value {
            Value::Integer(id) => *id,
            Value::Text(text) => match text.trim().parse::<i64>() {
                Ok(id) => id,
                Err(_) => return RemapLookup::Dangling,
            },
            _ => return RemapLookup::Dangling,
        };
        self.lookup(origin, original_id)
    }
}

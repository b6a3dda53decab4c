//! Collects the IDs of entity-change records produced by the current unit of
//! work so the sync layer can ship them once the transaction commits.
//!
//! IDs are stored under [`keys::ENTITY_CHANGE_IDS`] of the active execution
//! context and only ever appended; [`get_and_clear_entity_change_ids`] is the
//! single drain step.

use crate::core::context::{self, keys};
use crate::Result;

/// Appends `id` unless the context was told to ignore entity changes.
pub fn put_entity_change_id(id: i64) -> Result<()> {
    if matches!(
        context::get(keys::IGNORE_ENTITY_CHANGE_IDS)?,
        Some(serde_json::Value::Bool(true))
    ) {
        return Ok(());
    }
    let mut ids = entity_change_ids()?;
    ids.push(id);
    context::set(keys::ENTITY_CHANGE_IDS, ids)
}

/// Stops accumulation for the rest of the current scope.
pub fn ignore_entity_change_ids() -> Result<()> {
    context::set(keys::IGNORE_ENTITY_CHANGE_IDS, true)
}

/// Returns the accumulated IDs in insertion order without clearing them.
pub fn entity_change_ids() -> Result<Vec<i64>> {
    Ok(context::get_as::<Vec<i64>>(keys::ENTITY_CHANGE_IDS)?.unwrap_or_default())
}

/// Returns the accumulated IDs and empties the list.
pub fn get_and_clear_entity_change_ids() -> Result<Vec<i64>> {
    let ids = entity_change_ids()?;
    context::set(keys::ENTITY_CHANGE_IDS, Vec::<i64>::new())?;
    Ok(ids)
}

// Namespace and field-path validation shared by the wire commands and the
// HTTP surface.

use crate::error::{CommandError, ErrorCode};

/// Collections with this prefix are reserved for internal bookkeeping.
pub const RESERVED_PREFIX: &str = "_stratum_";

const MAX_DB_NAME_LEN: usize = 64;

pub fn validate_db_name(db: &str) -> Result<(), CommandError> {
    if db.is_empty() {
        return Err(CommandError::invalid_namespace("database name is empty"));
    }
    if db.len() > MAX_DB_NAME_LEN {
        return Err(CommandError::invalid_namespace(format!(
            "database name is too long: {db}"
        )));
    }
    if db
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '.' | ' ' | '"' | '$' | '\0'))
    {
        return Err(CommandError::invalid_namespace(format!(
            "invalid character in database name: {db}"
        )));
    }
    Ok(())
}

pub fn validate_collection_name(coll: &str) -> Result<(), CommandError> {
    if coll.is_empty() {
        return Err(CommandError::invalid_namespace("collection name is empty"));
    }
    if coll.starts_with(RESERVED_PREFIX) {
        return Err(CommandError::invalid_namespace(format!(
            "collection name {coll} is reserved"
        )));
    }
    if coll.chars().any(|c| matches!(c, '$' | '\0')) {
        return Err(CommandError::invalid_namespace(format!(
            "invalid character in collection name: {coll}"
        )));
    }
    if coll.starts_with('.') || coll.ends_with('.') || coll.contains("..") {
        return Err(CommandError::invalid_namespace(format!(
            "collection name has an empty segment: {coll}"
        )));
    }
    Ok(())
}

/// Split `db.collection`; the collection part may itself contain dots.
pub fn split_namespace(ns: &str) -> Option<(&str, &str)> {
    let (db, coll) = ns.split_once('.')?;
    if db.is_empty() || coll.is_empty() {
        return None;
    }
    Some((db, coll))
}

/// Validate a dotted field path used by update operators; every segment must
/// be nonempty.
pub fn validate_field_path(path: &str) -> Result<(), CommandError> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(CommandError::new(
            ErrorCode::PathContainsEmptyElement,
            format!("field path {path:?} contains an empty element"),
        ));
    }
    Ok(())
}

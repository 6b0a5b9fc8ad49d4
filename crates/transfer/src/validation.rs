use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a session key is a single plain file name.
///
/// The fake session stores each entity under `<root>/<session_key>`, so a
/// key must never name a directory or escape the root.
pub fn validate_session_key(session_key: &str) -> Result<(), TransferError> {
    if session_key.is_empty() {
        return Err(TransferError::InvalidSessionKey("empty key".into()));
    }

    let mut components = Path::new(session_key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidSessionKey(format!(
            "not a plain file name: {session_key}"
        ))),
    }
}

/// Input validation functions for all adapter routes
use lookout_db::PlayerName;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Server name cannot be empty")]
    ServerNameEmpty,

    #[error("Server name too long (max 100 characters, got {0})")]
    ServerNameTooLong(usize),

    #[error("{field} cannot be empty")]
    LabelEmpty { field: &'static str },

    #[error("{field} too long (max {max} characters, got {actual})")]
    LabelTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("Report batch too large (max {max} entries, got {actual})")]
    BatchTooLarge { max: usize, actual: usize },
}

/// Validates a Minecraft player name and converts it to its inline form
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only alphanumeric characters and underscores
pub fn validate_player_name(name: &str) -> Result<PlayerName, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    PlayerName::from(name).map_err(|_| ValidationError::PlayerNameTooLong(name.len()))
}

/// Validates a user-provided server name
///
/// Rules:
/// - Cannot be empty or whitespace only
/// - Max 100 characters
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::ServerNameEmpty);
    }

    let len = name.chars().count();
    if len > 100 {
        return Err(ValidationError::ServerNameTooLong(len));
    }

    Ok(())
}

/// Validates a free-form label such as a world name, game mode or weapon
pub fn validate_label(field: &'static str, value: &str) -> Result<(), ValidationError> {
    const MAX_LABEL: usize = 64;

    if value.trim().is_empty() {
        return Err(ValidationError::LabelEmpty { field });
    }

    let len = value.chars().count();
    if len > MAX_LABEL {
        return Err(ValidationError::LabelTooLong {
            field,
            max: MAX_LABEL,
            actual: len,
        });
    }

    Ok(())
}

/// Validates the size of a batched sample report
///
/// Rules:
/// - Max 1000 entries per request (prevents DOS)
pub fn validate_batch<T>(entries: &[T]) -> Result<(), ValidationError> {
    const MAX_BATCH: usize = 1000;

    if entries.len() > MAX_BATCH {
        return Err(ValidationError::BatchTooLarge {
            max: MAX_BATCH,
            actual: entries.len(),
        });
    }

    Ok(())
}

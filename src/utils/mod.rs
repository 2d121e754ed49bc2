use uuid::Uuid;

use crate::api::error;

/// Source of chat identifiers. Identifiers must be unique and sort by creation time.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Result<String, error::SystemError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn new_id(&self) -> Result<String, error::SystemError> {
        let id = Uuid::now_v7();
        if id.get_version_num() != 7 {
            return Err(error::SystemError::id_generation("could not generate a new UUIDv7"));
        }
        Ok(id.to_string())
    }
}

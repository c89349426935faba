//! Entity manager configuration.

use serde::{Deserialize, Serialize};

use crate::EcsError;

/// Largest chunk size accepted by [`EntityManagerConfig::validate`].
pub const MAX_CHUNK_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Tunables for an [`EntityManager`](crate::manager::EntityManager).
///
/// Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityManagerConfig {
    /// Size in bytes of each chunk's backing buffer.
    pub chunk_memory_size: usize,
    /// When false, parallel query iteration runs serially.
    pub parallel_execution: bool,
    /// Release a chunk's buffer as soon as it holds no entities.
    pub release_empty_chunk_memory: bool,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            chunk_memory_size: 128 * 1024,
            parallel_execution: true,
            release_empty_chunk_memory: true,
        }
    }
}

impl EntityManagerConfig {
    /// Check the configuration for values the manager cannot work with.
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.chunk_memory_size == 0 {
            return Err(EcsError::InvalidConfig {
                reason: "chunk_memory_size must be non-zero".to_owned(),
            });
        }
        if self.chunk_memory_size > MAX_CHUNK_MEMORY_SIZE {
            return Err(EcsError::InvalidConfig {
                reason: format!(
                    "chunk_memory_size {} exceeds the maximum of {MAX_CHUNK_MEMORY_SIZE} bytes",
                    self.chunk_memory_size
                ),
            });
        }
        Ok(())
    }
}

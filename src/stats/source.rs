//! Live entity sources
//!
//! A source is one connected bot handle that can list the chat groups it
//! currently sees. Snapshot assembly queries every registered source; a source
//! that errors or times out is skipped without affecting the others.

use async_trait::async_trait;

pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Entity as reported by a live source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    /// Platform-local channel id (without the `platform:` prefix)
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Platform prefix used in stored entity ids (`platform:id`)
    fn platform(&self) -> &str;

    /// List the entities this handle currently knows about
    async fn list_entities(&self) -> Result<Vec<EntityInfo>, SourceError>;
}

/// Fixed entity list, for hosts that push group lists instead of exposing a
/// queryable handle
pub struct StaticEntitySource {
    platform: String,
    entities: Vec<EntityInfo>,
}

impl StaticEntitySource {
    pub fn new(platform: impl Into<String>, entities: Vec<EntityInfo>) -> Self {
        Self {
            platform: platform.into(),
            entities,
        }
    }
}

#[async_trait]
impl EntitySource for StaticEntitySource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn list_entities(&self) -> Result<Vec<EntityInfo>, SourceError> {
        Ok(self.entities.clone())
    }
}

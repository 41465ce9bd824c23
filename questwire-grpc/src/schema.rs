//! Message type registry backed by protobuf descriptor sets.

use std::path::PathBuf;

use prost::Message;
use prost_reflect::{DescriptorPool, MessageDescriptor};
use prost_types::FileDescriptorSet;

use crate::error::{Error, Result};

/// Where to load message definitions from.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// A serialized `FileDescriptorSet` on disk, as written by
    /// `protoc --include_imports --descriptor_set_out`.
    File(PathBuf),
    /// A serialized `FileDescriptorSet` already in memory.
    Bytes { name: String, bytes: Vec<u8> },
    /// A decoded `FileDescriptorSet`.
    Set(FileDescriptorSet),
}

impl SchemaSource {
    fn name(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Bytes { name, .. } => name.clone(),
            Self::Set(set) => set
                .file
                .first()
                .and_then(|f| f.name.clone())
                .unwrap_or_else(|| "<descriptor set>".into()),
        }
    }
}

/// Immutable set of message types, shared by every call on a client.
///
/// Cloning is cheap; clones share the same descriptors.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    pool: DescriptorPool,
}

impl SchemaRegistry {
    /// Load every source into one pool. Any unreadable or invalid source
    /// fails the whole load.
    pub fn load(sources: impl IntoIterator<Item = SchemaSource>) -> Result<Self> {
        let mut pool = DescriptorPool::new();
        for source in sources {
            let source_name = source.name();
            let fail = |reason: String| Error::SchemaLoad {
                source_name: source_name.clone(),
                reason,
            };
            let set = match source {
                SchemaSource::File(path) => {
                    let bytes = std::fs::read(&path).map_err(|e| fail(e.to_string()))?;
                    FileDescriptorSet::decode(bytes.as_slice()).map_err(|e| fail(e.to_string()))?
                }
                SchemaSource::Bytes { bytes, .. } => {
                    FileDescriptorSet::decode(bytes.as_slice()).map_err(|e| fail(e.to_string()))?
                }
                SchemaSource::Set(set) => set,
            };
            if set.file.is_empty() {
                return Err(fail("descriptor set contains no files".into()));
            }
            pool.add_file_descriptor_set(set)
                .map_err(|e| fail(e.to_string()))?;
            tracing::debug!(source = %source_name, "loaded schema source");
        }
        Ok(Self { pool })
    }

    /// Resolve a fully qualified message name (`package.Message`, with or
    /// without a leading dot).
    pub fn lookup(&self, type_name: &str) -> Result<MessageDescriptor> {
        let name = type_name.strip_prefix('.').unwrap_or(type_name);
        self.pool
            .get_message_by_name(name)
            .ok_or_else(|| Error::UnknownType(type_name.to_string()))
    }

    /// Fully qualified names of every loaded message type.
    pub fn message_names(&self) -> impl Iterator<Item = String> + '_ {
        self.pool.all_messages().map(|m| m.full_name().to_string())
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

// ABOUTME: Marshalling seam between application items and wire records.
// ABOUTME: Every request carries the schema's version id so the server decodes to match.

use vellum_grpc::Result;
use vellum_proto as proto;

/// Converts application items to and from wire records.
pub trait Schema: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Version attached to every request made with this schema.
    fn schema_version_id(&self) -> u32;

    fn marshal(&self, item: &Self::Item) -> Result<proto::Item>;

    fn unmarshal(&self, item: proto::Item) -> Result<Self::Item>;

    fn unmarshal_all(&self, items: Vec<proto::Item>) -> Result<Vec<Self::Item>> {
        items.into_iter().map(|item| self.unmarshal(item)).collect()
    }
}

/// Passes wire records through untouched.
#[derive(Debug, Clone, Copy)]
pub struct RawSchema {
    version: u32,
}

impl RawSchema {
    pub fn new(version: u32) -> Self {
        Self { version }
    }
}

impl Schema for RawSchema {
    type Item = proto::Item;

    fn schema_version_id(&self) -> u32 {
        self.version
    }

    fn marshal(&self, item: &proto::Item) -> Result<proto::Item> {
        Ok(item.clone())
    }

    fn unmarshal(&self, item: proto::Item) -> Result<proto::Item> {
        Ok(item)
    }
}

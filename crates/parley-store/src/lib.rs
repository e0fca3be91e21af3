pub mod blobs;
pub mod conversations;
pub mod database;
pub mod error;
pub mod schema;

pub use blobs::{BlobHealth, BlobStore, FsBlobStore, StoredBlob};
pub use conversations::{valid_attribute_key, ConversationRepo, ConversationStore};
pub use database::Database;
pub use error::StoreError;

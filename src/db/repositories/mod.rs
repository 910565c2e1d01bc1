pub mod api_key_repository;

pub use api_key_repository::{ApiKeyRepository, KeyDirectory};

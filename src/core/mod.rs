pub mod handler;
pub mod store;

pub use handler::{FindOneOptions, QueryHandler};
pub use store::{DeleteResult, DocumentStore, StoreError, UpdateResult};

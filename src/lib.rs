//! # docfilter
//!
//! Turns HTTP query strings into document-store filters that user input cannot escape.
//!
//! - [`Query`]: request-scoped filter builder (pagination, sort, select, populate, text search,
//!   operators, root constraints)
//! - [`QueryOptions`]: per-collection allow-lists binding a query to [`FindOptions`]
//! - [`QueryHandler`]: runs queries against any [`DocumentStore`], including searches inside
//!   embedded arrays
//! - [`QueryHistory`]: diff-based change history with revert
//!
//! ```rust,ignore
//! let app = Router::new().route("/articles", get(list_articles));
//!
//! async fn list_articles(mut query: Query) -> Result<Json<SearchPage>, QueryError> {
//!     query.add_root(doc! { "deleted": false });
//!     Ok(Json(handler.search(&mut query).await?))
//! }
//! ```

pub mod core;
pub mod errors;
mod extract;
pub mod filtering;
pub mod history;
pub mod models;
pub mod options;
pub mod query;
pub mod subdoc;

pub use crate::core::{DocumentStore, FindOneOptions, QueryHandler, StoreError};
pub use errors::{FieldError, QueryError};
pub use filtering::page_link_header;
pub use history::{HistoryEntry, QueryHistory};
pub use models::{FindOptions, PopulateRequest, PopulateSpec, SearchPage, SearchParams};
pub use options::{PopulateOn, PopulateRule, QueryOptions, QueryResource, SubOptions};
pub use query::{CreateQueryOptions, Query};

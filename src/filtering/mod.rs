//! # Query parameter translation
//!
//! This module turns HTTP query parameters into document-store filter fragments.
//!
//! ## Query Parameter Examples
//!
//! ```text
//! // Pagination
//! GET /users?limit=10&page=2          -> skip 10, limit 10
//! GET /users?page=0                   -> no windowing
//!
//! // Sorting and selection
//! GET /users?sort=-createdAt,name&select=name,email
//!
//! // Relation expansion
//! GET /users?populate=organization:name,address;team
//!
//! // Filters
//! GET /users?status=active            -> {status: "active"}
//! GET /users?!status=archived         -> {status: {$ne: "archived"}}
//! GET /users?$name=ali                -> {name: {$regex: /ali/i}}
//! GET /users?$in__id=1,2              -> {_id: {$in: ["1", "2"]}}
//! GET /users?$gte_createdAt=2024-01-01&$lt_createdAt=2024-02-01
//!
//! // Full-text search
//! GET /users?$text=search terms       -> {$text: {$search: "search terms"}}
//! ```
//!
//! ## Components
//!
//! - [`params`]: pagination, sort, select, populate and text extraction
//! - [`operators`]: prefixed operator keys
//! - [`sanitize`]: operator-injection neutralisation for literal fields
//! - [`fragment`]: AND/OR wrapping and merging of fragments
//! - [`sort`]: sort tokens to sort documents
//! - [`pagination`]: `Link` header for paged responses

pub mod fragment;
pub mod operators;
pub mod pagination;
pub mod params;
pub mod sanitize;
pub mod sort;

pub use fragment::{and, merge, or};
pub use operators::{Operation, compile_operations, parse_date, text_regex};
pub use pagination::page_link_header;
pub use params::{DEFAULT_LIMIT, Pagination, ParsedParams, parse_params, split_values};
pub use sanitize::{sanitize_document, sanitize_literals};
pub use sort::{is_valid_sort, sort_document};

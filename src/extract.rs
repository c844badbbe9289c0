use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::query::Query;

/// Builds a [`Query`] from the request's query string.
///
/// ```rust,ignore
/// async fn list_articles(
///     State(handler): State<Arc<QueryHandler<MyStore>>>,
///     OriginalUri(uri): OriginalUri,
///     mut query: Query,
/// ) -> Result<(HeaderMap, Json<SearchPage>), QueryError> {
///     let page = handler.search(&mut query).await?;
///     let headers = page_link_header(&uri.to_string(), query.page(), &page);
///     Ok((headers, Json(page)))
/// }
/// ```
impl<S> FromRequestParts<S> for Query
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_query_string(parts.uri.query().unwrap_or_default()))
    }
}

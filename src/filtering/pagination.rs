use axum::http::{
    HeaderValue,
    header::{HeaderMap, LINK},
};
use url::form_urlencoded;

use crate::models::SearchPage;

/// Build the `Link` header (`next`, `last`, `first`, `prev`) for a paged search.
///
/// # Arguments
///
/// * `request_url` - The URL the page was requested with, including its query string.
/// * `page` - The page the client asked for (`None` when it paged with skip/limit).
/// * `results` - The page of results, carrying the total count and the page size.
///
/// # Returns
///
/// A `HeaderMap` holding the `Link` header, or an empty map when the request was not paged
/// or everything fits on one page.
#[must_use]
pub fn page_link_header(request_url: &str, page: Option<u64>, results: &SearchPage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(links) = page_links(request_url, page, results) else {
        return headers;
    };
    match HeaderValue::from_str(&links) {
        Ok(value) => {
            headers.insert(LINK, value);
        }
        Err(error) => tracing::warn!(error = %error, "Could not build Link header"),
    }
    headers
}

/// Comma separated link values, see [`page_link_header`].
#[must_use]
pub fn page_links(request_url: &str, page: Option<u64>, results: &SearchPage) -> Option<String> {
    let current = page.filter(|page| *page > 0)?;
    let limit = results.limit.filter(|limit| *limit > 0)?;
    if results.count < limit {
        return None;
    }

    let pages = results.count.div_ceil(limit);
    let clamp = |page: u64| page.clamp(1, pages);
    let (path, query) = request_url.split_once('?').unwrap_or((request_url, ""));
    let preserved: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .filter(|(key, _)| key != "page" && key != "limit")
        .collect();

    let link = |rel: &str, page: u64| {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&preserved)
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string())
            .finish();
        format!("<{path}?{query}>; rel=\"{rel}\"")
    };

    let mut links = vec![link("next", clamp(current + 1)), link("last", pages)];
    if current > 1 {
        links.push(link("first", 1));
        links.push(link("prev", clamp(current - 1)));
    }
    Some(links.join(","))
}

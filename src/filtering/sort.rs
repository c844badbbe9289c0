use bson::{Document, doc};

/// Sort token that requests ordering by text relevance when a `$text` search is active.
pub const TEXT_SORT: &str = "text";

/// A sort token is valid when, without its `+`/`-` prefix, it names an allowed field or is
/// the special `text` token.
#[must_use]
pub fn is_valid_sort(token: &str, allowed: &[String]) -> bool {
    let field = token
        .strip_prefix('-')
        .or_else(|| token.strip_prefix('+'))
        .unwrap_or(token);
    field == TEXT_SORT || allowed.iter().any(|allowed| allowed == field)
}

/// Keep the tokens permitted by the allow-list; no allow-list keeps everything.
#[must_use]
pub fn filter_sorts(tokens: &[String], allowed: Option<&[String]>) -> Vec<String> {
    match allowed {
        Some(allowed) => tokens
            .iter()
            .filter(|token| is_valid_sort(token, allowed))
            .cloned()
            .collect(),
        None => tokens.to_vec(),
    }
}

/// Convert sort tokens into a sort document.
///
/// `-field` sorts descending, `field` and `+field` ascending, and `text` sorts by relevance
/// score when the query has a text search (otherwise it is an ordinary field named `text`).
#[must_use]
pub fn sort_document(tokens: &[String], has_text_search: bool) -> Document {
    let mut sort = Document::new();
    for token in tokens {
        if token == TEXT_SORT && has_text_search {
            sort.insert("score", doc! { "$meta": "textScore" });
        } else if let Some(field) = token.strip_prefix('-') {
            sort.insert(field, -1);
        } else if let Some(field) = token.strip_prefix('+') {
            sort.insert(field, 1);
        } else {
            sort.insert(token.as_str(), 1);
        }
    }
    sort
}

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::{Bson, Document, doc, oid::ObjectId};
use docfilter::core::{DeleteResult, UpdateResult};
use docfilter::{DocumentStore, FieldError, FindOptions, PopulateSpec, StoreError};

/// In-memory collection understanding the subset of filter, update and projection syntax the
/// handler produces. Pipelines are recorded and answered with canned results.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<Vec<Document>>,
    collections: HashMap<String, Vec<Document>>,
    required: Vec<String>,
    pub finds: Mutex<Vec<(Document, FindOptions)>>,
    pub updates: Mutex<Vec<(Document, Document)>>,
    pub pipelines: Mutex<Vec<Vec<Document>>>,
    aggregate_results: Mutex<Vec<Document>>,
    failure: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: Mutex::new(documents),
            ..Self::default()
        }
    }

    /// Related collection used by `populate`.
    pub fn with_collection(mut self, name: &str, documents: Vec<Document>) -> Self {
        self.collections.insert(name.to_string(), documents);
        self
    }

    /// Fields `insert_one` requires.
    pub fn with_required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_aggregate_results(self, results: Vec<Document>) -> Self {
        *self.aggregate_results.lock().unwrap() = results;
        self
    }

    /// Make the next store call fail.
    pub fn fail_next(&self, error: StoreError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn documents(&self) -> Vec<Document> {
        self.documents.lock().unwrap().clone()
    }

    pub fn document(&self, id: &Bson) -> Option<Document> {
        self.documents()
            .into_iter()
            .find(|document| document.get("_id") == Some(id))
    }

    pub fn last_find(&self) -> (Document, FindOptions) {
        self.finds.lock().unwrap().last().cloned().unwrap()
    }

    pub fn last_update(&self) -> (Document, Document) {
        self.updates.lock().unwrap().last().cloned().unwrap()
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        match self.failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn matching(&self, filter: &Document, options: &FindOptions) -> Vec<Document> {
        let mut found: Vec<Document> = self
            .documents()
            .into_iter()
            .filter(|document| matches(document, filter))
            .collect();
        if let Some(sort) = &options.sort {
            found.sort_by(|a, b| compare_by(a, b, sort));
        }
        let skip = usize::try_from(options.skip.unwrap_or(0)).unwrap();
        let limit = options
            .limit
            .filter(|limit| *limit > 0)
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap());
        found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| project(document, filter, options))
            .collect()
    }

    fn update(&self, filter: &Document, update: &Document, many: bool) -> UpdateResult {
        self.updates
            .lock()
            .unwrap()
            .push((filter.clone(), update.clone()));
        let mut documents = self.documents.lock().unwrap();
        let mut result = UpdateResult::default();
        for document in documents.iter_mut() {
            if matches(document, filter) {
                result.matched += 1;
                let before = document.clone();
                apply_update(document, update, filter);
                if *document != before {
                    result.modified += 1;
                }
                if !many {
                    break;
                }
            }
        }
        result
    }

    fn delete(&self, filter: &Document, many: bool) -> DeleteResult {
        let mut documents = self.documents.lock().unwrap();
        let mut deleted = 0;
        documents.retain(|document| {
            if (many || deleted == 0) && matches(document, filter) {
                deleted += 1;
                false
            } else {
                true
            }
        });
        DeleteResult { deleted }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, mut document: Document) -> Result<Document, StoreError> {
        self.check_failure()?;
        let missing: Vec<FieldError> = self
            .required
            .iter()
            .filter(|field| !document.contains_key(field.as_str()))
            .map(|field| FieldError::new(field.clone(), format!("Path `{field}` is required.")))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Validation(missing));
        }
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        let mut documents = self.documents.lock().unwrap();
        if documents.iter().any(|d| d.get("_id") == document.get("_id")) {
            return Err(StoreError::DuplicateKey("E11000 duplicate key _id".into()));
        }
        documents.push(document.clone());
        Ok(document)
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.check_failure()?;
        self.finds
            .lock()
            .unwrap()
            .push((filter.clone(), options.clone()));
        Ok(self.matching(&filter, &options))
    }

    async fn count(&self, filter: Document) -> Result<u64, StoreError> {
        self.check_failure()?;
        let count = self
            .documents()
            .iter()
            .filter(|document| matches(document, &filter))
            .count();
        Ok(count as u64)
    }

    async fn find_one(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Option<Document>, StoreError> {
        self.check_failure()?;
        self.finds
            .lock()
            .unwrap()
            .push((filter.clone(), options.clone()));
        let options = FindOptions {
            limit: Some(1),
            ..options
        };
        Ok(self.matching(&filter, &options).into_iter().next())
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOptions,
    ) -> Result<Option<Document>, StoreError> {
        self.check_failure()?;
        let result = self.update(&filter, &update, false);
        if result.matched == 0 {
            return Ok(None);
        }
        let id = self
            .documents()
            .into_iter()
            .find(|document| matches(document, &filter))
            .and_then(|document| document.get("_id").cloned());
        Ok(id.and_then(|id| {
            self.matching(&doc! { "_id": id }, &options)
                .into_iter()
                .next()
        }))
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, StoreError> {
        self.check_failure()?;
        Ok(self.update(&filter, &update, false))
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, StoreError> {
        self.check_failure()?;
        Ok(self.update(&filter, &update, true))
    }

    async fn delete_one(&self, filter: Document) -> Result<DeleteResult, StoreError> {
        self.check_failure()?;
        Ok(self.delete(&filter, false))
    }

    async fn delete_many(&self, filter: Document) -> Result<DeleteResult, StoreError> {
        self.check_failure()?;
        Ok(self.delete(&filter, true))
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, StoreError> {
        self.check_failure()?;
        self.pipelines.lock().unwrap().push(pipeline);
        Ok(self.aggregate_results.lock().unwrap().clone())
    }

    async fn populate(
        &self,
        document: &mut Document,
        populate: &PopulateSpec,
    ) -> Result<(), StoreError> {
        let collection = populate
            .reference
            .clone()
            .unwrap_or_else(|| format!("{}s", populate.path));
        let related = self
            .collections
            .get(&collection)
            .ok_or_else(|| StoreError::Other(format!("unknown collection {collection}")))?;
        let resolve = |id: &Bson| -> Bson {
            related
                .iter()
                .find(|candidate| candidate.get("_id") == Some(id))
                .map_or(Bson::Null, |found| {
                    let mut selected = doc! { "_id": id.clone() };
                    for field in &populate.select {
                        if let Some(value) = found.get(field) {
                            selected.insert(field, value.clone());
                        }
                    }
                    Bson::Document(selected)
                })
        };
        let populated = match document.get(&populate.path) {
            Some(Bson::Array(ids)) => Bson::Array(ids.iter().map(resolve).collect()),
            Some(id) => resolve(id),
            None => return Ok(()),
        };
        document.insert(&populate.path, populated);
        Ok(())
    }
}

pub fn shared(store: MemoryStore) -> Arc<MemoryStore> {
    Arc::new(store)
}

fn values_at<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((first, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(document) => {
            if let Some(child) = document.get(*first) {
                values_at(child, rest, out);
            }
        }
        Bson::Array(items) => {
            for item in items {
                values_at(item, segments, out);
            }
        }
        _ => {}
    }
}

fn path_values<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(value) = document.get(segments[0]) {
        values_at(value, &segments[1..], &mut out);
    }
    out
}

fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.cmp(b)),
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        _ => Some(number(a)?.partial_cmp(&number(b)?)?),
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        #[allow(clippy::cast_precision_loss)]
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn equals(value: &Bson, expected: &Bson) -> bool {
    if value == expected || compare(value, expected) == Some(Ordering::Equal) {
        return true;
    }
    matches!(value, Bson::Array(items) if items.iter().any(|item| equals(item, expected)))
}

fn regex_matches(value: &Bson, pattern: &str, options: &str) -> bool {
    let Bson::String(text) = value else {
        return false;
    };
    regex::RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .build()
        .is_ok_and(|re| re.is_match(text))
}

fn operator_matches(values: &[&Bson], operator: &str, operand: &Bson) -> bool {
    let any = |f: &dyn Fn(&Bson) -> bool| values.iter().any(|value| f(value));
    match operator {
        "$eq" => any(&|v| equals(v, operand)),
        "$ne" => !any(&|v| equals(v, operand)),
        "$in" => match operand {
            Bson::Array(options) => any(&|v| options.iter().any(|o| equals(v, o))),
            _ => false,
        },
        "$nin" => match operand {
            Bson::Array(options) => !any(&|v| options.iter().any(|o| equals(v, o))),
            _ => true,
        },
        "$gt" => any(&|v| compare(v, operand) == Some(Ordering::Greater)),
        "$gte" => any(&|v| matches!(compare(v, operand), Some(Ordering::Greater | Ordering::Equal))),
        "$lt" => any(&|v| compare(v, operand) == Some(Ordering::Less)),
        "$lte" => any(&|v| matches!(compare(v, operand), Some(Ordering::Less | Ordering::Equal))),
        "$regex" => match operand {
            Bson::RegularExpression(regex) => {
                any(&|v| regex_matches(v, &regex.pattern, &regex.options))
            }
            Bson::String(pattern) => any(&|v| regex_matches(v, pattern, "")),
            _ => false,
        },
        "$elemMatch" => match operand {
            Bson::Document(filter) => any(&|v| match v {
                Bson::Array(items) => items.iter().any(|item| element_matches(item, filter)),
                _ => false,
            }),
            _ => false,
        },
        "$exists" => values.is_empty() != matches!(operand, Bson::Boolean(true)),
        _ => true,
    }
}

fn element_matches(item: &Bson, filter: &Document) -> bool {
    match item {
        Bson::Document(document) => matches(document, filter),
        _ => false,
    }
}

/// True if `document` satisfies `filter`.
pub fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => condition.as_array().is_some_and(|clauses| {
            clauses.iter().all(|clause| element_matches_root(document, clause))
        }),
        "$or" => condition.as_array().is_some_and(|clauses| {
            clauses.iter().any(|clause| element_matches_root(document, clause))
        }),
        "$text" => true,
        path => {
            let values = path_values(document, path);
            match condition {
                Bson::Document(operators)
                    if operators.keys().next().is_some_and(|k| k.starts_with('$')) =>
                {
                    operators
                        .iter()
                        .all(|(operator, operand)| {
                            // `$elemMatch` looks at the array itself, not its elements.
                            if operator == "$elemMatch" {
                                let arrays: Vec<&Bson> = document.get(path).into_iter().collect();
                                return operator_matches(&arrays, operator, operand);
                            }
                            operator_matches(&values, operator, operand)
                        })
                }
                Bson::RegularExpression(regex) => values
                    .iter()
                    .any(|v| regex_matches(v, &regex.pattern, &regex.options)),
                expected => values.iter().any(|v| equals(v, expected)),
            }
        }
    })
}

fn element_matches_root(document: &Document, clause: &Bson) -> bool {
    clause
        .as_document()
        .is_some_and(|clause| matches(document, clause))
}

fn compare_by(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, direction) in sort {
        let left = a.get(field).unwrap_or(&Bson::Null);
        let right = b.get(field).unwrap_or(&Bson::Null);
        let ordering = compare(left, right).unwrap_or(Ordering::Equal);
        let ordering = if number(direction) == Some(-1.0) {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Index of the first element of `field` matched by the filter (`$elemMatch` or `field.x`).
fn positional_index(document: &Document, field: &str, filter: &Document) -> Option<usize> {
    let items = document.get_array(field).ok()?;
    let element_filter = match filter.get(field) {
        Some(Bson::Document(condition)) => condition.get_document("$elemMatch").ok()?.clone(),
        _ => filter
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&format!("{field}."))
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect(),
    };
    items
        .iter()
        .position(|item| element_matches(item, &element_filter))
}

fn project(mut document: Document, filter: &Document, options: &FindOptions) -> Document {
    if let Some(projection) = &options.projection {
        for (key, _) in projection {
            if let Some(field) = key.strip_suffix(".$") {
                let element = positional_index(&document, field, filter)
                    .and_then(|index| document.get_array(field).ok()?.get(index).cloned());
                document = match element {
                    Some(element) => doc! { "_id": document.get("_id").cloned(), field: [element] },
                    None => doc! { "_id": document.get("_id").cloned() },
                };
            }
        }
    }
    if let Some(select) = options.select_document() {
        let includes: Vec<&String> = select
            .iter()
            .filter(|(_, v)| number(v) == Some(1.0))
            .map(|(k, _)| k)
            .collect();
        if includes.is_empty() {
            for (field, _) in &select {
                document.remove(field);
            }
        } else {
            let mut kept = Document::new();
            for (key, value) in document {
                if key == "_id" || includes.iter().any(|inc| **inc == key || inc.starts_with(&format!("{key}."))) {
                    kept.insert(key, value);
                }
            }
            document = kept;
        }
    }
    document
}

fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        Some((first, rest)) => {
            if !matches!(document.get(first), Some(Bson::Document(_))) {
                document.insert(first, Document::new());
            }
            if let Ok(child) = document.get_document_mut(first) {
                set_path(child, rest, value);
            }
        }
        None => {
            document.insert(path, value);
        }
    }
}

fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        Some((first, rest)) => {
            if let Ok(child) = document.get_document_mut(first) {
                unset_path(child, rest);
            }
        }
        None => {
            document.remove(path);
        }
    }
}

fn apply_update(document: &mut Document, update: &Document, filter: &Document) {
    for (operator, fields) in update {
        let Some(fields) = fields.as_document() else {
            continue;
        };
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    if let Some((field, rest)) = path.split_once(".$.") {
                        if let Some(index) = positional_index(document, field, filter) {
                            if let Ok(items) = document.get_array_mut(field) {
                                if let Some(Bson::Document(element)) = items.get_mut(index) {
                                    set_path(element, rest, value.clone());
                                }
                            }
                        }
                    } else {
                        set_path(document, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    unset_path(document, path);
                }
            }
            "$push" => {
                for (field, value) in fields {
                    if !matches!(document.get(field), Some(Bson::Array(_))) {
                        document.insert(field, Bson::Array(Vec::new()));
                    }
                    let Ok(items) = document.get_array_mut(field) else {
                        continue;
                    };
                    match value.as_document().and_then(|v| v.get_array("$each").ok()) {
                        Some(each) => {
                            let position = value
                                .as_document()
                                .and_then(|v| v.get("$position"))
                                .and_then(number)
                                .map_or(items.len(), |p| (p as usize).min(items.len()));
                            for (offset, item) in each.iter().enumerate() {
                                items.insert(position + offset, item.clone());
                            }
                        }
                        None => items.push(value.clone()),
                    }
                }
            }
            "$pull" => {
                for (field, condition) in fields {
                    if let Ok(items) = document.get_array_mut(field) {
                        items.retain(|item| match condition {
                            Bson::Document(condition) => !element_matches(item, condition),
                            other => item != other,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    for (key, value) in update {
        if !key.starts_with('$') {
            set_path(document, key, value.clone());
        }
    }
}

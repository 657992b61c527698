//! State path resolution and mutation.
//!
//! Two spellings address the same tree:
//!
//! - dotted binding paths, `user.name`, where a leading `item` segment makes the
//!   path relative to the current list element during template expansion;
//! - slash patch paths, `/products/sku:abc-123/price`, where a `key:value`
//!   segment selects the unique element of the preceding array whose `key`
//!   property equals `value` (string-compared). Slash tokens use JSON-pointer
//!   escapes (`~0`, `~1`) plus `~2` for a literal `:`.
//!
//! Numeric segments index into arrays in either spelling.

use serde_json::{Map, Value};
use std::fmt;

const ITEM_SCOPE: &str = "item";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("path not found: {path}")]
    PathNotFound { path: String },
    #[error("no element of '{path}' has {key} = {value}")]
    KeyNotFound {
        path: String,
        key: String,
        value: String,
    },
    #[error("more than one element of '{path}' has {key} = {value}")]
    AmbiguousListKey {
        path: String,
        key: String,
        value: String,
    },
    #[error("'{path}' is not a list")]
    NotAList { path: String },
    #[error("item-relative path '{path}' used outside an item template")]
    NoItemContext { path: String },
}

impl ResolveError {
    /// Stable wire code, one per failure kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath { .. } => "invalid_path",
            Self::PathNotFound { .. } => "path_not_found",
            Self::KeyNotFound { .. } => "key_not_found",
            Self::AmbiguousListKey { .. } => "ambiguous_list_key",
            Self::NotAList { .. } => "not_a_list",
            Self::NoItemContext { .. } => "no_item_context",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Select { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    Item,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePath {
    raw: String,
    scope: Scope,
    segments: Vec<Segment>,
}

impl StatePath {
    /// Parse either spelling.
    ///
    /// In slash form an unescaped `:` always starts a list selector, so an
    /// object key containing `:` must be written with `~2`: the key `10:30`
    /// is addressed as `/slots/10~230`.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let invalid = |reason: &str| ResolveError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Ok(Self {
                raw: String::new(),
                scope: Scope::Root,
                segments: Vec::new(),
            });
        }

        if let Some(pointer) = raw.strip_prefix('/') {
            let mut segments = Vec::new();
            for token in pointer.split('/') {
                if token.is_empty() {
                    return Err(invalid("empty segment"));
                }
                let unescape =
                    |part: &str| unescape_pointer_token(part).map_err(|reason| invalid(&reason));
                match token.split_once(':') {
                    Some(("", _)) => return Err(invalid("list selector without a key name")),
                    Some((key, value)) => segments.push(Segment::Select {
                        key: unescape(key)?,
                        value: unescape(value)?,
                    }),
                    None => segments.push(Segment::Key(unescape(token)?)),
                }
            }
            if matches!(segments.first(), Some(Segment::Select { .. })) {
                return Err(invalid("list selector must follow a list segment"));
            }
            return Ok(Self {
                raw: raw.to_string(),
                scope: Scope::Root,
                segments,
            });
        }

        let mut tokens = raw.split('.').peekable();
        let scope = if tokens.peek() == Some(&ITEM_SCOPE) {
            tokens.next();
            Scope::Item
        } else {
            Scope::Root
        };
        let mut segments = Vec::new();
        for token in tokens {
            if token.is_empty() {
                return Err(invalid("empty segment"));
            }
            segments.push(Segment::Key(token.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            scope,
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_item_relative(&self) -> bool {
        self.scope == Scope::Item
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Plain keys up to the first list selector. Used to relate a changed
    /// path to the bindings that read it.
    pub fn key_prefix(&self) -> Vec<&str> {
        self.segments
            .iter()
            .map_while(|segment| match segment {
                Segment::Key(key) => Some(key.as_str()),
                Segment::Select { .. } => None,
            })
            .collect()
    }

    /// True when one path is a key-prefix of the other.
    pub fn overlaps(&self, other: &StatePath) -> bool {
        let a = self.key_prefix();
        let b = other.key_prefix();
        let n = a.len().min(b.len());
        a[..n] == b[..n]
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// String form used for list keys and `map` lookups.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn key_matches(element: &Value, key: &str, value: &str) -> bool {
    element
        .get(key)
        .is_some_and(|field| key_string(field) == value)
}

pub fn resolve<'a>(root: &'a Value, path: &StatePath) -> Result<&'a Value, ResolveError> {
    let mut current = root;
    for segment in &path.segments {
        current = descend(current, segment, path)?;
    }
    Ok(current)
}

/// Resolve against the item context for `item.` paths, else against `state`.
pub fn resolve_scoped<'a>(
    state: &'a Value,
    item: Option<&'a Value>,
    path: &StatePath,
) -> Result<&'a Value, ResolveError> {
    match path.scope {
        Scope::Root => resolve(state, path),
        Scope::Item => {
            let item = item.ok_or_else(|| ResolveError::NoItemContext {
                path: path.raw.clone(),
            })?;
            resolve(item, path)
        }
    }
}

pub fn resolve_str<'a>(root: &'a Value, raw: &str) -> Result<&'a Value, ResolveError> {
    resolve(root, &StatePath::parse(raw)?)
}

pub fn resolve_mut<'a>(
    root: &'a mut Value,
    path: &StatePath,
) -> Result<&'a mut Value, ResolveError> {
    let mut current = root;
    for segment in &path.segments {
        current = descend_existing(current, segment, path)?;
    }
    Ok(current)
}

pub fn list_mut<'a>(
    root: &'a mut Value,
    path: &StatePath,
) -> Result<&'a mut Vec<Value>, ResolveError> {
    match resolve_mut(root, path)? {
        Value::Array(items) => Ok(items),
        _ => Err(ResolveError::NotAList {
            path: path.raw.clone(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// The addressed key or element must already exist.
    Replace,
    /// Missing intermediate map keys are created.
    Add,
}

pub fn set(
    root: &mut Value,
    path: &StatePath,
    value: Value,
    mode: SetMode,
) -> Result<(), ResolveError> {
    let Some((last, parents)) = path.segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        current = match mode {
            SetMode::Replace => descend_existing(current, segment, path)?,
            SetMode::Add => descend_or_create(current, segment, path)?,
        };
    }

    match (current, last) {
        (Value::Object(map), Segment::Key(key)) => {
            if mode == SetMode::Replace && !map.contains_key(key) {
                return Err(not_found(path));
            }
            map.insert(key.clone(), value);
            Ok(())
        }
        (Value::Array(items), Segment::Key(token)) => {
            let len = items.len();
            let index = match (mode, token.as_str()) {
                (SetMode::Add, "-") => len,
                _ => parse_index(token, path)?,
            };
            match mode {
                SetMode::Add if index == len => items.push(value),
                _ if index < len => items[index] = value,
                _ => return Err(not_found(path)),
            }
            Ok(())
        }
        (Value::Array(items), Segment::Select { key, value: wanted }) => {
            let index = select_index(items, key, wanted, path)?;
            items[index] = value;
            Ok(())
        }
        (_, Segment::Select { .. }) => Err(ResolveError::NotAList {
            path: path.raw.clone(),
        }),
        _ => Err(not_found(path)),
    }
}

pub fn remove(root: &mut Value, path: &StatePath) -> Result<Value, ResolveError> {
    let Some((last, parents)) = path.segments.split_last() else {
        return Ok(std::mem::replace(root, Value::Object(Map::new())));
    };

    let mut current = root;
    for segment in parents {
        current = descend_existing(current, segment, path)?;
    }

    match (current, last) {
        (Value::Object(map), Segment::Key(key)) => map.remove(key).ok_or_else(|| not_found(path)),
        (Value::Array(items), Segment::Key(token)) => {
            let index = parse_index(token, path)?;
            if index < items.len() {
                Ok(items.remove(index))
            } else {
                Err(not_found(path))
            }
        }
        (Value::Array(items), Segment::Select { key, value }) => {
            let index = select_index(items, key, value, path)?;
            Ok(items.remove(index))
        }
        (_, Segment::Select { .. }) => Err(ResolveError::NotAList {
            path: path.raw.clone(),
        }),
        _ => Err(not_found(path)),
    }
}

fn descend<'a>(
    value: &'a Value,
    segment: &Segment,
    path: &StatePath,
) -> Result<&'a Value, ResolveError> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(key)) => map.get(key).ok_or_else(|| not_found(path)),
        (Value::Array(items), Segment::Key(token)) => token
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .ok_or_else(|| not_found(path)),
        (Value::Array(items), Segment::Select { key, value }) => {
            select_index(items, key, value, path).map(|index| &items[index])
        }
        (_, Segment::Select { .. }) => Err(ResolveError::NotAList {
            path: path.raw.clone(),
        }),
        _ => Err(not_found(path)),
    }
}

fn descend_existing<'a>(
    value: &'a mut Value,
    segment: &Segment,
    path: &StatePath,
) -> Result<&'a mut Value, ResolveError> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(key)) => map.get_mut(key).ok_or_else(|| not_found(path)),
        (Value::Array(items), Segment::Key(token)) => token
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get_mut(index))
            .ok_or_else(|| not_found(path)),
        (Value::Array(items), Segment::Select { key, value }) => {
            let index = select_index(items, key, value, path)?;
            Ok(&mut items[index])
        }
        (_, Segment::Select { .. }) => Err(ResolveError::NotAList {
            path: path.raw.clone(),
        }),
        _ => Err(not_found(path)),
    }
}

fn descend_or_create<'a>(
    value: &'a mut Value,
    segment: &Segment,
    path: &StatePath,
) -> Result<&'a mut Value, ResolveError> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(key)) => Ok(map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()))),
        (value, segment) => descend_existing(value, segment, path),
    }
}

fn select_index(
    items: &[Value],
    key: &str,
    value: &str,
    path: &StatePath,
) -> Result<usize, ResolveError> {
    let mut matches = items
        .iter()
        .enumerate()
        .filter(|(_, element)| key_matches(element, key, value))
        .map(|(index, _)| index);

    match (matches.next(), matches.next()) {
        (Some(index), None) => Ok(index),
        (None, _) => Err(ResolveError::KeyNotFound {
            path: path.raw.clone(),
            key: key.to_string(),
            value: value.to_string(),
        }),
        (Some(_), Some(_)) => Err(ResolveError::AmbiguousListKey {
            path: path.raw.clone(),
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_index(token: &str, path: &StatePath) -> Result<usize, ResolveError> {
    token.parse::<usize>().map_err(|_| ResolveError::InvalidPath {
        path: path.raw.clone(),
        reason: format!("invalid array index '{token}'"),
    })
}

fn not_found(path: &StatePath) -> ResolveError {
    ResolveError::PathNotFound {
        path: path.raw.clone(),
    }
}

fn unescape_pointer_token(token: &str) -> Result<String, String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();

    while let Some(ch) = chars.next() {
        if ch == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                Some('2') => out.push(':'),
                Some(other) => return Err(format!("invalid escape ~{other}")),
                None => return Err("trailing ~".to_string()),
            }
        } else {
            out.push(ch);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> StatePath {
        StatePath::parse(raw).expect("valid path")
    }

    fn shop() -> Value {
        json!({
            "user": {"name": "Ada"},
            "products": [
                {"sku": "abc-123", "price": 10},
                {"sku": "xyz", "price": 20},
                {"sku": 7, "price": 1}
            ]
        })
    }

    #[test]
    fn parses_dotted_and_item_paths() {
        let p = path("user.name");
        assert_eq!(p.scope(), Scope::Root);
        assert_eq!(p.key_prefix(), vec!["user", "name"]);

        let item = path("item.price");
        assert!(item.is_item_relative());
        assert_eq!(item.segments(), &[Segment::Key("price".into())]);

        assert!(path("item").segments().is_empty());
    }

    #[test]
    fn parses_selectors_and_escapes() {
        let p = path("/products/sku:abc-123/price");
        assert_eq!(
            p.segments(),
            &[
                Segment::Key("products".into()),
                Segment::Select {
                    key: "sku".into(),
                    value: "abc-123".into()
                },
                Segment::Key("price".into()),
            ]
        );
        assert_eq!(p.key_prefix(), vec!["products"]);
        assert_eq!(path("/a~1b/c~0d").segments()[0], Segment::Key("a/b".into()));
    }

    #[test]
    fn escaped_colon_addresses_object_keys() {
        let state = json!({"slots": {"10:30": "busy"}, "xs": [{"t": "10:30", "v": 1}]});
        assert_eq!(resolve_str(&state, "/slots/10~230").expect("escaped"), "busy");
        assert_eq!(resolve_str(&state, "/xs/t:10:30/v").expect("selector value"), 1);
        assert!(matches!(
            resolve_str(&state, "/slots/10:30"),
            Err(ResolveError::NotAList { .. })
        ));
    }

    #[test]
    fn rejects_malformed_paths() {
        for raw in ["/a//b", "a..b", "/sku:1", "/a/:x", "/a~3", "/a~"] {
            assert!(
                matches!(StatePath::parse(raw), Err(ResolveError::InvalidPath { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn resolves_dotted_paths() {
        let state = shop();
        assert_eq!(resolve_str(&state, "user.name"), Ok(&json!("Ada")));
        assert_eq!(resolve_str(&state, "products.1.sku"), Ok(&json!("xyz")));
        assert_eq!(resolve_str(&state, ""), Ok(&state));
    }

    #[test]
    fn missing_intermediate_is_path_not_found() {
        let state = shop();
        assert!(matches!(
            resolve_str(&state, "account.email"),
            Err(ResolveError::PathNotFound { .. })
        ));
        assert!(matches!(
            resolve_str(&state, "user.name.first"),
            Err(ResolveError::PathNotFound { .. })
        ));
    }

    #[test]
    fn selects_list_elements_by_key() {
        let state = shop();
        assert_eq!(resolve_str(&state, "/products/sku:abc-123/price"), Ok(&json!(10)));
        assert_eq!(resolve_str(&state, "/products/sku:7/price"), Ok(&json!(1)));
        assert!(matches!(
            resolve_str(&state, "/products/sku:nope"),
            Err(ResolveError::KeyNotFound { .. })
        ));
        assert!(matches!(
            resolve_str(&state, "/user/sku:1"),
            Err(ResolveError::NotAList { .. })
        ));
    }

    #[test]
    fn duplicate_keys_are_ambiguous_not_guessed() {
        let state = json!({"rows": [{"id": "a"}, {"id": "a"}]});
        assert!(matches!(
            resolve_str(&state, "/rows/id:a"),
            Err(ResolveError::AmbiguousListKey { .. })
        ));
    }

    #[test]
    fn item_scope_requires_context() {
        let state = shop();
        let item = json!({"price": 4});
        let p = path("item.price");
        assert_eq!(resolve_scoped(&state, Some(&item), &p), Ok(&json!(4)));
        assert!(matches!(
            resolve_scoped(&state, None, &p),
            Err(ResolveError::NoItemContext { .. })
        ));
    }

    #[test]
    fn replace_requires_existing_key() {
        let mut state = shop();
        set(&mut state, &path("/user/name"), json!("Grace"), SetMode::Replace).expect("replace");
        assert_eq!(state["user"]["name"], "Grace");

        let err = set(&mut state, &path("/user/email"), json!("x"), SetMode::Replace)
            .expect_err("missing key");
        assert!(matches!(err, ResolveError::PathNotFound { .. }));
    }

    #[test]
    fn add_creates_missing_maps() {
        let mut state = json!({});
        set(&mut state, &path("/a/b/c"), json!(1), SetMode::Add).expect("add");
        assert_eq!(state, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn add_appends_with_dash_or_len() {
        let mut state = json!({"xs": [1]});
        set(&mut state, &path("/xs/-"), json!(2), SetMode::Add).expect("dash");
        set(&mut state, &path("/xs/2"), json!(3), SetMode::Add).expect("len");
        assert_eq!(state["xs"], json!([1, 2, 3]));
        assert!(set(&mut state, &path("/xs/9"), json!(0), SetMode::Add).is_err());
    }

    #[test]
    fn set_through_selector_touches_only_that_element() {
        let mut state = shop();
        set(
            &mut state,
            &path("/products/sku:abc-123/price"),
            json!(35.99),
            SetMode::Replace,
        )
        .expect("replace");
        assert_eq!(state["products"][0]["price"], json!(35.99));
        assert_eq!(state["products"][1]["price"], json!(20));
    }

    #[test]
    fn remove_by_key_index_and_selector() {
        let mut state = shop();
        assert_eq!(remove(&mut state, &path("/user/name")), Ok(json!("Ada")));
        assert_eq!(
            remove(&mut state, &path("/products/sku:xyz")).expect("remove")["price"],
            20
        );
        remove(&mut state, &path("/products/0")).expect("remove index");
        assert_eq!(state["products"], json!([{"sku": 7, "price": 1}]));
        assert!(matches!(
            remove(&mut state, &path("/user/name")),
            Err(ResolveError::PathNotFound { .. })
        ));
    }

    #[test]
    fn list_mut_rejects_non_arrays() {
        let mut state = shop();
        assert!(list_mut(&mut state, &path("/products")).is_ok());
        assert!(matches!(
            list_mut(&mut state, &path("/user")),
            Err(ResolveError::NotAList { .. })
        ));
    }

    #[test]
    fn overlap_is_prefix_in_either_direction() {
        assert!(path("user").overlaps(&path("/user/name")));
        assert!(path("user.name").overlaps(&path("/user")));
        assert!(path("products.0.price").overlaps(&path("/products/sku:x/price")));
        assert!(!path("user.name").overlaps(&path("/user/email")));
    }
}

//! Nested record flattening.
//!
//! Nested objects are merged into their parent under a composed key
//! (`parent_child`). A list made only of objects is merged the same way, one
//! element at a time, so keys contributed by several elements collide; the
//! [`ListMergeStrategy`] decides what happens then. Lists of scalars and
//! scalars are kept as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{CoreError, Record, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListMergeStrategy {
    /// Later list elements overwrite keys written by earlier ones.
    #[default]
    LastWins,
    /// Each element gets its position in the key (`followers_0_name`).
    Indexed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenOptions {
    pub separator: String,
    pub list_merge: ListMergeStrategy,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            separator: "_".to_string(),
            list_merge: ListMergeStrategy::default(),
        }
    }
}

impl FlattenOptions {
    pub fn with_list_merge(mut self, list_merge: ListMergeStrategy) -> Self {
        self.list_merge = list_merge;
        self
    }
}

/// Flattens one upstream record. The root must be an object.
pub fn flatten(value: &JsonValue, options: &FlattenOptions) -> Result<Record, CoreError> {
    match value {
        JsonValue::Object(map) => Ok(flatten_object(map, options)),
        other => Err(CoreError::NotAnObject {
            found: json_kind(other),
        }),
    }
}

pub fn flatten_object(map: &Map<String, JsonValue>, options: &FlattenOptions) -> Record {
    let mut out = Record::new();
    flatten_into(&mut out, None, map, options);
    out
}

fn flatten_into(
    out: &mut Record,
    prefix: Option<&str>,
    map: &Map<String, JsonValue>,
    options: &FlattenOptions,
) {
    for (key, value) in map {
        let composed = compose_key(prefix, key, &options.separator);
        match value {
            JsonValue::Object(child) => flatten_into(out, Some(&composed), child, options),
            JsonValue::Array(items) if is_object_list(items) => {
                for (index, child) in items.iter().filter_map(JsonValue::as_object).enumerate() {
                    match options.list_merge {
                        ListMergeStrategy::LastWins => {
                            flatten_into(out, Some(&composed), child, options)
                        }
                        ListMergeStrategy::Indexed => {
                            let indexed =
                                compose_key(Some(&composed), &index.to_string(), &options.separator);
                            flatten_into(out, Some(&indexed), child, options)
                        }
                    }
                }
            }
            leaf => {
                out.insert(composed, Value::from_json_leaf(leaf));
            }
        }
    }
}

// Empty lists stay lists of scalars so that flat input is a fixed point.
fn is_object_list(items: &[JsonValue]) -> bool {
    !items.is_empty() && items.iter().all(JsonValue::is_object)
}

fn compose_key(prefix: Option<&str>, key: &str, separator: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}{separator}{key}"),
        _ => key.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

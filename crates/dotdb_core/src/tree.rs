//! Path-addressed navigation and mutation of the value tree.
//!
//! The tree is strictly hierarchical; a mutation replaces the subtree at
//! its target. Writing through missing intermediate segments creates
//! object nodes (never arrays). At an array node a segment must be all
//! digits: a non-numeric segment or an out-of-range index is an error on
//! write and absent on read. Deletes of absent targets are no-ops.

use crate::error::{CoreError, CoreResult};
use dotdb_codec::{segment_as_index, Path, Value};

/// Reads the value at `path`, if present.
#[must_use]
pub fn get_at<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index = segment_as_index(segment)?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Replaces the value at `path`, creating missing intermediate objects.
///
/// Returns the previous value at the target, if any. Setting the empty
/// path replaces the entire root, which must remain an object.
///
/// # Errors
///
/// - `Type` if the root replacement is not an object, or if an existing
///   non-container value sits on the path
/// - `Path` for a non-numeric segment or out-of-range index at an array
pub fn set_at(root: &mut Value, path: &Path, value: Value) -> CoreResult<Option<Value>> {
    if path.is_root() {
        if !value.is_object() {
            return Err(CoreError::type_error(format!(
                "root must be an object, got {}",
                value.type_name()
            )));
        }
        return Ok(Some(std::mem::replace(root, value)));
    }

    let (parents, leaf) = path.segments().split_at(path.len() - 1);
    let parent = descend_creating(root, parents)?;
    let leaf = &leaf[0];

    match parent {
        Value::Object(map) => Ok(map.insert(leaf.clone(), value)),
        Value::Array(items) => {
            let index = array_index_for_write(leaf, items.len())?;
            Ok(Some(std::mem::replace(&mut items[index], value)))
        }
        other => Err(CoreError::type_error(format!(
            "cannot set key {leaf:?} on a {}",
            other.type_name()
        ))),
    }
}

/// Removes the value at `path`, returning it if present.
///
/// Deleting the empty path resets the root to an empty object and
/// returns the old root. Deleting an absent target is a no-op.
pub fn delete_at(root: &mut Value, path: &Path) -> CoreResult<Option<Value>> {
    if path.is_root() {
        return Ok(Some(std::mem::replace(root, Value::object())));
    }

    let (parents, leaf) = path.segments().split_at(path.len() - 1);
    let Some(parent) = descend_mut(root, parents) else {
        return Ok(None);
    };
    let leaf = &leaf[0];

    match parent {
        Value::Object(map) => Ok(map.remove(leaf)),
        Value::Array(items) => {
            let Some(index) = segment_as_index(leaf) else {
                return Err(CoreError::path(format!(
                    "cannot address array element with key {leaf:?}"
                )));
            };
            if index < items.len() {
                Ok(Some(items.remove(index)))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

/// Appends `items` to the array at `path`, deduplicating by deep equality.
///
/// An absent target is created as a fresh array (with missing
/// intermediates created as objects). Each item is appended iff it is not
/// deep-equal to any element already present, including elements appended
/// earlier in the same call.
///
/// # Errors
///
/// `Type` if the target exists and is not an array.
pub fn push_at(root: &mut Value, path: &Path, items: Vec<Value>) -> CoreResult<()> {
    let target = if path.is_root() {
        root
    } else {
        let (parents, leaf) = path.segments().split_at(path.len() - 1);
        let parent = descend_creating(root, parents)?;
        let leaf = &leaf[0];

        match parent {
            Value::Object(map) => map.entry_or_insert_with(leaf, Value::array),
            Value::Array(existing) => {
                let index = array_index_for_write(leaf, existing.len())?;
                &mut existing[index]
            }
            other => {
                return Err(CoreError::type_error(format!(
                    "cannot push under key {leaf:?} on a {}",
                    other.type_name()
                )))
            }
        }
    };

    let Value::Array(existing) = target else {
        return Err(CoreError::type_error(format!(
            "push target is a {}, not an array",
            target.type_name()
        )));
    };

    for item in items {
        if !existing.contains(&item) {
            existing.push(item);
        }
    }
    Ok(())
}

/// Computes the array at `path` with every deep-equal match of `items`
/// removed.
///
/// Returns `None` if the target is absent (nothing to pull).
///
/// # Errors
///
/// `Type` if the target exists and is not an array.
pub fn pulled_array(root: &Value, path: &Path, items: &[Value]) -> CoreResult<Option<Vec<Value>>> {
    match get_at(root, path) {
        None => Ok(None),
        Some(Value::Array(existing)) => Ok(Some(
            existing
                .iter()
                .filter(|element| !items.contains(element))
                .cloned()
                .collect(),
        )),
        Some(other) => Err(CoreError::type_error(format!(
            "pull target is a {}, not an array",
            other.type_name()
        ))),
    }
}

/// Reads the numeric base for an `add`: 0 when absent.
///
/// # Errors
///
/// `Type` if a non-number value is present at the target.
pub fn numeric_base(root: &Value, path: &Path) -> CoreResult<f64> {
    match get_at(root, path) {
        None => Ok(0.0),
        Some(Value::Number(n)) => Ok(*n),
        Some(other) => Err(CoreError::type_error(format!(
            "cannot add to a {}",
            other.type_name()
        ))),
    }
}

/// Navigates to the node at `segments`, creating missing objects.
fn descend_creating<'a>(root: &'a mut Value, segments: &[String]) -> CoreResult<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        match current {
            Value::Object(map) => {
                current = map.entry_or_insert_with(segment, Value::object);
            }
            Value::Array(items) => {
                let index = array_index_for_write(segment, items.len())?;
                current = &mut items[index];
            }
            other => {
                return Err(CoreError::type_error(format!(
                    "path segment {segment:?} is blocked by a {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(current)
}

/// Navigates to the node at `segments` without creating anything.
fn descend_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get_mut(segment)?,
            Value::Array(items) => {
                let index = segment_as_index(segment)?;
                current = items.get_mut(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

fn array_index_for_write(segment: &str, len: usize) -> CoreResult<usize> {
    let Some(index) = segment_as_index(segment) else {
        return Err(CoreError::path(format!(
            "cannot address array element with key {segment:?}"
        )));
    };
    if index >= len {
        return Err(CoreError::path(format!(
            "array index {index} out of range (length {len})"
        )));
    }
    Ok(index)
}

/// Lists the direct children of the collection at `path` as
/// `(key, value)` pairs.
///
/// For an object collection the keys are the object keys in insertion
/// order; for an array collection they are the decimal indexes. Scalars
/// and absent paths yield an empty list.
#[must_use]
pub fn collection_children(root: &Value, path: &Path) -> Vec<(String, Value)> {
    match get_at(root, path) {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| (key.to_owned(), value.clone()))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, value)| (index.to_string(), value.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotdb_codec::from_json;

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut root = Value::object();
        set_at(&mut root, &path("user.name"), Value::from("Alice")).unwrap();

        assert_eq!(
            get_at(&root, &path("user.name")),
            Some(&Value::from("Alice"))
        );
        let user = get_at(&root, &path("user")).unwrap();
        assert!(user.is_object());
    }

    #[test]
    fn set_returns_old_value() {
        let mut root = Value::object();
        assert_eq!(set_at(&mut root, &path("k"), Value::from(1.0)).unwrap(), None);
        let old = set_at(&mut root, &path("k"), Value::from(2.0)).unwrap();
        assert_eq!(old, Some(Value::Number(1.0)));
    }

    #[test]
    fn set_root_requires_object() {
        let mut root = Value::object();
        assert!(set_at(&mut root, &Path::root(), Value::from(1.0)).is_err());

        let replacement = from_json("{\"a\":1}").unwrap();
        set_at(&mut root, &Path::root(), replacement.clone()).unwrap();
        assert_eq!(root, replacement);
    }

    #[test]
    fn set_into_array_by_index() {
        let mut root = from_json("{\"tags\":[\"a\",\"b\"]}").unwrap();
        set_at(&mut root, &path("tags.1"), Value::from("c")).unwrap();
        assert_eq!(get_at(&root, &path("tags.1")), Some(&Value::from("c")));
    }

    #[test]
    fn set_array_out_of_range_fails() {
        let mut root = from_json("{\"tags\":[\"a\"]}").unwrap();
        let err = set_at(&mut root, &path("tags.5"), Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::Path { .. }));
    }

    #[test]
    fn set_array_non_numeric_segment_fails() {
        let mut root = from_json("{\"tags\":[\"a\"]}").unwrap();
        let err = set_at(&mut root, &path("tags.first"), Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::Path { .. }));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut root = from_json("{\"n\":5}").unwrap();
        let err = set_at(&mut root, &path("n.deep"), Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::Type { .. }));
    }

    #[test]
    fn get_missing_is_absent() {
        let root = from_json("{\"a\":{\"b\":1}}").unwrap();
        assert_eq!(get_at(&root, &path("a.c")), None);
        assert_eq!(get_at(&root, &path("x.y.z")), None);
        // Non-numeric segment at an array reads as absent.
        let root = from_json("{\"tags\":[1]}").unwrap();
        assert_eq!(get_at(&root, &path("tags.first")), None);
        assert_eq!(get_at(&root, &path("tags.9")), None);
    }

    #[test]
    fn delete_returns_old_and_tolerates_absent() {
        let mut root = from_json("{\"a\":{\"b\":1}}").unwrap();
        assert_eq!(
            delete_at(&mut root, &path("a.b")).unwrap(),
            Some(Value::Number(1.0))
        );
        assert_eq!(delete_at(&mut root, &path("a.b")).unwrap(), None);
        assert_eq!(delete_at(&mut root, &path("no.such")).unwrap(), None);
    }

    #[test]
    fn delete_root_resets_to_empty_object() {
        let mut root = from_json("{\"a\":1}").unwrap();
        let old = delete_at(&mut root, &Path::root()).unwrap();
        assert!(old.is_some());
        assert_eq!(root, Value::object());
    }

    #[test]
    fn delete_array_element_shifts() {
        let mut root = from_json("{\"tags\":[\"a\",\"b\",\"c\"]}").unwrap();
        delete_at(&mut root, &path("tags.1")).unwrap();
        assert_eq!(root, from_json("{\"tags\":[\"a\",\"c\"]}").unwrap());
    }

    #[test]
    fn push_creates_fresh_array() {
        let mut root = Value::object();
        push_at(
            &mut root,
            &path("tags"),
            vec![Value::from("x"), Value::from("x"), Value::from("y")],
        )
        .unwrap();
        assert_eq!(root, from_json("{\"tags\":[\"x\",\"y\"]}").unwrap());
    }

    #[test]
    fn push_deduplicates_against_existing() {
        let mut root = from_json("{\"tags\":[\"a\"]}").unwrap();
        push_at(
            &mut root,
            &path("tags"),
            vec![Value::from("b"), Value::from("b"), Value::from("c")],
        )
        .unwrap();
        assert_eq!(root, from_json("{\"tags\":[\"a\",\"b\",\"c\"]}").unwrap());
    }

    #[test]
    fn push_dedup_uses_deep_equality() {
        let mut root = from_json("{\"items\":[{\"id\":1}]}").unwrap();
        push_at(
            &mut root,
            &path("items"),
            vec![from_json("{\"id\":1}").unwrap(), from_json("{\"id\":2}").unwrap()],
        )
        .unwrap();
        assert_eq!(
            root,
            from_json("{\"items\":[{\"id\":1},{\"id\":2}]}").unwrap()
        );
    }

    #[test]
    fn push_on_non_array_fails() {
        let mut root = from_json("{\"tags\":\"not-array\"}").unwrap();
        let err = push_at(&mut root, &path("tags"), vec![Value::Null]).unwrap_err();
        assert!(matches!(err, CoreError::Type { .. }));
    }

    #[test]
    fn pull_filters_deep_equal_matches() {
        let root = from_json("{\"tags\":[\"a\",\"b\",\"a\",\"c\"]}").unwrap();
        let remaining = pulled_array(&root, &path("tags"), &[Value::from("a")])
            .unwrap()
            .unwrap();
        assert_eq!(remaining, vec![Value::from("b"), Value::from("c")]);
    }

    #[test]
    fn pull_absent_is_none() {
        let root = Value::object();
        assert_eq!(pulled_array(&root, &path("tags"), &[]).unwrap(), None);
    }

    #[test]
    fn numeric_base_defaults_to_zero() {
        let root = from_json("{\"counter\":10}").unwrap();
        assert_eq!(numeric_base(&root, &path("counter")).unwrap(), 10.0);
        assert_eq!(numeric_base(&root, &path("absent")).unwrap(), 0.0);
        assert!(numeric_base(&root, &path("counter.x")).is_ok());

        let root = from_json("{\"s\":\"text\"}").unwrap();
        assert!(matches!(
            numeric_base(&root, &path("s")),
            Err(CoreError::Type { .. })
        ));
    }

    #[test]
    fn collection_children_of_object_and_array() {
        let root = from_json("{\"u\":{\"a\":{\"n\":1},\"b\":{\"n\":2}},\"l\":[10,20]}").unwrap();

        let object_children = collection_children(&root, &path("u"));
        assert_eq!(object_children.len(), 2);
        assert_eq!(object_children[0].0, "a");
        assert_eq!(object_children[1].0, "b");

        let array_children = collection_children(&root, &path("l"));
        assert_eq!(array_children[0], ("0".to_owned(), Value::Number(10.0)));
        assert_eq!(array_children[1], ("1".to_owned(), Value::Number(20.0)));

        assert!(collection_children(&root, &path("missing")).is_empty());
    }
}

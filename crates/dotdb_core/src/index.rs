//! Equality indexes and their persisted sidecars.
//!
//! An index is declared at open time as `{name, collection_path, field}`
//! and maintains `field value → ordered set of document paths` for the
//! direct children of the collection, plus a reverse map used to refresh
//! an entry in O(1) when a document changes. Field values are
//! normalized to their string form for hashing, so `1` and `"1"`
//! collide deliberately, matching lookup-by-value semantics.
//!
//! Sidecars live at `<base>.<name>.idx` as JSON, written atomically
//! (tmp + rename). They are an optimization, not a source of truth: a
//! missing or unreadable sidecar triggers a rebuild by full scan, and
//! WAL replay re-runs incremental maintenance on an adopted sidecar.

use crate::config::IndexSpec;
use crate::error::{CoreError, CoreResult};
use crate::tree;
use dotdb_codec::{to_json, Path, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Normalizes a field value to its index key string.
#[must_use]
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_owned(),
        other => to_json(other).unwrap_or_default(),
    }
}

/// A single equality index over one collection field.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HashIndex {
    name: String,
    collection: String,
    field: String,
    /// Key string → ordered set of document paths.
    map: BTreeMap<String, BTreeSet<String>>,
    /// Document path → current key string.
    reverse: BTreeMap<String, String>,
    #[serde(skip)]
    collection_path: Path,
    #[serde(skip)]
    dirty: bool,
}

impl HashIndex {
    /// Creates an empty index from its declaration.
    ///
    /// # Errors
    ///
    /// Returns a path error if the collection path is malformed.
    pub fn new(spec: &IndexSpec) -> CoreResult<Self> {
        let collection_path =
            Path::parse(&spec.path).map_err(|e| CoreError::path(e.to_string()))?;
        Ok(Self {
            name: spec.name.clone(),
            collection: spec.path.clone(),
            field: spec.field.clone(),
            map: BTreeMap::new(),
            reverse: BTreeMap::new(),
            collection_path,
            dirty: false,
        })
    }

    /// Returns the index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the indexed collection path.
    #[must_use]
    pub fn collection_path(&self) -> &Path {
        &self.collection_path
    }

    /// Returns the indexed field name.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    /// Checks whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    /// Inserts or refreshes the entry for `doc_path`.
    pub fn insert(&mut self, key: &Value, doc_path: &str) {
        let new_key = key_string(key);
        if let Some(old_key) = self.reverse.get(doc_path) {
            if *old_key == new_key {
                return;
            }
            let old_key = old_key.clone();
            self.detach(&old_key, doc_path);
        }
        self.reverse.insert(doc_path.to_owned(), new_key.clone());
        self.map.entry(new_key).or_default().insert(doc_path.to_owned());
        self.dirty = true;
    }

    /// Removes the entry for `doc_path`, if any.
    pub fn remove(&mut self, doc_path: &str) {
        if let Some(old_key) = self.reverse.remove(doc_path) {
            self.detach(&old_key, doc_path);
            self.dirty = true;
        }
    }

    fn detach(&mut self, key: &str, doc_path: &str) {
        if let Some(set) = self.map.get_mut(key) {
            set.remove(doc_path);
            if set.is_empty() {
                self.map.remove(key);
            }
        }
    }

    /// Looks up the full ordered path set for a field value.
    #[must_use]
    pub fn find(&self, key: &Value) -> Option<&BTreeSet<String>> {
        self.map.get(&key_string(key))
    }

    /// Looks up the first matching document path.
    #[must_use]
    pub fn find_first(&self, key: &Value) -> Option<&String> {
        self.find(key).and_then(|set| set.iter().next())
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.reverse.clear();
        self.dirty = true;
    }

    /// Rebuilds the index by scanning the collection in `root`.
    ///
    /// Only object children carrying the indexed field are entered.
    pub fn rebuild(&mut self, root: &Value) {
        self.clear();
        let children = tree::collection_children(root, &self.collection_path);
        for (child_key, child) in children {
            if let Some(field_value) = child.as_object().and_then(|map| map.get(&self.field)) {
                let doc_path = self.collection_path.child(&child_key).as_dotted();
                self.insert(field_value, &doc_path);
            }
        }
    }

    /// Re-derives the entry for one collection child from `root`.
    pub fn refresh_child(&mut self, root: &Value, child_key: &str) {
        let child_path = self.collection_path.child(child_key);
        let doc_path = child_path.as_dotted();
        let field_value = tree::get_at(root, &child_path)
            .and_then(Value::as_object)
            .and_then(|map| map.get(&self.field));

        match field_value {
            Some(value) => {
                let value = value.clone();
                self.insert(&value, &doc_path);
            }
            None => self.remove(&doc_path),
        }
    }

    /// Applies incremental maintenance for a mutation at `target`,
    /// given the post-mutation tree.
    pub fn on_mutation(&mut self, root: &Value, target: &Path) {
        if self.collection_path.starts_with(target) {
            // The mutation replaced the collection (or an ancestor);
            // every entry may have changed.
            self.rebuild(root);
            return;
        }
        if let Some(remainder) = target.strip_prefix(&self.collection_path) {
            if let Some(child_key) = remainder.first() {
                let child_key = child_key.clone();
                self.refresh_child(root, &child_key);
            }
        }
    }

    fn sidecar_path(base: &str, name: &str) -> PathBuf {
        PathBuf::from(format!("{base}.{name}.idx"))
    }

    /// Loads a sidecar for `spec` if one exists and parses.
    ///
    /// Sidecars that fail to read or parse are discarded (the caller
    /// rebuilds); a sidecar declaring a different collection or field
    /// is likewise discarded.
    #[must_use]
    pub fn load_sidecar(spec: &IndexSpec, base: &str) -> Option<Self> {
        let path = Self::sidecar_path(base, &spec.name);
        let bytes = fs::read(&path).ok()?;
        let mut index: HashIndex = serde_json::from_slice(&bytes).ok()?;
        if index.collection != spec.path || index.field != spec.field {
            return None;
        }
        index.collection_path = Path::parse(&index.collection).ok()?;
        index.dirty = false;
        debug!(name = %spec.name, entries = index.len(), "adopted index sidecar");
        Some(index)
    }

    /// Persists the sidecar atomically if the index changed.
    pub fn save_sidecar(&mut self, base: &str) -> CoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = Self::sidecar_path(base, &self.name);
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));

        let bytes = serde_json::to_vec(self)
            .map_err(|e| CoreError::corruption(format!("sidecar encode failed: {e}")))?;
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        self.dirty = false;
        Ok(())
    }
}

/// All indexes declared for a database.
#[derive(Debug, Default)]
pub struct IndexStore {
    indexes: Vec<HashIndex>,
}

impl IndexStore {
    /// Opens the declared indexes: adopts sidecars where possible,
    /// rebuilds from `root` otherwise.
    ///
    /// # Errors
    ///
    /// Returns a path error if a declared collection path is malformed.
    pub fn open(specs: &[IndexSpec], base: &str, root: &Value) -> CoreResult<Self> {
        let mut indexes = Vec::with_capacity(specs.len());
        for spec in specs {
            let index = match HashIndex::load_sidecar(spec, base) {
                Some(index) => index,
                None => {
                    let mut index = HashIndex::new(spec)?;
                    index.rebuild(root);
                    index
                }
            };
            indexes.push(index);
        }
        Ok(Self { indexes })
    }

    /// Looks up an index by name.
    ///
    /// # Errors
    ///
    /// Returns `Index` for an unknown name.
    pub fn by_name(&self, name: &str) -> CoreResult<&HashIndex> {
        self.indexes
            .iter()
            .find(|index| index.name() == name)
            .ok_or_else(|| CoreError::no_such_index(name))
    }

    /// Finds the index covering `collection`/`field`, if declared.
    #[must_use]
    pub fn covering(&self, collection: &Path, field: &str) -> Option<&HashIndex> {
        self.indexes
            .iter()
            .find(|index| index.collection_path() == collection && index.field() == field)
    }

    /// Applies incremental maintenance for a mutation at `target`.
    pub fn on_mutation(&mut self, root: &Value, target: &Path) {
        for index in &mut self.indexes {
            index.on_mutation(root, target);
        }
    }

    /// Persists every dirty sidecar.
    pub fn save_all(&mut self, base: &str) -> CoreResult<()> {
        for index in &mut self.indexes {
            index.save_sidecar(base)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotdb_codec::from_json;
    use tempfile::tempdir;

    fn spec() -> IndexSpec {
        IndexSpec::new("email", "users", "email")
    }

    fn sample_root() -> Value {
        from_json(
            r#"{"users":{
                "alice":{"name":"Alice","email":"a@x"},
                "bob":{"name":"Bob","email":"b@x"},
                "carol":{"name":"Carol"}
            }}"#,
        )
        .unwrap()
    }

    #[test]
    fn rebuild_indexes_object_children_with_field() {
        let mut index = HashIndex::new(&spec()).unwrap();
        assert!(index.is_empty());
        index.rebuild(&sample_root());

        assert!(!index.is_empty());
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.find_first(&Value::from("a@x")),
            Some(&"users.alice".to_owned())
        );
        assert!(index.find(&Value::from("missing")).is_none());
    }

    #[test]
    fn duplicate_values_keep_ordered_set() {
        let root = from_json(
            r#"{"users":{
                "zed":{"email":"dup@x"},
                "amy":{"email":"dup@x"}
            }}"#,
        )
        .unwrap();
        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&root);

        let paths: Vec<&String> = index.find(&Value::from("dup@x")).unwrap().iter().collect();
        assert_eq!(paths, vec!["users.amy", "users.zed"]);
        assert_eq!(
            index.find_first(&Value::from("dup@x")),
            Some(&"users.amy".to_owned())
        );
    }

    #[test]
    fn mutation_at_document_refreshes_entry() {
        let mut root = sample_root();
        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&root);

        // Change alice's email through a deep mutation.
        let target = Path::parse("users.alice.email").unwrap();
        tree::set_at(&mut root, &target, Value::from("new@x")).unwrap();
        index.on_mutation(&root, &target);

        assert!(index.find(&Value::from("a@x")).is_none());
        assert_eq!(
            index.find_first(&Value::from("new@x")),
            Some(&"users.alice".to_owned())
        );
    }

    #[test]
    fn document_replacement_updates_entry() {
        let mut root = sample_root();
        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&root);

        let target = Path::parse("users.bob").unwrap();
        tree::set_at(
            &mut root,
            &target,
            from_json(r#"{"email":"bob2@x"}"#).unwrap(),
        )
        .unwrap();
        index.on_mutation(&root, &target);

        assert!(index.find(&Value::from("b@x")).is_none());
        assert_eq!(
            index.find_first(&Value::from("bob2@x")),
            Some(&"users.bob".to_owned())
        );
    }

    #[test]
    fn document_delete_removes_entry() {
        let mut root = sample_root();
        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&root);

        let target = Path::parse("users.alice").unwrap();
        tree::delete_at(&mut root, &target).unwrap();
        index.on_mutation(&root, &target);

        assert!(index.find(&Value::from("a@x")).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn mutation_above_collection_rebuilds() {
        let mut root = sample_root();
        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&root);

        let target = Path::root();
        tree::set_at(
            &mut root,
            &target,
            from_json(r#"{"users":{"dora":{"email":"d@x"}}}"#).unwrap(),
        )
        .unwrap();
        index.on_mutation(&root, &target);

        assert_eq!(index.len(), 1);
        assert_eq!(
            index.find_first(&Value::from("d@x")),
            Some(&"users.dora".to_owned())
        );
    }

    #[test]
    fn incremental_equals_rebuilt() {
        let mut root = Value::object();
        let mut incremental = HashIndex::new(&spec()).unwrap();

        let steps: Vec<(&str, &str)> = vec![
            ("users.a", r#"{"email":"1"}"#),
            ("users.b", r#"{"email":"2"}"#),
            ("users.a", r#"{"email":"3"}"#),
            ("users.c", r#"{"name":"no-email"}"#),
        ];
        for (raw_path, json) in steps {
            let target = Path::parse(raw_path).unwrap();
            tree::set_at(&mut root, &target, from_json(json).unwrap()).unwrap();
            incremental.on_mutation(&root, &target);
        }
        let target = Path::parse("users.b").unwrap();
        tree::delete_at(&mut root, &target).unwrap();
        incremental.on_mutation(&root, &target);

        let mut rebuilt = HashIndex::new(&spec()).unwrap();
        rebuilt.rebuild(&root);

        assert_eq!(incremental, rebuilt);
    }

    #[test]
    fn numeric_keys_normalize_to_strings() {
        let root = from_json(r#"{"users":{"u1":{"id":42}}}"#).unwrap();
        let mut index = HashIndex::new(&IndexSpec::new("id", "users", "id")).unwrap();
        index.rebuild(&root);

        assert!(index.find(&Value::Number(42.0)).is_some());
    }

    #[test]
    fn sidecar_roundtrip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db").display().to_string();

        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&sample_root());
        index.save_sidecar(&base).unwrap();

        let loaded = HashIndex::load_sidecar(&spec(), &base).unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn sidecar_with_changed_field_is_discarded() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db").display().to_string();

        let mut index = HashIndex::new(&spec()).unwrap();
        index.rebuild(&sample_root());
        index.save_sidecar(&base).unwrap();

        let changed = IndexSpec::new("email", "users", "name");
        assert!(HashIndex::load_sidecar(&changed, &base).is_none());
    }

    #[test]
    fn store_open_rebuilds_without_sidecar() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db").display().to_string();

        let store = IndexStore::open(&[spec()], &base, &sample_root()).unwrap();
        let index = store.by_name("email").unwrap();
        assert_eq!(index.len(), 2);
        assert!(store.by_name("nope").is_err());
    }

    #[test]
    fn covering_lookup() {
        let store = IndexStore::open(&[spec()], "unused", &sample_root()).unwrap();
        let users = Path::parse("users").unwrap();
        assert!(store.covering(&users, "email").is_some());
        assert!(store.covering(&users, "name").is_none());
        assert!(store
            .covering(&Path::parse("posts").unwrap(), "email")
            .is_none());
    }
}

//! Field-level conflict detection and resolution.
//!
//! When a remote version of a record arrives for an id that already exists
//! locally, every user-visible field is compared. Each differing field
//! becomes a [`SyncConflict`] registered with the [`ConflictResolver`],
//! which then resolves it explicitly or through the configured
//! [`ConflictStrategy`].
//!
//! # Merge rules
//!
//! - Arrays are unioned: local elements first, then remote elements not
//!   already present. Duplicates are removed using deep equality.
//! - Objects are shallow-merged, remote keys overriding local ones.
//! - Anything else keeps the local value (the remote one if local is absent).
//!
//! Once resolved, a conflict never changes again.

use crate::{error::Result, record, ConflictId, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How a conflict was (or should be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local value
    Local,
    /// Take the remote value
    Remote,
    /// Combine both values
    Merge,
    /// Defer to an external decision
    Manual,
}

/// Which side a last-wins policy prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// Policy applied when no explicit resolution is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Always take one side
    LastWins(Side),
    /// Apply the merge rules (default)
    #[default]
    SmartMerge,
    /// Never resolve automatically
    Manual,
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-wins" | "last-wins-local" => Ok(Self::LastWins(Side::Local)),
            "last-wins-remote" => Ok(Self::LastWins(Side::Remote)),
            "smart-merge" => Ok(Self::SmartMerge),
            "manual" => Ok(Self::Manual),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastWins(Side::Local) => write!(f, "last-wins-local"),
            Self::LastWins(Side::Remote) => write!(f, "last-wins-remote"),
            Self::SmartMerge => write!(f, "smart-merge"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A divergence between the local and remote value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: ConflictId,
    /// `collection:recordId` of the conflicting record
    pub collection_key: String,
    pub field: String,
    /// `None` when the field is absent locally
    pub local_value: Option<Value>,
    /// `None` when the field is absent remotely
    pub remote_value: Option<Value>,
    pub detected_at: Timestamp,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

impl SyncConflict {
    /// Compute the value a resolution would produce, without mutating.
    ///
    /// Returns `None` for [`Resolution::Manual`].
    pub fn preview(&self, resolution: Resolution) -> Option<Value> {
        let local = self.local_value.clone();
        let remote = self.remote_value.clone();
        match resolution {
            Resolution::Local => Some(local.unwrap_or(Value::Null)),
            Resolution::Remote => Some(remote.unwrap_or(Value::Null)),
            Resolution::Merge => Some(merge_values(local.as_ref(), remote.as_ref())),
            Resolution::Manual => None,
        }
    }
}

/// Aggregate counters over registered conflicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStats {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub by_resolution: BTreeMap<Resolution, usize>,
}

/// Decides whether two field values are the same.
///
/// Swapping the comparator changes what counts as a conflict without
/// touching the resolver's bookkeeping.
pub trait FieldComparator: Send + Sync {
    fn equal(&self, field: &str, local: Option<&Value>, remote: Option<&Value>) -> bool;
}

/// Structural equality: primitives by value, arrays element-wise in order,
/// objects by key set and per-key equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepEquality;

impl FieldComparator for DeepEquality {
    fn equal(&self, _field: &str, local: Option<&Value>, remote: Option<&Value>) -> bool {
        match (local, remote) {
            (None, None) => true,
            (Some(a), Some(b)) => deep_equal(a, b),
            _ => false,
        }
    }
}

/// Recursive structural equality over JSON values.
///
/// Numbers compare numerically, so `1` equals `1.0`.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return a == b;
            }
            if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                return a == b;
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| deep_equal(x, y)))
        }
        _ => false,
    }
}

/// Combine a local and a remote value using the merge rules.
pub fn merge_values(local: Option<&Value>, remote: Option<&Value>) -> Value {
    match (local, remote) {
        (Some(Value::Array(local)), Some(Value::Array(remote))) => {
            let mut union: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
            for item in local.iter().chain(remote) {
                if !union.iter().any(|existing| deep_equal(existing, item)) {
                    union.push(item.clone());
                }
            }
            Value::Array(union)
        }
        (Some(Value::Object(local)), Some(Value::Object(remote))) => {
            let mut merged: Map<String, Value> = local.clone();
            for (key, value) in remote {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (Some(local), _) => local.clone(),
        (None, Some(remote)) => remote.clone(),
        (None, None) => Value::Null,
    }
}

/// The user-visible fields of two records whose values differ.
///
/// Reserved metadata and the identity field are skipped. A field present on
/// only one side differs unless the comparator treats absence as equal.
pub fn diff_fields(
    local: &Value,
    remote: &Value,
    comparator: &dyn FieldComparator,
) -> Vec<String> {
    let mut fields: BTreeSet<&str> = BTreeSet::new();
    for side in [local, remote] {
        if let Some(object) = side.as_object() {
            fields.extend(object.keys().map(String::as_str));
        }
    }

    fields
        .into_iter()
        .filter(|field| !record::is_reserved_field(field))
        .filter(|field| !comparator.equal(field, local.get(*field), remote.get(*field)))
        .map(str::to_string)
        .collect()
}

/// Registry of detected conflicts and their resolutions.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    comparator: Box<dyn FieldComparator>,
    /// Keyed by id; ids sort in detection order
    conflicts: BTreeMap<ConflictId, SyncConflict>,
    next_seq: u64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::default())
    }
}

impl ConflictResolver {
    /// Create a resolver using deep equality.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self::with_comparator(strategy, Box::new(DeepEquality))
    }

    /// Create a resolver with a custom field comparator.
    pub fn with_comparator(strategy: ConflictStrategy, comparator: Box<dyn FieldComparator>) -> Self {
        Self {
            strategy,
            comparator,
            conflicts: BTreeMap::new(),
            next_seq: 1,
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: ConflictStrategy) {
        self.strategy = strategy;
    }

    /// Compare two versions of a record and register one conflict per
    /// differing field.
    ///
    /// If an unresolved conflict already exists for the same key and field,
    /// it is refreshed with the new values instead of duplicated.
    pub fn detect_conflicts(
        &mut self,
        local: &Value,
        remote: &Value,
        key: &str,
        now: Timestamp,
    ) -> Vec<SyncConflict> {
        let fields = diff_fields(local, remote, self.comparator.as_ref());
        let mut detected = Vec::with_capacity(fields.len());

        for field in fields {
            let local_value = local.get(&field).cloned();
            let remote_value = remote.get(&field).cloned();

            let existing = self
                .conflicts
                .values_mut()
                .find(|c| !c.resolved && c.collection_key == key && c.field == field);

            let conflict = match existing {
                Some(conflict) => {
                    conflict.local_value = local_value;
                    conflict.remote_value = remote_value;
                    conflict.detected_at = now;
                    conflict.clone()
                }
                None => {
                    let id = format!("conflict-{:08}", self.next_seq);
                    self.next_seq += 1;
                    let conflict = SyncConflict {
                        id: id.clone(),
                        collection_key: key.to_string(),
                        field,
                        local_value,
                        remote_value,
                        detected_at: now,
                        resolved: false,
                        resolution: None,
                        merged_value: None,
                        resolved_at: None,
                    };
                    self.conflicts.insert(id, conflict.clone());
                    conflict
                }
            };
            detected.push(conflict);
        }

        detected
    }

    /// Resolve one conflict.
    ///
    /// Returns the resulting value, or `None` for [`Resolution::Manual`], in
    /// which case the conflict stays unresolved.
    pub fn resolve_conflict(
        &mut self,
        id: &str,
        resolution: Resolution,
        now: Timestamp,
    ) -> Result<Option<Value>> {
        let conflict = self.unresolved_mut(id)?;
        let Some(value) = conflict.preview(resolution) else {
            return Ok(None);
        };
        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        conflict.merged_value = Some(value.clone());
        conflict.resolved_at = Some(now);
        Ok(Some(value))
    }

    /// Complete a manual resolution with an externally chosen value.
    pub fn resolve_with_value(&mut self, id: &str, value: Value, now: Timestamp) -> Result<Value> {
        let conflict = self.unresolved_mut(id)?;
        conflict.resolved = true;
        conflict.resolution = Some(Resolution::Manual);
        conflict.merged_value = Some(value.clone());
        conflict.resolved_at = Some(now);
        Ok(value)
    }

    /// Resolve several conflicts the same way.
    ///
    /// Ids that fail (unknown, already resolved, deferred) are left out of
    /// the result.
    pub fn resolve_conflicts_batch(
        &mut self,
        ids: &[ConflictId],
        resolution: Resolution,
        now: Timestamp,
    ) -> BTreeMap<ConflictId, Value> {
        ids.iter()
            .filter_map(|id| match self.resolve_conflict(id, resolution, now) {
                Ok(Some(value)) => Some((id.clone(), value)),
                _ => None,
            })
            .collect()
    }

    /// Resolve a conflict according to the configured strategy.
    pub fn auto_resolve(&mut self, id: &str, now: Timestamp) -> Result<Option<Value>> {
        match self.strategy {
            ConflictStrategy::LastWins(Side::Local) => {
                self.resolve_conflict(id, Resolution::Local, now)
            }
            ConflictStrategy::LastWins(Side::Remote) => {
                self.resolve_conflict(id, Resolution::Remote, now)
            }
            ConflictStrategy::SmartMerge => self.resolve_conflict(id, Resolution::Merge, now),
            ConflictStrategy::Manual => {
                self.unresolved_mut(id)?;
                Ok(None)
            }
        }
    }

    /// Get a conflict by id.
    pub fn get(&self, id: &str) -> Option<&SyncConflict> {
        self.conflicts.get(id)
    }

    /// All conflicts in detection order.
    pub fn conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.values()
    }

    /// Unresolved conflicts in detection order.
    pub fn unresolved(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.values().filter(|c| !c.resolved)
    }

    /// Conflicts registered for one record.
    pub fn conflicts_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a SyncConflict> {
        self.conflicts
            .values()
            .filter(move |c| c.collection_key == key)
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    pub fn get_conflict_stats(&self) -> ConflictStats {
        let mut stats = ConflictStats::default();
        for conflict in self.conflicts.values() {
            stats.total += 1;
            match conflict.resolution.filter(|_| conflict.resolved) {
                Some(resolution) => {
                    stats.resolved += 1;
                    *stats.by_resolution.entry(resolution).or_default() += 1;
                }
                None => stats.unresolved += 1,
            }
        }
        stats
    }

    /// Drop resolved conflicts, returning how many were removed.
    pub fn clear_resolved_conflicts(&mut self) -> usize {
        let before = self.conflicts.len();
        self.conflicts.retain(|_, c| !c.resolved);
        before - self.conflicts.len()
    }

    fn unresolved_mut(&mut self, id: &str) -> Result<&mut SyncConflict> {
        let conflict = self
            .conflicts
            .get_mut(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if conflict.resolved {
            return Err(Error::ConflictAlreadyResolved(id.to_string()));
        }
        Ok(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_only_differing_fields() {
        let mut resolver = ConflictResolver::default();
        let conflicts = resolver.detect_conflicts(
            &json!({"title": "A", "x": 1}),
            &json!({"title": "B", "x": 1}),
            "meetings:m-1",
            1000,
        );

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "title");
        assert_eq!(conflicts[0].local_value, Some(json!("A")));
        assert_eq!(conflicts[0].remote_value, Some(json!("B")));
        assert!(!conflicts[0].resolved);
    }

    #[test]
    fn reserved_fields_are_ignored() {
        let mut resolver = ConflictResolver::default();
        let conflicts = resolver.detect_conflicts(
            &json!({"id": "m-1", "_rev": 1, "title": "A", "updatedAt": 100}),
            &json!({"id": "m-2", "_rev": 7, "title": "A", "updatedAt": 200}),
            "meetings:m-1",
            1000,
        );
        assert!(conflicts.is_empty());
    }

    #[test]
    fn one_sided_fields_conflict() {
        let mut resolver = ConflictResolver::default();
        let conflicts = resolver.detect_conflicts(
            &json!({"title": "A"}),
            &json!({"title": "A", "notes": "new"}),
            "meetings:m-1",
            1000,
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "notes");
        assert_eq!(conflicts[0].local_value, None);
    }

    #[test]
    fn deep_equality_rules() {
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(deep_equal(&json!({"a": [1, {"b": 2}]}), &json!({"a": [1, {"b": 2}]})));
        assert!(!deep_equal(&json!([1, 2]), &json!([2, 1])));
        assert!(!deep_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!deep_equal(&json!(null), &json!(false)));
    }

    #[test]
    fn merge_unions_arrays() {
        let mut resolver = ConflictResolver::default();
        let conflicts = resolver.detect_conflicts(
            &json!({"tags": [1, 2]}),
            &json!({"tags": [2, 3]}),
            "meetings:m-1",
            1000,
        );

        let merged = resolver
            .resolve_conflict(&conflicts[0].id, Resolution::Merge, 2000)
            .unwrap()
            .unwrap();
        assert_eq!(merged, json!([1, 2, 3]));

        let conflict = resolver.get(&conflicts[0].id).unwrap();
        assert!(conflict.resolved);
        assert_eq!(conflict.resolution, Some(Resolution::Merge));
        assert_eq!(conflict.resolved_at, Some(2000));
    }

    #[test]
    fn merge_objects_remote_overrides() {
        let merged = merge_values(
            Some(&json!({"a": 1, "b": 1})),
            Some(&json!({"b": 2, "c": 3})),
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn merge_scalars_prefers_local() {
        assert_eq!(merge_values(Some(&json!("l")), Some(&json!("r"))), json!("l"));
        assert_eq!(merge_values(None, Some(&json!("r"))), json!("r"));
        assert_eq!(merge_values(Some(&json!([1])), Some(&json!("r"))), json!([1]));
    }

    #[test]
    fn manual_resolution_defers() {
        let mut resolver = ConflictResolver::default();
        let id = resolver.detect_conflicts(&json!({"t": 1}), &json!({"t": 2}), "k:1", 1)[0]
            .id
            .clone();

        assert_eq!(resolver.resolve_conflict(&id, Resolution::Manual, 2).unwrap(), None);
        assert!(!resolver.get(&id).unwrap().resolved);

        let value = resolver.resolve_with_value(&id, json!(5), 3).unwrap();
        assert_eq!(value, json!(5));
        let conflict = resolver.get(&id).unwrap();
        assert!(conflict.resolved);
        assert_eq!(conflict.resolution, Some(Resolution::Manual));
    }

    #[test]
    fn re_resolving_is_an_error() {
        let mut resolver = ConflictResolver::default();
        let id = resolver.detect_conflicts(&json!({"t": 1}), &json!({"t": 2}), "k:1", 1)[0]
            .id
            .clone();

        resolver.resolve_conflict(&id, Resolution::Local, 2).unwrap();
        let err = resolver
            .resolve_conflict(&id, Resolution::Remote, 3)
            .unwrap_err();
        assert_eq!(err, Error::ConflictAlreadyResolved(id.clone()));
        assert_eq!(resolver.get(&id).unwrap().merged_value, Some(json!(1)));

        assert!(matches!(
            resolver.resolve_conflict("missing", Resolution::Local, 3),
            Err(Error::ConflictNotFound(_))
        ));
    }

    #[test]
    fn batch_swallows_failures() {
        let mut resolver = ConflictResolver::default();
        let ids: Vec<ConflictId> = resolver
            .detect_conflicts(&json!({"a": 1, "b": 1}), &json!({"a": 2, "b": 2}), "k:1", 1)
            .into_iter()
            .map(|c| c.id)
            .collect();
        resolver.resolve_conflict(&ids[0], Resolution::Local, 2).unwrap();

        let mut request = ids.clone();
        request.push("unknown".into());
        let results = resolver.resolve_conflicts_batch(&request, Resolution::Remote, 3);

        assert_eq!(results.len(), 1);
        assert_eq!(results.get(&ids[1]), Some(&json!(2)));
    }

    #[test]
    fn auto_resolve_follows_strategy() {
        let mut resolver = ConflictResolver::new(ConflictStrategy::LastWins(Side::Remote));
        let id = resolver.detect_conflicts(&json!({"t": 1}), &json!({"t": 2}), "k:1", 1)[0]
            .id
            .clone();
        assert_eq!(resolver.auto_resolve(&id, 2).unwrap(), Some(json!(2)));

        resolver.set_strategy(ConflictStrategy::Manual);
        let id = resolver.detect_conflicts(&json!({"u": 1}), &json!({"u": 2}), "k:1", 3)[0]
            .id
            .clone();
        assert_eq!(resolver.auto_resolve(&id, 4).unwrap(), None);
        assert_eq!(resolver.unresolved_count(), 1);
    }

    #[test]
    fn repeated_detection_refreshes_pending_conflict() {
        let mut resolver = ConflictResolver::new(ConflictStrategy::Manual);
        let first = resolver.detect_conflicts(&json!({"t": 1}), &json!({"t": 2}), "k:1", 1);
        let second = resolver.detect_conflicts(&json!({"t": 1}), &json!({"t": 3}), "k:1", 5);

        assert_eq!(first[0].id, second[0].id);
        assert_eq!(resolver.get_conflict_stats().total, 1);
        assert_eq!(resolver.get(&first[0].id).unwrap().remote_value, Some(json!(3)));
    }

    #[test]
    fn stats_and_clearing() {
        let mut resolver = ConflictResolver::default();
        let ids: Vec<ConflictId> = resolver
            .detect_conflicts(
                &json!({"a": 1, "b": 1, "c": 1}),
                &json!({"a": 2, "b": 2, "c": 2}),
                "k:1",
                1,
            )
            .into_iter()
            .map(|c| c.id)
            .collect();
        resolver.resolve_conflict(&ids[0], Resolution::Local, 2).unwrap();
        resolver.resolve_conflict(&ids[1], Resolution::Merge, 2).unwrap();

        let stats = resolver.get_conflict_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.by_resolution.get(&Resolution::Local), Some(&1));
        assert_eq!(stats.by_resolution.get(&Resolution::Merge), Some(&1));

        assert_eq!(resolver.clear_resolved_conflicts(), 2);
        assert_eq!(resolver.get_conflict_stats().total, 1);
        assert_eq!(resolver.conflicts_for("k:1").count(), 1);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "last-wins".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::LastWins(Side::Local)
        );
        assert_eq!(
            "Last-Wins-Remote".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::LastWins(Side::Remote)
        );
        assert_eq!(
            "smart-merge".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::SmartMerge
        );
        assert!("newest".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::Manual.to_string(), "manual");
    }
}

//! Tag-keyed alignment of two schema versions.
//!
//! The alignment drives every cross-schema comparison: the row diff projects
//! both sides of a row onto the aligned column list, history projects older
//! rows onto the newest schema, and the merge engine uses the per-column
//! classification to decide what each side changed.

use crate::diff::DiffWarnings;
use crate::errors::SchemaError;
use crate::row::{Key, Row};
use crate::value::{Coercibility, StorageKind, Value};

use super::{Column, Schema, Tag};

/// How a single tag changed between two schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnChange {
    Unchanged,
    Added,
    Dropped,
    /// Same tag and kind, different name.
    Renamed { from: String },
    /// Same tag, different storage kind. `renamed` is set when the name
    /// changed too.
    TypeChanged {
        from: StorageKind,
        to: StorageKind,
        coercibility: Coercibility,
        renamed: bool,
    },
}

/// One tag's view across the two schemas.
#[derive(Debug, Clone)]
pub struct ColumnAlignment {
    pub tag: Tag,
    pub from: Option<Column>,
    pub to: Option<Column>,
    pub change: ColumnChange,
}

impl ColumnAlignment {
    /// Output name: the newer name when the column still exists.
    pub fn name(&self) -> &str {
        match (&self.to, &self.from) {
            (Some(c), _) | (None, Some(c)) => &c.name,
            (None, None) => "",
        }
    }

    pub fn kind(&self) -> Option<StorageKind> {
        self.to.as_ref().or(self.from.as_ref()).map(|c| c.kind)
    }

    pub fn is_key(&self) -> bool {
        self.to
            .as_ref()
            .or(self.from.as_ref())
            .map(|c| c.primary_key)
            .unwrap_or(false)
    }
}

/// The full alignment between a `from` and a `to` schema.
#[derive(Debug, Clone)]
pub struct SchemaAlignment {
    columns: Vec<ColumnAlignment>,
    from_pk: Vec<Tag>,
    to_pk: Vec<Tag>,
}

/// Align two schemas, failing when the primary key tag list differs.
pub fn reconcile(from: &Schema, to: &Schema) -> Result<SchemaAlignment, SchemaError> {
    if !from.same_key_set(to) {
        return Err(SchemaError::IncompatibleKeyChange {
            from: from.pk_signature(),
            to: to.pk_signature(),
        });
    }
    Ok(reconcile_lenient(from, to))
}

/// Align two schemas without checking key compatibility. Used where a
/// partial result is acceptable: the degraded diff and history projection.
pub fn reconcile_lenient(from: &Schema, to: &Schema) -> SchemaAlignment {
    let mut columns = Vec::with_capacity(to.columns().len() + from.columns().len());

    // Key columns first, in the newer key order, then the remaining columns
    // of the newer schema, then anything only the older schema has.
    let ordered_to = to
        .pk_columns()
        .chain(to.non_pk_columns())
        .collect::<Vec<_>>();

    for tc in ordered_to {
        let fc = from.column_by_tag(tc.tag);
        let change = match fc {
            None => ColumnChange::Added,
            Some(fc) => classify(fc, tc),
        };
        columns.push(ColumnAlignment {
            tag: tc.tag,
            from: fc.cloned(),
            to: Some(tc.clone()),
            change,
        });
    }

    for fc in from.pk_columns().chain(from.non_pk_columns()) {
        if to.column_by_tag(fc.tag).is_none() {
            columns.push(ColumnAlignment {
                tag: fc.tag,
                from: Some(fc.clone()),
                to: None,
                change: ColumnChange::Dropped,
            });
        }
    }

    SchemaAlignment {
        columns,
        from_pk: from.pk_tags().to_vec(),
        to_pk: to.pk_tags().to_vec(),
    }
}

fn classify(from: &Column, to: &Column) -> ColumnChange {
    let renamed = from.name != to.name;
    if from.kind != to.kind {
        return ColumnChange::TypeChanged {
            from: from.kind,
            to: to.kind,
            coercibility: from.kind.coercibility(to.kind),
            renamed,
        };
    }
    if renamed {
        ColumnChange::Renamed {
            from: from.name.clone(),
        }
    } else {
        ColumnChange::Unchanged
    }
}

static NULL: Value = Value::Null;

fn cell<'a>(key: &'a Key, row: &'a Row, pk: &[Tag], tag: Tag) -> &'a Value {
    match pk.iter().position(|t| *t == tag) {
        Some(i) => key.values().get(i).unwrap_or(&NULL),
        None => row.get(tag),
    }
}

impl SchemaAlignment {
    pub fn columns(&self) -> &[ColumnAlignment] {
        &self.columns
    }

    pub fn column(&self, tag: Tag) -> Option<&ColumnAlignment> {
        self.columns.iter().find(|c| c.tag == tag)
    }

    /// Output column names in projection order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn key_compatible(&self) -> bool {
        self.from_pk == self.to_pk
    }

    /// True when at least one column differs beyond a pure rename.
    pub fn has_data_affecting_change(&self) -> bool {
        self.columns.iter().any(|c| {
            !matches!(
                c.change,
                ColumnChange::Unchanged | ColumnChange::Renamed { .. }
            )
        })
    }

    /// Project an older row onto the aligned columns. Cells whose kind
    /// changed are coerced to the newer kind; a failed coercion becomes NULL
    /// and a warning.
    pub fn project_from(&self, key: &Key, row: &Row, warnings: &mut DiffWarnings) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| {
                let Some(fc) = &c.from else {
                    return Value::Null;
                };
                let v = cell(key, row, &self.from_pk, c.tag);
                match &c.to {
                    Some(tc) if tc.kind != fc.kind && !v.is_null() => match v.coerce(tc.kind) {
                        Ok(coerced) => coerced,
                        Err(_) => {
                            warnings.coercion(c.name(), fc.kind, tc.kind);
                            Value::Null
                        }
                    },
                    _ => v.clone(),
                }
            })
            .collect()
    }

    /// Project a newer row onto the aligned columns.
    pub fn project_to(&self, key: &Key, row: &Row) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| match &c.to {
                Some(_) => cell(key, row, &self.to_pk, c.tag).clone(),
                None => Value::Null,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Schema {
        Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("c1", StorageKind::Int)
            .column("c2", StorageKind::String)
            .build()
            .unwrap()
    }

    #[test]
    fn test_identical_schemas_are_unchanged() {
        let s = base();
        let a = reconcile(&s, &s).unwrap();
        assert!(a.columns().iter().all(|c| c.change == ColumnChange::Unchanged));
        assert!(!a.has_data_affecting_change());
        assert_eq!(a.column_names(), vec!["pk", "c1", "c2"]);
    }

    #[test]
    fn test_rename_is_tag_continuous() {
        let from = base();
        let mut to = from.clone();
        to.rename_column("c1", "renamed").unwrap();
        let a = reconcile(&from, &to).unwrap();
        let tag = from.tag_of("c1").unwrap();
        assert_eq!(
            a.column(tag).unwrap().change,
            ColumnChange::Renamed { from: "c1".into() }
        );
        assert!(!a.has_data_affecting_change());
    }

    #[test]
    fn test_drop_and_readd_are_unrelated_columns() {
        let from = base();
        let mut to = from.clone();
        to.drop_column("c2").unwrap();
        to.add_column("t", "c2", StorageKind::String, true, None).unwrap();
        let a = reconcile(&from, &to).unwrap();
        let changes: Vec<_> = a.columns().iter().map(|c| c.change.clone()).collect();
        assert!(changes.contains(&ColumnChange::Added));
        assert!(changes.contains(&ColumnChange::Dropped));
        // Both display as c2.
        assert_eq!(a.column_names().iter().filter(|n| *n == "c2").count(), 2);
    }

    #[test]
    fn test_key_change_is_incompatible() {
        let from = base();
        let mut to = from.clone();
        to.set_primary_key(&["pk", "c1"]).unwrap();
        let err = reconcile(&from, &to).unwrap_err();
        assert!(matches!(err, SchemaError::IncompatibleKeyChange { .. }));
        assert!(!reconcile_lenient(&from, &to).key_compatible());
    }

    #[test]
    fn test_projection_coerces_and_warns() {
        let from = base();
        let mut to = from.clone();
        to.modify_column_kind("c2", StorageKind::Int).unwrap();
        let a = reconcile(&from, &to).unwrap();

        let c1 = from.tag_of("c1").unwrap();
        let c2 = from.tag_of("c2").unwrap();
        let mut warnings = DiffWarnings::new(8);

        let ok = Row::new().with(c1, 1).with(c2, "42");
        let projected = a.project_from(&Key::from(1), &ok, &mut warnings);
        assert_eq!(projected, vec![Value::Int(1), Value::Int(1), Value::Int(42)]);
        assert!(warnings.is_empty());

        let bad = Row::new().with(c1, 1).with(c2, "abc");
        let projected = a.project_from(&Key::from(2), &bad, &mut warnings);
        assert_eq!(projected[2], Value::Null);
        assert_eq!(warnings.total(), 1);
        assert!(warnings.messages()[0].contains("c2"));
    }

    #[test]
    fn test_projection_nulls_missing_side() {
        let from = base();
        let mut to = from.clone();
        to.drop_column("c1").unwrap();
        let a = reconcile(&from, &to).unwrap();
        let c1 = from.tag_of("c1").unwrap();
        let row = Row::new().with(c1, 9);
        let key = Key::from(1);
        let mut w = DiffWarnings::new(4);
        // Output order: pk, c2, c1 (dropped columns last).
        assert_eq!(a.project_from(&key, &row, &mut w), vec![Value::Int(1), Value::Null, Value::Int(9)]);
        assert_eq!(a.project_to(&key, &row), vec![Value::Int(1), Value::Null, Value::Null]);
    }
}

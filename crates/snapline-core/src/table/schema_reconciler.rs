//! Schema reconciliation and partition spec evolution.
//!
//! This module provides functionality for:
//! - Merging an existing table schema with a schema observed upstream
//! - Determining safe type promotions (widening only)
//! - Applying partition spec edits against the reconciled schema
//!
//! Columns are matched by exact name. Existing field ids are kept; new
//! fields get fresh ids above the table's last column id.

use crate::model::{
    Field, FieldType, ListType, MapType, PartitionField, PartitionSpec, PartitionSpecUpdate,
    PrimitiveType, Schema, StructType,
};
use crate::{Result, SchemaError};
use tracing::{debug, info};

/// A type change applied during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypePromotion {
    /// Qualified field name
    pub field: String,
    /// Previous type
    pub from: PrimitiveType,
    /// New type
    pub to: PrimitiveType,
}

/// Result of reconciling a schema.
#[derive(Debug, Clone)]
pub struct ReconciledSchema {
    /// The reconciled schema
    pub schema: Schema,
    /// Whether the schema differs from the existing one
    pub changed: bool,
    /// Highest column id assigned so far
    pub last_column_id: i32,
    /// Newly added fields
    pub added: Vec<String>,
    /// Fields present in the existing schema but not observed
    pub dropped: Vec<String>,
    /// Widened primitive types
    pub promoted: Vec<TypePromotion>,
    /// Fields relaxed from required to optional
    pub relaxed: Vec<String>,
}

/// Result of applying partition spec edits.
#[derive(Debug, Clone)]
pub struct EvolvedPartitionSpec {
    /// The resulting spec
    pub spec: PartitionSpec,
    /// Whether the partition spec differs from the existing one
    pub changed: bool,
}

/// Schema reconciliation logic.
pub struct SchemaReconciler;

impl SchemaReconciler {
    /// Reconcile `existing` with `observed`, assigning new ids above the
    /// highest id in `existing`.
    pub fn reconcile(existing: &Schema, observed: &Schema) -> Result<ReconciledSchema> {
        Self::reconcile_with_last_id(existing, observed, existing.highest_field_id())
    }

    /// Reconcile `existing` with `observed`, assigning new ids above
    /// `last_column_id`.
    pub fn reconcile_with_last_id(
        existing: &Schema,
        observed: &Schema,
        last_column_id: i32,
    ) -> Result<ReconciledSchema> {
        let mut ctx = Reconciliation {
            next_id: last_column_id.max(existing.highest_field_id()),
            added: Vec::new(),
            dropped: Vec::new(),
            promoted: Vec::new(),
            relaxed: Vec::new(),
        };

        let fields = ctx.reconcile_fields(None, &existing.fields, &observed.fields)?;
        let changed = fields != existing.fields;

        let schema = if changed {
            Schema::new(existing.schema_id + 1, fields)
        } else {
            existing.clone()
        };

        if changed {
            info!(
                schema_id = schema.schema_id,
                added = ctx.added.len(),
                dropped = ctx.dropped.len(),
                promoted = ctx.promoted.len(),
                relaxed = ctx.relaxed.len(),
                "Schema reconciled with changes"
            );
        } else {
            debug!(schema_id = schema.schema_id, "Observed schema matches table schema");
        }

        Ok(ReconciledSchema {
            schema,
            changed,
            last_column_id: ctx.next_id,
            added: ctx.added,
            dropped: ctx.dropped,
            promoted: ctx.promoted,
            relaxed: ctx.relaxed,
        })
    }

    /// Check if a primitive type promotion is a safe widening.
    pub fn is_safe_promotion(from: PrimitiveType, to: PrimitiveType) -> bool {
        use PrimitiveType::*;

        if from == to {
            return true;
        }

        match (from, to) {
            (Int, Long) | (Int, Double) | (Long, Double) | (Float, Double) => true,
            (
                Decimal {
                    precision: p1,
                    scale: s1,
                },
                Decimal {
                    precision: p2,
                    scale: s2,
                },
            ) => s1 == s2 && p2 >= p1,
            _ => false,
        }
    }

    /// Whether two types have the same structure, ignoring field ids.
    pub fn same_shape(a: &FieldType, b: &FieldType) -> bool {
        match (a, b) {
            (FieldType::Primitive(x), FieldType::Primitive(y)) => x == y,
            (FieldType::Struct(x), FieldType::Struct(y)) => {
                x.fields.len() == y.fields.len()
                    && x.fields.iter().all(|f| {
                        y.field_by_name(&f.name).is_some_and(|g| {
                            f.required == g.required
                                && Self::same_shape(&f.field_type, &g.field_type)
                        })
                    })
            }
            (FieldType::List(x), FieldType::List(y)) => {
                x.element_required == y.element_required
                    && Self::same_shape(&x.element, &y.element)
            }
            (FieldType::Map(x), FieldType::Map(y)) => {
                x.value_required == y.value_required
                    && Self::same_shape(&x.key, &y.key)
                    && Self::same_shape(&x.value, &y.value)
            }
            _ => false,
        }
    }

    /// Apply partition spec edits in order.
    ///
    /// `schema` is the schema the partition spec will be used with, after
    /// reconciliation.
    pub fn evolve_partition_spec(
        spec: &PartitionSpec,
        schema: &Schema,
        updates: &[PartitionSpecUpdate],
    ) -> Result<EvolvedPartitionSpec> {
        let mut fields = spec.fields.clone();

        for update in updates {
            match update {
                PartitionSpecUpdate::AddField {
                    source_name,
                    name,
                    transform,
                } => {
                    if schema.field_by_name(source_name).is_none() {
                        return Err(SchemaError::PartitionSourceMissing {
                            column: source_name.clone(),
                        }
                        .into());
                    }
                    let name = name.clone().unwrap_or_else(|| {
                        PartitionSpecUpdate::default_field_name(source_name, transform)
                    });

                    match fields.iter().find(|f| f.name == name) {
                        Some(f) if f.source_name == *source_name && f.transform == *transform => {
                            debug!(field = %name, "Partition field already present");
                        }
                        Some(f) => {
                            return Err(SchemaError::UnsupportedPartitionChange {
                                field: name.clone(),
                                reason: format!(
                                    "already defined as {}({})",
                                    f.transform, f.source_name
                                ),
                            }
                            .into());
                        }
                        None => fields.push(PartitionField {
                            source_name: source_name.clone(),
                            name,
                            transform: *transform,
                        }),
                    }
                }
                PartitionSpecUpdate::RemoveField { name } => {
                    let before = fields.len();
                    fields.retain(|f| f.name != *name);
                    if fields.len() == before {
                        return Err(SchemaError::PartitionFieldMissing {
                            field: name.clone(),
                        }
                        .into());
                    }
                }
                PartitionSpecUpdate::ReplaceTransform { name, transform } => {
                    match fields.iter_mut().find(|f| f.name == *name) {
                        Some(field) => field.transform = *transform,
                        None => {
                            return Err(SchemaError::UnsupportedPartitionChange {
                                field: name.clone(),
                                reason: "field was never part of the partition spec".into(),
                            }
                            .into());
                        }
                    }
                }
            }
        }

        let changed = fields != spec.fields;
        let evolved = if changed {
            PartitionSpec {
                spec_id: spec.spec_id + 1,
                fields,
            }
        } else {
            spec.clone()
        };

        Self::validate_partition_spec(&evolved, schema)?;

        if changed {
            info!(
                spec_id = evolved.spec_id,
                fields = evolved.fields.len(),
                "Partition spec evolved"
            );
        }

        Ok(EvolvedPartitionSpec {
            spec: evolved,
            changed,
        })
    }

    /// Check that every partition source column exists in `schema`.
    pub fn validate_partition_spec(spec: &PartitionSpec, schema: &Schema) -> Result<()> {
        for field in &spec.fields {
            if schema.field_by_name(&field.source_name).is_none() {
                return Err(SchemaError::PartitionSourceMissing {
                    column: field.source_name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Mutable state for one reconciliation.
struct Reconciliation {
    next_id: i32,
    added: Vec<String>,
    dropped: Vec<String>,
    promoted: Vec<TypePromotion>,
    relaxed: Vec<String>,
}

impl Reconciliation {
    fn fresh_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn qualify(parent: Option<&str>, name: &str) -> String {
        match parent {
            Some(p) => format!("{}.{}", p, name),
            None => name.to_string(),
        }
    }

    fn reconcile_fields(
        &mut self,
        parent: Option<&str>,
        existing: &[Field],
        observed: &[Field],
    ) -> Result<Vec<Field>> {
        let mut fields = Vec::with_capacity(observed.len());

        for obs in observed {
            let path = Self::qualify(parent, &obs.name);
            match existing.iter().find(|e| e.name == obs.name) {
                Some(ex) => {
                    if !ex.required && obs.required {
                        return Err(SchemaError::NullabilityTightened { field: path }.into());
                    }
                    if ex.required && !obs.required {
                        self.relaxed.push(path.clone());
                    }
                    let field_type = self.reconcile_type(&path, &ex.field_type, &obs.field_type)?;
                    fields.push(Field {
                        id: ex.id,
                        name: ex.name.clone(),
                        required: ex.required && obs.required,
                        field_type,
                        doc: ex.doc.clone().or_else(|| obs.doc.clone()),
                    });
                }
                None => {
                    debug!(field = %path, field_type = %obs.field_type, "Detected new field");
                    let id = self.fresh_id();
                    let field_type = self.assign_fresh_ids(&obs.field_type);
                    self.added.push(path);
                    fields.push(Field {
                        id,
                        name: obs.name.clone(),
                        required: obs.required,
                        field_type,
                        doc: obs.doc.clone(),
                    });
                }
            }
        }

        for ex in existing {
            if !observed.iter().any(|o| o.name == ex.name) {
                self.dropped.push(Self::qualify(parent, &ex.name));
            }
        }

        // A pure reordering keeps the existing layout.
        if fields.len() == existing.len() && fields.iter().all(|f| existing.contains(f)) {
            return Ok(existing.to_vec());
        }

        Ok(fields)
    }

    fn reconcile_type(
        &mut self,
        path: &str,
        existing: &FieldType,
        observed: &FieldType,
    ) -> Result<FieldType> {
        if SchemaReconciler::same_shape(existing, observed) {
            return Ok(existing.clone());
        }

        match (existing, observed) {
            (FieldType::Primitive(from), FieldType::Primitive(to)) => {
                if SchemaReconciler::is_safe_promotion(*from, *to) {
                    self.promoted.push(TypePromotion {
                        field: path.to_string(),
                        from: *from,
                        to: *to,
                    });
                    Ok(FieldType::Primitive(*to))
                } else {
                    Err(incompatible(path, existing, observed))
                }
            }
            (FieldType::Struct(ex), FieldType::Struct(obs)) => Ok(FieldType::Struct(
                StructType::new(self.reconcile_fields(Some(path), &ex.fields, &obs.fields)?),
            )),
            (FieldType::List(ex), FieldType::List(obs)) => {
                let element_path = format!("{}.element", path);
                if !ex.element_required && obs.element_required {
                    return Err(SchemaError::NullabilityTightened {
                        field: element_path,
                    }
                    .into());
                }
                let element = self.reconcile_type(&element_path, &ex.element, &obs.element)?;
                Ok(FieldType::List(ListType {
                    element_id: ex.element_id,
                    element_required: ex.element_required && obs.element_required,
                    element: Box::new(element),
                }))
            }
            (FieldType::Map(ex), FieldType::Map(obs)) => {
                let key = self.reconcile_type(&format!("{}.key", path), &ex.key, &obs.key)?;
                let value_path = format!("{}.value", path);
                if !ex.value_required && obs.value_required {
                    return Err(SchemaError::NullabilityTightened { field: value_path }.into());
                }
                let value = self.reconcile_type(&value_path, &ex.value, &obs.value)?;
                Ok(FieldType::Map(MapType {
                    key_id: ex.key_id,
                    key: Box::new(key),
                    value_id: ex.value_id,
                    value_required: ex.value_required && obs.value_required,
                    value: Box::new(value),
                }))
            }
            _ => Err(incompatible(path, existing, observed)),
        }
    }

    /// Copy a type, replacing every nested field id with a fresh one.
    fn assign_fresh_ids(&mut self, ty: &FieldType) -> FieldType {
        match ty {
            FieldType::Primitive(p) => FieldType::Primitive(*p),
            FieldType::Struct(s) => FieldType::Struct(StructType::new(
                s.fields
                    .iter()
                    .map(|f| {
                        let id = self.fresh_id();
                        Field {
                            id,
                            name: f.name.clone(),
                            required: f.required,
                            field_type: self.assign_fresh_ids(&f.field_type),
                            doc: f.doc.clone(),
                        }
                    })
                    .collect(),
            )),
            FieldType::List(l) => {
                let element_id = self.fresh_id();
                FieldType::List(ListType {
                    element_id,
                    element_required: l.element_required,
                    element: Box::new(self.assign_fresh_ids(&l.element)),
                })
            }
            FieldType::Map(m) => {
                let key_id = self.fresh_id();
                let value_id = self.fresh_id();
                FieldType::Map(MapType {
                    key_id,
                    key: Box::new(self.assign_fresh_ids(&m.key)),
                    value_id,
                    value_required: m.value_required,
                    value: Box::new(self.assign_fresh_ids(&m.value)),
                })
            }
        }
    }
}

fn incompatible(path: &str, existing: &FieldType, observed: &FieldType) -> crate::Error {
    SchemaError::IncompatibleType {
        field: path.to_string(),
        existing: existing.to_string(),
        observed: observed.to_string(),
    }
    .into()
}

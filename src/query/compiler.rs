//! Query compiler
//!
//! Resolves a [`Query`] against a composite schema and produces a typed
//! [`QueryPlan`]. Compilation never touches the store.
//!
//! # Rules
//!
//! - The first column is the grouping key: recid when querying a snapshot of
//!   a DAG with recids, the content-row id otherwise
//! - `==`/`!=` against null compile to IS [NOT] NULL
//! - `in` lists longer than the inline limit become temp-set membership
//! - A field with exactly one ordering sorts by rank
//! - Sort names that are not fields must name a projected output column;
//!   anything else is `FieldNotFound`
//! - Sub-collection fields are never sortable, and followed fields only in a
//!   snapshot
//! - ORDER BY always ends with the grouping key, then sub-collection keys
//! - History or one-to-many joins defer pagination to the assembler

use tracing::debug;
use uuid::Uuid;

use super::ast::{
    CompareOp, Criteria, Literal, Projection, Query, SortDirection, SortSpec, HIDREC_KEY,
    JUNCTION_RECID_KEY, RELEVANCE_KEY,
};
use super::errors::{CompileError, CompileResult};
use super::plan::{
    ColumnExpr, ColumnRole, HistoryField, JoinArena, JoinHandle, JoinKind, OrderExpr,
    OrderTerm, Pagination, PlanColumn, Predicate, QueryPlan, TableSource, TempSet,
};
use crate::schema::{CompositeSchema, FieldSpec, FieldType, RecordType, RECID_FIELD};
use crate::store::naming::{field_column, HIDREC_COLUMN, ROWID_COLUMN};
use crate::store::values::to_sql_value;

/// Compiles queries against one composite schema
pub struct QueryCompiler<'s> {
    schema: &'s CompositeSchema,
    inline_in_list_max: usize,
}

impl<'s> QueryCompiler<'s> {
    pub fn new(schema: &'s CompositeSchema, inline_in_list_max: usize) -> Self {
        Self {
            schema,
            inline_in_list_max,
        }
    }

    /// Compile a full query
    pub fn compile(&self, query: &Query) -> CompileResult<QueryPlan> {
        let source = if query.as_of.is_some() {
            TableSource::Snapshot
        } else {
            TableSource::Current
        };
        let mut c = self.start(&query.rectype, source)?;

        let default_projection = [Projection::AllFields];
        let projection = if query.projection.is_empty() {
            &default_projection[..]
        } else {
            &query.projection[..]
        };
        for item in projection {
            c.project(item)?;
        }

        if let Some(criteria) = &query.criteria {
            c.predicate = Some(c.criteria(criteria)?);
        }
        c.project_relevance();

        for sort in &query.sort {
            c.sort(sort)?;
        }
        c.finish_order();

        let pagination = Pagination::from_parts(query.limit, query.skip);
        let plan = c.into_plan(pagination);
        debug!(
            rectype = %plan.rectype,
            columns = plan.columns.len(),
            joins = plan.joins.len(),
            multirow = plan.multirow,
            with_history = plan.with_history,
            "compiled query"
        );
        Ok(plan)
    }

    /// Compile a lookup by a unique field.
    ///
    /// In a snapshot at most two rows are fetched so that ambiguity can be
    /// detected. Without one every indexed version of the record matches.
    pub fn compile_lookup(
        &self,
        rectype: &str,
        field: &str,
        value: Literal,
        projection: &[Projection],
        as_of: Option<&str>,
    ) -> CompileResult<QueryPlan> {
        if !self.schema.kind.allows_unique {
            return Err(CompileError::unique_lookup_unsupported(field));
        }
        let rt = self.rectype(rectype)?;
        let spec = rt
            .field(field)
            .ok_or_else(|| CompileError::field_not_found(rectype, field))?;
        if !(spec.unique || field == RECID_FIELD) {
            return Err(CompileError::invalid_argument(format!(
                "field '{}' is not unique",
                field
            )));
        }

        let mut query = Query::new(rectype).with_criteria(Criteria::eq(field, value));
        query.projection = projection.to_vec();
        if let Some(csid) = as_of {
            query = query.as_of(csid).with_limit(2);
        }
        self.compile(&query)
    }

    /// Compile the criteria of a query for counting logical records
    pub fn compile_count(&self, query: &Query) -> CompileResult<QueryPlan> {
        let source = if query.as_of.is_some() {
            TableSource::Snapshot
        } else {
            TableSource::Current
        };
        let mut c = self.start(&query.rectype, source)?;
        if let Some(criteria) = &query.criteria {
            c.predicate = Some(c.criteria(criteria)?);
        }
        Ok(c.into_plan(None))
    }

    /// Compile the changeset trail of the given records.
    ///
    /// Every indexed version of each recid contributes its history entries;
    /// `field` adds that field's value in each version.
    pub fn compile_history(
        &self,
        rectype: &str,
        recids: &[String],
        field: Option<&str>,
    ) -> CompileResult<QueryPlan> {
        let rt = self.rectype(rectype)?;
        if !rt.has_recid() {
            return Err(CompileError::invalid_argument(format!(
                "record type '{}' has no recid",
                rectype
            )));
        }

        let mut c = Compilation::new(self, rt, TableSource::Current);
        c.columns.push(PlanColumn {
            expr: ColumnExpr::base(field_column(RECID_FIELD)),
            role: ColumnRole::GroupKey,
            field_type: Some(FieldType::String),
        });

        let log = c.joins.intern(JoinKind::HistoryLog { versions: None });
        c.project_history_columns(log);
        if let Some(field) = field {
            let spec = c.field(field)?;
            c.columns.push(PlanColumn {
                expr: ColumnExpr::base(field_column(field)),
                role: ColumnRole::History(HistoryField::Value),
                field_type: Some(spec.field_type),
            });
        }
        c.with_history = true;

        let criteria = Criteria::in_list(RECID_FIELD, recids.iter().cloned());
        c.predicate = Some(c.criteria(&criteria)?);
        c.finish_order();
        Ok(c.into_plan(None))
    }

    fn rectype(&self, name: &str) -> CompileResult<&'s RecordType> {
        self.schema
            .rectype(name)
            .ok_or_else(|| CompileError::unknown_rectype(name))
    }

    fn start(&self, rectype: &str, source: TableSource) -> CompileResult<Compilation<'_, 's>> {
        let rt = self.rectype(rectype)?;
        let mut c = Compilation::new(self, rt, source);

        let (column, field_type) = if source == TableSource::Snapshot && rt.has_recid() {
            (field_column(RECID_FIELD), Some(FieldType::String))
        } else {
            (ROWID_COLUMN.to_string(), None)
        };
        c.columns.push(PlanColumn {
            expr: ColumnExpr::base(column),
            role: ColumnRole::GroupKey,
            field_type,
        });
        Ok(c)
    }
}

/// State of one compile call
struct Compilation<'c, 's> {
    compiler: &'c QueryCompiler<'s>,
    rectype: &'s RecordType,
    source: TableSource,
    columns: Vec<PlanColumn>,
    joins: JoinArena,
    predicate: Option<Predicate>,
    order: Vec<OrderTerm>,
    temp_sets: Vec<TempSet>,
    relevance: Vec<JoinHandle>,
    with_history: bool,
    multirow: bool,
}

impl<'c, 's> Compilation<'c, 's> {
    fn new(compiler: &'c QueryCompiler<'s>, rectype: &'s RecordType, source: TableSource) -> Self {
        Self {
            compiler,
            rectype,
            source,
            columns: Vec::new(),
            joins: JoinArena::new(),
            predicate: None,
            order: Vec::new(),
            temp_sets: Vec::new(),
            relevance: Vec::new(),
            with_history: false,
            multirow: false,
        }
    }

    fn field(&self, name: &str) -> CompileResult<&'s FieldSpec> {
        self.rectype
            .field(name)
            .ok_or_else(|| CompileError::field_not_found(&self.rectype.name, name))
    }

    fn other_rectype(&self, name: &str) -> CompileResult<&'s RecordType> {
        self.compiler.rectype(name)
    }

    fn require_recid(&self, what: &str) -> CompileResult<()> {
        if self.rectype.has_recid() {
            Ok(())
        } else {
            Err(CompileError::invalid_argument(format!(
                "{} requires records with a recid",
                what
            )))
        }
    }

    fn push_scalar(&mut self, name: String, nested: Option<String>, expr: ColumnExpr, ty: Option<FieldType>) {
        let role = ColumnRole::Scalar { name, nested };
        if self.columns.iter().any(|c| c.role == role) {
            return;
        }
        self.columns.push(PlanColumn {
            expr,
            role,
            field_type: ty,
        });
    }

    fn project(&mut self, item: &Projection) -> CompileResult<()> {
        match item {
            Projection::Field { name, alias } => {
                let spec = self.field(name)?;
                let output = alias.clone().unwrap_or_else(|| name.clone());
                self.push_scalar(
                    output,
                    None,
                    ColumnExpr::base(field_column(name)),
                    Some(spec.field_type),
                );
            }
            Projection::AllFields => {
                let rectype = self.rectype;
                for (name, spec) in &rectype.fields {
                    self.push_scalar(
                        name.clone(),
                        None,
                        ColumnExpr::base(field_column(name)),
                        Some(spec.field_type),
                    );
                }
            }
            Projection::ContentHash => {
                self.push_scalar(
                    HIDREC_KEY.to_string(),
                    None,
                    ColumnExpr::base(HIDREC_COLUMN),
                    Some(FieldType::String),
                );
            }
            Projection::History => {
                if self.source != TableSource::Snapshot {
                    return Err(CompileError::history_requires_snapshot());
                }
                if self.with_history {
                    return Ok(());
                }
                let versions = if self.rectype.has_recid() {
                    Some(self.joins.intern(JoinKind::HistoryVersions))
                } else {
                    None
                };
                let log = self.joins.intern(JoinKind::HistoryLog { versions });
                self.project_history_columns(log);
                self.with_history = true;
            }
            Projection::Follow {
                ref_field,
                fields,
                alias,
            } => {
                self.require_recid("follow")?;
                let spec = self.field(ref_field)?;
                let target = reference_target(&self.rectype.name, ref_field, spec)?;
                let target_rt = self.other_rectype(target)?;
                let handle = self.joins.intern(JoinKind::Follow {
                    target: target.to_string(),
                    ref_field: ref_field.clone(),
                });
                let nested = alias.clone().unwrap_or_else(|| ref_field.clone());
                for (name, spec) in select_fields(target_rt, fields)? {
                    self.push_scalar(
                        name.to_string(),
                        Some(nested.clone()),
                        ColumnExpr::join(handle, field_column(name)),
                        Some(spec.field_type),
                    );
                }
                // Without a snapshot every version of the target matches.
                if self.source == TableSource::Current {
                    self.multirow = true;
                }
            }
            Projection::Reverse {
                rectype,
                ref_field,
                fields,
                alias,
            } => {
                self.require_recid("reverse")?;
                let other = self.other_rectype(rectype)?;
                let spec = other
                    .field(ref_field)
                    .ok_or_else(|| CompileError::field_not_found(rectype, ref_field.as_str()))?;
                self.require_target(rectype, ref_field, spec)?;

                let handle = self.joins.intern(JoinKind::Reverse {
                    rectype: rectype.clone(),
                    ref_field: ref_field.clone(),
                });
                self.push_collection(alias, handle, other, fields)?;
            }
            Projection::Xref {
                junction,
                ref_to_me,
                ref_to_other,
                fields,
                alias,
                expose_junction_recid,
            } => {
                self.require_recid("xref")?;
                let junction_rt = self.other_rectype(junction)?;
                let to_me = junction_rt
                    .field(ref_to_me)
                    .ok_or_else(|| CompileError::field_not_found(junction, ref_to_me.as_str()))?;
                self.require_target(junction, ref_to_me, to_me)?;
                let to_other = junction_rt
                    .field(ref_to_other)
                    .ok_or_else(|| CompileError::field_not_found(junction, ref_to_other.as_str()))?;
                let target = reference_target(junction, ref_to_other, to_other)?;
                let target_rt = self.other_rectype(target)?;

                let x = self.joins.intern(JoinKind::Junction {
                    rectype: junction.clone(),
                    ref_to_me: ref_to_me.clone(),
                });
                let t = self.joins.intern(JoinKind::XrefTarget {
                    junction: x,
                    target: target.to_string(),
                    ref_to_other: ref_to_other.clone(),
                });

                self.multirow = true;
                self.columns.push(PlanColumn {
                    expr: ColumnExpr::join(x, ROWID_COLUMN),
                    role: ColumnRole::SubCollectionKey {
                        collection: alias.clone(),
                    },
                    field_type: None,
                });
                for (name, spec) in select_fields(target_rt, fields)? {
                    self.columns.push(PlanColumn {
                        expr: ColumnExpr::join(t, field_column(name)),
                        role: ColumnRole::SubCollection {
                            collection: alias.clone(),
                            field: name.to_string(),
                        },
                        field_type: Some(spec.field_type),
                    });
                }
                if *expose_junction_recid {
                    self.columns.push(PlanColumn {
                        expr: ColumnExpr::join(x, field_column(RECID_FIELD)),
                        role: ColumnRole::SubCollection {
                            collection: alias.clone(),
                            field: JUNCTION_RECID_KEY.to_string(),
                        },
                        field_type: Some(FieldType::String),
                    });
                }
            }
            Projection::Username { field, alias } => {
                let spec = self.field(field)?;
                if spec.field_type != FieldType::Userid {
                    return Err(CompileError::invalid_argument(format!(
                        "username() needs a userid field, '{}' is {}",
                        field,
                        spec.field_type.type_name()
                    )));
                }
                let handle = self.joins.intern(JoinKind::Username {
                    field: field.clone(),
                });
                let output = alias.clone().unwrap_or_else(|| format!("{}_name", field));
                self.push_scalar(
                    output,
                    None,
                    ColumnExpr::join(handle, "name"),
                    Some(FieldType::String),
                );
            }
        }
        Ok(())
    }

    /// The reference field must point at the queried record type
    fn require_target(&self, owner: &str, field: &str, spec: &FieldSpec) -> CompileResult<()> {
        let target = reference_target(owner, field, spec)?;
        if target != self.rectype.name {
            return Err(CompileError::invalid_argument(format!(
                "'{}.{}' references '{}', not '{}'",
                owner, field, target, self.rectype.name
            )));
        }
        Ok(())
    }

    fn push_collection(
        &mut self,
        alias: &str,
        handle: JoinHandle,
        rectype: &RecordType,
        fields: &[String],
    ) -> CompileResult<()> {
        self.multirow = true;
        self.columns.push(PlanColumn {
            expr: ColumnExpr::join(handle, ROWID_COLUMN),
            role: ColumnRole::SubCollectionKey {
                collection: alias.to_string(),
            },
            field_type: None,
        });
        for (name, spec) in select_fields(rectype, fields)? {
            self.columns.push(PlanColumn {
                expr: ColumnExpr::join(handle, field_column(name)),
                role: ColumnRole::SubCollection {
                    collection: alias.to_string(),
                    field: name.to_string(),
                },
                field_type: Some(spec.field_type),
            });
        }
        Ok(())
    }

    fn project_history_columns(&mut self, log: JoinHandle) {
        let changeset = self.joins.intern(JoinKind::HistoryChangeset { log });
        let audit = self.joins.intern(JoinKind::HistoryAudit { log });
        let columns = [
            (log, "csid", HistoryField::Changeset, Some(FieldType::String)),
            (log, "hidrec", HistoryField::ContentHash, Some(FieldType::String)),
            (changeset, "generation", HistoryField::Generation, Some(FieldType::Int)),
            (audit, "userid", HistoryField::AuditUser, Some(FieldType::String)),
            (audit, "timestamp", HistoryField::AuditTime, Some(FieldType::Int)),
        ];
        for (handle, column, field, field_type) in columns {
            self.columns.push(PlanColumn {
                expr: ColumnExpr::join(handle, column),
                role: ColumnRole::History(field),
                field_type,
            });
        }
    }

    fn project_relevance(&mut self) {
        if self.relevance.is_empty() {
            return;
        }
        let expr = ColumnExpr::Relevance(self.relevance.clone());
        self.push_scalar(RELEVANCE_KEY.to_string(), None, expr, Some(FieldType::Int));
    }

    /// Column and type a criteria field reads
    fn criteria_field(&self, name: &str) -> CompileResult<(ColumnExpr, FieldType)> {
        if name == HIDREC_KEY {
            return Ok((ColumnExpr::base(HIDREC_COLUMN), FieldType::String));
        }
        let spec = self.field(name)?;
        Ok((ColumnExpr::base(field_column(name)), spec.field_type))
    }

    fn criteria(&mut self, node: &Criteria) -> CompileResult<Predicate> {
        match node {
            Criteria::Compare { field, op, value } => {
                let (expr, field_type) = self.criteria_field(field)?;
                if value.is_null() {
                    return match op {
                        CompareOp::Eq => Ok(Predicate::IsNull {
                            expr,
                            negated: false,
                        }),
                        CompareOp::Ne => Ok(Predicate::IsNull {
                            expr,
                            negated: true,
                        }),
                        other => Err(CompileError::invalid_argument(format!(
                            "'{}' cannot compare against null",
                            other.sql()
                        ))),
                    };
                }
                Ok(Predicate::Compare {
                    expr,
                    op: *op,
                    value: literal_value(field, field_type, value)?,
                })
            }
            Criteria::Match { field, phrase } => {
                if phrase.trim().is_empty() {
                    return Err(CompileError::invalid_argument("empty match phrase"));
                }
                match field {
                    Some(name) => {
                        if !self.field(name)?.full_text {
                            return Err(CompileError::invalid_argument(format!(
                                "field '{}' is not full-text indexed",
                                name
                            )));
                        }
                    }
                    None => {
                        if self.rectype.full_text_fields().is_empty() {
                            return Err(CompileError::invalid_argument(format!(
                                "record type '{}' has no full-text fields",
                                self.rectype.name
                            )));
                        }
                    }
                }
                let handle = self.joins.intern(JoinKind::FullText {
                    field: field.clone(),
                    phrase: phrase.clone(),
                });
                if !self.relevance.contains(&handle) {
                    self.relevance.push(handle);
                }
                Ok(Predicate::FullText(handle))
            }
            Criteria::In { field, values } => {
                let (expr, field_type) = self.criteria_field(field)?;
                let values = values
                    .iter()
                    .map(|v| literal_value(field, field_type, v))
                    .collect::<CompileResult<Vec<_>>>()?;
                if values.len() > self.compiler.inline_in_list_max {
                    let set = self.temp_sets.len();
                    self.temp_sets.push(TempSet {
                        name: format!("inset_{}", Uuid::new_v4().simple()),
                        values,
                    });
                    Ok(Predicate::InTempSet { expr, set })
                } else {
                    Ok(Predicate::InList { expr, values })
                }
            }
            Criteria::Exists(field) => Ok(Predicate::IsNull {
                expr: self.criteria_field(field)?.0,
                negated: true,
            }),
            Criteria::IsNull(field) => Ok(Predicate::IsNull {
                expr: self.criteria_field(field)?.0,
                negated: false,
            }),
            Criteria::And(left, right) => Ok(Predicate::And(
                Box::new(self.criteria(left)?),
                Box::new(self.criteria(right)?),
            )),
            Criteria::Or(left, right) => Ok(Predicate::Or(
                Box::new(self.criteria(left)?),
                Box::new(self.criteria(right)?),
            )),
        }
    }

    fn sort(&mut self, sort: &SortSpec) -> CompileResult<()> {
        let name = sort.field.as_str();

        if let Some(spec) = self.rectype.field(name) {
            let expr = match spec.orderings.len() {
                0 => ColumnExpr::base(field_column(name)),
                1 => {
                    let ordering = &spec.orderings[0];
                    let handle = self.joins.intern(JoinKind::Ordering {
                        field: name.to_string(),
                        ordering: ordering.name.clone(),
                    });
                    ColumnExpr::join(handle, "rank")
                }
                n => {
                    return Err(CompileError::invalid_sort(
                        name,
                        format!("field has {} orderings", n),
                    ))
                }
            };
            self.order.push(OrderTerm {
                expr: OrderExpr::Column(expr),
                direction: sort.direction,
            });
            return Ok(());
        }

        if name == HIDREC_KEY {
            self.order.push(OrderTerm {
                expr: OrderExpr::Column(ColumnExpr::base(HIDREC_COLUMN)),
                direction: sort.direction,
            });
            return Ok(());
        }

        let column = self
            .columns
            .iter()
            .enumerate()
            .find(|(i, c)| c.role.output_name(*i) == name)
            .map(|(_, c)| c);
        match column {
            Some(c) => match c.role {
                ColumnRole::SubCollection { .. } | ColumnRole::SubCollectionKey { .. } => Err(
                    CompileError::invalid_sort(name, "sub-collection fields cannot be sorted on"),
                ),
                // Every version of a followed record joins here, so its
                // values differ between rows of one group.
                ColumnRole::Scalar { nested: Some(_), .. } if self.source == TableSource::Current => {
                    Err(CompileError::invalid_sort(
                        name,
                        "followed fields can only be sorted on in a snapshot",
                    ))
                }
                _ => {
                    self.order.push(OrderTerm {
                        expr: OrderExpr::Alias(name.to_string()),
                        direction: sort.direction,
                    });
                    Ok(())
                }
            },
            None => Err(CompileError::field_not_found(&self.rectype.name, name)),
        }
    }

    /// Keep rows of one record, and of one sub-collection item, contiguous
    fn finish_order(&mut self) {
        let keys: Vec<ColumnExpr> = self
            .columns
            .iter()
            .filter(|c| {
                matches!(
                    c.role,
                    ColumnRole::GroupKey | ColumnRole::SubCollectionKey { .. }
                )
            })
            .map(|c| c.expr.clone())
            .collect();
        for expr in keys {
            self.order.push(OrderTerm {
                expr: OrderExpr::Column(expr),
                direction: SortDirection::Asc,
            });
        }
    }

    fn into_plan(self, pagination: Option<Pagination>) -> QueryPlan {
        let defer = self.with_history || self.multirow;
        QueryPlan {
            rectype: self.rectype.name.clone(),
            source: self.source,
            columns: self.columns,
            joins: self.joins,
            predicate: self.predicate,
            order: self.order,
            pushed: if defer { None } else { pagination },
            deferred: if defer { pagination } else { None },
            temp_sets: self.temp_sets,
            with_history: self.with_history,
            multirow: self.multirow,
        }
    }
}

fn reference_target<'a>(owner: &str, field: &str, spec: &'a FieldSpec) -> CompileResult<&'a str> {
    match (&spec.field_type, &spec.ref_target) {
        (FieldType::Reference, Some(target)) => Ok(target.as_str()),
        _ => Err(CompileError::invalid_argument(format!(
            "'{}.{}' is not a reference field",
            owner, field
        ))),
    }
}

/// Requested fields of a joined record type; all of them if none are named
fn select_fields<'r>(
    rectype: &'r RecordType,
    fields: &[String],
) -> CompileResult<Vec<(&'r str, &'r FieldSpec)>> {
    if fields.is_empty() {
        return Ok(rectype
            .fields
            .iter()
            .map(|(name, spec)| (name.as_str(), spec))
            .collect());
    }
    fields
        .iter()
        .map(|name| {
            rectype
                .fields
                .get_key_value(name.as_str())
                .map(|(name, spec)| (name.as_str(), spec))
                .ok_or_else(|| CompileError::field_not_found(&rectype.name, name.as_str()))
        })
        .collect()
}

fn literal_value(
    field: &str,
    field_type: FieldType,
    literal: &Literal,
) -> CompileResult<rusqlite::types::Value> {
    to_sql_value(field_type, &literal.to_json()).map_err(|reason| {
        CompileError::invalid_argument(format!("bad literal for '{}': {}", field, reason))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagKind;
    use crate::query::CompileErrorCode;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema(kind: DagKind) -> CompositeSchema {
        let mut item = RecordType::new("item");
        item.fields.insert("name".into(), FieldSpec::string().indexed());
        item.fields.insert("code".into(), FieldSpec::string().unique());
        item.fields.insert(
            "priority".into(),
            FieldSpec::int().with_ordering("rank", vec![json!(1), json!(3), json!(5)]),
        );
        item.fields.insert(
            "size".into(),
            FieldSpec::int()
                .with_ordering("a", vec![json!(1)])
                .with_ordering("b", vec![json!(2)]),
        );
        item.fields.insert("body".into(), FieldSpec::string().full_text());
        item.fields.insert("owner".into(), FieldSpec::reference("person"));
        let mut person = RecordType::new("person");
        person.fields.insert("name".into(), FieldSpec::string());
        let mut tag = RecordType::new("tag");
        tag.fields.insert("item".into(), FieldSpec::reference("item"));
        tag.fields.insert("label".into(), FieldSpec::string());

        let mut rectypes = BTreeMap::new();
        for mut rt in [item, person, tag] {
            if kind.has_recid {
                rt.fields.insert(RECID_FIELD.into(), FieldSpec::string().indexed());
            }
            rectypes.insert(rt.name.clone(), rt);
        }
        CompositeSchema {
            kind,
            templates: vec!["t1".into()],
            rectypes,
        }
    }

    fn code(result: CompileResult<QueryPlan>) -> CompileErrorCode {
        result.unwrap_err().code()
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);

        assert_eq!(
            code(compiler.compile(&Query::new("ghost"))),
            CompileErrorCode::UnknownRecordType
        );
        assert_eq!(
            code(compiler.compile(&Query::new("item").with_criteria(Criteria::eq("nope", 1)))),
            CompileErrorCode::FieldNotFound
        );
        assert_eq!(
            code(compiler.compile(&Query::new("item").with_sort(SortSpec::asc("nope")))),
            CompileErrorCode::FieldNotFound
        );
    }

    #[test]
    fn test_history_requires_snapshot() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let query = Query::new("item").with_projection(Projection::History);

        assert_eq!(
            code(compiler.compile(&query)),
            CompileErrorCode::HistoryRequiresSnapshot
        );
        let plan = compiler.compile(&query.as_of("c1")).unwrap();
        assert!(plan.with_history);
    }

    #[test]
    fn test_sort_with_two_orderings_is_invalid() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        assert_eq!(
            code(compiler.compile(&Query::new("item").with_sort(SortSpec::asc("size")))),
            CompileErrorCode::InvalidSort
        );
    }

    #[test]
    fn test_single_ordering_sorts_by_rank() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let plan = compiler
            .compile(&Query::new("item").with_sort(SortSpec::asc("priority")))
            .unwrap();

        assert_eq!(plan.joins.len(), 1);
        let first = &plan.order[0];
        assert_eq!(
            first.expr,
            OrderExpr::Column(ColumnExpr::join(JoinHandle(0), "rank"))
        );
        // Grouping key closes the order.
        assert_eq!(
            plan.order.last().unwrap().expr,
            OrderExpr::Column(ColumnExpr::base(ROWID_COLUMN))
        );
    }

    #[test]
    fn test_unique_lookup_needs_unique_capable_dag() {
        let schema = schema(DagKind::recid_less());
        let compiler = QueryCompiler::new(&schema, 10);
        let result = compiler.compile_lookup("item", "code", "x".into(), &[], None);
        assert_eq!(code(result), CompileErrorCode::UniqueLookupUnsupported);

        let schema = self::schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let plan = compiler
            .compile_lookup("item", "code", "x".into(), &[], Some("c1"))
            .unwrap();
        assert_eq!(plan.pushed.unwrap().limit, Some(2));
        assert_eq!(
            code(compiler.compile_lookup("item", "name", "x".into(), &[], None)),
            CompileErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_long_in_list_becomes_temp_set() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);

        let short = compiler
            .compile(&Query::new("item").with_criteria(Criteria::in_list("code", ["a", "b"])))
            .unwrap();
        assert!(short.temp_sets.is_empty());
        assert!(matches!(short.predicate, Some(Predicate::InList { .. })));

        let values: Vec<String> = (0..15).map(|i| format!("c{}", i)).collect();
        let long = compiler
            .compile(&Query::new("item").with_criteria(Criteria::in_list("code", values)))
            .unwrap();
        assert_eq!(long.temp_sets.len(), 1);
        assert_eq!(long.temp_sets[0].values.len(), 15);
        assert!(matches!(long.predicate, Some(Predicate::InTempSet { set: 0, .. })));
    }

    #[test]
    fn test_null_comparisons() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);

        let plan = compiler
            .compile(&Query::new("item").with_criteria(Criteria::compare(
                "name",
                CompareOp::Ne,
                Literal::Null,
            )))
            .unwrap();
        assert!(matches!(
            plan.predicate,
            Some(Predicate::IsNull { negated: true, .. })
        ));

        let result = compiler.compile(&Query::new("item").with_criteria(Criteria::compare(
            "name",
            CompareOp::Lt,
            Literal::Null,
        )));
        assert_eq!(code(result), CompileErrorCode::InvalidArgument);
    }

    #[test]
    fn test_multirow_defers_pagination() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);

        let flat = compiler
            .compile(&Query::new("item").with_limit(5).with_skip(2))
            .unwrap();
        assert_eq!(flat.pushed, Some(Pagination { skip: 2, limit: Some(5) }));
        assert_eq!(flat.deferred, None);

        let nested = compiler
            .compile(
                &Query::new("item")
                    .with_projection(Projection::reverse("tag", "item", &["label"], "tags"))
                    .with_limit(5)
                    .as_of("c1"),
            )
            .unwrap();
        assert!(nested.multirow);
        assert_eq!(nested.pushed, None);
        assert_eq!(nested.deferred, Some(Pagination { skip: 0, limit: Some(5) }));
        // Snapshot queries group by recid.
        assert_eq!(nested.columns[0].expr, ColumnExpr::base("f_recid"));
    }

    #[test]
    fn test_repeated_join_targets_share_one_join() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let plan = compiler
            .compile(
                &Query::new("item")
                    .with_projection(Projection::follow("owner"))
                    .with_projection(Projection::Follow {
                        ref_field: "owner".into(),
                        fields: vec!["name".into()],
                        alias: None,
                    })
                    .as_of("c1"),
            )
            .unwrap();
        assert_eq!(plan.joins.len(), 1);
        assert_eq!(plan.joins.aliases(), vec!["t001"]);
    }

    #[test]
    fn test_reverse_must_point_at_queried_type() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let result = compiler.compile(
            &Query::new("person").with_projection(Projection::reverse("tag", "item", &[], "tags")),
        );
        assert_eq!(code(result), CompileErrorCode::InvalidArgument);
    }

    #[test]
    fn test_match_requires_full_text_field() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);

        let result =
            compiler.compile(&Query::new("item").with_criteria(Criteria::matches("name", "x")));
        assert_eq!(code(result), CompileErrorCode::InvalidArgument);

        let plan = compiler
            .compile(&Query::new("item").with_criteria(Criteria::matches("body", "fox")))
            .unwrap();
        assert!(plan
            .columns
            .iter()
            .any(|c| c.role.output_name(0) == RELEVANCE_KEY));
    }

    #[test]
    fn test_sort_on_sub_collection_is_invalid() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let result = compiler.compile(
            &Query::new("item")
                .with_projection(Projection::reverse("tag", "item", &["label"], "tags"))
                .with_sort(SortSpec::asc("tags.label"))
                .as_of("c1"),
        );
        assert_eq!(code(result), CompileErrorCode::InvalidSort);
    }

    #[test]
    fn test_followed_field_sorts_only_in_snapshot() {
        let schema = schema(DagKind::with_recid());
        let compiler = QueryCompiler::new(&schema, 10);
        let query = Query::new("item")
            .with_projection(Projection::follow("owner"))
            .with_sort(SortSpec::asc("owner.name"));

        assert_eq!(code(compiler.compile(&query)), CompileErrorCode::InvalidSort);

        let plan = compiler.compile(&query.as_of("c1")).unwrap();
        assert_eq!(plan.order[0].expr, OrderExpr::Alias("owner.name".into()));
    }
}

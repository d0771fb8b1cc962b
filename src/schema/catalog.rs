//! Composite schema construction
//!
//! A DAG may carry records written under several templates over its history.
//! The composite schema is the union of every record type those templates
//! define, with each field's definition merged across templates.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::errors::{SchemaError, SchemaResult};
use super::types::{CompositeSchema, FieldSpec, RecordType, RECID_FIELD};
use crate::dag::{DagKind, TemplateSource};

/// Builds composite schemas from a template source
pub struct SchemaCatalog<'a, T: TemplateSource> {
    source: &'a T,
    kind: DagKind,
}

impl<'a, T: TemplateSource> SchemaCatalog<'a, T> {
    pub fn new(source: &'a T, kind: DagKind) -> Self {
        Self { source, kind }
    }

    /// Union the record types of `templates` into one schema.
    ///
    /// Record types and fields come out sorted by name. Unless the DAG is
    /// recid-less every record type gains an indexed `recid` string field.
    pub fn build_composite_schema(&self, templates: &[String]) -> SchemaResult<CompositeSchema> {
        let templates: BTreeSet<&String> = templates.iter().collect();
        if templates.is_empty() {
            return Err(SchemaError::empty_template_set());
        }

        let mut rectypes: BTreeMap<String, RecordType> = BTreeMap::new();

        for template in &templates {
            let names = self
                .source
                .list_rectypes(template)
                .map_err(|e| SchemaError::template_unavailable(template, e))?;

            for name in names {
                validate_name("record type", &name)?;
                let fields = self
                    .source
                    .fields_for_rectype(template, &name)
                    .map_err(|e| SchemaError::template_unavailable(template, e))?;

                let rectype = rectypes
                    .entry(name.clone())
                    .or_insert_with(|| RecordType::new(name.clone()));

                for (field, spec) in fields {
                    validate_name("field", &field)?;
                    merge_field(rectype, &field, spec)?;
                }
            }
        }

        if self.kind.has_recid {
            for rectype in rectypes.values_mut() {
                merge_field(rectype, RECID_FIELD, FieldSpec::string().indexed())?;
            }
        }

        debug!(
            templates = templates.len(),
            rectypes = rectypes.len(),
            "built composite schema"
        );

        Ok(CompositeSchema {
            kind: self.kind,
            templates: templates.into_iter().cloned().collect(),
            rectypes,
        })
    }
}

/// Names become table and column names, so only plain identifiers are
/// accepted. A leading underscore is reserved for internal columns.
pub fn validate_name(kind: &str, name: &str) -> SchemaResult<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic());
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SchemaError::invalid_name(kind, name))
    }
}

fn merge_field(rectype: &mut RecordType, name: &str, incoming: FieldSpec) -> SchemaResult<()> {
    let Some(existing) = rectype.fields.get_mut(name) else {
        let mut incoming = incoming;
        incoming.orderings.sort_by(|a, b| a.name.cmp(&b.name));
        rectype.fields.insert(name.to_string(), incoming);
        return Ok(());
    };

    if existing.field_type != incoming.field_type {
        return Err(SchemaError::conflicting_field(
            &rectype.name,
            name,
            format!(
                "{} vs {}",
                existing.field_type.type_name(),
                incoming.field_type.type_name()
            ),
        ));
    }
    if existing.ref_target != incoming.ref_target {
        return Err(SchemaError::conflicting_field(
            &rectype.name,
            name,
            "references different record types",
        ));
    }

    existing.indexed |= incoming.indexed;
    existing.unique |= incoming.unique;
    existing.full_text |= incoming.full_text;

    for ordering in incoming.orderings {
        match existing.orderings.iter().find(|o| o.name == ordering.name) {
            Some(known) if known.values != ordering.values => {
                return Err(SchemaError::conflicting_field(
                    &rectype.name,
                    name,
                    format!("ordering '{}' differs", ordering.name),
                ));
            }
            Some(_) => {}
            None => existing.orderings.push(ordering),
        }
    }
    existing.orderings.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(())
}

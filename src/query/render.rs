//! Plan rendering
//!
//! Turns a [`QueryPlan`] into one parameterized SELECT. Identifiers come from
//! the schema and are quoted; every value is a bound parameter, pushed in
//! the order its placeholder appears in the text.

use rusqlite::types::Value as SqlValue;

use super::plan::{
    ColumnExpr, ColumnSource, JoinKind, OrderExpr, Predicate, QueryPlan, TableSource,
};
use crate::schema::RECID_FIELD;
use crate::store::functions::RANK_FUNCTION;
use crate::store::naming::{
    field_column, fulltext_table, ordering_table, qualified, quote_ident, record_table,
    FILTER_SCHEMA, HIDREC_COLUMN, MAIN_SCHEMA, ROWID_COLUMN,
};

const BASE_ALIAS: &str = "b";

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Render the SELECT producing the plan's physical rows
pub fn render(plan: &QueryPlan) -> RenderedQuery {
    let mut r = Renderer::new(plan);

    let columns = plan
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} AS {}", r.expr(&c.expr), quote_ident(&c.role.output_name(i))))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {}", columns);
    r.from_where(&mut sql);

    if !plan.order.is_empty() {
        let terms = plan
            .order
            .iter()
            .map(|term| {
                let expr = match &term.expr {
                    OrderExpr::Column(expr) => r.expr(expr),
                    OrderExpr::Alias(alias) => quote_ident(alias),
                };
                format!("{} {}", expr, term.direction.as_str())
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms);
    }

    if let Some(page) = plan.pushed {
        sql.push_str(" LIMIT ? OFFSET ?");
        r.params.push(SqlValue::Integer(
            page.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX)),
        ));
        r.params
            .push(SqlValue::Integer(i64::try_from(page.skip).unwrap_or(i64::MAX)));
    }

    RenderedQuery {
        sql,
        params: r.params,
    }
}

/// Render a count of distinct logical records matching the plan
pub fn render_count(plan: &QueryPlan) -> RenderedQuery {
    let mut r = Renderer::new(plan);
    let key = plan
        .columns
        .first()
        .map(|c| r.expr(&c.expr))
        .unwrap_or_else(|| format!("{}.{}", BASE_ALIAS, quote_ident(ROWID_COLUMN)));

    let mut inner = format!("SELECT DISTINCT {}", key);
    r.from_where(&mut inner);

    RenderedQuery {
        sql: format!("SELECT COUNT(*) FROM ({})", inner),
        params: r.params,
    }
}

struct Renderer<'p> {
    plan: &'p QueryPlan,
    aliases: Vec<String>,
    params: Vec<SqlValue>,
}

impl<'p> Renderer<'p> {
    fn new(plan: &'p QueryPlan) -> Self {
        Self {
            plan,
            aliases: plan.joins.aliases(),
            params: Vec::new(),
        }
    }

    /// Schema holding record and full-text tables
    fn record_schema(&self) -> &'static str {
        match self.plan.source {
            TableSource::Current => MAIN_SCHEMA,
            TableSource::Snapshot => FILTER_SCHEMA,
        }
    }

    fn source_alias(&self, source: ColumnSource) -> &str {
        match source {
            ColumnSource::Base => BASE_ALIAS,
            ColumnSource::Join(handle) => &self.aliases[handle.0],
        }
    }

    fn column(&self, source: ColumnSource, column: &str) -> String {
        format!("{}.{}", self.source_alias(source), quote_ident(column))
    }

    fn base_field(&self, field: &str) -> String {
        self.column(ColumnSource::Base, &field_column(field))
    }

    fn expr(&self, expr: &ColumnExpr) -> String {
        match expr {
            ColumnExpr::Column { source, column } => self.column(*source, column),
            ColumnExpr::Relevance(handles) => {
                let sum = handles
                    .iter()
                    .map(|h| format!("COALESCE({}.relevance, 0)", self.aliases[h.0]))
                    .collect::<Vec<_>>()
                    .join(" + ");
                format!("CAST(ROUND(1000 * ({})) AS INTEGER)", sum)
            }
        }
    }

    fn from_where(&mut self, sql: &mut String) {
        let plan = self.plan;
        sql.push_str(&format!(
            " FROM {} AS {}",
            qualified(self.record_schema(), &record_table(&plan.rectype)),
            BASE_ALIAS
        ));

        for (handle, kind) in plan.joins.iter() {
            let alias = self.aliases[handle.0].clone();
            let join = self.join(&alias, kind);
            sql.push_str(" LEFT JOIN ");
            sql.push_str(&join);
        }

        if let Some(predicate) = &plan.predicate {
            let text = self.predicate(predicate);
            sql.push_str(" WHERE ");
            sql.push_str(&text);
        }
    }

    fn join(&mut self, alias: &str, kind: &JoinKind) -> String {
        let schema = self.record_schema();
        let recid = self.base_field(RECID_FIELD);

        match kind {
            JoinKind::Follow { target, ref_field } => format!(
                "{} AS {a} ON {a}.{} = {}",
                qualified(schema, &record_table(target)),
                quote_ident(&field_column(RECID_FIELD)),
                self.base_field(ref_field),
                a = alias
            ),
            JoinKind::Reverse { rectype, ref_field } => format!(
                "{} AS {a} ON {a}.{} = {}",
                qualified(schema, &record_table(rectype)),
                quote_ident(&field_column(ref_field)),
                recid,
                a = alias
            ),
            JoinKind::Junction { rectype, ref_to_me } => format!(
                "{} AS {a} ON {a}.{} = {}",
                qualified(schema, &record_table(rectype)),
                quote_ident(&field_column(ref_to_me)),
                recid,
                a = alias
            ),
            JoinKind::XrefTarget {
                junction,
                target,
                ref_to_other,
            } => format!(
                "{} AS {a} ON {a}.{} = {}.{}",
                qualified(schema, &record_table(target)),
                quote_ident(&field_column(RECID_FIELD)),
                self.aliases[junction.0],
                quote_ident(&field_column(ref_to_other)),
                a = alias
            ),
            JoinKind::Username { field } => format!(
                "{} AS {a} ON {a}.userid = {}",
                qualified(MAIN_SCHEMA, "users"),
                self.base_field(field),
                a = alias
            ),
            JoinKind::Ordering { field, ordering } => format!(
                "{} AS {a} ON {a}.value = {}",
                qualified(
                    MAIN_SCHEMA,
                    &ordering_table(&self.plan.rectype, field, ordering)
                ),
                self.base_field(field),
                a = alias
            ),
            JoinKind::FullText { field, phrase } => {
                let fts = fulltext_table(&self.plan.rectype);
                let target = match field {
                    Some(field) => quote_ident(&field_column(field)),
                    None => quote_ident(&fts),
                };
                self.params.push(SqlValue::Text(phrase.clone()));
                format!(
                    "(SELECT docid, {rank}(matchinfo({t}, 'pcx')) AS relevance FROM {src} WHERE {target} MATCH ?) AS {a} ON {a}.docid = {b}.{rowid}",
                    rank = RANK_FUNCTION,
                    t = quote_ident(&fts),
                    src = qualified(schema, &fts),
                    target = target,
                    a = alias,
                    b = BASE_ALIAS,
                    rowid = quote_ident(ROWID_COLUMN),
                )
            }
            JoinKind::HistoryVersions => format!(
                "{} AS {a} ON {a}.{} = {}",
                qualified(MAIN_SCHEMA, &record_table(&self.plan.rectype)),
                quote_ident(&field_column(RECID_FIELD)),
                recid,
                a = alias
            ),
            JoinKind::HistoryLog { versions } => {
                let version = match versions {
                    Some(h) => self.aliases[h.0].as_str(),
                    None => BASE_ALIAS,
                };
                format!(
                    "{} AS {a} ON {a}.hidrec = {}.{}",
                    qualified(MAIN_SCHEMA, "hist"),
                    version,
                    quote_ident(HIDREC_COLUMN),
                    a = alias
                )
            }
            JoinKind::HistoryChangeset { log } => format!(
                "{} AS {a} ON {a}.csid = {}.csid",
                qualified(MAIN_SCHEMA, "csets"),
                self.aliases[log.0],
                a = alias
            ),
            JoinKind::HistoryAudit { log } => format!(
                "{} AS {a} ON {a}.csid = {}.csid",
                qualified(MAIN_SCHEMA, "audits"),
                self.aliases[log.0],
                a = alias
            ),
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Compare { expr, op, value } => {
                self.params.push(value.clone());
                format!("{} {} ?", self.expr(expr), op.sql())
            }
            Predicate::IsNull { expr, negated } => {
                let not = if *negated { " NOT" } else { "" };
                format!("{} IS{} NULL", self.expr(expr), not)
            }
            Predicate::InList { expr, values } => {
                if values.is_empty() {
                    return "0".to_string();
                }
                self.params.extend(values.iter().cloned());
                let marks = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", self.expr(expr), marks)
            }
            Predicate::InTempSet { expr, set } => format!(
                "EXISTS (SELECT 1 FROM {} AS s WHERE s.v = {})",
                qualified("temp", &self.plan.temp_sets[*set].name),
                self.expr(expr)
            ),
            Predicate::FullText(handle) => {
                format!("{}.docid IS NOT NULL", self.aliases[handle.0])
            }
            Predicate::And(left, right) => {
                let l = self.predicate(left);
                let r = self.predicate(right);
                format!("({} AND {})", l, r)
            }
            Predicate::Or(left, right) => {
                let l = self.predicate(left);
                let r = self.predicate(right);
                format!("({} OR {})", l, r)
            }
        }
    }
}

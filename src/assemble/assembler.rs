//! Row regrouping
//!
//! Rows arrive ordered by grouping key, so a change of key closes the
//! current record. Within one record:
//! - scalar columns are written once; repeats are ignored
//! - history columns accumulate per changeset id, audits de-duplicated
//! - sub-collection columns accumulate per item key, in first-seen order

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use super::record::{HistoryEntry, Record};
use crate::dag::Audit;
use crate::query::{ColumnRole, HistoryField, Pagination};

/// Regroups a physical row stream into logical records
pub struct Assembler {
    roles: Vec<ColumnRole>,
    pagination: Option<Pagination>,
    current: Option<Group>,
    skipped: u64,
    records: Vec<Record>,
    done: bool,
}

struct Group {
    record: Record,
    history: BTreeMap<String, HistoryAcc>,
    collections: Vec<(String, Collection)>,
}

struct HistoryAcc {
    hidrec: String,
    generation: u64,
    audits: BTreeMap<String, Audit>,
    value: Option<Value>,
}

#[derive(Default)]
struct Collection {
    items: Vec<Map<String, Value>>,
    index: HashMap<String, usize>,
}

/// Per-row scratch for the history columns
#[derive(Default)]
struct HistoryRow {
    csid: Option<String>,
    hidrec: Option<String>,
    generation: Option<u64>,
    user: Option<String>,
    time: Option<i64>,
    value: Option<Value>,
}

impl Assembler {
    /// `pagination` is the deferred pagination of the plan, if any
    pub fn new(roles: Vec<ColumnRole>, pagination: Option<Pagination>) -> Self {
        Self {
            roles,
            pagination,
            current: None,
            skipped: 0,
            records: Vec::new(),
            done: false,
        }
    }

    /// True once the deferred limit is reached; further rows are ignored
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one physical row; values are in column order
    pub fn push(&mut self, row: Vec<Value>) {
        if self.done {
            return;
        }
        let mut values = row.into_iter();
        let Some(key) = values.next() else {
            return;
        };

        if self
            .current
            .as_ref()
            .is_some_and(|group| group.record.key != key)
        {
            self.close();
            if self.done {
                return;
            }
        }
        if self.current.is_none() {
            self.current = Some(self.open(key));
        }
        let Some(group) = self.current.as_mut() else {
            return;
        };

        let mut history = HistoryRow::default();
        let mut items: HashMap<&str, (Option<String>, Map<String, Value>)> = HashMap::new();

        for (role, value) in self.roles.iter().skip(1).zip(values) {
            match role {
                ColumnRole::GroupKey => {}
                ColumnRole::Scalar { name, nested: None } => {
                    group.record.fields.entry(name.clone()).or_insert(value);
                }
                ColumnRole::Scalar {
                    name,
                    nested: Some(parent),
                } => {
                    let slot = group
                        .record
                        .fields
                        .entry(parent.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(object) = slot {
                        object.entry(name.clone()).or_insert(value);
                    }
                }
                ColumnRole::History(field) => history.set(*field, value),
                ColumnRole::SubCollectionKey { collection } => {
                    let key = (!value.is_null()).then(|| value.to_string());
                    items.entry(collection.as_str()).or_default().0 = key;
                }
                ColumnRole::SubCollection { collection, field } => {
                    items
                        .entry(collection.as_str())
                        .or_default()
                        .1
                        .insert(field.clone(), value);
                }
            }
        }

        group.add_history(history);
        for (name, (key, fields)) in items {
            if let Some(key) = key {
                group.add_item(name, key, fields);
            }
        }
    }

    /// Close the last record and return every emitted record
    pub fn finish(mut self) -> Vec<Record> {
        if !self.done {
            self.close();
        }
        self.records
    }

    fn open(&self, key: Value) -> Group {
        let mut collections: Vec<(String, Collection)> = Vec::new();
        for role in &self.roles {
            if let ColumnRole::SubCollectionKey { collection } = role {
                if !collections.iter().any(|(name, _)| name == collection) {
                    collections.push((collection.clone(), Collection::default()));
                }
            }
        }
        Group {
            record: Record::new(key),
            history: BTreeMap::new(),
            collections,
        }
    }

    fn close(&mut self) {
        let Some(group) = self.current.take() else {
            return;
        };
        let record = group.into_record();

        let Some(page) = self.pagination else {
            self.records.push(record);
            return;
        };
        if self.skipped < page.skip {
            self.skipped += 1;
            return;
        }
        self.records.push(record);
        if page
            .limit
            .is_some_and(|limit| self.records.len() as u64 >= limit)
        {
            self.done = true;
        }
    }
}

impl HistoryRow {
    fn set(&mut self, field: HistoryField, value: Value) {
        match field {
            HistoryField::Changeset => self.csid = value.as_str().map(str::to_string),
            HistoryField::ContentHash => self.hidrec = value.as_str().map(str::to_string),
            HistoryField::Generation => self.generation = value.as_u64(),
            HistoryField::AuditUser => self.user = value.as_str().map(str::to_string),
            HistoryField::AuditTime => self.time = value.as_i64(),
            HistoryField::Value => self.value = Some(value),
        }
    }
}

impl Group {
    fn add_history(&mut self, row: HistoryRow) {
        let Some(csid) = row.csid else {
            return;
        };
        let entry = self.history.entry(csid).or_insert_with(|| HistoryAcc {
            hidrec: row.hidrec.unwrap_or_default(),
            generation: row.generation.unwrap_or(0),
            audits: BTreeMap::new(),
            value: row.value,
        });
        if let (Some(user), Some(time)) = (row.user, row.time) {
            let audit = Audit::new(user, time);
            entry.audits.entry(audit.dedup_key()).or_insert(audit);
        }
    }

    fn add_item(&mut self, collection: &str, key: String, fields: Map<String, Value>) {
        let Some((_, target)) = self.collections.iter_mut().find(|(name, _)| name == collection)
        else {
            return;
        };
        match target.index.get(&key) {
            Some(&i) => {
                for (field, value) in fields {
                    target.items[i].entry(field).or_insert(value);
                }
            }
            None => {
                target.index.insert(key, target.items.len());
                target.items.push(fields);
            }
        }
    }

    fn into_record(self) -> Record {
        let mut record = self.record;

        for (name, collection) in self.collections {
            let items = collection.items.into_iter().map(Value::Object).collect();
            record.fields.insert(name, Value::Array(items));
        }

        let mut history: Vec<HistoryEntry> = self
            .history
            .into_iter()
            .map(|(csid, acc)| HistoryEntry {
                csid,
                hidrec: acc.hidrec,
                generation: acc.generation,
                audits: acc.audits.into_values().collect(),
                value: acc.value,
            })
            .collect();
        history.sort_by(|a, b| {
            b.generation
                .cmp(&a.generation)
                .then_with(|| a.csid.cmp(&b.csid))
        });
        record.history = history;
        record
    }
}

// src/flatten/mod.rs
//! Recursive flattener: nested graph responses to relational rows.
//!
//! This is the convergence point of the pipeline. Every fetched body,
//! whatever produced it, passes through `FlattenContext::flatten`, which
//! walks the object tree and emits rows into tables named after the
//! query and the nested-field path. The walk is pure: given the same
//! document it produces the same rows and the same schemas.
//!
//! Shape rules, applied per field of each object:
//! - scalars become columns on the current row
//! - `{data: [...]}` connections recurse into a child table, with
//!   `parent_id` linking back to the enclosing object's `id`
//! - a `summary` carried by a connection becomes its own single-row
//!   side table instead of merging into the parent row
//! - a `values` array fans out one row per metric sample; object-valued
//!   samples expand their dimension keys into `key1`/`key2`
//! - action-breakdown arrays fan out into `_insights` tables
//! - designated list-valued metadata is stored as JSON text
//! - anything else nested flattens positionally into `field_i_subfield`
//!   columns

pub mod tables;

pub use tables::{FinalTable, Row, TableSet};

use serde_json::{Map, Value};

use crate::config::{QueryRow, QueryType};
use crate::policy::{ExtractionPolicy, ACTION_BREAKDOWN_EXTRA_COLUMNS, ACTION_COMMON_COLUMNS};

/// Whether the query asked the remote service to break actions down by a
/// dimension. In that mode action rows become the main rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionBreakdown {
    None,
    ActionType,
    ActionReaction,
}

impl ActionBreakdown {
    fn from_parameters(parameters: Option<&str>) -> Self {
        let Some(params) = parameters else {
            return Self::None;
        };
        if params.contains("action_breakdowns=action_reaction") {
            Self::ActionReaction
        } else if params.contains("action_breakdowns=action_type") {
            Self::ActionType
        } else {
            Self::None
        }
    }

    fn is_active(self) -> bool {
        self != Self::None
    }
}

/// Per-query flattening context: naming inputs and policy tables.
pub struct FlattenContext<'a> {
    account_id: &'a str,
    query_name: &'a str,
    query_path: &'a str,
    is_async: bool,
    insights_fields: bool,
    breakdown: ActionBreakdown,
    policy: &'a ExtractionPolicy,
}

impl<'a> FlattenContext<'a> {
    pub fn new(row: &'a QueryRow, account_id: &'a str, policy: &'a ExtractionPolicy) -> Self {
        Self {
            account_id,
            query_name: &row.name,
            query_path: &row.query.path,
            is_async: row.query_type == QueryType::AsyncInsights,
            insights_fields: row.query.is_insights_fields(),
            breakdown: ActionBreakdown::from_parameters(row.query.parameters.as_deref()),
            policy,
        }
    }

    /// Root table name: query name extended by the endpoint path, with an
    /// `_insights` suffix for async jobs.
    pub fn root_table(&self) -> String {
        let base = extend_name(self.query_name, self.query_path.trim());
        if self.is_async {
            with_insights_suffix(&base)
        } else {
            base
        }
    }

    /// Flattens one fetched body into rows. `graph_node` is the dotted
    /// hierarchy position of the body's root.
    pub fn flatten(&self, body: &Value, graph_node: &str) -> TableSet {
        let mut out = TableSet::new();
        self.flatten_into(body, graph_node, None, &self.root_table(), &mut out);
        out
    }

    /// Recursive entry: extracts the data array (or treats a bare object
    /// with an `id` as a one-element array) and processes each element.
    ///
    /// A bare object without an `id` and without a `data` wrapper yields
    /// nothing: such a body has no addressable row identity, so there is
    /// no way to key it or to parent children under it.
    fn flatten_into(
        &self,
        body: &Value,
        graph_node: &str,
        parent_id: Option<&str>,
        table: &str,
        out: &mut TableSet,
    ) {
        let unwrapped = body.get("insights").unwrap_or(body);
        if let Some(data) = unwrapped.get("data").and_then(Value::as_array) {
            for element in data {
                if let Some(obj) = element.as_object() {
                    self.process_object(obj, graph_node, parent_id, table, out);
                }
            }
        } else if let Some(obj) = body.as_object() {
            if obj.contains_key("id") {
                self.process_object(obj, graph_node, parent_id, table, out);
            }
        }
    }

    fn process_object(
        &self,
        obj: &Map<String, Value>,
        graph_node: &str,
        parent_id: Option<&str>,
        table: &str,
        out: &mut TableSet,
    ) {
        let fields = self.classify_fields(obj);

        let mut base = Row::new();
        base.insert("ex_account_id".to_string(), Value::from(self.account_id));
        base.insert("fb_graph_node".to_string(), Value::from(graph_node));
        if let Some(parent) = parent_id {
            base.insert("parent_id".to_string(), Value::from(parent));
        }
        let mut main_row = base.clone();
        for (key, value) in &fields.scalar {
            main_row.insert(key.clone(), value.clone());
        }

        // In breakdown mode the action rows replace the main row.
        let suppress_main = self.breakdown.is_active() && !fields.actions.is_empty();
        if !suppress_main {
            if let Some(values) = &fields.values {
                self.emit_value_rows(&main_row, values, table, out);
            } else if has_payload(&main_row) || !fields.nested.is_empty() || !fields.actions.is_empty()
            {
                out.push(table, main_row.clone());
            }
        }

        self.emit_action_rows(&fields.actions, obj, graph_node, out);

        let own_id = obj.get("id").map(scalar_text);
        for (field, connection) in &fields.nested {
            let child_node = format!("{graph_node}_{field}");
            let child_table = extend_name(table, field);
            self.flatten_into(
                connection,
                &child_node,
                own_id.as_deref(),
                &child_table,
                out,
            );
        }
    }

    /// Sorts an object's fields into scalar columns, child connections,
    /// action-stats arrays, and an optional metric series.
    fn classify_fields(&self, obj: &Map<String, Value>) -> ClassifiedFields {
        let mut fields = ClassifiedFields::default();
        for (key, value) in obj {
            if key == "values" {
                if let Some(series) = value.as_array() {
                    fields.values = Some(series.clone());
                    continue;
                }
            }
            if value.is_object() && value.get("data").is_some() {
                fields.nested.push((key.clone(), value.clone()));
                if let Some(summary) = value.get("summary") {
                    fields.nested.push((
                        format!("{key}_summary"),
                        serde_json::json!({ "data": [summary] }),
                    ));
                }
            } else if value.is_object() && value.get("summary").is_some() {
                let summary = &value["summary"];
                fields.nested.push((
                    format!("{key}_summary"),
                    serde_json::json!({ "data": [summary] }),
                ));
            } else if self.policy.is_action_stats_field(key) && value.is_array() {
                let actions = value.as_array().cloned().unwrap_or_default();
                fields.actions.push((key.clone(), actions));
            } else if self.policy.is_serialized_list_field(key) {
                fields
                    .scalar
                    .push((key.clone(), Value::from(value.to_string())));
            } else if value.is_object() || value.is_array() {
                flatten_positional(key, value, &mut fields.scalar);
            } else {
                fields.scalar.push((key.clone(), value.clone()));
            }
        }
        fields
    }

    /// One row per metric sample. Samples without a usable value are
    /// dropped; object-valued samples expand per dimension key.
    fn emit_value_rows(&self, base: &Row, values: &[Value], table: &str, out: &mut TableSet) {
        let table = with_insights_suffix(table);
        for sample in values {
            let Some(entry) = sample.as_object() else {
                continue;
            };
            let end_time = entry.get("end_time").cloned();
            match entry.get("value") {
                Some(Value::Object(dimensions)) => {
                    for (key1, inner) in dimensions {
                        match inner {
                            Value::Object(second) => {
                                for (key2, leaf) in second {
                                    if is_usable_value(leaf) {
                                        out.push(
                                            &table,
                                            self.value_row(base, key1, key2, leaf, &end_time),
                                        );
                                    }
                                }
                            }
                            leaf if is_usable_value(leaf) => {
                                out.push(&table, self.value_row(base, key1, "", leaf, &end_time));
                            }
                            _ => {}
                        }
                    }
                }
                Some(leaf) if is_usable_value(leaf) => {
                    out.push(&table, self.value_row(base, "", "", leaf, &end_time));
                }
                _ => {}
            }
        }
    }

    fn value_row(
        &self,
        base: &Row,
        key1: &str,
        key2: &str,
        value: &Value,
        end_time: &Option<Value>,
    ) -> Row {
        let mut row = base.clone();
        row.insert("key1".to_string(), Value::from(key1));
        row.insert("key2".to_string(), Value::from(key2));
        row.insert("value".to_string(), value.clone());
        match end_time {
            Some(t) => {
                row.insert("end_time".to_string(), t.clone());
            }
            // Metric series always carry the column so schemas stay
            // stable across samples; other sources omit it.
            None if self.insights_fields => {
                row.insert("end_time".to_string(), Value::Null);
            }
            None => {}
        }
        row
    }

    fn emit_action_rows(
        &self,
        actions: &[(String, Vec<Value>)],
        obj: &Map<String, Value>,
        graph_node: &str,
        out: &mut TableSet,
    ) {
        for (field, entries) in actions {
            let table = if self.breakdown.is_active() {
                self.root_table()
            } else {
                self.action_stats_table(field)
            };

            let mut base = Row::new();
            base.insert("ex_account_id".to_string(), Value::from(self.account_id));
            base.insert("fb_graph_node".to_string(), Value::from(graph_node));
            base.insert("parent_id".to_string(), Value::from(self.account_id));
            for column in ACTION_COMMON_COLUMNS {
                if let Some(value) = obj.get(*column) {
                    base.insert(column.to_string(), value.clone());
                }
            }
            if self.breakdown.is_active() {
                for column in ACTION_BREAKDOWN_EXTRA_COLUMNS {
                    if let Some(value) = obj.get(*column) {
                        base.insert(column.to_string(), value.clone());
                    }
                }
            }

            for entry in entries {
                let Some(action) = entry.as_object() else {
                    continue;
                };
                let mut row = base.clone();
                row.insert("ads_action_name".to_string(), Value::from(field.as_str()));
                row.insert(
                    "action_type".to_string(),
                    Value::from(normalize_action_type(action)),
                );
                row.insert(
                    "value".to_string(),
                    action.get("value").cloned().unwrap_or(Value::from("")),
                );
                if self.breakdown == ActionBreakdown::ActionReaction {
                    let reaction = action
                        .get("action_reaction")
                        .or_else(|| obj.get("action_reaction"))
                        .cloned()
                        .unwrap_or(Value::from(""));
                    row.insert("action_reaction".to_string(), reaction);
                }
                for (key, value) in action {
                    if !matches!(key.as_str(), "action_type" | "value" | "action_reaction") {
                        row.insert(key.clone(), value.clone());
                    }
                }
                out.push(&table, row);
            }
        }
    }

    /// `{query}_{field}_insights`, collapsing a repeated field suffix.
    fn action_stats_table(&self, field: &str) -> String {
        if self.query_name.ends_with(&format!("_{field}")) {
            format!("{}_insights", self.query_name)
        } else {
            format!("{}_{field}_insights", self.query_name)
        }
    }
}

#[derive(Debug, Default)]
struct ClassifiedFields {
    scalar: Vec<(String, Value)>,
    nested: Vec<(String, Value)>,
    actions: Vec<(String, Vec<Value>)>,
    values: Option<Vec<Value>>,
}

/// Appends a path component to a table name unless the name already ends
/// with it.
fn extend_name(base: &str, component: &str) -> String {
    if component.is_empty() || base == component || base.ends_with(&format!("_{component}")) {
        base.to_string()
    } else {
        format!("{base}_{component}")
    }
}

fn with_insights_suffix(name: &str) -> String {
    if name.ends_with("_insights") {
        name.to_string()
    } else {
        format!("{name}_insights")
    }
}

/// `post_save` is reported under the historical `post_reaction` name;
/// dotted prefixes are stripped to the final segment.
fn normalize_action_type(action: &Map<String, Value>) -> String {
    let raw = action
        .get("action_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    let last = raw.rsplit('.').next().unwrap_or(raw);
    if last == "post_save" {
        "post_reaction".to_string()
    } else {
        last.to_string()
    }
}

/// Arrays and plain objects flatten into positional column names:
/// element `i`'s subfield `f` becomes `{key}_{i}_{f}`.
fn flatten_positional(key: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (sub, inner) in map {
                flatten_positional(&format!("{key}_{sub}"), inner, out);
            }
        }
        Value::Array(items) => {
            for (index, inner) in items.iter().enumerate() {
                flatten_positional(&format!("{key}_{index}"), inner, out);
            }
        }
        other => out.push((key.to_string(), other.clone())),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_usable_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// A row carries payload when any column beyond the standard metadata
/// holds a non-empty value.
fn has_payload(row: &Row) -> bool {
    row.iter().any(|(key, value)| {
        !matches!(key.as_str(), "id" | "parent_id" | "ex_account_id" | "fb_graph_node")
            && is_usable_value(value)
    })
}

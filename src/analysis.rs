//! Static read/write table extraction.
//!
//! [`analyze`] parses SQL with the SQLite dialect of `sqlparser` and reports which real tables
//! a statement (or script) reads and which it mutates. Names are lower-cased; aliases never
//! show up because only relation names are collected; CTE names are removed from both sets.
//!
//! This is the admission check for reactive subscriptions. Whether a mutation really touched
//! a table is decided by the engine's change hook instead: SQLite's truncate optimization
//! runs an unconditional `DELETE FROM t` without per-row notifications, so `analyze` reports
//! `t` as mutated while the engine reports nothing.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{
    FromTable, ObjectName, ObjectType, Query, SetExpr, Statement as SqlStatement, TableFactor,
    Visit, Visitor, visit_relations,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::error::SqlocalError;

/// Tables read and mutated by a piece of SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEffects {
    pub read_tables: BTreeSet<String>,
    pub mutated_tables: BTreeSet<String>,
    read_only: bool,
}

impl QueryEffects {
    /// `true` when every statement is a plain query.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the read set is non-empty and disjoint from the mutated set.
    #[must_use]
    pub fn is_reactive_safe(&self) -> bool {
        !self.read_tables.is_empty() && self.read_tables.is_disjoint(&self.mutated_tables)
    }
}

impl Default for QueryEffects {
    fn default() -> Self {
        QueryEffects {
            read_tables: BTreeSet::new(),
            mutated_tables: BTreeSet::new(),
            read_only: true,
        }
    }
}

/// Determine the tables read and mutated by `sql`.
///
/// # Errors
/// Returns [`SqlocalError::ParseError`] if `sql` is not valid SQLite SQL.
pub fn analyze(sql: &str) -> Result<QueryEffects, SqlocalError> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
    let mut effects = QueryEffects::default();
    let mut cte_names = BTreeSet::new();

    for statement in &statements {
        let _ = statement.visit(&mut CteNames(&mut cte_names));
        analyze_statement(statement, &mut effects);
    }

    effects.read_tables.retain(|table| !cte_names.contains(table));
    effects.mutated_tables.retain(|table| !cte_names.contains(table));
    Ok(effects)
}

fn analyze_statement(statement: &SqlStatement, effects: &mut QueryEffects) {
    match statement {
        SqlStatement::Query(query) => analyze_query(query, effects),
        SqlStatement::Insert(insert) => {
            effects.read_only = false;
            if let Some(target) = table_name(&insert.table_name) {
                effects.mutated_tables.insert(target);
            }
            if let Some(source) = &insert.source {
                collect_relations(source, &mut effects.read_tables);
            }
        }
        SqlStatement::Update { table, .. } => {
            effects.read_only = false;
            let targets: Vec<String> = target_of(&table.relation).into_iter().collect();
            split_targets(statement, targets, effects);
        }
        SqlStatement::Delete(delete) => {
            effects.read_only = false;
            let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) = &delete.from;
            let targets: Vec<String> = from
                .iter()
                .filter_map(|table| target_of(&table.relation))
                .collect();
            split_targets(statement, targets, effects);
        }
        SqlStatement::CreateTable(create) => {
            effects.read_only = false;
            if let Some(target) = table_name(&create.name) {
                effects.mutated_tables.insert(target);
            }
            if let Some(query) = &create.query {
                collect_relations(query, &mut effects.read_tables);
            }
        }
        SqlStatement::CreateIndex(index) => {
            effects.read_only = false;
            if let Some(target) = table_name(&index.table_name) {
                effects.mutated_tables.insert(target);
            }
        }
        SqlStatement::AlterTable { name, .. } => {
            effects.read_only = false;
            if let Some(target) = table_name(name) {
                effects.mutated_tables.insert(target);
            }
        }
        SqlStatement::Drop {
            object_type, names, ..
        } => {
            effects.read_only = false;
            if *object_type == ObjectType::Table {
                effects
                    .mutated_tables
                    .extend(names.iter().filter_map(table_name));
            }
        }
        _ => effects.read_only = false,
    }
}

fn analyze_query(query: &Query, effects: &mut QueryEffects) {
    match query.body.as_ref() {
        // `WITH ... INSERT/UPDATE`: the CTE bodies are reads, the inner statement decides the rest.
        SetExpr::Insert(inner) | SetExpr::Update(inner) => {
            if let Some(with) = &query.with {
                for cte in &with.cte_tables {
                    collect_relations(&cte.query, &mut effects.read_tables);
                }
            }
            analyze_statement(inner, effects);
        }
        _ => collect_relations(query, &mut effects.read_tables),
    }
}

/// Every relation in `statement` is a read except one occurrence per mutation target.
fn split_targets(statement: &SqlStatement, targets: Vec<String>, effects: &mut QueryEffects) {
    let mut relations = relation_list(statement);
    for target in targets {
        if let Some(pos) = relations.iter().position(|name| *name == target) {
            relations.remove(pos);
        }
        effects.mutated_tables.insert(target);
    }
    effects.read_tables.extend(relations);
}

fn relation_list<V: Visit>(node: &V) -> Vec<String> {
    let mut names = Vec::new();
    let _ = visit_relations(node, |relation| {
        if let Some(name) = table_name(relation) {
            names.push(name);
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

fn collect_relations<V: Visit>(node: &V, out: &mut BTreeSet<String>) {
    out.extend(relation_list(node));
}

fn target_of(factor: &TableFactor) -> Option<String> {
    match factor {
        TableFactor::Table { name, .. } => table_name(name),
        _ => None,
    }
}

// Schema qualifiers (`main.t`) are dropped.
fn table_name(name: &ObjectName) -> Option<String> {
    name.0.last().map(|ident| ident.value.to_lowercase())
}

struct CteNames<'a>(&'a mut BTreeSet<String>);

impl Visitor for CteNames<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.0.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn single_table_select_reads_literal_name() {
        let effects = analyze("SELECT g.name FROM groceries AS g WHERE g.id = ?").unwrap();
        assert_eq!(effects.read_tables, set(&["groceries"]));
        assert!(effects.mutated_tables.is_empty());
        assert!(effects.is_read_only());
    }

    #[test]
    fn names_are_lower_cased_and_unquoted() {
        let effects = analyze("SELECT * FROM \"Todo Items\" JOIN Users ON 1 = 1").unwrap();
        assert_eq!(effects.read_tables, set(&["todo items", "users"]));
    }

    #[test]
    fn joins_and_subqueries_are_reads() {
        let effects = analyze(
            "SELECT a.x FROM a JOIN b AS bb ON a.id = bb.id \
             WHERE a.y IN (SELECT y FROM c) AND EXISTS (SELECT 1 FROM d WHERE d.z = a.z)",
        )
        .unwrap();
        assert_eq!(effects.read_tables, set(&["a", "b", "c", "d"]));
        assert!(!effects.read_tables.contains("bb"));
    }

    #[test]
    fn cte_names_are_excluded() {
        let effects = analyze(
            "WITH recent AS (SELECT * FROM orders WHERE placed > :since) \
             SELECT * FROM recent JOIN customers c ON c.id = recent.customer_id",
        )
        .unwrap();
        assert_eq!(effects.read_tables, set(&["customers", "orders"]));
    }

    #[test]
    fn cte_feeding_an_insert_is_excluded_from_both_sets() {
        let effects =
            analyze("WITH src AS (SELECT id FROM staging) INSERT INTO archive SELECT id FROM src")
                .unwrap();
        assert_eq!(effects.read_tables, set(&["staging"]));
        assert_eq!(effects.mutated_tables, set(&["archive"]));
        assert!(!effects.is_read_only());
    }

    #[test]
    fn insert_select_reads_source_and_mutates_target() {
        let effects = analyze("INSERT INTO archive (id) SELECT id FROM todos WHERE done = 1").unwrap();
        assert_eq!(effects.read_tables, set(&["todos"]));
        assert_eq!(effects.mutated_tables, set(&["archive"]));
    }

    #[test]
    fn update_reading_its_own_table() {
        let effects = analyze("UPDATE t SET x = (SELECT max(x) FROM t) WHERE id = 1").unwrap();
        assert_eq!(effects.read_tables, set(&["t"]));
        assert_eq!(effects.mutated_tables, set(&["t"]));
        assert!(!effects.is_reactive_safe());
    }

    #[test]
    fn plain_update_and_delete_only_mutate() {
        let update = analyze("UPDATE groceries SET name = 'x'").unwrap();
        assert!(update.read_tables.is_empty());
        assert_eq!(update.mutated_tables, set(&["groceries"]));

        let delete = analyze("DELETE FROM todos WHERE id IN (SELECT todo_id FROM trash)").unwrap();
        assert_eq!(delete.read_tables, set(&["trash"]));
        assert_eq!(delete.mutated_tables, set(&["todos"]));
    }

    #[test]
    fn unconditional_delete_is_reported_statically() {
        let effects = analyze("DELETE FROM todos").unwrap();
        assert_eq!(effects.mutated_tables, set(&["todos"]));
    }

    #[test]
    fn scripts_union_every_statement() {
        let effects = analyze(
            "CREATE TABLE a (x INTEGER); INSERT INTO a VALUES (1); SELECT * FROM b; DROP TABLE c",
        )
        .unwrap();
        assert_eq!(effects.mutated_tables, set(&["a", "c"]));
        assert_eq!(effects.read_tables, set(&["b"]));
    }

    #[test]
    fn reactive_safety_requires_reads() {
        assert!(!analyze("SELECT 1").unwrap().is_reactive_safe());
        assert!(analyze("SELECT * FROM todos").unwrap().is_reactive_safe());
    }

    #[test]
    fn invalid_sql_is_a_parse_error() {
        let err = analyze("SELEC * FROM").unwrap_err();
        assert!(matches!(err, SqlocalError::ParseError(_)));
    }
}

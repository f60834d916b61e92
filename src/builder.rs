//! Builder mixin (C6's external collaborator): the minimal SQL-composition surface
//! [`crate::query::Query`] delegates to.
//!
//! The surface syntax for composing WHERE/JOIN/ORDER clauses stays out of this crate's scope;
//! what's specified here is only the seam Query needs. [`SqlBuilder`] is a small reference
//! implementation good enough to exercise that seam — a host application wanting richer SQL
//! composition swaps it out for one of its own behind the same trait.

use mysql_async::Params;

/// Which part of a [`BuilderState`] a `reset` call clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// The projected column list.
    Fields,
    /// The `WHERE` clause list.
    Where,
    /// The `ORDER BY` clause.
    Order,
    /// The `GROUP BY` clause.
    Group,
    /// `LIMIT`/`OFFSET`.
    Limit,
    /// Every section.
    All,
}

/// All the mutable state a fluent query builder accumulates between `compile()` calls.
///
/// Plain, `Clone`-able data so it can be snapshotted wholesale (the **stash** in the
/// pagination algorithm) and restored later. Deliberately excludes the target table: that's
/// fixed for the lifetime of a [`crate::query::Query`], not something any task ever mutates,
/// so it's carried as a plain field on `Query` instead of duplicated into every task's state.
#[derive(Debug, Clone, Default)]
pub struct BuilderState {
    /// Projected columns, e.g. `["id", "name"]`. Empty means `*`.
    pub fields: Vec<String>,
    /// Raw `WHERE` predicates, ANDed together.
    pub wheres: Vec<String>,
    /// Raw `ORDER BY` expression, if any.
    pub order: Option<String>,
    /// Raw `GROUP BY` expression, if any.
    pub group: Option<String>,
    /// `LIMIT`, if any.
    pub limit: Option<u64>,
    /// `OFFSET`, if any.
    pub offset: Option<u64>,
}

impl BuilderState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear `section`, leaving everything else untouched.
    pub fn reset(&mut self, section: Section) {
        match section {
            Section::Fields => self.fields.clear(),
            Section::Where => self.wheres.clear(),
            Section::Order => self.order = None,
            Section::Group => self.group = None,
            Section::Limit => {
                self.limit = None;
                self.offset = None;
            }
            Section::All => *self = BuilderState::default(),
        }
    }
}

/// SQL-composition seam consumed by [`crate::query::Query`].
///
/// `compile`/`raw_sql` take an explicit `&BuilderState` rather than holding state themselves:
/// the per-task container requirement is satisfied by `Query` keeping its
/// `BuilderState` in a [`crate::task_context::TaskContext`], so implementors of this trait can
/// stay plain and stateless.
pub trait Builder: Send + Sync + 'static {
    /// Compile `table` and `state` into a final `(sql, params)` pair ready for
    /// [`crate::connector::Connector::query`].
    fn compile(&self, table: &str, state: &BuilderState) -> (String, Params);

    /// Merge a caller-supplied `(sql, params)` pair with whatever rewriting this builder
    /// performs before handing statements to the driver (e.g. placeholder translation).
    /// [`SqlBuilder`] passes both through unchanged.
    fn prepare_sql(&self, sql: &str, params: Params) -> (String, Params) {
        (sql.to_string(), params)
    }

    /// Render `table`/`state` as standalone SQL text, ignoring bound parameters — useful for
    /// logging.
    fn raw_sql(&self, table: &str, state: &BuilderState) -> String {
        self.compile(table, state).0
    }
}

/// A small reference [`Builder`] composing `SELECT`s from a [`BuilderState`] with no JOIN or
/// subquery support. Table/column identifiers are trusted verbatim (as the out-of-scope
/// external builder's surface syntax would be) — this crate's seam is where predicates enter
/// as opaque strings, not where they're parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlBuilder;

impl Builder for SqlBuilder {
    fn compile(&self, table: &str, state: &BuilderState) -> (String, Params) {
        let fields = if state.fields.is_empty() {
            "*".to_string()
        } else {
            state.fields.join(", ")
        };

        let mut sql = format!("SELECT {fields} FROM {table}");

        if !state.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&state.wheres.join(" AND "));
        }
        if let Some(group) = &state.group {
            sql.push_str(" GROUP BY ");
            sql.push_str(group);
        }
        if let Some(order) = &state.order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some(limit) = state.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = state.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        (sql, Params::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_minimal_select() {
        let state = BuilderState::new();
        let (sql, _) = SqlBuilder.compile("users", &state);
        assert_eq!(sql, "SELECT * FROM users");
    }

    #[test]
    fn compiles_full_clause_set() {
        let mut state = BuilderState::new();
        state.fields = vec!["id".to_string(), "name".to_string()];
        state.wheres = vec!["age > 18".to_string(), "active = 1".to_string()];
        state.group = Some("country".to_string());
        state.order = Some("id DESC".to_string());
        state.limit = Some(10);
        state.offset = Some(20);

        let (sql, _) = SqlBuilder.compile("users", &state);
        assert_eq!(
            sql,
            "SELECT id, name FROM users WHERE age > 18 AND active = 1 GROUP BY country ORDER BY id DESC LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn reset_all_clears_everything() {
        let mut state = BuilderState::new();
        state.fields = vec!["id".to_string()];
        state.limit = Some(5);
        state.reset(Section::All);
        assert!(state.fields.is_empty());
        assert_eq!(state.limit, None);
    }
}

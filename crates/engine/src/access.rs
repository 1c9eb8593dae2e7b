//! Query access path selection.
//!
//! Given conjunctive column predicates and an output column list, the
//! selector picks the cheapest way to read a table: a clustered index scan,
//! a covering index scan (no heap access), an index lookup followed by heap
//! fetches, or a full heap scan. Sargable predicates are turned into key
//! ranges on the longest matching key-column prefix of each index.

use std::cmp::Ordering;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::index::{IndexKey, IndexPayload, IndexRange, KeyComponent};
use crate::row::{Row, Value};
use crate::table::{LiveIndex, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// One conjunct of a WHERE clause: `column op value`.
#[derive(Debug, Clone)]
pub struct ColumnPredicate {
    pub column: String,
    pub op: PredicateOp,
    pub value: Value,
}

impl ColumnPredicate {
    pub fn new(column: impl Into<String>, op: PredicateOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }
}

/// The chosen way to read a table.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    /// Range scan over the clustered index; rows come from its leaves.
    ClusteredScan { index: String, range: IndexRange },
    /// Range scan over an index whose entries carry every needed column.
    CoveringScan { index: String, range: IndexRange },
    /// Range scan over an index followed by heap lookups per match.
    IndexLookup { index: String, range: IndexRange },
    /// Sequential scan of the heap.
    FullScan,
}

impl AccessPath {
    pub fn index_name(&self) -> Option<&str> {
        match self {
            AccessPath::ClusteredScan { index, .. }
            | AccessPath::CoveringScan { index, .. }
            | AccessPath::IndexLookup { index, .. } => Some(index),
            AccessPath::FullScan => None,
        }
    }
}

struct Candidate<'a> {
    index: &'a LiveIndex,
    matched: usize,
    range: IndexRange,
}

/// Plans and runs single-table reads.
pub struct AccessPathSelector<'a> {
    table: &'a Table,
}

impl<'a> AccessPathSelector<'a> {
    pub fn new(table: &'a Table) -> Self {
        Self { table }
    }

    /// Picks an access path. Preference order: clustered scan, then the
    /// narrowest covering scan, then the index with the longest usable key
    /// prefix, then a full scan.
    pub fn select(&self, predicates: &[ColumnPredicate], output: &[String]) -> AccessPath {
        let candidates: Vec<Candidate<'_>> = self
            .table
            .indexes()
            .iter()
            .filter_map(|index| match_prefix(index, predicates))
            .collect();

        if let Some(candidate) = candidates
            .iter()
            .filter(|candidate| candidate.index.descriptor.is_clustered())
            .max_by_key(|candidate| candidate.matched)
        {
            return AccessPath::ClusteredScan {
                index: candidate.index.descriptor.name.clone(),
                range: candidate.range.clone(),
            };
        }

        // A covering candidate must serve the output columns and every
        // predicate column, so no heap access is ever needed.
        let mut needed: Vec<&String> = output.iter().collect();
        needed.extend(predicates.iter().map(|predicate| &predicate.column));
        if let Some(candidate) = candidates
            .iter()
            .filter(|candidate| {
                needed
                    .iter()
                    .all(|column| covered_column(candidate.index, column))
            })
            .max_by(|a, b| {
                a.matched.cmp(&b.matched).then(
                    b.index
                        .descriptor
                        .included_columns
                        .len()
                        .cmp(&a.index.descriptor.included_columns.len()),
                )
            })
        {
            return AccessPath::CoveringScan {
                index: candidate.index.descriptor.name.clone(),
                range: candidate.range.clone(),
            };
        }

        if let Some(candidate) = candidates.iter().max_by(|a, b| {
            a.matched.cmp(&b.matched).then(
                b.index
                    .descriptor
                    .included_columns
                    .len()
                    .cmp(&a.index.descriptor.included_columns.len()),
            )
        }) {
            return AccessPath::IndexLookup {
                index: candidate.index.descriptor.name.clone(),
                range: candidate.range.clone(),
            };
        }

        AccessPath::FullScan
    }

    /// Runs a previously selected path, returning rows projected to the
    /// output columns in order.
    pub fn execute(
        &self,
        path: &AccessPath,
        predicates: &[ColumnPredicate],
        output: &[String],
    ) -> EngineResult<Vec<Row>> {
        match path {
            AccessPath::ClusteredScan { index, range } => {
                let index = self.table.find_index(index)?;
                let mut rows = Vec::new();
                for entry in self.table.read_index_range(index, range.clone())? {
                    let IndexPayload::Row { values, .. } = entry.payload else {
                        return Err(EngineError::Corrupt(format!(
                            "clustered index {} entry without a row payload",
                            index.descriptor.name
                        )));
                    };
                    if self.row_matches(&values, predicates)? {
                        rows.push(self.project(&values, output)?);
                    }
                }
                Ok(rows)
            }
            AccessPath::CoveringScan { index, range } => {
                let index = self.table.find_index(index)?;
                let mut rows = Vec::new();
                for entry in self.table.read_index_range(index, range.clone())? {
                    let included = match &entry.payload {
                        IndexPayload::Covering { included, .. } => included.as_slice(),
                        IndexPayload::Rid(_) => &[],
                        IndexPayload::Row { .. } => {
                            return Err(EngineError::Corrupt(format!(
                                "index {} is not clustered but stores rows",
                                index.descriptor.name
                            )))
                        }
                    };
                    let lookup = |column: &str| covered_value(index, &entry.key, included, column);
                    let keep = predicates.iter().try_fold(true, |keep, predicate| {
                        let value = lookup(&predicate.column).ok_or_else(|| {
                            EngineError::Schema(format!(
                                "column {} is not covered by index {}",
                                predicate.column, index.descriptor.name
                            ))
                        })?;
                        Ok::<_, EngineError>(keep && predicate_holds(predicate, &value))
                    })?;
                    if !keep {
                        continue;
                    }
                    let row = output
                        .iter()
                        .map(|column| {
                            lookup(column).ok_or_else(|| {
                                EngineError::Schema(format!(
                                    "column {column} is not covered by index {}",
                                    index.descriptor.name
                                ))
                            })
                        })
                        .collect::<EngineResult<Row>>()?;
                    rows.push(row);
                }
                Ok(rows)
            }
            AccessPath::IndexLookup { index, range } => {
                let index = self.table.find_index(index)?;
                let mut rows = Vec::new();
                for entry in self.table.read_index_range(index, range.clone())? {
                    let rid = entry.payload.rid();
                    let Some(values) = self.table.get_row(rid)? else {
                        return Err(EngineError::Corrupt(format!(
                            "index {} points at missing row {rid:?}",
                            index.descriptor.name
                        )));
                    };
                    if self.row_matches(&values, predicates)? {
                        rows.push(self.project(&values, output)?);
                    }
                }
                Ok(rows)
            }
            AccessPath::FullScan => {
                let mut rows = Vec::new();
                for (_rid, values) in self.table.scan_rows()? {
                    if self.row_matches(&values, predicates)? {
                        rows.push(self.project(&values, output)?);
                    }
                }
                Ok(rows)
            }
        }
    }

    /// Convenience: select a path, log it and run it.
    pub fn query(
        &self,
        predicates: &[ColumnPredicate],
        output: &[String],
    ) -> EngineResult<(AccessPath, Vec<Row>)> {
        let path = self.select(predicates, output);
        debug!(table = %self.table.name(), path = ?path.index_name(), "access path selected");
        let rows = self.execute(&path, predicates, output)?;
        Ok((path, rows))
    }

    fn row_matches(&self, row: &Row, predicates: &[ColumnPredicate]) -> EngineResult<bool> {
        for predicate in predicates {
            let idx = self
                .table
                .schema()
                .column_index(&predicate.column)
                .ok_or_else(|| {
                    EngineError::Schema(format!("unknown column {}", predicate.column))
                })?;
            if !predicate_holds(predicate, &row[idx]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn project(&self, row: &Row, output: &[String]) -> EngineResult<Row> {
        output
            .iter()
            .map(|column| {
                self.table
                    .schema()
                    .column_index(column)
                    .map(|idx| row[idx].clone())
                    .ok_or_else(|| EngineError::Schema(format!("unknown column {column}")))
            })
            .collect()
    }
}

/// Longest usable key-column prefix of `index` under the predicates,
/// together with the scan range it implies. Equality predicates extend the
/// prefix; the first range predicate closes it. None when the first key
/// column is unconstrained or a predicate value cannot be turned into a
/// key component.
fn match_prefix<'a>(
    index: &'a LiveIndex,
    predicates: &[ColumnPredicate],
) -> Option<Candidate<'a>> {
    let nulls = index.btree.null_ordering();
    let mut eq: Vec<KeyComponent> = Vec::new();
    let mut matched = 0usize;
    let mut lower_extra: Option<(KeyComponent, bool)> = None;
    let mut upper_extra: Option<(KeyComponent, bool)> = None;

    for (pos, column) in index.descriptor.key_columns.iter().enumerate() {
        let key_type = index.key_types[pos];
        if let Some(predicate) = predicates
            .iter()
            .find(|predicate| &predicate.column == column && predicate.op == PredicateOp::Eq)
        {
            let component = KeyComponent::from_value(&predicate.value, key_type).ok()?;
            eq.push(component);
            matched += 1;
            continue;
        }

        let mut saw_range = false;
        for predicate in predicates
            .iter()
            .filter(|predicate| &predicate.column == column)
        {
            let component = KeyComponent::from_value(&predicate.value, key_type).ok()?;
            match predicate.op {
                PredicateOp::Eq => {}
                PredicateOp::Gt => tighten_lower(&mut lower_extra, component, false, nulls),
                PredicateOp::GtEq => tighten_lower(&mut lower_extra, component, true, nulls),
                PredicateOp::Lt => tighten_upper(&mut upper_extra, component, false, nulls),
                PredicateOp::LtEq => tighten_upper(&mut upper_extra, component, true, nulls),
            }
            saw_range = true;
        }
        if saw_range {
            matched += 1;
        }
        break;
    }

    if matched == 0 {
        return None;
    }

    let lower = match lower_extra {
        Some((component, inclusive)) => {
            let mut components = eq.clone();
            components.push(component);
            Some((IndexKey::new(components), inclusive))
        }
        None if eq.is_empty() => None,
        None => Some((IndexKey::new(eq.clone()), true)),
    };
    let upper = match upper_extra {
        Some((component, inclusive)) => {
            let mut components = eq.clone();
            components.push(component);
            Some((IndexKey::new(components), inclusive))
        }
        None if eq.is_empty() => None,
        None => Some((IndexKey::new(eq), true)),
    };

    Some(Candidate {
        index,
        matched,
        range: IndexRange { lower, upper },
    })
}

fn tighten_lower(
    bound: &mut Option<(KeyComponent, bool)>,
    component: KeyComponent,
    inclusive: bool,
    nulls: crate::index::NullOrdering,
) {
    let replace = match bound {
        None => true,
        Some((existing, existing_inclusive)) => {
            match key_component_cmp(&component, existing, nulls) {
                Ordering::Greater => true,
                Ordering::Equal => *existing_inclusive && !inclusive,
                Ordering::Less => false,
            }
        }
    };
    if replace {
        *bound = Some((component, inclusive));
    }
}

fn tighten_upper(
    bound: &mut Option<(KeyComponent, bool)>,
    component: KeyComponent,
    inclusive: bool,
    nulls: crate::index::NullOrdering,
) {
    let replace = match bound {
        None => true,
        Some((existing, existing_inclusive)) => {
            match key_component_cmp(&component, existing, nulls) {
                Ordering::Less => true,
                Ordering::Equal => *existing_inclusive && !inclusive,
                Ordering::Greater => false,
            }
        }
    };
    if replace {
        *bound = Some((component, inclusive));
    }
}

fn key_component_cmp(
    left: &KeyComponent,
    right: &KeyComponent,
    nulls: crate::index::NullOrdering,
) -> Ordering {
    // Compare through one-component keys to reuse the index ordering.
    IndexKey::new(vec![left.clone()]).cmp_with(&IndexKey::new(vec![right.clone()]), nulls)
}

fn covered_column(index: &LiveIndex, column: &str) -> bool {
    index
        .descriptor
        .key_columns
        .iter()
        .any(|key_column| key_column == column)
        || index
            .descriptor
            .included_columns
            .iter()
            .any(|included| included == column)
}

fn covered_value(
    index: &LiveIndex,
    key: &IndexKey,
    included: &[Value],
    column: &str,
) -> Option<Value> {
    if let Some(pos) = index
        .descriptor
        .key_columns
        .iter()
        .position(|key_column| key_column == column)
    {
        return key.components.get(pos).map(KeyComponent::to_value);
    }
    index
        .descriptor
        .included_columns
        .iter()
        .position(|name| name == column)
        .and_then(|pos| included.get(pos).cloned())
}

/// Evaluates one predicate against a value. Comparisons involving NULL are
/// never satisfied.
fn predicate_holds(predicate: &ColumnPredicate, value: &Value) -> bool {
    let Some(ordering) = compare_values(value, &predicate.value) else {
        return false;
    };
    match predicate.op {
        PredicateOp::Eq => ordering == Ordering::Equal,
        PredicateOp::Lt => ordering == Ordering::Less,
        PredicateOp::LtEq => ordering != Ordering::Greater,
        PredicateOp::Gt => ordering == Ordering::Greater,
        PredicateOp::GtEq => ordering != Ordering::Less,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Integer(l), Value::Integer(r)) => Some(l.cmp(r)),
        (Value::Timestamp(l), Value::Timestamp(r)) => Some(l.cmp(r)),
        (Value::Integer(l), Value::Timestamp(r)) | (Value::Timestamp(l), Value::Integer(r)) => {
            Some(l.cmp(r))
        }
        (Value::Text(l), Value::Text(r)) => Some(l.cmp(r)),
        (Value::Boolean(l), Value::Boolean(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

//! Clause grammar sent to the indexer.
//!
//! A clause is a tagged predicate tree: key matches, member comparisons and
//! AND/OR composites. Clauses are built fresh per query and never stored.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::{EntityModels, ModelValue, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternMatching {
    /// Entity must have exactly as many keys as the clause.
    FixedLen,
    /// Clause keys are a prefix of the entity keys.
    VariableLen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberValue {
    Primitive(Scalar),
    String(String),
    List(Vec<MemberValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClause {
    /// `None` is a wildcard slot.
    pub keys: Vec<Option<String>>,
    pub pattern_matching: PatternMatching,
    /// Models the clause is scoped to; empty means all.
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberClause {
    pub model: String,
    /// Dotted path into the model (`base.coord_x`).
    pub member: String,
    pub operator: ComparisonOperator,
    pub value: MemberValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeClause {
    pub operator: LogicalOperator,
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Clause {
    Keys(KeysClause),
    Member(MemberClause),
    Composite(CompositeClause),
}

/// Rectangular map region, padded on every side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub min_col: u32,
    pub max_col: u32,
    pub min_row: u32,
    pub max_row: u32,
    #[serde(default)]
    pub padding: u32,
}

impl Bounds {
    pub fn new(min_col: u32, max_col: u32, min_row: u32, max_row: u32) -> Self {
        Self {
            min_col,
            max_col,
            min_row,
            max_row,
            padding: 0,
        }
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    /// Smallest bounds containing every `(col, row)` point.
    pub fn covering<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        points.into_iter().fold(None, |acc, (col, row)| {
            Some(match acc {
                None => Self::new(col, col, row, row),
                Some(b) => Self::new(
                    b.min_col.min(col),
                    b.max_col.max(col),
                    b.min_row.min(row),
                    b.max_row.max(row),
                ),
            })
        })
    }

    /// `(min_col, max_col, min_row, max_row)` with padding applied.
    pub fn padded(&self) -> (u32, u32, u32, u32) {
        (
            self.min_col.saturating_sub(self.padding),
            self.max_col.saturating_add(self.padding),
            self.min_row.saturating_sub(self.padding),
            self.max_row.saturating_add(self.padding),
        )
    }
}

impl Clause {
    pub fn keys<I>(keys: I, pattern_matching: PatternMatching, models: Vec<String>) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        Self::Keys(KeysClause {
            keys: keys.into_iter().collect(),
            pattern_matching,
            models,
        })
    }

    /// Exact match on a single key.
    pub fn single_key(key: impl Into<String>, models: Vec<String>) -> Self {
        Self::keys([Some(key.into())], PatternMatching::FixedLen, models)
    }

    /// Any of the given single keys.
    pub fn any_key<I, S>(keys: I, models: Vec<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::or(
            keys.into_iter()
                .map(|key| Self::single_key(key, models.clone()))
                .collect(),
        )
    }

    /// All key slots wildcarded, scoped by model list.
    pub fn wildcard(arity: usize, pattern_matching: PatternMatching, models: Vec<String>) -> Self {
        Self::keys(vec![None; arity], pattern_matching, models)
    }

    pub fn member(
        model: impl Into<String>,
        member: impl Into<String>,
        operator: ComparisonOperator,
        value: MemberValue,
    ) -> Self {
        Self::Member(MemberClause {
            model: model.into(),
            member: member.into(),
            operator,
            value,
        })
    }

    pub fn and(clauses: Vec<Clause>) -> Self {
        Self::Composite(CompositeClause {
            operator: LogicalOperator::And,
            clauses,
        })
    }

    pub fn or(clauses: Vec<Clause>) -> Self {
        Self::Composite(CompositeClause {
            operator: LogicalOperator::Or,
            clauses,
        })
    }

    /// OR of the clauses, or the clause itself when there is only one.
    pub fn or_flat(mut clauses: Vec<Clause>) -> Self {
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::or(clauses)
        }
    }

    /// Four comparisons placing `(col_field, row_field)` of `model` inside the bounds.
    pub fn within_bounds(model: &str, col_field: &str, row_field: &str, bounds: &Bounds) -> Self {
        let (min_col, max_col, min_row, max_row) = bounds.padded();
        let cmp = |field: &str, op, v: u32| {
            Self::member(
                model,
                field,
                op,
                MemberValue::Primitive(Scalar::Unsigned(v.into())),
            )
        };
        Self::and(vec![
            cmp(col_field, ComparisonOperator::Gte, min_col),
            cmp(col_field, ComparisonOperator::Lte, max_col),
            cmp(row_field, ComparisonOperator::Gte, min_row),
            cmp(row_field, ComparisonOperator::Lte, max_row),
        ])
    }

    /// Evaluate the clause against an entity's key fields and models.
    pub fn matches(&self, keys: &[String], models: &EntityModels) -> bool {
        match self {
            Self::Keys(clause) => clause.matches(keys, models),
            Self::Member(clause) => clause.matches(models),
            Self::Composite(CompositeClause { operator, clauses }) => match operator {
                LogicalOperator::And => clauses.iter().all(|c| c.matches(keys, models)),
                LogicalOperator::Or => clauses.iter().any(|c| c.matches(keys, models)),
            },
        }
    }
}

impl KeysClause {
    fn matches(&self, keys: &[String], models: &EntityModels) -> bool {
        let arity_ok = match self.pattern_matching {
            PatternMatching::FixedLen => keys.len() == self.keys.len(),
            PatternMatching::VariableLen => keys.len() >= self.keys.len(),
        };
        if !arity_ok {
            return false;
        }

        let keys_ok = self
            .keys
            .iter()
            .zip(keys)
            .all(|(want, have)| want.as_ref().map_or(true, |w| keys_equal(w, have)));

        keys_ok && (self.models.is_empty() || self.models.iter().any(|m| models.contains(m)))
    }
}

impl MemberClause {
    fn matches(&self, models: &EntityModels) -> bool {
        let Some(leaf) = models.get(&self.model).and_then(|m| m.path(&self.member)) else {
            return false;
        };

        match (&self.operator, &self.value) {
            (ComparisonOperator::In, MemberValue::List(items)) => {
                items.iter().any(|item| compare(leaf, item) == Some(Ordering::Equal))
            }
            (ComparisonOperator::NotIn, MemberValue::List(items)) => {
                items.iter().all(|item| compare(leaf, item) != Some(Ordering::Equal))
            }
            (op, value) => match compare(leaf, value) {
                Some(ord) => match op {
                    ComparisonOperator::Eq => ord == Ordering::Equal,
                    ComparisonOperator::Neq => ord != Ordering::Equal,
                    ComparisonOperator::Gt => ord == Ordering::Greater,
                    ComparisonOperator::Gte => ord != Ordering::Less,
                    ComparisonOperator::Lt => ord == Ordering::Less,
                    ComparisonOperator::Lte => ord != Ordering::Greater,
                    ComparisonOperator::In | ComparisonOperator::NotIn => false,
                },
                None => false,
            },
        }
    }
}

/// Keys compare numerically when both parse, textually otherwise.
fn keys_equal(a: &str, b: &str) -> bool {
    match (parse_key(a), parse_key(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.eq_ignore_ascii_case(b),
    }
}

fn parse_key(s: &str) -> Option<u128> {
    match s.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn compare(leaf: &ModelValue, value: &MemberValue) -> Option<Ordering> {
    match (leaf, value) {
        (ModelValue::Primitive { value: have, .. }, MemberValue::Primitive(want)) => {
            match (have.as_i128(), want.as_i128()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => match (have.as_u128(), want.as_u128()) {
                    (Some(a), Some(b)) => Some(a.cmp(&b)),
                    _ => None,
                },
            }
        }
        (ModelValue::Primitive { value: have, .. }, MemberValue::String(want)) => {
            Some(have.to_key_string().as_str().cmp(want.as_str()))
        }
        (ModelValue::Enum { variant, .. }, MemberValue::String(want)) => {
            Some(variant.as_str().cmp(want.as_str()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(col: u32, row: u32) -> EntityModels {
        EntityModels::new().with(
            "s1_eternum-Tile",
            ModelValue::structure(
                "Tile",
                [("col", ModelValue::u32(col)), ("row", ModelValue::u32(row))],
            ),
        )
    }

    #[test]
    fn within_bounds_uses_padding() {
        let bounds = Bounds::new(10, 20, 10, 20).with_padding(2);
        let clause = Clause::within_bounds("s1_eternum-Tile", "col", "row", &bounds);

        assert!(clause.matches(&[], &tile(8, 22)));
        assert!(!clause.matches(&[], &tile(7, 15)));
        assert!(!clause.matches(&[], &tile(15, 23)));
    }

    #[test]
    fn fixed_and_variable_key_patterns() {
        let models = EntityModels::new().with("m", ModelValue::u8(1));
        let keys = vec!["7".to_string(), "0x2".to_string()];

        let fixed = Clause::keys([Some("7".into()), None], PatternMatching::FixedLen, vec![]);
        assert!(fixed.matches(&keys, &models));

        let too_short = Clause::wildcard(1, PatternMatching::FixedLen, vec![]);
        assert!(!too_short.matches(&keys, &models));

        let prefix = Clause::keys([Some("0x7".into())], PatternMatching::VariableLen, vec![]);
        assert!(prefix.matches(&keys, &models));

        let scoped = Clause::wildcard(2, PatternMatching::FixedLen, vec!["other".into()]);
        assert!(!scoped.matches(&keys, &models));
    }

    #[test]
    fn any_key_is_an_or_of_single_keys() {
        let clause = Clause::any_key(["1", "2"], vec![]);
        let Clause::Composite(CompositeClause { operator, clauses }) = &clause else {
            panic!("expected composite");
        };
        assert_eq!(*operator, LogicalOperator::Or);
        assert_eq!(clauses.len(), 2);

        let models = EntityModels::new().with("m", ModelValue::u8(1));
        assert!(clause.matches(&["2".to_string()], &models));
        assert!(!clause.matches(&["3".to_string()], &models));
    }

    #[test]
    fn member_in_list() {
        let clause = Clause::member(
            "s1_eternum-Tile",
            "col",
            ComparisonOperator::In,
            MemberValue::List(vec![
                MemberValue::Primitive(Scalar::Unsigned(1)),
                MemberValue::Primitive(Scalar::Unsigned(5)),
            ]),
        );
        assert!(clause.matches(&[], &tile(5, 0)));
        assert!(!clause.matches(&[], &tile(4, 0)));
    }

    #[test]
    fn covering_bounds() {
        let bounds = Bounds::covering([(5, 9), (2, 12), (7, 1)]).unwrap();
        assert_eq!(bounds, Bounds::new(2, 7, 1, 12));
        assert!(Bounds::covering(Vec::<(u32, u32)>::new()).is_none());
    }

    #[test]
    fn serializes_in_indexer_shape() {
        let clause = Clause::single_key("5", vec!["s1_eternum-Resource".into()]);
        let json = serde_json::to_value(&clause).unwrap();
        assert_eq!(json["Keys"]["pattern_matching"], "FixedLen");
        assert_eq!(json["Keys"]["keys"][0], "5");
    }
}

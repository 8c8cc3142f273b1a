// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Boolean expression trees over the attribute space.
//!
//! Atoms test presence, string equality or numeric comparison of a single
//! key; `AND`/`OR`/`NOT` combine them under three-valued logic. Against
//! remote data an atom may come out [`FuzzyValue::Undecided`] when the key
//! is unknown or stale and the query allows inquiring for it; the evaluator
//! later collapses those once all information is present.

use super::fuzzy::FuzzyValue;
use crate::store::{NodeRecords, Value};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Evaluation flags threaded through an expression tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    /// Values with an update timestamp below this are considered outdated.
    pub validity_threshold: u64,
    /// Whether every inquiry that could still arrive has arrived.
    pub all_information_present: bool,
    /// Inquire keys the cache has never seen.
    pub inquire_unknown: bool,
    /// Inquire keys whose cached value is outdated.
    pub inquire_outdated: bool,
    /// Count an outdated value taken at face value as fulfilled instead of
    /// undecided. Only consulted when `inquire_outdated` is off.
    pub permissive: bool,
}

/// Numeric comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Display for ComparisonOp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let symbol = match self {
            ComparisonOp::Eq => "==",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Gt => ">",
            ComparisonOp::Le => "<=",
            ComparisonOp::Ge => ">=",
        };
        write!(f, "{}", symbol)
    }
}

/// Literal operand of a numeric comparison. Comparisons coerce at compare
/// time, so an integer attribute can be matched against a float literal and
/// vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Int(i32),
    Float(f32),
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Operand::Int(v) => write!(f, "{}", v),
            Operand::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Int(v)
    }
}

impl From<f32> for Operand {
    fn from(v: f32) -> Self {
        Operand::Float(v)
    }
}

/// A Boolean expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    /// `HAS(key)`; a stored boolean value decides instead of mere presence.
    Has(String),
    /// `key == "literal"`.
    StringEq { key: String, expected: String },
    /// `key OP literal` over i32/f32.
    NumCmp {
        key: String,
        op: ComparisonOp,
        operand: Operand,
    },
    /// Always true.
    Empty,
}

impl Display for Expression {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Expression::And(lhs, rhs) => write!(f, "( {} AND {} )", lhs, rhs),
            Expression::Or(lhs, rhs) => write!(f, "( {} OR {} )", lhs, rhs),
            Expression::Not(inner) => write!(f, "( NOT {} )", inner),
            Expression::Has(key) => write!(f, "( HAS {} )", key),
            Expression::StringEq { key, expected } => write!(f, "( {} == {} )", key, expected),
            Expression::NumCmp { key, op, operand } => {
                write!(f, "( {} {} {} )", key, op, operand)
            }
            Expression::Empty => write!(f, "( empty )"),
        }
    }
}

impl Expression {
    pub fn and(self, other: Expression) -> Expression {
        Expression::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expression) -> Expression {
        Expression::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expression {
        Expression::Not(Box::new(self))
    }

    pub fn has(key: impl Into<String>) -> Expression {
        Expression::Has(key.into())
    }

    pub fn string_eq(key: impl Into<String>, expected: impl Into<String>) -> Expression {
        Expression::StringEq {
            key: key.into(),
            expected: expected.into(),
        }
    }

    pub fn num_cmp(key: impl Into<String>, op: ComparisonOp, operand: impl Into<Operand>) -> Expression {
        Expression::NumCmp {
            key: key.into(),
            op,
            operand: operand.into(),
        }
    }

    /// Three-valued evaluation against one peer's data.
    pub fn evaluate(&self, data: &dyn NodeRecords, ctx: &EvalContext) -> FuzzyValue {
        match self {
            Expression::And(lhs, rhs) => lhs.evaluate(data, ctx) & rhs.evaluate(data, ctx),
            Expression::Or(lhs, rhs) => lhs.evaluate(data, ctx) | rhs.evaluate(data, ctx),
            Expression::Not(inner) => !inner.evaluate(data, ctx),
            Expression::Empty => FuzzyValue::True,
            Expression::Has(key) => evaluate_atom(key, data, ctx, |data| evaluate_has(key, data)),
            Expression::StringEq { key, expected } => {
                evaluate_atom(key, data, ctx, |data| evaluate_string_eq(key, expected, data))
            }
            Expression::NumCmp { key, op, operand } => {
                evaluate_atom(key, data, ctx, |data| {
                    evaluate_num_cmp(key, *op, *operand, data)
                })
            }
        }
    }

    /// The keys an inquiry would need to fetch to collapse every Undecided
    /// this expression can produce against `data`.
    pub fn missing_attributes(&self, data: &dyn NodeRecords, ctx: &EvalContext) -> Vec<String> {
        match self {
            Expression::And(lhs, rhs) => {
                let mut missing = lhs.missing_attributes(data, ctx);
                missing.extend(rhs.missing_attributes(data, ctx));
                missing
            }
            Expression::Or(lhs, rhs) => {
                // a satisfied disjunction needs no further information
                let undecided_ctx = EvalContext {
                    all_information_present: false,
                    ..*ctx
                };
                if lhs.evaluate(data, &undecided_ctx).is_true()
                    || rhs.evaluate(data, &undecided_ctx).is_true()
                {
                    return Vec::new();
                }
                let mut missing = lhs.missing_attributes(data, &undecided_ctx);
                missing.extend(rhs.missing_attributes(data, &undecided_ctx));
                missing
            }
            Expression::Not(inner) => inner.missing_attributes(data, ctx),
            Expression::Empty => Vec::new(),
            Expression::Has(key)
            | Expression::StringEq { key, .. }
            | Expression::NumCmp { key, .. } => atom_missing(key, data, ctx),
        }
    }

    /// Every key the expression touches.
    pub fn relevant_keys(&self) -> Vec<String> {
        match self {
            Expression::And(lhs, rhs) | Expression::Or(lhs, rhs) => {
                let mut keys = lhs.relevant_keys();
                keys.extend(rhs.relevant_keys());
                keys
            }
            Expression::Not(inner) => inner.relevant_keys(),
            Expression::Empty => Vec::new(),
            Expression::Has(key)
            | Expression::StringEq { key, .. }
            | Expression::NumCmp { key, .. } => vec![key.clone()],
        }
    }

    /// The subset of relevant keys used as bare topics (presence atoms).
    pub fn relevant_topic_keys(&self) -> Vec<String> {
        match self {
            Expression::And(lhs, rhs) | Expression::Or(lhs, rhs) => {
                let mut keys = lhs.relevant_topic_keys();
                keys.extend(rhs.relevant_topic_keys());
                keys
            }
            Expression::Not(inner) => inner.relevant_topic_keys(),
            Expression::Has(key) => vec![key.clone()],
            _ => Vec::new(),
        }
    }

    /// Number of atoms in the tree.
    pub fn depth(&self) -> u8 {
        match self {
            Expression::And(lhs, rhs) | Expression::Or(lhs, rhs) => {
                lhs.depth().saturating_add(rhs.depth())
            }
            Expression::Not(inner) => inner.depth(),
            Expression::Empty => 0,
            _ => 1,
        }
    }
}

/// The common remote-data handling around an atom: unknown and outdated
/// keys degrade to Undecided or False depending on whether the query may
/// still inquire for them. With inquiring disabled, an outdated value taken
/// at face value cannot decide the atom either way; `permissive` counts it
/// as fulfilled instead.
fn evaluate_atom(
    key: &str,
    data: &dyn NodeRecords,
    ctx: &EvalContext,
    existing: impl Fn(&dyn NodeRecords) -> FuzzyValue,
) -> FuzzyValue {
    if data.is_local() {
        return existing(data);
    }

    if !data.has_key(key) {
        if !ctx.all_information_present && ctx.inquire_unknown {
            return FuzzyValue::Undecided;
        }
        return FuzzyValue::False;
    }

    if !data.is_up_to_date(key, ctx.validity_threshold) {
        if ctx.inquire_outdated {
            if ctx.all_information_present {
                return FuzzyValue::False;
            }
            return FuzzyValue::Undecided;
        }
        if ctx.permissive {
            return FuzzyValue::True;
        }
        return FuzzyValue::Undecided;
    }

    // the value is fresh
    existing(data)
}

fn atom_missing(key: &str, data: &dyn NodeRecords, ctx: &EvalContext) -> Vec<String> {
    let known = data.has_key(key);
    let fresh = known && data.is_up_to_date(key, ctx.validity_threshold);
    let inquire = match (ctx.inquire_unknown, ctx.inquire_outdated) {
        (true, true) => !known || !fresh,
        (true, false) => !known,
        (false, true) => known && !fresh,
        (false, false) => false,
    };
    if inquire {
        vec![key.to_string()]
    } else {
        Vec::new()
    }
}

fn evaluate_has(key: &str, data: &dyn NodeRecords) -> FuzzyValue {
    match data.value_of(key) {
        None => FuzzyValue::False,
        // a boolean topic decides by its value, not by presence
        Some(Value::Bool(value)) => FuzzyValue::from_bool(*value),
        Some(_) => FuzzyValue::True,
    }
}

fn evaluate_string_eq(key: &str, expected: &str, data: &dyn NodeRecords) -> FuzzyValue {
    match data.value_of(key) {
        Some(Value::Text(value)) => FuzzyValue::from_bool(value == expected),
        _ => FuzzyValue::False,
    }
}

fn evaluate_num_cmp(key: &str, op: ComparisonOp, operand: Operand, data: &dyn NodeRecords) -> FuzzyValue {
    let fulfilled = match (data.value_of(key), operand) {
        (Some(Value::Int(value)), Operand::Int(literal)) => compare(*value, literal, op),
        (Some(Value::Int(value)), Operand::Float(literal)) => {
            compare(f64::from(*value), f64::from(literal), op)
        }
        (Some(Value::Float(value)), Operand::Int(literal)) => {
            compare(f64::from(*value), f64::from(literal), op)
        }
        (Some(Value::Float(value)), Operand::Float(literal)) => {
            compare(f64::from(*value), f64::from(literal), op)
        }
        // not numeric, not comparable
        _ => false,
    };
    FuzzyValue::from_bool(fulfilled)
}

fn compare<T: PartialOrd>(value: T, literal: T, op: ComparisonOp) -> bool {
    match op {
        ComparisonOp::Eq => value == literal,
        ComparisonOp::Ne => value != literal,
        ComparisonOp::Lt => value < literal,
        ComparisonOp::Gt => value > literal,
        ComparisonOp::Le => value <= literal,
        ComparisonOp::Ge => value >= literal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_utils::node;
    use crate::store::{DistributedData, LocalData, Record, ValueType};

    fn ctx() -> EvalContext {
        EvalContext {
            validity_threshold: 0,
            all_information_present: false,
            inquire_unknown: true,
            inquire_outdated: true,
            permissive: false,
        }
    }

    fn local(entries: &[(&str, Value)]) -> LocalData {
        let mut data = LocalData::default();
        for (key, value) in entries {
            data.insert(
                key,
                Record {
                    value: value.clone(),
                    timestamp: 1000,
                    value_type: ValueType::Dynamic,
                },
            )
            .expect("insert");
        }
        data
    }

    fn remote(entries: &[(&str, Value, u64)]) -> DistributedData {
        let mut data = DistributedData::new(node(4, 2, 2), 5);
        for (key, value, timestamp) in entries {
            data.insert(
                key,
                Record {
                    value: value.clone(),
                    timestamp: *timestamp,
                    value_type: ValueType::Dynamic,
                },
            )
            .expect("insert");
        }
        data
    }

    #[test]
    fn local_atoms_are_never_undecided() {
        let data = local(&[("wetter", Value::from("schlecht"))]);
        let hit = Expression::string_eq("wetter", "schlecht");
        let miss = Expression::string_eq("wetter", "gut");
        let absent = Expression::has("sturm");
        assert!(hit.evaluate(&data, &ctx()).is_true());
        assert!(miss.evaluate(&data, &ctx()).is_false());
        assert!(absent.evaluate(&data, &ctx()).is_false());
    }

    #[test]
    fn numeric_comparison_against_fresh_remote_data() {
        let data = remote(&[("pos_x", Value::Int(100), 1000)]);
        let ge = Expression::num_cmp("pos_x", ComparisonOp::Ge, 100);
        assert!(ge.evaluate(&data, &ctx()).is_true());

        let data = remote(&[("pos_x", Value::Int(99), 1000)]);
        assert!(ge.evaluate(&data, &ctx()).is_false());
    }

    #[test]
    fn unknown_remote_key_depends_on_inquiry_policy() {
        let data = remote(&[]);
        let expr = Expression::num_cmp("pos_x", ComparisonOp::Ge, 100);

        let no_inquiry = EvalContext {
            inquire_unknown: false,
            ..ctx()
        };
        assert!(expr.evaluate(&data, &no_inquiry).is_false());

        assert!(expr.evaluate(&data, &ctx()).is_undecided());

        let concluded = EvalContext {
            all_information_present: true,
            ..ctx()
        };
        assert!(expr.evaluate(&data, &concluded).is_false());
    }

    #[test]
    fn outdated_remote_key_depends_on_inquiry_policy() {
        let data = remote(&[("pos_x", Value::Int(100), 100)]);
        let expr = Expression::num_cmp("pos_x", ComparisonOp::Ge, 100);

        let stale = EvalContext {
            validity_threshold: 500,
            ..ctx()
        };
        assert!(expr.evaluate(&data, &stale).is_undecided());

        let concluded = EvalContext {
            all_information_present: true,
            ..stale
        };
        assert!(expr.evaluate(&data, &concluded).is_false());

        // not inquiring outdated values takes them at face value, which
        // cannot decide the atom either way
        let lenient = EvalContext {
            inquire_outdated: false,
            ..stale
        };
        assert!(expr.evaluate(&data, &lenient).is_undecided());

        // permissive counts the stale value as fulfilled
        let permissive = EvalContext {
            permissive: true,
            ..lenient
        };
        assert!(expr.evaluate(&data, &permissive).is_true());
    }

    #[test]
    fn mixed_numeric_types_coerce_at_compare_time() {
        let data = remote(&[("weight", Value::Float(10.5), 1000)]);
        assert!(Expression::num_cmp("weight", ComparisonOp::Gt, 10)
            .evaluate(&data, &ctx())
            .is_true());
        let data = remote(&[("weight", Value::Int(10), 1000)]);
        assert!(Expression::num_cmp("weight", ComparisonOp::Lt, 10.5f32)
            .evaluate(&data, &ctx())
            .is_true());
    }

    #[test]
    fn boolean_topics_decide_presence_by_value() {
        let data = local(&[("topicA", Value::Bool(true)), ("topicB", Value::Bool(false))]);
        assert!(Expression::has("topicA").evaluate(&data, &ctx()).is_true());
        assert!(Expression::has("topicB").evaluate(&data, &ctx()).is_false());
    }

    #[test]
    fn connectives_follow_the_lattice() {
        let data = remote(&[("a", Value::Int(1), 1000)]);
        let known_true = Expression::num_cmp("a", ComparisonOp::Eq, 1);
        let unknown = Expression::has("b");

        let conjunction = known_true.clone().and(unknown.clone());
        assert!(conjunction.evaluate(&data, &ctx()).is_undecided());

        let disjunction = known_true.clone().or(unknown.clone());
        assert!(disjunction.evaluate(&data, &ctx()).is_true());

        let negated = unknown.not();
        assert!(negated.evaluate(&data, &ctx()).is_undecided());
        assert!(Expression::Empty.evaluate(&data, &ctx()).is_true());
    }

    #[test]
    fn missing_attributes_skip_satisfied_disjunctions() {
        let data = remote(&[("topicA", Value::Bool(true), 1000)]);
        let satisfied = Expression::has("topicA").or(Expression::has("a01"));
        assert!(satisfied
            .missing_attributes(&data, &ctx())
            .is_empty());

        let open = Expression::has("a01").or(Expression::has("a02"));
        assert_eq!(
            open.missing_attributes(&data, &ctx()),
            vec!["a01".to_string(), "a02".to_string()]
        );
    }

    #[test]
    fn missing_attributes_honor_the_inquiry_flags() {
        let data = remote(&[("stale", Value::Int(1), 100)]);
        let expr = Expression::has("stale").and(Expression::has("unknown"));
        let base = EvalContext {
            validity_threshold: 500,
            ..ctx()
        };

        assert_eq!(
            expr.missing_attributes(&data, &base),
            vec!["stale".to_string(), "unknown".to_string()]
        );
        let only_unknown = EvalContext {
            inquire_outdated: false,
            ..base
        };
        assert_eq!(
            expr.missing_attributes(&data, &only_unknown),
            vec!["unknown".to_string()]
        );
        let only_outdated = EvalContext {
            inquire_unknown: false,
            ..base
        };
        assert_eq!(
            expr.missing_attributes(&data, &only_outdated),
            vec!["stale".to_string()]
        );
        let none = EvalContext {
            inquire_unknown: false,
            inquire_outdated: false,
            ..base
        };
        assert!(expr.missing_attributes(&data, &none).is_empty());
    }

    #[test]
    fn renders_in_parenthesized_text_form() {
        let expr = Expression::has("a")
            .and(Expression::num_cmp("x", ComparisonOp::Ge, 3))
            .or(Expression::string_eq("name", "core").not());
        assert_eq!(
            expr.to_string(),
            "( ( ( HAS a ) AND ( x >= 3 ) ) OR ( NOT ( name == core ) ) )"
        );
    }

    #[test]
    fn relevant_and_topic_keys() {
        let expr = Expression::has("topicA").and(Expression::num_cmp(
            "weight",
            ComparisonOp::Gt,
            100,
        ));
        assert_eq!(expr.relevant_keys(), vec!["topicA", "weight"]);
        assert_eq!(expr.relevant_topic_keys(), vec!["topicA"]);
        assert_eq!(expr.depth(), 2);
    }
}

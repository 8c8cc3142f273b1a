// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use super::expression::{EvalContext, Expression};
use super::fuzzy::FuzzyValue;
use crate::peer::NodeInfo;
use crate::store::NodeRecords;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Whether a query wants every fulfilling peer or just evidence of some.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindQueryScope {
    All,
    Some,
}

/// Which attributes the answer should carry per fulfilling peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Every known attribute.
    AllAttributes,
    /// The listed keys.
    Specific(Vec<String>),
    /// Only the `NodeInfo`s matter.
    Unspecific,
}

/// What an evaluation still needs to fetch for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingAttributes {
    /// Fetch everything the peer has.
    All,
    /// Fetch exactly these keys; empty means nothing is missing.
    Keys(Vec<String>),
}

impl MissingAttributes {
    pub fn is_empty(&self) -> bool {
        matches!(self, MissingAttributes::Keys(keys) if keys.is_empty())
    }
}

/// A Boolean query over the attribute space plus its evaluation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindQuery {
    expression: Expression,
    scope: FindQueryScope,
    requesting_node: Option<NodeInfo>,
    /// How old a value may be (ms) and still count as up to date.
    validity_threshold: u64,
    inquire_unknown: bool,
    inquire_outdated: bool,
    permissive: bool,
    selection: Selection,
}

impl FindQuery {
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            scope: FindQueryScope::All,
            requesting_node: None,
            validity_threshold: 0,
            inquire_unknown: true,
            inquire_outdated: true,
            permissive: false,
            selection: Selection::Unspecific,
        }
    }

    pub fn with_scope(mut self, scope: FindQueryScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_validity_threshold(mut self, threshold_ms: u64) -> Self {
        self.validity_threshold = threshold_ms;
        self
    }

    pub fn with_inquire_unknown(mut self, inquire: bool) -> Self {
        self.inquire_unknown = inquire;
        self
    }

    pub fn with_inquire_outdated(mut self, inquire: bool) -> Self {
        self.inquire_outdated = inquire;
        self
    }

    pub fn with_permissive(mut self, permissive: bool) -> Self {
        self.permissive = permissive;
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    pub fn scope(&self) -> FindQueryScope {
        self.scope
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn validity_threshold(&self) -> u64 {
        self.validity_threshold
    }

    pub fn inquire_unknown(&self) -> bool {
        self.inquire_unknown
    }

    pub fn inquire_outdated(&self) -> bool {
        self.inquire_outdated
    }

    pub fn permissive(&self) -> bool {
        self.permissive
    }

    pub fn requesting_node(&self) -> Option<NodeInfo> {
        self.requesting_node
    }

    pub(crate) fn set_requesting_node(&mut self, node: NodeInfo) {
        self.requesting_node = Some(node);
    }

    fn eval_context(&self, all_information_present: bool, now: u64) -> EvalContext {
        EvalContext {
            validity_threshold: now.saturating_sub(self.validity_threshold),
            all_information_present,
            inquire_unknown: self.inquire_unknown,
            inquire_outdated: self.inquire_outdated,
            // permissiveness only matters while outdated values are taken
            // at face value
            permissive: if self.inquire_outdated {
                false
            } else {
                self.permissive
            },
        }
    }

    /// Evaluates the query against one peer's data. Once all information is
    /// present an Undecided can never be tipped anymore and collapses to
    /// False.
    pub fn evaluate(
        &self,
        data: &dyn NodeRecords,
        all_information_present: bool,
        now: u64,
    ) -> FuzzyValue {
        let ctx = self.eval_context(all_information_present, now);
        let value = self.expression.evaluate(data, &ctx);
        if all_information_present && value.is_undecided() {
            return FuzzyValue::False;
        }
        value
    }

    /// The keys an inquiry for `data`'s peer should ask for, shaped by the
    /// attribute selection of the query.
    pub fn missing_attributes(&self, data: &dyn NodeRecords, now: u64) -> MissingAttributes {
        if self.selection == Selection::AllAttributes {
            return MissingAttributes::All;
        }

        let ctx = self.eval_context(false, now);
        let missing = self.expression.missing_attributes(data, &ctx);

        match &self.selection {
            Selection::Unspecific => MissingAttributes::Keys(missing),
            Selection::Specific(keys) => MissingAttributes::Keys(
                missing
                    .into_iter()
                    .chain(keys.iter().cloned())
                    .sorted()
                    .dedup()
                    .collect(),
            ),
            Selection::AllAttributes => unreachable!("handled above"),
        }
    }

    pub fn relevant_attributes(&self) -> Vec<String> {
        self.expression.relevant_keys()
    }

    pub fn relevant_topic_attributes(&self) -> Vec<String> {
        self.expression.relevant_topic_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esearch::expression::ComparisonOp;
    use crate::peer::test_utils::node;
    use crate::store::{DistributedData, Record, Value, ValueType};

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
    fn fresh_attribute_within_validity_window() {
        // insert at t=1000, query at t=1200 with threshold 350: fresh
        let data = remote(&[("wetter", Value::from("schlecht"), 1000)]);
        let query = FindQuery::new(
            Expression::has("wetter").and(Expression::string_eq("wetter", "schlecht")),
        )
        .with_validity_threshold(350);
        assert!(query.evaluate(&data, false, 1200).is_true());
    }

    #[test]
    fn stale_attribute_goes_undecided_then_false() {
        // insert at t=600, query at t=1200 with threshold 350: stale
        let data = remote(&[("wetter", Value::from("schlecht"), 600)]);
        let query = FindQuery::new(Expression::string_eq("wetter", "schlecht"))
            .with_validity_threshold(350);
        assert!(query.evaluate(&data, false, 1200).is_undecided());
        assert!(query.evaluate(&data, true, 1200).is_false());
    }

    #[test]
    fn undecided_collapses_to_false_once_concluded() {
        let data = remote(&[]);
        let query = FindQuery::new(Expression::has("a01"));
        assert!(query.evaluate(&data, false, 1000).is_undecided());
        assert!(query.evaluate(&data, true, 1000).is_false());
    }

    #[test]
    fn permissiveness_is_ignored_while_inquiring_outdated() {
        let data = remote(&[("weight", Value::Int(101), 100)]);
        let query = FindQuery::new(Expression::num_cmp("weight", ComparisonOp::Gt, 100))
            .with_validity_threshold(0)
            .with_permissive(true);
        // threshold 0 makes everything below `now` outdated
        assert!(query.evaluate(&data, false, 1000).is_undecided());
    }

    #[test]
    fn permissive_counts_stale_values_when_not_inquiring() {
        let data = remote(&[("weight", Value::Int(101), 100)]);
        let strict = FindQuery::new(Expression::num_cmp("weight", ComparisonOp::Gt, 100))
            .with_validity_threshold(0)
            .with_inquire_outdated(false);
        // the stale value taken at face value decides nothing
        assert!(strict.evaluate(&data, false, 1000).is_undecided());
        assert!(strict.evaluate(&data, true, 1000).is_false());

        let permissive = strict.with_permissive(true);
        assert!(permissive.evaluate(&data, false, 1000).is_true());
        assert!(permissive.evaluate(&data, true, 1000).is_true());
    }

    #[test]
    fn missing_attributes_respect_the_selection() {
        let data = remote(&[]);
        let expr = Expression::has("a01").or(Expression::has("topicA"));

        let unspecific = FindQuery::new(expr.clone());
        assert_eq!(
            unspecific.missing_attributes(&data, 1000),
            MissingAttributes::Keys(vec!["a01".to_string(), "topicA".to_string()])
        );

        let specific = FindQuery::new(expr.clone())
            .with_selection(Selection::Specific(vec!["weight".to_string()]));
        assert_eq!(
            specific.missing_attributes(&data, 1000),
            MissingAttributes::Keys(vec![
                "a01".to_string(),
                "topicA".to_string(),
                "weight".to_string()
            ])
        );

        let all = FindQuery::new(expr).with_selection(Selection::AllAttributes);
        assert_eq!(all.missing_attributes(&data, 1000), MissingAttributes::All);
    }
}

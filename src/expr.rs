//! Compiles Kubernetes label selectors into group membership expressions.
//!
//! A selector becomes one criterion: a `NestedExpression` whose conditions are
//! joined by `AND`. A selector with an `In` expression becomes one criterion
//! per value, each matching `key|value` like a label. Criteria for different
//! targets or peers are joined by `OR` at the top level of the group's
//! expression list.

use crate::{
    error::SelectorError,
    k8s::{self, selector_op},
    model::{
        Condition, Conjunction, ConjunctionOperator, Expression, IpAddressExpression,
        NestedExpression,
    },
};
use std::collections::BTreeMap;

/// Maximum expressions in one criterion over a single member type.
pub const MAX_CRITERIA_EXPRESSIONS: usize = 5;

/// Maximum expressions in one criterion mixing member types.
pub const MAX_MIXED_CRITERIA_EXPRESSIONS: usize = 15;

/// Maximum values in the single permitted `In` expression.
pub const MAX_IN_VALUES: usize = 5;

/// Maximum criteria in one group.
pub const MAX_CRITERIA: usize = 5;

/// Maximum expressions across all criteria of one group.
pub const MAX_TOTAL_CRITERIA_EXPRESSIONS: usize = 35;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberType {
    /// A pod's port on a segment.
    SegmentPort,
    VirtualMachine,
    /// A namespace's segment.
    Segment,
}

/// Accumulates the top-level expression list of a group, enforcing the
/// group-wide criteria limits.
#[derive(Debug, Default)]
pub struct GroupExpression {
    expression: Vec<Expression>,
    criteria: usize,
    expressions: usize,
}

/// Per-criterion expression accounting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub criteria: usize,
    pub expressions: usize,
}

// === impl MemberType ===

impl MemberType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SegmentPort => "SegmentPort",
            Self::VirtualMachine => "VirtualMachine",
            Self::Segment => "Segment",
        }
    }
}

/// Builds a tag-equality condition matching `scope|tag` on `member_type`.
pub fn condition(member_type: MemberType, value: String, scope_operator: Option<&str>) -> Expression {
    Expression::Condition(Condition {
        key: "Tag".to_string(),
        member_type: member_type.as_str().to_string(),
        operator: "EQUALS".to_string(),
        scope_operator: scope_operator.map(str::to_string),
        value,
    })
}

fn conjunction(op: Conjunction) -> Expression {
    Expression::ConjunctionOperator(ConjunctionOperator {
        conjunction_operator: op,
    })
}

/// Appends `op` if the list is not empty, so that conjunctions only ever
/// appear between entries.
pub fn add_operator_if_needed(expressions: &mut Vec<Expression>, op: Conjunction) {
    if !expressions.is_empty() {
        expressions.push(conjunction(op));
    }
}

/// Merges the values of expressions that share both key and operator.
///
/// Expressions with the same key but a different operator stay separate.
/// Output order is the order in which each (key, operator) pair first
/// appears; values keep their first-seen order and are deduplicated.
pub fn merge_selector_match_expression(
    expressions: &[k8s::LabelSelectorRequirement],
) -> Vec<k8s::LabelSelectorRequirement> {
    let mut merged = Vec::<k8s::LabelSelectorRequirement>::with_capacity(expressions.len());
    for expr in expressions {
        let values = expr.values.iter().flatten();
        match merged
            .iter_mut()
            .find(|m| m.key == expr.key && m.operator == expr.operator)
        {
            Some(existing) => {
                let existing_values = existing.values.get_or_insert_with(Vec::new);
                for value in values {
                    if !existing_values.contains(value) {
                        existing_values.push(value.clone());
                    }
                }
            }
            None => {
                let mut deduped = Vec::new();
                for value in values {
                    if !deduped.contains(value) {
                        deduped.push(value.clone());
                    }
                }
                merged.push(k8s::LabelSelectorRequirement {
                    key: expr.key.clone(),
                    operator: expr.operator.clone(),
                    values: expr.values.as_ref().map(|_| deduped),
                });
            }
        }
    }
    merged
}

/// Validates use of the `In` operator in already-merged expressions.
///
/// Only one `In` expression is allowed per member type, its key may not also
/// appear in `match_labels`, and it may hold at most [`MAX_IN_VALUES`] values.
/// Returns the number of `In` values.
pub fn validate_selector_op_in(
    expressions: &[k8s::LabelSelectorRequirement],
    match_labels: &BTreeMap<String, String>,
) -> Result<usize, SelectorError> {
    let mut op_count = 0;
    let mut value_count = 0;
    for expr in expressions.iter().filter(|e| e.operator == selector_op::IN) {
        op_count += 1;
        if op_count > 1 {
            return Err(SelectorError::TooManyInOperators(op_count));
        }
        if match_labels.contains_key(&expr.key) {
            return Err(SelectorError::DuplicatedInKey(expr.key.clone()));
        }
        value_count = expr.values.as_ref().map_or(0, Vec::len);
        if value_count == 0 {
            return Err(SelectorError::EmptyInValues(expr.key.clone()));
        }
        if value_count > MAX_IN_VALUES {
            return Err(SelectorError::TooManyInValues {
                count: value_count,
                limit: MAX_IN_VALUES,
            });
        }
    }
    Ok(value_count)
}

/// Namespace selectors may not use `NotIn`.
pub fn validate_ns_selector_op_not_in(
    expressions: &[k8s::LabelSelectorRequirement],
) -> Result<(), SelectorError> {
    if expressions.iter().any(|e| e.operator == selector_op::NOT_IN) {
        return Err(SelectorError::NamespaceNotIn);
    }
    Ok(())
}

/// Checks a criterion's expression count against the per-criterion limit and
/// computes how many criteria and expressions it finally produces.
///
/// Each `In` value is accounted as its own criterion. A criterion with no
/// labels and no expressions matches everything and produces nothing.
pub fn validate_selector_expressions(
    match_labels_count: usize,
    match_expressions_count: usize,
    op_in_value_count: usize,
    mixed_criteria: bool,
) -> Result<Counts, SelectorError> {
    let total = match_labels_count + match_expressions_count;
    let limit = if mixed_criteria {
        MAX_MIXED_CRITERIA_EXPRESSIONS
    } else {
        MAX_CRITERIA_EXPRESSIONS
    };
    if total > limit {
        return Err(SelectorError::TooManyExpressions {
            count: total,
            limit,
        });
    }

    if total == 0 {
        return Ok(Counts::default());
    }
    if op_in_value_count != 0 {
        return Ok(Counts {
            criteria: op_in_value_count,
            expressions: total * op_in_value_count,
        });
    }
    Ok(Counts {
        criteria: 1,
        expressions: total,
    })
}

/// Appends conditions for one member type's labels and merged expressions.
///
/// `In` expressions are skipped; [`op_in_conditions`] expands them into
/// separate criteria. Returns the number of label and expression conditions
/// appended. On error the list may be partially built and must be discarded.
pub fn update_expressions_match_expression(
    match_expressions: &[k8s::LabelSelectorRequirement],
    match_labels: &BTreeMap<String, String>,
    member_type: MemberType,
    expressions: &mut Vec<Expression>,
) -> Result<(usize, usize), SelectorError> {
    for (key, value) in match_labels {
        add_operator_if_needed(expressions, Conjunction::And);
        expressions.push(condition(member_type, format!("{key}|{value}"), None));
    }
    let mut appended = 0;
    for expr in match_expressions.iter().filter(|e| e.operator != selector_op::IN) {
        add_operator_if_needed(expressions, Conjunction::And);
        expressions.push(match_expression_condition(expr, member_type)?);
        appended += 1;
    }
    Ok((match_labels.len(), appended))
}

/// Returns one `key|value` condition per value of the `In` expression in
/// `match_expressions`, or nothing if there is none.
pub fn op_in_conditions(
    match_expressions: &[k8s::LabelSelectorRequirement],
    member_type: MemberType,
) -> Vec<Expression> {
    match_expressions
        .iter()
        .filter(|e| e.operator == selector_op::IN)
        .flat_map(|e| {
            e.values
                .iter()
                .flatten()
                .map(move |v| condition(member_type, format!("{}|{v}", e.key), None))
        })
        .collect()
}

/// Expands a selector into its criteria.
///
/// Each criterion is `base`, then one condition from every non-empty `In`
/// axis, then `conditions`. With several axes the criteria are their cross
/// product; with none there is exactly one criterion.
pub fn expand_criteria(
    base: Expression,
    op_in_axes: &[Vec<Expression>],
    conditions: &[Expression],
) -> Vec<Vec<Expression>> {
    let mut criteria = vec![vec![base]];
    for axis in op_in_axes.iter().filter(|a| !a.is_empty()) {
        criteria = criteria
            .iter()
            .flat_map(|prefix| {
                axis.iter().map(move |cond| {
                    let mut criterion = prefix.clone();
                    add_operator_if_needed(&mut criterion, Conjunction::And);
                    criterion.push(cond.clone());
                    criterion
                })
            })
            .collect();
    }
    if !conditions.is_empty() {
        for criterion in &mut criteria {
            add_operator_if_needed(criterion, Conjunction::And);
            criterion.extend(conditions.iter().cloned());
        }
    }
    criteria
}

/// Appends conditions for two member types in one criterion, e.g. a pod
/// selector (`member_type`) scoped by a namespace selector (`ns_member_type`).
pub fn update_mixed_expressions_match_expression(
    ns_match_expressions: &[k8s::LabelSelectorRequirement],
    ns_match_labels: &BTreeMap<String, String>,
    match_expressions: &[k8s::LabelSelectorRequirement],
    match_labels: &BTreeMap<String, String>,
    ns_member_type: MemberType,
    member_type: MemberType,
    expressions: &mut Vec<Expression>,
) -> Result<(usize, usize), SelectorError> {
    let (labels, exprs) = update_expressions_match_expression(
        match_expressions,
        match_labels,
        member_type,
        expressions,
    )?;
    let (ns_labels, ns_exprs) = update_expressions_match_expression(
        ns_match_expressions,
        ns_match_labels,
        ns_member_type,
        expressions,
    )?;
    Ok((labels + ns_labels, exprs + ns_exprs))
}

fn match_expression_condition(
    expr: &k8s::LabelSelectorRequirement,
    member_type: MemberType,
) -> Result<Expression, SelectorError> {
    let joined = || expr.values.iter().flatten().cloned().collect::<Vec<_>>().join(",");
    let (value, scope_op) = match expr.operator.as_str() {
        selector_op::NOT_IN => (format!("{}|{}", expr.key, joined()), "NOTIN"),
        selector_op::EXISTS => (format!("{}|", expr.key), "EQUALS"),
        selector_op::DOES_NOT_EXIST => (format!("{}|", expr.key), "NOTEQUALS"),
        op => return Err(SelectorError::UnsupportedOperator(op.to_string())),
    };
    Ok(condition(member_type, value, Some(scope_op)))
}

/// Renders a selector in the Kubernetes API's label-selector query syntax.
pub fn selector_to_query(selector: &k8s::LabelSelector) -> Result<String, SelectorError> {
    let mut terms = Vec::new();
    for (key, value) in selector.match_labels.iter().flatten() {
        terms.push(format!("{key}={value}"));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.iter().flatten().cloned().collect::<Vec<_>>().join(",");
        let term = match expr.operator.as_str() {
            selector_op::IN => format!("{} in ({values})", expr.key),
            selector_op::NOT_IN => format!("{} notin ({values})", expr.key),
            selector_op::EXISTS => expr.key.clone(),
            selector_op::DOES_NOT_EXIST => format!("!{}", expr.key),
            op => return Err(SelectorError::UnsupportedOperator(op.to_string())),
        };
        terms.push(term);
    }
    Ok(terms.join(","))
}

// === impl GroupExpression ===

impl GroupExpression {
    /// Adds the criteria of one selector, each joined to prior entries with
    /// `OR`.
    pub fn push_criteria(
        &mut self,
        criteria: Vec<Vec<Expression>>,
        counts: Counts,
    ) -> Result<(), SelectorError> {
        debug_assert_eq!(criteria.len(), counts.criteria);
        let criteria_count = self.criteria + counts.criteria;
        if criteria_count > MAX_CRITERIA {
            return Err(SelectorError::TooManyCriteria {
                count: criteria_count,
                limit: MAX_CRITERIA,
            });
        }
        let total = self.expressions + counts.expressions;
        if total > MAX_TOTAL_CRITERIA_EXPRESSIONS {
            return Err(SelectorError::TooManyExpressions {
                count: total,
                limit: MAX_TOTAL_CRITERIA_EXPRESSIONS,
            });
        }
        self.criteria = criteria_count;
        self.expressions = total;

        for expressions in criteria {
            add_operator_if_needed(&mut self.expression, Conjunction::Or);
            self.expression
                .push(Expression::NestedExpression(NestedExpression { expressions }));
        }
        Ok(())
    }

    /// Adds literal addresses, joined to prior entries with `OR`.
    pub fn push_ip_addresses(&mut self, ip_addresses: Vec<String>) {
        if ip_addresses.is_empty() {
            return;
        }
        add_operator_if_needed(&mut self.expression, Conjunction::Or);
        self.expression
            .push(Expression::IpAddressExpression(IpAddressExpression { ip_addresses }));
    }

    pub fn is_empty(&self) -> bool {
        self.expression.is_empty()
    }

    pub fn into_expression(self) -> Vec<Expression> {
        self.expression
    }
}

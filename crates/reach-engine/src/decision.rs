//! Robust decision evaluation under uncertainty.
//!
//! Each action is scored three ways over a utility table:
//! - worst-case utility (maximin)
//! - maximum regret against the best action per scenario
//! - worst-case over the adversarial scenarios (all scenarios if none are marked)
//!
//! Scores are normalized to `[0, 1]`, regret inverted, and combined with
//! fixed weights. Ranking breaks ties by ascending action id, so the result
//! is independent of input order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use reach_core::canon::{canonical_hash, normalize_float};
use reach_core::error::ReachError;

pub const TIE_BREAK_RULE: &str = "lexicographic_by_action_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOption {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    /// `None` means unweighted.
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub adversarial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub actions: Vec<ActionOption>,
    pub scenarios: Vec<Scenario>,
    /// `(action_id, scenario_id, utility)`. Pairs not listed score 0.
    pub outcomes: Vec<(String, String, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedAction {
    pub action_id: String,
    pub score_worst_case: f64,
    pub score_minimax_regret: f64,
    pub score_adversarial: f64,
    pub composite_score: f64,
    pub recommended: bool,
    /// 1 is best.
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeWeights {
    pub worst_case: f64,
    pub minimax_regret: f64,
    pub adversarial: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            worst_case: 0.4,
            minimax_regret: 0.4,
            adversarial: 0.2,
        }
    }
}

type Table = BTreeMap<String, BTreeMap<String, f64>>;

/// Intermediate tables, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub utility_table: Table,
    pub worst_case_table: BTreeMap<String, f64>,
    pub regret_table: Table,
    pub max_regret_table: BTreeMap<String, f64>,
    pub adversarial_table: BTreeMap<String, f64>,
    pub composite_weights: CompositeWeights,
    pub tie_break_rule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub ranked_actions: Vec<RankedAction>,
    /// Canonical hash of the input.
    pub determinism_fingerprint: String,
    pub trace: DecisionTrace,
}

impl DecisionOutput {
    pub fn recommended_action_id(&self) -> Option<&str> {
        self.ranked_actions
            .iter()
            .find(|a| a.recommended)
            .map(|a| a.action_id.as_str())
    }
}

/// How far one scenario's utilities must move before the top action changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlipDistance {
    pub variable_id: String,
    pub flip_distance: f64,
    pub new_top_action: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionError {
    #[error("No actions provided")]
    NoActions,
    #[error("No scenarios provided")]
    NoScenarios,
    #[error("Missing outcome for action '{action}' in scenario '{scenario}'")]
    MissingOutcome { action: String, scenario: String },
    #[error("Negative probability {probability} for scenario '{scenario}'")]
    NegativeProbability { scenario: String, probability: f64 },
    #[error("Invalid probability distribution: sum = {sum}")]
    InvalidProbabilities { sum: f64 },
    #[error("Input has no canonical form: {0}")]
    Unhashable(String),
}

impl From<DecisionError> for ReachError {
    fn from(e: DecisionError) -> Self {
        match e {
            DecisionError::NoActions
            | DecisionError::NoScenarios
            | DecisionError::MissingOutcome { .. }
            | DecisionError::Unhashable(_) => ReachError::Schema(e.to_string()),
            DecisionError::NegativeProbability { .. }
            | DecisionError::InvalidProbabilities { .. } => ReachError::InvalidInput(e.to_string()),
        }
    }
}

fn check_probabilities(scenarios: &[Scenario]) -> Result<(), DecisionError> {
    let mut sum = 0.0;
    let mut all_given = true;
    for s in scenarios {
        match s.probability {
            Some(p) if p < 0.0 || p.is_nan() => {
                return Err(DecisionError::NegativeProbability {
                    scenario: s.id.clone(),
                    probability: p,
                })
            }
            Some(p) => sum += p,
            None => all_given = false,
        }
    }
    if all_given && (sum - 1.0).abs() > 1e-6 {
        return Err(DecisionError::InvalidProbabilities {
            sum: normalize_float(sum),
        });
    }
    Ok(())
}

fn build_utility_table(input: &DecisionInput) -> Result<Table, DecisionError> {
    let scenario_ids: BTreeSet<&str> = input.scenarios.iter().map(|s| s.id.as_str()).collect();
    let mut table: Table = input
        .actions
        .iter()
        .map(|a| {
            let row = input
                .scenarios
                .iter()
                .map(|s| (s.id.clone(), 0.0))
                .collect();
            (a.id.clone(), row)
        })
        .collect();

    for (action, scenario, utility) in &input.outcomes {
        let row = table
            .get_mut(action)
            .filter(|_| scenario_ids.contains(scenario.as_str()))
            .ok_or_else(|| DecisionError::MissingOutcome {
                action: action.clone(),
                scenario: scenario.clone(),
            })?;
        row.insert(scenario.clone(), normalize_float(*utility));
    }
    Ok(table)
}

fn min_of<I: Iterator<Item = f64>>(values: I) -> f64 {
    values.fold(f64::INFINITY, f64::min)
}

fn max_of<I: Iterator<Item = f64>>(values: I) -> f64 {
    values.fold(f64::NEG_INFINITY, f64::max)
}

fn normalize_to_range(value: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < 1e-12 {
        return 1.0;
    }
    normalize_float((value - min) / (max - min))
}

/// Evaluate and rank the actions of `input`.
pub fn evaluate_decision(input: &DecisionInput) -> Result<DecisionOutput, DecisionError> {
    if input.actions.is_empty() {
        return Err(DecisionError::NoActions);
    }
    if input.scenarios.is_empty() {
        return Err(DecisionError::NoScenarios);
    }
    check_probabilities(&input.scenarios)?;

    let utility_table = build_utility_table(input)?;

    let worst_case_table: BTreeMap<String, f64> = utility_table
        .iter()
        .map(|(a, row)| (a.clone(), normalize_float(min_of(row.values().copied()))))
        .collect();

    let best_per_scenario: BTreeMap<&str, f64> = input
        .scenarios
        .iter()
        .map(|s| {
            let best = max_of(utility_table.values().filter_map(|r| r.get(&s.id)).copied());
            (s.id.as_str(), normalize_float(best))
        })
        .collect();

    let regret_table: Table = utility_table
        .iter()
        .map(|(a, row)| {
            let regrets = row
                .iter()
                .map(|(s, u)| {
                    let best = best_per_scenario.get(s.as_str()).copied().unwrap_or(0.0);
                    (s.clone(), normalize_float(best - u))
                })
                .collect();
            (a.clone(), regrets)
        })
        .collect();

    let max_regret_table: BTreeMap<String, f64> = regret_table
        .iter()
        .map(|(a, row)| (a.clone(), normalize_float(row.values().copied().fold(0.0, f64::max))))
        .collect();

    let adversarial: BTreeSet<&str> = input
        .scenarios
        .iter()
        .filter(|s| s.adversarial)
        .map(|s| s.id.as_str())
        .collect();
    let adversarial_table: BTreeMap<String, f64> = utility_table
        .iter()
        .map(|(a, row)| {
            let worst = min_of(
                row.iter()
                    .filter(|(s, _)| adversarial.is_empty() || adversarial.contains(s.as_str()))
                    .map(|(_, u)| *u),
            );
            (a.clone(), normalize_float(worst))
        })
        .collect();

    let bounds = |t: &BTreeMap<String, f64>| (min_of(t.values().copied()), max_of(t.values().copied()));
    let (wc_min, wc_max) = bounds(&worst_case_table);
    let (mr_min, mr_max) = bounds(&max_regret_table);
    let (adv_min, adv_max) = bounds(&adversarial_table);

    let weights = CompositeWeights::default();
    let mut ranked: Vec<RankedAction> = input
        .actions
        .iter()
        .map(|action| {
            let wc = worst_case_table.get(&action.id).copied().unwrap_or(0.0);
            let mr = max_regret_table.get(&action.id).copied().unwrap_or(0.0);
            let adv = adversarial_table.get(&action.id).copied().unwrap_or(0.0);
            let composite = normalize_float(
                weights.worst_case * normalize_to_range(wc, wc_min, wc_max)
                    + weights.minimax_regret * (1.0 - normalize_to_range(mr, mr_min, mr_max))
                    + weights.adversarial * normalize_to_range(adv, adv_min, adv_max),
            );
            RankedAction {
                action_id: action.id.clone(),
                score_worst_case: wc,
                score_minimax_regret: mr,
                score_adversarial: adv,
                composite_score: composite,
                recommended: false,
                rank: 0,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.composite_score
            .total_cmp(&a.composite_score)
            .then_with(|| a.action_id.cmp(&b.action_id))
    });
    for (i, action) in ranked.iter_mut().enumerate() {
        action.rank = i + 1;
        action.recommended = i == 0;
    }

    Ok(DecisionOutput {
        ranked_actions: ranked,
        determinism_fingerprint: input_fingerprint(input)?,
        trace: DecisionTrace {
            utility_table,
            worst_case_table,
            regret_table,
            max_regret_table,
            adversarial_table,
            composite_weights: weights,
            tie_break_rule: TIE_BREAK_RULE.to_string(),
        },
    })
}

/// Canonical hash of the input, floats normalized.
pub fn input_fingerprint(input: &DecisionInput) -> Result<String, DecisionError> {
    let value =
        serde_json::to_value(input).map_err(|e| DecisionError::Unhashable(e.to_string()))?;
    canonical_hash(&value).map_err(|e| DecisionError::Unhashable(e.to_string()))
}

/// Per-scenario distance to the nearest alternative top action, ascending.
pub fn compute_flip_distances(input: &DecisionInput, output: &DecisionOutput) -> Vec<FlipDistance> {
    let Some(top) = output.recommended_action_id() else {
        return Vec::new();
    };
    let utility = |action: &str, scenario: &str| {
        output
            .trace
            .utility_table
            .get(action)
            .and_then(|r| r.get(scenario))
            .copied()
            .unwrap_or(0.0)
    };

    let mut flips: Vec<FlipDistance> = input
        .scenarios
        .iter()
        .filter_map(|s| {
            let top_utility = utility(top, &s.id);
            input
                .actions
                .iter()
                .filter(|a| a.id != top)
                .map(|a| {
                    let d = normalize_float((top_utility - utility(&a.id, &s.id)).abs() / 100.0);
                    (a.id.clone(), d)
                })
                .min_by(|x, y| x.1.total_cmp(&y.1).then_with(|| x.0.cmp(&y.0)))
                .map(|(new_top, d)| FlipDistance {
                    variable_id: s.id.clone(),
                    flip_distance: d,
                    new_top_action: new_top,
                })
        })
        .collect();

    flips.sort_by(|a, b| {
        a.flip_distance
            .total_cmp(&b.flip_distance)
            .then_with(|| a.variable_id.cmp(&b.variable_id))
    });
    flips
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> DecisionInput {
        serde_json::from_value(v).unwrap()
    }

    fn two_by_two() -> DecisionInput {
        parse(json!({
            "actions": [{"id": "a1"}, {"id": "a2"}],
            "scenarios": [
                {"id": "s1", "probability": 0.5},
                {"id": "s2", "probability": 0.5, "adversarial": true}
            ],
            "outcomes": [
                ["a1", "s1", 100.0], ["a1", "s2", 20.0],
                ["a2", "s1", 60.0], ["a2", "s2", 60.0]
            ]
        }))
    }

    #[test]
    fn test_robust_action_wins() {
        let out = evaluate_decision(&two_by_two()).unwrap();
        assert_eq!(out.recommended_action_id(), Some("a2"));
        assert_eq!(out.ranked_actions[0].rank, 1);
        assert_eq!(out.trace.worst_case_table["a1"], 20.0);
        assert_eq!(out.trace.max_regret_table["a1"], 40.0);
        assert_eq!(out.trace.max_regret_table["a2"], 40.0);
        assert_eq!(out.trace.tie_break_rule, TIE_BREAK_RULE);
    }

    #[test]
    fn test_ties_break_by_action_id() {
        let input = parse(json!({
            "actions": [{"id": "zulu"}, {"id": "alpha"}, {"id": "mike"}],
            "scenarios": [{"id": "s"}],
            "outcomes": [["zulu", "s", 5.0], ["alpha", "s", 5.0], ["mike", "s", 5.0]]
        }));
        let out = evaluate_decision(&input).unwrap();
        let order: Vec<_> = out.ranked_actions.iter().map(|a| a.action_id.as_str()).collect();
        assert_eq!(order, vec!["alpha", "mike", "zulu"]);
        assert!(out.ranked_actions[0].recommended);
        assert!(!out.ranked_actions[1].recommended);
    }

    #[test]
    fn test_input_order_does_not_change_ranking() {
        let a = two_by_two();
        let mut b = two_by_two();
        b.actions.reverse();
        b.outcomes.reverse();
        let oa = evaluate_decision(&a).unwrap();
        let ob = evaluate_decision(&b).unwrap();
        assert_eq!(oa.ranked_actions, ob.ranked_actions);
    }

    #[test]
    fn test_noisy_float_fingerprint_matches_rounded() {
        let noisy = parse(json!({
            "actions": [{"id": "a"}],
            "scenarios": [{"id": "s", "probability": 1.0}],
            "outcomes": [["a", "s", 0.30000000000000004]]
        }));
        let clean = parse(json!({
            "actions": [{"id": "a"}],
            "scenarios": [{"id": "s", "probability": 1.0}],
            "outcomes": [["a", "s", 0.3]]
        }));
        let fa = evaluate_decision(&noisy).unwrap().determinism_fingerprint;
        let fb = evaluate_decision(&clean).unwrap().determinism_fingerprint;
        assert_eq!(fa, fb);
        assert_eq!(fa.len(), 64);
    }

    #[test]
    fn test_fingerprint_is_stable_across_runs() {
        let fps: Vec<_> = (0..5)
            .map(|_| evaluate_decision(&two_by_two()).unwrap().determinism_fingerprint)
            .collect();
        assert!(fps.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(input_fingerprint(&two_by_two()).unwrap(), fps[0]);
    }

    #[test]
    fn test_unhashable_maps_to_schema_error() {
        let err: ReachError = DecisionError::Unhashable("depth".into()).into();
        assert_eq!(err.code(), "E_SCHEMA");
    }

    #[test]
    fn test_empty_inputs() {
        let no_actions = parse(json!({"actions": [], "scenarios": [{"id": "s"}], "outcomes": []}));
        assert_eq!(evaluate_decision(&no_actions).unwrap_err(), DecisionError::NoActions);
        let no_scenarios = parse(json!({"actions": [{"id": "a"}], "scenarios": [], "outcomes": []}));
        assert_eq!(evaluate_decision(&no_scenarios).unwrap_err(), DecisionError::NoScenarios);
    }

    #[test]
    fn test_unknown_outcome_reference() {
        let input = parse(json!({
            "actions": [{"id": "a"}],
            "scenarios": [{"id": "s"}],
            "outcomes": [["a", "ghost", 1.0]]
        }));
        let err = evaluate_decision(&input).unwrap_err();
        assert!(matches!(err, DecisionError::MissingOutcome { .. }));
        assert_eq!(ReachError::from(err).code(), "E_SCHEMA");
    }

    #[test]
    fn test_negative_probability_is_invalid_input() {
        let input = parse(json!({
            "actions": [{"id": "a"}],
            "scenarios": [{"id": "s", "probability": -0.1}],
            "outcomes": []
        }));
        let err = evaluate_decision(&input).unwrap_err();
        assert_eq!(ReachError::from(err).code(), "E_INVALID_INPUT");
    }

    #[test]
    fn test_probabilities_must_sum_to_one() {
        let input = parse(json!({
            "actions": [{"id": "a"}],
            "scenarios": [{"id": "s1", "probability": 0.5}, {"id": "s2", "probability": 0.2}],
            "outcomes": []
        }));
        assert!(matches!(
            evaluate_decision(&input).unwrap_err(),
            DecisionError::InvalidProbabilities { .. }
        ));
    }

    #[test]
    fn test_flip_distances() {
        let input = two_by_two();
        let out = evaluate_decision(&input).unwrap();
        let flips = compute_flip_distances(&input, &out);
        assert_eq!(flips.len(), 2);
        assert_eq!(flips[0].variable_id, "s1");
        assert_eq!(flips[0].flip_distance, 0.4);
        assert_eq!(flips[0].new_top_action, "a1");
        assert_eq!(flips[1].flip_distance, 0.4);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn input(utils: &[f64], reversed: bool) -> DecisionInput {
            let mut actions: Vec<ActionOption> = ["a", "b", "c"]
                .iter()
                .map(|id| ActionOption {
                    id: id.to_string(),
                    label: String::new(),
                })
                .collect();
            if reversed {
                actions.reverse();
            }
            let scenarios = ["x", "y"]
                .iter()
                .map(|id| Scenario {
                    id: id.to_string(),
                    probability: None,
                    adversarial: false,
                })
                .collect();
            let mut outcomes = Vec::new();
            for (i, a) in ["a", "b", "c"].iter().enumerate() {
                for (j, s) in ["x", "y"].iter().enumerate() {
                    outcomes.push((a.to_string(), s.to_string(), utils[i * 2 + j]));
                }
            }
            DecisionInput {
                id: None,
                actions,
                scenarios,
                outcomes,
            }
        }

        proptest! {
            #[test]
            fn test_ranking_ignores_action_order(utils in prop::collection::vec(-1000.0f64..1000.0, 6)) {
                let forward = evaluate_decision(&input(&utils, false)).unwrap();
                let backward = evaluate_decision(&input(&utils, true)).unwrap();
                let ids = |o: &DecisionOutput| o.ranked_actions.iter().map(|a| a.action_id.clone()).collect::<Vec<_>>();
                prop_assert_eq!(ids(&forward), ids(&backward));
                prop_assert_eq!(forward.ranked_actions.iter().filter(|a| a.recommended).count(), 1);
                for a in &forward.ranked_actions {
                    prop_assert!((0.0..=1.0).contains(&a.composite_score));
                }
            }
        }
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GuardrailConfig;
use crate::domain::deal::DealTerms;
use crate::domain::policy::Policy;
use crate::guardrails::{GuardrailEvaluator, GuardrailVerdict, PolicySnapshot};

/// A what-if deal fed to the simulator. The optional id and name only label
/// the result row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationDeal {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub terms: DealTerms,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DealSimulation {
    pub deal_id: Option<String>,
    pub deal_name: Option<String>,
    pub verdict: GuardrailVerdict,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationSummary {
    pub total_deals: usize,
    pub passed_deals: usize,
    pub failed_deals: usize,
    pub pass_rate: f64,
    pub total_violations: usize,
    pub violation_types: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationReport {
    pub evaluations: Vec<DealSimulation>,
    pub summary: SimulationSummary,
}

pub fn summarize(evaluations: &[DealSimulation]) -> SimulationSummary {
    let total_deals = evaluations.len();
    let passed_deals =
        evaluations.iter().filter(|evaluation| evaluation.verdict.is_pass()).count();

    let mut total_violations = 0;
    let mut violation_types: BTreeMap<String, usize> = BTreeMap::new();
    for evaluation in evaluations {
        for violation in &evaluation.verdict.violations {
            total_violations += 1;
            *violation_types.entry(violation.check.as_str().to_string()).or_insert(0) += 1;
        }
    }

    SimulationSummary {
        total_deals,
        passed_deals,
        failed_deals: total_deals - passed_deals,
        pass_rate: if total_deals > 0 {
            passed_deals as f64 / total_deals as f64
        } else {
            0.0
        },
        total_violations,
        violation_types,
    }
}

/// Previews a proposed policy against what-if deals. The proposed policy is
/// substituted into the snapshot in place of any active policy with its
/// (type, scope); nothing is written anywhere.
pub struct SimulationEngine {
    evaluator: GuardrailEvaluator,
}

impl SimulationEngine {
    pub fn new(limits: GuardrailConfig) -> Self {
        Self { evaluator: GuardrailEvaluator::new(limits) }
    }

    pub fn simulate(
        &self,
        proposed: &Policy,
        test_deals: &[SimulationDeal],
        snapshot: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> SimulationReport {
        let preview = snapshot.with_substitution(proposed);

        let evaluations: Vec<DealSimulation> = test_deals
            .iter()
            .map(|deal| DealSimulation {
                deal_id: deal.id.clone(),
                deal_name: deal.name.clone(),
                verdict: self.evaluator.evaluate(&deal.terms, &preview, now),
            })
            .collect();
        let summary = summarize(&evaluations);

        SimulationReport { evaluations, summary }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::estimator::strip_code_fences;

const DISCLAIMER: &str = "These cost estimates are indicative only. Actual costs may vary due to regional pricing differences, varying usage patterns, and changes in provider pricing. This tool is designed to provide a general guideline for the cost impact of IaC changes and should not be used as the sole basis for financial or operational decisions.";

/// One resource of a model answer. Every field is optional: a missing or
/// null cost counts as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub resource_name: Option<String>,
    pub resource_type: Option<String>,
    pub change_to_resource: Option<String>,
    pub base_cost_analysis: Option<String>,
    pub base_cost: Option<f64>,
    pub average_usage_assumptions_and_analysis: Option<String>,
    pub average_usage_cost: Option<f64>,
    pub high_usage_assumptions_and_analysis: Option<String>,
    pub high_usage_cost: Option<f64>,
    pub low_usage_assumptions_and_analysis: Option<String>,
    pub low_usage_cost: Option<f64>,
    pub notes: Option<Vec<String>>,
}

/// A validated model answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimationResult {
    pub analysis_note: Option<String>,
    pub resources: Vec<ResourceEstimate>,
    /// Elements of `resources` that did not match the resource shape.
    pub dropped_resources: usize,
}

impl EstimationResult {
    /// Parses an answer. The answer must be a JSON object with a `resources`
    /// list; elements of that list are validated one by one and malformed
    /// ones dropped.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text.trim()).context("Analysis is not valid JSON")?;
        let object = value
            .as_object()
            .context("Analysis is not a JSON object")?;
        let raw_resources = object
            .get("resources")
            .and_then(Value::as_array)
            .context("Analysis has no `resources` list")?;

        let analysis_note = object
            .get("analysis_note")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut resources = Vec::with_capacity(raw_resources.len());
        let mut dropped_resources = 0;
        for (index, raw) in raw_resources.iter().enumerate() {
            match serde_json::from_value::<ResourceEstimate>(raw.clone()) {
                Ok(resource) => resources.push(resource),
                Err(err) => {
                    warn!("Dropping malformed resource #{}: {}", index, err);
                    dropped_resources += 1;
                }
            }
        }

        Ok(Self {
            analysis_note,
            resources,
            dropped_resources,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCosts {
    pub low: f64,
    pub average: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierCosts {
    pub base: f64,
    pub low: f64,
    pub average: f64,
    pub high: f64,
}

impl TierCosts {
    fn minus(&self, other: &TierCosts) -> TierCosts {
        TierCosts {
            base: self.base - other.base,
            low: self.low - other.low,
            average: self.average - other.average,
            high: self.high - other.high,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostRow {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub costs: TierCosts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deltas: Option<TierCosts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assumptions {
    pub low: Vec<String>,
    pub average: Vec<String>,
    pub high: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostReport {
    pub total_base_cost: f64,
    pub variable_costs: UsageCosts,
    pub service_changes: Vec<String>,
    pub detailed_costs: Vec<CostRow>,
    pub assumptions: Assumptions,
    pub notes: Vec<String>,
    pub analysis_notes: Vec<String>,
    pub analyses_parsed: usize,
    pub skipped_analyses: Vec<usize>,
}

pub struct CostAggregator;

impl CostAggregator {
    /// Folds every answer that parses into one report. Answers that do not
    /// parse are logged by index and contribute nothing.
    pub fn aggregate<S: AsRef<str>>(analyses: &[S]) -> CostReport {
        Self::aggregate_indexed(analyses.iter().enumerate())
    }

    /// Like `aggregate`, but each answer carries the index reported for it
    /// when it is skipped.
    pub fn aggregate_indexed<I, S>(analyses: I) -> CostReport
    where
        I: IntoIterator<Item = (usize, S)>,
        S: AsRef<str>,
    {
        let mut report = CostReport::default();

        for (index, analysis) in analyses {
            match EstimationResult::parse(&strip_code_fences(analysis.as_ref())) {
                Ok(result) => {
                    debug!(
                        "Analysis #{}: {} resources ({} dropped)",
                        index,
                        result.resources.len(),
                        result.dropped_resources
                    );
                    report.absorb(result);
                }
                Err(err) => {
                    warn!("Skipping analysis #{}: {:#}", index, err);
                    report.skipped_analyses.push(index);
                }
            }
        }

        report
    }
}

impl CostReport {
    fn absorb(&mut self, result: EstimationResult) {
        self.analyses_parsed += 1;
        push_text(&mut self.analysis_notes, result.analysis_note.as_deref());

        for resource in result.resources {
            let costs = TierCosts {
                base: resource.base_cost.unwrap_or(0.0),
                low: resource.low_usage_cost.unwrap_or(0.0),
                average: resource.average_usage_cost.unwrap_or(0.0),
                high: resource.high_usage_cost.unwrap_or(0.0),
            };

            self.total_base_cost += costs.base;
            self.variable_costs.low += costs.low;
            self.variable_costs.average += costs.average;
            self.variable_costs.high += costs.high;

            push_text(&mut self.service_changes, resource.change_to_resource.as_deref());
            push_text(
                &mut self.assumptions.low,
                resource.low_usage_assumptions_and_analysis.as_deref(),
            );
            push_text(
                &mut self.assumptions.average,
                resource.average_usage_assumptions_and_analysis.as_deref(),
            );
            push_text(
                &mut self.assumptions.high,
                resource.high_usage_assumptions_and_analysis.as_deref(),
            );
            for note in resource.notes.iter().flatten() {
                push_text(&mut self.notes, Some(note));
            }

            let service = [&resource.resource_name, &resource.resource_type]
                .into_iter()
                .flatten()
                .map(|s| s.trim())
                .find(|s| !s.is_empty())
                .unwrap_or("unnamed resource")
                .to_string();
            self.detailed_costs.push(CostRow {
                service,
                resource_type: resource.resource_type,
                costs,
                deltas: None,
            });
        }
    }

    /// Sets per-row deltas against an earlier report. Rows pair up by
    /// service name in order; a row without a counterpart is all new cost.
    pub fn apply_baseline(&mut self, baseline: &CostReport) {
        let mut used = vec![false; baseline.detailed_costs.len()];

        for row in &mut self.detailed_costs {
            let previous = baseline
                .detailed_costs
                .iter()
                .enumerate()
                .find(|(i, candidate)| !used[*i] && candidate.service == row.service)
                .map(|(i, candidate)| (i, candidate.costs));

            row.deltas = Some(match previous {
                Some((i, costs)) => {
                    used[i] = true;
                    row.costs.minus(&costs)
                }
                None => row.costs,
            });
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str("## Cost Estimation\n\n");
        output.push_str("**Quick Summary**:\n");
        output.push_str(&format!("- **Base Cost**: {}\n\n", format_money(self.total_base_cost)));
        output.push_str("- **Variable Cost**:\n");
        output.push_str(&format!("  - **Low Usage**: {}\n", format_money(self.variable_costs.low)));
        output.push_str(&format!(
            "  - **Average Usage**: {}\n",
            format_money(self.variable_costs.average)
        ));
        output.push_str(&format!("  - **High Usage**: {}\n\n", format_money(self.variable_costs.high)));

        output.push_str("**Service Changes**:\n");
        if self.service_changes.is_empty() {
            output.push_str("No service changes detected.\n");
        } else {
            for change in &self.service_changes {
                output.push_str(&format!("- {}\n", single_line(change)));
            }
        }
        output.push('\n');

        output.push_str("### Cost Summary\n");
        output.push_str(&self.cost_table());
        output.push('\n');

        output.push_str("**Assumptions**:\n");
        for (label, items) in [
            ("Low", &self.assumptions.low),
            ("Average", &self.assumptions.average),
            ("High", &self.assumptions.high),
        ] {
            output.push_str(&format!("- **{} Usage**:\n", label));
            if items.is_empty() {
                output.push_str(&format!(
                    "  - No {} usage assumptions provided.\n",
                    label.to_lowercase()
                ));
            } else {
                for item in items {
                    output.push_str(&format!("  - {}\n", single_line(item)));
                }
            }
        }
        output.push('\n');

        output.push_str("**Notes**:\n");
        if self.analysis_notes.is_empty() && self.notes.is_empty() {
            output.push_str("- No additional notes.\n");
        } else {
            // Per-answer notes lead, resource notes follow
            for note in self.analysis_notes.iter().chain(&self.notes) {
                output.push_str(&format!("- {}\n", single_line(note)));
            }
        }
        output.push('\n');

        output.push_str("**Disclaimer**: ⚠️\n");
        output.push_str(DISCLAIMER);
        output.push('\n');

        output
    }

    fn cost_table(&self) -> String {
        if self.detailed_costs.is_empty() {
            return "No resource cost details available.\n".to_string();
        }

        let headers = [
            "**Service**",
            "**Base Cost**",
            "**Low Usage**",
            "**Average Usage**",
            "**High Usage**",
        ];
        let mut table = format!("| {} |\n", headers.join(" | "));
        table.push_str(&format!(
            "| {} |\n",
            headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
        ));

        for row in &self.detailed_costs {
            let cell = |value: f64, delta: Option<f64>| match delta {
                Some(delta) => format!("{} ({})", format_money(value), format_delta(delta)),
                None => format_money(value),
            };
            let deltas = row.deltas.as_ref();
            let cells = [
                row.service.replace('|', "\\|"),
                cell(row.costs.base, deltas.map(|d| d.base)),
                cell(row.costs.low, deltas.map(|d| d.low)),
                cell(row.costs.average, deltas.map(|d| d.average)),
                cell(row.costs.high, deltas.map(|d| d.high)),
            ];
            table.push_str(&format!("| {} |\n", cells.join(" | ")));
        }

        table
    }
}

/// Markdown body posted to the pull request.
pub fn render_markdown(report: &CostReport) -> String {
    report.to_markdown()
}

fn push_text(target: &mut Vec<String>, text: Option<&str>) {
    if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
        target.push(text.to_string());
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn round_cents(value: f64) -> f64 {
    let rounded = (value * 100.0).round() / 100.0;
    // Avoid rendering "-0.00"
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// `$x.xx`, with negative amounts as `-$x.xx`.
pub fn format_money(value: f64) -> String {
    let value = round_cents(value);
    if value < 0.0 {
        format!("-${:.2}", -value)
    } else {
        format!("${:.2}", value)
    }
}

/// Signed change: `+$x.xx`, `-$x.xx`, or `no Δ` when it rounds to zero.
pub fn format_delta(delta: f64) -> String {
    let delta = round_cents(delta);
    if delta == 0.0 {
        "no Δ".to_string()
    } else if delta > 0.0 {
        format!("+${:.2}", delta)
    } else {
        format!("-${:.2}", -delta)
    }
}

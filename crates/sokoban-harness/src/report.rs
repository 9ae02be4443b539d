//! Batch report rendering.

use std::collections::HashMap;
use std::fmt::Write;

use serde::Serialize;

use crate::corpus::PuzzleInstance;
use crate::puzzle::{metric, Board, BoardMetrics};
use crate::scheduler::{BatchResult, ExecutionOutcome};
use crate::stats::{self, CategorySummary, MeasuredOutcome};

/// Board metrics shown per category
pub const REPORTED_METRICS: [&str; 4] = [
    metric::FREE,
    metric::WALLS,
    metric::BOXES,
    metric::TARGETS,
];

/// Metrics for every level that parses. Levels that don't are skipped and
/// end up with an empty metric set in the report.
pub fn measure(instances: &[PuzzleInstance]) -> HashMap<u32, BoardMetrics> {
    instances
        .iter()
        .filter_map(|instance| {
            let board = Board::parse(&instance.raw_text).ok()?;
            Some((instance.identifier, BoardMetrics::from_board(&board)))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    #[serde(flatten)]
    pub result: BatchResult,
    pub categories: Vec<CategorySummary>,
}

impl BatchReport {
    pub fn new(result: BatchResult, categories: Vec<CategorySummary>) -> Self {
        Self { result, categories }
    }

    /// Summarise a finished batch over the default categories
    pub fn summarize(result: BatchResult, metrics: &HashMap<u32, BoardMetrics>) -> Self {
        let records: Vec<MeasuredOutcome> = result
            .outcomes
            .iter()
            .map(|outcome| MeasuredOutcome {
                outcome: outcome.clone(),
                metrics: metrics
                    .get(&outcome.identifier())
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        let categories =
            stats::summarize(&records, &stats::default_categories(), &REPORTED_METRICS);
        Self::new(result, categories)
    }

    /// Every executed level passed and the batch ran to the end
    pub fn all_passed(&self) -> bool {
        !self.result.cancelled
            && self.result.executed == self.result.total
            && self.result.passed == self.result.total
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_human(&self) -> String {
        let r = &self.result;
        let mut out = String::new();

        let _ = writeln!(out, "Total:     {}", r.executed);
        let _ = writeln!(out, "Passed:    {}", r.passed);
        let _ = writeln!(out, "Failed:    {}", r.failed);
        let _ = writeln!(out, "Timed out: {}", r.timed_out);
        let _ = writeln!(out, "Time:      {:.1} s", r.elapsed_ms as f64 / 1000.0);
        if r.cancelled {
            let _ = writeln!(
                out,
                "Cancelled: {} of {} levels not run",
                r.total - r.executed,
                r.total
            );
        }

        for category in &self.categories {
            let _ = writeln!(out, "\n{} ({})", category.name, category.count);
            if let Some(elapsed) = category.elapsed_ms {
                let _ = writeln!(out, "  {:<12} {}", "time ms", elapsed);
            }
            for (name, stat) in &category.metrics {
                let _ = writeln!(out, "  {:<12} {}", name, stat);
            }
            if let Some(density) = category.ratio(metric::BOXES, metric::FREE) {
                let _ = writeln!(out, "  {:<12} {}", "box density", density);
            }
        }

        let failures: Vec<&ExecutionOutcome> =
            r.outcomes.iter().filter(|o| !o.is_passed()).collect();
        if !failures.is_empty() {
            let _ = writeln!(out, "\nNot passed:");
            for outcome in failures {
                match outcome {
                    ExecutionOutcome::Failed { identifier, reason } => {
                        let _ = writeln!(out, "  level {}: {}", identifier, reason);
                    }
                    ExecutionOutcome::TimedOut { identifier } => {
                        let _ = writeln!(out, "  level {}: timed out", identifier);
                    }
                    ExecutionOutcome::Passed { .. } => {}
                }
            }
        }

        out
    }
}

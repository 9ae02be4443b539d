//! Batch statistics
//!
//! Groups outcomes into caller-defined categories and computes mean and
//! median of the solve time and of each requested board metric inside every
//! category. Categories nobody falls into are left out of the output.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::puzzle::BoardMetrics;
use crate::scheduler::ExecutionOutcome;

/// Arithmetic mean, `None` for no values
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Median after a full sort: the middle element for an odd count, the
/// average of the two middle elements for an even count
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stat {
    pub mean: f64,
    pub median: f64,
}

impl Stat {
    pub fn of(values: &[f64]) -> Option<Stat> {
        Some(Stat {
            mean: mean(values)?,
            median: median(values)?,
        })
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mean {:.2}, median {:.2}", self.mean, self.median)
    }
}

/// An outcome together with the features of its board
#[derive(Debug, Clone)]
pub struct MeasuredOutcome {
    pub outcome: ExecutionOutcome,
    pub metrics: BoardMetrics,
}

type Predicate = Box<dyn Fn(&ExecutionOutcome) -> bool + Send + Sync>;

/// A named predicate over outcomes. Categories may overlap.
pub struct Category {
    name: String,
    predicate: Predicate,
}

impl Category {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&ExecutionOutcome) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn passed() -> Self {
        Self::new("passed", ExecutionOutcome::is_passed)
    }

    pub fn failed() -> Self {
        Self::new("failed", ExecutionOutcome::is_failed)
    }

    pub fn timed_out() -> Self {
        Self::new("timed out", ExecutionOutcome::is_timed_out)
    }

    /// Passed in strictly less than `limit`
    pub fn solved_within(limit: Duration) -> Self {
        let limit_ms = limit.as_millis() as u64;
        Self::new(format!("solved under {:?}", limit), move |o| {
            o.elapsed_ms().is_some_and(|ms| ms < limit_ms)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, outcome: &ExecutionOutcome) -> bool {
        (self.predicate)(outcome)
    }
}

impl fmt::Debug for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Category").field("name", &self.name).finish()
    }
}

/// The categories reported by the command line front end
pub fn default_categories() -> Vec<Category> {
    vec![
        Category::passed(),
        Category::solved_within(Duration::from_secs(1)),
        Category::failed(),
        Category::timed_out(),
    ]
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub name: String,
    pub count: usize,
    /// Solve time of the members that passed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<Stat>,
    pub metrics: BTreeMap<String, Stat>,
}

impl CategorySummary {
    pub fn metric(&self, name: &str) -> Option<Stat> {
        self.metrics.get(name).copied()
    }

    /// Ratio of two metrics, taken between the aggregated values (mean over
    /// mean, median over median). This is not the mean of per-board ratios.
    pub fn ratio(&self, numerator: &str, denominator: &str) -> Option<Stat> {
        let num = self.metric(numerator)?;
        let den = self.metric(denominator)?;
        if den.mean == 0.0 || den.median == 0.0 {
            return None;
        }
        Some(Stat {
            mean: num.mean / den.mean,
            median: num.median / den.median,
        })
    }
}

/// Summarise `records` per category.
///
/// Output keeps the order of `categories`. A metric missing from some boards
/// is aggregated over the boards that have it, and left out if none do.
pub fn summarize(
    records: &[MeasuredOutcome],
    categories: &[Category],
    metrics: &[&str],
) -> Vec<CategorySummary> {
    let mut summaries = Vec::new();

    for category in categories {
        let members: Vec<&MeasuredOutcome> = records
            .iter()
            .filter(|r| category.matches(&r.outcome))
            .collect();
        if members.is_empty() {
            continue;
        }

        let elapsed: Vec<f64> = members
            .iter()
            .filter_map(|r| r.outcome.elapsed_ms())
            .map(|ms| ms as f64)
            .collect();

        let mut per_metric = BTreeMap::new();
        for &name in metrics {
            let values: Vec<f64> = members.iter().filter_map(|r| r.metrics.get(name)).collect();
            if let Some(stat) = Stat::of(&values) {
                per_metric.insert(name.to_string(), stat);
            }
        }

        summaries.push(CategorySummary {
            name: category.name().to_string(),
            count: members.len(),
            elapsed_ms: Stat::of(&elapsed),
            metrics: per_metric,
        });
    }

    summaries
}

//! Hypothesis tests, effect sizes and confidence intervals

use serde::{Deserialize, Serialize};

use super::distribution::{chi_squared_sf, student_t_two_tailed};
use crate::metrics::{BinaryAggregate, ContinuousAggregate};

/// z for a two-sided 95% interval.
pub const Z_95: f64 = 1.96;

/// Expected cell count below which Yates' correction is applied.
const YATES_THRESHOLD: f64 = 5.0;

/// Outcome of a significance test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestStatistic {
    /// Chi-squared or t statistic
    pub statistic: f64,
    /// Degrees of freedom
    pub degrees_of_freedom: f64,
    /// Two-sided p-value
    pub p_value: f64,
}

/// Chi-squared test of independence on the 2×2 table
/// (control, treatment) × (success, failure), one degree of freedom.
///
/// Yates' continuity correction is applied when any expected cell count is
/// below 5. Returns `None` when a row or column total is zero, where the
/// statistic is undefined.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn chi_squared_2x2(control: BinaryAggregate, treatment: BinaryAggregate) -> Option<TestStatistic> {
    let observed = [
        [control.successes as f64, (control.trials - control.successes) as f64],
        [treatment.successes as f64, (treatment.trials - treatment.successes) as f64],
    ];
    let rows = [control.trials as f64, treatment.trials as f64];
    let columns = [
        observed[0][0] + observed[1][0],
        observed[0][1] + observed[1][1],
    ];
    let total = rows[0] + rows[1];
    if rows.contains(&0.0) || columns.contains(&0.0) {
        return None;
    }

    let expected = |r: usize, c: usize| rows[r] * columns[c] / total;
    let yates = (0..2).any(|r| (0..2).any(|c| expected(r, c) < YATES_THRESHOLD));
    let correction = if yates { 0.5 } else { 0.0 };

    let mut statistic = 0.0;
    for r in 0..2 {
        for c in 0..2 {
            let e = expected(r, c);
            let diff = ((observed[r][c] - e).abs() - correction).max(0.0);
            statistic += diff * diff / e;
        }
    }

    Some(TestStatistic {
        statistic,
        degrees_of_freedom: 1.0,
        p_value: chi_squared_sf(statistic, 1.0),
    })
}

/// Welch's unequal-variance t-test of treatment against control, with
/// Welch–Satterthwaite degrees of freedom.
///
/// Returns `None` when either arm has fewer than two observations or the
/// standard error is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn welch_t_test(
    control: &ContinuousAggregate,
    treatment: &ContinuousAggregate,
) -> Option<TestStatistic> {
    if control.n < 2 || treatment.n < 2 {
        return None;
    }
    let (n1, n2) = (control.n as f64, treatment.n as f64);
    let q1 = control.variance() / n1;
    let q2 = treatment.variance() / n2;
    let se_sq = q1 + q2;
    if se_sq <= 0.0 {
        return None;
    }

    let statistic = (treatment.mean() - control.mean()) / se_sq.sqrt();
    let degrees_of_freedom = se_sq * se_sq / (q1 * q1 / (n1 - 1.0) + q2 * q2 / (n2 - 1.0));

    Some(TestStatistic {
        statistic,
        degrees_of_freedom,
        p_value: student_t_two_tailed(statistic, degrees_of_freedom),
    })
}

/// Cohen's h between two proportions (treatment minus control).
#[must_use]
pub fn cohens_h(control_rate: f64, treatment_rate: f64) -> f64 {
    let phi = |p: f64| 2.0 * p.clamp(0.0, 1.0).sqrt().asin();
    phi(treatment_rate) - phi(control_rate)
}

/// Cohen's d with pooled standard deviation (treatment minus control).
///
/// Returns `None` when the pooled standard deviation is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cohens_d(control: &ContinuousAggregate, treatment: &ContinuousAggregate) -> Option<f64> {
    let pooled = pooled_std_dev(control, treatment)?;
    Some((treatment.mean() - control.mean()) / pooled)
}

#[allow(clippy::cast_precision_loss)]
fn pooled_std_dev(a: &ContinuousAggregate, b: &ContinuousAggregate) -> Option<f64> {
    let dof = (a.n + b.n).checked_sub(2).filter(|&d| d > 0)? as f64;
    let pooled_var = ((a.n.saturating_sub(1)) as f64)
        .mul_add(a.variance(), (b.n.saturating_sub(1)) as f64 * b.variance())
        / dof;
    (pooled_var > 0.0).then(|| pooled_var.sqrt())
}

/// Whether two samples have zero pooled variance (every value identical
/// within each arm).
#[must_use]
pub fn zero_pooled_variance(a: &ContinuousAggregate, b: &ContinuousAggregate) -> bool {
    pooled_std_dev(a, b).is_none()
}

/// 95% Wald interval p̂ ± 1.96·√(p̂(1−p̂)/n), clamped to [0, 1].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn proportion_ci(aggregate: &BinaryAggregate) -> (f64, f64) {
    if aggregate.trials == 0 {
        return (0.0, 0.0);
    }
    let p = aggregate.rate();
    let half = Z_95 * (p * (1.0 - p) / aggregate.trials as f64).sqrt();
    ((p - half).max(0.0), (p + half).min(1.0))
}

/// 95% interval mean ± 1.96·s/√n.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_ci(aggregate: &ContinuousAggregate) -> (f64, f64) {
    if aggregate.n == 0 {
        return (0.0, 0.0);
    }
    let half = Z_95 * aggregate.std_dev() / (aggregate.n as f64).sqrt();
    (aggregate.mean() - half, aggregate.mean() + half)
}

/// Relative improvement of treatment over control in percent. `None` when
/// the control value is zero.
#[must_use]
pub fn relative_improvement(control: f64, treatment: f64) -> Option<f64> {
    (control != 0.0).then(|| (treatment - control) / control * 100.0)
}

use tracing::{debug, warn};

use crate::metrics::{MetricsResult, REFERENCE_METRIC};

/// Upper-middle element of `values` after an ascending sort.
///
/// Even-length series yield `values[len / 2]`, never an average.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    Some(values[values.len() / 2])
}

/// Index of the representative run.
///
/// The scalar median of the reference metric is computed across all runs that
/// recorded it, and the first run (in insertion order) with exactly that value
/// wins. Runs without a reference timing never win.
pub fn find_median_run(runs: &[MetricsResult]) -> Option<usize> {
    let mut values: Vec<f64> = runs.iter().filter_map(reference_value).collect();
    if values.len() < runs.len() {
        warn!(
            metric = %REFERENCE_METRIC,
            missing = runs.len() - values.len(),
            "runs without the reference metric are excluded from median selection"
        );
    }
    let Some(median) = median(&mut values) else {
        warn!(metric = %REFERENCE_METRIC, "no run recorded the reference metric");
        return None;
    };
    let index = runs
        .iter()
        .position(|run| reference_value(run) == Some(median));
    debug!(median, index = ?index, runs = runs.len(), "selected median run");
    index
}

fn reference_value(run: &MetricsResult) -> Option<f64> {
    run.timing(REFERENCE_METRIC).and_then(|timing| timing.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricId;
    use crate::metrics::fixtures::{result_with, result_with_idle};
    use proptest::prelude::*;

    #[test]
    fn odd_series_picks_middle() {
        assert_eq!(median(&mut [1200.0, 900.0, 1500.0]), Some(1200.0));
    }

    #[test]
    fn even_series_picks_upper_middle() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(3.0));
        assert_eq!(median(&mut [10.0, 20.0]), Some(20.0));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn selects_run_owning_the_median_value() {
        let runs = vec![
            result_with_idle(1200.0),
            result_with_idle(900.0),
            result_with_idle(1500.0),
        ];
        assert_eq!(find_median_run(&runs), Some(0));
    }

    #[test]
    fn ties_resolve_to_first_occurrence() {
        let runs = vec![
            result_with_idle(700.0),
            result_with_idle(1000.0),
            result_with_idle(1000.0),
            result_with_idle(1300.0),
        ];
        assert_eq!(find_median_run(&runs), Some(1));
    }

    #[test]
    fn runs_without_reference_metric_are_ignored() {
        let runs = vec![
            result_with(&[(MetricId::FirstCpuIdle, None)]),
            result_with_idle(800.0),
            result_with_idle(600.0),
        ];
        assert_eq!(find_median_run(&runs), Some(1));

        let runs = vec![
            result_with(&[(MetricId::Interactive, Some(100.0))]),
            result_with(&[(MetricId::FirstCpuIdle, Some(f64::NAN))]),
        ];
        assert_eq!(find_median_run(&runs), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn median_run_is_a_member_with_upper_middle_value(
            values in prop::collection::vec(0u32..20_000, 2..12),
        ) {
            let runs: Vec<MetricsResult> =
                values.iter().map(|value| result_with_idle(f64::from(*value))).collect();
            let index = find_median_run(&runs).expect("median index");
            prop_assert!(index < runs.len());

            let mut sorted: Vec<f64> = values.iter().map(|value| f64::from(*value)).collect();
            sorted.sort_by(f64::total_cmp);
            let expected = sorted[sorted.len() / 2];
            prop_assert_eq!(reference_value(&runs[index]), Some(expected));
            let first = values.iter().position(|value| f64::from(*value) == expected);
            prop_assert_eq!(Some(index), first);
        }
    }
}

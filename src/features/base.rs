//! Shared feature machinery: null-policy application, rolling z-score
//! normalisation, and flag-but-keep outlier detection. Every feature kind
//! follows the same template: load source, apply null policy, compute, add
//! normalisations, flag outliers, write.

use polars::prelude::*;

use crate::db::dims::{FeaturePolicy, NullPolicy};
use crate::error::Result;

/// Extract a float column as options, preserving nulls.
pub fn column_to_f64_opt(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let ca = df.column(name)?.f64()?;
    Ok(ca.into_iter().collect())
}

/// Apply the feature's null policy to the named columns.
///
/// - `skip`: leave nulls; downstream tolerates them.
/// - `forward_fill`: forward-fill, then back-fill leading gaps.
/// - `interpolate`: linear interpolation; runs of nulls longer than the
///   configured limit are restored to null afterwards.
pub fn apply_null_policy(
    df: DataFrame,
    cols: &[&str],
    policy: &FeaturePolicy,
) -> Result<DataFrame> {
    match policy.null_policy {
        NullPolicy::Skip => Ok(df),
        NullPolicy::ForwardFill => {
            let exprs: Vec<Expr> = cols
                .iter()
                .map(|c| {
                    col(*c)
                        .fill_null_with_strategy(FillNullStrategy::Forward(None))
                        .fill_null_with_strategy(FillNullStrategy::Backward(None))
                })
                .collect();
            Ok(df.lazy().with_columns(exprs).collect()?)
        }
        NullPolicy::Interpolate => {
            let null_masks: Vec<Vec<bool>> = cols
                .iter()
                .map(|c| {
                    column_to_f64_opt(&df, c).map(|v| v.iter().map(Option::is_none).collect())
                })
                .collect::<Result<_>>()?;
            let exprs: Vec<Expr> = cols
                .iter()
                .map(|c| col(*c).interpolate(InterpolationMethod::Linear))
                .collect();
            let mut out = df.lazy().with_columns(exprs).collect()?;
            if let Some(limit) = policy.interpolate_limit {
                for (c, mask) in cols.iter().zip(&null_masks) {
                    restore_long_runs(&mut out, c, mask, limit as usize)?;
                }
            }
            Ok(out)
        }
    }
}

/// Re-null interpolated values inside null runs longer than `limit`.
fn restore_long_runs(df: &mut DataFrame, name: &str, was_null: &[bool], limit: usize) -> Result<()> {
    let mut values = column_to_f64_opt(df, name)?;
    let mut i = 0;
    while i < was_null.len() {
        if was_null[i] {
            let run_start = i;
            while i < was_null.len() && was_null[i] {
                i += 1;
            }
            if i - run_start > limit {
                for v in &mut values[run_start..i] {
                    *v = None;
                }
            }
        } else {
            i += 1;
        }
    }
    let series = Float64Chunked::from_iter_options(name.into(), values.into_iter()).into_series();
    df.replace(name, series.into())?;
    Ok(())
}

/// Rolling z-score: `(x - rolling_mean) / rolling_std` over `window` rows.
/// When the rolling SD is zero the z-score is null.
pub fn with_rolling_zscore(lf: LazyFrame, name: &str, window: usize, out_name: &str) -> LazyFrame {
    let opts = RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        weights: None,
        center: false,
        fn_params: None,
    };
    let mean = col(name).rolling_mean(opts.clone());
    let std = col(name).rolling_std(opts);
    lf.with_column(
        when(std.clone().eq(lit(0.0)))
            .then(lit(NULL))
            .otherwise((col(name) - mean) / std)
            .alias(out_name),
    )
}

/// Z-score outlier test per row: any listed z-column exceeding `n_sigma` in
/// magnitude flags the row. Flag-but-keep.
pub fn zscore_outlier_mask(
    df: &DataFrame,
    z_cols: &[&str],
    n_sigma: f64,
) -> Result<Vec<bool>> {
    let mut mask = vec![false; df.height()];
    for name in z_cols {
        let values = column_to_f64_opt(df, name)?;
        for (m, v) in mask.iter_mut().zip(values) {
            if let Some(z) = v {
                if z.abs() > n_sigma {
                    *m = true;
                }
            }
        }
    }
    Ok(mask)
}

/// IQR outlier test: outside `[Q1 - k*IQR, Q3 + k*IQR]`.
pub fn iqr_outlier_mask(values: &[Option<f64>], k: f64) -> Vec<bool> {
    let mut sorted: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if sorted.len() < 4 {
        return vec![false; values.len()];
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lo = q1 - k * iqr;
    let hi = q3 + k * iqr;
    values
        .iter()
        .map(|v| v.is_some_and(|x| x < lo || x > hi))
        .collect()
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Plain rolling mean over an option slice; null until `window` non-null
/// values are present in the window, null if any gap falls inside it.
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut out = vec![None; n];
    if window == 0 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        let slice = &values[i + 1 - window..=i];
        if slice.iter().all(Option::is_some) {
            let sum: f64 = slice.iter().filter_map(|v| *v).sum();
            out[i] = Some(sum / window as f64);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dims::FeaturePolicy;

    fn policy(null_policy: NullPolicy, limit: Option<u32>) -> FeaturePolicy {
        FeaturePolicy {
            feature: "test".into(),
            null_policy,
            interpolate_limit: limit,
            outlier_method: crate::db::dims::OutlierMethod::ZScore,
        }
    }

    #[test]
    fn skip_policy_preserves_nulls() {
        let df = df! { "x" => &[Some(1.0), None, Some(3.0)] }.unwrap();
        let out = apply_null_policy(df, &["x"], &policy(NullPolicy::Skip, None)).unwrap();
        assert_eq!(out.column("x").unwrap().null_count(), 1);
    }

    #[test]
    fn forward_fill_also_backfills_leading_gap() {
        let df = df! { "x" => &[None, Some(2.0), None, Some(4.0)] }.unwrap();
        let out = apply_null_policy(df, &["x"], &policy(NullPolicy::ForwardFill, None)).unwrap();
        let x = column_to_f64_opt(&out, "x").unwrap();
        assert_eq!(x, vec![Some(2.0), Some(2.0), Some(2.0), Some(4.0)]);
    }

    #[test]
    fn interpolate_respects_limit() {
        let df = df! {
            "x" => &[Some(1.0), None, Some(3.0), None, None, None, Some(7.0)]
        }
        .unwrap();
        let out = apply_null_policy(df, &["x"], &policy(NullPolicy::Interpolate, Some(2))).unwrap();
        let x = column_to_f64_opt(&out, "x").unwrap();
        assert_eq!(x[1], Some(2.0)); // short run interpolated
        assert_eq!(x[3], None); // run of 3 exceeds limit 2
        assert_eq!(x[4], None);
        assert_eq!(x[5], None);
    }

    #[test]
    fn zscore_null_when_std_zero() {
        let df = df! { "x" => &[5.0, 5.0, 5.0, 5.0] }.unwrap();
        let out = with_rolling_zscore(df.lazy(), "x", 3, "x_z").collect().unwrap();
        let z = column_to_f64_opt(&out, "x_z").unwrap();
        assert!(z.iter().all(Option::is_none));
    }

    #[test]
    fn zscore_flags_large_deviation() {
        let mut xs: Vec<f64> = (0..30).map(|i| f64::from(i % 3)).collect();
        xs.push(1000.0);
        let df = df! { "x" => &xs }.unwrap();
        let out = with_rolling_zscore(df.lazy(), "x", 20, "x_z").collect().unwrap();
        let mask = zscore_outlier_mask(&out, &["x_z"], 4.0).unwrap();
        assert!(mask[xs.len() - 1]);
        assert!(!mask[10]);
    }

    #[test]
    fn iqr_flags_extremes_only() {
        let mut values: Vec<Option<f64>> = (0..20).map(|i| Some(f64::from(i))).collect();
        values.push(Some(500.0));
        let mask = iqr_outlier_mask(&values, 1.5);
        assert!(mask[20]);
        assert_eq!(mask[..20].iter().filter(|m| **m).count(), 0);
    }

    #[test]
    fn rolling_mean_requires_full_window() {
        let values = vec![Some(1.0), Some(2.0), Some(3.0), None, Some(5.0)];
        let out = rolling_mean(&values, 2);
        assert_eq!(out, vec![None, Some(1.5), Some(2.5), None, None]);
    }
}

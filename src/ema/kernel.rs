//! Exponential smoothing kernel shared by every EMA variant.
//!
//! Recursive (adjust=false) EMA with a minimum-observation gate: values are
//! withheld until `min_periods` observations have been folded in, which
//! avoids noisy, highly volatile values at the start of a series.

/// Compute an EMA over `values`. Output is aligned 1:1 with the input;
/// positions before `min_periods` observations are `None`.
pub fn compute_ema(values: &[f64], alpha: f64, min_periods: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut state: Option<f64> = None;
    let mut seen = 0usize;
    for &v in values {
        if !v.is_finite() {
            out.push(None);
            continue;
        }
        seen += 1;
        let next = match state {
            None => v,
            Some(prev) => prev + alpha * (v - prev),
        };
        state = Some(next);
        out.push((seen >= min_periods).then_some(next));
    }
    out
}

/// One smoothing step, used when propagating a bar-space EMA across daily
/// rows between canonical closes.
pub fn ema_step(prev: f64, value: f64, alpha: f64) -> f64 {
    prev + alpha * (value - prev)
}

/// First difference across all rows (`d1_roll` semantics).
pub fn diff_all(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let mut prev: Option<f64> = None;
    for (i, v) in values.iter().enumerate() {
        if let (Some(p), Some(c)) = (prev, *v) {
            out[i] = Some(c - p);
        }
        if v.is_some() {
            prev = *v;
        }
    }
    out
}

/// First difference across canonical rows only (`d1` semantics): non-canonical
/// positions stay `None`, and each canonical position differences against the
/// previous canonical value.
pub fn diff_canonical(values: &[Option<f64>], canonical: &[bool]) -> Vec<Option<f64>> {
    debug_assert_eq!(values.len(), canonical.len());
    let mut out = vec![None; values.len()];
    let mut prev: Option<f64> = None;
    for i in 0..values.len() {
        if !canonical[i] {
            continue;
        }
        if let (Some(p), Some(c)) = (prev, values[i]) {
            out[i] = Some(c - p);
        }
        if values[i].is_some() {
            prev = values[i];
        }
    }
    out
}

/// Daily-space alpha that compounds to the bar-space alpha over `tf_days`
/// steps: `1 - (1 - alpha_bar)^(1/tf_days)`.
pub fn daily_alpha_from_bar(alpha_bar: f64, tf_days: u32) -> f64 {
    1.0 - (1.0 - alpha_bar).powf(1.0 / f64::from(tf_days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_matches_closed_form() {
        // alpha=0.5 over [1, 2, 3]: 1, 1.5, 2.25
        let out = compute_ema(&[1.0, 2.0, 3.0], 0.5, 1);
        assert_eq!(out, vec![Some(1.0), Some(1.5), Some(2.25)]);
    }

    #[test]
    fn min_periods_withholds_warmup() {
        let out = compute_ema(&[1.0, 2.0, 3.0, 4.0], 0.5, 3);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!(out[2].is_some());
        assert!(out[3].is_some());
    }

    #[test]
    fn non_finite_inputs_skip_decay() {
        let out = compute_ema(&[1.0, f64::NAN, 3.0], 0.5, 1);
        assert_eq!(out[0], Some(1.0));
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(2.0)); // decays from 1.0, not from NaN
    }

    #[test]
    fn diff_canonical_skips_roll_rows() {
        let values = vec![Some(1.0), Some(2.0), Some(3.0), Some(5.0)];
        let canonical = vec![true, false, true, false];
        let d1 = diff_canonical(&values, &canonical);
        assert_eq!(d1, vec![None, None, Some(2.0), None]);
    }

    #[test]
    fn diff_all_tracks_every_row() {
        let values = vec![Some(1.0), Some(2.0), None, Some(5.0)];
        let d1 = diff_all(&values);
        assert_eq!(d1, vec![None, Some(1.0), None, Some(3.0)]);
    }

    #[test]
    fn daily_alpha_compounds_to_bar_alpha() {
        let alpha_bar = 2.0 / (21.0 + 1.0);
        let alpha_daily = daily_alpha_from_bar(alpha_bar, 7);
        let compounded = 1.0 - (1.0 - alpha_daily).powi(7);
        assert!((compounded - alpha_bar).abs() < 1e-12);
    }
}

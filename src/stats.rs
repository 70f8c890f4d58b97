//! Central-tendency primitives shared by the ring buffer and the summary
//! selection. All functions ignore nothing and panic never: degenerate
//! inputs come back as `None` and callers decide how loud to be about it.

use crate::{CentralTendency, Error, Result};

/// Low median: the smaller of the two middle elements for an even count, so
/// the returned value is always a sampled element.
pub fn median_low(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted[(sorted.len() - 1) / 2])
}

/// Arithmetic mean.
pub fn fmean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// The unique most-common value, or `None` when the multiset is multimodal
/// or empty. Equality is exact: the sequences this runs over repeat measured
/// values verbatim, they are not arbitrary floats.
pub fn unique_mode(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut best_value = sorted[0];
    let mut best_count = 0usize;
    let mut ties = 0usize;

    let mut i = 0;
    while i < sorted.len() {
        let value = sorted[i];
        let mut count = 0;
        while i < sorted.len() && sorted[i] == value {
            count += 1;
            i += 1;
        }
        if count > best_count {
            best_count = count;
            best_value = value;
            ties = 1;
        } else if count == best_count {
            ties += 1;
        }
    }
    if ties == 1 {
        Some(best_value)
    } else {
        None
    }
}

/// Bessel-corrected sample standard deviation. Needs at least two points.
pub fn sample_stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = fmean(values)?;
    let ssq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some((ssq / (values.len() - 1) as f64).sqrt())
}

/// Central estimate under the chosen tendency. `Mode` fails on multimodal
/// input, matching the calibration protocol.
pub fn central(values: &[f64], tendency: CentralTendency) -> Result<f64> {
    let result = match tendency {
        CentralTendency::Median => median_low(values),
        CentralTendency::Mean => fmean(values),
        CentralTendency::Mode => unique_mode(values),
    };
    result.ok_or_else(|| {
        Error::Statistics(format!(
            "cannot take {} of {} value(s)",
            tendency,
            values.len()
        ))
    })
}

/// Pick the representative value of a per-round series: the unique mode when
/// one exists (tagged `mode`), otherwise the low median (tagged `median`).
/// Null entries from degenerate rounds are skipped.
pub fn best(series: &[Option<f64>]) -> Result<(CentralTendency, f64)> {
    let values: Vec<f64> = series.iter().copied().flatten().collect();
    if values.is_empty() {
        return Err(Error::Statistics(
            "no usable rounds in series".to_string(),
        ));
    }
    match unique_mode(&values) {
        Some(m) => Ok((CentralTendency::Mode, m)),
        None => {
            // Non-empty input, median_low cannot fail here.
            let m = median_low(&values).ok_or_else(|| {
                Error::Statistics("empty series after filtering".to_string())
            })?;
            Ok((CentralTendency::Median, m))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_low_odd_count() {
        assert_eq!(median_low(&[3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn test_median_low_even_count_picks_lower() {
        assert_eq!(median_low(&[4.0, 1.0, 3.0, 2.0]), Some(2.0));
    }

    #[test]
    fn test_median_low_two_values() {
        assert_eq!(median_low(&[10.0, 20.0]), Some(10.0));
    }

    #[test]
    fn test_median_low_empty() {
        assert_eq!(median_low(&[]), None);
    }

    #[test]
    fn test_fmean_two_values() {
        assert_eq!(fmean(&[10.0, 20.0]), Some(15.0));
    }

    #[test]
    fn test_unique_mode_exists() {
        assert_eq!(unique_mode(&[19.60, 19.62, 19.60]), Some(19.60));
    }

    #[test]
    fn test_unique_mode_all_distinct_is_none() {
        assert_eq!(unique_mode(&[19.60, 19.62, 19.64]), None);
    }

    #[test]
    fn test_unique_mode_tie_is_none() {
        assert_eq!(unique_mode(&[1.0, 1.0, 2.0, 2.0]), None);
    }

    #[test]
    fn test_unique_mode_single_value() {
        assert_eq!(unique_mode(&[5.0]), Some(5.0));
    }

    #[test]
    fn test_sample_stdev_identical_values_is_zero() {
        assert_eq!(sample_stdev(&[7.0, 7.0, 7.0]), Some(0.0));
    }

    #[test]
    fn test_sample_stdev_two_values() {
        // |a - b| / sqrt(2)
        let s = sample_stdev(&[10.0, 20.0]).unwrap();
        assert!((s - 10.0 / 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_sample_stdev_needs_two_points() {
        assert_eq!(sample_stdev(&[1.0]), None);
    }

    #[test]
    fn test_central_mode_multimodal_fails() {
        assert!(central(&[1.0, 2.0], CentralTendency::Mode).is_err());
    }

    #[test]
    fn test_central_median_two_values_is_lower() {
        assert_eq!(central(&[2.0, 1.0], CentralTendency::Median).unwrap(), 1.0);
    }

    // best() selection laws.

    #[test]
    fn test_best_unique_mode() {
        let series = [Some(19.60), Some(19.62), Some(19.60)];
        assert_eq!(
            best(&series).unwrap(),
            (CentralTendency::Mode, 19.60)
        );
    }

    #[test]
    fn test_best_falls_back_to_median_low() {
        let series = [Some(19.60), Some(19.62), Some(19.64)];
        assert_eq!(
            best(&series).unwrap(),
            (CentralTendency::Median, 19.62)
        );
    }

    #[test]
    fn test_best_skips_null_rounds() {
        let series = [Some(19.60), None, Some(19.60)];
        assert_eq!(
            best(&series).unwrap(),
            (CentralTendency::Mode, 19.60)
        );
    }

    #[test]
    fn test_best_all_null_fails() {
        let series = [None, None];
        assert!(best(&series).is_err());
    }
}

//! Sample-weighted federated averaging.

use crate::error::{FedAvgError, Result};

/// One client's contribution to a round: its weights and how many samples
/// produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub weights: Vec<f64>,
    pub samples: u64,
}

/// Computes `Σ w_i * n_i / Σ n_i` componentwise.
///
/// # Arguments
/// * `round` - The round being aggregated, used for error reporting.
/// * `contributions` - Every client's weights and sample count.
///
/// # Errors
/// * `AggregationSkipped` if there are no contributions, no samples, or the
///   sample total does not fit in a `u64`.
/// * `DimensionMismatch` if the weight vectors differ in length.
pub fn weighted_average(round: u32, contributions: &[Contribution]) -> Result<Vec<f64>> {
    let Some(first) = contributions.first() else {
        return Err(FedAvgError::AggregationSkipped {
            round,
            reason: "no models received",
        });
    };

    let Some(total) = total_samples(contributions) else {
        return Err(FedAvgError::AggregationSkipped {
            round,
            reason: "total sample count overflows",
        });
    };
    if total == 0 {
        return Err(FedAvgError::AggregationSkipped {
            round,
            reason: "total sample count is zero",
        });
    }

    let len = first.weights.len();
    if let Some(bad) = contributions.iter().find(|c| c.weights.len() != len) {
        return Err(FedAvgError::DimensionMismatch {
            expected: len,
            got: bad.weights.len(),
        });
    }

    let mut averaged = vec![0.0; len];
    for contribution in contributions {
        let share = contribution.samples as f64 / total as f64;
        averaged
            .iter_mut()
            .zip(&contribution.weights)
            .for_each(|(acc, w)| *acc += w * share);
    }

    Ok(averaged)
}

/// Sum of every contribution's sample count, `None` on overflow.
pub fn total_samples(contributions: &[Contribution]) -> Option<u64> {
    contributions
        .iter()
        .try_fold(0u64, |total, c| total.checked_add(c.samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(weights: &[f64], samples: u64) -> Contribution {
        Contribution {
            weights: weights.to_vec(),
            samples,
        }
    }

    fn assert_close(got: &[f64], expected: &[f64]) {
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-12, "got {got:?}, expected {expected:?}");
        }
    }

    #[test]
    fn weights_by_sample_count() {
        let contributions = [
            contribution(&[1.0, 0.0, 0.0], 10),
            contribution(&[0.0, 2.0, 0.0], 30),
            contribution(&[0.0, 0.0, 3.0], 10),
        ];

        let averaged = weighted_average(1, &contributions).unwrap();
        assert_close(&averaged, &[0.2, 1.2, 0.6]);
    }

    #[test]
    fn single_client_is_identity() {
        let averaged = weighted_average(1, &[contribution(&[42.0, -7.0], 3)]).unwrap();
        assert_close(&averaged, &[42.0, -7.0]);
    }

    #[test]
    fn zero_sample_client_does_not_contribute() {
        let contributions = [contribution(&[1.0], 5), contribution(&[100.0], 0)];
        let averaged = weighted_average(1, &contributions).unwrap();
        assert_close(&averaged, &[1.0]);
    }

    #[test]
    fn empty_round_is_skipped() {
        assert!(matches!(
            weighted_average(4, &[]),
            Err(FedAvgError::AggregationSkipped { round: 4, .. })
        ));
    }

    #[test]
    fn zero_total_is_skipped() {
        let contributions = [contribution(&[1.0], 0), contribution(&[2.0], 0)];
        assert!(matches!(
            weighted_average(2, &contributions),
            Err(FedAvgError::AggregationSkipped { round: 2, .. })
        ));
    }

    #[test]
    fn overflowing_total_is_skipped() {
        let contributions = [contribution(&[1.0], u64::MAX), contribution(&[2.0], 1)];
        assert!(matches!(
            weighted_average(3, &contributions),
            Err(FedAvgError::AggregationSkipped { round: 3, .. })
        ));
    }

    #[test]
    fn largest_total_still_averages() {
        let contributions = [contribution(&[1.0], u64::MAX - 1), contribution(&[1.0], 1)];
        assert_eq!(total_samples(&contributions), Some(u64::MAX));
        assert_close(&weighted_average(1, &contributions).unwrap(), &[1.0]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let contributions = [contribution(&[1.0, 2.0], 1), contribution(&[1.0], 1)];
        assert!(matches!(
            weighted_average(1, &contributions),
            Err(FedAvgError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));
    }
}

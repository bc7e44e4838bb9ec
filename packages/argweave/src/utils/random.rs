use rand::{Rng, SeedableRng};
use rand_isaac::Isaac64Rng;

pub fn get_random_number_generator(seed: Option<u64>) -> Isaac64Rng {
  match seed {
    None => Isaac64Rng::from_entropy(),
    Some(seed) => Isaac64Rng::seed_from_u64(seed),
  }
}

/// Samples an index proportionally to the given non-negative weights.
///
/// A zero or non-finite total is fatal: every caller feeds weights derived
/// from a renormalised forward column, so mass must be present.
pub fn sample_weights(weights: &[f64], rng: &mut impl Rng) -> usize {
  let total: f64 = weights.iter().sum();
  assert!(
    total > 0.0 && total.is_finite(),
    "sample_weights: degenerate weight vector (total = {total})"
  );

  let pick = rng.gen::<f64>() * total;
  let mut cumsum = 0.0;
  for (i, w) in weights.iter().enumerate() {
    cumsum += w;
    if pick < cumsum {
      return i;
    }
  }
  weights.len() - 1
}

/// Samples an index proportionally to exp(log_weights), stably
pub fn sample_log_weights(log_weights: &[f64], rng: &mut impl Rng) -> usize {
  let maxval = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  assert!(maxval.is_finite(), "sample_log_weights: all weights are -inf");
  let weights: Vec<f64> = log_weights.iter().map(|w| (w - maxval).exp()).collect();
  sample_weights(&weights, rng)
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  fn sample_weights_is_deterministic_given_seed() {
    let mut rng = get_random_number_generator(Some(42));
    let weights = [0.0, 0.0, 1.0, 0.0];
    for _ in 0..20 {
      assert_eq!(sample_weights(&weights, &mut rng), 2);
    }
  }

  #[rstest]
  fn sample_weights_matches_proportions() {
    let mut rng = get_random_number_generator(Some(7));
    let weights = [1.0, 3.0];
    let n = 20_000;
    let hits = (0..n).filter(|_| sample_weights(&weights, &mut rng) == 1).count();
    let freq = hits as f64 / n as f64;
    assert!((freq - 0.75).abs() < 0.02, "freq = {freq}");
  }

  #[rstest]
  #[should_panic]
  fn sample_weights_rejects_zero_mass() {
    let mut rng = get_random_number_generator(Some(1));
    sample_weights(&[0.0, 0.0], &mut rng);
  }
}

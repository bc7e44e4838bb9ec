use crate::constants::SUM_LOG_THRESHOLD;

/// Computes log(a + b) given log(a) and log(b)
pub fn logadd(lna: f64, lnb: f64) -> f64 {
  if lna == f64::NEG_INFINITY {
    return lnb;
  }
  if lnb == f64::NEG_INFINITY {
    return lna;
  }
  let diff = lna - lnb;
  if diff < 500.0 {
    (diff.exp() + 1.0).ln() + lnb
  } else {
    lna
  }
}

/// Computes log(sum(exp(vals))) stably
pub fn logsum(vals: &[f64]) -> f64 {
  let (maxi, maxval) = vals
    .iter()
    .copied()
    .enumerate()
    .fold((0_usize, f64::NEG_INFINITY), |(im, vm), (i, v)| {
      if v > vm {
        (i, v)
      } else {
        (im, vm)
      }
    });

  if maxval == f64::NEG_INFINITY {
    return f64::NEG_INFINITY;
  }

  let mut expsum = 1.0;
  for (i, &v) in vals.iter().enumerate() {
    if i != maxi && v - maxval > SUM_LOG_THRESHOLD {
      expsum += (v - maxval).exp();
    }
  }

  maxval + expsum.ln()
}

/// Log gamma function by the Lanczos approximation (g = 7, n = 9)
pub fn ln_gamma(x: f64) -> f64 {
  const COEFFS: [f64; 9] = [
    0.99999999999980993,
    676.5203681218851,
    -1259.1392167224028,
    771.32342877765313,
    -176.61502916214059,
    12.507343278686905,
    -0.13857109526572012,
    9.9843695780195716e-6,
    1.5056327351493116e-7,
  ];

  if x < 0.5 {
    // reflection formula
    let pi = std::f64::consts::PI;
    return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
  }

  let x = x - 1.0;
  let mut a = COEFFS[0];
  let t = x + 7.5;
  for (i, &c) in COEFFS.iter().enumerate().skip(1) {
    a += c / (x + i as f64);
  }

  0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use rstest::rstest;

  #[rstest]
  fn logadd_agrees_with_direct_sum() {
    assert_abs_diff_eq!(logadd(0.5_f64.ln(), 0.25_f64.ln()), 0.75_f64.ln(), epsilon = 1e-12);
    assert_abs_diff_eq!(logadd(f64::NEG_INFINITY, 0.25_f64.ln()), 0.25_f64.ln(), epsilon = 1e-12);
  }

  #[rstest]
  fn logsum_handles_wide_ranges() {
    let vals: [f64; 3] = [-1000.0, -1000.5, -999.0];
    let direct: f64 = vals.iter().map(|v| (v + 1000.0).exp()).sum::<f64>().ln() - 1000.0;
    assert_abs_diff_eq!(logsum(&vals), direct, epsilon = 1e-10);
  }

  #[rstest]
  fn logsum_of_empty_mass_is_neg_inf() {
    assert_eq!(logsum(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
  }

  #[rstest]
  fn ln_gamma_matches_factorials() {
    for n in 1..10_u64 {
      let fact: u64 = (1..n).product();
      assert_abs_diff_eq!(ln_gamma(n as f64), (fact as f64).ln(), epsilon = 1e-9);
    }
    assert_abs_diff_eq!(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), epsilon = 1e-9);
  }
}

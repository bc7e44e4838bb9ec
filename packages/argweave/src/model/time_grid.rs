use crate::constants::TIME_TOL;
use crate::make_error;
use eyre::Report;
use log::debug;

/// Returns the i-th point of an ntimes-point exponential-ish grid on [0, maxtime]
pub fn get_time_point(i: usize, n: usize, maxtime: f64, delta: f64) -> f64 {
  ((i as f64 / n as f64 * (1.0 + delta * maxtime).ln()).exp() - 1.0) / delta
}

fn get_delta_diff(log_delta: f64, times: &[f64], maxtime: f64) -> f64 {
  let delta = log_delta.exp();
  get_time_point(1, times.len() - 1, maxtime, delta) - times[1]
}

/// Recovers the grid curvature parameter from the time points by bisection.
/// Returns None when the grid cannot be expressed by any delta (e.g. linear).
fn solve_delta(times: &[f64]) -> Option<f64> {
  let maxtime = times[times.len() - 1];
  let (mut min_log_delta, mut max_log_delta) = (-10.0_f64, 10.0_f64);
  let tol = 1e-10;

  let mut min_diff = get_delta_diff(min_log_delta, times, maxtime);
  let max_diff = get_delta_diff(max_log_delta, times, maxtime);
  if min_diff * max_diff >= 0.0 {
    return None;
  }

  let mut mid_log_delta = 0.0;
  while max_log_delta - min_log_delta > tol {
    let mid_diff = get_delta_diff(mid_log_delta, times, maxtime);
    if min_diff * mid_diff > 0.0 {
      min_diff = mid_diff;
      min_log_delta = mid_log_delta;
    } else {
      max_log_delta = mid_log_delta;
    }
    mid_log_delta = (min_log_delta + max_log_delta) / 2.0;
  }

  let delta = mid_log_delta.exp();
  debug!("using delta={delta:e}");
  Some(delta)
}

/// Discretized coalescent time grid.
///
/// `times` holds the `T` primary points; `coal_time_steps` holds the `2T-1`
/// half-interval widths derived from midpoints, with an infinite final step.
#[derive(Clone, Debug)]
pub struct TimeGrid {
  pub times: Vec<f64>,
  pub time_steps: Vec<f64>,
  pub coal_time_steps: Vec<f64>,
  pub delta: f64,
}

impl TimeGrid {
  pub fn new(times: Vec<f64>) -> Result<Self, Report> {
    Self::build(times, false)
  }

  pub fn with_linear_midpoints(times: Vec<f64>) -> Result<Self, Report> {
    Self::build(times, true)
  }

  fn build(times: Vec<f64>, linear: bool) -> Result<Self, Report> {
    let ntimes = times.len();
    if ntimes < 2 {
      return make_error!("time grid requires at least 2 points, got {ntimes}");
    }
    if times[0] != 0.0 {
      return make_error!("time grid must start at 0, got {}", times[0]);
    }
    for i in 1..ntimes {
      if times[i] <= times[i - 1] {
        return make_error!(
          "time grid must be strictly increasing, got times[{}]={} after times[{}]={}",
          i,
          times[i],
          i - 1,
          times[i - 1]
        );
      }
    }

    let delta = if linear { None } else { solve_delta(&times) };

    // midpoint grid of 2T-1 points
    let maxtime = times[ntimes - 1];
    let mut times2 = vec![0.0; 2 * ntimes - 1];
    for i in 0..ntimes {
      times2[2 * i] = times[i];
    }
    for i in 0..ntimes - 1 {
      times2[2 * i + 1] = match delta {
        Some(delta) => get_time_point(2 * i + 1, 2 * ntimes - 2, maxtime, delta),
        None => 0.5 * (times[i] + times[i + 1]),
      };
    }

    let mut coal_time_steps = vec![0.0; 2 * ntimes - 1];
    for i in 0..2 * ntimes - 2 {
      coal_time_steps[i] = times2[i + 1] - times2[i];
      if coal_time_steps[i] < 0.0 {
        return make_error!("derived half-interval {i} has negative width");
      }
    }
    coal_time_steps[2 * ntimes - 2] = f64::INFINITY;

    let mut time_steps = vec![0.0; ntimes];
    for i in 0..ntimes - 1 {
      time_steps[i] = times[i + 1] - times[i];
    }
    time_steps[ntimes - 1] = f64::INFINITY;

    Ok(Self {
      times,
      time_steps,
      coal_time_steps,
      delta: delta.unwrap_or(0.0),
    })
  }

  #[inline]
  pub fn ntimes(&self) -> usize {
    self.times.len()
  }

  /// Index of the grid point nearest to a real time
  pub fn nearest(&self, t: f64) -> i32 {
    let mut mindiff = f64::INFINITY;
    let mut mini = 0;
    for (i, &ti) in self.times.iter().enumerate() {
      let diff = (ti - t).abs();
      if diff < mindiff {
        mindiff = diff;
        mini = i;
      }
    }
    mini as i32
  }

  /// Exact lookup of a real time on the grid by binary search.
  /// Aborts if the time does not lie on the grid within tolerance.
  pub fn discretize(&self, t: f64, min_idx: i32) -> i32 {
    let mut min_time = if min_idx < 0 { 0 } else { min_idx as usize };
    let mut max_time = self.ntimes() - 1;

    if (t - self.times[min_time]).abs() < TIME_TOL {
      return min_time as i32;
    }
    assert!(t > self.times[min_time], "time {t} below grid window");

    let mut mid_time = (max_time + min_time) / 2;
    loop {
      if (t - self.times[mid_time]).abs() < TIME_TOL {
        return mid_time as i32;
      }
      if self.times[mid_time] > t {
        max_time = mid_time - 1;
      } else {
        min_time = mid_time + 1;
      }
      mid_time = (max_time + min_time) / 2;
      if max_time <= min_time {
        if (t - self.times[max_time]).abs() < TIME_TOL {
          return max_time as i32;
        }
        if (t - self.times[min_time]).abs() < TIME_TOL {
          return min_time as i32;
        }
        panic!("time {t} is not on the grid");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rstest::rstest;

  fn grid() -> TimeGrid {
    TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap()
  }

  #[rstest]
  fn half_steps_have_expected_shape() -> Result<(), Report> {
    let g = grid();
    assert_eq!(g.coal_time_steps.len(), 2 * g.ntimes() - 1);
    assert!(g.coal_time_steps[2 * g.ntimes() - 2].is_infinite());
    // consecutive midpoints bracket each interior grid time
    let mut acc = 0.0;
    for i in 0..g.ntimes() - 1 {
      acc += g.coal_time_steps[2 * i] + g.coal_time_steps[2 * i + 1];
      assert_abs_diff_eq!(acc, g.times[i + 1], epsilon = 1e-6);
    }
    Ok(())
  }

  #[rstest]
  fn linear_grid_falls_back_to_linear_midpoints() -> Result<(), Report> {
    let g = TimeGrid::new(vec![0.0, 10.0, 20.0, 30.0])?;
    assert_abs_diff_eq!(g.coal_time_steps[0], 5.0, epsilon = 1e-6);
    assert_abs_diff_eq!(g.coal_time_steps[1], 5.0, epsilon = 1e-6);
    Ok(())
  }

  #[rstest]
  fn nearest_snaps_to_grid() {
    let g = grid();
    assert_eq!(g.nearest(0.0), 0);
    assert_eq!(g.nearest(55.0), 1);
    assert_eq!(g.nearest(180.0), 3);
    assert_eq!(g.nearest(1e9), 4);
  }

  #[rstest]
  fn discretize_finds_exact_points() {
    let g = grid();
    for (i, &t) in g.times.iter().enumerate() {
      assert_eq!(g.discretize(t, -1), i as i32);
      assert_eq!(g.discretize(t, i as i32), i as i32);
    }
  }

  #[rstest]
  fn rejects_unsorted_times() {
    assert!(TimeGrid::new(vec![0.0, 100.0, 50.0]).is_err());
    assert!(TimeGrid::new(vec![10.0, 100.0]).is_err());
  }
}

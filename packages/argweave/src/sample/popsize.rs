use crate::arg::lineages::LineageCounts;
use crate::arg::local_trees::LocalTrees;
use crate::model::arg_model::ArgModel;
use crate::sample::prior::calc_arg_prior;
use crate::utils::math::ln_gamma;
use log::debug;
use rand::Rng;
use rand_distr::{Distribution, Gamma};

const PRIOR_THETA: f64 = 200_000.0;
const NEIGHBOR_WEIGHT: f64 = 0.99999;
const NEIGHBOR_SIGMA: f64 = 50.0;

/// Metropolis update of every sampled population-size parameter.
///
/// Proposals are Gamma-distributed around the current value with variance
/// `min(500, N/2)^2`; the prior is a weak Gamma that stays flat out to a few
/// hundred thousand, optionally mixed with a neighbour-correlation term that
/// pulls adjacent intervals together. Rejections silently keep the current
/// value.
pub fn resample_popsizes(model: &mut ArgModel, trees: &LocalTrees, heat: f64, rng: &mut impl Rng) {
  let mut num_accept = 0;
  let mut total = 0;
  let mut curr_like = calc_arg_prior(model, trees, None);

  let params = model.popsize_config.params.clone();
  let numsample = model.popsize_config.numsample;
  let neighbor_prior = model.popsize_config.neighbor_prior;
  let nhalf = 2 * model.ntimes() - 1;

  for _rep in 0..numsample {
    for param in &params {
      if !param.sample {
        continue;
      }
      let &(maxpop, maxtime) = param.intervals.iter().max_by_key(|(_, time)| *time).unwrap();

      let old_popsize = model.popsizes[maxpop][maxtime];
      let s = (500.0_f64.min(old_popsize / 2.0)).powi(2);
      let new_popsize = Gamma::new(old_popsize * old_popsize / s, s / old_popsize)
        .expect("invalid Gamma proposal parameters")
        .sample(rng);
      let sp = (500.0_f64.min(new_popsize / 2.0)).powi(2);

      // Hastings ratio of the asymmetric Gamma proposal
      let logn = old_popsize.ln();
      let lognp = new_popsize.ln();
      let nsquare = old_popsize * old_popsize;
      let npsquare = new_popsize * new_popsize;
      let trans_ratio = (npsquare / sp - nsquare / s - 1.0) * logn
        + (1.0 - nsquare / s + npsquare / sp) * lognp
        - old_popsize * new_popsize / sp
        + old_popsize * new_popsize / s
        - npsquare / sp * sp.ln()
        + nsquare / s * s.ln()
        - ln_gamma(npsquare / sp)
        + ln_gamma(nsquare / s);

      // weak Gamma prior, optionally pulled toward the neighbouring interval
      let prior_ratio = if !neighbor_prior || maxtime >= nhalf - 1 {
        (old_popsize - new_popsize) / PRIOR_THETA
      } else {
        let prev_popsize = model.popsizes[maxpop][maxtime + 1];
        let sigma22 = 2.0 * NEIGHBOR_SIGMA * NEIGHBOR_SIGMA;
        let scale = 1.0 / (NEIGHBOR_SIGMA * (2.0 * std::f64::consts::PI).sqrt());
        let newprior = (1.0 - NEIGHBOR_WEIGHT) * ((-new_popsize / PRIOR_THETA).exp() / PRIOR_THETA)
          + NEIGHBOR_WEIGHT * scale * (-(new_popsize - prev_popsize).powi(2) / sigma22).exp();
        let oldprior = (1.0 - NEIGHBOR_WEIGHT) * ((-old_popsize / PRIOR_THETA).exp() / PRIOR_THETA)
          + NEIGHBOR_WEIGHT * scale * (-(old_popsize - prev_popsize).powi(2) / sigma22).exp();
        (newprior / oldprior).ln()
      };

      for &(pop, time) in &param.intervals {
        model.popsizes[pop][time] = new_popsize;
      }
      let new_like = calc_arg_prior(model, trees, None);

      let lr = new_like - curr_like;
      let ln_accept = (trans_ratio + prior_ratio + lr) * heat;
      let pr_accept = if ln_accept > 0.0 { 1.0 } else { ln_accept.exp() };
      let accept = ln_accept > 0.0 || rng.gen::<f64>() < pr_accept;

      if accept {
        num_accept += 1;
        curr_like = new_like;
      } else {
        for &(pop, time) in &param.intervals {
          model.popsizes[pop][time] = old_popsize;
        }
      }
      total += 1;
    }
  }

  debug!("done resample_popsizes num_accept={num_accept}/{total}");
}

/// Closed-form waiting-time estimate of per-interval population sizes from a
/// set of independent local trees, used to seed the Gibbs sampler
pub fn est_popsize_trees(model: &ArgModel, trees: &[&crate::arg::local_tree::LocalTree], popsizes: &mut [f64]) {
  assert!(!trees.is_empty());

  let ntimes = model.ntimes();
  let nleaves = trees[0].num_leaves();
  let mut lineages = LineageCounts::new(ntimes, model.num_pops());

  let mut total_ncoals = vec![0_i64; ntimes];
  let mut total_pairs = vec![0_i64; ntimes];

  for tree in trees {
    lineages.count(tree, model.pop_model.as_ref(), false);
    for j in 0..ntimes - 1 {
      let start = if j == 0 {
        nleaves as i64
      } else {
        i64::from(lineages.nbranches[j - 1])
      };
      let end = i64::from(lineages.nbranches[j]);
      let ncoals = start - end;
      let pairs = start * (start - 1) / 2;
      total_ncoals[j] += ncoals;
      total_pairs[j] += pairs;
    }
  }

  for j in 0..ntimes - 1 {
    popsizes[j] = if total_ncoals[j] == 0 {
      0.0
    } else {
      0.5 * model.grid.time_steps[j] * total_pairs[j] as f64 / total_ncoals[j] as f64
    };
  }
}

/// Thins an ARG into approximately independent local trees, one every `step`
/// bases, and estimates population sizes from them
pub fn est_popsize_arg(model: &ArgModel, trees: &LocalTrees, step: i32, popsizes: &mut [f64]) {
  let mut indep_trees = Vec::new();

  let mut pos = trees.start_coord;
  let mut end = trees.start_coord;
  for it in &trees.trees {
    let start = end;
    end += it.blocklen;
    while start <= pos && pos < end {
      indep_trees.push(&it.tree);
      pos += step;
    }
  }

  est_popsize_trees(model, &indep_trees, popsizes);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_tree::LocalTree;
  use crate::arg::local_trees::LocalTreeSpr;
  use crate::arg::spr::Spr;
  use crate::model::arg_model::PopsizeConfig;
  use crate::model::time_grid::TimeGrid;
  use crate::utils::random::get_random_number_generator;
  use approx::assert_abs_diff_eq;
  use rstest::rstest;

  fn model() -> ArgModel {
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  fn two_leaf_arg() -> LocalTrees {
    let tree = LocalTree::from_parents(&[2, 2, -1], Some(&[0, 0, 2]), None);
    let mut trees = LocalTrees::new(0, 100);
    trees.nnodes = 3;
    trees.seqids = vec![0, 1];
    trees.trees.push(LocalTreeSpr::new(tree, Spr::null(), 100, None));
    trees
  }

  #[rstest]
  fn estimator_recovers_waiting_time_formula() {
    let model = model();
    let tree = LocalTree::from_parents(&[2, 2, -1], Some(&[0, 0, 2]), None);
    let mut popsizes = vec![0.0; 5];
    est_popsize_trees(&model, &[&tree], &mut popsizes);

    // interval 2 loses the pair: N = dt * pairs / (2 * ncoals)
    assert_abs_diff_eq!(popsizes[2], 0.5 * 100.0 * 1.0, epsilon = 1e-9);
    // intervals without coalescences are left at zero
    assert_eq!(popsizes[0], 0.0);
  }

  #[rstest]
  fn popsize_updates_stay_positive_and_move() {
    let mut model = model();
    model.popsize_config = PopsizeConfig::one_param_per_time(1, 5);
    let trees = two_leaf_arg();
    let mut rng = get_random_number_generator(Some(71));

    let before = model.popsizes[0].clone();
    for _ in 0..20 {
      resample_popsizes(&mut model, &trees, 1.0, &mut rng);
    }
    let after = &model.popsizes[0];

    assert!(after.iter().all(|&n| n > 0.0));
    assert!(after.iter().zip(before.iter()).any(|(a, b)| a != b), "no parameter ever moved");
  }
}

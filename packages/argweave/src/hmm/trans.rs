use crate::arg::lineages::LineageCounts;
use crate::arg::local_tree::LocalTree;
use crate::arg::local_trees::{get_treelen, get_treelen_internal};
use crate::arg::spr::Spr;
use crate::hmm::states::{NodeStateLookup, State, StatesModel};
use crate::model::arg_model::ArgModel;
use crate::model::time_grid::TimeGrid;
use ndarray::Array2;

/// Per-path coalescent exposure under the current lineage counts: cumulative
/// hazards over full intervals and the probability of coalescing within each
/// interval, split per coalescent target.
#[derive(Clone, Debug)]
pub struct CoalRates {
  ntimes: usize,
  /// [path][ntimes]: hazard accumulated over intervals [0, t)
  cum: Vec<Vec<f64>>,
  /// [path][ntimes]: P(coalesce in interval b | survive to b) / ncoals(b)
  coal_end: Vec<Vec<f64>>,
}

impl CoalRates {
  pub fn new(model: &ArgModel, lineages: &LineageCounts) -> Self {
    let ntimes = model.ntimes();
    let numpath = model.num_pop_paths();
    let steps = &model.grid.coal_time_steps;

    let hazard = |p: i32, i: usize| -> f64 {
      let pop_lo = model.get_pop(p, i as i32);
      let pop_hi = model.get_pop(p, i as i32 + 1);
      let lo = f64::from(lineages.nbranches_pop[pop_lo as usize][2 * i]) * steps[2 * i]
        / (2.0 * model.popsize(pop_lo, 2 * i));
      let hi = if 2 * i + 1 < steps.len() {
        f64::from(lineages.nbranches_pop[pop_hi as usize][2 * i + 1]) * steps[2 * i + 1]
          / (2.0 * model.popsize(pop_hi, 2 * i + 1))
      } else {
        0.0
      };
      lo + hi
    };

    let mut cum = vec![vec![0.0; ntimes]; numpath];
    let mut coal_end = vec![vec![0.0; ntimes]; numpath];
    for p in 0..numpath {
      for i in 0..ntimes - 1 {
        cum[p][i + 1] = cum[p][i] + hazard(p as i32, i);
      }
      for b in 0..ntimes {
        let pop = model.get_pop(p as i32, b as i32);
        let ncoals = lineages.ncoals_pop[pop as usize][b].max(1);
        let prob = if b == ntimes - 1 {
          1.0
        } else {
          let a = hazard(p as i32, b);
          if a.is_finite() {
            1.0 - (-a).exp()
          } else {
            1.0
          }
        };
        coal_end[p][b] = prob / f64::from(ncoals);
      }
    }

    Self { ntimes, cum, coal_end }
  }

  /// Probability the threading lineage avoids coalescence from time k to b
  #[inline]
  pub fn survive(&self, path: i32, k: i32, b: i32) -> f64 {
    let (k, b) = (k.max(0) as usize, (b as usize).min(self.ntimes - 1));
    if b <= k {
      return 1.0;
    }
    (-(self.cum[path as usize][b] - self.cum[path as usize][k])).exp()
  }

  /// Probability of coalescing within interval b, per coalescent target
  #[inline]
  pub fn coal_end(&self, path: i32, b: i32) -> f64 {
    self.coal_end[path as usize][(b as usize).min(self.ntimes - 1)]
  }
}

/// Exposure weight of a recombination at discrete time k on a branch
/// spanning [bottom, top]
pub fn recomb_time_weight(grid: &TimeGrid, k: i32, bottom: i32, top: i32) -> f64 {
  let ku = k as usize;
  let mut w = 0.0;
  if k > bottom {
    w += grid.coal_time_steps[2 * ku - 1];
  }
  if k < top && 2 * ku < grid.coal_time_steps.len() {
    w += grid.coal_time_steps[2 * ku];
  }
  if w == 0.0 {
    w = grid.coal_time_steps[2 * ku];
  }
  w
}

/// Block transition matrix within one local tree, stored in the decomposed
/// form the forward recursion consumes:
///
/// - a time-group table indexed by `(a, b, path_a, path_b)`, independent of
///   the source branch (recombination on the threading branch itself);
/// - a same-branch correction per `(state, a)` (recombination on the target
///   branch, possible only when source and target share the branch);
/// - a no-recombination self term per time.
///
/// Same-node/same-time/different-path transitions flow through the time-group
/// table, whose path pair indexing makes them distinct entries.
pub struct TransMatrix {
  pub ntimes: usize,
  pub numpath: usize,
  pub internal: bool,
  pub minage: i32,
  pub norecomb: Vec<f64>,
  pub recomb_prob: Vec<f64>,
  pub rates: CoalRates,
  tgroup: Vec<f64>,
  same_branch: Vec<Vec<f64>>,
  pub states_by_node: Vec<Vec<usize>>,
}

impl TransMatrix {
  pub fn new(
    model: &ArgModel,
    tree: &LocalTree,
    states: &[State],
    lineages: &LineageCounts,
    states_model: &StatesModel,
    rho: f64,
  ) -> Self {
    let ntimes = model.ntimes();
    let numpath = model.num_pop_paths();
    let internal = states_model.internal;
    let minage = states_model.effective_minage(tree);
    let times = model.times();
    let grid = &model.grid;
    let rates = CoalRates::new(model, lineages);

    // tree length as a function of the threading time
    let base_treelen = if internal {
      get_treelen_internal(tree, times)
    } else {
      get_treelen(tree, times, false)
    };
    let root_age = if internal {
      let maintree_root = tree[tree.root].child[1];
      (tree[maintree_root].age as usize).min(ntimes - 2)
    } else {
      (tree[tree.root].age as usize).min(ntimes - 2)
    };
    let basal = times[root_age + 1] - times[root_age];

    let mut norecomb = vec![1.0; ntimes];
    let mut recomb_prob = vec![0.0; ntimes];
    for a in minage as usize..ntimes - 1 {
      let blen = times[a] - times[minage as usize];
      let treelen = base_treelen + blen + basal;
      norecomb[a] = (-rho * treelen).exp();
      recomb_prob[a] = 1.0 - norecomb[a];
    }

    // time-group table
    let idx = |b: usize, pb: usize, a: usize, pa: usize| ((b * numpath + pb) * ntimes + a) * numpath + pa;
    let mut tgroup = vec![0.0; ntimes * ntimes * numpath * numpath];
    for a in minage as usize..ntimes {
      // normaliser over recombination positions on the new branch
      let mut wnorm = 0.0;
      for k in minage as usize..=a {
        wnorm += recomb_time_weight(grid, k as i32, minage, a as i32);
      }
      if wnorm <= 0.0 {
        wnorm = 1.0;
      }

      for pa in 0..numpath {
        for b in minage as usize..ntimes {
          let cap = a.min(b);
          for pb in 0..numpath {
            let mut sum = 0.0;
            for k in minage as usize..=cap {
              if !model.paths_equal(pa as i32, pb as i32, minage, k as i32) {
                continue;
              }
              sum += recomb_time_weight(grid, k as i32, minage, a as i32)
                * rates.survive(pb as i32, k as i32, b as i32)
                * model.path_prob(pb as i32, k as i32, b as i32);
            }
            tgroup[idx(b, pb, a, pa)] = recomb_prob[a] * sum / wnorm * rates.coal_end(pb as i32, b as i32);
          }
        }
      }
    }

    // same-branch correction per target state and source time
    let mut same_branch = vec![vec![0.0; ntimes]; states.len()];
    for (k, s) in states.iter().enumerate() {
      let b = s.time;
      let c = tree[s.node].age.max(minage);
      for a in minage..ntimes as i32 {
        let cap = a.min(b);
        if cap < c {
          continue;
        }
        let mut wnorm = 0.0;
        for kr in minage..=a {
          wnorm += recomb_time_weight(grid, kr, minage, a);
        }
        if wnorm <= 0.0 {
          wnorm = 1.0;
        }
        let mut sum = 0.0;
        for kr in c..=cap {
          sum += recomb_time_weight(grid, kr, c, cap)
            * rates.survive(s.pop_path, kr, b)
            * model.path_prob(s.pop_path, kr, b);
        }
        same_branch[k][a as usize] = recomb_prob[a as usize] * sum / wnorm * rates.coal_end(s.pop_path, b);
      }
    }

    let mut states_by_node = vec![Vec::new(); tree.nnodes()];
    for (k, s) in states.iter().enumerate() {
      states_by_node[s.node as usize].push(k);
    }

    Self {
      ntimes,
      numpath,
      internal,
      minage,
      norecomb,
      recomb_prob,
      rates,
      tgroup,
      same_branch,
      states_by_node,
    }
  }

  #[inline]
  pub fn tgroup_at(&self, b: i32, pb: i32, a: i32, pa: i32) -> f64 {
    let idx = ((b as usize * self.numpath + pb as usize) * self.ntimes + a as usize) * self.numpath + pa as usize;
    self.tgroup[idx]
  }

  #[inline]
  pub fn same_branch_at(&self, state: usize, a: i32) -> f64 {
    self.same_branch[state][a as usize]
  }

  /// Full transition probability between two states (unnormalised)
  pub fn get(&self, model: &ArgModel, states: &[State], i: usize, j: usize) -> f64 {
    let si = states[i];
    let sj = states[j];

    let mut p = self.tgroup_at(sj.time, sj.pop_path, si.time, si.pop_path);
    if si.node == sj.node && model.paths_equal(si.pop_path, sj.pop_path, self.minage, si.time.min(sj.time)) {
      p += self.same_branch[j][si.time as usize];
    }
    if i == j {
      p += self.norecomb[si.time as usize];
    }
    p
  }

  /// One row of the transition matrix, renormalised to sum to one
  pub fn row_normalized(&self, model: &ArgModel, states: &[State], i: usize) -> Vec<f64> {
    let mut row: Vec<f64> = (0..states.len()).map(|j| self.get(model, states, i, j)).collect();
    let total: f64 = row.iter().sum();
    assert!(total > 0.0 && total.is_finite());
    row.iter_mut().for_each(|x| *x /= total);
    row
  }
}

/// Prior over coalescent states derived from lineage counts: survive from
/// `minage` up to the state's time, then coalesce there
pub fn calc_state_priors(model: &ArgModel, states: &[State], lineages: &LineageCounts, minage: i32) -> Vec<f64> {
  let rates = CoalRates::new(model, lineages);
  let mut priors: Vec<f64> = states
    .iter()
    .map(|s| {
      rates.survive(s.pop_path, minage, s.time)
        * rates.coal_end(s.pop_path, s.time)
        * model.path_prob(s.pop_path, minage, s.time)
    })
    .collect();
  let total: f64 = priors.iter().sum();
  assert!(total > 0.0 && total.is_finite(), "degenerate state prior");
  priors.iter_mut().for_each(|p| *p /= total);
  priors
}

/// Switch transition matrix across one SPR: deterministic images for states
/// unaffected by the recombination, a re-coalescence row for states on the
/// displaced recomb branch, and a split for states at the recoal point.
pub struct TransMatrixSwitch {
  pub nstates1: usize,
  pub nstates2: usize,
  pub determ: Vec<i32>,
  pub determprob: Vec<f64>,
  pub recombsrc: Vec<i32>,
  pub recoalsrc: Vec<i32>,
  recombrows: Array2<f64>,
  recoalrows: Array2<f64>,
}

impl TransMatrixSwitch {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    model: &ArgModel,
    last_tree: &LocalTree,
    tree: &LocalTree,
    spr: &Spr,
    mapping: &[i32],
    states1: &[State],
    states2: &[State],
    lineages: &LineageCounts,
    minage: i32,
  ) -> Self {
    let rates = CoalRates::new(model, lineages);
    let nstates1 = states1.len().max(1);
    let nstates2 = states2.len().max(1);
    let lookup2 = NodeStateLookup::new(states2, minage, model, tree.nnodes());

    let mut determ = vec![-1; nstates1];
    let mut determprob = vec![1.0; nstates1];
    let mut recombsrc = vec![-1; nstates1];
    let mut recoalsrc = vec![-1; nstates1];
    let mut recombrow_list: Vec<Vec<f64>> = Vec::new();
    let mut recoalrow_list: Vec<Vec<f64>> = Vec::new();

    // a re-coalescence row for a lineage detached at (rt, path below pa)
    let recomb_row = |pa: i32, rt: i32| -> Vec<f64> {
      let mut row = vec![0.0; nstates2];
      for (k2, s2) in states2.iter().enumerate() {
        if s2.time < rt || !model.paths_equal(pa, s2.pop_path, minage, rt) {
          continue;
        }
        row[k2] = rates.survive(s2.pop_path, rt, s2.time)
          * rates.coal_end(s2.pop_path, s2.time)
          * model.path_prob(s2.pop_path, rt, s2.time);
      }
      let total: f64 = row.iter().sum();
      if total > 0.0 {
        row.iter_mut().for_each(|x| *x /= total);
      }
      row
    };

    if states1.is_empty() {
      // the thread enters a non-trivial state space from a fully specified
      // block: distribute over the new states like a prior
      if !states2.is_empty() {
        recombsrc[0] = 0;
        recombrow_list.push(recomb_row(0, minage));
      } else {
        determ[0] = 0;
      }
    } else if states2.is_empty() {
      // the thread leaves the state space; everything collapses
      for d in determ.iter_mut() {
        *d = 0;
      }
    } else if spr.recomb_node == spr.coal_node {
      // self SPR: a pure relabeling of population paths
      for (j, s1) in states1.iter().enumerate() {
        determ[j] = lookup2.lookup(model, mapping[s1.node as usize], s1.time, s1.pop_path);
      }
    } else {
      let broken = last_tree[spr.recomb_node].parent;
      let sib = last_tree.sibling(spr.recomb_node);
      let recoal = tree[mapping[spr.recomb_node as usize]].parent;

      for (j, s1) in states1.iter().enumerate() {
        let (n1, a, pa) = (s1.node, s1.time, s1.pop_path);

        if n1 == spr.recomb_node && (a == spr.recomb_time || a > spr.coal_time) {
          // the displaced branch carried the thread: re-coalesce
          recombsrc[j] = recombrow_list.len() as i32;
          recombrow_list.push(recomb_row(pa, spr.recomb_time));
          continue;
        }

        let is_recoal_point = (n1 == spr.coal_node && a == spr.coal_time)
          || (n1 == broken && spr.coal_node == sib && a == spr.coal_time);
        if is_recoal_point {
          // the recoal subdivides this branch: the thread may stay below the
          // new node or follow the branch above it
          let below_node = if n1 == broken { mapping[sib as usize] } else { mapping[n1 as usize] };
          let mut row = vec![0.0; nstates2];
          let k_below = lookup2.lookup(model, below_node, a, pa);
          let k_above = lookup2.lookup(model, recoal, a, pa);
          if k_below != -1 {
            row[k_below as usize] += 0.5;
          }
          if k_above != -1 {
            row[k_above as usize] += 0.5;
          }
          recoalsrc[j] = recoalrow_list.len() as i32;
          recoalrow_list.push(row);
          continue;
        }

        // deterministic image
        let node2 = if n1 == broken {
          if spr.coal_node == sib && a > spr.coal_time {
            recoal
          } else {
            mapping[sib as usize]
          }
        } else if n1 == spr.coal_node && a > spr.coal_time {
          recoal
        } else {
          mapping[n1 as usize]
        };
        determ[j] = lookup2.lookup(model, node2, a, pa);
      }
    }

    let pack = |rows: &[Vec<f64>]| -> Array2<f64> {
      let mut arr = Array2::zeros((rows.len().max(1), nstates2));
      for (r, row) in rows.iter().enumerate() {
        for (k, &v) in row.iter().enumerate() {
          arr[(r, k)] = v;
        }
      }
      arr
    };

    Self {
      nstates1,
      nstates2,
      determ,
      determprob,
      recombsrc,
      recoalsrc,
      recombrows: pack(&recombrow_list),
      recoalrows: pack(&recoalrow_list),
    }
  }

  pub fn get(&self, j: usize, k: usize) -> f64 {
    if self.recombsrc[j] >= 0 {
      return self.recombrows[(self.recombsrc[j] as usize, k)];
    }
    if self.recoalsrc[j] >= 0 {
      return self.recoalrows[(self.recoalsrc[j] as usize, k)];
    }
    if self.determ[j] == k as i32 {
      self.determprob[j]
    } else {
      0.0
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_trees::make_node_mapping;
  use crate::arg::spr::apply_spr;
  use crate::model::time_grid::TimeGrid;
  use approx::assert_abs_diff_eq;
  use lazy_static::lazy_static;
  use rstest::rstest;

  lazy_static! {
    static ref GRID_TIMES: Vec<f64> = vec![0.0, 50.0, 100.0, 200.0, 500.0];
  }

  fn model() -> ArgModel {
    let grid = TimeGrid::new(GRID_TIMES.clone()).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  fn three_leaf_tree() -> LocalTree {
    LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None)
  }

  fn setup() -> (ArgModel, LocalTree, Vec<State>, LineageCounts, StatesModel) {
    let model = model();
    let tree = three_leaf_tree();
    let states_model = StatesModel::new(5);
    let states = states_model.coal_states(&model, &tree);
    let mut lineages = LineageCounts::new(5, 1);
    lineages.count(&tree, None, false);
    (model, tree, states, lineages, states_model)
  }

  #[rstest]
  fn transition_rows_are_probabilities() {
    let (model, tree, states, lineages, states_model) = setup();
    let tm = TransMatrix::new(&model, &tree, &states, &lineages, &states_model, model.rho);

    for i in 0..states.len() {
      let row = tm.row_normalized(&model, &states, i);
      let sum: f64 = row.iter().sum();
      assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
      assert!(row.iter().all(|&p| p >= 0.0 && p.is_finite()));
    }
  }

  #[rstest]
  fn self_transition_dominates_at_low_rho() {
    let (model, tree, states, lineages, states_model) = setup();
    let tm = TransMatrix::new(&model, &tree, &states, &lineages, &states_model, model.rho);
    for i in 0..states.len() {
      let row = tm.row_normalized(&model, &states, i);
      let best = row
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .unwrap()
        .0;
      assert_eq!(best, i, "state {i} does not prefer staying put");
    }
  }

  #[rstest]
  fn zero_rho_forbids_movement() {
    let (model, tree, states, lineages, states_model) = setup();
    let tm = TransMatrix::new(&model, &tree, &states, &lineages, &states_model, 0.0);
    for (i, _) in states.iter().enumerate() {
      for (j, _) in states.iter().enumerate() {
        let p = tm.get(&model, &states, i, j);
        if i == j {
          assert_abs_diff_eq!(p, 1.0, epsilon = 1e-12);
        } else {
          assert_abs_diff_eq!(p, 0.0, epsilon = 1e-12);
        }
      }
    }
  }

  #[rstest]
  fn state_priors_form_distribution() {
    let (model, _, states, lineages, _) = setup();
    let priors = calc_state_priors(&model, &states, &lineages, 0);
    let sum: f64 = priors.iter().sum();
    assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
    assert!(priors.iter().all(|&p| p >= 0.0));
  }

  #[rstest]
  fn switch_matrix_conserves_mass() {
    let (model, tree, states, _lineages, states_model) = setup();
    let spr = Spr::new(1, 0, 2, 2, 0);
    let mut tree2 = tree.clone();
    apply_spr(&mut tree2, &spr, None);
    let mapping = make_node_mapping(&tree, spr.recomb_node);

    let states2 = states_model.coal_states(&model, &tree2);
    let mut lineages2 = LineageCounts::new(5, 1);
    lineages2.count(&tree2, None, false);

    let sw = TransMatrixSwitch::new(&model, &tree, &tree2, &spr, &mapping, &states, &states2, &lineages2, 0);

    for j in 0..states.len() {
      let total: f64 = (0..states2.len()).map(|k| sw.get(j, k)).sum();
      assert!(
        (total - 1.0).abs() < 1e-9,
        "switch row {j} for state {:?} sums to {total}",
        states[j]
      );
    }
  }
}

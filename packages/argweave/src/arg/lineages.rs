use crate::arg::local_tree::LocalTree;
use crate::arg::local_trees::LocalTrees;
use crate::arg::spr::Spr;
use crate::model::arg_model::ArgModel;
use crate::model::population::PopulationModel;

/// Lineage counts per time segment: how many branches cross each interval,
/// how many recombination points and coalescent points each admits.
///
/// `nbranches_pop` is tracked on the half-time grid so that migration between
/// intervals is visible; the *internal* variant excludes the floating subtree
/// of a partial ARG (including its virtual root stub).
#[derive(Clone, Debug)]
pub struct LineageCounts {
  pub ntimes: usize,
  pub npops: usize,
  pub nbranches: Vec<i32>,
  pub nrecombs: Vec<i32>,
  /// [pop][2 * ntimes] branch counts at half-time resolution
  pub nbranches_pop: Vec<Vec<i32>>,
  /// [pop][ntimes] coalescent point counts
  pub ncoals_pop: Vec<Vec<i32>>,
}

impl LineageCounts {
  pub fn new(ntimes: usize, npops: usize) -> Self {
    Self {
      ntimes,
      npops,
      nbranches: vec![0; ntimes],
      nrecombs: vec![0; ntimes],
      nbranches_pop: vec![vec![0; 2 * ntimes]; npops],
      ncoals_pop: vec![vec![0; ntimes]; npops],
    }
  }

  pub fn count(&mut self, tree: &LocalTree, pop_model: Option<&PopulationModel>, internal: bool) {
    if internal {
      self.count_internal(tree, pop_model);
    } else {
      self.count_external(tree, pop_model);
    }
  }

  fn clear(&mut self) {
    self.nbranches.iter_mut().for_each(|x| *x = 0);
    self.nrecombs.iter_mut().for_each(|x| *x = 0);
    for pop in 0..self.npops {
      self.nbranches_pop[pop].iter_mut().for_each(|x| *x = 0);
      self.ncoals_pop[pop].iter_mut().for_each(|x| *x = 0);
    }
  }

  /// Counts one branch spanning [age, parent_age], treating `is_root` as
  /// extending one segment past its top
  fn count_branch(&mut self, tree: &LocalTree, node: i32, parent_age: i32, is_root: bool, pop_model: Option<&PopulationModel>) {
    let node_ref = &tree[node];
    for j in node_ref.age..parent_age {
      let pop = node_ref.get_pop(j, pop_model) as usize;
      self.nbranches[j as usize] += 1;
      self.nrecombs[j as usize] += 1;
      self.nbranches_pop[pop][2 * j as usize] += 1;
      self.ncoals_pop[pop][j as usize] += 1;
      let pop = node_ref.get_pop(j + 1, pop_model) as usize;
      self.nbranches_pop[pop][2 * j as usize + 1] += 1;
    }

    // recomb and coal are also allowed at the top of a branch
    let pop = node_ref.get_pop(parent_age, pop_model) as usize;
    self.nrecombs[parent_age as usize] += 1;
    self.ncoals_pop[pop][parent_age as usize] += 1;
    if is_root {
      self.nbranches[parent_age as usize] += 1;
      self.nbranches_pop[pop][2 * parent_age as usize] += 1;
      let pop = node_ref.get_pop(parent_age + 1, pop_model) as usize;
      self.nbranches_pop[pop][2 * parent_age as usize + 1] += 1;
    }
  }

  /// Forces the last time segment to hold exactly one branch, in the final
  /// population
  fn close_top(&mut self, pop_model: Option<&PopulationModel>) {
    let ntimes = self.ntimes;
    self.nbranches[ntimes - 1] = 1;
    let final_pop = pop_model.map_or(0, PopulationModel::final_pop) as usize;
    for pop in 0..self.npops {
      let val = i32::from(pop == final_pop);
      self.nbranches_pop[pop][2 * ntimes - 2] = val;
      self.nbranches_pop[pop][2 * ntimes - 1] = val;
      self.ncoals_pop[pop][ntimes - 1] = val;
    }
  }

  fn count_external(&mut self, tree: &LocalTree, pop_model: Option<&PopulationModel>) {
    self.clear();
    let ntimes = self.ntimes as i32;

    for i in 0..tree.nnodes() as i32 {
      assert!(tree[i].age < ntimes - 1, "node {i} lives at the top time point");
      let parent = tree[i].parent;
      let parent_age = if parent == -1 { ntimes - 2 } else { tree[parent].age };
      self.count_branch(tree, i, parent_age, parent == -1, pop_model);
    }

    self.close_top(pop_model);
  }

  fn count_internal(&mut self, tree: &LocalTree, pop_model: Option<&PopulationModel>) {
    self.clear();
    let ntimes = self.ntimes as i32;
    let subtree_root = tree[tree.root].child[0];

    for i in 0..tree.nnodes() as i32 {
      // skip virtual branches
      if i == subtree_root || i == tree.root {
        continue;
      }

      assert!(tree[i].age < ntimes - 1, "node {i} lives at the top time point");
      let parent = tree[i].parent;
      let parent_age = if parent == tree.root { ntimes - 2 } else { tree[parent].age };
      self.count_branch(tree, i, parent_age, parent == tree.root, pop_model);
    }

    self.close_top(pop_model);
  }
}

/// Counts migration-eligible branch and SPR events at one migration band:
/// how many lineages cross the `from -> to` band at odd half-time `time_idx2`
/// (`total`) and how many actually migrate (`count`). Invisible (self)
/// recombinations are included when supplied.
pub fn count_mig_events(
  from_pop: i32,
  to_pop: i32,
  time_idx2: usize,
  model: &ArgModel,
  trees: &LocalTrees,
  invisible_recombs: Option<&[Spr]>,
) -> (i32, i32) {
  assert_eq!(time_idx2 % 2, 1, "migrations occur between time intervals");
  let lower_time = (time_idx2 / 2) as i32;
  let upper_time = lower_time + 1;
  let mut count = 0;
  let mut total = 0;

  let tree = &trees.trees[0].tree;
  for i in 0..tree.nnodes() as i32 {
    let crosses = tree[i].age <= lower_time
      && (i == tree.root || tree[tree[i].parent].age >= upper_time);
    if crosses && model.get_pop(tree[i].pop_path, lower_time) == from_pop {
      total += 1;
      if model.get_pop(tree[i].pop_path, upper_time) == to_pop {
        count += 1;
      }
    }
  }

  let all_sprs = trees.trees.iter().map(|it| &it.spr);
  let invisible = invisible_recombs.unwrap_or(&[]).iter();
  for spr in all_sprs.chain(invisible) {
    if spr.is_null() {
      continue;
    }
    if spr.recomb_time > lower_time || spr.coal_time < upper_time {
      continue;
    }
    if model.get_pop(spr.pop_path, lower_time) != from_pop {
      continue;
    }
    total += 1;
    if model.get_pop(spr.pop_path, upper_time) == to_pop {
      count += 1;
    }
  }

  (count, total)
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  fn three_leaf_tree() -> LocalTree {
    LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None)
  }

  #[rstest]
  fn external_counts_sum_to_branches() {
    let tree = three_leaf_tree();
    let mut lineages = LineageCounts::new(5, 1);
    lineages.count(&tree, None, false);

    // 3 branches below time 1, 2 between 1 and 3, then the forced single root
    assert_eq!(lineages.nbranches[0], 3);
    assert_eq!(lineages.nbranches[1], 2);
    assert_eq!(lineages.nbranches[2], 2);
    assert_eq!(lineages.nbranches[3], 1);
    assert_eq!(lineages.nbranches[4], 1);

    // coal points at time 1: segments of nodes 2,3 plus the tops of leaves 0,1
    assert_eq!(lineages.ncoals_pop[0][1], 4);
    assert_eq!(lineages.ncoals_pop[0][3], 3);
    assert_eq!(lineages.ncoals_pop[0][4], 1);
  }

  #[rstest]
  fn internal_counts_skip_virtual_branches() {
    // partial tree: subtree root (leaf 2) floats under a virtual root (node 4)
    let mut tree = three_leaf_tree();
    tree[4].age = 6;
    tree[4].child = [2, 3];
    let mut lineages = LineageCounts::new(5, 1);
    lineages.count(&tree, None, true);

    // only leaves 0,1 and node 3 are counted; node 3 acts as maintree root
    assert_eq!(lineages.nbranches[0], 2);
    assert_eq!(lineages.nbranches[1], 1);
    assert_eq!(lineages.nbranches[3], 1);
    assert_eq!(lineages.nbranches[4], 1);
  }

  #[rstest]
  fn counts_are_idempotent() {
    let tree = three_leaf_tree();
    let mut lineages = LineageCounts::new(5, 1);
    lineages.count(&tree, None, false);
    let first = lineages.nbranches.clone();
    lineages.count(&tree, None, false);
    assert_eq!(lineages.nbranches, first);
  }
}

use crate::arg::local_tree::LocalTree;
use crate::model::arg_model::ArgModel;

/// A coalescent state the threading HMM moves through: the branch being
/// coalesced onto, the discrete time of coalescence, and the population path
/// the threaded lineage follows below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct State {
  pub node: i32,
  pub time: i32,
  pub pop_path: i32,
}

impl State {
  pub fn new(node: i32, time: i32, pop_path: i32) -> Self {
    Self { node, time, pop_path }
  }

  pub fn null() -> Self {
    Self::new(-1, -1, -1)
  }

  #[inline]
  pub fn is_null(&self) -> bool {
    self.node == -1
  }

  pub fn set(&mut self, node: i32, time: i32, pop_path: i32) {
    self.node = node;
    self.time = time;
    self.pop_path = pop_path;
  }
}

impl Default for State {
  fn default() -> Self {
    Self::null()
  }
}

/// Configuration of the coalescent state space: external (leaf threading over
/// all branches) or internal (threading over the maintree of a partial ARG,
/// restricted to `time >= minage`).
#[derive(Clone, Copy, Debug)]
pub struct StatesModel {
  pub ntimes: usize,
  pub internal: bool,
  pub minage: i32,
  pub start_pop: i32,
}

impl StatesModel {
  pub fn new(ntimes: usize) -> Self {
    Self {
      ntimes,
      internal: false,
      minage: 0,
      start_pop: -1,
    }
  }

  pub fn set_internal(&mut self, internal: bool, minage: i32) {
    self.internal = internal;
    self.minage = minage;
  }

  pub fn set_start_pop(&mut self, start_pop: i32) {
    self.start_pop = start_pop;
  }

  /// Effective minimum coalescence time for a given (partial) tree
  pub fn effective_minage(&self, tree: &LocalTree) -> i32 {
    if !self.internal {
      return self.minage;
    }
    let subtree_root = tree[tree.root].child[0];
    self.minage.max(tree[subtree_root].age)
  }

  /// Enumerates the coalescent state set for `tree`.
  ///
  /// For an internal state space over a fully specified tree (no floating
  /// subtree) the set is empty and the block contributes a single given path.
  pub fn coal_states(&self, model: &ArgModel, tree: &LocalTree) -> Vec<State> {
    if self.internal {
      self.coal_states_internal(model, tree)
    } else {
      self.coal_states_external(model, tree)
    }
  }

  fn coal_states_external(&self, model: &ArgModel, tree: &LocalTree) -> Vec<State> {
    let ntimes = self.ntimes as i32;
    let mut states = Vec::new();

    for node in 0..tree.nnodes() as i32 {
      let parent = tree[node].parent;
      let top = if parent == -1 { ntimes - 2 } else { tree[parent].age };
      let bottom = tree[node].age.max(self.minage);
      for time in bottom..=top {
        self.push_states_at(model, tree, node, time, &mut states);
      }
    }

    states
  }

  fn coal_states_internal(&self, model: &ArgModel, tree: &LocalTree) -> Vec<State> {
    let ntimes = self.ntimes as i32;

    // a fully specified tree admits no states
    if tree[tree.root].age <= ntimes {
      return Vec::new();
    }

    let subtree_root = tree[tree.root].child[0];
    let minage = self.minage.max(tree[subtree_root].age);
    let mut in_subtree = vec![false; tree.nnodes()];
    for n in tree.preorder_from(subtree_root) {
      in_subtree[n as usize] = true;
    }

    let mut states = Vec::new();
    for node in 0..tree.nnodes() as i32 {
      if in_subtree[node as usize] || node == tree.root {
        continue;
      }
      let parent = tree[node].parent;
      let top = if parent == tree.root { ntimes - 2 } else { tree[parent].age };
      let bottom = tree[node].age.max(minage);
      for time in bottom..=top {
        self.push_states_with_minage(model, tree, node, time, minage, &mut states);
      }
    }

    states
  }

  fn push_states_at(&self, model: &ArgModel, tree: &LocalTree, node: i32, time: i32, states: &mut Vec<State>) {
    self.push_states_with_minage(model, tree, node, time, self.minage, states);
  }

  /// Pushes one state per representative population path at `(node, time)`:
  /// the path must land in the branch's population at `time`, start in
  /// `start_pop` (when fixed), and paths equal over `[minage, time]` collapse
  /// to their lowest id
  fn push_states_with_minage(
    &self,
    model: &ArgModel,
    tree: &LocalTree,
    node: i32,
    time: i32,
    minage: i32,
    states: &mut Vec<State>,
  ) {
    let Some(pop_model) = &model.pop_model else {
      states.push(State::new(node, time, 0));
      return;
    };

    let numpath = pop_model.num_pop_paths() as i32;
    let node_pop = pop_model.get_pop(tree[node].pop_path, time);
    let admissible = |p: i32| {
      pop_model.get_pop(p, time) == node_pop
        && (self.start_pop < 0 || pop_model.get_pop(p, minage) == self.start_pop)
    };

    for p in 0..numpath {
      if !admissible(p) {
        continue;
      }
      let canonical = (0..p).all(|q| !(admissible(q) && pop_model.paths_equal(q, p, minage, time)));
      if canonical {
        states.push(State::new(node, time, p));
      }
    }
  }
}

/// O(1)-ish lookup from `(node, time, pop_path)` to a state index
pub struct NodeStateLookup {
  minage: i32,
  ntimes: usize,
  numpath: usize,
  table: Vec<i32>,
}

impl NodeStateLookup {
  pub fn new(states: &[State], minage: i32, model: &ArgModel, nnodes: usize) -> Self {
    let ntimes = model.ntimes();
    let numpath = model.num_pop_paths();
    let mut table = vec![-1; nnodes * ntimes * numpath];
    for (i, s) in states.iter().enumerate() {
      let idx = (s.node as usize * ntimes + s.time as usize) * numpath + s.pop_path as usize;
      table[idx] = i as i32;
    }
    Self {
      minage,
      ntimes,
      numpath,
      table,
    }
  }

  /// State index for `(node, time, path)`; paths are resolved up to equality
  /// over `[minage, time]`
  pub fn lookup(&self, model: &ArgModel, node: i32, time: i32, path: i32) -> i32 {
    if node < 0 || time < 0 || time as usize >= self.ntimes {
      return -1;
    }
    let base = (node as usize * self.ntimes + time as usize) * self.numpath;
    let direct = self.table[base + path.max(0) as usize];
    if direct != -1 {
      return direct;
    }
    for p in 0..self.numpath {
      let idx = self.table[base + p];
      if idx != -1 && model.paths_equal(p as i32, path, self.minage, time) {
        return idx;
      }
    }
    -1
  }
}

/// Finds the index of a given state, resolving path representatives
pub fn find_state(states: &[State], target: State, model: &ArgModel, minage: i32) -> i32 {
  for (i, s) in states.iter().enumerate() {
    if s.node == target.node && s.time == target.time && model.paths_equal(s.pop_path, target.pop_path, minage, s.time) {
      return i as i32;
    }
  }
  -1
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::time_grid::TimeGrid;
  use rstest::rstest;

  fn model() -> ArgModel {
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  fn three_leaf_tree() -> LocalTree {
    LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None)
  }

  #[rstest]
  fn external_states_cover_each_branch() {
    let model = model();
    let tree = three_leaf_tree();
    let states = StatesModel::new(5).coal_states(&model, &tree);

    // per-branch intervals: leaves 0,1 -> [0,1]; leaf 2 -> [0,3];
    // node 3 -> [1,3]; root 4 -> [3,3]
    assert_eq!(states.len(), 2 + 2 + 4 + 3 + 1);
    assert!(states.contains(&State::new(0, 0, 0)));
    assert!(states.contains(&State::new(2, 3, 0)));
    assert!(states.contains(&State::new(4, 3, 0)));
    assert!(!states.contains(&State::new(4, 4, 0)));
    assert!(!states.contains(&State::new(0, 2, 0)));
  }

  #[rstest]
  fn minage_restricts_states() {
    let model = model();
    let tree = three_leaf_tree();
    let mut sm = StatesModel::new(5);
    sm.minage = 2;
    let states = sm.coal_states(&model, &tree);
    assert!(states.iter().all(|s| s.time >= 2));
    // leaves 0,1 top out at time 1 and drop out entirely
    assert!(states.iter().all(|s| s.node != 0 && s.node != 1));
  }

  #[rstest]
  fn internal_states_skip_subtree_and_require_partial() {
    let model = model();

    // fully specified tree: no states
    let tree = three_leaf_tree();
    let mut sm = StatesModel::new(5);
    sm.set_internal(true, 0);
    assert!(sm.coal_states(&model, &tree).is_empty());

    // partial tree: virtual root at the sentinel age, subtree = leaf 2
    let mut partial = three_leaf_tree();
    partial[4].age = 6;
    partial[4].child = [2, 3];
    let states = sm.coal_states(&model, &partial);
    assert!(!states.is_empty());
    assert!(states.iter().all(|s| s.node != 2 && s.node != 4));
  }

  #[rstest]
  fn lookup_round_trips() {
    let model = model();
    let tree = three_leaf_tree();
    let states = StatesModel::new(5).coal_states(&model, &tree);
    let lookup = NodeStateLookup::new(&states, 0, &model, tree.nnodes());
    for (i, s) in states.iter().enumerate() {
      assert_eq!(lookup.lookup(&model, s.node, s.time, s.pop_path), i as i32);
    }
    assert_eq!(lookup.lookup(&model, 0, 3, 0), -1);
  }
}

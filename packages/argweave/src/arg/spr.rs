use crate::arg::local_tree::LocalTree;
use crate::model::population::PopulationModel;

/// A subtree-pruning-and-regrafting operation linking two neighbouring local
/// trees: the branch above `recomb_node` is cut at `recomb_time` and the
/// detached subtree regrafts onto `coal_node` at `coal_time`, migrating along
/// `pop_path`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spr {
  pub recomb_node: i32,
  pub recomb_time: i32,
  pub coal_node: i32,
  pub coal_time: i32,
  pub pop_path: i32,
}

impl Spr {
  pub fn new(recomb_node: i32, recomb_time: i32, coal_node: i32, coal_time: i32, pop_path: i32) -> Self {
    Self {
      recomb_node,
      recomb_time,
      coal_node,
      coal_time,
      pop_path,
    }
  }

  pub fn null() -> Self {
    Self::new(-1, -1, -1, -1, -1)
  }

  #[inline]
  pub fn is_null(&self) -> bool {
    self.recomb_node == -1
  }

  pub fn set_null(&mut self) {
    *self = Self::null();
  }
}

impl Default for Spr {
  fn default() -> Self {
    Self::null()
  }
}

/// Mutates `tree` in place to reflect the SPR.
///
/// Before:                After:
///       bp          cp        bp         cp
///      /  \           \      /  \          \
///     rc               c    rs              rc
///    /  \                                  /  \
///   r    rs                               r    c
///
/// r = recomb branch, rs = its sibling, rc = broken node (reused as the new
/// coalescent node), bp = broken node's parent, c = coal branch.
///
/// Population paths: the recomb branch carries its old path up to
/// `recomb_time`, the SPR's path on `[recomb_time, coal_time]`, and the coal
/// node's path above; the sibling inherits a freshly computed path to the root.
pub fn apply_spr(tree: &mut LocalTree, spr: &Spr, pop_model: Option<&PopulationModel>) {
  assert!(
    spr.recomb_node != tree.root,
    "recombination on the root branch is not a valid SPR"
  );

  if spr.recomb_node == spr.coal_node {
    // self SPR: only the population path of the branch changes
    let pop_model = pop_model.expect("self SPR without a population model is a no-op pseudo-SPR");
    let path1 = tree[spr.recomb_node].pop_path;
    let path2 = spr.pop_path;
    assert!(
      !pop_model.paths_equal(path1, path2, spr.recomb_time, spr.coal_time),
      "self SPR with a trivial path composition"
    );
    let age = tree[spr.recomb_node].age;
    let path3 = pop_model.consistent_path(path1, path2, age, spr.recomb_time, spr.coal_time);
    tree[spr.recomb_node].pop_path = pop_model.consistent_path(path3, path1, age, spr.coal_time, -1);
    return;
  }

  // recoal is also the node we are breaking
  let recoal = tree[spr.recomb_node].parent;

  let c = tree[recoal].child;
  let other = usize::from(c[0] == spr.recomb_node);
  let recomb_sib = c[other];
  let broke_parent = tree[recoal].parent;
  if let Some(pop_model) = pop_model {
    let sib_path = pop_model.path_to_root(&tree.nodes, recomb_sib);
    tree[recomb_sib].pop_path = sib_path;
  }

  // splice sibling up to the broken node's parent
  tree[recomb_sib].parent = broke_parent;
  let mut x = 0;
  if broke_parent != -1 {
    let c = tree[broke_parent].child;
    x = usize::from(c[0] != recoal);
    tree[broke_parent].child[x] = recomb_sib;
  }

  // reuse the broken node as the new coalescent node
  if spr.coal_node == recoal {
    // we just broke coal_node, so attach onto recomb_sib instead
    let sib_parent = tree[recomb_sib].parent;
    tree[recoal].child[other] = recomb_sib;
    tree[recoal].parent = sib_parent;
    tree[recomb_sib].parent = recoal;
    if broke_parent != -1 {
      tree[broke_parent].child[x] = recoal;
    }
    if pop_model.is_some() {
      let sib_path = tree[recomb_sib].pop_path;
      tree[recoal].pop_path = sib_path;
    }
  } else {
    let coal_parent = tree[spr.coal_node].parent;
    let coal_path = tree[spr.coal_node].pop_path;
    tree[recoal].child[other] = spr.coal_node;
    tree[recoal].parent = coal_parent;
    tree[recoal].pop_path = coal_path;
    tree[spr.coal_node].parent = recoal;

    let parent = tree[recoal].parent;
    if parent != -1 {
      let c = &mut tree[parent].child;
      if c[0] == spr.coal_node {
        c[0] = recoal;
      } else {
        c[1] = recoal;
      }
    }
  }

  if let Some(pop_model) = pop_model {
    let age = tree[spr.recomb_node].age;
    let path1 = pop_model.consistent_path(
      tree[spr.recomb_node].pop_path,
      spr.pop_path,
      age,
      spr.recomb_time,
      spr.coal_time,
    );
    let recomb_path = pop_model.consistent_path(path1, tree[spr.coal_node].pop_path, age, spr.coal_time, -1);
    tree[spr.recomb_node].pop_path = recomb_path;
  }
  tree[recoal].age = spr.coal_time;

  tree.root = if spr.coal_node == tree.root {
    recoal
  } else if recoal == tree.root {
    if spr.coal_node == recomb_sib {
      recoal
    } else {
      recomb_sib
    }
  } else {
    tree.root
  };
}

/// Asserts that `spr` with `mapping` consistently links `last_tree` to `tree`.
///
/// For a null SPR the mapping must be a structure-preserving bijection; for a
/// real SPR the constraints of the data model must hold, the broken node must
/// be the unique unmapped node, and the recoal point must sit where the SPR
/// says it does.
pub fn assert_spr(
  last_tree: &LocalTree,
  tree: &LocalTree,
  spr: &Spr,
  mapping: Option<&[i32]>,
  pop_model: Option<&PopulationModel>,
  pruned_internal: bool,
) {
  let mapping = mapping.expect("a non-first tree requires a mapping");

  if spr.is_null() {
    // mapping must be a bijection preserving structure and ages
    let mut mapped = vec![false; tree.nnodes()];
    for i in 0..last_tree.nnodes() as i32 {
      let i2 = mapping[i as usize];
      assert!(i2 != -1, "null SPR with a broken node");
      assert!(!mapped[i2 as usize], "mapping is not injective");
      mapped[i2 as usize] = true;

      let parent = last_tree[i].parent;
      if parent == -1 {
        assert_eq!(tree[i2].parent, -1);
      } else {
        assert_eq!(mapping[parent as usize], tree[i2].parent);
      }

      let c = last_tree[i].child;
      if c[0] == -1 {
        assert_eq!(tree[i2].child, [-1, -1]);
      } else {
        let c2 = tree[i2].child;
        let m = [mapping[c[0] as usize], mapping[c[1] as usize]];
        assert!(
          (m[0] == c2[0] && m[1] == c2[1]) || (m[0] == c2[1] && m[1] == c2[0]),
          "children do not map across a null SPR"
        );
      }
      assert_eq!(last_tree[i].age, tree[i2].age);
    }
    return;
  }

  if let Some(pop_model) = pop_model {
    assert_eq!(
      pop_model.get_pop(last_tree[spr.recomb_node].pop_path, spr.recomb_time),
      pop_model.get_pop(spr.pop_path, spr.recomb_time),
      "SPR path does not start in the recomb branch's population"
    );
    assert_eq!(
      pop_model.get_pop(last_tree[spr.coal_node].pop_path, spr.coal_time),
      pop_model.get_pop(spr.pop_path, spr.coal_time),
      "SPR path does not end in the coal branch's population"
    );
    assert!(pop_model.path_prob(spr.pop_path, spr.recomb_time, spr.coal_time) > 0.0);
  }

  // coal time is as old as recomb time
  assert!(spr.recomb_time <= spr.coal_time, "coal above recomb violated");

  // recomb cannot be on the root branch (self SPRs may touch the root's path)
  if pop_model.is_none() {
    assert!(last_tree[spr.recomb_node].parent != -1, "recomb on root branch");
  }

  // recomb point lies within its branch
  let rparent = last_tree[spr.recomb_node].parent;
  assert!(spr.recomb_time >= last_tree[spr.recomb_node].age);
  if rparent != -1 {
    assert!(spr.recomb_time <= last_tree[rparent].age);
  }

  // coal point lies within its branch
  assert!(spr.coal_time >= last_tree[spr.coal_node].age);
  let cparent = last_tree[spr.coal_node].parent;
  if cparent != -1 {
    assert!(spr.coal_time <= last_tree[cparent].age);
  }

  // recomb-bearing branch cannot be the broken one
  assert!(mapping[spr.recomb_node as usize] != -1, "recomb branch is broken");

  if spr.recomb_node == spr.coal_node {
    // self SPR: permitted only when the path actually changes, and the
    // mapping must then be a relabeling bijection
    let pop_model = pop_model.expect("self SPR requires a population model");
    assert!(!pop_model.paths_equal(
      last_tree[spr.recomb_node].pop_path,
      spr.pop_path,
      spr.recomb_time,
      spr.coal_time
    ));
    assert!(spr.recomb_time != spr.coal_time);
    for i in 0..last_tree.nnodes() as i32 {
      let i2 = mapping[i as usize];
      assert!(i2 >= 0 && (i2 as usize) < tree.nnodes());
      assert_eq!(last_tree[i].age, tree[i2].age);
      let last_parent = last_tree[i].parent;
      if last_parent == -1 {
        assert_eq!(tree[i2].parent, -1);
      } else {
        assert_eq!(mapping[last_parent as usize], tree[i2].parent);
      }
    }
    return;
  }

  // the recoal point must be above the mapped recomb branch
  let recoal = tree[mapping[spr.recomb_node as usize]].parent;
  assert!(recoal != -1, "mapped recomb branch has no recoal parent");
  let c = tree[recoal].child;
  let other = if c[0] == mapping[spr.recomb_node as usize] { c[1] } else { c[0] };
  if mapping[spr.coal_node as usize] != -1 {
    assert_eq!(other, mapping[spr.coal_node as usize], "recoal sibling is not the coal branch");
  } else {
    // the coal node is itself the broken node
    let broken = last_tree[spr.recomb_node].parent;
    let c = last_tree[broken].child;
    let last_other = if c[0] == spr.recomb_node { c[1] } else { c[0] };
    assert!(mapping[last_other as usize] != -1);
    assert_eq!(tree[mapping[last_other as usize]].parent, recoal);
  }

  // mapped nodes do not change age; leaves stay leaves; in a complete ARG
  // the broken node is the unique unmapped node (a pruned ARG also loses the
  // images of its virtual branches)
  for i in 0..last_tree.nnodes() as i32 {
    let i2 = mapping[i as usize];
    if i2 != -1 {
      assert_eq!(last_tree[i].age, tree[i2].age, "age changed across SPR for node {i}");
      if last_tree[i].is_leaf() {
        assert!(tree[i2].is_leaf());
      }
    } else if !pruned_internal {
      assert!(
        i == last_tree[spr.recomb_node].parent,
        "node {i} is unmapped but is not the broken node"
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_tree::assert_tree;
  use rstest::rstest;

  /// Starting tree T = ((0:50,1:50)3:100,2:150)4 as grid indices:
  /// ages 0,0,0 for leaves, 1 for node 3, 3 for node 4 over the grid
  /// [0, 50, 100, 150, 200].
  fn start_tree() -> LocalTree {
    LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None)
  }

  #[rstest]
  fn apply_spr_reuses_broken_node() {
    // cut above leaf 1 at t=20 and regraft onto leaf 2 at t=80, on the grid
    // [0, 20, 50, 80, 100, 150, 200]: leaves at 0, node 3 at 50 (idx 2),
    // node 4 at 150 (idx 5); recomb_time 20 (idx 1), coal_time 80 (idx 3)
    let mut tree = LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 2, 5]), None);
    let spr = Spr::new(1, 1, 2, 3, 0);
    apply_spr(&mut tree, &spr, None);
    assert_tree(&tree, None);

    // broken node 3 is reused as the new coalescent node above (1, 2)
    assert_eq!(tree[3].age, 3);
    let mut kids = tree[3].child;
    kids.sort_unstable();
    assert_eq!(kids, [1, 2]);
    assert_eq!(tree[1].parent, 3);
    assert_eq!(tree[2].parent, 3);
    // sibling 0 now hangs off the old root
    assert_eq!(tree[0].parent, 4);
    assert_eq!(tree.root, 4);
  }

  #[rstest]
  fn apply_spr_moves_root_when_coal_above_root() {
    // regraft leaf 0 onto the root branch: recoal becomes the new root
    let mut tree = start_tree();
    let spr = Spr::new(0, 0, 4, 4, 0);
    apply_spr(&mut tree, &spr, None);
    assert_tree(&tree, None);
    assert_eq!(tree.root, 3);
    assert_eq!(tree[3].age, 4);
    let mut kids = tree[3].child;
    kids.sort_unstable();
    assert_eq!(kids, [0, 4]);
  }

  #[rstest]
  fn apply_spr_mapping_checks_out() {
    let last_tree = start_tree();
    let mut tree = start_tree();
    let spr = Spr::new(1, 0, 2, 2, 0);
    apply_spr(&mut tree, &spr, None);

    // identity mapping except broken node 3
    let mut mapping = vec![0, 1, 2, 3, 4];
    mapping[3] = -1;
    // broken node was reused as recoal with id 3; remap it
    let recoal = tree[1].parent;
    assert_eq!(recoal, 3);
    assert_spr(&last_tree, &tree, &spr, Some(&mapping), None, false);
  }

  #[rstest]
  #[should_panic]
  fn apply_spr_rejects_root_recomb() {
    let mut tree = start_tree();
    let spr = Spr::new(4, 3, 2, 3, 0);
    apply_spr(&mut tree, &spr, None);
  }

  #[rstest]
  #[should_panic]
  fn assert_spr_rejects_recomb_above_coal() {
    let last_tree = start_tree();
    let tree = start_tree();
    let spr = Spr::new(0, 2, 2, 1, 0);
    let mapping = vec![0, 1, 2, -1, 4];
    assert_spr(&last_tree, &tree, &spr, Some(&mapping), None, false);
  }
}

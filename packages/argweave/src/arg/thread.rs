use crate::arg::local_tree::{LocalNode, LocalTree};
use crate::arg::local_trees::{assert_trees, remove_null_sprs, LocalTreeSpr, LocalTrees};
use crate::arg::removal::get_next_removal_nodes;
use crate::arg::spr::{apply_spr, assert_spr, Spr};
use crate::hmm::states::{NodeStateLookup, State, StatesModel};
use crate::model::arg_model::ArgModel;

/// Renames a node from `src` to `dest` while maintaining tree structure
pub fn rename_node(tree: &mut LocalTree, src: i32, dest: i32) {
  if src == dest {
    return;
  }

  tree.nodes[dest as usize] = tree.nodes[src as usize];

  // notify parent of the displacement
  let parent = tree[dest].parent;
  if parent != -1 {
    let c = &mut tree[parent].child;
    if c[0] == src {
      c[0] = dest;
    } else {
      c[1] = dest;
    }
  }

  // notify children of the displacement
  let c = tree[dest].child;
  if c[0] != -1 {
    tree[c[0]].parent = dest;
  }
  if c[1] != -1 {
    tree[c[1]].parent = dest;
  }
}

/// Adds a new leaf connecting at `(node, time)`.
///
/// Naming is deterministic: the new leaf takes id `nleaves` (so leaves stay
/// in the first slots), the node formerly named `nleaves` is displaced to
/// `nnodes`, and the new internal node is `nnodes + 1`.
pub fn add_tree_branch(tree: &mut LocalTree, node: i32, time: i32, pop_path: i32) {
  let nleaves = tree.num_leaves() as i32;
  let nnodes = tree.nnodes() as i32;

  let newleaf = nleaves;
  let displaced = nnodes;
  let newcoal = nnodes + 1;

  // determine displacement before touching the array
  let node2 = if node != newleaf { node } else { displaced };
  let parent = tree[node].parent;
  let parent2 = if parent != newleaf { parent } else { displaced };

  tree.nodes.resize(nnodes as usize + 2, LocalNode::default());
  if newleaf < displaced {
    rename_node(tree, newleaf, displaced);
  }

  // new leaf and new coalescent node
  tree[newleaf] = LocalNode::new(newcoal, [-1, -1], 0, pop_path);
  let sib_path = tree[node2].pop_path;
  tree[newcoal] = LocalNode::new(parent2, [newleaf, node2], time, sib_path);

  tree[node2].parent = newcoal;
  if parent2 != -1 {
    let c = &mut tree[parent2].child;
    if c[0] == node2 {
      c[0] = newcoal;
    } else {
      c[1] = newcoal;
    }
  }

  if tree[newcoal].parent == -1 {
    tree.root = newcoal;
  } else if tree.root == newleaf {
    tree.root = displaced;
  }
}

/// Removes a leaf branch; the inverse of [`add_tree_branch`].
///
/// Returns the `displace` vector recording every rename so callers can
/// rewrite their mappings (`-1` for the two deleted nodes).
pub fn remove_tree_branch(tree: &mut LocalTree, remove_leaf: i32, model: &ArgModel) -> Vec<i32> {
  let nnodes = tree.nnodes() as i32;
  let last_leaf = tree.num_leaves() as i32 - 1;

  // unlink the leaf's coalescent node
  let remove_coal = tree[remove_leaf].parent;
  let c = tree[remove_coal].child;
  let coal_child = if c[0] == remove_leaf { c[1] } else { c[0] };
  let coal_parent = tree[remove_coal].parent;
  tree[coal_child].parent = coal_parent;
  if model.pop_model.is_some() {
    let top = if coal_parent == -1 {
      model.ntimes() as i32 - 1
    } else {
      tree[coal_parent].age
    };
    let path = model.consistent_path(
      tree[coal_child].pop_path,
      tree[remove_coal].pop_path,
      tree[coal_child].age,
      tree[remove_coal].age,
      top,
    );
    tree[coal_child].pop_path = path;
  }
  if coal_parent != -1 {
    let c = &mut tree[coal_parent].child;
    if c[0] == remove_coal {
      c[0] = coal_child;
    } else {
      c[1] = coal_child;
    }
  }

  let mut displace: Vec<i32> = (0..nnodes).collect();
  displace[remove_leaf as usize] = -1;
  displace[remove_coal as usize] = -1;

  // move the last leaf into the removed leaf's slot
  if last_leaf != remove_leaf {
    displace[last_leaf as usize] = remove_leaf;
    rename_node(tree, last_leaf, remove_leaf);
  }

  // move the top two ids into the holes
  let mut hole = last_leaf;
  if remove_coal != nnodes - 2 {
    displace[(nnodes - 2) as usize] = hole;
    rename_node(tree, nnodes - 2, hole);
    hole = remove_coal;
  }
  if remove_coal != nnodes - 1 {
    displace[(nnodes - 1) as usize] = hole;
    rename_node(tree, nnodes - 1, hole);
  }

  tree.nodes.truncate((nnodes - 2) as usize);
  let mut root = tree.root;
  if tree.root == remove_coal {
    root = coal_child;
  }
  if root == nnodes - 2 {
    root = last_leaf;
  }
  if root == nnodes - 1 {
    root = hole;
  }
  tree.root = root;

  displace
}

/// Updates the SPR and mapping between two neighbouring local trees after a
/// new leaf branch was added to both.
///
/// This is a case analysis on where the new branch sits relative to the
/// recomb node, the coal node, and the broken node: the recomb branch may be
/// renamed, the coalescence may be mediated by the new branch, or the new
/// branch escapes untouched.
#[allow(clippy::too_many_arguments)]
fn add_spr_branch(
  tree: &LocalTree,
  last_tree: &LocalTree,
  state: State,
  last_state: State,
  spr: &mut Spr,
  mapping: &mut [i32],
  newleaf: i32,
  displaced: i32,
  newcoal: i32,
) {
  let mut fix_mapping = true;

  let last_node2 = if last_state.node != newleaf { last_state.node } else { displaced };
  let node2 = if state.node != newleaf { state.node } else { displaced };

  // update mapping due to displacement
  mapping[displaced as usize] = mapping[newleaf as usize];
  mapping[newleaf as usize] = newleaf;
  mapping[newcoal as usize] = newcoal;
  for i in (newleaf + 1) as usize..tree.nnodes() {
    if mapping[i] == newleaf {
      mapping[i] = displaced;
    }
  }

  // update SPR due to displacement
  if spr.recomb_node == newleaf {
    spr.recomb_node = displaced;
  }
  if spr.coal_node == newleaf {
    spr.coal_node = displaced;
  }

  // the parent of the recomb node should be the recoal point; if it equals
  // newcoal, then either (1) the recomb branch is renamed, (2) the new
  // branch escapes, or (3) there is mediation
  let recoal = tree[mapping[spr.recomb_node as usize]].parent;
  if spr.recomb_node == spr.coal_node {
    if last_state.node == spr.recomb_node {
      if last_state.time < spr.recomb_time
        || (last_state.time == spr.recomb_time && state.time == spr.recomb_time)
      {
        spr.recomb_node = last_tree[spr.recomb_node].parent;
        spr.coal_node = spr.recomb_node;
        fix_mapping = false;
      } else if last_state.time >= spr.recomb_time && last_state.time < spr.coal_time {
        if state.time <= last_state.time {
          assert!(state.time >= spr.recomb_time);
          spr.coal_node = last_tree.sibling(spr.recomb_node);
          spr.coal_time = state.time;
          mapping[newcoal as usize] = -1;
          fix_mapping = false;
        } else {
          assert_eq!(state.time, spr.coal_time);
          spr.coal_node = newcoal;
          mapping[newcoal as usize] = -1;
          fix_mapping = false;
        }
      } else if last_state.time == spr.coal_time {
        spr.coal_time = state.time;
        spr.coal_node = last_tree.sibling(spr.recomb_node);
        mapping[newcoal as usize] = -1;
        fix_mapping = false;
      }
      // if last_state.time > spr.coal_time there is nothing to do
    }
  } else if recoal == newcoal {
    if mapping[last_node2 as usize] == node2 {
      // (1) recomb is above the coal state, rename the recomb node
      spr.recomb_node = newcoal;
    } else {
      let state_node = if state.node != newleaf { state.node } else { displaced };
      if state_node == mapping[spr.recomb_node as usize] {
        // (3) mediated coalescence: rename coal node and time
        spr.coal_node = newleaf;
        assert!(spr.coal_time >= state.time);
        spr.coal_time = state.time;
      }
      // (2) otherwise the new branch escapes; nothing to update
    }
  } else {
    // newcoal may sit under the recoal point: if newcoal is a child of
    // recoal, the coalescence is renamed
    let c = tree[recoal].child;
    if (c[0] == newcoal || c[1] == newcoal) && last_tree[spr.coal_node].parent == newcoal {
      spr.coal_node = newcoal;
    }
  }

  // determine whether the mapping of the new node must change:
  // newcoal is broken when it was the parent of the recomb node
  if fix_mapping {
    if last_tree[spr.recomb_node].parent == newcoal {
      if spr.recomb_node != spr.coal_node {
        mapping[newcoal as usize] = -1;
        let p = last_tree[newcoal].parent;
        if p != -1 {
          mapping[p as usize] = newcoal;
        }
      }
    } else {
      // newcoal was not broken: walk down to a child clear of the recomb
      // and coal branches and map through it
      let mut x = newcoal;
      loop {
        let mut y = last_tree[x].child[0];
        if y == spr.coal_node || y == spr.recomb_node {
          y = last_tree[x].child[1];
        }
        x = y;
        if mapping[x as usize] != -1 {
          break;
        }
      }
      mapping[newcoal as usize] = tree[mapping[x as usize]].parent;
    }
  }
}

/// Splices a sampled leaf thread into the ARG: adds the new branch to every
/// local tree, repairs each SPR and mapping, and breaks blocks at every
/// sampled recombination.
pub fn add_arg_thread(
  trees: &mut LocalTrees,
  model: &ArgModel,
  states_model: &StatesModel,
  thread_path: &[i32],
  seqid: i32,
  recomb_pos: &[i32],
  recombs: &[Spr],
) {
  let pop_model = model.pop_model.as_ref();
  let nleaves = trees.num_leaves() as i32;
  let nnodes = trees.nnodes as i32;
  let nnodes2 = nnodes + 2;

  let newleaf = nleaves;
  let displaced = nnodes;
  let newcoal = nnodes + 1;

  assert_trees(trees, pop_model, true);

  trees.seqids.push(seqid);
  trees.nnodes = nnodes2 as usize;

  let start_coord = trees.start_coord;
  let tp = |pos: i32| thread_path[(pos - start_coord) as usize] as usize;

  let mut irecomb = 0;
  let mut last_state = State::null();
  let mut end = trees.start_coord;
  let mut i = 0;
  while i < trees.trees.len() {
    let mut start = end;
    end += trees.trees[i].blocklen;

    let states = states_model.coal_states(model, &trees.trees[i].tree);

    // add the new branch to this local tree
    let state = states[tp(start)];
    add_tree_branch(&mut trees.trees[i].tree, state.node, state.time, state.pop_path);

    // update mapping and SPR
    if i > 0 && trees.trees[i].mapping.is_some() {
      let (left, right) = trees.trees.split_at_mut(i);
      let it = &mut right[0];
      let last_tree = &left[i - 1].tree;
      let mapping = it.mapping.as_mut().unwrap();
      mapping.resize(nnodes2 as usize, -1);
      add_spr_branch(
        &it.tree, last_tree, state, last_state, &mut it.spr, mapping, newleaf, displaced, newcoal,
      );
      assert_spr(last_tree, &it.tree, &it.spr, Some(mapping), pop_model, false);
    }

    assert_eq!(trees.trees[i].tree[newcoal].age, state.time);

    // break this block at each sampled recombination within it
    while irecomb < recombs.len() && recomb_pos[irecomb] < end {
      let pos = recomb_pos[irecomb];
      let state = states[tp(pos)];
      let last_state = states[tp(pos - 1)];

      let tree = &trees.trees[i].tree;
      assert_eq!(tree[newcoal].age, last_state.time);

      // resolve the real names of the recomb and coal nodes: they may have
      // changed when the new branch was added
      let mut spr2 = recombs[irecomb];
      if spr2.recomb_node == newleaf {
        spr2.recomb_node = displaced;
      }
      if spr2.coal_node == newleaf {
        spr2.coal_node = displaced;
      }
      assert!(spr2.recomb_time <= tree[newcoal].age);

      if spr2.recomb_node == -1 && spr2.coal_node == -1 {
        // invisible recombination on the new branch itself
        spr2.recomb_node = newleaf;
        spr2.coal_node = newleaf;
      } else if spr2.recomb_node == -1 {
        // recomb on the new branch, coalescing as the thread dictates
        spr2.recomb_node = newleaf;
        if state.node == last_state.node && state.time > last_state.time {
          spr2.coal_node = newcoal;
        }
      } else {
        // recomb in the ARG, coalescing onto the new branch
        spr2.coal_node = if state.time > last_state.time {
          tree[newleaf].parent
        } else {
          newleaf
        };
      }

      // all nodes keep their names except the broken node
      let mut mapping2: Vec<i32> = (0..nnodes2).collect();
      if spr2.recomb_node != spr2.coal_node {
        mapping2[tree[spr2.recomb_node].parent as usize] = -1;
      }

      let mut new_tree = tree.clone();
      apply_spr(&mut new_tree, &spr2, pop_model);

      let block_end = if irecomb < recombs.len() - 1 {
        recomb_pos[irecomb + 1].min(end)
      } else {
        end
      };

      trees.trees[i].blocklen = pos - start;
      trees.trees.insert(i + 1, LocalTreeSpr::new(new_tree, spr2, block_end - pos, Some(mapping2)));
      i += 1;

      {
        let (left, right) = trees.trees.split_at_mut(i);
        let it = &right[0];
        assert_spr(&left[i - 1].tree, &it.tree, &it.spr, it.mapping.as_deref(), pop_model, false);
      }

      start = pos;
      irecomb += 1;
    }

    // remember this block's final state for the next boundary
    last_state = states[tp(end - 1)];
    if last_state.node == newleaf {
      last_state.node = displaced;
    }
    i += 1;
  }

  assert_trees(trees, pop_model, false);
}

/// Removes a leaf thread from the ARG, the inverse of [`add_arg_thread`].
///
/// If the removed leaf is not the last leaf, the last leaf is renamed into
/// its slot; SPRs touching the removed branch are pruned or redirected and
/// null boundaries are compacted away.
pub fn remove_arg_thread(trees: &mut LocalTrees, remove_seqid: i32, model: &ArgModel) {
  let pop_model = model.pop_model.as_ref();
  let nnodes = trees.nnodes as i32;
  let nleaves = trees.num_leaves() as i32;
  let last_leaf = nleaves - 1;

  let remove_leaf = trees
    .seqids
    .iter()
    .position(|&s| s == remove_seqid)
    .map(|i| i as i32)
    .expect("seqid not present in the ARG");

  // special case: removing one of two leaves leaves a trunk
  if nnodes == 3 {
    assert!(remove_leaf == 0 || remove_leaf == 1);
    let seqid = trees.seqids[(1 - remove_leaf) as usize];
    let pop_path = match pop_model {
      None => 0,
      Some(pop_model) => {
        let tree = &trees.trees[0].tree;
        let path = tree[1 - remove_leaf].pop_path;
        let start_pop = pop_model.get_pop(path, 0);
        pop_model.most_likely_path(start_pop)
      }
    };
    let (start, end) = (trees.start_coord, trees.end_coord);
    trees.make_trunk(start, end, seqid, pop_path);
    return;
  }

  for i in 0..trees.trees.len() {
    // information about the removal before the surgery
    let (remove_coal, coal_time, coal_child) = {
      let tree = &trees.trees[i].tree;
      let remove_coal = tree[remove_leaf].parent;
      (remove_coal, tree[remove_coal].age, tree.sibling(remove_leaf))
    };

    let displace = remove_tree_branch(&mut trees.trees[i].tree, remove_leaf, model);

    // fix this block's mapping for the displacement
    if let Some(mapping) = &mut trees.trees[i].mapping {
      for m in mapping.iter_mut().take((nnodes - 2) as usize) {
        if *m != -1 {
          *m = displace[*m as usize];
        }
      }
      mapping.truncate((nnodes - 2) as usize);
    }

    if i + 1 >= trees.trees.len() {
      continue;
    }

    let (left, right) = trees.trees.split_at_mut(i + 1);
    let tree = &left[i].tree;
    let it2 = &mut right[0];

    // fix the next block's mapping domain for the displacement
    let mapping = it2.mapping.as_mut().unwrap();
    if displace[last_leaf as usize] != -1 {
      mapping[displace[last_leaf as usize] as usize] = mapping[last_leaf as usize];
    }
    if displace[(nnodes - 2) as usize] != -1 {
      mapping[displace[(nnodes - 2) as usize] as usize] = mapping[(nnodes - 2) as usize];
    }
    if displace[(nnodes - 1) as usize] != -1 {
      mapping[displace[(nnodes - 1) as usize] as usize] = mapping[(nnodes - 1) as usize];
    }
    mapping.truncate((nnodes - 2) as usize);

    // fix the next SPR
    let spr = &mut it2.spr;
    let coal_child = displace[coal_child as usize];

    // recomb on the removed branch: prune the SPR
    if spr.recomb_node == remove_leaf {
      spr.set_null();
      continue;
    }

    // the recomb node may have been renamed
    if spr.recomb_node == remove_coal {
      spr.recomb_node = coal_child;
    } else {
      spr.recomb_node = displace[spr.recomb_node as usize];
    }

    // recomb on the root branch: prune the SPR
    if spr.recomb_node == coal_child && tree[coal_child].parent == -1 {
      spr.set_null();
      continue;
    }

    // rename the coal node
    if spr.coal_node == remove_leaf {
      // mediated coalescence collapses onto the sibling branch
      if pop_model.is_some() {
        spr.pop_path = model.consistent_path(
          spr.pop_path,
          tree[coal_child].pop_path,
          spr.recomb_time,
          spr.coal_time,
          coal_time,
        );
      }
      spr.coal_node = coal_child;
      spr.coal_time = coal_time;
    } else if spr.coal_node == remove_coal {
      // move the coalescence down a branch
      spr.coal_node = coal_child;
    } else {
      spr.coal_node = displace[spr.coal_node as usize];
    }

    // prune bubbles
    if spr.recomb_node == spr.coal_node
      && model.paths_equal(tree[spr.recomb_node].pop_path, spr.pop_path, spr.recomb_time, spr.coal_time)
    {
      spr.set_null();
      continue;
    }
  }

  trees.seqids[remove_leaf as usize] = trees.seqids[last_leaf as usize];
  trees.seqids.truncate((nleaves - 1) as usize);
  trees.nnodes = (nnodes - 2) as usize;

  remove_null_sprs(trees);
  assert_trees(trees, pop_model, true);
}

/// Updates the SPR and mapping between two neighbouring partial trees after
/// the floating subtree was re-coalesced into both
#[allow(clippy::too_many_arguments)]
fn add_spr_branch_internal(
  tree: &LocalTree,
  last_tree: &LocalTree,
  state: State,
  last_state: State,
  spr: &mut Spr,
  mapping: &mut [i32],
  subtree_root: i32,
  last_subtree_root: i32,
) {
  let mut fix_mapping = true;
  let node2 = state.node;
  let last_newcoal = last_tree[last_subtree_root].parent;

  // determine newcoal in the current tree
  let newcoal = if state.node != -1 {
    tree[subtree_root].parent
  } else {
    // fully specified tree
    if mapping[last_subtree_root as usize] != -1 {
      tree[mapping[last_subtree_root as usize]].parent
    } else {
      let sib = last_tree.sibling(spr.recomb_node);
      assert!(mapping[sib as usize] != -1);
      tree[mapping[sib as usize]].parent
    }
  };

  mapping[last_newcoal as usize] = newcoal;

  let recoal = tree[mapping[spr.recomb_node as usize]].parent;
  if spr.recomb_node == spr.coal_node {
    if last_state.node == spr.recomb_node {
      if last_state.time < spr.recomb_time
        || (last_state.time == spr.recomb_time && state.time == spr.recomb_time)
      {
        spr.recomb_node = last_tree[spr.recomb_node].parent;
        spr.coal_node = spr.recomb_node;
        fix_mapping = false;
      } else if last_state.time >= spr.recomb_time && last_state.time < spr.coal_time {
        if state.time <= last_state.time {
          assert!(state.time >= spr.recomb_time);
          spr.coal_node = last_tree.sibling(spr.recomb_node);
          spr.coal_time = state.time;
          mapping[last_newcoal as usize] = -1;
          fix_mapping = false;
        } else {
          assert_eq!(state.time, spr.coal_time);
          spr.coal_node = last_newcoal;
          mapping[last_newcoal as usize] = -1;
          fix_mapping = false;
        }
      } else if last_state.time == spr.coal_time {
        spr.coal_time = state.time;
        spr.coal_node = last_tree.sibling(spr.recomb_node);
        mapping[last_newcoal as usize] = -1;
        fix_mapping = false;
      }
      // if last_state.time > spr.coal_time there is nothing to do
    }
  } else if recoal == newcoal {
    if mapping[last_state.node as usize] == node2 {
      // (1) recomb is above the coal state, rename the recomb node
      spr.recomb_node = last_newcoal;
    } else if spr.coal_time == last_tree[last_newcoal].age && state.node == mapping[spr.recomb_node as usize] {
      // (3) mediated coalescence: rename coal node and time
      spr.coal_node = if state.time < last_tree[last_subtree_root].age {
        last_tree.sibling(spr.recomb_node)
      } else {
        last_subtree_root
      };
      assert!(spr.coal_time >= state.time);
      spr.coal_time = state.time;
      assert!(spr.coal_time >= last_tree[spr.coal_node].age);
    }
    // (2) otherwise the new branch escapes; nothing to update
  } else {
    // newcoal may sit under the recoal point
    let c = tree[recoal].child;
    if c[0] == newcoal || c[1] == newcoal {
      if last_tree[spr.coal_node].parent == last_newcoal {
        spr.coal_node = last_newcoal;
      }
      assert!(spr.coal_time >= last_tree[spr.coal_node].age);
      let p = last_tree[spr.coal_node].parent;
      if p != -1 {
        assert!(spr.coal_time <= last_tree[p].age);
      }
    }
  }

  if fix_mapping {
    if last_tree[spr.recomb_node].parent == last_newcoal {
      if spr.recomb_node != spr.coal_node {
        mapping[last_newcoal as usize] = -1;
        let p = last_tree[last_newcoal].parent;
        if p != -1 && spr.coal_node != last_newcoal {
          mapping[p as usize] = newcoal;
        }
      }
    } else {
      // last_newcoal was not broken: map through a child clear of the
      // recomb and coal branches
      let x = last_newcoal;
      let mut y = last_tree[x].child[0];
      if y == spr.coal_node {
        y = last_tree[x].child[1];
      }
      if mapping[y as usize] == -1 {
        y = last_tree.sibling(spr.recomb_node);
      }
      if y == spr.coal_node {
        y = last_tree[x].child[1];
      }
      mapping[last_newcoal as usize] = tree[mapping[y as usize]].parent;
    }
  }
}

/// Re-coalesces a floating subtree into a partial ARG along a sampled thread
/// path, breaking blocks at each sampled recombination
pub fn add_arg_thread_path(
  trees: &mut LocalTrees,
  model: &ArgModel,
  states_model: &StatesModel,
  thread_path: &[i32],
  recomb_pos: &[i32],
  recombs: &[Spr],
) {
  let pop_model = model.pop_model.as_ref();
  let ntimes = model.ntimes() as i32;
  let start_coord = trees.start_coord;
  let tp = |pos: i32| thread_path[(pos - start_coord) as usize] as usize;

  let mut irecomb = 0;
  let mut last_state = State::null();
  let mut last_subtree_root = -1;
  let mut end = trees.start_coord;
  let mut i = 0;
  while i < trees.trees.len() {
    let mut start = end;
    end += trees.trees[i].blocklen;

    let states = states_model.coal_states(model, &trees.trees[i].tree);
    let subtree_root = trees.trees[i].tree[trees.trees[i].tree.root].child[0];

    // a partial tree is re-coalesced according to the thread path
    let state = if trees.trees[i].tree[trees.trees[i].tree.root].age > ntimes {
      assert!(!states.is_empty());
      let mut state = states[tp(start)];
      let subtree_age = trees.trees[i].tree[subtree_root].age;
      if pop_model.is_some() && states_model.minage > subtree_age {
        // re-threading an ancient lineage: reconcile the subtree age with
        // the state-space minimum age
        state.pop_path = model.consistent_path(
          trees.trees[i].tree[subtree_root].pop_path,
          state.pop_path,
          subtree_age,
          states_model.minage,
          state.time,
        );
      }
      let add_spr = Spr::new(subtree_root, subtree_age, state.node, state.time, state.pop_path);
      apply_spr(&mut trees.trees[i].tree, &add_spr, pop_model);
      state
    } else {
      State::null()
    };

    if i > 0 && trees.trees[i].mapping.is_some() && last_state.node != -1 {
      let (left, right) = trees.trees.split_at_mut(i);
      let it = &mut right[0];
      let last_tree = &left[i - 1].tree;
      let mapping = it.mapping.as_mut().unwrap();
      add_spr_branch_internal(
        &it.tree, last_tree, state, last_state, &mut it.spr, mapping, subtree_root, last_subtree_root,
      );
      assert_spr(last_tree, &it.tree, &it.spr, Some(mapping), pop_model, false);
    }

    let mut state = state;
    while irecomb < recombs.len() && recomb_pos[irecomb] < end {
      let pos = recomb_pos[irecomb];
      assert!(!states.is_empty());
      state = states[tp(pos)];
      let last_state = states[tp(pos - 1)];

      let tree = &trees.trees[i].tree;
      let newcoal = tree[subtree_root].parent;
      assert_eq!(tree[newcoal].age, last_state.time);

      let mut spr2 = recombs[irecomb];
      assert!(spr2.recomb_time <= tree[newcoal].age);

      if spr2.recomb_node == subtree_root && spr2.coal_node == subtree_root {
        // only the path of the new branch changes
      } else if spr2.recomb_node == subtree_root {
        // recomb on the new branch, coalescing as the thread dictates
        if state.node == last_state.node && state.time > last_state.time {
          spr2.coal_node = newcoal;
        }
      } else {
        // recomb in the maintree, coalescing onto the new branch
        if state.time > last_state.time {
          spr2.coal_node = newcoal;
        }
      }

      let mut mapping2: Vec<i32> = (0..tree.nnodes() as i32).collect();
      if spr2.recomb_node != spr2.coal_node {
        mapping2[tree[spr2.recomb_node].parent as usize] = -1;
      }

      let mut new_tree = tree.clone();
      apply_spr(&mut new_tree, &spr2, pop_model);

      let block_end = if irecomb < recombs.len() - 1 {
        recomb_pos[irecomb + 1].min(end)
      } else {
        end
      };

      trees.trees[i].blocklen = pos - start;
      trees.trees.insert(i + 1, LocalTreeSpr::new(new_tree, spr2, block_end - pos, Some(mapping2)));
      i += 1;

      start = pos;
      irecomb += 1;
    }

    last_state = state;
    last_subtree_root = subtree_root;
    i += 1;
  }

  assert_trees(trees, pop_model, false);
}

/// Node renames accumulated over a run of null-SPR boundaries ahead of block
/// `i`; returns the effective tree at the end of the run
fn get_actual_nodes<'a>(trees: &'a LocalTrees, i: usize, nodes: &mut [i32]) -> &'a LocalTree {
  for (j, n) in nodes.iter_mut().enumerate() {
    *n = j as i32;
  }

  let mut j = i + 1;
  while j < trees.num_trees() && trees.trees[j].spr.is_null() {
    let mapping = trees.trees[j].mapping.as_ref().unwrap();
    for n in nodes.iter_mut() {
      if *n != -1 {
        *n = mapping[*n as usize];
      }
    }
    j += 1;
  }

  &trees.trees[j - 1].tree
}

/// Removes an internal branch path from the ARG, producing a partial ARG in
/// which every tree carries a floating subtree under a virtual root at the
/// sentinel `maxtime`.
///
/// When `original_thread` is given, the original coalescent state of the
/// removed branch is recorded per position (as indices into the internal
/// state space) so the removal can be undone exactly.
pub fn remove_arg_thread_path(
  trees: &mut LocalTrees,
  model: &ArgModel,
  removal_path: &[i32],
  maxtime: i32,
  original_thread: Option<&mut Vec<i32>>,
) {
  let pop_model = model.pop_model.as_ref();
  let mut original_states: Option<Vec<State>> = original_thread
    .is_some()
    .then(|| vec![State::null(); trees.length() as usize]);

  let start_coord = trees.start_coord;
  let mut end = trees.start_coord;
  for i in 0..trees.trees.len() {
    let start = end;
    end += trees.trees[i].blocklen;

    let removal_node = removal_path[i];

    if removal_node == trees.trees[i].tree.root {
      // the removal path has fallen off the top; nothing to edit
      if i > 0 && trees.trees[i].mapping.is_some() {
        let (left, right) = trees.trees.split_at_mut(i);
        let last_root = left[i - 1].tree.root;
        if removal_path[i - 1] != last_root {
          right[0].mapping.as_mut().unwrap()[last_root as usize] = -1;
        }
      }
      if let Some(states) = &mut original_states {
        for j in start..end {
          states[(j - start_coord) as usize] = State::null();
        }
      }
      continue;
    }

    // prune the removal branch up to a virtual root
    let (broken_node, coal_time, broken_child, orig_path) = {
      let tree = &trees.trees[i].tree;
      let broken_node = tree[removal_node].parent;
      (
        broken_node,
        tree[broken_node].age,
        tree.sibling(removal_node),
        tree[removal_node].pop_path,
      )
    };

    {
      let tree = &mut trees.trees[i].tree;
      let pop_path = pop_model.map_or(0, |p| p.path_to_root(&tree.nodes, removal_node));
      let removal_spr = Spr::new(removal_node, tree[removal_node].age, tree.root, maxtime, pop_path);
      apply_spr(tree, &removal_spr, pop_model);

      // ensure the subtree is the first child of the virtual root
      let subtree_root = removal_node;
      let maintree_root = tree.sibling(subtree_root);
      let root = tree.root;
      let c = &mut tree[root].child;
      if c[0] == maintree_root {
        c[0] = subtree_root;
        c[1] = maintree_root;
      }
    }

    // fix the previous mapping
    if i > 0 && trees.trees[i].mapping.is_some() {
      let (left, right) = trees.trees.split_at_mut(i);
      let last_root = left[i - 1].tree.root;
      if removal_path[i - 1] != last_root {
        let new_root = right[0].tree.root;
        right[0].mapping.as_mut().unwrap()[last_root as usize] = new_root;
      }
    }

    // record the thread being removed
    if let Some(states) = &mut original_states {
      for j in start..end {
        states[(j - start_coord) as usize] = State::new(broken_child, coal_time, orig_path);
      }
    }

    if i + 1 >= trees.trees.len() {
      continue;
    }

    // fix the next SPR
    let (left, right) = trees.trees.split_at_mut(i + 1);
    let tree = &left[i].tree;
    let it2 = &mut right[0];
    let mapping = it2.mapping.as_mut().unwrap();
    let spr = &mut it2.spr;

    if spr.recomb_node == removal_node {
      // recomb on the removed branch: prune the SPR
      let p = tree[spr.recomb_node].parent;
      assert!(mapping[p as usize] != -1 || p == tree.root);
      spr.set_null();
    } else {
      if spr.recomb_node == broken_node {
        spr.recomb_node = broken_child;
      }

      if spr.coal_node == removal_node {
        // the removal path decides which side of the split to follow
        let next = get_next_removal_nodes(tree, spr, mapping, removal_path[i], None);
        if removal_path[i + 1] == next[0] {
          // lower path: the coalescence collapses onto the sibling branch
          if spr.recomb_node == broken_child {
            // the SPR is now a bubble
            let equal = match pop_model {
              None => true,
              Some(pop_model) => {
                pop_model.paths_equal(tree[spr.recomb_node].pop_path, spr.pop_path, spr.recomb_time, spr.coal_time)
                  && pop_model.paths_equal(
                    tree[spr.coal_node].pop_path,
                    tree[spr.recomb_node].pop_path,
                    spr.coal_time,
                    coal_time,
                  )
              }
            };
            if equal {
              spr.set_null();
            } else {
              spr.coal_node = spr.recomb_node;
              spr.pop_path = model.consistent_path(spr.pop_path, orig_path, spr.recomb_time, spr.coal_time, -1);
              spr.coal_time = coal_time;
            }
          } else {
            // mediated coalescence through the removed branch
            if pop_model.is_some() {
              spr.pop_path = model.consistent_path(spr.pop_path, orig_path, spr.recomb_time, spr.coal_time, coal_time);
            }
            spr.coal_node = broken_child;
            spr.coal_time = coal_time;
          }
        } else if removal_path[i + 1] == next[1] {
          // upper path: the coalescence stays at the recoal node, which no
          // other node may map onto
          for j in 0..tree.nnodes() {
            assert!(mapping[j] != removal_path[i + 1]);
          }
        } else {
          unreachable!("removal path does not follow the SPR");
        }
      } else if spr.coal_node == broken_node {
        spr.coal_node = broken_child;
      }
    }

    // prune bubbles and mark the broken node
    if spr.is_null() {
      // nothing further
    } else if spr.recomb_node == spr.coal_node {
      let equal = match pop_model {
        None => true,
        Some(pop_model) => {
          pop_model.paths_equal(tree[spr.recomb_node].pop_path, spr.pop_path, spr.recomb_time, spr.coal_time)
        }
      };
      if equal {
        spr.set_null();
      }
    } else {
      let spr_broken_node = tree[spr.recomb_node].parent;
      mapping[spr_broken_node as usize] = -1;
    }
  }

  // translate the recorded thread into internal state indices
  if let Some(original_thread) = original_thread {
    let original_states = original_states.unwrap();
    let ntimes = (maxtime - 1) as usize;
    let nnodes = trees.nnodes;
    let mut states_model = StatesModel::new(ntimes);
    states_model.set_internal(true, 0);

    original_thread.clear();
    original_thread.resize(trees.length() as usize, 0);

    let mut end = trees.start_coord;
    for i in 0..trees.trees.len() {
      let start = end;
      end += trees.trees[i].blocklen;

      let mut nodes_lookup = vec![0; nnodes];
      let tree2 = get_actual_nodes(trees, i, &mut nodes_lookup);

      let states = states_model.coal_states(model, tree2);
      let lookup = NodeStateLookup::new(&states, 0, model, nnodes);
      for j in start..end {
        let s = original_states[(j - start_coord) as usize];
        if states.is_empty() || s.is_null() {
          original_thread[(j - start_coord) as usize] = 0;
        } else {
          let statei = lookup.lookup(model, nodes_lookup[s.node as usize], s.time, s.pop_path);
          assert!(statei != -1, "original thread state not present in the partial state space");
          original_thread[(j - start_coord) as usize] = statei;
        }
      }
    }
  }

  remove_null_sprs(trees);
  assert_trees(trees, pop_model, true);
}

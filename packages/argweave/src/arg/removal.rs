use crate::arg::local_tree::LocalTree;
use crate::arg::local_trees::{get_inverse_mapping, get_recoal_node, LocalTrees};
use crate::arg::spr::Spr;
use crate::utils::math::{logadd, logsum};
use crate::utils::random::{sample_log_weights, sample_weights};
use rand::Rng;

/// The next possible branches of a removal path across one SPR: the passive
/// image of `node` under the mapping, plus (when `node` is the SPR's coal
/// node) the recoal node itself.
pub fn get_next_removal_nodes(
  tree1: &LocalTree,
  spr2: &Spr,
  mapping2: &[i32],
  node: i32,
  recoal: Option<i32>,
) -> [i32; 2] {
  if spr2.coal_node == spr2.recomb_node {
    let next = mapping2[node as usize];
    assert!(next != -1);
    return [next, -1];
  }

  let recoal = recoal.unwrap_or_else(|| get_recoal_node(tree1, spr2, mapping2));

  // passive transition
  let mut next0 = mapping2[node as usize];
  if next0 == -1 {
    // node is broken by the SPR: follow the merged sibling branch
    let sib = tree1.sibling(spr2.recomb_node);
    next0 = if spr2.coal_node == sib { recoal } else { mapping2[sib as usize] };
  }

  // active transition: the path may split onto the recoal node
  let next1 = if spr2.coal_node == node { recoal } else { -1 };

  [next0, next1]
}

pub fn get_all_next_removal_nodes(tree1: &LocalTree, spr2: &Spr, mapping2: &[i32]) -> Vec<[i32; 2]> {
  let recoal = get_recoal_node(tree1, spr2, mapping2);
  (0..tree1.nnodes() as i32)
    .map(|node| {
      let next = get_next_removal_nodes(tree1, spr2, mapping2, node, Some(recoal));
      assert!(next[0] != next[1]);
      next
    })
    .collect()
}

/// The previous possible branches of a removal path across one SPR
pub fn get_prev_removal_nodes(
  tree1: &LocalTree,
  spr2: &Spr,
  mapping2: &[i32],
  node: i32,
  inv_mapping: Option<&[i32]>,
) -> [i32; 2] {
  if spr2.coal_node == spr2.recomb_node {
    let prev = mapping2
      .iter()
      .position(|&m| m == node)
      .map_or(-1, |i| i as i32);
    assert!(prev != -1);
    return [prev, -1];
  }

  let inv_alloc;
  let inv_mapping = match inv_mapping {
    Some(inv) => inv,
    None => {
      inv_alloc = get_inverse_mapping(mapping2);
      &inv_alloc
    }
  };

  let sib = tree1.sibling(spr2.recomb_node);
  let prev0 = inv_mapping[node as usize];
  let prev = if prev0 == -1 {
    // no preimage, so node is the recoal; the coal branch precedes it
    let second = if sib == spr2.coal_node { tree1[sib].parent } else { -1 };
    [spr2.coal_node, second]
  } else {
    let second = if mapping2[sib as usize] == node && sib != spr2.coal_node {
      tree1[sib].parent
    } else {
      -1
    };
    [prev0, second]
  };

  assert!(prev[0] >= 0 || prev[1] >= 0);
  prev
}

pub fn get_all_prev_removal_nodes(tree1: &LocalTree, spr2: &Spr, mapping2: &[i32]) -> Vec<[i32; 2]> {
  let inv_mapping = get_inverse_mapping(mapping2);
  (0..tree1.nnodes() as i32)
    .map(|node| get_prev_removal_nodes(tree1, spr2, mapping2, node, Some(&inv_mapping)))
    .collect()
}

/// Removal path following a single leaf through every local tree
pub fn sample_arg_removal_leaf_path(trees: &LocalTrees, node: i32) -> Vec<i32> {
  let mut path = Vec::with_capacity(trees.num_trees());
  path.push(node);

  for i in 1..trees.num_trees() {
    let it = &trees.trees[i];
    let last_tree = &trees.trees[i - 1].tree;
    let next = get_next_removal_nodes(last_tree, &it.spr, it.mapping.as_ref().unwrap(), path[i - 1], None);
    path.push(next[0]);
  }

  path
}

fn sample_removal_path_forward(
  trees: &LocalTrees,
  start_block: usize,
  node: i32,
  path: &mut [i32],
  prob_switch: f64,
  rng: &mut impl Rng,
) {
  path[start_block] = node;

  for i in start_block + 1..trees.num_trees() {
    let it = &trees.trees[i];
    let last_tree = &trees.trees[i - 1].tree;
    let next = get_next_removal_nodes(last_tree, &it.spr, it.mapping.as_ref().unwrap(), path[i - 1], None);
    let j = usize::from(next[1] != -1 && rng.gen::<f64>() < prob_switch);
    path[i] = next[j];
  }
}

fn sample_removal_path_backward(
  trees: &LocalTrees,
  start_block: usize,
  path: &mut [i32],
  prob_switch: f64,
  rng: &mut impl Rng,
) {
  for i in (0..start_block).rev() {
    let it = &trees.trees[i + 1];
    let tree1 = &trees.trees[i].tree;
    let prev = get_prev_removal_nodes(tree1, &it.spr, it.mapping.as_ref().unwrap(), path[i + 1], None);
    let j = usize::from(prev[1] != -1 && rng.gen::<f64>() < prob_switch);
    path[i] = prev[j];
  }
}

/// Removal path passing through `node` in the block containing `pos`,
/// extended stochastically in both directions
pub fn sample_arg_removal_path(
  trees: &LocalTrees,
  node: i32,
  pos: i32,
  prob_switch: f64,
  rng: &mut impl Rng,
) -> Vec<i32> {
  let (block, _, _) = trees.get_block(pos).expect("position outside the ARG");
  let mut path = vec![-1; trees.num_trees()];
  sample_removal_path_forward(trees, block, node, &mut path, prob_switch, rng);
  sample_removal_path_backward(trees, block, &mut path, prob_switch, rng);
  path
}

/// Removal path biased toward recombination-bearing branches: a
/// forward-backward pass with emission `recomb_preference` on branches that
/// carry the block's recombination and `1 - recomb_preference` elsewhere
pub fn sample_arg_removal_path_recomb(trees: &LocalTrees, recomb_preference: f64, rng: &mut impl Rng) -> Vec<i32> {
  let ntrees = trees.num_trees();
  let nnodes = trees.nnodes;

  let mut forward = vec![vec![0.0; nnodes]; ntrees];
  let mut backptrs: Vec<Vec<[i32; 2]>> = vec![vec![[-1, -1]; nnodes]; ntrees];
  let mut trans = vec![vec![0.0; nnodes]; ntrees];

  forward[0].iter_mut().for_each(|f| *f = 1.0 / nnodes as f64);

  for i in 1..ntrees {
    let it = &trees.trees[i];
    let last_tree = &trees.trees[i - 1].tree;
    let mapping = it.mapping.as_ref().unwrap();

    let next_nodes = get_all_next_removal_nodes(last_tree, &it.spr, mapping);
    backptrs[i] = get_all_prev_removal_nodes(last_tree, &it.spr, mapping);

    for (j, &next) in next_nodes.iter().enumerate() {
      let k = next[0];
      assert!(backptrs[i][k as usize].contains(&(j as i32)));
      trans[i - 1][j] = if next[1] != -1 { 0.5 } else { 1.0 };
    }

    let spr2 = &it.spr;
    let mut norm = 0.0;
    for j in 0..nnodes {
      let mut sum = 0.0;
      for &k in &backptrs[i][j] {
        if k != -1 {
          sum += trans[i - 1][k as usize] * forward[i - 1][k as usize];
        }
      }
      let emit = if !spr2.is_null() && spr2.recomb_node == j as i32 {
        recomb_preference
      } else {
        1.0 - recomb_preference
      };
      forward[i][j] = sum * emit;
      norm += forward[i][j];
    }

    for j in 0..nnodes {
      forward[i][j] /= norm;
    }
  }

  // stochastic traceback
  let mut path = vec![-1; ntrees];
  let mut j = sample_weights(&forward[ntrees - 1], rng) as i32;
  path[ntrees - 1] = j;
  for i in (0..ntrees - 1).rev() {
    let ptrs = backptrs[i + 1][j as usize];
    j = if ptrs[1] == -1 {
      ptrs[0]
    } else {
      let probs = [
        forward[i][ptrs[0] as usize] * trans[i][j as usize],
        forward[i][ptrs[1] as usize] * trans[i][j as usize],
      ];
      ptrs[sample_weights(&probs, rng)]
    };
    path[i] = j;
  }

  path
}

/// Log-space path-count table for uniform removal-path sampling
pub struct RemovalPaths {
  pub ntrees: usize,
  pub nnodes: usize,
  pub counts: Vec<Vec<f64>>,
  pub backptrs: Vec<Vec<[i32; 2]>>,
}

/// Forward pass over the removal-path DAG, accumulating log path counts per
/// branch by log-add over the back pointers
pub fn count_arg_removal_paths(trees: &LocalTrees) -> RemovalPaths {
  let ntrees = trees.num_trees();
  let nnodes = trees.nnodes;
  let mut counts = vec![vec![0.0; nnodes]; ntrees];
  let mut backptrs: Vec<Vec<[i32; 2]>> = vec![vec![[-1, -1]; nnodes]; ntrees];

  for i in 1..ntrees {
    let it = &trees.trees[i];
    let last_tree = &trees.trees[i - 1].tree;
    backptrs[i] = get_all_prev_removal_nodes(last_tree, &it.spr, it.mapping.as_ref().unwrap());

    for j in 0..nnodes {
      let ptrs = backptrs[i][j];
      counts[i][j] = match (ptrs[0], ptrs[1]) {
        (-1, -1) => f64::NEG_INFINITY,
        (p0, -1) => counts[i - 1][p0 as usize],
        (-1, p1) => counts[i - 1][p1 as usize],
        (p0, p1) => logadd(counts[i - 1][p0 as usize], counts[i - 1][p1 as usize]),
      };
    }
  }

  RemovalPaths {
    ntrees,
    nnodes,
    counts,
    backptrs,
  }
}

/// Log of the total number of removal paths
pub fn count_total_arg_removal_paths(trees: &LocalTrees) -> f64 {
  let removal_paths = count_arg_removal_paths(trees);
  logsum(&removal_paths.counts[removal_paths.ntrees - 1])
}

/// Samples a removal path uniformly from all paths; returns the path and the
/// log total path count
pub fn sample_arg_removal_path_uniform(trees: &LocalTrees, rng: &mut impl Rng) -> (Vec<i32>, f64) {
  let removal_paths = count_arg_removal_paths(trees);
  let RemovalPaths {
    ntrees,
    nnodes: _,
    counts,
    backptrs,
  } = &removal_paths;
  let ntrees = *ntrees;

  let mut path = vec![-1; ntrees];
  path[ntrees - 1] = sample_log_weights(&counts[ntrees - 1], rng) as i32;

  for i in (1..ntrees).rev() {
    let ptrs = backptrs[i][path[i] as usize];
    path[i - 1] = if ptrs[1] == -1 {
      ptrs[0]
    } else if ptrs[0] == -1 {
      ptrs[1]
    } else {
      let p1 = counts[i - 1][ptrs[0] as usize];
      let p2 = counts[i - 1][ptrs[1] as usize];
      if rng.gen::<f64>().ln() < p1 - logadd(p1, p2) {
        ptrs[0]
      } else {
        ptrs[1]
      }
    };
    assert!(path[i - 1] >= 0);
  }

  let total = logsum(&counts[ntrees - 1]);
  (path, total)
}

/// Removal path following haplotype `hap`'s ancestry within the time band
/// `[time_interval, time_interval + 1)`. Returns the path and the coordinates
/// where the band is broken by a recombination at or below the band.
pub fn get_arg_removal_path_by_ind_and_time(
  trees: &LocalTrees,
  time_interval: i32,
  hap: i32,
  do_first: bool,
) -> (Vec<i32>, Vec<i32>) {
  let mut path = vec![-1; trees.num_trees()];
  let mut break_coords = Vec::new();
  let mut coord = trees.start_coord;
  let mut have_last = false;

  for i in 0..trees.num_trees() {
    let tree = &trees.trees[i].tree;

    // climb from the leaf to the branch straddling the band
    let mut node = hap;
    assert!(tree[node].age <= time_interval);
    while node != tree.root {
      let parent = tree[node].parent;
      if tree[parent].age > time_interval {
        break;
      }
      node = parent;
    }

    if have_last {
      let it = &trees.trees[i];
      let last_tree = &trees.trees[i - 1].tree;
      let next = get_next_removal_nodes(last_tree, &it.spr, it.mapping.as_ref().unwrap(), path[i - 1], None);

      let mut chosen = -1;
      for &candidate in &next {
        if candidate == -1 {
          continue;
        }
        let straddles = tree[candidate].age <= time_interval
          && (candidate == tree.root || tree[tree[candidate].parent].age > time_interval);
        if straddles {
          chosen = candidate;
          break;
        }
      }

      if chosen == -1 {
        break_coords.push(coord);
      } else {
        node = chosen;
      }
    }

    coord += trees.trees[i].blocklen;
    path[i] = node;
    if do_first || i > 0 {
      have_last = true;
    }
  }

  (path, break_coords)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_trees::{assert_trees, make_node_mapping, LocalTreeSpr};
  use crate::arg::spr::apply_spr;
  use crate::utils::random::get_random_number_generator;
  use rstest::rstest;
  use std::collections::HashMap;

  /// Three-tree ARG over 5 nodes with SPRs (rn=1, cn=2) then (rn=2, cn=1)
  fn three_tree_arg() -> LocalTrees {
    let tree1 = LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None);

    let spr1 = Spr::new(1, 0, 2, 2, 0);
    let mut tree2 = tree1.clone();
    apply_spr(&mut tree2, &spr1, None);
    let mapping1 = make_node_mapping(&tree1, spr1.recomb_node);

    let spr2 = Spr::new(2, 0, 1, 1, 0);
    let mut tree3 = tree2.clone();
    apply_spr(&mut tree3, &spr2, None);
    let mapping2 = make_node_mapping(&tree2, spr2.recomb_node);

    let mut trees = LocalTrees::new(0, 300);
    trees.nnodes = 5;
    trees.seqids = vec![0, 1, 2];
    trees.trees.push(LocalTreeSpr::new(tree1, Spr::null(), 100, None));
    trees.trees.push(LocalTreeSpr::new(tree2, spr1, 100, Some(mapping1)));
    trees.trees.push(LocalTreeSpr::new(tree3, spr2, 100, Some(mapping2)));
    assert_trees(&trees, None, false);
    trees
  }

  /// Exhaustively enumerates all valid removal paths by brute force
  fn brute_force_paths(trees: &LocalTrees) -> Vec<Vec<i32>> {
    let nnodes = trees.nnodes as i32;
    let mut paths: Vec<Vec<i32>> = (0..nnodes).map(|n| vec![n]).collect();

    for i in 1..trees.num_trees() {
      let it = &trees.trees[i];
      let last_tree = &trees.trees[i - 1].tree;
      let mut extended = Vec::new();
      for path in &paths {
        let next = get_next_removal_nodes(last_tree, &it.spr, it.mapping.as_ref().unwrap(), path[i - 1], None);
        for &n in &next {
          if n != -1 {
            let mut path2 = path.clone();
            path2.push(n);
            extended.push(path2);
          }
        }
      }
      paths = extended;
    }

    paths
  }

  #[rstest]
  fn next_and_prev_removal_nodes_are_inverse() {
    let trees = three_tree_arg();
    for i in 1..trees.num_trees() {
      let it = &trees.trees[i];
      let last_tree = &trees.trees[i - 1].tree;
      let mapping = it.mapping.as_ref().unwrap();
      let next = get_all_next_removal_nodes(last_tree, &it.spr, mapping);
      let prev = get_all_prev_removal_nodes(last_tree, &it.spr, mapping);
      for (j, nexts) in next.iter().enumerate() {
        for &k in nexts {
          if k != -1 {
            assert!(prev[k as usize].contains(&(j as i32)), "block {i}: {j} -> {k} not invertible");
          }
        }
      }
    }
  }

  #[rstest]
  fn path_count_matches_brute_force() {
    let trees = three_tree_arg();
    let expected = brute_force_paths(&trees).len() as f64;
    let total = count_total_arg_removal_paths(&trees).exp();
    assert!((total - expected).abs() < 1e-6, "counted {total}, brute force {expected}");
  }

  #[rstest]
  fn uniform_sampling_matches_multinomial() {
    let trees = three_tree_arg();
    let all_paths = brute_force_paths(&trees);
    let npaths = all_paths.len();
    let mut rng = get_random_number_generator(Some(1234));

    let nsamples = 10_000;
    let mut freq: HashMap<Vec<i32>, usize> = HashMap::new();
    for _ in 0..nsamples {
      let (path, _) = sample_arg_removal_path_uniform(&trees, &mut rng);
      assert!(all_paths.contains(&path), "sampled an invalid path {path:?}");
      *freq.entry(path).or_insert(0) += 1;
    }

    // every path observed within 2 sigma of the multinomial expectation
    let p = 1.0 / npaths as f64;
    let expected = nsamples as f64 * p;
    let sigma = (nsamples as f64 * p * (1.0 - p)).sqrt();
    assert_eq!(freq.len(), npaths);
    for (path, &count) in &freq {
      assert!(
        (count as f64 - expected).abs() < 3.0 * sigma,
        "path {path:?} sampled {count} times, expected {expected:.1} +- {sigma:.1}"
      );
    }
  }

  #[rstest]
  fn leaf_path_follows_leaf() {
    let trees = three_tree_arg();
    let path = sample_arg_removal_leaf_path(&trees, 0);
    assert_eq!(path, vec![0, 0, 0]);
  }

  #[rstest]
  fn recomb_weighted_paths_prefer_recomb_branches() {
    let trees = three_tree_arg();
    let mut rng = get_random_number_generator(Some(99));
    let mut recomb_hits = 0;
    let n = 500;
    for _ in 0..n {
      let path = sample_arg_removal_path_recomb(&trees, 0.95, &mut rng);
      // spr into block 1 recombines on node 1
      if path[0] == 1 {
        recomb_hits += 1;
      }
    }
    assert!(recomb_hits > n / 3, "only {recomb_hits}/{n} paths hit the recomb branch");
  }
}

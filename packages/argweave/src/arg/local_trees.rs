use crate::arg::local_tree::{assert_tree, LocalTree};
use crate::arg::spr::{assert_spr, Spr};
use crate::make_error;
use crate::model::population::PopulationModel;
use eyre::Report;

/// One entry of the ARG: a local tree, the SPR to its left, the node mapping
/// from the previous tree, and the length of the block it covers.
#[derive(Clone, Debug)]
pub struct LocalTreeSpr {
  pub tree: LocalTree,
  pub spr: Spr,
  pub mapping: Option<Vec<i32>>,
  pub blocklen: i32,
}

impl LocalTreeSpr {
  pub fn new(tree: LocalTree, spr: Spr, blocklen: i32, mapping: Option<Vec<i32>>) -> Self {
    Self {
      tree,
      spr,
      mapping,
      blocklen,
    }
  }
}

/// An ordered sequence of local trees tiling `[start_coord, end_coord)`,
/// connected by SPRs: an SMC-style ARG.
///
/// The first entry carries a null SPR and no mapping. `seqids` maps tree
/// leaves to haplotype ids.
#[derive(Clone, Debug)]
pub struct LocalTrees {
  pub chrom: String,
  pub start_coord: i32,
  pub end_coord: i32,
  pub nnodes: usize,
  pub trees: Vec<LocalTreeSpr>,
  pub seqids: Vec<i32>,
}

impl LocalTrees {
  pub fn new(start_coord: i32, end_coord: i32) -> Self {
    Self {
      chrom: "chr".to_owned(),
      start_coord,
      end_coord,
      nnodes: 0,
      trees: Vec::new(),
      seqids: Vec::new(),
    }
  }

  /// Rebuilds this ARG as a trunk genealogy: one leaf, one tree, one block
  pub fn make_trunk(&mut self, start: i32, end: i32, seqid: i32, pop_path: i32) {
    self.trees.clear();
    self.start_coord = start;
    self.end_coord = end;
    self.nnodes = 1;

    let mut tree = LocalTree::from_parents(&[-1], Some(&[0]), None);
    tree.nodes[0].pop_path = pop_path;
    self.trees.push(LocalTreeSpr::new(tree, Spr::null(), end - start, None));
    self.seqids = vec![seqid];
  }

  #[inline]
  pub fn num_leaves(&self) -> usize {
    (self.nnodes + 1) / 2
  }

  #[inline]
  pub fn length(&self) -> i32 {
    self.end_coord - self.start_coord
  }

  #[inline]
  pub fn num_trees(&self) -> usize {
    self.trees.len()
  }

  pub fn set_default_seqids(&mut self) {
    self.seqids = (0..self.num_leaves() as i32).collect();
  }

  /// Sets sequence ids according to a permutation of sequence names
  pub fn set_seqids(&mut self, names: &[String], new_order: &[String]) -> Result<(), Report> {
    for (i, name) in names.iter().enumerate() {
      match new_order.iter().position(|n| n == name) {
        Some(j) => self.seqids[i] = j as i32,
        None => return make_error!("sequence name '{name}' not present in new ordering"),
      }
    }
    Ok(())
  }

  /// Index, start, and end of the block containing `site`
  pub fn get_block(&self, site: i32) -> Option<(usize, i32, i32)> {
    let mut end = self.start_coord;
    for (i, it) in self.trees.iter().enumerate() {
      let start = end;
      end += it.blocklen;
      if start <= site && site < end {
        return Some((i, start, end));
      }
    }
    None
  }

  /// Starting coordinate of each block
  pub fn block_starts(&self) -> Vec<i32> {
    let mut starts = Vec::with_capacity(self.num_trees());
    let mut pos = self.start_coord;
    for it in &self.trees {
      starts.push(pos);
      pos += it.blocklen;
    }
    starts
  }
}

/// Mapping for nodes between two local trees under an SPR: every node maps to
/// its own name except the broken node (parent of the recomb node)
pub fn make_node_mapping(last_tree: &LocalTree, recomb_node: i32) -> Vec<i32> {
  let mut mapping: Vec<i32> = (0..last_tree.nnodes() as i32).collect();
  let broken = last_tree[recomb_node].parent;
  mapping[broken as usize] = -1;
  mapping
}

/// The recoal node of `tree`: the single node with no preimage under `mapping`
pub fn get_recoal_node(tree: &LocalTree, spr: &Spr, mapping: &[i32]) -> i32 {
  let mut mapped = vec![false; tree.nnodes()];
  for &m in mapping {
    if m != -1 {
      mapped[m as usize] = true;
    }
  }
  for (i, &was_mapped) in mapped.iter().enumerate() {
    if !was_mapped {
      return i as i32;
    }
  }
  // self-recombinations leave every node mapped
  spr.coal_node
}

pub fn get_inverse_mapping(mapping: &[i32]) -> Vec<i32> {
  let mut inv = vec![-1; mapping.len()];
  for (i, &m) in mapping.iter().enumerate() {
    if m != -1 {
      inv[m as usize] = i as i32;
    }
  }
  inv
}

/// Merges block `i` into block `i+1` when the SPR between them is null,
/// composing the mappings transitively. Returns true if a merge happened.
pub fn remove_null_spr(trees: &mut LocalTrees, i: usize) -> bool {
  if i + 1 >= trees.num_trees() {
    return false;
  }
  if !trees.trees[i + 1].spr.is_null() {
    return false;
  }

  let nnodes = trees.trees[i + 1].tree.nnodes();
  if trees.trees[i].mapping.is_none() {
    // block i+1 becomes the first tree and needs no mapping
    trees.trees[i + 1].mapping = None;
  } else {
    let m1 = trees.trees[i].mapping.clone().unwrap();
    let m2 = trees.trees[i + 1].mapping.as_ref().unwrap().clone();
    let mut composed = vec![-1; nnodes];
    for j in 0..nnodes {
      if m1[j] != -1 {
        composed[j] = m2[m1[j] as usize];
      }
    }
    trees.trees[i + 1].mapping = Some(composed);
    trees.trees[i + 1].spr = trees.trees[i].spr;
    assert!(!trees.trees[i + 1].spr.is_null());
  }

  trees.trees[i + 1].blocklen += trees.trees[i].blocklen;
  trees.trees.remove(i);
  true
}

/// Removes every null-SPR block boundary from the ARG
pub fn remove_null_sprs(trees: &mut LocalTrees) {
  let mut i = 0;
  while i + 1 < trees.num_trees() {
    if !remove_null_spr(trees, i) {
      i += 1;
    }
  }
}

/// Splits the ARG at `pos`, returning the right part. With `trim`, the block
/// containing `pos` is duplicated so that both parts stay well formed (the
/// left copy may be a zero-length stub when `pos` falls on a block boundary).
pub fn partition_local_trees(trees: &mut LocalTrees, pos: i32, trim: bool) -> Option<LocalTrees> {
  if pos == trees.start_coord {
    let mut trees2 = LocalTrees::new(pos, trees.end_coord);
    trees2.chrom = trees.chrom.clone();
    trees2.nnodes = trees.nnodes;
    trees2.seqids = trees.seqids.clone();
    trees2.trees = std::mem::take(&mut trees.trees);
    trees.end_coord = pos;
    return Some(trees2);
  }

  if pos == trees.end_coord {
    let mut trees2 = LocalTrees::new(pos, pos);
    trees2.chrom = trees.chrom.clone();
    trees2.nnodes = trees.nnodes;
    trees2.seqids = trees.seqids.clone();
    return Some(trees2);
  }

  let (idx, it_start, _) = trees.get_block(pos)?;

  let tail = trees.trees.split_off(idx);
  let mut trees2 = LocalTrees::new(pos, trees.end_coord);
  trees2.chrom = trees.chrom.clone();
  trees2.nnodes = trees.nnodes;
  trees2.seqids = trees.seqids.clone();
  trees2.trees = tail;

  if trim {
    // copy the straddling tree back as the left part's last block
    let first = &trees2.trees[0];
    trees.trees.push(LocalTreeSpr::new(
      first.tree.clone(),
      first.spr,
      pos - it_start,
      first.mapping.clone(),
    ));

    let first = &mut trees2.trees[0];
    first.mapping = None;
    first.spr.set_null();
  }

  trees.end_coord = pos;
  trees2.trees[0].blocklen -= pos - it_start;
  assert!(trees2.trees[0].blocklen > 0);

  Some(trees2)
}

/// Appends `trees2` onto `trees`, leaving `trees2` empty. With `merge`, the
/// seam is stitched: a congruent mapping is inferred and redundant blocks
/// collapse when the seam SPR is null, otherwise the SPR is repaired.
pub fn append_local_trees(trees: &mut LocalTrees, trees2: &mut LocalTrees, merge: bool) {
  let ntrees = trees.num_trees();
  let ntrees2 = trees2.num_trees();

  for (a, b) in trees.seqids.iter().zip(trees2.seqids.iter()) {
    assert_eq!(a, b, "cannot append ARGs with different leaf orderings");
  }
  assert_eq!(trees.nnodes, trees2.nnodes);

  trees.trees.append(&mut trees2.trees);
  trees.end_coord = trees2.end_coord;
  trees2.end_coord = trees2.start_coord;

  if merge && ntrees > 0 && ntrees2 > 0 {
    let seam = ntrees;
    if trees.trees[seam].spr.is_null() {
      let mapping = map_congruent_trees(
        &trees.trees[seam - 1].tree,
        &trees.seqids,
        &trees.trees[seam].tree,
        &trees.seqids,
      );
      trees.trees[seam].mapping = Some(mapping);
      remove_null_spr(trees, seam - 1);
    } else {
      let (left, right) = trees.trees.split_at_mut(seam);
      let last = &left[seam - 1];
      let cur = &mut right[0];
      let nnodes = last.tree.nnodes();
      let mapping = cur.mapping.get_or_insert_with(|| vec![-1; nnodes]);
      repair_spr(&last.tree, &cur.tree, &mut cur.spr, mapping);
    }
  }
}

/// Mapping from nodes of `tree1` to equivalent nodes of `tree2`, matching
/// leaves by sequence id and internal nodes bottom-up; unmatched nodes map
/// to -1
pub fn map_congruent_trees(tree1: &LocalTree, seqids1: &[i32], tree2: &LocalTree, seqids2: &[i32]) -> Vec<i32> {
  let nleaves1 = tree1.num_leaves();
  let nleaves2 = tree2.num_leaves();
  let mut mapping = vec![-1; tree1.nnodes()];

  for i in 0..nleaves1 {
    let seqid = seqids1[i];
    mapping[i] = (0..nleaves2)
      .find(|&j| seqids2[j] == seqid)
      .map_or(-1, |j| j as i32);
  }

  for &j in &tree1.postorder() {
    if tree1.is_leaf(j) {
      continue;
    }
    let child = tree1[j].child;
    let m0 = mapping[child[0] as usize];
    let m1 = mapping[child[1] as usize];
    mapping[j as usize] = match (m0, m1) {
      (-1, -1) => -1,
      (m0, -1) => m0,
      (-1, m1) => m1,
      (m0, m1) => {
        // both children map, so this node maps to their common parent
        let a = tree2[m0].parent;
        let b = tree2[m1].parent;
        assert_eq!(a, b, "congruent trees disagree below node {j}");
        a
      }
    };
  }

  mapping
}

/// Infers the mapping between two trees that differ by an SPR with a known
/// recombination node
pub fn infer_mapping(tree1: &LocalTree, tree2: &LocalTree, recomb_node: i32) -> Vec<i32> {
  let nleaves1 = tree1.num_leaves();
  let nnodes = tree1.nnodes();
  let mut mapping = vec![-1; nnodes];
  for (i, m) in mapping.iter_mut().enumerate().take(nleaves1) {
    *m = i as i32;
  }

  // map internal nodes wherever both children already agree
  let order = tree1.postorder();
  for &j in &order {
    if tree1.is_leaf(j) {
      continue;
    }
    let child = tree1[j].child;
    let (m0, m1) = (mapping[child[0] as usize], mapping[child[1] as usize]);
    if m0 != -1 && m1 != -1 {
      let a = tree2[m0].parent;
      let b = tree2[m1].parent;
      if a == b {
        mapping[j as usize] = a;
      }
    }
  }

  // at least the recombination node must be mapped
  let broken = tree1[recomb_node].parent;
  let other = tree1.sibling(recomb_node);
  let recomb = mapping[recomb_node as usize];
  assert!(recomb != -1);
  let recoal = tree2[recomb].parent;

  // map remaining nodes, skipping over the broken and recoal nodes
  for &j in &order {
    if tree1.is_leaf(j) || j == broken || mapping[j as usize] != -1 {
      continue;
    }
    let mut a = tree1[j].child[0];
    let mut b = tree1[j].child[1];
    if a == broken {
      a = other;
    }
    if b == broken {
      b = other;
    }
    let mut c = tree2[mapping[a as usize]].parent;
    let mut d = tree2[mapping[b as usize]].parent;
    if c == recoal {
      c = tree2[c].parent;
    }
    if d == recoal {
      d = tree2[d].parent;
    }
    assert_eq!(c, d, "mapping inference failed above node {j}");
    mapping[j as usize] = c;
  }

  mapping[broken as usize] = -1;
  mapping
}

/// Infers the full SPR and mapping between two local trees given correct
/// recombination node/time (and population path); coal node and time are
/// recovered from the tree pair
pub fn repair_spr(last_tree: &LocalTree, tree: &LocalTree, spr: &mut Spr, mapping: &mut [i32]) {
  let inferred = infer_mapping(last_tree, tree, spr.recomb_node);
  mapping.copy_from_slice(&inferred);

  let broken = last_tree[spr.recomb_node].parent;
  let recomb = mapping[spr.recomb_node as usize];
  assert!(recomb != -1);
  let recoal = tree[recomb].parent;
  spr.coal_time = tree[recoal].age;

  let other = tree.sibling(recomb);
  let inv_mapping = get_inverse_mapping(mapping);
  spr.coal_node = inv_mapping[other as usize];

  // adjust the coal node for branch movement across the broken node
  if spr.coal_node == broken {
    spr.coal_node = last_tree.sibling(spr.recomb_node);
  }
  let parent = last_tree[spr.coal_node].parent;
  if parent != -1 && spr.coal_time > last_tree[parent].age {
    spr.coal_node = parent;
  }
}

/// Tree length under threading rules: branch lengths plus an optional basal
/// stub above the root
pub fn get_treelen(tree: &LocalTree, times: &[f64], use_basal: bool) -> f64 {
  let mut treelen = 0.0;
  for node in &tree.nodes {
    if node.parent == -1 {
      if use_basal {
        treelen += times[node.age as usize + 1] - times[node.age as usize];
      }
    } else {
      treelen += times[tree[node.parent].age as usize] - times[node.age as usize];
    }
  }
  treelen
}

/// Tree length of a partial tree, skipping the virtual root branches
pub fn get_treelen_internal(tree: &LocalTree, times: &[f64]) -> f64 {
  let mut treelen = 0.0;
  for node in &tree.nodes {
    if node.parent == -1 || node.parent == tree.root {
      continue;
    }
    treelen += times[tree[node.parent].age as usize] - times[node.age as usize];
  }
  treelen
}

/// Tree length after threading a new branch to `(node, time)`
pub fn get_treelen_branch(
  tree: &LocalTree,
  times: &[f64],
  node: i32,
  time: i32,
  treelen: Option<f64>,
  use_basal: bool,
) -> f64 {
  let treelen = treelen.unwrap_or_else(|| get_treelen(tree, times, false));
  let rooti = tree[tree.root].age as usize;

  let blen = times[time as usize];
  let mut treelen2 = treelen + blen;
  let root_time = if node == tree.root {
    treelen2 += blen - times[rooti];
    times[time as usize + 1] - times[time as usize]
  } else {
    times[rooti + 1] - times[rooti]
  };

  if use_basal {
    treelen2 + root_time
  } else {
    treelen2
  }
}

pub fn get_basal_branch(tree: &LocalTree, times: &[f64], node: i32, time: i32) -> f64 {
  if node == tree.root {
    times[time as usize + 1] - times[time as usize]
  } else {
    let rooti = tree[tree.root].age as usize;
    times[rooti + 1] - times[rooti]
  }
}

/// Total blocklen-weighted branch length of the ARG
pub fn get_arglen(trees: &LocalTrees, times: &[f64]) -> f64 {
  let mut arglen = 0.0;
  for it in &trees.trees {
    let mut treelen = 0.0;
    for node in &it.tree.nodes {
      if node.parent != -1 {
        treelen += times[it.tree[node.parent].age as usize] - times[node.age as usize];
      }
    }
    arglen += treelen * f64::from(it.blocklen);
  }
  arglen
}

/// Asserts every ARG invariant: per-tree structure, SPR/mapping consistency
/// for each neighbouring pair, and block lengths summing to the region length
pub fn assert_trees(trees: &LocalTrees, pop_model: Option<&PopulationModel>, pruned_internal: bool) {
  if let Some(first) = trees.trees.first() {
    assert!(first.spr.is_null(), "first tree must carry a null SPR");
    assert!(first.mapping.is_none(), "first tree must carry no mapping");
  }

  let mut seqlen = 0;
  let mut last_tree: Option<&LocalTree> = None;
  for it in &trees.trees {
    seqlen += it.blocklen;
    assert!(it.blocklen >= 0);
    assert_tree(&it.tree, pop_model);

    if let Some(last) = last_tree {
      assert_spr(last, &it.tree, &it.spr, it.mapping.as_deref(), pop_model, pruned_internal);
    }
    last_tree = Some(&it.tree);
  }

  assert_eq!(seqlen, trees.length(), "block lengths do not tile the region");
}

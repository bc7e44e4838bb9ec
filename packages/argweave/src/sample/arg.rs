use crate::arg::lineages::count_mig_events;
use crate::arg::local_tree::LocalTree;
use crate::arg::local_trees::{append_local_trees, assert_trees, partition_local_trees, LocalTrees};
use crate::arg::removal::{
  count_total_arg_removal_paths, get_arg_removal_path_by_ind_and_time, get_next_removal_nodes,
  get_prev_removal_nodes, sample_arg_removal_leaf_path, sample_arg_removal_path,
  sample_arg_removal_path_recomb, sample_arg_removal_path_uniform,
};
use crate::arg::spr::Spr;
use crate::arg::thread::remove_arg_thread_path;
use crate::hmm::states::State;
use crate::model::arg_model::ArgModel;
use crate::model::sequences::Sequences;
use crate::sample::thread::{cond_sample_arg_thread_internal, sample_arg_thread, sample_arg_thread_internal};
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};

/// Builds an ARG from scratch by sequentially threading haplotypes, starting
/// from a single-leaf trunk. With `shuffle` the insertion order is permuted;
/// `num_buildup > 1` re-threads a random leaf after each addition.
pub fn sample_arg_seq(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  shuffle: bool,
  num_buildup: usize,
  rng: &mut impl Rng,
) {
  let nseqs = seqs.num_seqs();
  let seqlen = seqs.length() as i32;

  let mut seqids: Vec<i32> = (0..nseqs as i32).collect();
  if shuffle {
    seqids.shuffle(rng);
  }

  if trees.num_leaves() == 0 {
    let (start, end) = if trees.end_coord != seqlen {
      (0, seqlen)
    } else {
      (trees.start_coord, trees.end_coord)
    };
    let pop_path = match &model.pop_model {
      None => 0,
      Some(pop_model) => pop_model.most_likely_path(seqs.get_pop(seqids[0])),
    };
    trees.make_trunk(start, end, seqids[0], pop_path);
  }
  assert_trees(trees, model.pop_model.as_ref(), false);

  let mut has_sequence = vec![false; nseqs];
  for i in 0..trees.num_leaves() {
    has_sequence[trees.seqids[i] as usize] = true;
  }

  for i in 0..nseqs {
    let new_chrom = seqids[i];
    if has_sequence[new_chrom as usize] {
      continue;
    }
    debug!(
      "add sequence {} of {} ({})",
      trees.num_leaves() + 1,
      nseqs,
      seqs.names[new_chrom as usize]
    );
    sample_arg_thread(model, seqs, trees, new_chrom, rng, None);
    assert_trees(trees, model.pop_model.as_ref(), false);

    for buildup in 1..num_buildup {
      debug!("buildup rep {buildup} of {num_buildup}");
      resample_arg_random_leaf(model, seqs, trees, rng);
    }
  }
}

/// Re-threads every leaf once, in order
pub fn resample_arg(model: &ArgModel, seqs: &Sequences, trees: &mut LocalTrees, rng: &mut impl Rng) {
  for chrom in 0..trees.num_leaves() as i32 {
    resample_arg_leaf(model, seqs, trees, chrom, rng);
  }
}

/// Removes a leaf's branch path and re-threads it internally, honoring the
/// haplotype's sample age
pub fn resample_arg_leaf(model: &ArgModel, seqs: &Sequences, trees: &mut LocalTrees, node: i32, rng: &mut impl Rng) {
  let maxtime = model.removed_root_time();
  assert_trees(trees, model.pop_model.as_ref(), false);

  let removal_path = sample_arg_removal_leaf_path(trees, node);
  remove_arg_thread_path(trees, model, &removal_path, maxtime, None);

  let mintime = seqs.get_age(trees.seqids[node as usize]);
  if mintime > 0 {
    for it in &mut trees.trees {
      it.tree[node].age = mintime;
      assert!(it.spr.recomb_node != node);
      assert!(it.spr.coal_node != node);
    }
  }

  sample_arg_thread_internal(model, seqs, trees, mintime, rng);
}

pub fn resample_arg_random_leaf(model: &ArgModel, seqs: &Sequences, trees: &mut LocalTrees, rng: &mut impl Rng) {
  let node = rng.gen_range(0..trees.num_leaves() as i32);
  resample_arg_leaf(model, seqs, trees, node, rng);
}

/// Picks a random removal path through the ARG and re-threads it internally
pub fn resample_arg_all(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  prob_path_switch: f64,
  rng: &mut impl Rng,
) {
  let maxtime = model.removed_root_time();
  let node = rng.gen_range(0..trees.nnodes as i32);
  let pos = rng.gen_range(trees.start_coord..trees.end_coord);
  let removal_path = sample_arg_removal_path(trees, node, pos, prob_path_switch, rng);

  remove_arg_thread_path(trees, model, &removal_path, maxtime, None);
  sample_arg_thread_internal(model, seqs, trees, 0, rng);
}

/// Internal re-threading with a uniform removal path, accepted or rejected by
/// the path-count Metropolis-Hastings ratio
pub fn resample_arg_mcmc(model: &ArgModel, seqs: &Sequences, trees: &mut LocalTrees, rng: &mut impl Rng) -> bool {
  let maxtime = model.removed_root_time();
  let trees2 = trees.clone();

  let (removal_path, npaths) = sample_arg_removal_path_uniform(trees, rng);
  remove_arg_thread_path(trees, model, &removal_path, maxtime, None);
  sample_arg_thread_internal(model, seqs, trees, 0, rng);
  let npaths2 = count_total_arg_removal_paths(trees);

  let accept_prob = (npaths - npaths2).exp();
  let accept = rng.gen::<f64>() < accept_prob;
  if !accept {
    *trees = trees2;
  }

  debug!("accept_prob = exp({npaths:.4} - {npaths2:.4}) = {accept_prob:.4}, accept = {accept}");
  accept
}

/// Mixture kernel: leaf moves, migration-band moves (when the model has
/// migration), and windowed region moves
#[allow(clippy::too_many_arguments)]
pub fn resample_arg_mcmc_all(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  do_leaf: bool,
  window: i32,
  niters: usize,
  heat: f64,
  no_resample_mig: bool,
  rng: &mut impl Rng,
) {
  if do_leaf {
    resample_arg_random_leaf(model, seqs, trees, rng);
    debug!("resample_arg_leaf: accept=1.0");
    return;
  }

  // when migrations exist, focus half the moves on the time bands where they
  // can occur
  let mut time_interval = -1;
  let mut hap = -1;
  if let Some(pop_model) = &model.pop_model {
    if !no_resample_mig && rng.gen::<f64>() < 0.5 {
      let mut mig_times = Vec::new();
      let mut possible_haps = Vec::new();
      for i in 0..model.ntimes() as i32 - 1 {
        if !pop_model.has_migration(i) {
          continue;
        }
        for h in 0..trees.num_leaves() as i32 {
          let start_pop = seqs.get_pop(trees.seqids[h as usize]);
          if pop_model.num_sub_paths(start_pop, i) < pop_model.num_sub_paths(start_pop, i + 1)
            && trees.trees[0].tree[h].age <= i
          {
            mig_times.push(i);
            possible_haps.push(h);
          }
        }
      }
      if !mig_times.is_empty() {
        let val = rng.gen_range(0..mig_times.len());
        time_interval = mig_times[val];
        hap = possible_haps[val];
      }
    }
  }

  if time_interval >= 0 {
    let num_break = resample_arg_by_time_and_hap(model, seqs, trees, time_interval, hap, rng);
    debug!("resample_arg_by_hap ({time_interval} hap={hap} numbreak={num_break}): accept=1.0");
  } else {
    let accept_rate = resample_arg_regions(model, seqs, trees, window, niters, heat, rng);
    debug!("resample_arg_regions: accept={accept_rate}");
  }
}

/// Internal re-threading along a removal path biased toward
/// recombination-bearing branches
pub fn resample_arg_recomb(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  recomb_preference: f64,
  rng: &mut impl Rng,
) {
  let maxtime = model.removed_root_time();
  let removal_path = sample_arg_removal_path_recomb(trees, recomb_preference, rng);
  remove_arg_thread_path(trees, model, &removal_path, maxtime, None);
  sample_arg_thread_internal(model, seqs, trees, 0, rng);
}

/// Aggressive climbing toward high joint probability by repeatedly
/// re-threading recombination-bearing branches
pub fn resample_arg_climb(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  recomb_preference: f64,
  rng: &mut impl Rng,
) {
  resample_arg_recomb(model, seqs, trees, recomb_preference, rng);
}

/// The coalescent state of a partial tree's floating subtree within the
/// corresponding full tree, identified structurally (node naming may differ)
pub fn find_state_sub_tree_internal(
  model: &ArgModel,
  full_tree: &LocalTree,
  partial_tree: &LocalTree,
  maxtime: i32,
) -> State {
  if partial_tree[partial_tree.root].age < maxtime {
    // fully specified tree
    return State::null();
  }

  let subtree_root = partial_tree[partial_tree.root].child[0];

  // identify the subtree by path length from its leftmost leaf
  let mut count = 0;
  let mut leaf = subtree_root;
  while !partial_tree[leaf].is_leaf() {
    leaf = partial_tree[leaf].child[0];
    count += 1;
  }

  // find the equivalent node in the full tree
  let mut ptr = leaf;
  for _ in 0..count {
    ptr = full_tree[ptr].parent;
  }

  let sib = full_tree.sibling(ptr);
  assert!(sib != -1);
  let parent = full_tree[ptr].parent;
  assert!(parent != -1);
  let coal_time = full_tree[parent].age;
  let pop_path = model.path_to_root(&full_tree.nodes, ptr);

  // identify the sibling by leaf and path length, then map it back
  let mut count = 0;
  let mut leaf = sib;
  while !full_tree[leaf].is_leaf() {
    leaf = full_tree[leaf].child[0];
    count += 1;
  }
  let mut ptr = leaf;
  for _ in 0..count {
    ptr = partial_tree[ptr].parent;
  }

  State::new(ptr, coal_time, pop_path)
}

/// Region resampling: partitions the ARG at `[region_start, region_end)`,
/// removes a uniform internal path restricted to that window, re-threads
/// conditional on the window's boundary states, and accepts or rejects by the
/// path-count MH ratio `exp(log N(before) - log N(after))`.
#[allow(clippy::too_many_arguments)]
pub fn resample_arg_region(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  region_start: i32,
  region_end: i32,
  niters: usize,
  open_ended: bool,
  heat: f64,
  rng: &mut impl Rng,
) -> f64 {
  let maxtime = model.removed_root_time();

  // zero-length regions partition cleanly into nothing to do
  if region_start == region_end {
    return 1.0;
  }

  assert!(region_start >= trees.start_coord);
  assert!(region_end <= trees.end_coord);
  assert!(region_start < region_end);

  let mut trees2 = partition_local_trees(trees, region_start, true).unwrap();
  let mut trees3 = partition_local_trees(&mut trees2, region_end, true).unwrap();
  assert_eq!(trees2.length(), region_end - region_start);

  // extend a zero-length boundary stub so the window has a sampleable column
  let stub = trees2.trees.last().unwrap().blocklen == 0;
  if stub {
    trees2.trees.last_mut().unwrap().blocklen += 1;
    trees2.end_coord += 1;
  }

  let mut accepts = 0;
  for iter in 0..niters {
    debug!("region sample: iter={iter}, region=({region_start}, {region_end})");

    let old_trees2 = trees2.clone();
    let start_tree = trees2.trees[0].tree.clone();
    let end_tree = trees2.trees[trees2.num_trees() - 1].tree.clone();

    let (removal_path, npaths) = sample_arg_removal_path_uniform(&trees2, rng);
    remove_arg_thread_path(&mut trees2, model, &removal_path, maxtime, None);
    assert_trees(&trees2, model.pop_model.as_ref(), true);

    let mut start_state =
      find_state_sub_tree_internal(model, &start_tree, &trees2.trees[0].tree, maxtime);
    let mut end_state =
      find_state_sub_tree_internal(model, &end_tree, &trees2.trees[trees2.num_trees() - 1].tree, maxtime);

    if open_ended {
      if region_start == trees.start_coord {
        start_state = State::null();
      }
      if region_end == trees3.end_coord {
        end_state = State::null();
      }
    }

    cond_sample_arg_thread_internal(model, seqs, &mut trees2, start_state, end_state, rng);
    assert_trees(&trees2, model.pop_model.as_ref(), false);

    let npaths2 = count_total_arg_removal_paths(&trees2);
    let accept_prob = (heat * (npaths - npaths2)).exp();
    let accept = rng.gen::<f64>() < accept_prob;
    if accept {
      accepts += 1;
    } else {
      trees2 = old_trees2;
    }
    debug!("accept_prob = exp({npaths:.4} - {npaths2:.4}) = {accept_prob:.4}, accept = {accept}");
  }

  if stub {
    trees2.trees.last_mut().unwrap().blocklen -= 1;
    trees2.end_coord -= 1;
  }

  append_local_trees(trees, &mut trees2, true);
  append_local_trees(trees, &mut trees3, true);

  accepts as f64 / niters as f64
}

/// Region resampling over a sliding window covering the whole ARG
pub fn resample_arg_regions(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  window: i32,
  niters: usize,
  heat: f64,
  rng: &mut impl Rng,
) -> f64 {
  let mut accept_rate = 0.0;
  let mut nwindows = 0;

  let currwindow = rng.gen_range(window - window / 4..window + window / 4);
  let currstep = currwindow / 2 + 1;
  let mut start = trees.start_coord;
  while start == trees.start_coord || start + currwindow / 2 < trees.end_coord {
    nwindows += 1;
    let end = (start + currwindow).min(trees.end_coord);
    accept_rate += resample_arg_region(model, seqs, trees, start, end, niters, true, heat, rng);
    start += currstep;
  }

  accept_rate / f64::from(nwindows)
}

/// Migration-focused resampling: follows one haplotype's ancestry within a
/// single time band and re-threads it region by region, conditioning on the
/// states at each break
pub fn resample_arg_by_time_and_hap(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  time_interval: i32,
  hap: i32,
  rng: &mut impl Rng,
) -> usize {
  let maxtime = model.removed_root_time();
  assert!(time_interval >= 0 && (time_interval as usize) < model.ntimes() - 1);
  assert!(hap >= 0 && (hap as usize) < trees.num_leaves());

  let orig_trees = trees.clone();
  let (_, break_coords) = get_arg_removal_path_by_ind_and_time(trees, time_interval, hap, true);
  let num_break = break_coords.len();

  for i in 0..=num_break {
    let region_start = if i == 0 {
      trees.start_coord
    } else {
      break_coords[i - 1] - 1
    };
    let region_end = if i == num_break {
      trees.end_coord
    } else {
      break_coords[i] + 1
    };

    let mut trees2 = partition_local_trees(trees, region_start, true).unwrap();
    let mut trees3 = partition_local_trees(&mut trees2, region_end, true).unwrap();

    // stash the boundary stub so it can be restored after the move
    let mut stub_spr = Spr::null();
    let mut stub_mapping: Option<Vec<i32>> = None;
    if i != num_break {
      if trees2.trees.last().unwrap().blocklen == 0 {
        let last = trees2.trees.pop().unwrap();
        stub_spr = last.spr;
        stub_mapping = last.mapping;
      }
      assert_eq!(trees2.trees.last().unwrap().blocklen, 1);
    }

    let curr_numtree = trees2.num_trees();
    if curr_numtree > 2 {
      let (mut curr_removal_path, _) =
        get_arg_removal_path_by_ind_and_time(&trees2, time_interval, hap, i == 0 || trees2.trees[0].blocklen > 1);

      if i != num_break {
        // the last removal node only needs to be legal; the end state is
        // conditioned on anyway
        let (idx, _, _) = orig_trees.get_block(region_end - 1).unwrap();
        let it = &orig_trees.trees[idx];
        let it2 = &orig_trees.trees[idx - 1];
        let next = get_next_removal_nodes(
          &it2.tree,
          &it.spr,
          it.mapping.as_ref().unwrap(),
          curr_removal_path[curr_numtree - 2],
          None,
        );
        curr_removal_path[curr_numtree - 1] = next[0];
        assert!(curr_removal_path[curr_numtree - 1] != -1);
      }

      if i != 0 {
        let it = &trees2.trees[1];
        let prev = get_prev_removal_nodes(
          &trees2.trees[0].tree,
          &it.spr,
          it.mapping.as_ref().unwrap(),
          curr_removal_path[1],
          None,
        );
        curr_removal_path[0] = prev[0];
        assert!(curr_removal_path[0] != -1);
      }

      debug!("region sample: iter={i}, region=({region_start}, {region_end})");

      let start_tree = trees2.trees[0].tree.clone();
      let end_tree = trees2.trees[trees2.num_trees() - 1].tree.clone();

      remove_arg_thread_path(&mut trees2, model, &curr_removal_path, maxtime, None);
      assert_trees(&trees2, model.pop_model.as_ref(), true);

      let mut start_state =
        find_state_sub_tree_internal(model, &start_tree, &trees2.trees[0].tree, maxtime);
      let mut end_state =
        find_state_sub_tree_internal(model, &end_tree, &trees2.trees[trees2.num_trees() - 1].tree, maxtime);

      if region_start == trees.start_coord {
        start_state = State::null();
      }
      if region_end == trees3.end_coord {
        end_state = State::null();
      }

      cond_sample_arg_thread_internal(model, seqs, &mut trees2, start_state, end_state, rng);
      assert_trees(&trees2, model.pop_model.as_ref(), false);
    }

    append_local_trees(trees, &mut trees2, true);
    if trees3.num_trees() > 0 {
      trees3.trees[0].spr = stub_spr;
      assert!(trees3.trees[0].mapping.is_none());
      trees3.trees[0].mapping = stub_mapping;
    }
    append_local_trees(trees, &mut trees3, true);
    assert_trees(trees, model.pop_model.as_ref(), false);
  }

  num_break
}

/// Gibbs update of every migration parameter: count SPR and branch events
/// crossing each band, draw from the Beta posterior, and rebalance the
/// self-migration rate to keep rows stochastic
pub fn resample_migrates(
  model: &mut ArgModel,
  trees: &LocalTrees,
  invisible_recombs: &[Spr],
  rng: &mut impl Rng,
) {
  let Some(pop_model) = &model.pop_model else {
    return;
  };
  let mig_params = pop_model.mig_params.clone();

  for mp in &mig_params {
    let (count, total) = count_mig_events(mp.from_pop, mp.to_pop, mp.time_idx, model, trees, Some(invisible_recombs));

    let alpha = f64::from(count) + mp.alpha;
    let beta = f64::from(total - count) + mp.beta;
    let dist = Beta::new(alpha, beta).expect("invalid Beta posterior parameters");
    let mut new_migrate = 1.0;
    while new_migrate > 0.5 {
      new_migrate = dist.sample(rng);
    }

    let pop_model = model.pop_model.as_mut().unwrap();
    let mat = &mut pop_model.mig_matrices[mp.time_idx];
    let (f, t) = (mp.from_pop as usize, mp.to_pop as usize);
    let diff = new_migrate - mat[(f, t)];
    mat[(f, t)] = new_migrate;
    let self_rate = mat[(f, f)];
    mat[(f, f)] = self_rate - diff;
    pop_model.update_population_probs();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_trees::LocalTreeSpr;
  use crate::constants::DEFAULT_RECOMB_PREFERENCE;
  use crate::model::population::PopulationModel;
  use crate::model::time_grid::TimeGrid;
  use crate::utils::random::get_random_number_generator;
  use eyre::Report;
  use rstest::rstest;

  fn model() -> ArgModel {
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  fn seqs(n: usize, len: usize) -> Sequences {
    let names = (0..n).map(|i| format!("seq{i}")).collect();
    let seqs = (0..n).map(|_| vec![b'A'; len]).collect();
    Sequences::new(names, seqs).unwrap()
  }

  #[rstest]
  fn sequential_build_threads_all_sequences() -> Result<(), Report> {
    let model = model();
    let seqs = seqs(4, 100);
    let mut trees = LocalTrees::new(0, 100);
    let mut rng = get_random_number_generator(Some(41));

    sample_arg_seq(&model, &seqs, &mut trees, false, 0, &mut rng);
    assert_eq!(trees.num_leaves(), 4);
    assert_eq!(trees.nnodes, 7);
    let mut ids = trees.seqids.clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    Ok(())
  }

  #[rstest]
  fn leaf_resampling_preserves_leaf_count() -> Result<(), Report> {
    let model = model();
    let seqs = seqs(3, 80);
    let mut trees = LocalTrees::new(0, 80);
    let mut rng = get_random_number_generator(Some(43));
    sample_arg_seq(&model, &seqs, &mut trees, false, 0, &mut rng);

    for _ in 0..3 {
      resample_arg_random_leaf(&model, &seqs, &mut trees, &mut rng);
      assert_eq!(trees.num_leaves(), 3);
      assert_trees(&trees, None, false);
    }
    Ok(())
  }

  #[rstest]
  fn internal_resampling_preserves_invariants() -> Result<(), Report> {
    let model = model();
    let seqs = seqs(3, 60);
    let mut trees = LocalTrees::new(0, 60);
    let mut rng = get_random_number_generator(Some(47));
    sample_arg_seq(&model, &seqs, &mut trees, false, 0, &mut rng);

    for _ in 0..3 {
      resample_arg_all(&model, &seqs, &mut trees, 0.5, &mut rng);
      assert_eq!(trees.num_leaves(), 3);
      assert_trees(&trees, None, false);
    }
    Ok(())
  }

  #[rstest]
  fn mcmc_resampling_always_returns() -> Result<(), Report> {
    let model = model();
    let seqs = seqs(3, 60);
    let mut trees = LocalTrees::new(0, 60);
    let mut rng = get_random_number_generator(Some(53));
    sample_arg_seq(&model, &seqs, &mut trees, false, 0, &mut rng);

    for _ in 0..5 {
      resample_arg_mcmc(&model, &seqs, &mut trees, &mut rng);
      assert_trees(&trees, None, false);
      assert_eq!(trees.length(), 60);
    }
    Ok(())
  }

  #[rstest]
  fn climb_resampling_preserves_invariants() -> Result<(), Report> {
    let model = model();
    let seqs = seqs(3, 60);
    let mut trees = LocalTrees::new(0, 60);
    let mut rng = get_random_number_generator(Some(59));
    sample_arg_seq(&model, &seqs, &mut trees, false, 0, &mut rng);

    resample_arg_climb(&model, &seqs, &mut trees, DEFAULT_RECOMB_PREFERENCE, &mut rng);
    assert_trees(&trees, None, false);
    Ok(())
  }

  #[rstest]
  fn resampling_with_recombination_keeps_invariants() -> Result<(), Report> {
    // a hot recombination rate forces multi-block ARGs, exercising the SPR
    // and mapping repair across every boundary
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    let model = ArgModel::new(grid, 1e4, 1e-5, 2.5e-8);
    let seqs = seqs(4, 300);
    let mut trees = LocalTrees::new(0, 300);
    let mut rng = get_random_number_generator(Some(97));

    sample_arg_seq(&model, &seqs, &mut trees, true, 0, &mut rng);
    assert_eq!(trees.num_leaves(), 4);
    assert_trees(&trees, None, false);

    for _ in 0..3 {
      resample_arg_random_leaf(&model, &seqs, &mut trees, &mut rng);
      resample_arg_all(&model, &seqs, &mut trees, 0.5, &mut rng);
      assert_trees(&trees, None, false);
      assert_eq!(trees.length(), 300);
      assert_eq!(trees.num_leaves(), 4);
    }
    Ok(())
  }

  #[rstest]
  fn migration_gibbs_concentrates_on_posterior_mean() {
    // 2 populations with a migration band between times 2 and 3
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    let mut pop_model = PopulationModel::new(2, 5);
    pop_model.add_migration(5, 0, 1, 0.2);
    pop_model.set_up_population_paths();
    pop_model.add_mig_param(0, 1, 5, 1.0, 1.0);
    let mut model = ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8).with_pop_model(pop_model);

    let pm = model.pop_model.as_ref().unwrap();
    let migrating = (0..pm.num_pop_paths() as i32)
      .find(|&p| pm.get_pop(p, 0) == 0 && pm.get_pop(p, 4) == 1)
      .unwrap();
    let resident = (0..pm.num_pop_paths() as i32)
      .find(|&p| pm.get_pop(p, 0) == 0 && pm.get_pop(p, 4) == 0)
      .unwrap();

    // front tree: 4 leaf branches cross the band, 2 of them migrating
    let mut tree = LocalTree::from_parents(&[4, 4, 5, 5, 6, 6, -1], Some(&[0, 0, 0, 0, 3, 3, 3]), None);
    tree[0].pop_path = migrating;
    tree[1].pop_path = migrating;
    tree[2].pop_path = resident;
    tree[3].pop_path = resident;

    let mut trees = LocalTrees::new(0, 100);
    trees.nnodes = 7;
    trees.seqids = vec![0, 1, 2, 3];
    trees.trees.push(LocalTreeSpr::new(tree, Spr::null(), 100, None));

    // 6 eligible invisible recombinations, 1 migrating
    let mut invis = vec![Spr::new(2, 0, 2, 3, resident); 5];
    invis.push(Spr::new(2, 0, 2, 3, migrating));

    // 3 migrating events out of 10 eligible
    let (count, total) = count_mig_events(0, 1, 5, &model, &trees, Some(&invis));
    assert_eq!((count, total), (3, 10));

    // with Beta(1, 1) prior the posterior mean is (3+1)/(10+2) = 1/3
    let mut rng = get_random_number_generator(Some(77));
    let n = 2000;
    let mut sum = 0.0;
    for _ in 0..n {
      resample_migrates(&mut model, &trees, &invis, &mut rng);
      sum += model.pop_model.as_ref().unwrap().mig_matrices[5][(0, 1)];
    }
    let mean = sum / f64::from(n);
    assert!((mean - 1.0 / 3.0).abs() < 0.05, "posterior mean {mean}");
  }

  #[rstest]
  fn region_resampling_restores_region_bounds() -> Result<(), Report> {
    let model = model();
    let seqs = seqs(3, 100);
    let mut trees = LocalTrees::new(0, 100);
    let mut rng = get_random_number_generator(Some(61));
    sample_arg_seq(&model, &seqs, &mut trees, false, 0, &mut rng);

    let rate = resample_arg_region(&model, &seqs, &mut trees, 20, 60, 2, true, 1.0, &mut rng);
    assert!((0.0..=1.0).contains(&rate));
    assert_eq!(trees.start_coord, 0);
    assert_eq!(trees.end_coord, 100);
    assert_trees(&trees, None, false);
    Ok(())
  }
}

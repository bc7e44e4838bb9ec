use crate::arg::local_trees::{assert_trees, LocalTrees};
use crate::arg::spr::Spr;
use crate::arg::thread::{add_arg_thread, add_arg_thread_path, remove_arg_thread};
use crate::hmm::forward::{compute_matrices, forward_alg, stochastic_traceback, ForwardTable};
use crate::hmm::recomb::sample_recombinations;
use crate::hmm::states::{find_state, State, StatesModel};
use crate::model::arg_model::ArgModel;
use crate::model::sequences::Sequences;
use log::debug;
use rand::Rng;

/// Threads one additional haplotype into the ARG: forward algorithm over all
/// blocks, stochastic traceback, recombination resampling, and insertion.
pub fn sample_arg_thread(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  new_chrom: i32,
  rng: &mut impl Rng,
  invisible: Option<&mut Vec<(i32, Spr)>>,
) {
  let pop_model = model.pop_model.as_ref();
  assert_trees(trees, pop_model, false);

  let mut states_model = StatesModel::new(model.ntimes());
  if pop_model.is_some() {
    states_model.set_start_pop(seqs.get_pop(new_chrom));
  }

  let matrices = compute_matrices(model, Some(seqs), trees, &states_model, Some(new_chrom));
  let mut forward = ForwardTable::new(trees.start_coord);
  forward_alg(model, &matrices, &mut forward, None);
  debug!(
    "threaded forward table: {} states, {} blocks",
    matrices.first().map_or(0, |m| m.states.len()),
    trees.num_trees()
  );

  let mut thread_path = vec![0; trees.length() as usize];
  stochastic_traceback(model, &matrices, &forward, &mut thread_path, false, rng);

  let (recomb_pos, recombs) = sample_recombinations(model, trees, &matrices, &thread_path, false, rng, invisible);

  add_arg_thread(trees, model, &states_model, &thread_path, new_chrom, &recomb_pos, &recombs);
  assert_trees(trees, pop_model, false);
}

/// Re-threads the floating subtree of a partial ARG (internal threading)
pub fn sample_arg_thread_internal(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  minage: i32,
  rng: &mut impl Rng,
) {
  let mut states_model = StatesModel::new(model.ntimes());
  states_model.set_internal(true, minage);

  let matrices = compute_matrices(model, Some(seqs), trees, &states_model, None);
  let mut forward = ForwardTable::new(trees.start_coord);
  forward_alg(model, &matrices, &mut forward, None);

  let mut thread_path = vec![0; trees.length() as usize];
  stochastic_traceback(model, &matrices, &forward, &mut thread_path, false, rng);

  let (recomb_pos, recombs) = sample_recombinations(model, trees, &matrices, &thread_path, true, rng, None);

  add_arg_thread_path(trees, model, &states_model, &thread_path, &recomb_pos, &recombs);
}

/// Internal threading conditioned on given start and/or end states, used by
/// the Metropolis-Hastings region resampler. A null state leaves that end
/// open (sampled as usual).
pub fn cond_sample_arg_thread_internal(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  start_state: State,
  end_state: State,
  rng: &mut impl Rng,
) {
  let pop_model = model.pop_model.as_ref();
  assert_trees(trees, pop_model, true);

  let mut states_model = StatesModel::new(model.ntimes());
  states_model.set_internal(true, 0);

  let matrices = compute_matrices(model, Some(seqs), trees, &states_model, None);

  // pin the first column when a start state is given
  let first_col = {
    let states = &matrices[0].states;
    if states.is_empty() || start_state.is_null() {
      None
    } else {
      let first_tree = &trees.trees[0].tree;
      let subtree_root = first_tree[first_tree.root].child[0];
      let minage = first_tree[subtree_root].age;
      let j = find_state(states, start_state, model, minage);
      assert!(j != -1, "conditional start state is not in the state space");
      let mut col = vec![0.0; states.len()];
      col[j as usize] = 1.0;
      Some(col)
    }
  };

  let mut forward = ForwardTable::new(trees.start_coord);
  forward_alg(model, &matrices, &mut forward, first_col.as_deref());

  // pin the last column when an end state is given
  let mut thread_path = vec![0; trees.length() as usize];
  let last_states = &matrices[matrices.len() - 1].states;
  let last_state_given = if last_states.is_empty() {
    *thread_path.last_mut().unwrap() = 0;
    true
  } else if end_state.is_null() {
    false
  } else {
    let last_tree = &trees.trees[trees.num_trees() - 1].tree;
    let subtree_root = last_tree[last_tree.root].child[0];
    let minage = last_tree[subtree_root].age;
    let j = find_state(last_states, end_state, model, minage);
    assert!(j != -1, "conditional end state is not in the state space");
    *thread_path.last_mut().unwrap() = j;
    true
  };

  stochastic_traceback(model, &matrices, &forward, &mut thread_path, last_state_given, rng);

  let (recomb_pos, recombs) = sample_recombinations(model, trees, &matrices, &thread_path, true, rng, None);

  assert_trees(trees, pop_model, true);
  add_arg_thread_path(trees, model, &states_model, &thread_path, &recomb_pos, &recombs);
  assert_trees(trees, pop_model, false);
}

/// Removes one haplotype's thread and samples a fresh one
pub fn resample_arg_thread(
  model: &ArgModel,
  seqs: &Sequences,
  trees: &mut LocalTrees,
  chrom: i32,
  rng: &mut impl Rng,
) {
  remove_arg_thread(trees, chrom, model);
  sample_arg_thread(model, seqs, trees, chrom, rng, None);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_trees::get_arglen;
  use crate::model::time_grid::TimeGrid;
  use crate::utils::random::get_random_number_generator;
  use eyre::Report;
  use rstest::rstest;

  fn model() -> ArgModel {
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  #[rstest]
  fn threading_grows_the_arg_by_one_leaf() -> Result<(), Report> {
    let model = model();
    let seqs = Sequences::new(
      vec!["a".into(), "b".into()],
      vec![vec![b'A'; 200], vec![b'A'; 200]],
    )?;

    let mut trees = LocalTrees::new(0, 200);
    trees.make_trunk(0, 200, 0, 0);

    let mut rng = get_random_number_generator(Some(11));
    sample_arg_thread(&model, &seqs, &mut trees, 1, &mut rng, None);

    assert_eq!(trees.num_leaves(), 2);
    assert_eq!(trees.nnodes, 3);
    assert_eq!(trees.seqids, vec![0, 1]);
    let total: i32 = trees.trees.iter().map(|t| t.blocklen).sum();
    assert_eq!(total, 200);
    assert!(get_arglen(&trees, model.times()) > 0.0);
    Ok(())
  }

  #[rstest]
  fn zero_rates_thread_produces_single_block() -> Result<(), Report> {
    // two identical sequences, mu = 0, rho = 0: one tree and no SPRs
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    let model = ArgModel::new(grid, 1e4, 0.0, 0.0);
    let seqs = Sequences::new(
      vec!["a".into(), "b".into()],
      vec![vec![b'A'; 500], vec![b'A'; 500]],
    )?;

    let mut trees = LocalTrees::new(0, 500);
    trees.make_trunk(0, 500, 0, 0);

    let mut rng = get_random_number_generator(Some(21));
    sample_arg_thread(&model, &seqs, &mut trees, 1, &mut rng, None);

    assert_eq!(trees.num_trees(), 1);
    assert!(trees.trees[0].spr.is_null());
    // the two leaves coalesce below the top time point
    let tree = &trees.trees[0].tree;
    assert_eq!(tree[2].child.iter().filter(|&&c| c != -1).count(), 2);
    assert!(tree[2].age <= 3);
    Ok(())
  }

  #[rstest]
  fn remove_then_resample_keeps_invariants() -> Result<(), Report> {
    let model = model();
    let seqs = Sequences::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![vec![b'A'; 100], vec![b'A'; 100], vec![b'A'; 100]],
    )?;

    let mut trees = LocalTrees::new(0, 100);
    trees.make_trunk(0, 100, 0, 0);
    let mut rng = get_random_number_generator(Some(31));
    sample_arg_thread(&model, &seqs, &mut trees, 1, &mut rng, None);
    sample_arg_thread(&model, &seqs, &mut trees, 2, &mut rng, None);
    assert_eq!(trees.num_leaves(), 3);

    resample_arg_thread(&model, &seqs, &mut trees, 1, &mut rng);
    assert_eq!(trees.num_leaves(), 3);
    assert!(trees.seqids.contains(&1));
    Ok(())
  }
}

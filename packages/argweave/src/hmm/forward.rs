use crate::arg::lineages::LineageCounts;
use crate::arg::local_trees::LocalTrees;
use crate::constants::MIN_COLUMN_NORM;
use crate::hmm::emit::{calc_emissions_external, calc_emissions_internal};
use crate::hmm::states::{State, StatesModel};
use crate::hmm::trans::{calc_state_priors, TransMatrix, TransMatrixSwitch};
use crate::model::arg_model::ArgModel;
use crate::model::sequences::Sequences;
use crate::utils::random::sample_weights;
use ndarray::Array2;
use rand::Rng;

/// Precomputed HMM matrices for one block: state space, lineage counts,
/// block transition matrix, switch matrix to the previous block, and
/// per-site emissions.
pub struct ArgHmmMatrices {
  pub start: i32,
  pub blocklen: i32,
  pub states: Vec<State>,
  pub lineages: LineageCounts,
  pub transmat: TransMatrix,
  pub switchmat: Option<TransMatrixSwitch>,
  pub emit: Array2<f64>,
}

/// Builds per-block matrices for a threading run over the current ARG.
///
/// `new_chrom` selects the haplotype being threaded (external mode); in
/// internal mode emissions come from the floating subtree of each partial
/// tree. Without sequences, emissions are uniform (traceback-only use).
pub fn compute_matrices(
  model: &ArgModel,
  seqs: Option<&Sequences>,
  trees: &LocalTrees,
  states_model: &StatesModel,
  new_chrom: Option<i32>,
) -> Vec<ArgHmmMatrices> {
  let ntimes = model.ntimes();
  let npops = model.num_pops();
  let pop_model = model.pop_model.as_ref();

  let mut matrices: Vec<ArgHmmMatrices> = Vec::with_capacity(trees.num_trees());
  let mut end = trees.start_coord;
  for i in 0..trees.num_trees() {
    let it = &trees.trees[i];
    let start = end;
    end += it.blocklen;

    let states = states_model.coal_states(model, &it.tree);
    let mut lineages = LineageCounts::new(ntimes, npops);
    lineages.count(&it.tree, pop_model, states_model.internal);

    let (rho, _) = model.local_rates(start);
    let transmat = TransMatrix::new(model, &it.tree, &states, &lineages, states_model, rho);

    let switchmat = (i > 0).then(|| {
      let last = &trees.trees[i - 1];
      TransMatrixSwitch::new(
        model,
        &last.tree,
        &it.tree,
        &it.spr,
        it.mapping.as_ref().unwrap(),
        &matrices[i - 1].states,
        &states,
        &lineages,
        states_model.effective_minage(&it.tree),
      )
    });

    let emit = match seqs {
      Some(seqs) if states_model.internal => {
        calc_emissions_internal(model, &it.tree, &states, seqs, &trees.seqids, start, end)
      }
      Some(seqs) => {
        let chrom = new_chrom.expect("external threading requires the haplotype being threaded");
        calc_emissions_external(model, &it.tree, &states, seqs, &trees.seqids, chrom, start, end)
      }
      None => Array2::from_elem((it.blocklen as usize, states.len().max(1)), 1.0),
    };

    matrices.push(ArgHmmMatrices {
      start,
      blocklen: it.blocklen,
      states,
      lineages,
      transmat,
      switchmat,
      emit,
    });
  }

  matrices
}

/// Forward table over the whole region, one lazily allocated matrix per block
pub struct ForwardTable {
  pub start_coord: i32,
  pub blocks: Vec<Array2<f64>>,
}

impl ForwardTable {
  pub fn new(start_coord: i32) -> Self {
    Self {
      start_coord,
      blocks: Vec::new(),
    }
  }
}

/// Forward recursion within one block using the decomposed transition matrix:
/// per-(time, path) forward groups absorb the branch-independent term, then
/// per-state same-branch and no-recombination corrections are added.
fn forward_block(model: &ArgModel, mat: &ArgHmmMatrices, fw: &mut Array2<f64>) {
  let states = &mat.states;
  let nstates = states.len();
  let blocklen = mat.blocklen as usize;

  if nstates == 0 {
    // fully specified block
    for i in 1..blocklen {
      fw[(i, 0)] = fw[(i - 1, 0)];
    }
    return;
  }

  let tm = &mat.transmat;
  let ntimes = tm.ntimes;
  let numpath = tm.numpath;

  let mut fgroups = vec![0.0; ntimes * numpath];
  let mut tf = vec![0.0; ntimes * numpath];

  for i in 1..blocklen {
    fgroups.iter_mut().for_each(|x| *x = 0.0);
    for (j, s) in states.iter().enumerate() {
      fgroups[s.time as usize * numpath + s.pop_path as usize] += fw[(i - 1, j)];
    }

    for b in 0..ntimes {
      for pb in 0..numpath {
        let mut sum = 0.0;
        for a in 0..ntimes {
          for pa in 0..numpath {
            let f = fgroups[a * numpath + pa];
            if f > 0.0 {
              sum += tm.tgroup_at(b as i32, pb as i32, a as i32, pa as i32) * f;
            }
          }
        }
        tf[b * numpath + pb] = sum;
      }
    }

    let mut norm = 0.0;
    for (k, s) in states.iter().enumerate() {
      let mut sum = tf[s.time as usize * numpath + s.pop_path as usize];

      for &j in &tm.states_by_node[s.node as usize] {
        let sj = states[j];
        if model.paths_equal(sj.pop_path, s.pop_path, tm.minage, sj.time.min(s.time)) {
          sum += tm.same_branch_at(k, sj.time) * fw[(i - 1, j)];
        }
      }
      sum += tm.norecomb[s.time as usize] * fw[(i - 1, k)];

      let val = sum * mat.emit[(i, k)];
      fw[(i, k)] = val;
      norm += val;
    }

    assert!(
      norm > MIN_COLUMN_NORM && norm.is_finite(),
      "forward column normaliser is degenerate at offset {i} (norm = {norm})"
    );
    for k in 0..nstates {
      fw[(i, k)] /= norm;
    }
  }
}

/// One forward column across a block boundary using the switch matrix
fn forward_switch(col1: &[f64], col2: &mut [f64], switchmat: &TransMatrixSwitch, emit: &[f64]) {
  col2.iter_mut().for_each(|x| *x = 0.0);

  // deterministic transitions
  for (j, &f) in col1.iter().enumerate() {
    let k = switchmat.determ[j];
    if k != -1 && switchmat.recombsrc[j] < 0 && switchmat.recoalsrc[j] < 0 {
      col2[k as usize] += f * switchmat.determprob[j];
    }
  }

  // re-coalescence and recoal-split transitions
  for (j, &f) in col1.iter().enumerate() {
    if switchmat.recombsrc[j] >= 0 || switchmat.recoalsrc[j] >= 0 {
      for (k, c) in col2.iter_mut().enumerate() {
        let val = switchmat.get(j, k);
        if val > 0.0 {
          *c += f * val;
        }
      }
    }
  }

  let mut norm = 0.0;
  for (k, c) in col2.iter_mut().enumerate() {
    *c *= emit[k];
    norm += *c;
  }
  assert!(
    norm > MIN_COLUMN_NORM && norm.is_finite(),
    "switch column normaliser is degenerate (norm = {norm})"
  );
  col2.iter_mut().for_each(|x| *x /= norm);
}

/// Runs the forward algorithm for all blocks.
///
/// The first block's initial column is a prior over states derived from
/// lineage counts, unless `first_col` pins it (conditional threading).
pub fn forward_alg(model: &ArgModel, matrices: &[ArgHmmMatrices], forward: &mut ForwardTable, first_col: Option<&[f64]>) {
  forward.blocks.clear();

  for (bi, mat) in matrices.iter().enumerate() {
    let nstates = mat.states.len().max(1);
    let mut fw = Array2::zeros((mat.blocklen as usize, nstates));

    if bi == 0 {
      match first_col {
        Some(col) => {
          assert_eq!(col.len(), nstates);
          for (k, &v) in col.iter().enumerate() {
            fw[(0, k)] = v;
          }
        }
        None => {
          if mat.states.is_empty() {
            fw[(0, 0)] = 1.0;
          } else {
            let priors = calc_state_priors(model, &mat.states, &mat.lineages, mat.transmat.minage);
            for (k, &p) in priors.iter().enumerate() {
              fw[(0, k)] = p;
            }
          }
        }
      }
    } else {
      let prev = &forward.blocks[bi - 1];
      let col1: Vec<f64> = prev.row(prev.nrows() - 1).to_vec();
      let mut col2 = vec![0.0; nstates];
      let emit_row: Vec<f64> = mat.emit.row(0).to_vec();
      forward_switch(&col1, &mut col2, mat.switchmat.as_ref().unwrap(), &emit_row);
      for (k, &v) in col2.iter().enumerate() {
        fw[(0, k)] = v;
      }
    }

    forward_block(model, mat, &mut fw);
    forward.blocks.push(fw);
  }
}

/// Samples one column of the traceback within a block.
/// `path[blocklen-1]` must already be sampled.
fn sample_hmm_posterior(
  model: &ArgModel,
  mat: &ArgHmmMatrices,
  fw: &Array2<f64>,
  path: &mut [i32],
  rng: &mut impl Rng,
) {
  let nstates = mat.states.len();
  if nstates == 0 {
    path.iter_mut().for_each(|p| *p = 0);
    return;
  }

  let mut last_k = -1;
  let mut trans = vec![0.0; nstates];
  let mut weights = vec![0.0; nstates];

  for i in (0..path.len() - 1).rev() {
    let k = path[i + 1];
    if k != last_k {
      for (j, t) in trans.iter_mut().enumerate() {
        *t = mat.transmat.get(model, &mat.states, j, k as usize);
      }
      last_k = k;
    }

    for j in 0..nstates {
      weights[j] = fw[(i, j)] * trans[j];
    }
    path[i] = sample_weights(&weights, rng) as i32;
  }
}

/// Samples the state before a block boundary given the state after it
fn sample_hmm_posterior_step(switchmat: &TransMatrixSwitch, col1: &[f64], state2: i32, rng: &mut impl Rng) -> i32 {
  let weights: Vec<f64> = col1
    .iter()
    .enumerate()
    .map(|(j, &f)| f * switchmat.get(j, state2 as usize))
    .collect();
  sample_weights(&weights, rng) as i32
}

/// Stochastic traceback over all blocks: samples the final column from the
/// forward vector, then walks backwards through block and switch transitions
pub fn stochastic_traceback(
  model: &ArgModel,
  matrices: &[ArgHmmMatrices],
  forward: &ForwardTable,
  path: &mut [i32],
  last_state_given: bool,
  rng: &mut impl Rng,
) {
  let nblocks = matrices.len();
  let mut offset: i32 = matrices.iter().map(|m| m.blocklen).sum();

  if !last_state_given {
    let last = forward.blocks.last().unwrap();
    let col: Vec<f64> = last.row(last.nrows() - 1).to_vec();
    path[(offset - 1) as usize] = sample_weights(&col, rng) as i32;
  }

  for bi in (0..nblocks).rev() {
    let mat = &matrices[bi];
    offset -= mat.blocklen;
    let fw = &forward.blocks[bi];

    let span = &mut path[offset as usize..(offset + mat.blocklen) as usize];
    sample_hmm_posterior(model, mat, fw, span, rng);

    if bi > 0 {
      let prev = &forward.blocks[bi - 1];
      let col1: Vec<f64> = prev.row(prev.nrows() - 1).to_vec();
      let state2 = path[offset as usize];
      path[(offset - 1) as usize] =
        sample_hmm_posterior_step(mat.switchmat.as_ref().unwrap(), &col1, state2, rng);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_tree::LocalTree;
  use crate::arg::local_trees::{LocalTreeSpr, LocalTrees};
  use crate::arg::spr::Spr;
  use crate::model::time_grid::TimeGrid;
  use crate::utils::random::get_random_number_generator;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rstest::rstest;

  fn model() -> ArgModel {
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  fn two_leaf_arg(len: i32) -> LocalTrees {
    let tree = LocalTree::from_parents(&[2, 2, -1], Some(&[0, 0, 2]), None);
    let mut trees = LocalTrees::new(0, len);
    trees.nnodes = 3;
    trees.seqids = vec![0, 1];
    trees.trees.push(LocalTreeSpr::new(tree, Spr::null(), len, None));
    trees
  }

  #[rstest]
  fn forward_columns_stay_normalized() -> Result<(), Report> {
    let model = model();
    let trees = two_leaf_arg(50);
    let seqs = Sequences::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![vec![b'A'; 50], vec![b'A'; 50], vec![b'A'; 50]],
    )?;

    let states_model = StatesModel::new(5);
    let matrices = compute_matrices(&model, Some(&seqs), &trees, &states_model, Some(2));
    let mut forward = ForwardTable::new(0);
    forward_alg(&model, &matrices, &mut forward, None);

    let fw = &forward.blocks[0];
    for i in 0..50 {
      let sum: f64 = fw.row(i).sum();
      assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
    }
    Ok(())
  }

  #[rstest]
  fn traceback_follows_forward_support() -> Result<(), Report> {
    let model = model();
    let trees = two_leaf_arg(30);
    let seqs = Sequences::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![vec![b'A'; 30], vec![b'A'; 30], vec![b'A'; 30]],
    )?;

    let states_model = StatesModel::new(5);
    let matrices = compute_matrices(&model, Some(&seqs), &trees, &states_model, Some(2));
    let mut forward = ForwardTable::new(0);
    forward_alg(&model, &matrices, &mut forward, None);

    let mut rng = get_random_number_generator(Some(5));
    let mut path = vec![0; 30];
    stochastic_traceback(&model, &matrices, &forward, &mut path, false, &mut rng);

    let nstates = matrices[0].states.len() as i32;
    assert!(path.iter().all(|&p| p >= 0 && p < nstates));
    Ok(())
  }

  #[rstest]
  fn conditional_first_column_is_respected() -> Result<(), Report> {
    let model = model();
    let trees = two_leaf_arg(20);
    let seqs = Sequences::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![vec![b'A'; 20], vec![b'A'; 20], vec![b'A'; 20]],
    )?;

    let states_model = StatesModel::new(5);
    let matrices = compute_matrices(&model, Some(&seqs), &trees, &states_model, Some(2));
    let nstates = matrices[0].states.len();
    let mut first_col = vec![0.0; nstates];
    first_col[3] = 1.0;

    let mut forward = ForwardTable::new(0);
    forward_alg(&model, &matrices, &mut forward, Some(&first_col));
    assert_abs_diff_eq!(forward.blocks[0][(0, 3)], 1.0, epsilon = 1e-12);
    Ok(())
  }
}

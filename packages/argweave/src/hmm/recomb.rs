use crate::arg::local_trees::LocalTrees;
use crate::arg::spr::Spr;
use crate::hmm::forward::ArgHmmMatrices;
use crate::hmm::trans::recomb_time_weight;
use crate::model::arg_model::ArgModel;
use crate::utils::random::sample_weights;
use rand::Rng;

/// One candidate recombination event behind a state change
struct RecombCandidate {
  time: i32,
  on_new_branch: bool,
  weight: f64,
}

/// Resamples the recombination events behind a sampled thread path.
///
/// Every position where the state changes forces one recombination, either on
/// the branch being threaded or (when source and target share a branch) on
/// the target branch itself; the recombination time is sampled from the same
/// waiting-time weights the transition matrices use. Where the state does not
/// change, an invisible self-recombination may be recorded stochastically
/// when an `invisible` sink is supplied.
///
/// Emitted SPRs use the new-branch sentinel (`recomb_node == -1` externally,
/// the subtree root internally) that thread insertion resolves to real ids.
pub fn sample_recombinations(
  model: &ArgModel,
  trees: &LocalTrees,
  matrices: &[ArgHmmMatrices],
  thread_path: &[i32],
  internal: bool,
  rng: &mut impl Rng,
  mut invisible: Option<&mut Vec<(i32, Spr)>>,
) -> (Vec<i32>, Vec<Spr>) {
  let grid = &model.grid;
  let start_coord = trees.start_coord;
  let tp = |pos: i32| thread_path[(pos - start_coord) as usize] as usize;

  let mut recomb_pos = Vec::new();
  let mut recombs = Vec::new();

  for (bi, mat) in matrices.iter().enumerate() {
    if mat.states.is_empty() {
      continue;
    }
    let tree = &trees.trees[bi].tree;
    let tm = &mat.transmat;
    let minage = tm.minage;
    let new_branch_node = if internal { tree[tree.root].child[0] } else { -1 };

    let start = mat.start;
    let end = mat.start + mat.blocklen;
    for pos in start + 1..end {
      let j = tp(pos - 1);
      let k = tp(pos);
      let sj = mat.states[j];
      let sk = mat.states[k];

      if j != k {
        // a state change requires a recombination
        let (a, pa) = (sj.time, sj.pop_path);
        let (b, pb) = (sk.time, sk.pop_path);
        let cap = a.min(b);

        let mut candidates = Vec::new();
        for r in minage..=cap {
          if !model.paths_equal(pa, pb, minage, r) {
            continue;
          }
          candidates.push(RecombCandidate {
            time: r,
            on_new_branch: true,
            weight: recomb_time_weight(grid, r, minage, a) * tm.rates.survive(pb, r, b),
          });
        }

        if sj.node == sk.node && model.paths_equal(pa, pb, minage, cap) {
          let bottom = tree[sj.node].age.max(minage);
          for r in bottom..=cap {
            candidates.push(RecombCandidate {
              time: r,
              on_new_branch: false,
              weight: recomb_time_weight(grid, r, bottom, cap) * tm.rates.survive(pb, r, b),
            });
          }
        }

        let weights: Vec<f64> = candidates.iter().map(|c| c.weight).collect();
        let pick = &candidates[sample_weights(&weights, rng)];

        let spr = if pick.on_new_branch {
          Spr::new(new_branch_node, pick.time, sk.node, b, pb)
        } else {
          // recomb on the target branch, re-coalescing onto the new branch
          let path = model.consistent_path(tree[sj.node].pop_path, pb, pick.time, pick.time, b);
          Spr::new(sj.node, pick.time, new_branch_node, b, path)
        };
        recomb_pos.push(pos);
        recombs.push(spr);
      } else if let Some(invisible) = invisible.as_mut() {
        // self-recombination that rejoins the same state
        let (a, pa) = (sj.time, sj.pop_path);
        let mut mass = 0.0;
        let mut weights = Vec::new();
        for r in minage..=a {
          let w = recomb_time_weight(grid, r, minage, a) * tm.rates.survive(pa, r, a);
          weights.push(w);
          mass += w;
        }
        let q = tm.recomb_prob[a as usize] * tm.rates.coal_end(pa, a) * mass;
        let p_fire = q / (q + tm.norecomb[a as usize]);
        if rng.gen::<f64>() < p_fire {
          let r = minage + sample_weights(&weights, rng) as i32;
          invisible.push((pos, Spr::new(sj.node, r, sj.node, a, pa)));
        }
      }
    }
  }

  (recomb_pos, recombs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_tree::LocalTree;
  use crate::arg::local_trees::LocalTreeSpr;
  use crate::hmm::forward::compute_matrices;
  use crate::hmm::states::StatesModel;
  use crate::model::sequences::Sequences;
  use crate::model::time_grid::TimeGrid;
  use crate::utils::random::get_random_number_generator;
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
  fn constant_thread_needs_no_recombs() -> Result<(), Report> {
    let model = model();
    let trees = two_leaf_arg(40);
    let seqs = Sequences::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![vec![b'A'; 40], vec![b'A'; 40], vec![b'A'; 40]],
    )?;
    let states_model = StatesModel::new(5);
    let matrices = compute_matrices(&model, Some(&seqs), &trees, &states_model, Some(2));

    let thread_path = vec![3; 40];
    let mut rng = get_random_number_generator(Some(3));
    let (pos, recombs) = sample_recombinations(&model, &trees, &matrices, &thread_path, false, &mut rng, None);
    assert!(pos.is_empty());
    assert!(recombs.is_empty());
    Ok(())
  }

  #[rstest]
  fn state_change_forces_recomb() -> Result<(), Report> {
    let model = model();
    let trees = two_leaf_arg(10);
    let seqs = Sequences::new(
      vec!["a".into(), "b".into(), "c".into()],
      vec![vec![b'A'; 10], vec![b'A'; 10], vec![b'A'; 10]],
    )?;
    let states_model = StatesModel::new(5);
    let matrices = compute_matrices(&model, Some(&seqs), &trees, &states_model, Some(2));

    // find two states on different branches
    let states = &matrices[0].states;
    let s_from = states.iter().position(|s| s.node == 0 && s.time == 1).unwrap();
    let s_to = states.iter().position(|s| s.node == 1 && s.time == 2).unwrap();

    let mut thread_path = vec![s_from as i32; 10];
    for p in thread_path.iter_mut().skip(5) {
      *p = s_to as i32;
    }

    let mut rng = get_random_number_generator(Some(17));
    let (pos, recombs) = sample_recombinations(&model, &trees, &matrices, &thread_path, false, &mut rng, None);
    assert_eq!(pos, vec![5]);
    assert_eq!(recombs.len(), 1);
    let spr = recombs[0];
    // the recomb must be on the new branch, at or below both states
    assert_eq!(spr.recomb_node, -1);
    assert!(spr.recomb_time <= 1);
    assert_eq!(spr.coal_node, 1);
    assert_eq!(spr.coal_time, 2);
    Ok(())
  }
}

use crate::arg::local_tree::LocalNode;
use ndarray::Array2;

/// A sampled migration parameter: one off-diagonal entry of the migration
/// matrix at one half-time interval, with its Beta prior.
#[derive(Clone, Debug)]
pub struct MigParam {
  pub from_pop: i32,
  pub to_pop: i32,
  pub time_idx: usize,
  pub alpha: f64,
  pub beta: f64,
}

/// Structured population model: per-half-interval migration matrices and the
/// enumerated population paths they admit.
///
/// A path is an integer id indexing a table `(path, time) -> population`;
/// path equality, composition, and probability are table lookups, so branches
/// and SPRs can carry a single integer.
#[derive(Clone, Debug)]
pub struct PopulationModel {
  pub npop: usize,
  pub ntimes: usize,
  /// row-stochastic matrices, one per half interval; migration happens on odd indices
  pub mig_matrices: Vec<Array2<f64>>,
  pub mig_params: Vec<MigParam>,
  pub max_migrations: usize,
  paths: Vec<Vec<i32>>,
}

impl PopulationModel {
  pub fn new(npop: usize, ntimes: usize) -> Self {
    let mig_matrices = (0..2 * ntimes - 1).map(|_| Array2::eye(npop)).collect();
    let mut model = Self {
      npop,
      ntimes,
      mig_matrices,
      mig_params: Vec::new(),
      max_migrations: 2,
      paths: Vec::new(),
    };
    model.set_up_population_paths();
    model
  }

  /// Registers a migration edge `(from, to)` at odd half-interval `time_idx`
  /// and rebalances the self-migration rate to keep the row stochastic
  pub fn add_migration(&mut self, time_idx: usize, from_pop: i32, to_pop: i32, prob: f64) {
    assert_eq!(time_idx % 2, 1, "migrations occur between time intervals");
    assert_ne!(from_pop, to_pop);
    let mat = &mut self.mig_matrices[time_idx];
    let (f, t) = (from_pop as usize, to_pop as usize);
    let old = mat[(f, t)];
    mat[(f, t)] = prob;
    mat[(f, f)] += old - prob;
  }

  pub fn add_mig_param(&mut self, from_pop: i32, to_pop: i32, time_idx: usize, alpha: f64, beta: f64) {
    self.mig_params.push(MigParam {
      from_pop,
      to_pop,
      time_idx,
      alpha,
      beta,
    });
  }

  /// Step matrix taking populations at time t to populations at time t+1
  fn step_matrix(&self, t: usize) -> &Array2<f64> {
    &self.mig_matrices[2 * t + 1]
  }

  /// Enumerates population paths admitted by the migration matrices, capped
  /// at `max_migrations` off-diagonal moves per path
  pub fn set_up_population_paths(&mut self) {
    let mut paths: Vec<Vec<i32>> = Vec::new();
    for start in 0..self.npop as i32 {
      let mut stack = vec![(vec![start], 0_usize)];
      while let Some((path, nmig)) = stack.pop() {
        let t = path.len() - 1;
        if t == self.ntimes - 1 {
          paths.push(path);
          continue;
        }
        let cur = *path.last().unwrap() as usize;
        for next in 0..self.npop {
          if self.step_matrix(t)[(cur, next)] > 0.0 {
            let nmig2 = nmig + usize::from(next != cur);
            if nmig2 <= self.max_migrations {
              let mut path2 = path.clone();
              path2.push(next as i32);
              stack.push((path2, nmig2));
            }
          }
        }
      }
    }
    paths.sort();
    paths.dedup();
    self.paths = paths;
  }

  /// Revalidates migration rows after a parameter update
  pub fn update_population_probs(&self) {
    for (i, mat) in self.mig_matrices.iter().enumerate() {
      for row in mat.rows() {
        let sum: f64 = row.sum();
        assert!((sum - 1.0).abs() < 1e-8, "migration row {i} is not stochastic (sum {sum})");
      }
    }
  }

  #[inline]
  pub fn num_pop_paths(&self) -> usize {
    self.paths.len()
  }

  #[inline]
  pub fn get_pop(&self, path: i32, time: i32) -> i32 {
    let time = (time.max(0) as usize).min(self.ntimes - 1);
    self.paths[path as usize][time]
  }

  /// Two paths are equal over [t1, t2] iff they visit the same population at
  /// every discrete time in the interval; `t2 == -1` means "to the end"
  pub fn paths_equal(&self, path1: i32, path2: i32, t1: i32, t2: i32) -> bool {
    if path1 == path2 {
      return true;
    }
    let t2 = if t2 < 0 { self.ntimes as i32 - 1 } else { t2 };
    (t1..=t2).all(|t| self.get_pop(path1, t) == self.get_pop(path2, t))
  }

  /// Probability of following `path` from time t1 to t2 under the migration model
  pub fn path_prob(&self, path: i32, t1: i32, t2: i32) -> f64 {
    let t2 = if t2 < 0 { self.ntimes as i32 - 1 } else { t2 };
    let t2 = (t2 as usize).min(self.ntimes - 1);
    let mut prob = 1.0;
    for t in t1.max(0) as usize..t2 {
      let a = self.get_pop(path, t as i32) as usize;
      let b = self.get_pop(path, t as i32 + 1) as usize;
      prob *= self.step_matrix(t)[(a, b)];
    }
    prob
  }

  /// A path equal to `path1` on [t1, t2] and to `path2` on [t2, t3]
  /// (`t3 == -1` means to the end). Aborts if no enumerated path fits.
  pub fn consistent_path(&self, path1: i32, path2: i32, t1: i32, t2: i32, t3: i32) -> i32 {
    self
      .try_consistent_path(path1, path2, t1, t2, t3)
      .unwrap_or_else(|| panic!("no consistent path composing {path1} and {path2} over [{t1},{t2},{t3}]"))
  }

  pub fn try_consistent_path(&self, path1: i32, path2: i32, t1: i32, t2: i32, t3: i32) -> Option<i32> {
    if t2 < 0 {
      return Some(path1);
    }
    let t3 = if t3 < 0 { self.ntimes as i32 - 1 } else { t3 };
    (0..self.paths.len() as i32)
      .find(|&p| self.paths_equal(p, path1, t1, t2) && self.paths_equal(p, path2, t2, t3))
  }

  /// A path following `node`'s own path up to its parent, then each ancestor's
  /// path in turn, all the way to the root
  pub fn path_to_root(&self, nodes: &[LocalNode], node: i32) -> i32 {
    let base_age = nodes[node as usize].age;
    let mut path = nodes[node as usize].pop_path;
    let mut cur = node;
    loop {
      let parent = nodes[cur as usize].parent;
      if parent == -1 {
        break;
      }
      let switch = nodes[parent as usize].age;
      path = self.consistent_path(path, nodes[parent as usize].pop_path, base_age, switch, -1);
      cur = parent;
    }
    path
  }

  /// The highest-probability full path starting in `start_pop`
  pub fn most_likely_path(&self, start_pop: i32) -> i32 {
    let mut best = 0;
    let mut best_prob = -1.0;
    for p in 0..self.paths.len() as i32 {
      if self.get_pop(p, 0) != start_pop {
        continue;
      }
      let prob = self.path_prob(p, 0, self.ntimes as i32 - 1);
      if prob > best_prob {
        best_prob = prob;
        best = p;
      }
    }
    assert!(best_prob >= 0.0, "no path starts in population {start_pop}");
    best
  }

  /// Population that survives to the final time point
  pub fn final_pop(&self) -> i32 {
    self.paths[0][self.ntimes - 1]
  }

  /// True if any off-diagonal migration is possible between times t and t+1
  pub fn has_migration(&self, time: i32) -> bool {
    let mat = self.step_matrix(time as usize);
    (0..self.npop).any(|i| (0..self.npop).any(|j| i != j && mat[(i, j)] > 0.0))
  }

  /// Number of distinct path prefixes over [0, time] among paths starting in `start_pop`
  pub fn num_sub_paths(&self, start_pop: i32, time: i32) -> usize {
    let t = (time.max(0) as usize).min(self.ntimes - 1);
    let mut prefixes: Vec<&[i32]> = self
      .paths
      .iter()
      .filter(|p| p[0] == start_pop)
      .map(|p| &p[..=t])
      .collect();
    prefixes.sort();
    prefixes.dedup();
    prefixes.len()
  }
}

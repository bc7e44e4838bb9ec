use crate::arg::local_tree::LocalNode;
use crate::model::population::PopulationModel;
use crate::model::time_grid::TimeGrid;
use crate::model::track::{merge_to_common_partition, Track};
use eyre::Report;
use itertools::Itertools;
use log::{debug, log_enabled, Level};
use smart_default::SmartDefault;
use std::collections::BTreeSet;

/// One sampled population-size parameter: a named set of (pop, half-interval)
/// cells that share a single size value.
#[derive(Clone, Debug)]
pub struct PopsizeConfigParam {
  pub name: String,
  pub sample: bool,
  pub intervals: BTreeSet<(usize, usize)>,
}

impl PopsizeConfigParam {
  pub fn add_interval(&mut self, pop: usize, time: usize) {
    self.intervals.insert((pop, time));
  }
}

#[derive(Clone, Debug, SmartDefault)]
pub struct PopsizeConfig {
  pub sample: bool,
  #[default = 1]
  pub numsample: usize,
  pub neighbor_prior: bool,
  pub params: Vec<PopsizeConfigParam>,
}

impl PopsizeConfig {
  /// One parameter per (pop, grid time), covering the two half-intervals
  /// below and above the grid point
  pub fn one_param_per_time(npop: usize, ntimes: usize) -> Self {
    let mut config = Self {
      sample: true,
      ..Self::default()
    };
    for pop in 0..npop {
      for i in 0..ntimes {
        let name = format!("N{pop}.{i}");
        if i > 0 {
          config.add_interval(&name, pop, 2 * i - 1, true);
        }
        config.add_interval(&name, pop, 2 * i, true);
      }
    }
    config
  }

  pub fn add_interval(&mut self, name: &str, pop: usize, time: usize, sample: bool) {
    if let Some(param) = self.params.iter_mut().find(|p| p.name == name) {
      assert_eq!(param.sample, sample, "conflicting sample flags for popsize parameter {name}");
      param.add_interval(pop, time);
      return;
    }
    let mut param = PopsizeConfigParam {
      name: name.to_owned(),
      sample,
      intervals: BTreeSet::new(),
    };
    param.add_interval(pop, time);
    self.params.push(param);
  }
}

/// The full model an inference run is conditioned on: time grid, per-interval
/// population sizes, recombination and mutation rates (constant or mapped),
/// and an optional structured population model.
#[derive(Clone, Debug)]
pub struct ArgModel {
  pub grid: TimeGrid,
  pub rho: f64,
  pub mu: f64,
  /// per-population sizes over the 2T-1 half intervals
  pub popsizes: Vec<Vec<f64>>,
  pub mutmap: Track<f64>,
  pub recombmap: Track<f64>,
  pub pop_model: Option<PopulationModel>,
  pub popsize_config: PopsizeConfig,
}

impl ArgModel {
  pub fn new(grid: TimeGrid, popsize: f64, rho: f64, mu: f64) -> Self {
    let nhalf = 2 * grid.ntimes() - 1;
    Self {
      grid,
      rho,
      mu,
      popsizes: vec![vec![popsize; nhalf]],
      mutmap: Track::new(),
      recombmap: Track::new(),
      pop_model: None,
      popsize_config: PopsizeConfig::default(),
    }
  }

  pub fn with_pop_model(mut self, pop_model: PopulationModel) -> Self {
    let nhalf = 2 * self.ntimes() - 1;
    let popsize = self.popsizes[0][0];
    self.popsizes = vec![vec![popsize; nhalf]; pop_model.npop];
    self.pop_model = Some(pop_model);
    self
  }

  #[inline]
  pub fn ntimes(&self) -> usize {
    self.grid.ntimes()
  }

  #[inline]
  pub fn times(&self) -> &[f64] {
    &self.grid.times
  }

  #[inline]
  pub fn num_pops(&self) -> usize {
    self.pop_model.as_ref().map_or(1, |p| p.npop)
  }

  #[inline]
  pub fn num_pop_paths(&self) -> usize {
    self.pop_model.as_ref().map_or(1, PopulationModel::num_pop_paths)
  }

  #[inline]
  pub fn get_pop(&self, path: i32, time: i32) -> i32 {
    self.pop_model.as_ref().map_or(0, |p| p.get_pop(path, time))
  }

  #[inline]
  pub fn paths_equal(&self, path1: i32, path2: i32, t1: i32, t2: i32) -> bool {
    match &self.pop_model {
      None => true,
      Some(p) => p.paths_equal(path1, path2, t1, t2),
    }
  }

  #[inline]
  pub fn consistent_path(&self, path1: i32, path2: i32, t1: i32, t2: i32, t3: i32) -> i32 {
    self
      .pop_model
      .as_ref()
      .map_or(0, |p| p.consistent_path(path1, path2, t1, t2, t3))
  }

  #[inline]
  pub fn path_prob(&self, path: i32, t1: i32, t2: i32) -> f64 {
    self.pop_model.as_ref().map_or(1.0, |p| p.path_prob(path, t1, t2))
  }

  #[inline]
  pub fn path_to_root(&self, nodes: &[LocalNode], node: i32) -> i32 {
    self.pop_model.as_ref().map_or(0, |p| p.path_to_root(nodes, node))
  }

  /// Population size over half interval `half_idx` in population `pop`
  #[inline]
  pub fn popsize(&self, pop: i32, half_idx: usize) -> f64 {
    let nhalf = 2 * self.ntimes() - 1;
    self.popsizes[pop as usize][half_idx.min(nhalf - 1)]
  }

  /// Sentinel age of a partial ARG's virtual root; any node age above
  /// `ntimes` marks a tree as partial
  #[inline]
  pub fn removed_root_time(&self) -> i32 {
    self.ntimes() as i32 + 1
  }

  /// Splits the recombination and mutation maps to a common partition
  /// covering [start, end); missing stretches fall back to the global rates
  pub fn setup_maps(&mut self, chrom: &str, start: i32, end: i32) -> Result<(), Report> {
    self.mutmap.complete(chrom, start, end, self.mu)?;
    self.recombmap.complete(chrom, start, end, self.rho)?;
    let (mutmap, recombmap) = merge_to_common_partition(&self.mutmap, &self.recombmap, chrom, start);
    self.mutmap = mutmap;
    self.recombmap = recombmap;
    Ok(())
  }

  /// Local (rho, mu) at a position; global rates when no maps are set up
  pub fn local_rates(&self, pos: i32) -> (f64, f64) {
    let rho = self.recombmap.value_at(pos).copied().unwrap_or(self.rho);
    let mu = self.mutmap.value_at(pos).copied().unwrap_or(self.mu);
    (rho, mu)
  }

  pub fn log_model(&self) {
    debug!("model:");
    debug!("  mu = {:e}", self.mu);
    debug!("  rho = {:e}", self.rho);
    debug!("  ntimes = {}", self.ntimes());
    debug!("  times = [{}]", self.times().iter().map(|t| format!("{t:.1}")).join(","));
    debug!("  npop = {}", self.num_pops());
    if let Some(pop_model) = &self.pop_model {
      debug!("  numpath = {}", pop_model.num_pop_paths());
      if log_enabled!(Level::Trace) {
        for p in 0..pop_model.num_pop_paths() as i32 {
          let path = (0..self.ntimes() as i32).map(|t| pop_model.get_pop(p, t)).join(", ");
          debug!("  path{p} = [{path}]");
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use eyre::Report;
  use rstest::rstest;

  fn model() -> ArgModel {
    let grid = TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap();
    ArgModel::new(grid, 1e4, 1.5e-8, 2.5e-8)
  }

  #[rstest]
  fn maps_fall_back_to_global_rates() -> Result<(), Report> {
    let mut m = model();
    m.recombmap.append("chr", 100, 200, 1e-9);
    m.setup_maps("chr", 0, 1000)?;
    assert_eq!(m.local_rates(150), (1e-9, 2.5e-8));
    assert_eq!(m.local_rates(500), (1.5e-8, 2.5e-8));
    assert_eq!(m.mutmap.len(), m.recombmap.len());
    Ok(())
  }

  #[rstest]
  fn popsize_clamps_final_interval() {
    let m = model();
    assert_eq!(m.popsize(0, 100), 1e4);
  }

  #[rstest]
  fn default_popsize_config_covers_all_half_intervals() {
    let config = PopsizeConfig::one_param_per_time(1, 5);
    assert_eq!(config.params.len(), 5);
    let covered: usize = config.params.iter().map(|p| p.intervals.len()).sum();
    assert_eq!(covered, 2 * 5 - 1);
  }
}

/// Terms this far below the column maximum are dropped from log-space sums
pub const SUM_LOG_THRESHOLD: f64 = -15.0;

/// Tolerance for matching a real time against a grid point
pub const TIME_TOL: f64 = 1.0;

/// Smallest admissible forward-column normaliser before the run is declared degenerate
pub const MIN_COLUMN_NORM: f64 = 1e-300;

/// Default preference for recombination-bearing branches in climb resampling
pub const DEFAULT_RECOMB_PREFERENCE: f64 = 0.9;

/// Default probability of switching branches at a removal-path fork
pub const DEFAULT_PROB_PATH_SWITCH: f64 = 0.5;

use crate::make_error;
use eyre::Report;

/// A region of a chromosome associated with a value.
/// `start` is inclusive, `end` is exclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionValue<T> {
  pub chrom: String,
  pub start: i32,
  pub end: i32,
  pub value: T,
}

impl<T> RegionValue<T> {
  pub fn new(chrom: impl Into<String>, start: i32, end: i32, value: T) -> Self {
    Self {
      chrom: chrom.into(),
      start,
      end,
      value,
    }
  }

  pub fn length(&self) -> i32 {
    self.end - self.start
  }
}

/// A series of contiguous regions each associated with a value
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Track<T>(pub Vec<RegionValue<T>>);

impl<T: Clone> Track<T> {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn append(&mut self, chrom: impl Into<String>, start: i32, end: i32, value: T) {
    self.0.push(RegionValue::new(chrom, start, end, value));
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn start_coord(&self) -> Option<i32> {
    self.0.first().map(|r| r.start)
  }

  pub fn end_coord(&self) -> Option<i32> {
    self.0.last().map(|r| r.end)
  }

  /// Value of the region containing `pos`
  pub fn value_at(&self, pos: i32) -> Option<&T> {
    let idx = self.0.partition_point(|r| r.end <= pos);
    self.0.get(idx).filter(|r| r.start <= pos).map(|r| &r.value)
  }

  /// Fills gaps so regions tile [start, end) exactly; errors on overlaps
  pub fn complete(&mut self, chrom: &str, start: i32, end: i32, default_value: T) -> Result<(), Report> {
    if self.0.is_empty() {
      self.append(chrom, start, end, default_value);
      return Ok(());
    }

    if self.0[0].start > start {
      let first_start = self.0[0].start;
      self.0.insert(0, RegionValue::new(chrom, start, first_start, default_value.clone()));
    }
    if self.0.last().map(|r| r.end) < Some(end) {
      let last_end = self.0.last().map_or(start, |r| r.end);
      self.append(chrom, last_end, end, default_value.clone());
    }

    let mut i = 1;
    while i < self.0.len() {
      let last = self.0[i - 1].end;
      if self.0[i].start > last {
        let gap_end = self.0[i].start;
        self.0.insert(i, RegionValue::new(chrom, last, gap_end, default_value.clone()));
      } else if self.0[i].start < last {
        return make_error!("map contains overlaps at {chrom}:{}-{last}", self.0[i].start);
      }
      i += 1;
    }

    Ok(())
  }
}

/// Rewrites two complete tracks onto a shared partition of their region
pub fn merge_to_common_partition(a: &Track<f64>, b: &Track<f64>, chrom: &str, start: i32) -> (Track<f64>, Track<f64>) {
  let mut a2 = Track::new();
  let mut b2 = Track::new();

  let mut pos = start;
  let mut i = 0;
  let mut j = 0;
  while i < a.len() || j < b.len() {
    let a_end = a.0[i.min(a.len() - 1)].end;
    let b_end = b.0[j.min(b.len() - 1)].end;
    let pos2 = a_end.min(b_end);
    a2.append(chrom, pos, pos2, a.0[i.min(a.len() - 1)].value);
    b2.append(chrom, pos, pos2, b.0[j.min(b.len() - 1)].value);
    pos = pos2;
    if a_end <= pos2 {
      i += 1;
    }
    if b_end <= pos2 {
      j += 1;
    }
  }

  (a2, b2)
}

#[cfg(test)]
mod tests {
  use super::*;
  use eyre::Report;
  use rstest::rstest;

  #[rstest]
  fn complete_fills_gaps_and_edges() -> Result<(), Report> {
    let mut t = Track::new();
    t.append("chr", 100, 200, 1.0);
    t.append("chr", 300, 400, 2.0);
    t.complete("chr", 0, 500, 9.0)?;

    let bounds: Vec<(i32, i32)> = t.0.iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(bounds, vec![(0, 100), (100, 200), (200, 300), (300, 400), (400, 500)]);
    assert_eq!(t.value_at(250), Some(&9.0));
    assert_eq!(t.value_at(150), Some(&1.0));
    Ok(())
  }

  #[rstest]
  fn complete_rejects_overlaps() {
    let mut t = Track::new();
    t.append("chr", 0, 200, 1.0);
    t.append("chr", 100, 300, 2.0);
    assert!(t.complete("chr", 0, 300, 9.0).is_err());
  }

  #[rstest]
  fn merge_produces_common_partition() -> Result<(), Report> {
    let mut a = Track::new();
    a.append("chr", 0, 150, 1.0);
    a.append("chr", 150, 300, 2.0);
    let mut b = Track::new();
    b.append("chr", 0, 100, 10.0);
    b.append("chr", 100, 300, 20.0);

    let (a2, b2) = merge_to_common_partition(&a, &b, "chr", 0);
    let bounds: Vec<(i32, i32)> = a2.0.iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(bounds, vec![(0, 100), (100, 150), (150, 300)]);
    assert_eq!(a2.0.iter().map(|r| r.value).collect::<Vec<_>>(), vec![1.0, 1.0, 2.0]);
    assert_eq!(b2.0.iter().map(|r| r.value).collect::<Vec<_>>(), vec![10.0, 20.0, 20.0]);
    assert_eq!(a2.end_coord(), b2.end_coord());
    Ok(())
  }
}

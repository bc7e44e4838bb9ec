use crate::make_error;
use eyre::Report;

/// Aligned haplotype sequences over {A, C, G, T, N} with per-haplotype
/// population assignments and sample ages (as time-grid indices).
#[derive(Clone, Debug, Default)]
pub struct Sequences {
  pub names: Vec<String>,
  pub seqs: Vec<Vec<u8>>,
  pub pops: Vec<i32>,
  pub ages: Vec<i32>,
}

impl Sequences {
  pub fn new(names: Vec<String>, seqs: Vec<Vec<u8>>) -> Result<Self, Report> {
    if names.len() != seqs.len() {
      return make_error!("{} names for {} sequences", names.len(), seqs.len());
    }
    if let Some(first) = seqs.first() {
      for (i, s) in seqs.iter().enumerate() {
        if s.len() != first.len() {
          return make_error!("sequence {} has length {}, expected {}", names[i], s.len(), first.len());
        }
        if let Some(&c) = s.iter().find(|&&c| !matches!(c, b'A' | b'C' | b'G' | b'T' | b'N')) {
          return make_error!("sequence {} contains invalid base '{}'", names[i], c as char);
        }
      }
    }
    let n = names.len();
    Ok(Self {
      names,
      seqs,
      pops: vec![0; n],
      ages: vec![0; n],
    })
  }

  pub fn with_pops(mut self, pops: Vec<i32>) -> Self {
    assert_eq!(pops.len(), self.num_seqs());
    self.pops = pops;
    self
  }

  pub fn with_ages(mut self, ages: Vec<i32>) -> Self {
    assert_eq!(ages.len(), self.num_seqs());
    self.ages = ages;
    self
  }

  #[inline]
  pub fn num_seqs(&self) -> usize {
    self.seqs.len()
  }

  #[inline]
  pub fn length(&self) -> usize {
    self.seqs.first().map_or(0, Vec::len)
  }

  #[inline]
  pub fn get_pop(&self, seqid: i32) -> i32 {
    self.pops[seqid as usize]
  }

  #[inline]
  pub fn get_age(&self, seqid: i32) -> i32 {
    self.ages[seqid as usize]
  }

  #[inline]
  pub fn base(&self, seqid: i32, pos: i32) -> u8 {
    self.seqs[seqid as usize][pos as usize]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  fn rejects_ragged_alignments() {
    let res = Sequences::new(
      vec!["a".into(), "b".into()],
      vec![b"ACGT".to_vec(), b"ACG".to_vec()],
    );
    assert!(res.is_err());
  }

  #[rstest]
  fn rejects_invalid_bases() {
    let res = Sequences::new(vec!["a".into()], vec![b"ACGU".to_vec()]);
    assert!(res.is_err());
  }
}

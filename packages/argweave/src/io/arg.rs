use crate::arg::local_trees::{get_recoal_node, LocalTreeSpr, LocalTrees};
use crate::arg::spr::Spr;
use crate::io::nwk::{parse_local_tree, write_newick_tree};
use crate::make_error;
use crate::model::time_grid::TimeGrid;
use eyre::Report;
use itertools::Itertools;
use std::io::{BufRead, Write};

/// Writes an ARG in the textual local-trees format:
///
/// ```text
/// NAMES\t<name1>\t<name2>\t...
/// REGION\t<chrom>\t<start1based>\t<end>
/// TREE\t<start1based>\t<end>\t<extended-newick-with-NHX>
/// SPR\t<end>\t<recomb_node>\t<recomb_time>\t<coal_node>\t<coal_time>[\t<pop_path>]
/// SPR-INVIS\t<pos>\t<rn>\t<rt>\t<cn>\t<ct>[\t<pp>]
/// ```
///
/// Node ids are kept stable across blocks by threading a running mapping
/// through every SPR, so a node keeps one name for its whole lifetime.
pub fn write_local_trees(
  out: &mut impl Write,
  trees: &LocalTrees,
  names: &[String],
  times: &[f64],
  pop_model: bool,
  self_recomb_pos: &[i32],
  self_recombs: &[Spr],
) -> Result<(), Report> {
  let nnodes = trees.nnodes;
  assert_eq!(self_recomb_pos.len(), self_recombs.len());

  let leaf_names = (0..trees.num_leaves())
    .map(|i| names[trees.seqids[i] as usize].as_str())
    .join("\t");
  writeln!(out, "NAMES\t{leaf_names}")?;

  // convert to 1-based inclusive start on disk
  writeln!(out, "REGION\t{}\t{}\t{}", trees.chrom, trees.start_coord + 1, trees.end_coord)?;

  let mut total_mapping: Vec<i32> = (0..nnodes as i32).collect();
  let mut self_idx = 0;

  let mut end = trees.start_coord;
  for (i, it) in trees.trees.iter().enumerate() {
    let start = end;
    end += it.blocklen;

    let nodeids: Vec<String> = total_mapping.iter().map(ToString::to_string).collect();
    let newick = write_newick_tree(&it.tree, &nodeids, times, pop_model)?;
    writeln!(out, "TREE\t{}\t{}\t{}", start + 1, end, newick)?;

    while self_idx < self_recomb_pos.len() && self_recomb_pos[self_idx] < end {
      let spr = &self_recombs[self_idx];
      write!(
        out,
        "SPR-INVIS\t{}\t{}\t{:.6}\t{}\t{:.6}",
        self_recomb_pos[self_idx] + 1,
        total_mapping[spr.recomb_node as usize],
        times[spr.recomb_time as usize],
        total_mapping[spr.coal_node as usize],
        times[spr.coal_time as usize]
      )?;
      if pop_model {
        write!(out, "\t{}", spr.pop_path)?;
      }
      writeln!(out)?;
      self_idx += 1;
    }

    if let Some(it2) = trees.trees.get(i + 1) {
      let spr = &it2.spr;
      write!(
        out,
        "SPR\t{}\t{}\t{:.6}\t{}\t{:.6}",
        end,
        total_mapping[spr.recomb_node as usize],
        times[spr.recomb_time as usize],
        total_mapping[spr.coal_node as usize],
        times[spr.coal_time as usize]
      )?;
      if pop_model {
        write!(out, "\t{}", spr.pop_path)?;
      }
      writeln!(out)?;

      // carry stable names through the SPR
      let mapping = it2.mapping.as_ref().unwrap();
      let tmp_mapping = total_mapping.clone();
      for (j, &m) in mapping.iter().enumerate() {
        if m != -1 {
          total_mapping[m as usize] = tmp_mapping[j];
        } else {
          let recoal = get_recoal_node(&it2.tree, spr, mapping);
          total_mapping[recoal as usize] = tmp_mapping[j];
        }
      }
    }
  }

  Ok(())
}

/// Parses an ARG from the textual local-trees format.
///
/// Returns the ARG, the haplotype names, and any invisible recombination
/// records. Real times snap to the nearest grid point.
pub fn read_local_trees(
  reader: impl BufRead,
  grid: &TimeGrid,
) -> Result<(LocalTrees, Vec<String>, Vec<(i32, Spr)>), Report> {
  let mut trees = LocalTrees::new(0, 0);
  let mut seqnames: Vec<String> = Vec::new();
  let mut invisible: Vec<(i32, Spr)> = Vec::new();

  let mut spr = Spr::null();
  let mut last_tree_idx: Option<usize> = None;

  for (lineno, line) in reader.lines().enumerate() {
    let line = line?;
    let lineno = lineno + 1;
    let fields: Vec<&str> = line.trim_end().split('\t').collect();
    if fields.is_empty() || fields[0].is_empty() {
      continue;
    }

    match fields[0] {
      "NAMES" => {
        seqnames = fields[1..].iter().map(ToString::to_string).collect();
      }
      "REGION" => {
        if fields.len() != 4 {
          return make_error!("bad REGION line (line {lineno})");
        }
        trees.chrom = fields[1].to_owned();
        trees.start_coord = fields[2]
          .parse::<i32>()
          .map_err(|_| crate::make_report!("bad REGION start (line {lineno})"))?
          - 1;
        trees.end_coord = fields[3]
          .parse()
          .map_err(|_| crate::make_report!("bad REGION end (line {lineno})"))?;
      }
      "TREE" => {
        if fields.len() != 4 {
          return make_error!("bad TREE line (line {lineno})");
        }
        let start: i32 = fields[1]
          .parse()
          .map_err(|_| crate::make_report!("bad TREE start (line {lineno})"))?;
        let end: i32 = fields[2]
          .parse()
          .map_err(|_| crate::make_report!("bad TREE end (line {lineno})"))?;

        let tree = parse_local_tree(fields[3], grid)?;
        let nnodes = tree.nnodes();

        // node names are stable on disk, so the mapping is the identity
        // except for the broken node
        let mapping = if spr.is_null() {
          None
        } else {
          let mut mapping: Vec<i32> = (0..nnodes as i32).collect();
          if spr.recomb_node != spr.coal_node {
            let last_tree = &trees.trees[last_tree_idx.unwrap()].tree;
            mapping[last_tree[spr.recomb_node].parent as usize] = -1;
          }
          Some(mapping)
        };

        let blocklen = end - start + 1;
        trees.trees.push(LocalTreeSpr::new(tree, spr, blocklen, mapping));
        last_tree_idx = Some(trees.trees.len() - 1);
        spr = Spr::null();
      }
      "SPR" => {
        let (_pos, parsed) = parse_spr_fields(&fields, grid, lineno)?;
        spr = parsed;
      }
      "SPR-INVIS" => {
        let (pos, parsed) = parse_spr_fields(&fields, grid, lineno)?;
        invisible.push((pos - 1, parsed));
      }
      _ => {
        return make_error!("unknown record '{}' (line {lineno})", fields[0]);
      }
    }
  }

  if trees.num_trees() > 0 {
    trees.nnodes = trees.trees[0].tree.nnodes();
    trees.set_default_seqids();
  }

  Ok((trees, seqnames, invisible))
}

fn parse_spr_fields(fields: &[&str], grid: &TimeGrid, lineno: usize) -> Result<(i32, Spr), Report> {
  if fields.len() != 6 && fields.len() != 7 {
    return make_error!("bad {} line (line {lineno})", fields[0]);
  }

  let pos: i32 = fields[1]
    .parse()
    .map_err(|_| crate::make_report!("bad {} position (line {lineno})", fields[0]))?;
  let recomb_node: i32 = fields[2]
    .parse()
    .map_err(|_| crate::make_report!("bad recomb node (line {lineno})"))?;
  let recomb_time: f64 = fields[3]
    .parse()
    .map_err(|_| crate::make_report!("bad recomb time (line {lineno})"))?;
  let coal_node: i32 = fields[4]
    .parse()
    .map_err(|_| crate::make_report!("bad coal node (line {lineno})"))?;
  let coal_time: f64 = fields[5]
    .parse()
    .map_err(|_| crate::make_report!("bad coal time (line {lineno})"))?;
  let pop_path: i32 = if fields.len() == 7 {
    fields[6]
      .parse()
      .map_err(|_| crate::make_report!("bad pop path (line {lineno})"))?
  } else {
    0
  };

  Ok((
    pos,
    Spr::new(recomb_node, grid.nearest(recomb_time), coal_node, grid.nearest(coal_time), pop_path),
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arg::local_tree::LocalTree;
  use crate::arg::local_trees::{assert_trees, make_node_mapping};
  use crate::arg::spr::apply_spr;
  use rstest::rstest;

  fn grid() -> TimeGrid {
    TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap()
  }

  fn two_block_arg() -> LocalTrees {
    let tree1 = LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None);
    let spr = Spr::new(1, 0, 2, 2, 0);
    let mut tree2 = tree1.clone();
    apply_spr(&mut tree2, &spr, None);
    let mapping = make_node_mapping(&tree1, spr.recomb_node);

    let mut trees = LocalTrees::new(0, 100);
    trees.nnodes = 5;
    trees.seqids = vec![0, 1, 2];
    trees.trees.push(LocalTreeSpr::new(tree1, Spr::null(), 40, None));
    trees.trees.push(LocalTreeSpr::new(tree2, spr, 60, Some(mapping)));
    trees
  }

  fn names() -> Vec<String> {
    vec!["sampleA".into(), "sampleB".into(), "sampleC".into()]
  }

  #[rstest]
  fn text_round_trip_is_idempotent() -> Result<(), Report> {
    let grid = grid();
    let trees = two_block_arg();

    let mut buf: Vec<u8> = Vec::new();
    write_local_trees(&mut buf, &trees, &names(), &grid.times, false, &[], &[])?;

    let (parsed, seqnames, invisible) = read_local_trees(buf.as_slice(), &grid)?;
    assert_eq!(seqnames, names());
    assert!(invisible.is_empty());
    assert_eq!(parsed.start_coord, 0);
    assert_eq!(parsed.end_coord, 100);
    assert_eq!(parsed.num_trees(), 2);
    assert_eq!(parsed.trees[0].blocklen, 40);
    assert_eq!(parsed.trees[1].blocklen, 60);
    assert_trees(&parsed, None, false);

    // serialise -> parse -> re-serialise reproduces the bytes
    let mut buf2: Vec<u8> = Vec::new();
    write_local_trees(&mut buf2, &parsed, &seqnames, &grid.times, false, &[], &[])?;
    assert_eq!(String::from_utf8(buf)?, String::from_utf8(buf2)?);
    Ok(())
  }

  #[rstest]
  fn invisible_recombs_round_trip() -> Result<(), Report> {
    let grid = grid();
    let trees = two_block_arg();
    let invis_pos = vec![10];
    let invis = vec![Spr::new(2, 0, 2, 2, 0)];

    let mut buf: Vec<u8> = Vec::new();
    write_local_trees(&mut buf, &trees, &names(), &grid.times, true, &invis_pos, &invis)?;

    let (_, _, invisible) = read_local_trees(buf.as_slice(), &grid)?;
    assert_eq!(invisible.len(), 1);
    let (pos, spr) = invisible[0];
    assert_eq!(pos, 10);
    assert_eq!((spr.recomb_node, spr.recomb_time, spr.coal_node, spr.coal_time), (2, 0, 2, 2));
    Ok(())
  }

  #[rstest]
  fn rejects_malformed_records() {
    let grid = grid();
    let bad = "REGION\tchr\t1\n";
    assert!(read_local_trees(bad.as_bytes(), &grid).is_err());
    let bad = "FROB\t1\t2\n";
    assert!(read_local_trees(bad.as_bytes(), &grid).is_err());
  }
}

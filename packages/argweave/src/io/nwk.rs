use crate::arg::local_tree::{assert_tree, LocalNode, LocalTree};
use crate::make_error;
use crate::model::time_grid::TimeGrid;
use eyre::Report;
use std::fmt::Write;

/// Writes one node of a local tree in extended Newick with NHX comments
/// carrying `age` (real, generations) and optionally `pop_path`
fn write_newick_node(
  out: &mut String,
  tree: &LocalTree,
  names: &[String],
  times: &[f64],
  node: i32,
  depth: usize,
  pop_model: bool,
) -> Result<(), Report> {
  if tree[node].is_leaf() {
    write!(
      out,
      "{}:{:.6}[&&NHX:age={:.6}",
      names[node as usize],
      tree.dist(node, times),
      times[tree[node].age as usize]
    )?;
    if pop_model {
      write!(out, ":pop_path={}", tree[node].pop_path)?;
    }
    write!(out, "]")?;
  } else {
    write!(out, "(")?;
    write_newick_node(out, tree, names, times, tree[node].child[0], depth + 1, pop_model)?;
    write!(out, ",")?;
    write_newick_node(out, tree, names, times, tree[node].child[1], depth + 1, pop_model)?;
    write!(out, ")")?;

    if depth > 0 {
      write!(
        out,
        "{}:{:.6}[&&NHX:age={:.6}",
        names[node as usize],
        tree.dist(node, times),
        times[tree[node].age as usize]
      )?;
    } else {
      write!(out, "{}[&&NHX:age={:.6}", names[node as usize], times[tree[node].age as usize])?;
    }
    if pop_model {
      write!(out, ":pop_path={}", tree[node].pop_path)?;
    }
    write!(out, "]")?;
  }
  Ok(())
}

/// One-line extended Newick for a local tree
pub fn write_newick_tree(tree: &LocalTree, names: &[String], times: &[f64], pop_model: bool) -> Result<String, Report> {
  let mut out = String::new();
  write_newick_node(&mut out, tree, names, times, tree.root, 0, pop_model)?;
  out.push(';');
  Ok(out)
}

/// Iterates `key=value` pairs of an NHX comment body like
/// `&&NHX:age=20:pop_path=1`
fn parse_nhx(comment: &str) -> Option<Vec<(&str, &str)>> {
  let body = comment.strip_prefix("&&NHX:")?;
  Some(
    body
      .split(':')
      .filter_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        Some((k, v))
      })
      .collect(),
  )
}

/// Parses a local tree from a one-line extended Newick string.
///
/// Node names must be integers (the stable node ids used by the local-trees
/// format); real ages in NHX comments snap to the nearest grid point.
pub fn parse_local_tree(newick: &str, grid: &TimeGrid) -> Result<LocalTree, Report> {
  let bytes = newick.as_bytes();
  let len = bytes.len();

  // parse into per-token parent pointers, names, ages, and paths
  let mut ptree: Vec<i32> = vec![-1];
  let mut ages: Vec<i32> = vec![-1];
  let mut names: Vec<i32> = vec![-1];
  let mut pop_paths: Vec<i32> = vec![0];
  let mut stack: Vec<i32> = Vec::new();
  let mut node: i32 = 0;

  let mut i = 0;
  while i < len {
    match bytes[i] {
      b'(' => {
        ptree.push(node);
        ages.push(-1);
        names.push(-1);
        pop_paths.push(0);
        stack.push(node);
        node = ptree.len() as i32 - 1;
      }
      b',' => {
        let parent = *stack
          .last()
          .ok_or_else(|| crate::make_report!("bad newick: unbalanced parentheses"))?;
        ptree.push(parent);
        ages.push(-1);
        names.push(-1);
        pop_paths.push(0);
        node = ptree.len() as i32 - 1;
      }
      b')' => {
        node = stack
          .pop()
          .ok_or_else(|| crate::make_report!("bad newick: unbalanced parentheses"))?;
      }
      b'[' => {
        let Some(close) = newick[i..].find(']') else {
          return make_error!("bad newick: malformed NHX comment");
        };
        let comment = &newick[i + 1..i + close];
        if let Some(pairs) = parse_nhx(comment) {
          for (k, v) in pairs {
            match k {
              "age" => {
                let age: f64 = v
                  .parse()
                  .map_err(|_| crate::make_report!("bad newick: invalid age '{v}'"))?;
                ages[node as usize] = grid.nearest(age);
              }
              "pop_path" => {
                pop_paths[node as usize] = v
                  .parse()
                  .map_err(|_| crate::make_report!("bad newick: invalid pop_path '{v}'"))?;
              }
              _ => {}
            }
          }
        }
        i += close;
      }
      b':' | b';' | b' ' => {}
      _ => {
        let last = if i > 0 { bytes[i - 1] } else { b'(' };
        let mut j = i;
        while j < len && !b")(,:;[".contains(&bytes[j]) {
          j += 1;
        }
        if matches!(last, b')' | b'(' | b',') {
          let name: i32 = newick[i..j]
            .trim()
            .parse()
            .map_err(|_| crate::make_report!("bad newick: node name is not an integer"))?;
          names[node as usize] = name;
        }
        // distances after ':' are redundant with ages and ignored
        i = j - 1;
      }
    }
    i += 1;
  }

  if !stack.is_empty() {
    return make_error!("bad newick: unbalanced parentheses");
  }

  // fill the tree, relabeling tokens by their declared integer names
  let nnodes = ptree.len();
  let mut tree = LocalTree::new(nnodes);
  for n in &mut tree.nodes {
    *n = LocalNode::new(-1, [-1, -1], -1, 0);
  }

  for i in 0..nnodes {
    let j = names[i];
    if j < 0 || j as usize >= nnodes {
      return make_error!("bad newick: node name {j} out of range");
    }
    if ptree[i] != -1 {
      tree[j].parent = names[ptree[i] as usize];
    } else {
      tree[j].parent = -1;
      tree.root = j;
    }
    tree[j].age = ages[i];
    tree[j].pop_path = pop_paths[i];
  }

  for i in 0..nnodes {
    if ptree[i] != -1 {
      let parent = names[ptree[i] as usize];
      let child = names[i];
      if tree.add_child(parent, child).is_none() {
        return make_error!("local tree is not binary");
      }
    }
  }

  // leaves default to age 0
  for node in &mut tree.nodes {
    if node.is_leaf() && node.age == -1 {
      node.age = 0;
    }
  }

  assert_tree(&tree, None);
  Ok(tree)
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  fn grid() -> TimeGrid {
    TimeGrid::new(vec![0.0, 50.0, 100.0, 200.0, 500.0]).unwrap()
  }

  fn three_leaf_tree() -> LocalTree {
    LocalTree::from_parents(&[3, 3, 4, 4, -1], Some(&[0, 0, 0, 1, 3]), None)
  }

  #[rstest]
  fn newick_round_trip() -> Result<(), Report> {
    let grid = grid();
    let tree = three_leaf_tree();
    let names: Vec<String> = (0..5).map(|i| i.to_string()).collect();

    let nwk = write_newick_tree(&tree, &names, &grid.times, false)?;
    let parsed = parse_local_tree(&nwk, &grid)?;

    assert_eq!(parsed.nnodes(), tree.nnodes());
    assert_eq!(parsed.root, tree.root);
    for i in 0..5 {
      assert_eq!(parsed[i].parent, tree[i].parent, "parent of node {i}");
      assert_eq!(parsed[i].age, tree[i].age, "age of node {i}");
    }
    Ok(())
  }

  #[rstest]
  fn newick_round_trip_with_pop_paths() -> Result<(), Report> {
    let grid = grid();
    let mut tree = three_leaf_tree();
    tree[1].pop_path = 2;
    let names: Vec<String> = (0..5).map(|i| i.to_string()).collect();

    let nwk = write_newick_tree(&tree, &names, &grid.times, true)?;
    let parsed = parse_local_tree(&nwk, &grid)?;
    assert_eq!(parsed[1].pop_path, 2);
    assert_eq!(parsed[0].pop_path, 0);
    Ok(())
  }

  #[rstest]
  fn ages_snap_to_grid() -> Result<(), Report> {
    let grid = grid();
    let nwk = "(0:55.0[&&NHX:age=0.0],1:55.0[&&NHX:age=0.0])2[&&NHX:age=55.0];";
    let tree = parse_local_tree(nwk, &grid)?;
    assert_eq!(tree[2].age, 1);
    Ok(())
  }

  #[rstest]
  fn rejects_malformed_newick() {
    let grid = grid();
    assert!(parse_local_tree("((0,1)3;", &grid).is_err());
    assert!(parse_local_tree("(a,b)c;", &grid).is_err());
  }
}

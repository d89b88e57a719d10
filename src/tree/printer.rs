//! Human-readable rendering of tile trees.

use crate::schedule::SolvedTree;
use crate::tree::node::{NodeId, NodeKind, TileTree};
use std::fmt::Write;

/// Indented text printer for tile trees.
pub struct TreePrinter {
    indent: usize,
    buffer: String,
}

impl TreePrinter {
    pub fn new() -> Self {
        Self {
            indent: 0,
            buffer: String::new(),
        }
    }

    /// Get the output.
    pub fn output(&self) -> &str {
        &self.buffer
    }

    /// Take the output.
    pub fn take_output(self) -> String {
        self.buffer
    }

    fn write_indent(&mut self) {
        for _ in 0..self.indent {
            self.buffer.push_str("  ");
        }
    }

    /// Print the shape of a tree.
    pub fn print_tree(&mut self, tree: &TileTree) {
        self.print_node(tree, tree.root(), None);
    }

    /// Print a solved tree with tile sizes and placements.
    pub fn print_solved(&mut self, solved: &SolvedTree) {
        self.write_indent();
        let _ = writeln!(
            self.buffer,
            "objective {} ({:?}, {} vars, {} constraints, {} nodes searched)",
            solved.objective,
            solved.status,
            solved.num_vars,
            solved.num_constraints,
            solved.search_nodes
        );
        self.print_node(&solved.tree, solved.tree.root(), Some(solved));
    }

    fn print_node(&mut self, tree: &TileTree, id: NodeId, solved: Option<&SolvedTree>) {
        self.write_indent();
        match tree.kind(id) {
            NodeKind::Scope => {
                let _ = writeln!(self.buffer, "Scope {}", id);
            }
            NodeKind::Tile(t) => {
                let _ = write!(self.buffer, "Tile {} L{} op{} {}", id, t.level, t.op, t.relation);
                self.print_sizes(id, solved);
            }
            NodeKind::Op(o) => {
                let _ = write!(self.buffer, "Op {} op{} {} {:?}", id, o.op, o.relation, o.bounds);
                self.print_sizes(id, solved);
            }
        }

        if let Some(solved) = solved {
            let placements: Vec<_> = solved.placements.iter().filter(|p| p.node == id).collect();
            if !placements.is_empty() {
                self.indent += 2;
                for p in placements {
                    self.write_indent();
                    let _ = writeln!(
                        self.buffer,
                        "{} @L{} loop {} {}B moved {}B {}{}",
                        p.buffer,
                        p.level,
                        p.create_loop,
                        p.size_bytes,
                        p.write_bytes,
                        p.lifetime,
                        if p.flags.aliased { " aliased" } else { "" }
                    );
                }
                self.indent -= 2;
            }
        }

        self.indent += 1;
        for &child in tree.children(id) {
            self.print_node(tree, child, solved);
        }
        self.indent -= 1;
    }

    fn print_sizes(&mut self, id: NodeId, solved: Option<&SolvedTree>) {
        match solved.and_then(|s| s.node_sizes(id)) {
            Some(sizes) => {
                let _ = writeln!(self.buffer, " tiles {:?} extents {:?}", sizes.tile_vars, sizes.extents);
            }
            None => self.buffer.push('\n'),
        }
    }
}

impl Default for TreePrinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a tree shape to a string.
pub fn tree_to_string(tree: &TileTree) -> String {
    let mut printer = TreePrinter::new();
    printer.print_tree(tree);
    printer.take_output()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::AffineMap;
    use crate::graph::OpId;
    use crate::tree::node::{OpLeaf, TileNode};

    #[test]
    fn test_print_nesting() {
        let mut tree = TileTree::new(NodeKind::Scope);
        let tile = tree.add_child(
            tree.root(),
            NodeKind::Tile(TileNode {
                level: 1,
                op: OpId(4),
                relation: AffineMap::identity(1),
                bounds: vec![8],
            }),
        );
        tree.add_child(
            tile,
            NodeKind::Op(OpLeaf {
                op: OpId(4),
                relation: AffineMap::identity(1),
                bounds: vec![8],
            }),
        );
        let text = tree_to_string(&tree);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Scope n0"));
        assert!(lines[1].starts_with("  Tile n1 L1 op4"));
        assert!(lines[2].starts_with("    Op n2 op4 (d0) -> (d0@t0) [8]"));
    }
}

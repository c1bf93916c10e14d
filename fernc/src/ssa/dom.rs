//! Dominator computation for the lowering walk.
//!
//! The instruction lowerer visits blocks in dominator-tree pre-order so that
//! definitions are lowered before their (non-φ) uses. Immediate dominators
//! are computed with the iterative Cooper–Harvey–Kennedy algorithm over a
//! reverse postorder.

use super::program::{BlockId, Function};

/// Blocks of `func` in dominator-tree pre-order, starting at the entry.
/// Unreachable blocks are appended afterwards in index order so every block
/// still gets lowered.
pub fn dom_preorder(func: &Function) -> Vec<BlockId> {
    if func.blocks.is_empty() {
        return Vec::new();
    }
    let idom = immediate_dominators(func);
    let n = func.blocks.len();

    // Children lists of the dominator tree, kept in block-index order so the
    // walk is deterministic.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (b, dom) in idom.iter().enumerate() {
        match dom {
            Some(d) if b != 0 => children[*d].push(b),
            _ => {}
        }
    }

    let mut order = Vec::with_capacity(n);
    let mut stack = vec![0usize];
    while let Some(b) = stack.pop() {
        order.push(BlockId(b as u32));
        // Reverse so the lowest-numbered child is visited first.
        for &c in children[b].iter().rev() {
            stack.push(c);
        }
    }
    for b in 0..n {
        if idom[b].is_none() && b != 0 {
            order.push(BlockId(b as u32));
        }
    }
    order
}

/// Immediate dominators per block; `None` for the entry and for unreachable
/// blocks.
fn immediate_dominators(func: &Function) -> Vec<Option<usize>> {
    let n = func.blocks.len();
    let rpo = reverse_postorder(func);
    let mut rpo_number = vec![usize::MAX; n];
    for (i, &b) in rpo.iter().enumerate() {
        rpo_number[b] = i;
    }

    let mut idom: Vec<Option<usize>> = vec![None; n];
    idom[0] = Some(0);

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<usize> = None;
            for pred in &func.blocks[b].preds {
                let p = pred.index();
                if idom[p].is_none() {
                    continue; // not yet processed or unreachable
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, &rpo_number, p, cur),
                });
            }
            if let Some(ni) = new_idom {
                if idom[b] != Some(ni) {
                    idom[b] = Some(ni);
                    changed = true;
                }
            }
        }
    }

    idom[0] = None;
    idom
}

fn intersect(idom: &[Option<usize>], rpo_number: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while rpo_number[a] > rpo_number[b] {
            a = idom[a].expect("processed block must have an idom");
        }
        while rpo_number[b] > rpo_number[a] {
            b = idom[b].expect("processed block must have an idom");
        }
    }
    a
}

fn reverse_postorder(func: &Function) -> Vec<usize> {
    let n = func.blocks.len();
    let mut visited = vec![false; n];
    let mut post = Vec::with_capacity(n);
    // Iterative DFS keeping an explicit successor cursor per frame.
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
    visited[0] = true;
    while let Some((b, cursor)) = stack.pop() {
        if let Some(succ) = func.blocks[b].succs.get(cursor) {
            let s = succ.index();
            stack.push((b, cursor + 1));
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            post.push(b);
        }
    }
    post.reverse();
    post
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::program::{Function, Instr};
    use crate::ssa::types::Signature;

    fn sig() -> Signature {
        Signature { recv: None, params: vec![], results: vec![], needs_context: false }
    }

    #[test]
    fn straight_line() {
        let mut f = Function::new("f", "t.f", sig());
        let b0 = f.new_block("entry");
        let b1 = f.new_block("next");
        f.push_instr(b0, Instr::Jump, None);
        f.push_instr(b1, Instr::Return { results: vec![] }, None);
        f.add_edge(b0, b1);
        assert_eq!(dom_preorder(&f), vec![b0, b1]);
    }

    #[test]
    fn diamond_visits_head_before_join() {
        let mut f = Function::new("f", "t.f", sig());
        let b0 = f.new_block("entry");
        let b1 = f.new_block("then");
        let b2 = f.new_block("else");
        let b3 = f.new_block("join");
        f.add_edge(b0, b1);
        f.add_edge(b0, b2);
        f.add_edge(b1, b3);
        f.add_edge(b2, b3);
        let order = dom_preorder(&f);
        assert_eq!(order[0], b0);
        let pos = |b: crate::ssa::BlockId| order.iter().position(|&x| x == b).unwrap();
        // The join is dominated only by the head, so it must come after it,
        // and after neither arm in particular.
        assert!(pos(b3) > pos(b0));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn loop_back_edge() {
        let mut f = Function::new("f", "t.f", sig());
        let b0 = f.new_block("entry");
        let b1 = f.new_block("loop");
        let b2 = f.new_block("exit");
        f.add_edge(b0, b1);
        f.add_edge(b1, b1);
        f.add_edge(b1, b2);
        let order = dom_preorder(&f);
        assert_eq!(order, vec![b0, b1, b2]);
    }
}

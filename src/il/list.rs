//! Arena-backed instruction list with stable handles.
//!
//! Insertions never invalidate an [`InstrId`]: branch operands, handler extents and
//! weave-time anchors all refer to nodes, not offsets. Nodes can be allocated detached
//! and linked later, which is how forward branch targets are created before the code
//! that precedes them has been emitted.

use super::instruction::Instruction;
use std::fmt;

/// Stable handle to an instruction node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Node {
    instr: Instruction,
    prev: Option<InstrId>,
    next: Option<InstrId>,
    linked: bool,
}

/// Doubly linked instruction sequence.
#[derive(Debug, Clone, Default)]
pub struct InstrList {
    nodes: Vec<Node>,
    head: Option<InstrId>,
    tail: Option<InstrId>,
    len: usize,
}

impl InstrList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instructions(instrs: impl IntoIterator<Item = Instruction>) -> Self {
        let mut list = Self::new();
        for instr in instrs {
            list.push(instr);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocate a node without placing it in the sequence.
    pub fn alloc(&mut self, instr: Instruction) -> InstrId {
        let id = InstrId(self.nodes.len() as u32);
        self.nodes.push(Node { instr, prev: None, next: None, linked: false });
        id
    }

    pub fn push(&mut self, instr: Instruction) -> InstrId {
        let id = self.alloc(instr);
        self.link_back(id);
        id
    }

    pub fn is_linked(&self, id: InstrId) -> bool {
        self.nodes.get(id.index()).map(|n| n.linked).unwrap_or(false)
    }

    pub fn get(&self, id: InstrId) -> &Instruction {
        &self.nodes[id.index()].instr
    }

    pub fn get_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.nodes[id.index()].instr
    }

    /// Replace the instruction held by a node, keeping its identity.
    pub fn replace(&mut self, id: InstrId, instr: Instruction) -> Instruction {
        std::mem::replace(&mut self.nodes[id.index()].instr, instr)
    }

    pub fn first(&self) -> Option<InstrId> {
        self.head
    }

    pub fn last(&self) -> Option<InstrId> {
        self.tail
    }

    pub fn next(&self, id: InstrId) -> Option<InstrId> {
        self.nodes[id.index()].next
    }

    pub fn prev(&self, id: InstrId) -> Option<InstrId> {
        self.nodes[id.index()].prev
    }

    pub fn link_back(&mut self, id: InstrId) {
        self.unlink(id);
        let node = &mut self.nodes[id.index()];
        node.prev = self.tail;
        node.next = None;
        node.linked = true;
        match self.tail {
            Some(tail) => self.nodes[tail.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn link_before(&mut self, anchor: InstrId, id: InstrId) {
        self.unlink(id);
        let prev = self.nodes[anchor.index()].prev;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = prev;
            node.next = Some(anchor);
            node.linked = true;
        }
        self.nodes[anchor.index()].prev = Some(id);
        match prev {
            Some(p) => self.nodes[p.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;
    }

    pub fn link_after(&mut self, anchor: InstrId, id: InstrId) {
        self.unlink(id);
        let next = self.nodes[anchor.index()].next;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = Some(anchor);
            node.next = next;
            node.linked = true;
        }
        self.nodes[anchor.index()].next = Some(id);
        match next {
            Some(n) => self.nodes[n.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    pub fn insert_before(&mut self, anchor: InstrId, instr: Instruction) -> InstrId {
        let id = self.alloc(instr);
        self.link_before(anchor, id);
        id
    }

    pub fn insert_after(&mut self, anchor: InstrId, instr: Instruction) -> InstrId {
        let id = self.alloc(instr);
        self.link_after(anchor, id);
        id
    }

    /// Link a run of nodes, in order, immediately before `anchor`.
    pub fn link_seq_before(&mut self, anchor: InstrId, ids: &[InstrId]) {
        for id in ids {
            self.link_before(anchor, *id);
        }
    }

    /// Link a run of nodes, in order, immediately after `anchor`.
    pub fn link_seq_after(&mut self, anchor: InstrId, ids: &[InstrId]) {
        let mut cursor = anchor;
        for id in ids {
            self.link_after(cursor, *id);
            cursor = *id;
        }
    }

    /// Link a run of nodes at the start of the sequence.
    pub fn link_seq_front(&mut self, ids: &[InstrId]) {
        match self.head {
            Some(head) => self.link_seq_before(head, ids),
            None => {
                for id in ids {
                    self.link_back(*id);
                }
            }
        }
    }

    /// Detach a node; its handle stays valid and may be relinked.
    pub fn unlink(&mut self, id: InstrId) {
        let (prev, next, linked) = {
            let node = &self.nodes[id.index()];
            (node.prev, node.next, node.linked)
        };
        if !linked {
            return;
        }
        match prev {
            Some(p) => self.nodes[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.index()].prev = prev,
            None => self.tail = prev,
        }
        let node = &mut self.nodes[id.index()];
        node.prev = None;
        node.next = None;
        node.linked = false;
        self.len -= 1;
    }

    /// Detach every node.
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            node.prev = None;
            node.next = None;
            node.linked = false;
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cursor: self.head }
    }

    pub fn ids(&self) -> Vec<InstrId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Ordinal position of a linked node.
    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.iter().position(|(candidate, _)| candidate == id)
    }

    /// Walk `steps` nodes backwards from `id`.
    pub fn step_back(&self, id: InstrId, steps: usize) -> Option<InstrId> {
        let mut cursor = id;
        for _ in 0..steps {
            cursor = self.prev(cursor)?;
        }
        Some(cursor)
    }
}

pub struct Iter<'a> {
    list: &'a InstrList,
    cursor: Option<InstrId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InstrId, &'a Instruction);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        self.cursor = self.list.next(id);
        Some((id, self.list.get(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::opcodes::Op;

    fn ops(list: &InstrList) -> Vec<Op> {
        list.iter().map(|(_, i)| i.op).collect()
    }

    #[test]
    fn test_insertions_keep_handles_stable() {
        let mut list = InstrList::new();
        let a = list.push(Instruction::new(Op::Ldarg0));
        let ret = list.push(Instruction::new(Op::Ret));
        let mid = list.insert_before(ret, Instruction::new(Op::Pop));
        list.insert_after(a, Instruction::new(Op::Dup));

        assert_eq!(ops(&list), vec![Op::Ldarg0, Op::Dup, Op::Pop, Op::Ret]);
        assert_eq!(list.get(mid).op, Op::Pop);
        assert_eq!(list.position_of(ret), Some(3));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_detached_nodes_link_later() {
        let mut list = InstrList::new();
        let end = list.alloc(Instruction::new(Op::Ret));
        let jump = list.push(Instruction::branch(Op::Br, end));
        list.push(Instruction::new(Op::Nop));
        assert!(!list.is_linked(end));
        list.link_back(end);
        assert_eq!(list.get(jump).branch_target(), Some(end));
        assert_eq!(list.last(), Some(end));
    }

    #[test]
    fn test_sequence_front_and_after() {
        let mut list = InstrList::from_instructions(vec![Instruction::new(Op::Ret)]);
        let x = list.alloc(Instruction::new(Op::Nop));
        let y = list.alloc(Instruction::new(Op::Dup));
        list.link_seq_front(&[x, y]);
        assert_eq!(ops(&list), vec![Op::Nop, Op::Dup, Op::Ret]);

        let p = list.alloc(Instruction::new(Op::Pop));
        let q = list.alloc(Instruction::new(Op::Ldnull));
        list.link_seq_after(x, &[p, q]);
        assert_eq!(ops(&list), vec![Op::Nop, Op::Pop, Op::Ldnull, Op::Dup, Op::Ret]);
        assert_eq!(list.step_back(y, 2), Some(p));
    }

    #[test]
    fn test_unlink_and_clear() {
        let mut list = InstrList::new();
        let a = list.push(Instruction::new(Op::Nop));
        let b = list.push(Instruction::new(Op::Ret));
        list.unlink(a);
        assert_eq!(list.first(), Some(b));
        assert_eq!(list.len(), 1);
        list.unlink(a);
        assert_eq!(list.len(), 1);
        list.clear();
        assert!(list.is_empty());
        assert!(list.first().is_none());
    }
}

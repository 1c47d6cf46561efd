use super::{Error, ExceptionRegion, InsnId, Instruction, Operand, Type};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    /// Allocated but not linked into the instruction list yet
    Detached,
    Live,
    Removed,
}

#[derive(Clone, Debug, PartialEq)]
struct Slot {
    insn: Instruction,
    prev: Option<InsnId>,
    next: Option<InsnId>,
    state: SlotState,
}

/// Typed local variable slot
#[derive(Clone, Debug, PartialEq)]
pub struct Local {
    pub ty: Type,
    pub name: Option<String>,
}

/// Instructions, locals, and exception regions of a method
///
/// Instructions live in an arena and are linked into a doubly-linked list. An [`InsnId`] is an
/// index into the arena, so it stays valid (and keeps pointing at the same instruction) no matter
/// what gets inserted or removed around it. Cloning a body clones the arena, so every handle into
/// the original refers to the corresponding instruction of the clone.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    slots: Vec<Slot>,
    head: Option<InsnId>,
    tail: Option<InsnId>,
    len: usize,

    pub locals: Vec<Local>,

    /// Exception regions, innermost first
    pub regions: Vec<ExceptionRegion>,

    pub has_return_value: bool,

    /// Source line of the instructions that start a statement
    pub sequence_points: BTreeMap<InsnId, u32>,
}

/// Span of an exception region in terms of instruction positions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionSpan {
    pub try_range: Range<usize>,
    pub handler_range: Range<usize>,
}

impl MethodBody {
    pub fn new(has_return_value: bool) -> MethodBody {
        MethodBody {
            slots: vec![],
            head: None,
            tail: None,
            len: 0,
            locals: vec![],
            regions: vec![],
            has_return_value,
            sequence_points: BTreeMap::new(),
        }
    }

    /// Add a local variable, returning its slot
    pub fn add_local(&mut self, ty: Type, name: Option<&str>) -> u16 {
        self.locals.push(Local {
            ty,
            name: name.map(str::to_owned),
        });
        (self.locals.len() - 1) as u16
    }

    pub fn local_named(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .position(|local| local.name.as_deref() == Some(name))
            .map(|idx| idx as u16)
    }

    /// Number of live instructions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<InsnId> {
        self.head
    }

    pub fn last(&self) -> Option<InsnId> {
        self.tail
    }

    pub fn next(&self, id: InsnId) -> Option<InsnId> {
        self.slots[id.index()].next
    }

    pub fn prev(&self, id: InsnId) -> Option<InsnId> {
        self.slots[id.index()].prev
    }

    /// Is the instruction currently part of the instruction list?
    pub fn is_live(&self, id: InsnId) -> bool {
        self.slots
            .get(id.index())
            .map_or(false, |slot| slot.state == SlotState::Live)
    }

    pub fn get(&self, id: InsnId) -> &Instruction {
        &self.slots[id.index()].insn
    }

    pub fn get_mut(&mut self, id: InsnId) -> &mut Instruction {
        &mut self.slots[id.index()].insn
    }

    /// Live instructions, in order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            body: self,
            cursor: self.head,
        }
    }

    pub fn ids(&self) -> Vec<InsnId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Position of every live instruction in the list
    pub fn positions(&self) -> HashMap<InsnId, usize> {
        self.iter()
            .enumerate()
            .map(|(pos, (id, _))| (id, pos))
            .collect()
    }

    /// Allocate an instruction without linking it anywhere
    pub(crate) fn allocate(&mut self, insn: Instruction) -> InsnId {
        let id = InsnId(self.slots.len() as u32);
        self.slots.push(Slot {
            insn,
            prev: None,
            next: None,
            state: SlotState::Detached,
        });
        id
    }

    pub(crate) fn is_detached(&self, id: InsnId) -> bool {
        self.slots[id.index()].state == SlotState::Detached
    }

    /// Link a detached instruction in between `prev` and `next`
    fn link(&mut self, id: InsnId, prev: Option<InsnId>, next: Option<InsnId>) {
        debug_assert!(self.is_detached(id));
        let slot = &mut self.slots[id.index()];
        slot.prev = prev;
        slot.next = next;
        slot.state = SlotState::Live;
        match prev {
            Some(prev) => self.slots[prev.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => self.slots[next.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    pub(crate) fn link_before(&mut self, id: InsnId, anchor: InsnId) {
        let prev = self.prev(anchor);
        self.link(id, prev, Some(anchor));
    }

    pub(crate) fn link_after(&mut self, id: InsnId, anchor: InsnId) {
        let next = self.next(anchor);
        self.link(id, Some(anchor), next);
    }

    pub(crate) fn link_back(&mut self, id: InsnId) {
        let tail = self.tail;
        self.link(id, tail, None);
    }

    pub(crate) fn unlink(&mut self, id: InsnId) {
        let (prev, next) = (self.prev(id), self.next(id));
        match prev {
            Some(prev) => self.slots[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next.index()].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[id.index()];
        slot.prev = None;
        slot.next = None;
        slot.state = SlotState::Removed;
        self.len -= 1;
        self.sequence_points.remove(&id);
    }

    /// Resolve exception regions into position ranges
    pub fn region_spans(
        &self,
        positions: &HashMap<InsnId, usize>,
    ) -> Result<Vec<RegionSpan>, Error> {
        self.regions
            .iter()
            .enumerate()
            .map(|(region, r)| {
                let resolve = |id: InsnId| {
                    positions
                        .get(&id)
                        .copied()
                        .ok_or(Error::UnresolvedRegion { region })
                };
                let handler_end = match r.handler_end {
                    Some(end) => resolve(end)?,
                    None => self.len,
                };
                let span = RegionSpan {
                    try_range: resolve(r.try_start)?..resolve(r.try_end)?,
                    handler_range: resolve(r.handler_start)?..handler_end,
                };
                if span.try_range.is_empty()
                    || span.handler_range.is_empty()
                    || span.try_range.end > span.handler_range.start
                {
                    return Err(Error::UnresolvedRegion { region });
                }
                Ok(span)
            })
            .collect()
    }

    /// Check the structural invariants the weaver relies on
    ///
    /// Every branch must target a live instruction of this body (and no placeholder may still be
    /// pending), every region boundary must resolve, regions may nest but not partially overlap,
    /// and inner regions must be listed before the regions enclosing them.
    pub fn validate(&self) -> Result<(), Error> {
        let positions = self.positions();
        for (id, insn) in self.iter() {
            if insn.operand == Operand::Pending {
                return Err(Error::PendingBranch(id));
            }
            for target in insn.targets() {
                if !positions.contains_key(&target) {
                    return Err(Error::DanglingTarget { branch: id, target });
                }
            }
        }

        let spans = self.region_spans(&positions)?;
        for (outer, a) in spans.iter().enumerate() {
            for (inner, b) in spans.iter().enumerate().skip(outer + 1) {
                for x in [&a.try_range, &a.handler_range] {
                    for y in [&b.try_range, &b.handler_range] {
                        if !disjoint(x, y) && !contains(x, y) && !contains(y, x) {
                            return Err(Error::OverlappingRegions {
                                first: outer,
                                second: inner,
                            });
                        }
                    }
                }

                // `b` is listed after `a`, so it must not be nested inside `a`
                let same_try = a.try_range == b.try_range;
                let misordered = if same_try {
                    self.regions[outer].is_finally() && !self.regions[inner].is_finally()
                } else {
                    contains(&a.try_range, &b.try_range)
                        || contains(&a.handler_range, &b.try_range)
                };
                if misordered {
                    return Err(Error::MisorderedRegions { outer, inner });
                }
            }
        }

        Ok(())
    }
}

fn disjoint(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.end <= b.start || b.end <= a.start
}

/// Is `inner` within `outer`?
fn contains(outer: &Range<usize>, inner: &Range<usize>) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

/// Iterator over the live instructions of a body
pub struct Iter<'a> {
    body: &'a MethodBody,
    cursor: Option<InsnId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InsnId, &'a Instruction);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        self.cursor = self.body.next(id);
        Some((id, self.body.get(id)))
    }
}

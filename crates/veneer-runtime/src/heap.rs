//! Allocation arena and cycle collector
//!
//! Every native-memory region the engine owns lives in one `Heap`: a slot
//! arena of allocations with stable byte buffers. Alongside the bytes each
//! allocation carries its runtime type tag (written once, at allocation),
//! a root count contributed by live proxies, and a pointer side table
//! (`out_refs`) recording which offsets hold addresses of other heap
//! allocations. The side table is what makes reference cycles through raw
//! pointer fields collectable: mark from every rooted allocation through
//! `out_refs`, then sweep.
//!
//! Raw addresses read back out of native memory resolve to allocations
//! through an address index ordered by base address, so interior pointers
//! land on the right allocation with the right offset.
//!
//! Sweeping drops allocations after the arena borrow is released. A swept
//! closure allocation tears down its trampoline, and the trampoline's host
//! callable may itself own proxies whose `Drop` re-enters the heap.

use crate::closure::ClosureTrampoline;
use crate::error::FfiError;
use crate::types::TypeDesc;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Automatic collection runs once per this many allocations.
const GC_INTERVAL: usize = 1024;

/// Index of an allocation slot in its heap.
pub type AllocId = usize;

/// Bytes staged for an atomic write, plus the pointer-table entries that
/// must land with them. `refs` offsets are relative to the staged region.
#[derive(Debug, Default)]
pub struct Staged {
    pub bytes: Vec<u8>,
    pub refs: Vec<(usize, AllocId)>,
}

impl Staged {
    pub fn zeroed(len: usize) -> Self {
        Staged {
            bytes: vec![0; len],
            refs: Vec::new(),
        }
    }
}

struct Allocation {
    bytes: Box<[u8]>,
    addr: usize,
    len: usize,
    tag: Rc<TypeDesc>,
    roots: usize,
    out_refs: BTreeMap<usize, AllocId>,
    trampoline: Option<ClosureTrampoline>,
    mark: bool,
}

#[derive(Default)]
struct HeapInner {
    slots: Vec<Option<Allocation>>,
    free: Vec<AllocId>,
    addr_index: BTreeMap<usize, AllocId>,
    since_gc: usize,
}

impl HeapInner {
    fn alloc(&mut self) -> AllocId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    fn get(&self, id: AllocId) -> &Allocation {
        self.slots[id].as_ref().unwrap_or_else(|| {
            unreachable!("allocation {id} already swept while referenced")
        })
    }

    fn get_mut(&mut self, id: AllocId) -> &mut Allocation {
        self.slots[id].as_mut().unwrap_or_else(|| {
            unreachable!("allocation {id} already swept while referenced")
        })
    }
}

/// Shared handle to one allocation arena. Cloning shares the arena.
#[derive(Clone, Default)]
pub struct Heap {
    inner: Rc<RefCell<HeapInner>>,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    /// Allocate zeroed storage tagged with `tag`. The tag records the
    /// most-derived type of the allocation and never changes.
    pub fn allocate(&self, tag: &Rc<TypeDesc>, size: usize) -> AllocId {
        self.maybe_collect();
        let mut inner = self.inner.borrow_mut();
        let bytes = vec![0u8; size.max(1)].into_boxed_slice();
        let addr = bytes.as_ptr() as usize;
        let id = inner.alloc();
        inner.slots[id] = Some(Allocation {
            bytes,
            addr,
            len: size,
            tag: tag.clone(),
            roots: 0,
            out_refs: BTreeMap::new(),
            trampoline: None,
            mark: false,
        });
        inner.addr_index.insert(addr, id);
        inner.since_gc += 1;
        id
    }

    /// Allocate a slot owning a closure trampoline. The allocation has no
    /// byte storage; its address is the trampoline's native entry point,
    /// which is what pointer stores of the closure record.
    pub(crate) fn allocate_closure(
        &self,
        tag: &Rc<TypeDesc>,
        trampoline: ClosureTrampoline,
    ) -> AllocId {
        self.maybe_collect();
        let mut inner = self.inner.borrow_mut();
        let addr = trampoline.code();
        let id = inner.alloc();
        inner.slots[id] = Some(Allocation {
            bytes: Box::new([]),
            addr,
            len: 0,
            tag: tag.clone(),
            roots: 0,
            out_refs: BTreeMap::new(),
            trampoline: Some(trampoline),
            mark: false,
        });
        inner.addr_index.insert(addr, id);
        inner.since_gc += 1;
        id
    }

    pub(crate) fn root(&self, id: AllocId) {
        self.inner.borrow_mut().get_mut(id).roots += 1;
    }

    pub(crate) fn unroot(&self, id: AllocId) {
        let mut inner = self.inner.borrow_mut();
        let alloc = inner.get_mut(id);
        debug_assert!(alloc.roots > 0);
        alloc.roots -= 1;
    }

    /// Base address of `id` plus `offset`.
    pub(crate) fn addr_of(&self, id: AllocId, offset: usize) -> usize {
        self.inner.borrow().get(id).addr + offset
    }

    /// Runtime type tag of `id`.
    pub(crate) fn tag(&self, id: AllocId) -> Rc<TypeDesc> {
        self.inner.borrow().get(id).tag.clone()
    }

    pub(crate) fn len_of(&self, id: AllocId) -> usize {
        self.inner.borrow().get(id).len
    }

    /// Resolve a raw address to the allocation containing it, returning the
    /// slot and the offset within it. Addresses the heap never handed out
    /// resolve to `None`.
    pub(crate) fn find_alloc(&self, addr: usize) -> Option<(AllocId, usize)> {
        let inner = self.inner.borrow();
        let (&base, &id) = inner.addr_index.range(..=addr).next_back()?;
        let alloc = inner.get(id);
        // A zero-length allocation (closure slot) is addressable only at
        // its exact entry point.
        if addr < base + alloc.len.max(1) {
            Some((id, addr - base))
        } else {
            None
        }
    }

    /// Copy `len` bytes out of an allocation.
    pub(crate) fn read(&self, id: AllocId, offset: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.borrow();
        inner.get(id).bytes[offset..offset + len].to_vec()
    }

    /// Snapshot a byte range together with the pointer-table entries inside
    /// it, rebased to the range start. This is how proxy-to-proxy value
    /// copies carry their reference edges along with their bytes.
    pub(crate) fn snapshot(&self, id: AllocId, offset: usize, len: usize) -> Staged {
        let inner = self.inner.borrow();
        let alloc = inner.get(id);
        Staged {
            bytes: alloc.bytes[offset..offset + len].to_vec(),
            refs: alloc
                .out_refs
                .range(offset..offset + len)
                .map(|(&off, &target)| (off - offset, target))
                .collect(),
        }
    }

    /// Commit a staged write: overwrite the byte range and replace every
    /// pointer-table entry inside it with the staged entries. The whole
    /// range lands or (on a caller-side staging failure) none of it does.
    pub(crate) fn commit(&self, id: AllocId, offset: usize, staged: &Staged) {
        let mut inner = self.inner.borrow_mut();
        let alloc = inner.get_mut(id);
        let end = offset + staged.bytes.len();
        alloc.bytes[offset..end].copy_from_slice(&staged.bytes);
        let stale: Vec<usize> = alloc.out_refs.range(offset..end).map(|(&o, _)| o).collect();
        for o in stale {
            alloc.out_refs.remove(&o);
        }
        for &(rel, target) in &staged.refs {
            alloc.out_refs.insert(offset + rel, target);
        }
    }

    /// Invoke the trampoline-owned callable of a closure allocation.
    pub(crate) fn call_closure(
        &self,
        id: AllocId,
        args: &[crate::value::Value],
    ) -> Result<crate::value::Value, FfiError> {
        let callable = {
            let inner = self.inner.borrow();
            match &inner.get(id).trampoline {
                Some(t) => t.callable(),
                None => {
                    return Err(FfiError::type_err(
                        "allocation is not callable".to_string(),
                    ))
                }
            }
        };
        callable(args)
    }

    /// Number of live allocations (diagnostic, used by tests).
    pub fn live_allocations(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    fn maybe_collect(&self) {
        let due = self.inner.borrow().since_gc >= GC_INTERVAL;
        if due {
            self.collect();
        }
    }

    /// Mark-and-sweep collection. Roots are allocations with live proxies;
    /// reachability follows the pointer side table. Returns the number of
    /// allocations reclaimed. Cycles with no external root are reclaimed.
    pub fn collect(&self) -> usize {
        let swept: Vec<Allocation> = {
            let mut inner = self.inner.borrow_mut();
            inner.since_gc = 0;

            let mut stack: Vec<AllocId> = Vec::new();
            for (id, slot) in inner.slots.iter_mut().enumerate() {
                if let Some(alloc) = slot {
                    alloc.mark = alloc.roots > 0;
                    if alloc.mark {
                        stack.push(id);
                    }
                }
            }
            while let Some(id) = stack.pop() {
                let targets: Vec<AllocId> =
                    inner.get(id).out_refs.values().copied().collect();
                for t in targets {
                    let target = inner.get_mut(t);
                    if !target.mark {
                        target.mark = true;
                        stack.push(t);
                    }
                }
            }

            let mut swept = Vec::new();
            for id in 0..inner.slots.len() {
                let dead = matches!(&inner.slots[id], Some(a) if !a.mark);
                if dead {
                    let alloc = inner.slots[id].take().unwrap_or_else(|| unreachable!());
                    inner.addr_index.remove(&alloc.addr);
                    inner.free.push(id);
                    swept.push(alloc);
                }
            }
            swept
        };
        // Dropped outside the borrow: trampoline callables may own proxies
        // whose Drop re-enters the arena.
        let count = swept.len();
        drop(swept);
        count
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live_allocations())
            .finish()
    }
}

//! Allocation list and byte accounting, grounded on
//! `raya-core/src/gc/heap.rs`'s `Heap`. Every allocation is pushed onto
//! the head of a singly-linked list of allocations ordered by allocation
//! time (spec §4.3); the collector later walks this list for sweep.

use crate::object::{GcHeader, Obj, ObjKind, ObjRef};
use std::cell::Cell;
use std::ptr::NonNull;

pub struct Heap {
    head: Option<NonNull<Obj>>,
    bytes_allocated: usize,
    allocation_count: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap { head: None, bytes_allocated: 0, allocation_count: 0 }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    /// Allocate `kind` onto the heap, linking it into the allocation list.
    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        let obj = Box::new(Obj {
            header: GcHeader { marked: Cell::new(false), next: Cell::new(self.head) },
            kind,
        });
        let ptr = NonNull::from(Box::leak(obj));
        self.head = Some(ptr);
        self.allocation_count += 1;
        let obj_ref = ObjRef::new(ptr);
        self.bytes_allocated += obj_ref.kind_size();
        obj_ref
    }

    /// Walk the allocation list. Used by the mark-sweep collector's sweep
    /// phase; the closure returns `true` to keep an allocation alive.
    ///
    /// # Safety
    /// Must not be called while any `ObjRef` borrowed via `kind()`/
    /// `kind_mut()` is alive across a `false` return, since that object
    /// is freed immediately.
    pub unsafe fn sweep(
        &mut self,
        mut keep: impl FnMut(ObjRef) -> bool,
        mut before_free: impl FnMut(ObjRef),
    ) -> (usize, usize) {
        let mut freed_count = 0;
        let mut freed_bytes = 0;
        let mut prev: Option<NonNull<Obj>> = None;
        let mut current = self.head;
        while let Some(ptr) = current {
            let obj_ref = ObjRef::new(ptr);
            let next = obj_ref.header().next.get();
            if keep(obj_ref) {
                prev = Some(ptr);
            } else {
                before_free(obj_ref);
                freed_bytes += obj_ref.kind_size();
                freed_count += 1;
                self.allocation_count -= 1;
                match prev {
                    Some(p) => unsafe { (*p.as_ptr()).header.next.set(next) },
                    None => self.head = next,
                }
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
            current = next;
        }
        self.bytes_allocated -= freed_bytes;
        (freed_count, freed_bytes)
    }

    pub fn iter(&self) -> HeapIter {
        HeapIter { current: self.head }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.head;
        while let Some(ptr) = current {
            let next = unsafe { (*ptr.as_ptr()).header.next.get() };
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            current = next;
        }
    }
}

pub struct HeapIter {
    current: Option<NonNull<Obj>>,
}

impl Iterator for HeapIter {
    type Item = ObjRef;

    fn next(&mut self) -> Option<ObjRef> {
        let ptr = self.current?;
        self.current = unsafe { (*ptr.as_ptr()).header.next.get() };
        Some(ObjRef::new(ptr))
    }
}

impl ObjRef {
    pub(crate) fn kind_size(&self) -> usize {
        unsafe { (*self.as_ptr()).approx_size() }
    }
}

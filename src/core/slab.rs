use std::mem::MaybeUninit;
use std::ptr::NonNull;

use aliasable::boxed::AliasableBox;

/// A recycling allocator for pool records.
///
/// `alloc` hands out a pointer with a stable address until the matching
/// `free`; freed slots are reused by later allocations. The storage is a set
/// of individually boxed slots so that records never move, and the boxes are
/// `AliasableBox` because their content is accessed through raw pointers for
/// as long as a record is live, which a plain `Box` does not allow.
///
/// The slab is not thread-safe on its own; all access is serialized by the
/// pool's task mutex.
pub(crate) struct Slab<T> {
    slots: Vec<AliasableBox<MaybeUninit<T>>>,
    free_list: Vec<NonNull<T>>,
}

// The pointers only make the slab !Send by default; the records themselves
// are Send and the slab moves between threads as part of the guarded state.
unsafe impl<T: Send> Send for Slab<T> {}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Slab {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Place `value` in a free slot and return a stable pointer to it.
    pub fn alloc(&mut self, value: T) -> NonNull<T> {
        let ptr = self.free_list.pop().unwrap_or_else(|| {
            let mut slot: AliasableBox<MaybeUninit<T>> =
                AliasableBox::from_unique(Box::new(MaybeUninit::uninit()));
            let ptr = unsafe { NonNull::new_unchecked(slot.as_mut_ptr()) };
            self.slots.push(slot);
            ptr
        });

        unsafe { ptr.as_ptr().write(value) };
        ptr
    }

    /// Drop the record and make its slot available for reuse.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this slab, must not have been freed
    /// already, and no reference to the record may be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<T>) {
        ptr.as_ptr().drop_in_place();
        self.free_list.push(ptr);
    }
}

// Slots hold MaybeUninit so dropping the slab never drops record content;
// every record must have been freed through `free` by then.

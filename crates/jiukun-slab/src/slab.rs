use jiukun_buddy::PageHandle;

use crate::invariants::debug_assert_slab_accounting;

/// Bytes reserved at the front of every slab for its back-pointer header.
/// The header holds the slab's id so an object address can be masked down
/// to its slab and the owning slab recovered without a cache-wide scan.
pub(crate) const HEADER_SIZE: usize = 16;

/// One slab: a single buddy page run subdivided into `num_objs` equal-size
/// object slots, plus a free bitmap and back-pointer header. Mirrors the
/// original's per-slab descriptor (`spec.md §4.B`): "object count per slab
/// and first-object offset are computed once at cache creation."
pub(crate) struct Slab {
    pub(crate) id: usize,
    page: PageHandle,
    base_addr: usize,
    len: usize,
    obj_size: usize,
    first_obj_offset: usize,
    free: Vec<bool>,
    pub(crate) num_free: usize,
}

impl Slab {
    pub(crate) fn new(id: usize, mut page: PageHandle, obj_size: usize) -> Self {
        let len = page.len();
        let first_obj_offset = HEADER_SIZE;
        let num_objs = (len - first_obj_offset) / obj_size;

        let base_addr = page.as_ptr() as usize;
        page.as_mut_slice()[0..8].copy_from_slice(&(id as u64).to_le_bytes());

        Self {
            id,
            page,
            base_addr,
            len,
            obj_size,
            first_obj_offset,
            free: vec![true; num_objs],
            num_free: num_objs,
        }
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base_addr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn num_objs(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.num_free == self.num_objs()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.num_free == 0
    }

    /// Take the first free slot, returning its absolute address.
    pub(crate) fn take_free_slot(&mut self, zero: bool) -> usize {
        let slot = self
            .free
            .iter()
            .position(|&f| f)
            .expect("take_free_slot called on a full slab");
        self.free[slot] = false;
        self.num_free -= 1;
        debug_assert_slab_accounting!(self.num_free, self.free.len());

        let offset = self.first_obj_offset + slot * self.obj_size;
        if zero {
            self.page.as_mut_slice()[offset..offset + self.obj_size].fill(0);
        }
        self.base_addr + offset
    }

    /// Mark the slot at `addr` free again. Returns `false` (a double free)
    /// if the slot was already marked free.
    pub(crate) fn release_slot(&mut self, addr: usize) -> bool {
        let slot = (addr - self.base_addr - self.first_obj_offset) / self.obj_size;
        if self.free[slot] {
            return false;
        }
        self.free[slot] = true;
        self.num_free += 1;
        debug_assert_slab_accounting!(self.num_free, self.free.len());
        true
    }

    pub(crate) fn into_page(self) -> PageHandle {
        self.page
    }
}

use std::{cell::RefCell, marker::PhantomData, ptr::NonNull, sync::Arc};

use rustc_hash::FxHashMap;

use super::{
    generation::{Generation, GenerationPin},
    Error, Result, PAGE_SIZE,
};

/// The pins held by one transaction.
///
/// Pointers handed out to a transaction borrow its `TxnState`, so they can't
/// outlive the pins that keep their mapping alive. A transaction pins each
/// generation it resolves at most once, per store.
#[derive(Default)]
pub struct TxnState {
    pins: RefCell<FxHashMap<u64, Vec<GenerationPin>>>,
}

impl TxnState {
    /// Creates a transaction state without pins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `generation` of store `store_id` unless this transaction already
    /// holds a pin on it.
    ///
    /// Fails with [`Error::InvalidMappingState`] if `generation` maps another
    /// store.
    pub(crate) fn ensure_pinned(&self, store_id: u64, generation: &Arc<Generation>) -> Result<()> {
        if generation.store_id() != store_id {
            return Err(Error::InvalidMappingState(generation.id()));
        }
        let mut pins = self.pins.borrow_mut();
        let pins = pins.entry(store_id).or_default();
        if pins.iter().any(|pin| Arc::ptr_eq(pin.generation(), generation)) {
            return Ok(());
        }
        pins.push(generation.pin()?);
        Ok(())
    }

    /// Adopts `pin` unless this transaction already holds a pin on the same
    /// generation.
    pub(crate) fn adopt(&self, store_id: u64, pin: GenerationPin) {
        debug_assert_eq!(pin.store_id(), store_id);
        let mut pins = self.pins.borrow_mut();
        let pins = pins.entry(store_id).or_default();
        if !pins
            .iter()
            .any(|p| Arc::ptr_eq(p.generation(), pin.generation()))
        {
            pins.push(pin);
        }
    }

    /// Returns the newest pinned generation of store `store_id` that maps
    /// pages up to `end_page`.
    pub(crate) fn covering(&self, store_id: u64, end_page: u64) -> Option<Arc<Generation>> {
        let pins = self.pins.borrow();
        pins.get(&store_id)?
            .iter()
            .filter(|pin| pin.store_id() == store_id && pin.num_pages() >= end_page)
            .max_by_key(|pin| pin.id())
            .map(|pin| pin.generation().clone())
    }

    /// Returns the ids of the generations of store `store_id` pinned by this
    /// transaction, in pin order.
    pub fn pinned_generations(&self, store_id: u64) -> Vec<u64> {
        self.pins
            .borrow()
            .get(&store_id)
            .map(|pins| pins.iter().map(|pin| pin.id()).collect())
            .unwrap_or_default()
    }

    /// Releases every pin. Requires that no pointer borrowed from this
    /// transaction is still alive.
    pub fn release(&mut self) {
        self.pins.get_mut().clear();
    }
}

impl std::fmt::Debug for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pins = self.pins.borrow();
        f.debug_map()
            .entries(
                pins.iter()
                    .map(|(store, pins)| (store, pins.iter().map(|p| p.id()).collect::<Vec<_>>())),
            )
            .finish()
    }
}

/// A pointer to one or more consecutive pages.
///
/// The pointer is valid for as long as the transaction it was acquired for
/// holds its pins.
#[derive(Clone, Copy, Debug)]
pub struct PagePtr<'t> {
    ptr: NonNull<u8>,
    page: u64,
    count: u64,
    _txn: PhantomData<&'t TxnState>,
}

impl<'t> PagePtr<'t> {
    pub(crate) fn new(ptr: NonNull<u8>, page: u64, count: u64) -> Self {
        PagePtr {
            ptr,
            page,
            count,
            _txn: PhantomData,
        }
    }

    /// The first page this pointer points to.
    #[inline]
    pub fn page_number(&self) -> u64 {
        self.page
    }

    /// The number of pages this pointer covers.
    #[inline]
    pub fn page_count(&self) -> u64 {
        self.count
    }

    /// The number of bytes this pointer covers.
    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize * PAGE_SIZE
    }

    /// Returns true if the pointer covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The raw address of the first page.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the pages as a byte slice.
    ///
    /// # Safety
    ///
    /// No one may write to the pages while the slice is alive.
    pub unsafe fn as_slice(&self) -> &'t [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len())
    }

    /// Returns the pages as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// No one else may access the pages while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &'t mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len())
    }
}

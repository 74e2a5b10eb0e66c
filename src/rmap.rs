//! Reverse mapping and the file-cache tree.
//!
//! The exchange kernel consumes the surrounding virtual-memory machinery
//! through a narrow contract: unmap a page by installing migration entries
//! in every page table that references it, later replace those entries with
//! ones pointing at a (possibly different) page, and for file pages look up
//! and replace the frame slot in the owning mapping's tree under its lock.
//! This module supplies that machinery.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
};

use crate::{
    deps::log::debug,
    frames::PAGE_SIZE,
    page::{
        PageLock,
        PageRoot,
        Pfn,
        PhysicalPage,
    },
};


/// The anchor shared by all VMAs that map a set of anonymous pages. Held
/// (referenced) for the duration of an exchange so the rmap walk stays
/// valid while the page is temporarily unmapped.
pub struct AnonVma {
    id:   u64,
    refs: AtomicUsize,
    vmas: Mutex<Vec<Arc<Vma>>>,
}


impl AnonVma {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            refs: AtomicUsize::new(1),
            vmas: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(
        &self,
        vma: &Arc<Vma>,
    ) {
        self.vmas.lock().unwrap().push(Arc::clone(vma));
    }

    pub fn vmas(&self) -> Vec<Arc<Vma>> {
        self.vmas.lock().unwrap().clone()
    }
}


/// `page_get_anon_vma()`: pin the anon anchor of an anonymous, non-KSM
/// page. Returns `None` when the page is not anonymous (which implies it
/// cannot be remapped while its lock is held).
pub fn page_get_anon_vma(page: &PhysicalPage) -> Option<Arc<AnonVma>> {
    match page.root() {
        PageRoot::Anon(av) => {
            av.refs.fetch_add(1, Ordering::SeqCst);
            Some(av)
        }
        _ => None,
    }
}


pub fn put_anon_vma(av: &Arc<AnonVma>) {
    let prior = av.refs.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prior > 0, "anon_vma {} reference underflow", av.id);
}


/// How the owning filesystem migrates its pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MigrateOps {
    /// The mapping migrates by moving its buffer heads (`buffer_migrate_page`).
    Buffer,
    /// No migratepage callback; the fallback path applies.
    Fallback,
}


/// A file mapping: the tree from page offsets to frames, plus the VMAs that
/// map it. Locking the tree is done by holding the guard returned from
/// [`AddressSpace::tree_lock`] across the whole critical section.
pub struct AddressSpace {
    id:            u64,
    ops:           MigrateOps,
    account_dirty: bool,
    tree:          Mutex<BTreeMap<u64, Pfn>>,
    vmas:          Mutex<Vec<Arc<Vma>>>,
}


impl AddressSpace {
    pub fn new(
        id: u64,
        ops: MigrateOps,
        account_dirty: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            ops,
            account_dirty,
            tree: Mutex::new(BTreeMap::new()),
            vmas: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ops(&self) -> MigrateOps {
        self.ops
    }

    /// `mapping_cap_account_dirty()`
    pub fn accounts_dirty(&self) -> bool {
        self.account_dirty
    }

    pub fn tree_lock(&self) -> MutexGuard<'_, BTreeMap<u64, Pfn>> {
        self.tree.lock().unwrap()
    }

    pub(crate) fn attach(
        &self,
        vma: &Arc<Vma>,
    ) {
        self.vmas.lock().unwrap().push(Arc::clone(vma));
    }

    pub fn vmas(&self) -> Vec<Arc<Vma>> {
        self.vmas.lock().unwrap().clone()
    }
}


/// Filesystem buffers attached to a file page. Only their lock state and
/// which page they point at matter to the exchange protocol.
pub struct BufferHeads {
    lock: PageLock,
    page: AtomicU64,
}


impl BufferHeads {
    pub fn new(pfn: Pfn) -> Arc<Self> {
        Arc::new(Self {
            lock: PageLock::new(),
            page: AtomicU64::new(pfn.get()),
        })
    }

    /// `buffer_migrate_lock_buffers()` in async mode: all-or-nothing.
    pub fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    pub fn lock(&self) {
        self.lock.lock()
    }

    pub fn unlock(&self) {
        self.lock.unlock()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn holder(&self) -> Pfn {
        Pfn::new(self.page.load(Ordering::SeqCst))
    }

    /// `set_bh_page()`: repoint every buffer at the given page.
    pub fn set_holder(
        &self,
        pfn: Pfn,
    ) {
        self.page.store(pfn.get(), Ordering::SeqCst);
    }
}


/// A page-table entry in some VMA.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PteEntry {
    Present(Pfn),
    /// Placeholder installed while the referenced page is being exchanged;
    /// carries the identity of the unmapped page.
    Migration(Pfn),
}


/// What a VMA maps: the anon anchor or a file mapping.
#[derive(Clone)]
pub enum VmaBacking {
    Anon(Arc<AnonVma>),
    File(Arc<AddressSpace>),
}


pub struct Vma {
    start:    u64,
    pgoff:    u64,
    nr_pages: u64,
    backing:  VmaBacking,
    ptes:     Mutex<BTreeMap<u64, PteEntry>>,
}


impl Vma {
    pub fn new_anon(
        start: u64,
        nr_pages: u64,
        anon_vma: &Arc<AnonVma>,
    ) -> Arc<Self> {
        let vma = Arc::new(Self {
            start,
            pgoff: start / PAGE_SIZE as u64,
            nr_pages,
            backing: VmaBacking::Anon(Arc::clone(anon_vma)),
            ptes: Mutex::new(BTreeMap::new()),
        });
        anon_vma.attach(&vma);
        vma
    }

    pub fn new_file(
        start: u64,
        nr_pages: u64,
        pgoff: u64,
        mapping: &Arc<AddressSpace>,
    ) -> Arc<Self> {
        let vma = Arc::new(Self {
            start,
            pgoff,
            nr_pages,
            backing: VmaBacking::File(Arc::clone(mapping)),
            ptes: Mutex::new(BTreeMap::new()),
        });
        mapping.attach(&vma);
        vma
    }

    pub fn backing(&self) -> VmaBacking {
        self.backing.clone()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn pgoff(&self) -> u64 {
        self.pgoff
    }

    pub fn covers_index(
        &self,
        index: u64,
        nr_pages: u64,
    ) -> bool {
        index >= self.pgoff && index + nr_pages <= self.pgoff + self.nr_pages
    }

    /// `vma_address()`: the virtual address backing page offset `index`.
    pub fn address_of_index(
        &self,
        index: u64,
    ) -> u64 {
        debug_assert!(index >= self.pgoff);
        self.start + (index - self.pgoff) * PAGE_SIZE as u64
    }

    pub fn pte(
        &self,
        vaddr: u64,
    ) -> Option<PteEntry> {
        self.ptes.lock().unwrap().get(&vaddr).copied()
    }

    pub(crate) fn set_pte(
        &self,
        vaddr: u64,
        entry: PteEntry,
    ) {
        self.ptes.lock().unwrap().insert(vaddr, entry);
    }

    /// Resolves a virtual address to its present frame, if any.
    pub fn resolve(
        &self,
        vaddr: u64,
    ) -> Option<Pfn> {
        match self.pte(vaddr)? {
            PteEntry::Present(pfn) => Some(pfn),
            PteEntry::Migration(_) => None,
        }
    }
}


impl fmt::Debug for Vma {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("Vma")
            .field("start", &format_args!("{:#x}", self.start))
            .field("pgoff", &self.pgoff)
            .field("nr_pages", &self.nr_pages)
            .finish()
    }
}


fn rmap_vmas(root: &PageRoot) -> Vec<Arc<Vma>> {
    match root {
        PageRoot::None => Vec::new(),
        PageRoot::Anon(av) => av.vmas(),
        PageRoot::File(mapping) => mapping.vmas(),
    }
}


/// `try_to_unmap(page, TTU_MIGRATION | ...)`: replace every present entry
/// referencing the page with a migration entry carrying the page's own
/// identity. Each conversion drops the map count and the reference the
/// page table held; the caller keeps the page alive through its isolation
/// reference.
pub fn try_to_unmap(page: &Arc<PhysicalPage>) {
    let root = page.root();
    let index = page.index();
    let nr_pages = page.nr_pages() as u64;

    for vma in rmap_vmas(&root) {
        if !vma.covers_index(index, nr_pages) {
            continue;
        }

        let mut converted = false;
        for k in 0..nr_pages {
            let vaddr = vma.address_of_index(index + k);
            if vma.pte(vaddr) == Some(PteEntry::Present(page.pfn().offset(k))) {
                vma.set_pte(vaddr, PteEntry::Migration(page.pfn().offset(k)));
                converted = true;
            }
        }

        if converted {
            page.mapcount_dec();
            let remaining = page.put_page_return();
            debug_assert!(remaining > 0, "unmap dropped the last reference");
            debug!(
                "installed migration entries for {:?} in vma at {:#x}",
                page.pfn(),
                vma.start()
            );
        }
    }
}


/// `remove_migration_ptes(old, new)`: replace migration entries carrying
/// `old`'s identity with present entries pointing at `new`, which gains
/// the map count and the page-table reference. The walk is keyed by
/// `new`'s rmap root and by `old`'s index, which the caller has restored
/// to the pre-exchange value when the two differ.
pub fn remove_migration_ptes(
    old: &Arc<PhysicalPage>,
    new: &Arc<PhysicalPage>,
) {
    let root = new.root();
    let index = old.index();
    let nr_pages = old.nr_pages() as u64;

    for vma in rmap_vmas(&root) {
        if !vma.covers_index(index, nr_pages) {
            continue;
        }

        let mut converted = false;
        for k in 0..nr_pages {
            let vaddr = vma.address_of_index(index + k);
            if vma.pte(vaddr) == Some(PteEntry::Migration(old.pfn().offset(k))) {
                vma.set_pte(vaddr, PteEntry::Present(new.pfn().offset(k)));
                converted = true;
            }
        }

        if converted {
            new.mapcount_inc();
            new.get_page();
        }
    }
}


/// `try_to_free_buffers()`: drop the filesystem buffers if nothing holds
/// them locked.
pub fn try_to_free_buffers(page: &Arc<PhysicalPage>) -> bool {
    match page.buffer_heads() {
        None => {
            page.flags().clear_private();
            true
        }
        Some(heads) => {
            if heads.is_locked() {
                return false;
            }
            page.take_buffers();
            true
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameArena;

    fn anon_mapped_page(av: &Arc<AnonVma>, vma: &Arc<Vma>, pfn: u64, index: u64) -> Arc<PhysicalPage> {
        let arena = Arc::new(FrameArena::new(pfn as usize + 1).unwrap());
        let page = Arc::new(PhysicalPage::new(Pfn::new(pfn), 0, 0, false, arena));
        page.set_root(PageRoot::Anon(Arc::clone(av)));
        page.set_index(index);
        vma.set_pte(vma.address_of_index(index), PteEntry::Present(page.pfn()));
        page.mapcount_inc();
        // Stand in for the isolation reference that keeps an unmapped page
        // alive.
        page.get_page();
        page
    }

    #[test]
    fn unmap_installs_migration_entries_and_drops_the_pte_reference() {
        let av = AnonVma::new(1);
        let vma = Vma::new_anon(0x400000, 4, &av);
        let page = anon_mapped_page(&av, &vma, 3, 0x400);
        assert_eq!(page.page_count(), 2);

        assert!(page.page_mapped());
        try_to_unmap(&page);

        assert!(!page.page_mapped());
        assert_eq!(page.page_count(), 1);
        let vaddr = vma.address_of_index(0x400);
        assert_eq!(vma.pte(vaddr), Some(PteEntry::Migration(Pfn::new(3))));
        assert_eq!(vma.resolve(vaddr), None);
    }

    #[test]
    fn remap_to_replacement_page_rebinds_the_address() {
        let av = AnonVma::new(7);
        let vma = Vma::new_anon(0x500000, 2, &av);
        let old = anon_mapped_page(&av, &vma, 2, 0x500);

        try_to_unmap(&old);

        let arena = Arc::new(FrameArena::new(6).unwrap());
        let new = Arc::new(PhysicalPage::new(Pfn::new(5), 1, 0, false, arena));
        new.set_root(PageRoot::Anon(Arc::clone(&av)));
        new.set_index(0x500);

        remove_migration_ptes(&old, &new);

        let vaddr = vma.address_of_index(0x500);
        assert_eq!(vma.resolve(vaddr), Some(Pfn::new(5)));
        assert!(new.page_mapped());
        assert_eq!(new.page_count(), 2);
        assert!(!old.page_mapped());
    }

    #[test]
    fn anon_vma_pin_and_release() {
        let av = AnonVma::new(9);
        let vma = Vma::new_anon(0x600000, 1, &av);
        let page = anon_mapped_page(&av, &vma, 1, 0x600);

        let pinned = page_get_anon_vma(&page).unwrap();
        assert_eq!(pinned.refs(), 2);
        put_anon_vma(&pinned);
        assert_eq!(pinned.refs(), 1);
    }

    #[test]
    fn locked_buffers_cannot_be_freed() {
        let arena = Arc::new(FrameArena::new(2).unwrap());
        let page = Arc::new(PhysicalPage::new(Pfn::new(1), 0, 0, false, arena));
        page.attach_buffers(BufferHeads::new(page.pfn()));

        let heads = page.buffer_heads().unwrap();
        heads.lock();
        assert!(!try_to_free_buffers(&page));
        heads.unlock();

        assert!(try_to_free_buffers(&page));
        assert!(!page.page_has_private());
        assert!(!page.has_buffers());
    }
}

//! Pairwise page exchange.
//!
//! Two resident, mapped pages trade places without a third frame: both are
//! unmapped behind migration entries, their mapping identities and flag
//! words are swapped, their contents are exchanged in place, and the page
//! tables are rebuilt pointing each virtual range at the other frame. The
//! `from` side must be anonymous; the `to` side may be anonymous or
//! file-backed.
use std::sync::Arc;

use crate::{
    deps::log::debug,
    balancing::del_page_from_lists_locked,
    config::{
        BalanceMode,
        MigrateMode,
    },
    error::{
        Error,
        Result,
    },
    events::ExchangeEvent,
    exchange_concur::exchange_pages_concur,
    exchange_page::{
        exchange_base_page,
        exchange_huge_page,
        exchange_page_multithread,
    },
    node::{
        Machine,
        NodeStatItem,
    },
    page::PhysicalPage,
    rmap::{
        page_get_anon_vma,
        put_anon_vma,
        remove_migration_ptes,
        try_to_free_buffers,
        try_to_unmap,
        AnonVma,
        BufferHeads,
        MigrateOps,
    },
};


/// One pair moving through the exchange pipeline. The page references are
/// borrowed under the busy locks of the driver; the saved indices belong
/// to the pair for the duration of the run.
pub struct ExchangePair {
    pub from_page:             Option<Arc<PhysicalPage>>,
    pub to_page:               Option<Arc<PhysicalPage>>,
    pub(crate) from_anon_vma:  Option<Arc<AnonVma>>,
    pub(crate) to_anon_vma:    Option<Arc<AnonVma>>,
    pub(crate) from_was_mapped: bool,
    pub(crate) to_was_mapped:  bool,
    pub(crate) from_index:     u64,
    pub(crate) to_index:       u64,
}


impl ExchangePair {
    pub fn new(
        from_page: Arc<PhysicalPage>,
        to_page: Arc<PhysicalPage>,
    ) -> Self {
        Self {
            from_page:       Some(from_page),
            to_page:         Some(to_page),
            from_anon_vma:   None,
            to_anon_vma:     None,
            from_was_mapped: false,
            to_was_mapped:   false,
            from_index:      0,
            to_index:        0,
        }
    }
}


pub(crate) fn dump_page(
    page: &PhysicalPage,
    msg: &str,
) {
    debug!(
        "dump:{} {:?},count:{},mapcount:{},root:{:?},index:{:#x},{},order:{},{},node:{}",
        msg,
        page.pfn(),
        page.page_count(),
        page.mapcount(),
        page.root(),
        page.index(),
        if page.is_compound() { "compound_page" } else { "single_page" },
        page.compound_order(),
        if page.flags().dirty() { "dirty" } else { "clean" },
        page.nid(),
    );
}


pub(crate) fn inc_isolated(
    machine: &Machine,
    page: &PhysicalPage,
) {
    let item = if page.is_file_cache() {
        NodeStatItem::IsolatedFile
    } else {
        NodeStatItem::IsolatedAnon
    };
    machine.page_node(page).stats.modify(item, page.nr_pages() as i64);
}


pub(crate) fn dec_isolated(
    machine: &Machine,
    page: &PhysicalPage,
) {
    let item = if page.is_file_cache() {
        NodeStatItem::IsolatedFile
    } else {
        NodeStatItem::IsolatedAnon
    };
    machine.page_node(page).stats.modify(item, -(page.nr_pages() as i64));
}


/// Pairs must agree on compound shape, and hugetlb pages are never
/// exchanged.
pub fn can_be_exchanged(
    from: &PhysicalPage,
    to: &PhysicalPage,
) -> bool {
    if from.is_compound() != to.is_compound() {
        return false;
    }

    if from.is_huge() != to.is_huge() {
        return false;
    }

    if from.is_huge() || to.is_huge() {
        return false;
    }

    if from.compound_order() != to.compound_order() {
        return false;
    }

    true
}


#[derive(Default)]
struct SavedFlags {
    error:        bool,
    referenced:   bool,
    uptodate:     bool,
    active:       bool,
    unevictable:  bool,
    checked:      bool,
    mappedtodisk: bool,
    dirty:        bool,
    young:        bool,
    idle:         bool,
    swapcache:    bool,
    doublemap:    bool,
}


fn capture_and_clear_flags(page: &PhysicalPage) -> SavedFlags {
    let flags = page.flags();
    let mut saved = SavedFlags::default();

    saved.error = flags.error();
    if saved.error {
        flags.clear_error();
    }
    saved.referenced = flags.test_and_clear_referenced();
    saved.uptodate = flags.uptodate();
    flags.clear_uptodate();
    saved.active = flags.test_and_clear_active();
    saved.unevictable = flags.test_and_clear_unevictable();
    saved.checked = flags.checked();
    if saved.checked {
        flags.clear_checked();
    }
    saved.mappedtodisk = flags.mappedtodisk();
    flags.clear_mappedtodisk();
    saved.dirty = flags.dirty();
    flags.clear_dirty();
    saved.young = flags.test_and_clear_young();
    saved.idle = flags.idle();
    flags.clear_idle();
    saved.swapcache = flags.swapcache();
    // Writeback is cleared, waking waiters, but never transferred: both
    // sides were required to be clean of writeback before this point.
    page.test_and_clear_writeback();
    saved.doublemap = flags.doublemap();

    saved
}


fn apply_flags(
    page: &PhysicalPage,
    saved: &SavedFlags,
) {
    let flags = page.flags();

    if saved.error {
        flags.set_error();
    }
    if saved.referenced {
        flags.set_referenced();
    }
    if saved.uptodate {
        flags.set_uptodate();
    }
    if saved.active {
        debug_assert!(!saved.unevictable);
        flags.set_active();
    } else if saved.unevictable {
        flags.set_unevictable();
    }
    if saved.checked {
        flags.set_checked();
    }
    if saved.mappedtodisk {
        flags.set_mappedtodisk();
    }
    if saved.dirty {
        flags.set_dirty();
    }
    if saved.young {
        flags.set_young();
    }
    if saved.idle {
        flags.set_idle();
    }
    if saved.doublemap {
        flags.set_doublemap();
    }
}


/// Step 7 of the pipeline: the fourteen identity flags, the cpupid hint,
/// the memcg charge and the access history all cross over.
pub(crate) fn exchange_page_flags(
    machine: &Machine,
    to_page: &PhysicalPage,
    from_page: &PhysicalPage,
) {
    let from_cpupid = from_page.cpupid_xchg(-1);
    let from_saved = capture_and_clear_flags(from_page);

    let to_cpupid = to_page.cpupid_xchg(-1);
    let to_saved = capture_and_clear_flags(to_page);

    apply_flags(to_page, &from_saved);
    apply_flags(from_page, &to_saved);

    // The NUMA placement hint follows the contents, keeping future
    // migration decisions aimed at the right accessor.
    to_page.cpupid_xchg(from_cpupid);
    from_page.cpupid_xchg(to_cpupid);

    to_page.flags().clear_swapcache();
    from_page.flags().clear_swapcache();
    if from_saved.swapcache {
        to_page.flags().set_swapcache();
    }
    if to_saved.swapcache {
        from_page.flags().set_swapcache();
    }

    let to_memcg = to_page.memcg();
    let from_memcg = from_page.memcg();
    to_page.set_memcg(from_memcg);
    from_page.set_memcg(to_memcg);

    if machine.config().mode().contains(BalanceMode::OPM) {
        machine.info().exchange_info(from_page.pfn(), to_page.pfn());
    }
}


/// Step 5: swap the mapping identity of the two pages.
///
/// For an anonymous pair this is a plain swap of `index`, root and the
/// swap-backing bit. When `to` is file-backed its tree slot is repointed at
/// the previously anonymous page under the tree lock, with the reference
/// count frozen across the replacement.
pub(crate) fn exchange_mapping_swap(
    machine: &Machine,
    to_page: &Arc<PhysicalPage>,
    from_page: &Arc<PhysicalPage>,
    to_head: Option<&Arc<BufferHeads>>,
    mode: MigrateMode,
    to_extra: usize,
    from_extra: usize,
) -> Result<()> {
    let to_expected = 1 + to_extra;
    let from_expected = 1 + from_extra;

    let from_index = from_page.index();
    let to_index = to_page.index();
    let from_swapbacked = from_page.flags().swapbacked();
    let to_swapbacked = to_page.flags().swapbacked();
    let from_root = from_page.root();
    let to_root = to_page.root();

    let from_mapping = from_page.mapping_file();
    let to_mapping = to_page.mapping_file();

    debug_assert_eq!(from_page.is_compound(), to_page.is_compound());

    if to_mapping.is_none() && to_page.page_count() != to_expected {
        return Err(Error::again("anonymous to page holds extra references"));
    }
    if from_mapping.is_none() && from_page.page_count() != from_expected {
        return Err(Error::again("anonymous from page holds extra references"));
    }

    match (from_mapping, to_mapping) {
        // Both anonymous: identities swap without any tree involvement.
        (None, None) => {
            from_page.set_index(to_index);
            from_page.set_root(to_root);
            from_page.flags().clear_swapbacked();
            if to_swapbacked {
                from_page.flags().set_swapbacked();
            }

            to_page.set_index(from_index);
            to_page.set_root(from_root);
            to_page.flags().clear_swapbacked();
            if from_swapbacked {
                to_page.flags().set_swapbacked();
            }

            Ok(())
        }

        // Anonymous `from`, file-backed `to`: repoint the tree slot.
        (None, Some(mapping)) => {
            let from_nid = from_page.nid();
            let to_nid = to_page.nid();

            let mut tree = mapping.tree_lock();

            let slot = tree.get(&to_index).copied();
            let to_expected = to_expected + 1 + (to_page.page_has_private() as usize);

            if to_page.page_count() != to_expected || slot != Some(to_page.pfn()) {
                return Err(Error::again("file page is pinned or its slot moved"));
            }

            if !to_page.ref_freeze(to_expected) {
                debug!("cannot freeze page count");
                return Err(Error::again("cannot freeze file page references"));
            }

            if mode.is_async() {
                if let Some(head) = to_head {
                    if !head.try_lock() {
                        to_page.ref_unfreeze(to_expected);
                        debug!("cannot lock buffer head");
                        return Err(Error::again("buffer heads are contended"));
                    }
                }
            }

            // No one else can reach either page now; no turning back.
            from_page.flags().clear_swapbacked();
            to_page.flags().clear_swapbacked();

            from_page.set_index(to_index);
            from_page.set_root(to_root);
            to_page.set_index(from_index);
            to_page.set_root(from_root);

            // The tree slot's reference moves to the incoming page.
            from_page.get_page();
            if to_swapbacked {
                from_page.flags().set_swapbacked();
            }
            if from_swapbacked {
                to_page.flags().set_swapbacked();
            }

            let dirty = to_page.flags().dirty();

            tree.insert(to_index, from_page.pfn());
            to_page.ref_unfreeze(to_expected - 1);
            drop(tree);

            if to_nid != from_nid {
                let to_stats = &machine.node(to_nid).stats;
                let from_stats = &machine.node(from_nid).stats;

                to_stats.modify(NodeStatItem::FilePages, -1);
                from_stats.modify(NodeStatItem::FilePages, 1);
                if to_page.flags().swapbacked() && !to_page.flags().swapcache() {
                    to_stats.modify(NodeStatItem::Shmem, -1);
                    from_stats.modify(NodeStatItem::Shmem, 1);
                }
                if dirty && mapping.accounts_dirty() {
                    to_stats.modify(NodeStatItem::FileDirty, -1);
                    to_stats.modify(NodeStatItem::WritePending, -1);
                    from_stats.modify(NodeStatItem::FileDirty, 1);
                    from_stats.modify(NodeStatItem::WritePending, 1);
                }
            }

            Ok(())
        }

        // A file-backed `from` page never reaches this point.
        _ => Err(Error::fault("file-backed from page in mapping swap")),
    }
}


/// Steps 5-7 on a pair that is locked and fully unmapped: mapping swap,
/// content swap (multithreaded with a serial fallback), flag transfer.
fn exchange_loaded_pages(
    machine: &Machine,
    to_page: &Arc<PhysicalPage>,
    from_page: &Arc<PhysicalPage>,
    mode: MigrateMode,
) -> Result<()> {
    debug_assert!(from_page.lock().is_locked());
    debug_assert!(to_page.lock().is_locked());
    debug_assert!(!from_page.flags().writeback());
    debug_assert!(!to_page.flags().writeback());

    let to_mapping = to_page.mapping_file();

    if from_page.mapping_file().is_some() {
        return Err(Error::fault("from page must be anonymous"));
    }

    dump_page(from_page, "exchange anonymous page: from ");

    let mut to_head: Option<Arc<BufferHeads>> = None;

    match to_mapping {
        None => {
            dump_page(to_page, "exchange anonymous page: to ");
            exchange_mapping_swap(machine, to_page, from_page, None, mode, 0, 0)?;
        }
        Some(mapping) => match mapping.ops() {
            MigrateOps::Buffer => {
                dump_page(to_page, "exchange has migratepage: to ");

                match to_page.buffer_heads() {
                    None => {
                        exchange_mapping_swap(machine, to_page, from_page, None, mode, 0, 0)?;
                    }
                    Some(heads) => {
                        exchange_mapping_swap(machine, to_page, from_page, Some(&heads), mode, 0, 0)?;

                        // The async case locked the buffers under the tree
                        // lock; here they are taken after the fact.
                        if !mode.is_async() {
                            heads.lock();
                        }

                        // The buffers and their reference move with the
                        // file identity onto the incoming page.
                        to_page.take_buffers();
                        machine.put_page(to_page);
                        from_page.get_page();
                        heads.set_holder(from_page.pfn());
                        from_page.attach_buffers(Arc::clone(&heads));

                        to_head = Some(heads);
                    }
                }
            }
            MigrateOps::Fallback => {
                dump_page(to_page, "exchange no migratepage: to ");

                if to_page.flags().dirty() {
                    if !mode.is_sync() {
                        return Err(Error::busy("dirty file page needs writeout"));
                    }
                    return Err(Error::NotSupported {
                        reason: "writeout of a dirty file page",
                    });
                }
                if to_page.page_has_private() && !try_to_free_buffers(to_page) {
                    return Err(Error::again("file page buffers are pinned"));
                }

                exchange_mapping_swap(machine, to_page, from_page, None, mode, 0, 0)?;
            }
        },
    }

    // The actual data exchange, preferring the parallel engine.
    let mut copied = false;
    if mode.has_mt() {
        copied = exchange_page_multithread(machine, to_page, from_page, from_page.nr_pages()).is_ok();
    }
    if !copied {
        if from_page.is_huge() || from_page.is_trans_huge() {
            exchange_huge_page(to_page, from_page);
        } else {
            exchange_base_page(to_page, from_page);
        }
    }

    // Private state was either transferred onto `from` or absent entirely.
    debug_assert!(!to_page.page_has_private());

    exchange_page_flags(machine, to_page, from_page);

    dump_page(from_page, "after exchange: from ");
    dump_page(to_page, "after exchange: to ");

    if let Some(heads) = to_head {
        heads.unlock();
    }

    Ok(())
}


struct CountSnapshot {
    from_count: usize,
    from_map:   usize,
    to_count:   usize,
    to_map:     usize,
}


impl CountSnapshot {
    fn take(
        from_page: &PhysicalPage,
        to_page: &PhysicalPage,
    ) -> Self {
        Self {
            from_count: from_page.page_count(),
            from_map:   from_page.mapcount(),
            to_count:   to_page.page_count(),
            to_map:     to_page.mapcount(),
        }
    }

    /// Post-exchange consistency audit. Reference counts are expected to
    /// follow the identities; known-benign shapes (a migratepage-less
    /// mapping holding one extra reference, or sleepers on the page lock)
    /// are tolerated, anything else is logged and the result stands.
    fn audit(
        &self,
        from_page: &PhysicalPage,
        to_page: &PhysicalPage,
        success: bool,
    ) {
        let (first, second) = if success {
            (to_page, from_page)
        } else {
            (from_page, to_page)
        };

        let clean = self.from_count == first.page_count()
            && self.to_count == second.page_count()
            && self.from_map == first.mapcount()
            && self.to_map == second.mapcount();
        if clean {
            return;
        }

        let fallback_extra = match second.mapping_file() {
            Some(mapping) => {
                mapping.ops() == MigrateOps::Fallback
                    && self.to_count == second.page_count() + 1
                    && self.to_map == second.mapcount()
                    && self.from_count == first.page_count()
                    && self.from_map == first.mapcount()
            }
            None => false,
        };
        if fallback_extra {
            return;
        }

        let to_count_ok = if second.lock().has_waiters() {
            self.to_count < second.page_count()
        } else {
            self.to_count == second.page_count()
        };
        let from_count_ok = if first.lock().has_waiters() {
            self.from_count < first.page_count()
        } else {
            self.from_count == first.page_count()
        };
        if to_count_ok
            && from_count_ok
            && self.to_map == second.mapcount()
            && self.from_map == first.mapcount()
        {
            return;
        }

        debug!(
            "count drift after exchange (success: {}): \
             saved from_count: {}, from_map: {}, to_count: {}, to_map: {}",
            success, self.from_count, self.from_map, self.to_count, self.to_map,
        );
        dump_page(from_page, if success { "after exchange: from" } else { "exchange failed: from" });
        dump_page(to_page, if success { "after exchange: to" } else { "exchange failed: to" });
    }
}


/// Steps 1-9 for one pair: lock both pages, pin the anon anchors, unmap,
/// exchange, remap, unlock. Aborts before the mapping swap restore the
/// prior state exactly.
fn unmap_and_exchange(
    machine: &Machine,
    from_page: &Arc<PhysicalPage>,
    to_page: &Arc<PhysicalPage>,
    mode: MigrateMode,
) -> Result<()> {
    // Lock order is strictly `from` before `to`; the call site ordered the
    // pair by reference count so symmetric pairs cannot deadlock.
    if !from_page.lock().try_lock() {
        if mode.is_async() {
            return Err(Error::again("from page lock is contended"));
        }
        from_page.lock().lock();
    }

    if !to_page.lock().try_lock() {
        if mode.is_async() {
            from_page.lock().unlock();
            return Err(Error::again("to page lock is contended"));
        }
        to_page.lock().lock();
    }

    debug_assert!(!from_page.flags().writeback(), "anonymous from page under writeback");

    if to_page.flags().writeback() {
        // Only a fully synchronous exchange is allowed to sit out a
        // writeback; async retry loops are too short and sync-light
        // callers cannot afford the stall.
        if !mode.is_sync() {
            to_page.lock().unlock();
            from_page.lock().unlock();
            return Err(Error::busy("to page is under writeback"));
        }
        to_page.wait_on_writeback();
    }

    // Pin the anon anchors so the rmap walk outlives the unmapped window.
    let from_anon_vma = if from_page.is_anon() && !from_page.is_ksm() {
        page_get_anon_vma(from_page)
    } else {
        None
    };
    let to_anon_vma = if to_page.is_anon() && !to_page.is_ksm() {
        page_get_anon_vma(to_page)
    } else {
        None
    };

    let snapshot = CountSnapshot::take(from_page, to_page);
    let saved_from_index = from_page.index();
    let saved_to_index = to_page.index();

    let mut from_was_mapped = false;
    let mut to_was_mapped = false;
    let mut rc: Result<()> = Err(Error::again("pages are still mapped"));
    let mut aborted = false;

    // A page without any mapping can still carry orphaned fs-private
    // metadata; free it and bail out so the page can die.
    if from_page.root().is_none() {
        debug_assert!(!from_page.is_anon());
        if from_page.page_has_private() {
            try_to_free_buffers(from_page);
            aborted = true;
        }
    } else if from_page.page_mapped() {
        debug_assert!(!from_page.is_anon() || from_page.is_ksm() || from_anon_vma.is_some());
        try_to_unmap(from_page);
        from_was_mapped = true;
    }

    if !aborted {
        if to_page.root().is_none() {
            debug_assert!(!to_page.is_anon());
            if to_page.page_has_private() {
                try_to_free_buffers(to_page);
                aborted = true;
            }
        } else if to_page.page_mapped() {
            debug_assert!(!to_page.is_anon() || to_page.is_ksm() || to_anon_vma.is_some());
            try_to_unmap(to_page);
            to_was_mapped = true;
        }
    }

    if !aborted && !from_page.page_mapped() && !to_page.page_mapped() {
        rc = exchange_loaded_pages(machine, to_page, from_page, mode);
        debug!(
            "exchange pages from {:?} to {:?}: {:?}",
            from_page.pfn(),
            to_page.pfn(),
            rc.is_ok(),
        );
    }

    let success = rc.is_ok();

    // The rmap walk keys migration entries by the pre-exchange identity,
    // so the saved index is restored around each removal.
    if to_was_mapped {
        let current = to_page.index();
        if success {
            to_page.set_index(saved_to_index);
        }
        remove_migration_ptes(to_page, if success { from_page } else { to_page });
        if success {
            to_page.set_index(current);
        }
    }

    if from_was_mapped {
        let current = from_page.index();
        if success {
            from_page.set_index(saved_from_index);
        }
        remove_migration_ptes(from_page, if success { to_page } else { from_page });
        if success {
            from_page.set_index(current);
        }
    }

    snapshot.audit(from_page, to_page, success);

    if let Some(av) = &to_anon_vma {
        put_anon_vma(av);
    }
    to_page.lock().unlock();

    if let Some(av) = &from_anon_vma {
        put_anon_vma(av);
    }
    from_page.lock().unlock();

    rc
}


enum PairDisposition {
    FreedHandled,
    Incompatible,
    Attempted(Result<()>),
}


/// Serial exchange of every pair on the list. Returns the number of pairs
/// that ultimately failed; every page ends up back on an LRU list (or
/// released, when it died under us).
pub fn exchange_pages(
    machine: &Machine,
    pairs: Vec<ExchangePair>,
    mode: MigrateMode,
) -> usize {
    let mut failed = 0;

    for pair in pairs {
        let from_page = match pair.from_page {
            Some(ref page) => Arc::clone(page),
            None => continue,
        };
        let to_page = match pair.to_page {
            Some(ref page) => Arc::clone(page),
            None => continue,
        };

        let mut retry = 0;
        let disposition = loop {
            // A participant whose other references vanished is released
            // instead of exchanged, and its partner goes back to the LRU.
            if from_page.page_count() == 1 {
                from_page.flags().clear_active();
                from_page.flags().clear_unevictable();
                dec_isolated(machine, &from_page);
                machine.put_page(&from_page);

                if to_page.page_count() == 1 {
                    to_page.flags().clear_active();
                    to_page.flags().clear_unevictable();
                    dec_isolated(machine, &to_page);
                    machine.put_page(&to_page);
                } else {
                    dec_isolated(machine, &to_page);
                    machine.putback_lru_page(&to_page);
                }
                break PairDisposition::FreedHandled;
            }

            if to_page.page_count() == 1 {
                to_page.flags().clear_active();
                to_page.flags().clear_unevictable();
                dec_isolated(machine, &to_page);
                machine.put_page(&to_page);

                dec_isolated(machine, &from_page);
                machine.putback_lru_page(&from_page);
                break PairDisposition::FreedHandled;
            }

            if !can_be_exchanged(&from_page, &to_page) || from_page.mapping_file().is_some() {
                break PairDisposition::Incompatible;
            }

            match unmap_and_exchange(machine, &from_page, &to_page, mode) {
                Err(err) if err.is_retriable() && retry < 3 => {
                    retry += 1;
                }
                rc => break PairDisposition::Attempted(rc),
            }
        };

        match disposition {
            PairDisposition::FreedHandled => continue,
            PairDisposition::Incompatible => {
                failed += 1;
            }
            PairDisposition::Attempted(Ok(())) => {
                machine
                    .events()
                    .count_many(ExchangeEvent::Success, from_page.nr_pages() as u64);
                machine
                    .events()
                    .count_many(ExchangeEvent::Success, to_page.nr_pages() as u64);
            }
            PairDisposition::Attempted(Err(err)) => {
                failed += 1;
                debug!("exchange pair failed: {}", err);
                dump_page(&from_page, "from_page");
                dump_page(&to_page, "to_page");
                machine.events().count(ExchangeEvent::Fail);
            }
        }

        dec_isolated(machine, &from_page);
        machine.putback_lru_page(&from_page);

        dec_isolated(machine, &to_page);
        machine.putback_lru_page(&to_page);
    }

    failed
}


/// Exchange a single pair. `page1` arrives with the caller's extra
/// reference (count 2) and `page2` with its mapping reference only
/// (count 1); both must be LRU-resident.
pub fn exchange_two_pages(
    machine: &Machine,
    page1: &Arc<PhysicalPage>,
    page2: &Arc<PhysicalPage>,
    mode: MigrateMode,
) -> Result<()> {
    if !(page1.flags().lru() && page2.flags().lru()) {
        return Err(Error::busy("both pages must be lru resident"));
    }

    if page1.page_count() != 2 || page2.page_count() != 1 {
        return Err(Error::busy("unexpected reference counts on the pair"));
    }

    let mut pagevec_flushed = false;

    // `page1` arrives with the caller's extra reference, which this path
    // consumes: after isolation both pages carry exactly their mapping
    // reference plus the isolation reference.
    loop {
        if !page1.get_page_unless_zero() {
            return Err(Error::busy("page died before isolation"));
        }
        match machine.isolate_lru_page(page1) {
            Ok(()) => {
                machine.put_page(page1); // get_page_unless_zero()
                machine.put_page(page1); // the caller's reference
                break;
            }
            Err(err) => {
                machine.put_page(page1);
                if !pagevec_flushed {
                    machine.migrate_prep();
                    pagevec_flushed = true;
                    continue;
                }
                return Err(err);
            }
        }
    }
    inc_isolated(machine, page1);

    loop {
        if !page2.get_page_unless_zero() {
            dec_isolated(machine, page1);
            page1.get_page();
            machine.putback_lru_page(page1);
            return Err(Error::busy("victim died before isolation"));
        }
        match machine.isolate_lru_page(page2) {
            Ok(()) => {
                machine.put_page(page2);
                break;
            }
            Err(err) => {
                machine.put_page(page2);
                if !pagevec_flushed {
                    machine.migrate_prep();
                    pagevec_flushed = true;
                    continue;
                }
                dec_isolated(machine, page1);
                page1.get_page();
                machine.putback_lru_page(page1);
                return Err(err);
            }
        }
    }
    inc_isolated(machine, page2);

    let pair = ExchangePair::new(Arc::clone(page1), Arc::clone(page2));

    if mode.has_concur() {
        exchange_pages_concur(machine, vec![pair], mode)
    } else {
        match exchange_pages(machine, vec![pair], mode) {
            0 => Ok(()),
            _ => Err(Error::busy("pair exchange failed")),
        }
    }
}


const DEFERRED_SCAN_LIMIT: usize = 16;


/// The promotion-fallback driver: find a cold victim on the destination
/// node whose last accessor lives on the source node, and exchange it with
/// the incoming hot page. Returns whether the exchange happened.
///
/// For a transparent huge `page` the caller must hold the page lock; it is
/// dropped across the exchange and re-taken on failure.
pub fn try_exchange_page(
    machine: &Machine,
    page: &Arc<PhysicalPage>,
    dst_nid: usize,
) -> bool {
    if !machine.config().mode().contains(BalanceMode::EXCHANGE) {
        return false;
    }

    let src_nid = page.nid();
    let node = machine.node(dst_nid);
    let mut mode = MigrateMode::SYNC;

    let mut dst_page: Option<Arc<PhysicalPage>> = None;
    let mut scan = 0usize;

    {
        let mut lists = node.lists();

        if lists.deferred.is_empty() {
            machine.events().count(ExchangeEvent::ListEmptyFail);
            return false;
        }

        if !machine.info().slot(page.pfn()).trylock_busy() {
            return false;
        }

        let mut i = 0;
        while i < lists.deferred.len() {
            if scan > DEFERRED_SCAN_LIMIT {
                break;
            }

            let entry = lists.deferred[i];
            let slot = machine.info().slot(entry);
            let candidate = machine.pfn_to_page(slot.pfn());

            let candidate = match candidate {
                None => {
                    // The entry went stale under us; scrub it.
                    machine.events().count(ExchangeEvent::NoPageFail);
                    debug!("exch: stale entry pfn:{},last_cpu:{}", slot.pfn(), slot.last_cpu());
                    slot.clear_deferred();
                    slot.unlock_busy();
                    node.stats.modify(NodeStatItem::Deferred, -1);
                    lists.deferred.remove(i);
                    machine.events().count(ExchangeEvent::PageSkipped);
                    scan += 1;
                    continue;
                }
                Some(page) => page,
            };

            let last_nid = machine.cpu_to_node(slot.last_cpu());

            if last_nid == Some(src_nid) {
                if page.is_trans_huge() != candidate.is_trans_huge()
                    || !candidate.flags().lru()
                {
                    machine.events().count(ExchangeEvent::PageSkipped);
                    scan += 1;
                    i += 1;
                    continue;
                }

                if !machine.info().slot(candidate.pfn()).trylock_busy() {
                    machine.events().count(ExchangeEvent::BusyFail);
                    machine.events().count(ExchangeEvent::PageSkipped);
                    scan += 1;
                    i += 1;
                    continue;
                }

                del_page_from_lists_locked(machine, &mut lists, &candidate);
                dst_page = Some(candidate);
                break;
            }

            // Wrong source node: rotate to the tail and keep scanning.
            let entry = lists.deferred.remove(i).expect("deferred entry vanished");
            lists.deferred.push_back(entry);
            machine.events().count(ExchangeEvent::NodeUnmatchFail);
            machine.events().count(ExchangeEvent::PageSkipped);
            scan += 1;
        }
    }

    if scan > DEFERRED_SCAN_LIMIT {
        machine.events().count(ExchangeEvent::ScanFail);
        machine.info().slot(page.pfn()).unlock_busy();
        return false;
    }

    let dst_page = match dst_page {
        Some(page) => page,
        None => {
            machine.info().slot(page.pfn()).unlock_busy();
            return false;
        }
    };

    if page.is_trans_huge() && dst_page.is_trans_huge() {
        mode = mode | MigrateMode::MT;
        page.lock().unlock();
    }

    match exchange_two_pages(machine, page, &dst_page, mode) {
        Ok(()) => {
            machine.info().slot(page.pfn()).unlock_busy();
            machine.info().slot(dst_page.pfn()).unlock_busy();
            true
        }
        Err(err) => {
            debug!("try_exchange_page: {}", err);
            if page.is_trans_huge() {
                page.lock().lock();
            }
            machine.info().slot(dst_page.pfn()).unlock_busy();
            machine.info().slot(page.pfn()).unlock_busy();
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        balancing::{
            add_page_for_exchange,
            add_page_for_tracking,
            mod_page_access_level,
            set_page_last_cpu,
        },
        frames::PAGE_SIZE,
        node::MachineSpec,
        rmap::Vma,
    };

    fn machine() -> Arc<Machine> {
        let machine = Machine::new(MachineSpec::two_tier(1, 1, 2, 64)).unwrap();
        machine.config().set_skip_lower_tier(0).unwrap();
        machine
    }

    fn mapped_anon_page(
        machine: &Arc<Machine>,
        nid: usize,
        vaddr: u64,
    ) -> (Arc<PhysicalPage>, Arc<Vma>) {
        let anon_vma = machine.new_anon_vma();
        let vma = Vma::new_anon(vaddr, 4, &anon_vma);
        let page = machine.alloc_page(nid, 0).unwrap();
        machine
            .map_anon_page(&page, &vma, vaddr / PAGE_SIZE as u64)
            .unwrap();
        machine.add_to_lru(&page);
        (page, vma)
    }

    #[test]
    fn anon_anon_exchange_swaps_contents_and_bindings() {
        let machine = machine();
        let (from, from_vma) = mapped_anon_page(&machine, 1, 0x400000);
        let (to, to_vma) = mapped_anon_page(&machine, 0, 0x500000);
        from.fill(0xAA);
        to.fill(0xBB);

        let from_pfn = from.pfn();
        let to_pfn = to.pfn();
        let from_index = from.index();
        let to_index = to.index();

        // The promotion path brings its own reference on the hot page.
        from.get_page();

        exchange_two_pages(&machine, &from, &to, MigrateMode::SYNC).unwrap();

        // The virtual ranges kept their addresses but crossed frames.
        let bytes = machine.read_virtual(&from_vma, 0x400000, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xBB));
        let bytes = machine.read_virtual(&to_vma, 0x500000, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xAA));

        assert_eq!(from_vma.resolve(0x400000), Some(to_pfn));
        assert_eq!(to_vma.resolve(0x500000), Some(from_pfn));

        // Identities swapped with them.
        assert_eq!(from.index(), to_index);
        assert_eq!(to.index(), from_index);

        // Mapping references and map counts are conserved.
        assert_eq!(from.page_count(), 1);
        assert_eq!(to.page_count(), 1);
        assert_eq!(from.mapcount(), 1);
        assert_eq!(to.mapcount(), 1);

        assert!(from.flags().lru());
        assert!(to.flags().lru());
        assert!(!from.lock().is_locked());
        assert!(!to.lock().is_locked());

        assert_eq!(machine.events().read(ExchangeEvent::Success), 2);
        assert_eq!(machine.events().read(ExchangeEvent::Fail), 0);
    }

    #[test]
    fn exchange_failing_early_is_a_no_op_on_bindings() {
        let machine = machine();
        let (from, from_vma) = mapped_anon_page(&machine, 1, 0x400000);
        let (to, to_vma) = mapped_anon_page(&machine, 0, 0x500000);
        from.fill(0x11);
        to.fill(0x22);

        to.set_writeback();
        from.get_page();

        let err = exchange_two_pages(&machine, &from, &to, MigrateMode::ASYNC).unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));

        assert_eq!(from_vma.resolve(0x400000), Some(from.pfn()));
        assert_eq!(to_vma.resolve(0x500000), Some(to.pfn()));
        assert!(machine
            .read_virtual(&from_vma, 0x400000, PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|&b| b == 0x11));
        assert!(to.flags().writeback());
        assert!(from.flags().lru());
        assert!(to.flags().lru());
        assert_eq!(from.mapcount(), 1);
        assert_eq!(to.mapcount(), 1);

        assert_eq!(machine.events().read(ExchangeEvent::Fail), 1);
        assert_eq!(machine.events().read(ExchangeEvent::Success), 0);
    }

    #[test]
    fn sync_mode_waits_out_writeback() {
        let machine = machine();
        let (from, _from_vma) = mapped_anon_page(&machine, 1, 0x400000);
        let (to, to_vma) = mapped_anon_page(&machine, 0, 0x500000);
        from.fill(0x33);
        to.fill(0x44);
        to.set_writeback();
        from.get_page();

        let from_pfn = from.pfn();
        let waiter = {
            let machine = Arc::clone(&machine);
            let from = Arc::clone(&from);
            let to = Arc::clone(&to);
            std::thread::spawn(move || exchange_two_pages(&machine, &from, &to, MigrateMode::SYNC))
        };

        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(!waiter.is_finished());
        to.end_writeback();

        waiter.join().unwrap().unwrap();
        assert_eq!(to_vma.resolve(0x500000), Some(from_pfn));
    }

    #[test]
    fn compound_order_mismatch_is_rejected_before_unmap() {
        let machine = machine();

        let anon_vma = machine.new_anon_vma();
        let huge_vma = Vma::new_anon(0x600000, 4, &anon_vma);
        let huge = machine.alloc_page(1, 1).unwrap();
        machine.map_anon_page(&huge, &huge_vma, 0x600).unwrap();
        machine.add_to_lru(&huge);
        huge.fill(0x55);

        let (base, base_vma) = mapped_anon_page(&machine, 0, 0x500000);
        base.fill(0x66);

        huge.get_page();
        let err = exchange_two_pages(&machine, &huge, &base, MigrateMode::SYNC).unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));

        assert!(huge.flags().lru());
        assert!(base.flags().lru());
        assert_eq!(huge_vma.resolve(0x600000), Some(huge.pfn()));
        assert_eq!(base_vma.resolve(0x500000), Some(base.pfn()));
        assert!(huge.snapshot_bytes().iter().all(|&b| b == 0x55));
        assert!(base.snapshot_bytes().iter().all(|&b| b == 0x66));

        // Incompatible pairs are refused without entering the kernel.
        assert_eq!(machine.events().read(ExchangeEvent::Fail), 0);
        assert_eq!(machine.events().read(ExchangeEvent::Success), 0);
    }

    #[test]
    fn hugetlb_pages_are_never_exchanged() {
        let machine = machine();

        let anon_vma = machine.new_anon_vma();
        let vma_a = Vma::new_anon(0x600000, 4, &anon_vma);
        let a = machine.alloc_hugetlb_page(1, 1).unwrap();
        machine.map_anon_page(&a, &vma_a, 0x600).unwrap();
        machine.add_to_lru(&a);

        let vma_b = Vma::new_anon(0x700000, 4, &anon_vma);
        let b = machine.alloc_hugetlb_page(0, 1).unwrap();
        machine.map_anon_page(&b, &vma_b, 0x700).unwrap();
        machine.add_to_lru(&b);

        a.get_page();
        assert!(exchange_two_pages(&machine, &a, &b, MigrateMode::SYNC).is_err());
        assert!(a.flags().lru());
        assert!(b.flags().lru());
    }

    #[test]
    fn promotion_fallback_exchanges_with_a_deferred_victim() {
        let machine = machine();
        let bottom_cpu = machine.node(1).cpus()[0] as i32;

        // A cold page resident on the full top node, last touched from the
        // bottom node, elected as an exchange victim.
        let (victim, victim_vma) = mapped_anon_page(&machine, 0, 0x500000);
        victim.fill(0xCC);
        set_page_last_cpu(&machine, &victim, bottom_cpu);
        let prev = mod_page_access_level(&machine, &victim, false);
        add_page_for_tracking(&machine, &victim, prev);
        add_page_for_exchange(&machine, &victim, 0);
        assert_eq!(machine.node(0).stats.read(NodeStatItem::Deferred), 1);

        // The hot page below wants to come up.
        let (hot, hot_vma) = mapped_anon_page(&machine, 1, 0x400000);
        hot.fill(0xDD);
        let hot_pfn = hot.pfn();
        let victim_pfn = victim.pfn();

        hot.get_page();
        assert!(try_exchange_page(&machine, &hot, 0));

        // The hot range now resides on the top node, the cold range below.
        assert_eq!(hot_vma.resolve(0x400000), Some(victim_pfn));
        assert!(machine.node(0).contains_pfn(victim_pfn));
        assert_eq!(victim_vma.resolve(0x500000), Some(hot_pfn));
        assert!(machine.node(1).contains_pfn(hot_pfn));

        let bytes = machine.read_virtual(&hot_vma, 0x400000, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xDD));
        let bytes = machine.read_virtual(&victim_vma, 0x500000, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xCC));

        // The victim left the deferred list and both busy locks dropped.
        assert_eq!(machine.node(0).stats.read(NodeStatItem::Deferred), 0);
        assert!(machine.node(0).lists().deferred.is_empty());
        assert!(!machine.info().slot(hot_pfn).busy());
        assert!(!machine.info().slot(victim_pfn).busy());

        assert_eq!(machine.events().read(ExchangeEvent::Success), 2);
    }

    #[test]
    fn deferred_scan_gives_up_after_seventeen_entries() {
        let machine = machine();
        let top_cpu = machine.node(0).cpus()[0] as i32;

        // Twenty deferred entries, none of them matching the source node.
        for i in 0..20 {
            let (page, _vma) = mapped_anon_page(&machine, 0, 0x10_0000 * (i + 1));
            set_page_last_cpu(&machine, &page, top_cpu);
            add_page_for_exchange(&machine, &page, 0);
        }
        assert_eq!(machine.node(0).lists().deferred.len(), 20);

        let (hot, _hot_vma) = mapped_anon_page(&machine, 1, 0x400000);
        hot.get_page();

        assert!(!try_exchange_page(&machine, &hot, 0));

        assert_eq!(machine.events().read(ExchangeEvent::ScanFail), 1);
        assert_eq!(machine.events().read(ExchangeEvent::PageSkipped), 17);
        assert_eq!(machine.events().read(ExchangeEvent::NodeUnmatchFail), 17);
        assert_eq!(machine.node(0).lists().deferred.len(), 20);
        assert!(!machine.info().slot(hot.pfn()).busy());
        // The incoming page keeps the caller's reference on this path.
        assert_eq!(hot.page_count(), 2);
    }

    #[test]
    fn empty_deferred_list_fails_fast() {
        let machine = machine();
        let (hot, _vma) = mapped_anon_page(&machine, 1, 0x400000);
        hot.get_page();

        assert!(!try_exchange_page(&machine, &hot, 0));
        assert_eq!(machine.events().read(ExchangeEvent::ListEmptyFail), 1);
        assert!(!machine.info().slot(hot.pfn()).busy());
    }

    #[test]
    fn stale_deferred_entries_are_scrubbed() {
        let machine = machine();
        let bottom_cpu = machine.node(1).cpus()[0] as i32;

        let (victim, _victim_vma) = mapped_anon_page(&machine, 0, 0x600000);
        victim.fill(0xEE);
        set_page_last_cpu(&machine, &victim, bottom_cpu);
        add_page_for_exchange(&machine, &victim, 0);

        // A later election lands ahead of the victim, then goes stale: the
        // info back-pointer is cleared, leaving a dangling list entry the
        // scan meets first.
        let (stale, _stale_vma) = mapped_anon_page(&machine, 0, 0x500000);
        add_page_for_exchange(&machine, &stale, 0);
        machine.info().slot(stale.pfn()).clear_info();

        let (hot, hot_vma) = mapped_anon_page(&machine, 1, 0x400000);
        hot.fill(0xFF);
        let victim_pfn = victim.pfn();
        hot.get_page();

        assert!(try_exchange_page(&machine, &hot, 0));
        assert_eq!(machine.events().read(ExchangeEvent::NoPageFail), 1);
        assert_eq!(hot_vma.resolve(0x400000), Some(victim_pfn));
        assert!(machine.node(0).lists().deferred.is_empty());
    }

    #[test]
    fn anon_to_file_exchange_repoints_the_tree_slot() {
        let machine = machine();

        let (from, from_vma) = mapped_anon_page(&machine, 1, 0x400000);
        from.fill(0xA1);

        let mapping = machine.new_address_space(MigrateOps::Fallback, false);
        let file_vma = Vma::new_file(0x700000, 4, 0, &mapping);
        let to = machine.alloc_page(0, 0).unwrap();
        machine.map_file_page(&to, &mapping, &file_vma, 2).unwrap();
        machine.add_to_lru(&to);
        to.fill(0xB2);

        let from_pfn = from.pfn();
        let to_pfn = to.pfn();
        let file_vaddr = file_vma.address_of_index(2);

        machine.isolate_lru_page(&from).unwrap();
        inc_isolated(&machine, &from);
        machine.isolate_lru_page(&to).unwrap();
        inc_isolated(&machine, &to);

        let pair = ExchangePair::new(Arc::clone(&from), Arc::clone(&to));
        assert_eq!(exchange_pages(&machine, vec![pair], MigrateMode::SYNC), 0);

        // The tree slot and the file page table now serve the incoming
        // frame; the anonymous range took the old file frame.
        assert_eq!(mapping.tree_lock().get(&2).copied(), Some(from_pfn));
        assert_eq!(file_vma.resolve(file_vaddr), Some(from_pfn));
        assert_eq!(from_vma.resolve(0x400000), Some(to_pfn));

        let bytes = machine.read_virtual(&file_vma, file_vaddr, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xB2));
        let bytes = machine.read_virtual(&from_vma, 0x400000, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xA1));

        // Identities crossed over: the old anon page is the file page now.
        assert!(from.mapping_file().is_some());
        assert!(!from.flags().swapbacked());
        assert!(to.is_anon());
        assert!(to.flags().swapbacked());
        assert_eq!(from.page_count(), 2);
        assert_eq!(to.page_count(), 1);

        // File-cache accounting moved across nodes with the identity.
        assert_eq!(machine.node(0).stats.read(NodeStatItem::FilePages), 0);
        assert_eq!(machine.node(1).stats.read(NodeStatItem::FilePages), 1);
    }

    #[test]
    fn trans_huge_pair_exchanges_every_base_page() {
        let machine = machine();

        let anon_vma = machine.new_anon_vma();
        let from_vma = Vma::new_anon(0x600000, 4, &anon_vma);
        let from = machine.alloc_page(1, 1).unwrap();
        machine.map_anon_page(&from, &from_vma, 0x600).unwrap();
        machine.add_to_lru(&from);
        from.fill(0xAB);

        let to_vma = Vma::new_anon(0x800000, 4, &anon_vma);
        let to = machine.alloc_page(0, 1).unwrap();
        machine.map_anon_page(&to, &to_vma, 0x800).unwrap();
        machine.add_to_lru(&to);
        to.fill(0xCD);

        from.get_page();
        exchange_two_pages(&machine, &from, &to, MigrateMode::SYNC).unwrap();

        // Both base pages of each side crossed frames and bindings.
        for k in 0..2u64 {
            let vaddr = from_vma.address_of_index(0x600 + k);
            assert_eq!(from_vma.resolve(vaddr), Some(to.pfn().offset(k)));
            let vaddr = to_vma.address_of_index(0x800 + k);
            assert_eq!(to_vma.resolve(vaddr), Some(from.pfn().offset(k)));
        }
        let bytes = machine
            .read_virtual(&from_vma, 0x600000, 2 * PAGE_SIZE)
            .unwrap();
        assert!(bytes.iter().all(|&b| b == 0xAB));
        let bytes = machine
            .read_virtual(&to_vma, 0x800000, 2 * PAGE_SIZE)
            .unwrap();
        assert!(bytes.iter().all(|&b| b == 0xCD));

        // Success is counted in base pages on both sides.
        assert_eq!(machine.events().read(ExchangeEvent::Success), 4);
    }

    #[test]
    fn buffer_backed_file_page_hands_its_buffers_over() {
        let machine = machine();

        let (from, from_vma) = mapped_anon_page(&machine, 1, 0x400000);
        from.fill(0x5A);

        let mapping = machine.new_address_space(MigrateOps::Buffer, false);
        let file_vma = Vma::new_file(0x700000, 4, 0, &mapping);
        let to = machine.alloc_page(0, 0).unwrap();
        machine.map_file_page(&to, &mapping, &file_vma, 3).unwrap();
        machine.add_to_lru(&to);
        to.fill(0xE7);
        let heads = crate::rmap::BufferHeads::new(to.pfn());
        to.attach_buffers(Arc::clone(&heads));
        to.get_page(); // the buffers' reference

        machine.isolate_lru_page(&from).unwrap();
        inc_isolated(&machine, &from);
        machine.isolate_lru_page(&to).unwrap();
        inc_isolated(&machine, &to);

        let pair = ExchangePair::new(Arc::clone(&from), Arc::clone(&to));
        assert_eq!(exchange_pages(&machine, vec![pair], MigrateMode::SYNC), 0);

        // The buffers, the private bit and the tree slot all follow the
        // file identity onto the incoming frame.
        assert_eq!(heads.holder(), from.pfn());
        assert!(!heads.is_locked());
        assert!(from.page_has_private());
        assert!(from.has_buffers());
        assert!(!to.page_has_private());
        assert!(!to.has_buffers());
        assert_eq!(mapping.tree_lock().get(&3).copied(), Some(from.pfn()));

        let file_vaddr = file_vma.address_of_index(3);
        let bytes = machine.read_virtual(&file_vma, file_vaddr, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xE7));
        let bytes = machine.read_virtual(&from_vma, 0x400000, PAGE_SIZE).unwrap();
        assert!(bytes.iter().all(|&b| b == 0x5A));

        // cache + pte + buffers on the file side, pte only on the other.
        assert_eq!(from.page_count(), 3);
        assert_eq!(to.page_count(), 1);
    }

    #[test]
    fn dirty_fallback_file_page_is_refused_outside_sync() {
        let machine = machine();

        let (from, _from_vma) = mapped_anon_page(&machine, 1, 0x400000);

        let mapping = machine.new_address_space(MigrateOps::Fallback, true);
        let file_vma = Vma::new_file(0x700000, 4, 0, &mapping);
        let to = machine.alloc_page(0, 0).unwrap();
        machine.map_file_page(&to, &mapping, &file_vma, 0).unwrap();
        machine.add_to_lru(&to);
        to.flags().set_dirty();

        machine.isolate_lru_page(&from).unwrap();
        inc_isolated(&machine, &from);
        machine.isolate_lru_page(&to).unwrap();
        inc_isolated(&machine, &to);

        let pair = ExchangePair::new(Arc::clone(&from), Arc::clone(&to));
        assert_eq!(exchange_pages(&machine, vec![pair], MigrateMode::SYNC_LIGHT), 1);

        assert!(to.flags().dirty());
        assert!(to.mapping_file().is_some());
        assert!(from.flags().lru());
        assert!(to.flags().lru());
        assert_eq!(machine.events().read(ExchangeEvent::Fail), 1);
    }
}

//! Concurrent batched exchange.
//!
//! A list of pairs moves through four phases: every pair is unmapped, then
//! every surviving pair has its mapping identity swapped, then one bulk
//! call swaps all contents across the copy workers, and finally the page
//! tables are rebuilt and the pages put back. Pairs the pipeline cannot
//! take (huge pages, file-backed participants) are set aside and replayed
//! through the serial kernel.
use std::{
    sync::Arc,
    thread,
};

use crate::{
    deps::log::debug,
    config::MigrateMode,
    error::{
        Error,
        Result,
    },
    events::ExchangeEvent,
    exchange::{
        dec_isolated,
        dump_page,
        exchange_mapping_swap,
        exchange_page_flags,
        exchange_pages,
        ExchangePair,
    },
    exchange_page::{
        exchange_base_page,
        exchange_huge_page,
        exchange_page_lists_multithread,
    },
    node::Machine,
    page::PhysicalPage,
    rmap::{
        page_get_anon_vma,
        put_anon_vma,
        remove_migration_ptes,
        try_to_free_buffers,
        try_to_unmap,
    },
};


/// Phase U for one pair: both pages locked, anon anchors pinned, both
/// sides unmapped behind migration entries. On error everything taken so
/// far has been dropped again.
fn unmap_pair_concur(
    pair: &mut ExchangePair,
    mode: MigrateMode,
) -> Result<()> {
    let from_page = pair.from_page.clone().expect("pair lost its from page");
    let to_page = pair.to_page.clone().expect("pair lost its to page");

    pair.from_index = from_page.index();
    pair.to_index = to_page.index();

    if !from_page.lock().try_lock() {
        if mode.is_async() {
            return Err(Error::again("from page lock is contended"));
        }
        from_page.lock().lock();
    }

    if from_page.flags().writeback() {
        from_page.lock().unlock();
        return Err(Error::fault("from page under writeback in concurrent unmap"));
    }

    if from_page.is_anon() && !from_page.is_ksm() {
        pair.from_anon_vma = page_get_anon_vma(&from_page);
    }

    if !to_page.lock().try_lock() {
        if mode.is_async() {
            if let Some(av) = pair.from_anon_vma.take() {
                put_anon_vma(&av);
            }
            from_page.lock().unlock();
            return Err(Error::again("to page lock is contended"));
        }
        to_page.lock().lock();
    }

    if to_page.flags().writeback() {
        to_page.lock().unlock();
        if let Some(av) = pair.from_anon_vma.take() {
            put_anon_vma(&av);
        }
        from_page.lock().unlock();
        return Err(Error::fault("to page under writeback in concurrent unmap"));
    }

    if to_page.is_anon() && !to_page.is_ksm() {
        pair.to_anon_vma = page_get_anon_vma(&to_page);
    }

    let mut aborted = false;

    if from_page.root().is_none() {
        debug_assert!(!from_page.is_anon());
        if from_page.page_has_private() {
            try_to_free_buffers(&from_page);
            aborted = true;
        }
    } else if from_page.page_mapped() {
        try_to_unmap(&from_page);
        pair.from_was_mapped = true;
    }

    if !aborted {
        if to_page.root().is_none() {
            debug_assert!(!to_page.is_anon());
            if to_page.page_has_private() {
                try_to_free_buffers(&to_page);
                aborted = true;
            }
        } else if to_page.page_mapped() {
            try_to_unmap(&to_page);
            pair.to_was_mapped = true;
        }
    }

    if aborted {
        restore_pair_ptes(pair, &from_page, &to_page);
        if let Some(av) = pair.to_anon_vma.take() {
            put_anon_vma(&av);
        }
        to_page.lock().unlock();
        if let Some(av) = pair.from_anon_vma.take() {
            put_anon_vma(&av);
        }
        from_page.lock().unlock();
        return Err(Error::again("orphaned fs-private metadata was freed"));
    }

    Ok(())
}


/// Puts any migration entries this pair installed back to present ones;
/// used when a pair leaves the pipeline before the mapping swap.
fn restore_pair_ptes(
    pair: &mut ExchangePair,
    from_page: &Arc<PhysicalPage>,
    to_page: &Arc<PhysicalPage>,
) {
    if pair.from_was_mapped {
        remove_migration_ptes(from_page, from_page);
        pair.from_was_mapped = false;
    }
    if pair.to_was_mapped {
        remove_migration_ptes(to_page, to_page);
        pair.to_was_mapped = false;
    }
}


/// Phase M: swap the mapping identity of every unmapped pair. The
/// concurrent pipeline only carries anonymous pairs, so the swap never
/// touches a mapping tree. A pair that fails here is completely unwound.
fn exchange_page_mapping_concur(
    machine: &Machine,
    unmapped: Vec<ExchangePair>,
    mode: MigrateMode,
) -> (Vec<ExchangePair>, usize) {
    let mut survivors = Vec::with_capacity(unmapped.len());
    let mut nr_failed = 0;

    for mut pair in unmapped {
        let from_page = pair.from_page.clone().expect("pair lost its from page");
        let to_page = pair.to_page.clone().expect("pair lost its to page");

        debug_assert!(from_page.lock().is_locked());
        debug_assert!(to_page.lock().is_locked());
        debug_assert!(from_page.mapping_file().is_none());
        debug_assert!(to_page.mapping_file().is_none());
        debug_assert!(!from_page.flags().writeback());
        debug_assert!(!to_page.flags().writeback());

        let rc = if !from_page.page_mapped() && !to_page.page_mapped() {
            exchange_mapping_swap(machine, &to_page, &from_page, None, mode, 0, 0)
        } else {
            Err(Error::busy("pair is still mapped"))
        };

        match rc {
            Ok(()) => survivors.push(pair),
            Err(err) => {
                debug!("concurrent mapping swap failed: {}", err);
                restore_pair_ptes(&mut pair, &from_page, &to_page);

                if let Some(av) = pair.from_anon_vma.take() {
                    put_anon_vma(&av);
                }
                from_page.lock().unlock();
                if let Some(av) = pair.to_anon_vma.take() {
                    put_anon_vma(&av);
                }
                to_page.lock().unlock();

                dec_isolated(machine, &from_page);
                machine.putback_lru_page(&from_page);
                dec_isolated(machine, &to_page);
                machine.putback_lru_page(&to_page);

                pair.from_page = None;
                pair.to_page = None;
                nr_failed += 1;
            }
        }
    }

    (survivors, nr_failed)
}


/// Phase D: one bulk content swap over all surviving pairs, falling back
/// to per-pair serial swaps, then the flag transfer.
fn exchange_page_data_concur(
    machine: &Machine,
    unmapped: &[ExchangePair],
    mode: MigrateMode,
) {
    if unmapped.is_empty() {
        return;
    }

    let from_list: Vec<Arc<PhysicalPage>> = unmapped
        .iter()
        .map(|pair| pair.from_page.clone().expect("pair lost its from page"))
        .collect();
    let to_list: Vec<Arc<PhysicalPage>> = unmapped
        .iter()
        .map(|pair| pair.to_page.clone().expect("pair lost its to page"))
        .collect();

    let bulk = if mode.has_mt() {
        exchange_page_lists_multithread(machine, &to_list, &from_list)
    } else {
        Err(Error::busy("multithreaded copy not requested"))
    };

    if let Err(err) = bulk {
        debug!("bulk content swap unavailable ({}), swapping serially", err);
        for (to_page, from_page) in to_list.iter().zip(from_list.iter()) {
            if from_page.is_huge() || from_page.is_trans_huge() {
                exchange_huge_page(to_page, from_page);
            } else {
                exchange_base_page(to_page, from_page);
            }
        }
    }

    for (to_page, from_page) in to_list.iter().zip(from_list.iter()) {
        exchange_page_flags(machine, to_page, from_page);
    }
}


/// Phase R: rebuild the page tables of every pair, release the locks and
/// anchors, and put both pages back on their LRU lists.
fn remove_migration_ptes_concur(
    machine: &Machine,
    unmapped: Vec<ExchangePair>,
) {
    for mut pair in unmapped {
        let from_page = pair.from_page.take().expect("pair lost its from page");
        let to_page = pair.to_page.take().expect("pair lost its to page");

        let current = from_page.index();
        from_page.set_index(pair.from_index);
        if pair.from_was_mapped {
            remove_migration_ptes(&from_page, &to_page);
        }
        from_page.set_index(current);

        let current = to_page.index();
        to_page.set_index(pair.to_index);
        if pair.to_was_mapped {
            remove_migration_ptes(&to_page, &from_page);
        }
        to_page.set_index(current);

        dec_isolated(machine, &from_page);
        machine
            .events()
            .count_many(ExchangeEvent::Success, from_page.nr_pages() as u64);

        dec_isolated(machine, &to_page);
        machine
            .events()
            .count_many(ExchangeEvent::Success, to_page.nr_pages() as u64);

        if let Some(av) = pair.from_anon_vma.take() {
            put_anon_vma(&av);
        }
        from_page.lock().unlock();
        if let Some(av) = pair.to_anon_vma.take() {
            put_anon_vma(&av);
        }
        to_page.lock().unlock();

        machine.putback_lru_page(&from_page);
        machine.putback_lru_page(&to_page);
    }
}


/// The concurrent driver. Succeeds only when every pair was exchanged,
/// including the ones replayed through the serial path.
pub fn exchange_pages_concur(
    machine: &Machine,
    pairs: Vec<ExchangePair>,
    mode: MigrateMode,
) -> Result<()> {
    let mut serialized: Vec<ExchangePair> = Vec::new();
    let mut unmapped: Vec<ExchangePair> = Vec::new();
    let mut nr_failed = 0usize;

    for mut pair in pairs {
        thread::yield_now();

        let from_page = pair.from_page.clone().expect("pair lost its from page");
        let to_page = pair.to_page.clone().expect("pair lost its to page");

        // A participant freed under us is released, its partner put back.
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
            continue;
        }

        if to_page.page_count() == 1 {
            to_page.flags().clear_active();
            to_page.flags().clear_unevictable();
            dec_isolated(machine, &to_page);
            machine.put_page(&to_page);

            dec_isolated(machine, &from_page);
            machine.putback_lru_page(&from_page);
            continue;
        }

        // Huge pages and file-backed participants take the serial path.
        if from_page.is_huge()
            || to_page.is_huge()
            || from_page.mapping_file().is_some()
            || to_page.mapping_file().is_some()
        {
            serialized.push(pair);
            continue;
        }

        match unmap_pair_concur(&mut pair, mode) {
            Ok(()) => unmapped.push(pair),
            Err(err) if err.is_retriable() => {
                debug!("concurrent unmap gave up on a pair: {}", err);
                dump_page(&from_page, "concur unmap failed: from");
                dump_page(&to_page, "concur unmap failed: to");
                dec_isolated(machine, &from_page);
                machine.putback_lru_page(&from_page);
                dec_isolated(machine, &to_page);
                machine.putback_lru_page(&to_page);
                nr_failed += 1;
            }
            Err(err) => {
                debug!("pair left the concurrent pipeline: {}", err);
                serialized.push(pair);
                nr_failed += 1;
            }
        }
    }

    let (survivors, mapping_failed) = exchange_page_mapping_concur(machine, unmapped, mode);
    nr_failed += mapping_failed;

    exchange_page_data_concur(machine, &survivors, mode);

    remove_migration_ptes_concur(machine, survivors);

    nr_failed += exchange_pages(machine, serialized, mode);

    if nr_failed > 0 {
        Err(Error::fault("concurrent exchange left failed pairs"))
    } else {
        Ok(())
    }
}

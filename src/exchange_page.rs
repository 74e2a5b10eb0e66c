//! In-place content exchange.
//!
//! The data of two pages is swapped 64 bits at a time, either on the
//! calling thread or sliced across the destination node's copy workers.
use std::sync::{
    atomic::{
        AtomicU64,
        Ordering,
    },
    Arc,
};

use crate::{
    deps::log::debug,
    copy::{
        mt_fanout,
        Batch,
    },
    error::Error,
    frames::{
        FrameArena,
        MAX_ORDER_FRAMES,
        WORDS_PER_PAGE,
    },
    node::Machine,
    page::PhysicalPage,
};


/// Swaps two equally sized word slices lane by lane.
pub(crate) fn exchange_words(
    to: &[AtomicU64],
    from: &[AtomicU64],
) {
    debug_assert_eq!(to.len(), from.len());
    for (t, f) in to.iter().zip(from.iter()) {
        let tmp = f.load(Ordering::Relaxed);
        f.store(t.load(Ordering::Relaxed), Ordering::Relaxed);
        t.store(tmp, Ordering::Relaxed);
    }
}


fn exchange_chunk(
    arena: &Arc<FrameArena>,
    to_word: usize,
    from_word: usize,
    nr_words: usize,
) {
    exchange_words(
        arena.words_at(to_word, nr_words),
        arena.words_at(from_word, nr_words),
    );
}


/// Single-threaded swap of one base page.
pub fn exchange_base_page(
    to: &Arc<PhysicalPage>,
    from: &Arc<PhysicalPage>,
) {
    exchange_words(&to.data()[..WORDS_PER_PAGE], &from.data()[..WORDS_PER_PAGE]);
}


/// Single-threaded swap of a compound page, one base page at a time.
/// Gigantic pages are left untouched.
pub fn exchange_huge_page(
    to: &Arc<PhysicalPage>,
    from: &Arc<PhysicalPage>,
) {
    let nr_pages = from.nr_pages();
    if from.is_huge() && nr_pages > MAX_ORDER_FRAMES {
        return;
    }
    debug_assert!(from.is_huge() || from.is_trans_huge());

    for i in 0..nr_pages {
        let range = i * WORDS_PER_PAGE..(i + 1) * WORDS_PER_PAGE;
        exchange_words(&to.data()[range.clone()], &from.data()[range]);
    }
}


/// Swaps `nr_pages` base pages of content between `to` and `from` across
/// the destination node's copy workers. Chunks are disjoint so the workers
/// never contend.
pub fn exchange_page_multithread(
    machine: &Machine,
    to: &Arc<PhysicalPage>,
    from: &Arc<PhysicalPage>,
    nr_pages: usize,
) -> Result<(), Error> {
    let cpus = mt_fanout(machine, to.nid(), true)?;
    let total = cpus.len();

    let nr_words = WORDS_PER_PAGE * nr_pages;
    let chunk = nr_words / total;
    let to_base = to.pfn().as_usize() * WORDS_PER_PAGE;
    let from_base = from.pfn().as_usize() * WORDS_PER_PAGE;

    let batch = Batch::new();
    for (i, &cpu) in cpus.iter().enumerate() {
        // The last worker also takes the words an uneven split leaves over.
        let nr_words = if i == total - 1 { nr_words - i * chunk } else { chunk };
        let arena = Arc::clone(machine.arena());
        machine.pool().queue_work_on(cpu, &batch, move || {
            exchange_chunk(&arena, to_base + i * chunk, from_base + i * chunk, nr_words);
        });
    }
    batch.wait();

    debug!(
        "multithread exchange {:?} <-> {:?}: {} pages over {} workers",
        from.pfn(),
        to.pfn(),
        nr_pages,
        total,
    );
    Ok(())
}


/// Swaps the contents of a batch of page pairs.
///
/// With at least as many pairs as workers, whole pages are dealt out
/// round-robin. With fewer pairs than workers each page is cut into
/// `total / nr_items` chunks; any residual count above the nearest power
/// of two is peeled off through the single-pair path first so the chunk
/// arithmetic divides evenly.
pub fn exchange_page_lists_multithread(
    machine: &Machine,
    to: &[Arc<PhysicalPage>],
    from: &[Arc<PhysicalPage>],
) -> Result<(), Error> {
    debug_assert_eq!(to.len(), from.len());
    if to.is_empty() {
        return Ok(());
    }

    let cpus = mt_fanout(machine, to[0].nid(), false)?;
    let total = cpus.len();

    let mut to = to;
    let mut from = from;
    let mut nr_items = to.len();

    if nr_items < total {
        let rounded = prev_power_of_two(nr_items);
        let residual = nr_items - rounded;
        for i in 0..residual {
            debug_assert_eq!(to[i].nr_pages(), from[i].nr_pages());
            exchange_page_multithread(machine, &to[i], &from[i], to[i].nr_pages())?;
        }
        to = &to[residual..];
        from = &from[residual..];
        nr_items = rounded;
    }

    let batch = Batch::new();
    if nr_items < total {
        debug_assert_eq!(total % nr_items, 0);
        let mut cpu_idx = 0;

        for (to_page, from_page) in to.iter().zip(from.iter()) {
            debug_assert_eq!(to_page.nr_pages(), from_page.nr_pages());
            let nr_words = nr_items * WORDS_PER_PAGE * from_page.nr_pages() / total;
            debug_assert_eq!(WORDS_PER_PAGE * from_page.nr_pages() % total, 0);
            let to_base = to_page.pfn().as_usize() * WORDS_PER_PAGE;
            let from_base = from_page.pfn().as_usize() * WORDS_PER_PAGE;

            for i in 0..total / nr_items {
                let arena = Arc::clone(machine.arena());
                let cpu = cpus[cpu_idx];
                cpu_idx += 1;
                machine.pool().queue_work_on(cpu, &batch, move || {
                    exchange_chunk(
                        &arena,
                        to_base + i * nr_words,
                        from_base + i * nr_words,
                        nr_words,
                    );
                });
            }
        }
    } else {
        for (item, (to_page, from_page)) in to.iter().zip(from.iter()).enumerate() {
            debug_assert_eq!(to_page.nr_pages(), from_page.nr_pages());
            let nr_words = WORDS_PER_PAGE * from_page.nr_pages();
            let to_base = to_page.pfn().as_usize() * WORDS_PER_PAGE;
            let from_base = from_page.pfn().as_usize() * WORDS_PER_PAGE;

            let cpu = cpus[item % total];
            let arena = Arc::clone(machine.arena());
            machine.pool().queue_work_on(cpu, &batch, move || {
                exchange_chunk(&arena, to_base, from_base, nr_words);
            });
        }
    }

    batch.wait();
    Ok(())
}


fn prev_power_of_two(n: usize) -> usize {
    debug_assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MachineSpec;

    fn machine_with_cpus(cpus: usize) -> Arc<Machine> {
        Machine::new(MachineSpec::two_tier(1, 1, cpus, 128)).unwrap()
    }

    fn patterned(page: &Arc<PhysicalPage>, seed: u64) {
        for (i, word) in page.data().iter().enumerate() {
            word.store(seed.wrapping_mul(i as u64 + 1), Ordering::Relaxed);
        }
    }

    #[test]
    fn base_page_swap_moves_both_contents() {
        let machine = machine_with_cpus(2);
        let a = machine.alloc_page(0, 0).unwrap();
        let b = machine.alloc_page(1, 0).unwrap();
        a.fill(0xAA);
        b.fill(0xBB);

        exchange_base_page(&a, &b);

        assert!(a.snapshot_bytes().iter().all(|&x| x == 0xBB));
        assert!(b.snapshot_bytes().iter().all(|&x| x == 0xAA));
    }

    #[test]
    fn multithread_swap_matches_serial_swap() {
        let machine = machine_with_cpus(4);
        let a = machine.alloc_page(0, 2).unwrap();
        let b = machine.alloc_page(0, 2).unwrap();
        patterned(&a, 0x9E37_79B9);
        patterned(&b, 0x51_7C_C1B7);

        let a_before = a.snapshot_bytes();
        let b_before = b.snapshot_bytes();

        exchange_page_multithread(&machine, &a, &b, a.nr_pages()).unwrap();

        assert_eq!(a.snapshot_bytes(), b_before);
        assert_eq!(b.snapshot_bytes(), a_before);
    }

    #[test]
    fn list_swap_round_robin_regime() {
        let machine = machine_with_cpus(2);
        machine.config().set_limit_mt_num(2).unwrap();

        let mut to_pages = Vec::new();
        let mut from_pages = Vec::new();
        let mut before = Vec::new();
        for i in 0..5u64 {
            let to = machine.alloc_page(0, 0).unwrap();
            let from = machine.alloc_page(1, 0).unwrap();
            patterned(&to, 3 + i);
            patterned(&from, 101 + i);
            before.push((to.snapshot_bytes(), from.snapshot_bytes()));
            to_pages.push(to);
            from_pages.push(from);
        }

        exchange_page_lists_multithread(&machine, &to_pages, &from_pages).unwrap();

        for (i, (to_before, from_before)) in before.into_iter().enumerate() {
            assert_eq!(to_pages[i].snapshot_bytes(), from_before);
            assert_eq!(from_pages[i].snapshot_bytes(), to_before);
        }
    }

    #[test]
    fn list_swap_subpage_regime_with_residual() {
        let machine = machine_with_cpus(4);
        machine.config().set_limit_mt_num(4).unwrap();

        // Three pairs against four workers: one residual pair peeled off,
        // then two pairs split across the pool.
        let mut to_pages = Vec::new();
        let mut from_pages = Vec::new();
        let mut before = Vec::new();
        for i in 0..3u64 {
            let to = machine.alloc_page(0, 0).unwrap();
            let from = machine.alloc_page(1, 0).unwrap();
            patterned(&to, 7 + i);
            patterned(&from, 901 + i);
            before.push((to.snapshot_bytes(), from.snapshot_bytes()));
            to_pages.push(to);
            from_pages.push(from);
        }

        exchange_page_lists_multithread(&machine, &to_pages, &from_pages).unwrap();

        for (i, (to_before, from_before)) in before.into_iter().enumerate() {
            assert_eq!(to_pages[i].snapshot_bytes(), from_before);
            assert_eq!(from_pages[i].snapshot_bytes(), to_before);
        }
    }

    #[test]
    fn prev_power_of_two_rounds_down() {
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(2), 2);
        assert_eq!(prev_power_of_two(3), 2);
        assert_eq!(prev_power_of_two(5), 4);
        assert_eq!(prev_power_of_two(8), 8);
    }
}

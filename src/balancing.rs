//! Access tracking and placement policy.
//!
//! Pages are sampled into an 8-slot access history and bucketed on their
//! node's LAP lists by access level; cold candidates are elected onto the
//! deferred list, where the try-exchange scan looks for victims. The
//! node-selection helpers walk the same-tier migration ring looking for a
//! destination with headroom.
use std::sync::Arc;

use crate::{
    deps::log::debug,
    config::BalanceMode,
    node::{
        Machine,
        NodeLists,
        NodeStatItem,
    },
    page::{
        Pfn,
        PhysicalPage,
    },
};


fn trace_access_history(
    msg: &str,
    machine: &Machine,
    page: &PhysicalPage,
) {
    let slot = machine.info().slot(page.pfn());
    debug!(
        "{} pfn:[{:6x}],access:[{:08b}],lv:[{}],node:[{}],last_cpu[{}]",
        msg,
        page.pfn().get(),
        slot.access_bitmap(),
        slot.access_level(),
        page.nid(),
        slot.last_cpu(),
    );
}


/// Removes the page from whichever LAP list currently links it. Returns the
/// level it was found at.
fn remove_from_any_lap(
    lists: &mut NodeLists,
    pfn: Pfn,
    first_guess: usize,
) -> Option<usize> {
    let area = &mut lists.lap_area[first_guess];
    if let Some(pos) = area.list.iter().position(|&p| p == pfn) {
        area.list.remove(pos);
        return Some(first_guess);
    }
    for (level, area) in lists.lap_area.iter_mut().enumerate() {
        if let Some(pos) = area.list.iter().position(|&p| p == pfn) {
            area.list.remove(pos);
            return Some(level);
        }
    }
    None
}


/// Drops a page's list membership, whichever kind it is. Caller holds the
/// node's lru lock.
pub(crate) fn del_page_from_lists_locked(
    machine: &Machine,
    lists: &mut NodeLists,
    page: &PhysicalPage,
) {
    let slot = machine.info().slot(page.pfn());
    let stats = &machine.page_node(page).stats;

    if slot.tracked() {
        let level = slot.access_level() as usize;
        lists.lap_area[level].dec_nr_free();
        slot.clear_tracked();
        stats.modify(NodeStatItem::Tracked, -(page.nr_pages() as i64));
        remove_from_any_lap(lists, page.pfn(), level);
    } else if slot.deferred() {
        slot.clear_deferred();
        stats.modify(NodeStatItem::Deferred, -(page.nr_pages() as i64));
        lists.remove_from_deferred(page.pfn());
    }
}


pub fn del_page_from_deferred_list(
    machine: &Machine,
    page: &PhysicalPage,
) {
    let mode = machine.config().mode();
    if !mode.contains(BalanceMode::EXCHANGE) && !mode.contains(BalanceMode::OPM) {
        return;
    }

    let node = machine.page_node(page);
    let mut lists = node.lists();
    del_page_from_lists_locked(machine, &mut lists, page);
}


pub fn del_page_from_lap_list(
    machine: &Machine,
    page: &PhysicalPage,
) {
    del_page_from_deferred_list(machine, page);
}


/// Latest sampling interval result for a page; returns the access level
/// before the shift.
pub fn mod_page_access_level(
    machine: &Machine,
    page: &PhysicalPage,
    accessed: bool,
) -> u32 {
    machine.info().slot(page.pfn()).mod_access_level(accessed)
}


pub fn page_access_level(
    machine: &Machine,
    page: &PhysicalPage,
) -> Option<u32> {
    if !machine.config().mode().contains(BalanceMode::OPM) {
        return None;
    }
    Some(machine.info().slot(page.pfn()).access_level())
}


pub fn reset_page_access_level(
    machine: &Machine,
    page: &PhysicalPage,
) {
    if !machine.config().mode().contains(BalanceMode::OPM) {
        return;
    }
    machine.info().slot(page.pfn()).reset_access_level();
}


pub fn page_last_cpu(
    machine: &Machine,
    page: &PhysicalPage,
) -> i32 {
    machine.info().slot(page.pfn()).last_cpu()
}


pub fn set_page_last_cpu(
    machine: &Machine,
    page: &PhysicalPage,
    cpu: i32,
) {
    machine.info().slot(page.pfn()).set_last_cpu(cpu);
}


/// Access-history hand-off for ordinary copy-based migration: the history
/// follows the contents onto the replacement page.
pub fn copy_page_tracking(
    machine: &Machine,
    old: &PhysicalPage,
    new: &PhysicalPage,
) {
    let mode = machine.config().mode();
    if !mode.contains(BalanceMode::CPM) && !mode.contains(BalanceMode::OPM) {
        return;
    }

    machine.info().copy_info(old.pfn(), new.pfn());
    trace_access_history("migrate-old", machine, old);
    trace_access_history("migrate-new", machine, new);
}


pub fn page_demoted(
    machine: &Machine,
    page: &PhysicalPage,
) -> bool {
    machine.info().slot(page.pfn()).demoted()
}


pub fn set_page_demoted(
    machine: &Machine,
    page: &PhysicalPage,
) {
    if !machine.config().mode().contains(BalanceMode::OPM) {
        return;
    }
    machine.info().slot(page.pfn()).set_demoted();
}


pub fn clear_page_demoted(
    machine: &Machine,
    page: &PhysicalPage,
) {
    machine.info().slot(page.pfn()).clear_demoted();
}


/// Files a sampled page on its node's LAP list for its current access
/// level: at the tail when the newest sample saw an access, at the head
/// when it did not. `prev_level` is the level the caller observed before
/// the latest sample, used to migrate the free-slot accounting.
pub fn add_page_for_tracking(
    machine: &Machine,
    page: &Arc<PhysicalPage>,
    prev_level: u32,
) {
    if !machine.config().mode().contains(BalanceMode::OPM) {
        return;
    }

    if machine.config().skip_lower_tier() && machine.is_bottom_node(page.nid()) {
        // The lowest tier has nowhere colder to send pages; tracking them
        // buys nothing.
        return;
    }

    if machine.config().thp_enabled() && !page.is_trans_huge() {
        return;
    }

    if page.page_count() > 1 {
        return;
    }

    let node = machine.page_node(page);
    let mut lists = node.lists();

    let slot = machine.info().slot(page.pfn());
    let level = slot.access_level() as usize;

    if slot.busy() || slot.deferred() || !page.flags().lru() {
        return;
    }

    slot.set_pfn(page.pfn());
    let recent = slot.access_bitmap() & 0x1 == 0x1;

    if slot.tracked() {
        if level != prev_level as usize {
            lists.lap_area[prev_level as usize].dec_nr_free();
            lists.lap_area[level].nr_free += 1;
        }

        remove_from_any_lap(&mut lists, page.pfn(), prev_level as usize);
        if recent {
            lists.lap_area[level].list.push_back(page.pfn());
            trace_access_history("    accessed", machine, page);
        } else {
            lists.lap_area[level].list.push_front(page.pfn());
            trace_access_history("not_accessed", machine, page);
        }
    } else {
        slot.set_tracked();

        if recent {
            lists.lap_area[level].list.push_back(page.pfn());
            trace_access_history("    accessed", machine, page);
        } else {
            lists.lap_area[level].list.push_front(page.pfn());
            trace_access_history("not_accessed", machine, page);
        }

        node.stats.modify(NodeStatItem::Tracked, page.nr_pages() as i64);
        lists.lap_area[level].nr_free += 1;
    }
}


/// Elects a page as an exchange victim: off its LAP list, onto the head of
/// the node's deferred list.
pub fn add_page_for_exchange(
    machine: &Machine,
    page: &Arc<PhysicalPage>,
    dst_nid: usize,
) {
    if !machine.config().mode().contains(BalanceMode::EXCHANGE) {
        return;
    }

    debug_assert_eq!(page.nid(), dst_nid);
    let node = machine.node(dst_nid);

    {
        let mut lists = node.lists();
        let slot = machine.info().slot(page.pfn());

        if slot.deferred() || slot.busy() || !page.flags().lru() {
            return;
        }

        slot.set_pfn(page.pfn());

        if slot.tracked() {
            slot.clear_tracked();
            node.stats.modify(NodeStatItem::Tracked, -(page.nr_pages() as i64));
            slot.set_deferred();
            remove_from_any_lap(&mut lists, page.pfn(), slot.access_level() as usize);
            lists.deferred.push_front(page.pfn());
        } else {
            slot.set_deferred();
            lists.deferred.push_front(page.pfn());
        }
    }

    node.stats.modify(NodeStatItem::Deferred, page.nr_pages() as i64);
}


/// Walks the same-tier migration ring from `start`, returning the first
/// node with allocation headroom. With `hold` the start node itself is
/// probed first.
fn traverse_migratable_nodes(
    machine: &Machine,
    start: Option<usize>,
    order: u8,
    hold: bool,
) -> Option<usize> {
    let start = start?;
    let mut temp = if hold {
        start
    } else {
        machine.next_migration_node(start)?
    };

    loop {
        if machine.migrate_balanced(temp, order) {
            return Some(temp);
        }
        temp = machine.next_migration_node(temp)?;
        if temp == start {
            return None;
        }
    }
}


/// The best lower-tier node to demote this page to: the one local to its
/// last accessor, or the nearest ring member with room.
pub fn find_best_demotion_node(
    machine: &Machine,
    page: &PhysicalPage,
) -> Option<usize> {
    let order = page.compound_order();
    let page_nid = page.nid();

    let last_cpu = page_last_cpu(machine, page);
    let last_nid = if last_cpu < 0 {
        page_nid
    } else {
        machine.cpu_to_node(last_cpu)?
    };

    if !machine.is_top_node(page_nid) || !machine.is_top_node(last_nid) {
        return None;
    }

    let sub_nid = machine.next_demotion_node(last_nid);
    traverse_migratable_nodes(machine, sub_nid, order, true)
}


/// The best node to migrate this page to given a preferred target,
/// falling back to the source's own tier for remote promotions.
pub fn find_best_migration_node(
    machine: &Machine,
    page: &PhysicalPage,
    target_nid: usize,
) -> Option<usize> {
    let order = page.compound_order();
    let page_nid = page.nid();
    let first_nid = machine.next_promotion_node(page_nid);

    let dst_nid = traverse_migratable_nodes(machine, Some(target_nid), order, true);

    if dst_nid.is_none()
        && !machine.is_top_node(page_nid)
        && first_nid != Some(target_nid)
    {
        return traverse_migratable_nodes(machine, Some(page_nid), order, false);
    }

    dst_nid
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::MachineSpec,
        page_info::MAX_ACCESS_LEVEL,
    };

    fn machine() -> Arc<Machine> {
        let machine = Machine::new(MachineSpec::two_tier(2, 2, 1, 32)).unwrap();
        machine.config().set_skip_lower_tier(0).unwrap();
        machine
    }

    fn lru_page(machine: &Machine, nid: usize) -> Arc<PhysicalPage> {
        let page = machine.alloc_page(nid, 0).unwrap();
        machine.add_to_lru(&page);
        // Fresh frames start "always hot"; begin the history empty so the
        // tests steer it sample by sample.
        machine.info().slot(page.pfn()).set_access_bitmap(0);
        page
    }

    #[test]
    fn accessed_pages_go_to_the_tail_cold_pages_to_the_head() {
        let machine = machine();
        let hot = lru_page(&machine, 0);
        let cold = lru_page(&machine, 0);

        let prev = mod_page_access_level(&machine, &hot, true);
        add_page_for_tracking(&machine, &hot, prev);
        let prev = mod_page_access_level(&machine, &cold, false);
        add_page_for_tracking(&machine, &cold, prev);

        let lists = machine.node(0).lists();
        assert_eq!(lists.lap_area[1].list.back(), Some(&hot.pfn()));
        assert_eq!(lists.lap_area[0].list.front(), Some(&cold.pfn()));
        assert_eq!(lists.lap_area[1].nr_free, 1);
        assert_eq!(lists.lap_area[0].nr_free, 1);
    }

    #[test]
    fn level_change_moves_the_page_and_its_accounting() {
        let machine = machine();
        let page = lru_page(&machine, 0);

        let prev = mod_page_access_level(&machine, &page, true);
        add_page_for_tracking(&machine, &page, prev);
        assert_eq!(machine.node(0).lists().lap_area[1].nr_free, 1);

        let prev = mod_page_access_level(&machine, &page, true);
        add_page_for_tracking(&machine, &page, prev);

        let lists = machine.node(0).lists();
        assert_eq!(lists.lap_area[1].nr_free, 0);
        assert_eq!(lists.lap_area[2].nr_free, 1);
        assert!(lists.lap_area[1].list.is_empty());
        assert_eq!(lists.lap_area[2].list.back(), Some(&page.pfn()));
        assert_eq!(
            machine.node(0).stats.read(NodeStatItem::Tracked),
            1,
            "a moved page is still a single tracked page"
        );
    }

    #[test]
    fn bottom_tier_pages_are_skipped_unless_enabled() {
        let machine = Machine::new(MachineSpec::two_tier(1, 1, 1, 32)).unwrap();
        let page = lru_page(&machine, 1);

        let prev = mod_page_access_level(&machine, &page, true);
        add_page_for_tracking(&machine, &page, prev);
        assert!(!machine.info().slot(page.pfn()).tracked());

        machine.config().set_skip_lower_tier(0).unwrap();
        let prev = mod_page_access_level(&machine, &page, true);
        add_page_for_tracking(&machine, &page, prev);
        assert!(machine.info().slot(page.pfn()).tracked());
    }

    #[test]
    fn busy_or_referenced_pages_are_not_tracked() {
        let machine = machine();

        let pinned = lru_page(&machine, 0);
        pinned.get_page();
        add_page_for_tracking(&machine, &pinned, 0);
        assert!(!machine.info().slot(pinned.pfn()).tracked());
        machine.put_page(&pinned);

        let busy = lru_page(&machine, 0);
        assert!(machine.info().slot(busy.pfn()).trylock_busy());
        add_page_for_tracking(&machine, &busy, 0);
        assert!(!machine.info().slot(busy.pfn()).tracked());
    }

    #[test]
    fn election_moves_a_tracked_page_to_the_deferred_head() {
        let machine = machine();
        let first = lru_page(&machine, 0);
        let second = lru_page(&machine, 0);

        for page in [&first, &second] {
            let prev = mod_page_access_level(&machine, page, false);
            add_page_for_tracking(&machine, page, prev);
        }
        assert_eq!(machine.node(0).stats.read(NodeStatItem::Tracked), 2);

        add_page_for_exchange(&machine, &first, 0);
        add_page_for_exchange(&machine, &second, 0);

        let slot = machine.info().slot(first.pfn());
        assert!(slot.deferred());
        assert!(!slot.tracked());

        let lists = machine.node(0).lists();
        assert_eq!(lists.deferred.front(), Some(&second.pfn()));
        assert_eq!(lists.deferred.len(), 2);
        assert!(lists.lap_area.iter().all(|area| area.list.is_empty()));
        drop(lists);

        assert_eq!(machine.node(0).stats.read(NodeStatItem::Tracked), 0);
        assert_eq!(machine.node(0).stats.read(NodeStatItem::Deferred), 2);
    }

    #[test]
    fn migration_hands_the_access_history_to_the_new_page() {
        let machine = machine();
        let old = machine.alloc_page(0, 0).unwrap();
        let new = machine.alloc_page(1, 0).unwrap();
        machine.info().slot(old.pfn()).set_access_bitmap(0b0011_0101);
        machine.info().slot(new.pfn()).set_access_bitmap(0);

        copy_page_tracking(&machine, &old, &new);
        assert_eq!(machine.info().slot(new.pfn()).access_bitmap(), 0b0011_0101);

        machine.config().set_mode(BalanceMode::EXCHANGE);
        machine.info().slot(new.pfn()).set_access_bitmap(0);
        copy_page_tracking(&machine, &old, &new);
        assert_eq!(machine.info().slot(new.pfn()).access_bitmap(), 0);
    }

    #[test]
    fn membership_is_exclusive_between_lap_and_deferred() {
        let machine = machine();
        let page = lru_page(&machine, 0);

        let prev = mod_page_access_level(&machine, &page, true);
        add_page_for_tracking(&machine, &page, prev);
        add_page_for_exchange(&machine, &page, 0);

        // Re-tracking an elected page must be refused.
        add_page_for_tracking(&machine, &page, 1);

        let lists = machine.node(0).lists();
        let on_lap: usize = lists
            .lap_area
            .iter()
            .map(|area| area.list.iter().filter(|&&p| p == page.pfn()).count())
            .sum();
        let on_deferred = lists.deferred.iter().filter(|&&p| p == page.pfn()).count();
        assert_eq!(on_lap + on_deferred, 1);
        assert_eq!(on_deferred, 1);
    }

    #[test]
    fn demotion_targets_the_last_accessors_local_lower_node() {
        let machine = machine();
        let page = machine.alloc_page(0, 0).unwrap();

        // cpu 1 belongs to top node 1, whose demotion target is node 3.
        set_page_last_cpu(&machine, &page, 1);
        assert_eq!(find_best_demotion_node(&machine, &page), Some(3));

        // Unknown accessor falls back to the page's own node.
        set_page_last_cpu(&machine, &page, -1);
        assert_eq!(find_best_demotion_node(&machine, &page), Some(2));

        // Bottom-tier pages are never demotion sources.
        let low = machine.alloc_page(2, 0).unwrap();
        assert_eq!(find_best_demotion_node(&machine, &low), None);
    }

    #[test]
    fn migration_falls_back_to_the_source_tier_ring() {
        let full_top = crate::node::NodeSpec {
            tier:      crate::node::Tier::Top,
            cpus:      1,
            frames:    4,
            watermark: 3,
        };
        let roomy_bottom = crate::node::NodeSpec {
            tier:      crate::node::Tier::Bottom,
            cpus:      1,
            frames:    32,
            watermark: 0,
        };
        let machine = Machine::new(MachineSpec {
            nodes: vec![full_top.clone(), full_top, roomy_bottom.clone(), roomy_bottom],
            thp:   false,
        })
        .unwrap();

        // A remote promotion (node 3 prefers top node 1, but node 0 was
        // requested) with no headroom anywhere in the top tier lands on the
        // bottom ring instead.
        let page = machine.alloc_page(3, 0).unwrap();
        assert_eq!(machine.next_promotion_node(3), Some(1));
        let dst = find_best_migration_node(&machine, &page, 0);
        assert_eq!(dst, Some(2));

        // With headroom the preferred target wins.
        let roomy = Machine::new(MachineSpec::two_tier(1, 1, 1, 32)).unwrap();
        let page = roomy.alloc_page(1, 0).unwrap();
        assert_eq!(find_best_migration_node(&roomy, &page, 0), Some(0));
    }

    #[test]
    fn reset_marks_the_page_hot_and_gates_respect_mode() {
        let machine = machine();
        let page = lru_page(&machine, 0);

        reset_page_access_level(&machine, &page);
        assert_eq!(page_access_level(&machine, &page), Some(MAX_ACCESS_LEVEL));

        machine.config().set_mode(BalanceMode::EXCHANGE);
        assert_eq!(page_access_level(&machine, &page), None);
    }
}

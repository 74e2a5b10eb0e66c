//! Memory nodes and the machine model.
//!
//! A [`MemoryNode`] is the unit of tiering: it owns a slice of the frame
//! arena, the LRU list for its resident pages, the nine level-bucketed LAP
//! lists, and the deferred list of exchange victims. All three list families
//! share one lock, taken for every insertion, removal or reordering.
//!
//! The [`Machine`] ties the nodes to the frame arena, the page-info table,
//! the policy toggles and the copy-worker pool, and answers the topology
//! queries (`next_demotion_node` and friends) the placement policy asks.
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicI64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
};

use crate::{
    deps::{
        log::{
            debug,
            info,
        },
        serde,
    },
    config::Config,
    copy::CopyPool,
    error::Error,
    events::Events,
    frames::{
        FrameArena,
        PAGE_SIZE,
    },
    page::{
        PageRoot,
        Pfn,
        PhysicalPage,
    },
    page_info::{
        PageInfoTable,
        ACCESS_HISTORY_SIZE,
    },
    rmap::{
        AddressSpace,
        AnonVma,
        MigrateOps,
        PteEntry,
        Vma,
        VmaBacking,
    },
};


pub const NR_LAP_LISTS: usize = ACCESS_HISTORY_SIZE as usize + 1;


#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Tier {
    Top,
    Bottom,
}


/// Per-node page-state counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum NodeStatItem {
    Tracked = 0,
    Deferred,
    IsolatedAnon,
    IsolatedFile,
    FilePages,
    Shmem,
    FileDirty,
    WritePending,
}

const NR_NODE_STATS: usize = 8;


#[derive(Default)]
pub struct NodeStats {
    counts: [AtomicI64; NR_NODE_STATS],
}


impl NodeStats {
    pub fn modify(
        &self,
        item: NodeStatItem,
        delta: i64,
    ) {
        self.counts[item as usize].fetch_add(delta, Ordering::SeqCst);
    }

    pub fn read(
        &self,
        item: NodeStatItem,
    ) -> i64 {
        self.counts[item as usize].load(Ordering::SeqCst)
    }
}


/// One access-level bucket of tracked pages, most-recently-refreshed at the
/// tail.
#[derive(Default)]
pub struct LapArea {
    pub list:    VecDeque<Pfn>,
    pub nr_free: i64,
}


impl LapArea {
    /// The free counter saturates at zero; double removals on racy paths
    /// must not wrap it negative.
    pub fn dec_nr_free(&mut self) {
        self.nr_free -= 1;
        if self.nr_free < 0 {
            self.nr_free = 0;
        }
    }
}


/// Everything the node's lru lock protects.
pub struct NodeLists {
    pub lru:      VecDeque<Pfn>,
    pub lap_area: [LapArea; NR_LAP_LISTS],
    pub deferred: VecDeque<Pfn>,
}


impl NodeLists {
    fn new() -> Self {
        Self {
            lru:      VecDeque::new(),
            lap_area: Default::default(),
            deferred: VecDeque::new(),
        }
    }

    pub fn remove_from_lap(
        &mut self,
        level: usize,
        pfn: Pfn,
    ) {
        if let Some(pos) = self.lap_area[level].list.iter().position(|&p| p == pfn) {
            self.lap_area[level].list.remove(pos);
        }
    }

    pub fn remove_from_deferred(
        &mut self,
        pfn: Pfn,
    ) {
        if let Some(pos) = self.deferred.iter().position(|&p| p == pfn) {
            self.deferred.remove(pos);
        }
    }
}


pub struct MemoryNode {
    id:            usize,
    tier:          Tier,
    cpus:          Vec<usize>,
    pfn_start:     u64,
    nr_frames:     usize,
    watermark:     u64,
    next_frame:    AtomicUsize,
    nr_free_pages: AtomicI64,
    lists:         Mutex<NodeLists>,
    pub stats:     NodeStats,
}


impl MemoryNode {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn pfn_start(&self) -> u64 {
        self.pfn_start
    }

    pub fn nr_frames(&self) -> usize {
        self.nr_frames
    }

    pub fn contains_pfn(
        &self,
        pfn: Pfn,
    ) -> bool {
        pfn.get() >= self.pfn_start && pfn.get() < self.pfn_start + self.nr_frames as u64
    }

    /// The node's lru lock. Never held across a content copy.
    pub fn lists(&self) -> MutexGuard<'_, NodeLists> {
        self.lists.lock().unwrap()
    }

    pub fn nr_free_pages(&self) -> i64 {
        self.nr_free_pages.load(Ordering::SeqCst)
    }

    /// `migrate_balanced_pgdat()`: room for an order-`order` allocation
    /// with the watermark still intact.
    pub fn migrate_balanced(
        &self,
        order: u8,
    ) -> bool {
        self.nr_free_pages() - (1i64 << order) > self.watermark as i64
    }
}


#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub tier:      Tier,
    pub cpus:      usize,
    pub frames:    usize,
    pub watermark: u64,
}


#[derive(Clone, Debug)]
pub struct MachineSpec {
    pub nodes: Vec<NodeSpec>,
    pub thp:   bool,
}


impl MachineSpec {
    /// A symmetric machine: `top` fast nodes followed by `bottom` slow
    /// nodes, every node with its own CPUs and frame range.
    pub fn two_tier(
        top: usize,
        bottom: usize,
        cpus_per_node: usize,
        frames_per_node: usize,
    ) -> Self {
        let mut nodes = Vec::with_capacity(top + bottom);
        for _ in 0..top {
            nodes.push(NodeSpec {
                tier:      Tier::Top,
                cpus:      cpus_per_node,
                frames:    frames_per_node,
                watermark: 0,
            });
        }
        for _ in 0..bottom {
            nodes.push(NodeSpec {
                tier:      Tier::Bottom,
                cpus:      cpus_per_node,
                frames:    frames_per_node,
                watermark: 0,
            });
        }
        Self { nodes, thp: false }
    }
}


#[derive(Clone, Debug, serde::Serialize)]
pub struct NodeReport {
    pub id:         usize,
    pub tier:       Tier,
    pub nr_frames:  usize,
    pub free_pages: i64,
    pub tracked:    i64,
    pub deferred:   i64,
}


pub struct Machine {
    arena:      Arc<FrameArena>,
    nodes:      Vec<MemoryNode>,
    info:       PageInfoTable,
    pages:      Mutex<HashMap<Pfn, Arc<PhysicalPage>>>,
    cpu_node:   Vec<usize>,
    config:     Config,
    events:     Events,
    pool:       CopyPool,
    next_anon:  AtomicUsize,
    next_file:  AtomicUsize,
    next_memcg: AtomicUsize,
}


impl Machine {
    pub fn new(spec: MachineSpec) -> Result<Arc<Self>, Error> {
        // Frame 0 is reserved so a zero pfn can mean "unlinked".
        let total_frames: usize = 1 + spec.nodes.iter().map(|n| n.frames).sum::<usize>();
        let arena = Arc::new(FrameArena::new(total_frames)?);

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        let mut cpu_node = Vec::new();
        let mut pfn_start = 1u64;
        for (id, node_spec) in spec.nodes.iter().enumerate() {
            let cpus = (cpu_node.len()..cpu_node.len() + node_spec.cpus).collect::<Vec<_>>();
            for _ in 0..node_spec.cpus {
                cpu_node.push(id);
            }
            nodes.push(MemoryNode {
                id,
                tier: node_spec.tier,
                cpus,
                pfn_start,
                nr_frames: node_spec.frames,
                watermark: node_spec.watermark,
                next_frame: AtomicUsize::new(0),
                nr_free_pages: AtomicI64::new(node_spec.frames as i64),
                lists: Mutex::new(NodeLists::new()),
                stats: NodeStats::default(),
            });
            pfn_start += node_spec.frames as u64;
        }

        let config = Config::default();
        config.set_thp_enabled(spec.thp);

        let machine = Arc::new(Self {
            arena,
            nodes,
            info: PageInfoTable::new(total_frames),
            pages: Mutex::new(HashMap::new()),
            cpu_node,
            config,
            events: Events::default(),
            pool: CopyPool::new(std::cmp::max(1, spec.nodes.iter().map(|n| n.cpus).sum())),
            next_anon: AtomicUsize::new(1),
            next_file: AtomicUsize::new(1),
            next_memcg: AtomicUsize::new(1),
        });

        machine.init_early_frames();
        Ok(machine)
    }

    /// Mark every frame's info record initialized, the way the side table
    /// is seeded for pages allocated before tracking came up.
    fn init_early_frames(&self) {
        for node in &self.nodes {
            let mut count = 0u64;
            for offset in 0..node.nr_frames {
                let pfn = Pfn::new(node.pfn_start + offset as u64);
                let slot = self.info.slot(pfn);
                if slot.initialized() {
                    continue;
                }
                slot.init_balancing();
                count += 1;
            }
            info!("node {}: page info found early allocated {} pages", node.id, count);
        }
    }

    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn info(&self) -> &PageInfoTable {
        &self.info
    }

    pub fn pool(&self) -> &CopyPool {
        &self.pool
    }

    // ---- topology ----------------------------------------------------

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(
        &self,
        nid: usize,
    ) -> &MemoryNode {
        &self.nodes[nid]
    }

    pub fn nodes(&self) -> &[MemoryNode] {
        &self.nodes
    }

    pub fn is_top_node(
        &self,
        nid: usize,
    ) -> bool {
        self.nodes[nid].tier == Tier::Top
    }

    pub fn is_bottom_node(
        &self,
        nid: usize,
    ) -> bool {
        self.nodes[nid].tier == Tier::Bottom
    }

    pub fn cpu_to_node(
        &self,
        cpu: i32,
    ) -> Option<usize> {
        if cpu < 0 {
            return None;
        }
        self.cpu_node.get(cpu as usize).copied()
    }

    pub fn cpus_on(
        &self,
        nid: usize,
    ) -> usize {
        self.nodes[nid].cpus.len()
    }

    /// The preferred lower-tier destination when demoting from `nid`.
    pub fn next_demotion_node(
        &self,
        nid: usize,
    ) -> Option<usize> {
        if self.is_bottom_node(nid) {
            return None;
        }
        let bottoms: Vec<usize> = self.tier_members(Tier::Bottom);
        if bottoms.is_empty() {
            return None;
        }
        let tops = self.tier_members(Tier::Top);
        let rank = tops.iter().position(|&n| n == nid)?;
        Some(bottoms[rank % bottoms.len()])
    }

    /// The preferred upper-tier destination when promoting from `nid`.
    pub fn next_promotion_node(
        &self,
        nid: usize,
    ) -> Option<usize> {
        if self.is_top_node(nid) {
            return None;
        }
        let tops: Vec<usize> = self.tier_members(Tier::Top);
        if tops.is_empty() {
            return None;
        }
        let bottoms = self.tier_members(Tier::Bottom);
        let rank = bottoms.iter().position(|&n| n == nid)?;
        Some(tops[rank % tops.len()])
    }

    /// The next node on the same-tier migration ring. A lone node rings to
    /// itself.
    pub fn next_migration_node(
        &self,
        nid: usize,
    ) -> Option<usize> {
        let members = self.tier_members(self.nodes[nid].tier);
        let rank = members.iter().position(|&n| n == nid)?;
        Some(members[(rank + 1) % members.len()])
    }

    fn tier_members(
        &self,
        tier: Tier,
    ) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.tier == tier)
            .map(|n| n.id)
            .collect()
    }

    pub fn migrate_balanced(
        &self,
        nid: usize,
        order: u8,
    ) -> bool {
        self.nodes[nid].migrate_balanced(order)
    }

    // ---- page lifetime -----------------------------------------------

    pub fn pfn_to_page(
        &self,
        pfn: Pfn,
    ) -> Option<Arc<PhysicalPage>> {
        if pfn.is_none() {
            return None;
        }
        self.pages.lock().unwrap().get(&pfn).cloned()
    }

    pub fn page_node(
        &self,
        page: &PhysicalPage,
    ) -> &MemoryNode {
        &self.nodes[page.nid()]
    }

    pub fn alloc_page(
        &self,
        nid: usize,
        order: u8,
    ) -> Result<Arc<PhysicalPage>, Error> {
        self.alloc_page_inner(nid, order, false)
    }

    pub fn alloc_hugetlb_page(
        &self,
        nid: usize,
        order: u8,
    ) -> Result<Arc<PhysicalPage>, Error> {
        self.alloc_page_inner(nid, order, true)
    }

    fn alloc_page_inner(
        &self,
        nid: usize,
        order: u8,
        hugetlb: bool,
    ) -> Result<Arc<PhysicalPage>, Error> {
        let node = &self.nodes[nid];
        let nr_pages = 1usize << order;

        let offset = loop {
            let current = node.next_frame.load(Ordering::SeqCst);
            // Compound pages are naturally aligned within the node range.
            let aligned = (current + nr_pages - 1) & !(nr_pages - 1);
            if aligned + nr_pages > node.nr_frames {
                return Err(Error::NoMemory { what: "node frames exhausted" });
            }
            if node
                .next_frame
                .compare_exchange(current, aligned + nr_pages, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break aligned;
            }
        };

        node.nr_free_pages.fetch_sub(nr_pages as i64, Ordering::SeqCst);
        let pfn = Pfn::new(node.pfn_start + offset as u64);
        let page = Arc::new(PhysicalPage::new(pfn, nid, order, hugetlb, Arc::clone(&self.arena)));
        self.pages.lock().unwrap().insert(pfn, Arc::clone(&page));
        debug!("allocated {:?} order {} on node {}", pfn, order, nid);
        Ok(page)
    }

    /// Drops a reference; the final one releases the frame back to its
    /// node's accounting and scrubs the info record.
    pub fn put_page(
        &self,
        page: &Arc<PhysicalPage>,
    ) {
        if page.put_page_return() == 0 {
            self.release_page(page);
        }
    }

    fn release_page(
        &self,
        page: &Arc<PhysicalPage>,
    ) {
        debug!("releasing {:?}", page.pfn());
        self.pages.lock().unwrap().remove(&page.pfn());
        self.info.slot(page.pfn()).clear_info();
        self.nodes[page.nid()]
            .nr_free_pages
            .fetch_add(page.nr_pages() as i64, Ordering::SeqCst);
    }

    // ---- LRU ----------------------------------------------------------

    pub fn add_to_lru(
        &self,
        page: &Arc<PhysicalPage>,
    ) {
        let node = self.page_node(page);
        let mut lists = node.lists();
        debug_assert!(!page.flags().lru());
        page.flags().set_lru();
        lists.lru.push_back(page.pfn());
    }

    /// `isolate_lru_page()`: take the page off its LRU list with a
    /// reference held.
    pub fn isolate_lru_page(
        &self,
        page: &Arc<PhysicalPage>,
    ) -> Result<(), Error> {
        let node = self.page_node(page);
        let mut lists = node.lists();
        if !page.flags().test_and_clear_lru() {
            return Err(Error::busy("page is not on an lru list"));
        }
        if let Some(pos) = lists.lru.iter().position(|&p| p == page.pfn()) {
            lists.lru.remove(pos);
        }
        page.get_page();
        Ok(())
    }

    /// `putback_lru_page()`: return an isolated page to its LRU list,
    /// dropping the isolation reference.
    pub fn putback_lru_page(
        &self,
        page: &Arc<PhysicalPage>,
    ) {
        {
            let node = self.page_node(page);
            let mut lists = node.lists();
            debug_assert!(!page.flags().lru());
            page.flags().set_lru();
            lists.lru.push_back(page.pfn());
        }
        self.put_page(page);
    }

    /// `migrate_prep()`: flush pending per-cpu page batches so isolation
    /// sees every LRU resident. The model keeps no pagevecs, so this only
    /// marks the retry point.
    pub fn migrate_prep(&self) {
        debug!("draining per-cpu pagevecs");
    }

    // ---- address spaces and mappings ---------------------------------

    pub fn new_anon_vma(&self) -> Arc<AnonVma> {
        AnonVma::new(self.next_anon.fetch_add(1, Ordering::SeqCst) as u64)
    }

    pub fn new_address_space(
        &self,
        ops: MigrateOps,
        account_dirty: bool,
    ) -> Arc<AddressSpace> {
        AddressSpace::new(self.next_file.fetch_add(1, Ordering::SeqCst) as u64, ops, account_dirty)
    }

    pub fn new_memcg(&self) -> u64 {
        self.next_memcg.fetch_add(1, Ordering::SeqCst) as u64
    }

    /// Wire an anonymous page into a VMA at the given page offset. The
    /// allocation reference becomes the mapping reference.
    pub fn map_anon_page(
        &self,
        page: &Arc<PhysicalPage>,
        vma: &Arc<Vma>,
        index: u64,
    ) -> Result<(), Error> {
        let anon_vma = match vma.backing() {
            VmaBacking::Anon(av) => av,
            VmaBacking::File(_) => {
                return Err(Error::fault("anonymous page mapped into a file vma"))
            }
        };

        page.set_root(PageRoot::Anon(anon_vma));
        page.set_index(index);
        page.flags().set_swapbacked();
        for k in 0..page.nr_pages() as u64 {
            vma.set_pte(
                vma.address_of_index(index + k),
                PteEntry::Present(page.pfn().offset(k)),
            );
        }
        page.mapcount_inc();
        Ok(())
    }

    /// Wire a file page into its mapping's tree and a VMA. The allocation
    /// reference becomes the tree slot's cache reference; the page table
    /// takes one of its own.
    pub fn map_file_page(
        &self,
        page: &Arc<PhysicalPage>,
        mapping: &Arc<AddressSpace>,
        vma: &Arc<Vma>,
        index: u64,
    ) -> Result<(), Error> {
        if page.is_compound() {
            return Err(Error::NotSupported { reason: "compound file pages" });
        }

        page.set_root(PageRoot::File(Arc::clone(mapping)));
        page.set_index(index);
        page.flags().set_uptodate();
        mapping.tree_lock().insert(index, page.pfn());
        self.page_node(page).stats.modify(NodeStatItem::FilePages, 1);

        vma.set_pte(vma.address_of_index(index), PteEntry::Present(page.pfn()));
        page.mapcount_inc();
        page.get_page();
        Ok(())
    }

    /// Reads `len` bytes of virtually-addressed memory, failing on holes
    /// and in-flight migration entries.
    pub fn read_virtual(
        &self,
        vma: &Arc<Vma>,
        vaddr: u64,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::with_capacity(len);
        let mut addr = vaddr;
        let end = vaddr + len as u64;

        while addr < end {
            let page_base = addr & !(PAGE_SIZE as u64 - 1);
            let pfn = vma
                .resolve(page_base)
                .ok_or(Error::fault("virtual address is not mapped to a present frame"))?;
            let frame = self.arena.snapshot(pfn.as_usize(), 1);

            let start = (addr - page_base) as usize;
            let take = std::cmp::min(end - addr, (PAGE_SIZE - start) as u64) as usize;
            bytes.extend_from_slice(&frame[start..start + take]);
            addr += take as u64;
        }

        Ok(bytes)
    }

    pub fn report(&self) -> Vec<NodeReport> {
        self.nodes
            .iter()
            .map(|node| NodeReport {
                id:         node.id,
                tier:       node.tier,
                nr_frames:  node.nr_frames,
                free_pages: node.nr_free_pages(),
                tracked:    node.stats.read(NodeStatItem::Tracked),
                deferred:   node.stats.read(NodeStatItem::Deferred),
            })
            .collect()
    }
}

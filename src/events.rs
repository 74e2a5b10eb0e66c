//! Exchange event accounting.
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};

use crate::deps::serde;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ExchangeEvent {
    /// Base pages successfully exchanged (counted per participant).
    Success = 0,
    Fail,
    /// The destination node had no deferred candidates at all.
    ListEmptyFail,
    /// A deferred entry no longer resolved to a live page and was scrubbed.
    NoPageFail,
    /// A candidate's busy lock was already held.
    BusyFail,
    /// A candidate's last CPU did not belong to the source node.
    NodeUnmatchFail,
    /// The deferred scan hit its entry cap without finding a victim.
    ScanFail,
    /// Deferred entries examined and passed over, for any reason.
    PageSkipped,
}

const NR_EVENTS: usize = 8;


pub struct Events {
    counts: [AtomicU64; NR_EVENTS],
}


impl Default for Events {
    fn default() -> Self {
        Self {
            counts: Default::default(),
        }
    }
}


impl Events {
    pub fn count(
        &self,
        event: ExchangeEvent,
    ) {
        self.count_many(event, 1);
    }

    pub fn count_many(
        &self,
        event: ExchangeEvent,
        nr: u64,
    ) {
        self.counts[event as usize].fetch_add(nr, Ordering::SeqCst);
    }

    pub fn read(
        &self,
        event: ExchangeEvent,
    ) -> u64 {
        self.counts[event as usize].load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> EventsSnapshot {
        EventsSnapshot {
            success:           self.read(ExchangeEvent::Success),
            fail:              self.read(ExchangeEvent::Fail),
            list_empty_fail:   self.read(ExchangeEvent::ListEmptyFail),
            no_page_fail:      self.read(ExchangeEvent::NoPageFail),
            busy_fail:         self.read(ExchangeEvent::BusyFail),
            node_unmatch_fail: self.read(ExchangeEvent::NodeUnmatchFail),
            scan_fail:         self.read(ExchangeEvent::ScanFail),
            pages_skipped:     self.read(ExchangeEvent::PageSkipped),
        }
    }
}


#[derive(Clone, Debug, serde::Serialize)]
pub struct EventsSnapshot {
    pub success:           u64,
    pub fail:              u64,
    pub list_empty_fail:   u64,
    pub no_page_fail:      u64,
    pub busy_fail:         u64,
    pub node_unmatch_fail: u64,
    pub scan_fail:         u64,
    pub pages_skipped:     u64,
}

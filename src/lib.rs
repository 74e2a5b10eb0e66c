#![cfg_attr(feature = "nightly", feature(backtrace))]

pub(crate) mod deps {
    pub use crossbeam_channel;
    pub use derive_more;
    pub use lazy_static;
    pub use libc;
    pub use log;
    pub use nix;
    pub use num_cpus;
    pub use serde;
    pub use thiserror;
}

pub mod balancing;
pub mod config;
pub mod copy;
pub mod error;
pub mod events;
pub mod exchange;
pub mod exchange_concur;
pub mod exchange_page;
pub mod flags;
pub mod frames;
pub mod node;
pub mod page;
pub mod page_info;
pub mod rmap;

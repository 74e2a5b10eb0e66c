//! Runtime policy toggles.
//!
//! The original surface is a set of writable sysctl/sysfs knobs; here they
//! form one record of atomics owned by the machine. Every setter validates
//! its input the way the store handlers do, so an out-of-range write is an
//! error rather than a silent clamp.
use std::{
    fmt,
    ops::BitOr,
    sync::atomic::{
        AtomicBool,
        AtomicU32,
        Ordering,
    },
};

use crate::{
    deps::serde,
    error::Error,
};


/// Which parts of tiered balancing are active.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct BalanceMode(u32);


impl BalanceMode {
    /// Ordered-page-management: access sampling and LAP-list tracking.
    pub const OPM: BalanceMode = BalanceMode(1 << 0);
    /// Pairwise exchange on promotion failure.
    pub const EXCHANGE: BalanceMode = BalanceMode(1 << 1);
    /// Access-history transfer on ordinary (copy-based) migration.
    pub const CPM: BalanceMode = BalanceMode(1 << 2);

    pub const fn empty() -> Self {
        BalanceMode(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        BalanceMode(bits & 0x7)
    }

    pub const fn contains(
        &self,
        other: BalanceMode,
    ) -> bool {
        self.0 & other.0 != 0
    }
}


impl BitOr for BalanceMode {
    type Output = BalanceMode;

    fn bitor(
        self,
        rhs: BalanceMode,
    ) -> BalanceMode {
        BalanceMode(self.0 | rhs.0)
    }
}


impl fmt::Debug for BalanceMode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        let mut bits = Vec::with_capacity(3);
        if self.contains(BalanceMode::OPM) {
            bits.push("OPM");
        }
        if self.contains(BalanceMode::EXCHANGE) {
            bits.push("EXCHANGE");
        }
        if self.contains(BalanceMode::CPM) {
            bits.push("CPM");
        }
        f.debug_tuple("BalanceMode").field(&bits.as_slice()).finish()
    }
}


pub const MAX_MT_WORKERS: u32 = 32;


pub struct Config {
    mode:                AtomicU32,
    exchange_mt:         AtomicBool,
    exchange_concur:     AtomicBool,
    background_demotion: AtomicBool,
    batch_demotion:      AtomicBool,
    thp_mt_copy:         AtomicBool,
    skip_lower_tier:     AtomicBool,
    thp_enabled:         AtomicBool,
    limit_mt_num:        AtomicU32,
}


impl Default for Config {
    fn default() -> Self {
        Self {
            mode:                AtomicU32::new((BalanceMode::OPM | BalanceMode::EXCHANGE).bits()),
            exchange_mt:         AtomicBool::new(true),
            exchange_concur:     AtomicBool::new(true),
            background_demotion: AtomicBool::new(false),
            batch_demotion:      AtomicBool::new(false),
            thp_mt_copy:         AtomicBool::new(false),
            skip_lower_tier:     AtomicBool::new(true),
            thp_enabled:         AtomicBool::new(false),
            limit_mt_num:        AtomicU32::new(4),
        }
    }
}


fn parse_bool_toggle(
    value: u32,
    typename: &'static str,
) -> Result<bool, Error> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        bad_value => {
            Err(Error::Parse {
                value:    bad_value.to_string(),
                typename,
                reason:   "value was not one of: 0, 1".to_string(),
            })
        }
    }
}


impl Config {
    pub fn mode(&self) -> BalanceMode {
        BalanceMode::from_bits(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_mode(
        &self,
        mode: BalanceMode,
    ) {
        self.mode.store(mode.bits(), Ordering::SeqCst);
    }

    pub fn exchange_mt(&self) -> bool {
        self.exchange_mt.load(Ordering::SeqCst)
    }

    pub fn set_exchange_mt(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        self.exchange_mt
            .store(parse_bool_toggle(value, "exchange_mt")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn exchange_concur(&self) -> bool {
        self.exchange_concur.load(Ordering::SeqCst)
    }

    pub fn set_exchange_concur(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        self.exchange_concur
            .store(parse_bool_toggle(value, "exchange_concur")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn background_demotion(&self) -> bool {
        self.background_demotion.load(Ordering::SeqCst)
    }

    pub fn set_background_demotion(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        self.background_demotion
            .store(parse_bool_toggle(value, "background_demotion")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn batch_demotion(&self) -> bool {
        self.batch_demotion.load(Ordering::SeqCst)
    }

    pub fn set_batch_demotion(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        self.batch_demotion
            .store(parse_bool_toggle(value, "batch_demotion")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn thp_mt_copy(&self) -> bool {
        self.thp_mt_copy.load(Ordering::SeqCst)
    }

    pub fn set_thp_mt_copy(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        self.thp_mt_copy
            .store(parse_bool_toggle(value, "thp_mt_copy")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn skip_lower_tier(&self) -> bool {
        self.skip_lower_tier.load(Ordering::SeqCst)
    }

    pub fn set_skip_lower_tier(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        self.skip_lower_tier
            .store(parse_bool_toggle(value, "skip_lower_tier")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn thp_enabled(&self) -> bool {
        self.thp_enabled.load(Ordering::SeqCst)
    }

    pub fn set_thp_enabled(
        &self,
        enabled: bool,
    ) {
        self.thp_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn limit_mt_num(&self) -> u32 {
        self.limit_mt_num.load(Ordering::SeqCst)
    }

    pub fn set_limit_mt_num(
        &self,
        value: u32,
    ) -> Result<(), Error> {
        if value < 1 || value > MAX_MT_WORKERS {
            return Err(Error::Parse {
                value:    value.to_string(),
                typename: "limit_mt_num",
                reason:   format!("value was not in range [1, {}]", MAX_MT_WORKERS),
            });
        }
        self.limit_mt_num.store(value, Ordering::SeqCst);
        Ok(())
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            mode_bits:           self.mode().bits(),
            exchange_mt:         self.exchange_mt(),
            exchange_concur:     self.exchange_concur(),
            background_demotion: self.background_demotion(),
            batch_demotion:      self.batch_demotion(),
            thp_mt_copy:         self.thp_mt_copy(),
            skip_lower_tier:     self.skip_lower_tier(),
            limit_mt_num:        self.limit_mt_num(),
        }
    }
}


#[derive(Clone, Debug, serde::Serialize)]
pub struct ConfigSnapshot {
    pub mode_bits:           u32,
    pub exchange_mt:         bool,
    pub exchange_concur:     bool,
    pub background_demotion: bool,
    pub batch_demotion:      bool,
    pub thp_mt_copy:         bool,
    pub skip_lower_tier:     bool,
    pub limit_mt_num:        u32,
}


/// How an exchange is willing to wait, plus the copy-engine selectors.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MigrateMode(u32);


impl MigrateMode {
    pub const ASYNC: MigrateMode = MigrateMode(0);
    pub const SYNC_LIGHT: MigrateMode = MigrateMode(1);
    pub const SYNC: MigrateMode = MigrateMode(2);

    const CLASS_MASK: u32 = 7;

    /// Offload the content swap to the multithreaded engine.
    pub const MT: MigrateMode = MigrateMode(1 << 4);
    /// Run batched pairs through the concurrent pipeline.
    pub const CONCUR: MigrateMode = MigrateMode(1 << 5);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    const fn class(&self) -> u32 {
        self.0 & Self::CLASS_MASK
    }

    pub const fn is_async(&self) -> bool {
        self.class() == Self::ASYNC.0
    }

    pub const fn is_sync(&self) -> bool {
        self.class() == Self::SYNC.0
    }

    pub const fn has_mt(&self) -> bool {
        self.0 & Self::MT.0 != 0
    }

    pub const fn has_concur(&self) -> bool {
        self.0 & Self::CONCUR.0 != 0
    }
}


impl BitOr for MigrateMode {
    type Output = MigrateMode;

    fn bitor(
        self,
        rhs: MigrateMode,
    ) -> MigrateMode {
        MigrateMode(self.0 | rhs.0)
    }
}


impl fmt::Debug for MigrateMode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        let class = match self.class() {
            0 => "ASYNC",
            1 => "SYNC_LIGHT",
            2 => "SYNC",
            _ => "?",
        };
        write!(f, "MigrateMode({}", class)?;
        if self.has_mt() {
            write!(f, "|MT")?;
        }
        if self.has_concur() {
            write!(f, "|CONCUR")?;
        }
        write!(f, ")")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_validate_their_range() {
        let config = Config::default();

        config.set_exchange_mt(0).unwrap();
        assert!(!config.exchange_mt());
        config.set_exchange_mt(1).unwrap();
        assert!(config.exchange_mt());
        assert!(config.set_exchange_mt(2).is_err());

        assert!(config.set_limit_mt_num(0).is_err());
        assert!(config.set_limit_mt_num(33).is_err());
        config.set_limit_mt_num(32).unwrap();
        assert_eq!(config.limit_mt_num(), 32);
    }

    #[test]
    fn defaults_match_the_tuned_machine() {
        let config = Config::default();
        assert!(config.exchange_mt());
        assert!(config.exchange_concur());
        assert!(!config.background_demotion());
        assert!(config.skip_lower_tier());
        assert_eq!(config.limit_mt_num(), 4);
        assert!(config.mode().contains(BalanceMode::OPM));
        assert!(config.mode().contains(BalanceMode::EXCHANGE));
    }

    #[test]
    fn migrate_mode_flags_compose() {
        let mode = MigrateMode::SYNC | MigrateMode::MT | MigrateMode::CONCUR;
        assert!(mode.is_sync());
        assert!(!mode.is_async());
        assert!(mode.has_mt());
        assert!(mode.has_concur());

        assert!(MigrateMode::ASYNC.is_async());
        assert!(!MigrateMode::SYNC_LIGHT.is_sync());
        assert!(!MigrateMode::SYNC_LIGHT.is_async());
    }
}

use crate::deps::thiserror;



#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Contention that the current migration mode refuses to wait out, e.g.
    /// a destination page under writeback in async mode. Not retried by the
    /// exchange driver; the caller may fall back to ordinary migration.
    #[error("busy: {reason}")]
    Busy { reason: &'static str },

    /// Transient contention inside a single exchange attempt. The serial
    /// driver retries these up to three times before giving up.
    #[error("try again: {reason}")]
    Again { reason: &'static str },

    #[error("allocation failed: {what}")]
    NoMemory { what: &'static str },

    /// The requested copy-worker fan-out fell outside the supported range.
    #[error("no suitable copy device: fan-out {requested} not in [1, {max}]")]
    NoDevice { requested: u32, max: u32 },

    /// Unexpected state violation; terminal.
    #[error("fault: {reason}")]
    Fault { reason: &'static str },

    #[error("not supported: {reason}")]
    NotSupported { reason: &'static str },

    #[error("an os error occurred: {source}")]
    Os {
        #[from]
        source: crate::deps::nix::Error,
        #[cfg(feature = "nightly")]
        backtrace: std::backtrace::Backtrace,
    },

    #[error("parsing {typename} from {value:?}, reason: {reason:}")]
    Parse {
        value:    String,
        typename: &'static str,
        reason:   String,
    },
}


impl Error {
    pub const fn busy(reason: &'static str) -> Self {
        Error::Busy { reason }
    }

    pub const fn again(reason: &'static str) -> Self {
        Error::Again { reason }
    }

    pub const fn fault(reason: &'static str) -> Self {
        Error::Fault { reason }
    }

    /// True for failures the serial exchange driver may retry in place.
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Error::Again { .. })
    }
}


pub type Result<T> = std::result::Result<T, Error>;

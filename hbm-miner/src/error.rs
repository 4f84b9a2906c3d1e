//! Error types for the device driver.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Which regulator rail a voltage request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rail {
    /// Wiper-programmed core rail.
    A,
    /// PMBus rail behind the bit-banged two-wire port.
    B,
}

impl std::fmt::Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rail::A => write!(f, "rail-a"),
            Rail::B => write!(f, "rail-b"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Connection could not be established or was lost.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("register 0x{addr:04x}: {source}")]
    RegisterIo {
        addr: u32,
        #[source]
        source: TransportError,
    },

    #[error("timed out waiting for {what}")]
    ProtocolTimeout { what: &'static str },

    #[error("{rail} target {millivolts}mV outside 500..=920mV")]
    CalibrationOutOfRange { rail: Rail, millivolts: u32 },

    #[error("algorithm {algorithm:?} not supported")]
    UnsupportedWork { algorithm: String },

    #[error("light cache upload failed at offset 0x{offset:x}")]
    CacheUploadFailed { offset: u64 },

    #[error("no light cache supplied for epoch {epoch}")]
    MissingLightCache { epoch: u32 },

    /// Die-on-error policy turned a recoverable fault into a fatal one.
    #[error("escalated: {reason}")]
    Escalated { reason: String },

    #[error("cancelled by shutdown")]
    Cancelled,

    /// Stack protection halted the board; it takes no work until restarted.
    #[error("board halted by stack protection")]
    Halted,

    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn register(addr: u32, source: TransportError) -> Self {
        Self::RegisterIo { addr, source }
    }

    pub fn escalated(reason: impl Into<String>) -> Self {
        Self::Escalated {
            reason: reason.into(),
        }
    }

    /// Terminal failures end the worker; everything else is logged and
    /// absorbed where it happens.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::UnsupportedWork { .. }
                | Error::Escalated { .. }
                | Error::CacheUploadFailed { .. }
                | Error::MissingLightCache { .. }
                | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let e = Error::CalibrationOutOfRange {
            rail: Rail::B,
            millivolts: 1000,
        };
        assert_eq!(e.to_string(), "rail-b target 1000mV outside 500..=920mV");

        let e = Error::register(0x5080, TransportError::Timeout);
        assert!(e.to_string().starts_with("register 0x5080"));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Error::escalated("interrupt wait failed").is_terminal());
        assert!(Error::UnsupportedWork {
            algorithm: "progpow".into()
        }
        .is_terminal());
        assert!(!Error::ProtocolTimeout { what: "pll lock" }.is_terminal());
        assert!(!Error::register(0x0, TransportError::Timeout).is_terminal());
        // A halted board parks its worker rather than ending it.
        assert!(!Error::Halted.is_terminal());
        assert!(Error::Cancelled.is_terminal());
    }
}

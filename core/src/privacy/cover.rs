// Cover Traffic: synthetic packets that hide when a client really sends
//
// Three independent sources, each a Poisson process at `desired_rate`:
//   loop cover           client → mixes → own provider → back to the client
//   drop cover           client → mixes → random mix, discarded there
//   rate-compliant cover one combined stream; real messages take the next
//                        tick, drop cover fills the ticks nobody claims

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::protocol::Flag;

#[derive(Debug, Error, PartialEq)]
pub enum CoverError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Per-client cover traffic policy; changed only by explicit reconfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverTrafficPolicy {
    pub loop_enabled: bool,
    pub drop_enabled: bool,
    pub rate_compliant_enabled: bool,
    /// Events per second of every enabled source
    pub desired_rate: f64,
}

impl Default for CoverTrafficPolicy {
    fn default() -> Self {
        Self {
            loop_enabled: true,
            drop_enabled: true,
            rate_compliant_enabled: true,
            desired_rate: 1.0,
        }
    }
}

impl CoverTrafficPolicy {
    /// Every source off and an effectively infinite rate: just blast messages
    pub fn benchmark() -> Self {
        Self {
            loop_enabled: false,
            drop_enabled: false,
            rate_compliant_enabled: false,
            desired_rate: 10_000_000.0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            loop_enabled: false,
            drop_enabled: false,
            rate_compliant_enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoverError> {
        if !self.desired_rate.is_finite() || self.desired_rate <= 0.0 {
            return Err(CoverError::InvalidConfig(format!(
                "desired_rate must be finite and > 0, got {}",
                self.desired_rate
            )));
        }
        Ok(())
    }

    pub fn is_enabled(&self, kind: CoverKind) -> bool {
        match kind {
            CoverKind::Loop => self.loop_enabled,
            CoverKind::Drop => self.drop_enabled,
            CoverKind::RateCompliant => self.rate_compliant_enabled,
        }
    }
}

/// Kind of synthetic packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoverKind {
    Loop,
    Drop,
    RateCompliant,
}

impl CoverKind {
    /// Frame flag on the wire. Loop and rate-compliant cover must look like
    /// real messages, so only plain drop cover carries the COVER flag.
    pub fn flag(self) -> Flag {
        match self {
            CoverKind::Loop | CoverKind::RateCompliant => Flag::Comm,
            CoverKind::Drop => Flag::Cover,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CoverKind::Loop => "loop",
            CoverKind::Drop => "drop",
            CoverKind::RateCompliant => "rate-compliant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_valid() {
        let policy = CoverTrafficPolicy::default();
        assert!(policy.validate().is_ok());
        assert!(policy.is_enabled(CoverKind::Loop));
        assert!(policy.is_enabled(CoverKind::Drop));
        assert!(policy.is_enabled(CoverKind::RateCompliant));
    }

    #[test]
    fn test_benchmark_policy() {
        let policy = CoverTrafficPolicy::benchmark();
        assert!(policy.validate().is_ok());
        assert!(!policy.loop_enabled && !policy.drop_enabled && !policy.rate_compliant_enabled);
        assert_eq!(policy.desired_rate, 1e7);
    }

    #[test]
    fn test_invalid_rate() {
        for rate in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let policy = CoverTrafficPolicy {
                desired_rate: rate,
                ..Default::default()
            };
            assert!(policy.validate().is_err(), "rate {rate} accepted");
        }
    }

    #[test]
    fn test_flags() {
        assert_eq!(CoverKind::Loop.flag(), Flag::Comm);
        assert_eq!(CoverKind::RateCompliant.flag(), Flag::Comm);
        assert_eq!(CoverKind::Drop.flag(), Flag::Cover);
    }

    #[test]
    fn test_policy_json_roundtrip() {
        let policy = CoverTrafficPolicy {
            drop_enabled: false,
            desired_rate: 2.5,
            ..Default::default()
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(serde_json::from_str::<CoverTrafficPolicy>(&json).unwrap(), policy);
    }
}

//! Deterministic choice of the child slot a join request is delegated to.
//!
//! A full node hands a join request to one of its children. The slot is a pure
//! function of the origin identifier, so every continuation of one handshake
//! follows the same path down the tree, and a request deferred on an empty
//! slot reaches whichever child later fills it.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::types::NodeId;

/// How a node maps an origin to one of its child slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DelegationMode {
    /// `prefix(origin) % max_degree`. Every node in the tree picks the same
    /// slot index for a given origin.
    #[default]
    Prefix,
    /// `(prefix(origin) ^ prefix(self)) % max_degree`. Skews the choice per
    /// node so that one origin prefix does not always descend the same
    /// branch index at every level.
    SelfSkewed,
}

impl DelegationMode {
    /// Slot index for `origin` on the node `own`.
    ///
    /// # Panics
    ///
    /// Panics if `max_degree` is zero.
    pub fn index(self, origin: &NodeId, own: &NodeId, max_degree: usize) -> usize {
        match self {
            Self::Prefix => delegate_index(origin, max_degree),
            Self::SelfSkewed => reduce(origin.prefix() ^ own.prefix(), max_degree),
        }
    }
}

impl fmt::Display for DelegationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix => write!(f, "prefix"),
            Self::SelfSkewed => write!(f, "self-skewed"),
        }
    }
}

impl FromStr for DelegationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "prefix" => Ok(Self::Prefix),
            "self-skewed" => Ok(Self::SelfSkewed),
            other => Err(Error::InvalidConfig(format!("unknown delegation mode {other:?}"))),
        }
    }
}

/// Slot index for `origin`: its first 6 hex characters modulo `max_degree`.
///
/// # Panics
///
/// Panics if `max_degree` is zero. [`NodeConfig::validate`](crate::NodeConfig::validate)
/// rejects that value for every running node.
pub fn delegate_index(origin: &NodeId, max_degree: usize) -> usize {
    reduce(origin.prefix(), max_degree)
}

fn reduce(value: u32, max_degree: usize) -> usize {
    assert!(max_degree > 0, "max_degree must be non-zero");
    value as usize % max_degree
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(hex: &str) -> NodeId {
        hex.parse().unwrap()
    }

    #[test]
    fn known_indices() {
        assert_eq!(delegate_index(&id("00000aff"), 10), 0);
        assert_eq!(delegate_index(&id("00000fff"), 10), 5); // 0x00000f = 15
        assert_eq!(delegate_index(&id("0000ffff"), 2), 1); // 0x0000ff = 255
        assert_eq!(delegate_index(&id("ffffffff"), 1), 0);
    }

    #[test]
    fn suffix_is_ignored() {
        assert_eq!(
            delegate_index(&id("12345600"), 7),
            delegate_index(&id("123456ff"), 7)
        );
    }

    #[test]
    fn self_skewed_mixes_own_prefix() {
        let origin = id("00000300");
        let own = id("00000100");
        assert_eq!(DelegationMode::Prefix.index(&origin, &own, 4), 3);
        assert_eq!(DelegationMode::SelfSkewed.index(&origin, &own, 4), 2);
    }

    #[test]
    #[should_panic(expected = "max_degree must be non-zero")]
    fn zero_degree_panics() {
        delegate_index(&id("abcdef01"), 0);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("prefix".parse::<DelegationMode>().unwrap(), DelegationMode::Prefix);
        assert_eq!(
            "self-skewed".parse::<DelegationMode>().unwrap(),
            DelegationMode::SelfSkewed
        );
        assert!("xor".parse::<DelegationMode>().is_err());
        assert_eq!(DelegationMode::SelfSkewed.to_string(), "self-skewed");
    }

    proptest! {
        #[test]
        fn deterministic_and_in_range(bytes in any::<[u8; 4]>(), own in any::<[u8; 4]>(), degree in 1usize..64) {
            let origin = NodeId::from_bytes(bytes);
            let own = NodeId::from_bytes(own);
            let first = delegate_index(&origin, degree);
            prop_assert_eq!(first, delegate_index(&origin, degree));
            prop_assert!(first < degree);
            for mode in [DelegationMode::Prefix, DelegationMode::SelfSkewed] {
                let slot = mode.index(&origin, &own, degree);
                prop_assert_eq!(slot, mode.index(&origin, &own, degree));
                prop_assert!(slot < degree);
            }
        }
    }
}

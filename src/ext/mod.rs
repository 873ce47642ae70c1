//! Language extensions shipped with the engine.
//!
//! The preloaded pseudo-extensions model core language features (match
//! types, comparators, address parts) and are linked into every binary
//! implicitly; the regular extensions are linked only when a script
//! requires them.

pub mod fileinto;
pub mod foreverypart;
pub mod imap4flags;
pub mod regex;
pub mod variables;

use crate::extension::Extension;

/// `@match-type`: owns the core match-type table.
pub struct MatchTypeFeature;

impl Extension for MatchTypeFeature {
    fn name(&self) -> &'static str {
        "@match-type"
    }

    fn preloaded(&self) -> bool {
        true
    }
}

/// `@comparator`: owns the core comparator table.
pub struct ComparatorFeature;

impl Extension for ComparatorFeature {
    fn name(&self) -> &'static str {
        "@comparator"
    }

    fn preloaded(&self) -> bool {
        true
    }
}

/// `@address-part`: owns the core address-part table.
pub struct AddressPartFeature;

impl Extension for AddressPartFeature {
    fn name(&self) -> &'static str {
        "@address-part"
    }

    fn preloaded(&self) -> bool {
        true
    }
}

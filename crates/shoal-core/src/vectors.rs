//! conformance vectors for the hash contract
//!
//! generated once from an independent implementation and checked in. the
//! ledger, the mirror and the circuit must all reproduce them; a mismatch
//! blocks a release.

/// JSON document: mask, note derivations, leaf/node hashes, zero hashes,
/// roots over small leaf sequences and one full inclusion proof
pub const CONFORMANCE_JSON: &str = include_str!("../vectors/conformance.json");

//! spend proof verification seam
//!
//! the accumulator never interprets proof bytes itself. it decodes the
//! public inputs, hands both to a [`ProofVerifier`] and trusts the verdict.

use crate::error::{LedgerError, Result};
use sha2::{Digest, Sha256};
use shoal_core::Felt;
use std::sync::Arc;
use thiserror::Error;

/// number of public inputs of a spend: `[root, spend_nullifier, output_commitment]`
pub const SPEND_PUBLIC_INPUTS: usize = 3;

/// largest proof blob accepted before verification is attempted
pub const MAX_PROOF_SIZE: usize = 64 * 1024;

const DEV_PROOF_DOMAIN: &[u8] = b"shoal.dev-proof.v1";

/// why a verifier refused a proof
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub trait ProofVerifier: Send + Sync {
    fn verify(&self, proof: &[u8], public_inputs: &[Felt]) -> std::result::Result<(), Rejection>;
}

impl<T: ProofVerifier + ?Sized> ProofVerifier for Arc<T> {
    fn verify(&self, proof: &[u8], public_inputs: &[Felt]) -> std::result::Result<(), Rejection> {
        (**self).verify(proof, public_inputs)
    }
}

impl<T: ProofVerifier + ?Sized> ProofVerifier for Box<T> {
    fn verify(&self, proof: &[u8], public_inputs: &[Felt]) -> std::result::Result<(), Rejection> {
        (**self).verify(proof, public_inputs)
    }
}

impl<T: ProofVerifier + ?Sized> ProofVerifier for &T {
    fn verify(&self, proof: &[u8], public_inputs: &[Felt]) -> std::result::Result<(), Rejection> {
        (**self).verify(proof, public_inputs)
    }
}

/// development verifier
///
/// accepts exactly the blob `SHA-256(domain ‖ inputs)`. binds a proof to its
/// public inputs without a circuit, for tests and local networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

impl DigestVerifier {
    /// the only proof this verifier accepts for `public_inputs`
    pub fn prove(public_inputs: &[Felt]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(DEV_PROOF_DOMAIN);
        for input in public_inputs {
            hasher.update(input.as_bytes());
        }
        hasher.finalize().to_vec()
    }
}

impl ProofVerifier for DigestVerifier {
    fn verify(&self, proof: &[u8], public_inputs: &[Felt]) -> std::result::Result<(), Rejection> {
        if proof == Self::prove(public_inputs).as_slice() {
            Ok(())
        } else {
            Err(Rejection::new("proof does not bind public inputs"))
        }
    }
}

/// decoded public inputs of a spend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendInputs {
    pub root: Felt,
    pub nullifier: Felt,
    /// new note inserted by the spend, if any
    pub output: Option<Felt>,
}

impl SpendInputs {
    pub fn new(root: Felt, nullifier: Felt, output: Option<Felt>) -> Self {
        Self { root, nullifier, output }
    }

    /// zero in the last slot means no output note
    pub fn to_public_inputs(&self) -> Vec<Felt> {
        vec![self.root, self.nullifier, self.output.unwrap_or(Felt::ZERO)]
    }

    /// shape checks only; nothing here looks at ledger state
    pub fn decode(proof: &[u8], public_inputs: &[Felt]) -> Result<Self> {
        if public_inputs.len() != SPEND_PUBLIC_INPUTS {
            return Err(LedgerError::Validation(format!(
                "expected {} public inputs, got {}",
                SPEND_PUBLIC_INPUTS,
                public_inputs.len()
            )));
        }
        if proof.is_empty() {
            return Err(LedgerError::Validation("empty proof".into()));
        }
        if proof.len() > MAX_PROOF_SIZE {
            return Err(LedgerError::Validation(format!(
                "proof too large: {} > {} bytes",
                proof.len(),
                MAX_PROOF_SIZE
            )));
        }

        let root = public_inputs[0];
        let nullifier = public_inputs[1];
        if root.is_zero() {
            return Err(LedgerError::Validation("zero root".into()));
        }
        if nullifier.is_zero() {
            return Err(LedgerError::Validation("zero nullifier".into()));
        }

        let output = Some(public_inputs[2]).filter(|c| !c.is_zero());
        Ok(Self { root, nullifier, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> Vec<Felt> {
        vec![Felt::from_u64(11), Felt::from_u64(22), Felt::ZERO]
    }

    #[test]
    fn test_digest_verifier_binds_inputs() {
        let proof = DigestVerifier::prove(&inputs());
        assert!(DigestVerifier.verify(&proof, &inputs()).is_ok());

        let mut other = inputs();
        other[2] = Felt::from_u64(33);
        assert!(DigestVerifier.verify(&proof, &other).is_err());
    }

    #[test]
    fn test_verifier_through_arc() {
        let verifier: Arc<dyn ProofVerifier> = Arc::new(DigestVerifier);
        let proof = DigestVerifier::prove(&inputs());
        assert!(verifier.verify(&proof, &inputs()).is_ok());
    }

    #[test]
    fn test_decode_output_slot() {
        let decoded = SpendInputs::decode(&[1], &inputs()).unwrap();
        assert_eq!(decoded.output, None);
        assert_eq!(decoded.to_public_inputs(), inputs());

        let with_output = [Felt::from_u64(11), Felt::from_u64(22), Felt::from_u64(5)];
        let decoded = SpendInputs::decode(&[1], &with_output).unwrap();
        assert_eq!(decoded.output, Some(Felt::from_u64(5)));
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        assert!(matches!(
            SpendInputs::decode(&[1], &inputs()[..2]),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(SpendInputs::decode(&[], &inputs()), Err(LedgerError::Validation(_))));
        assert!(matches!(
            SpendInputs::decode(&vec![0u8; MAX_PROOF_SIZE + 1], &inputs()),
            Err(LedgerError::Validation(_))
        ));

        let zero_root = [Felt::ZERO, Felt::from_u64(22), Felt::ZERO];
        assert!(matches!(SpendInputs::decode(&[1], &zero_root), Err(LedgerError::Validation(_))));
        let zero_nullifier = [Felt::from_u64(11), Felt::ZERO, Felt::ZERO];
        assert!(matches!(
            SpendInputs::decode(&[1], &zero_nullifier),
            Err(LedgerError::Validation(_))
        ));
    }
}

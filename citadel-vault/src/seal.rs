//! Seal/unseal state machine gating every data-plane operation.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use citadel_crypto::CryptoService;

use crate::error::VaultError;
use crate::shamir;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SealState {
    Sealed,
    Unsealing,
    Unsealed,
}

#[derive(Clone, Debug)]
pub struct SealStatus {
    pub state: SealState,
    pub collected_shares: usize,
    pub total_shares: u8,
    pub threshold: u8,
    pub unsealed_at: Option<DateTime<Utc>>,
}

struct SealInner {
    state: SealState,
    collected: Vec<(u8, Vec<u8>)>,
    crypto: Option<Arc<CryptoService>>,
    unsealed_at: Option<DateTime<Utc>>,
}

/// Guards every data-plane operation behind SEALED/UNSEALING/UNSEALED.
/// The configured master key and the collected shares during UNSEALING are
/// both process-global, protected by one mutex per §5.
pub struct SealService {
    configured_master_key: Vec<u8>,
    total_shares: u8,
    threshold: u8,
    inner: Mutex<SealInner>,
}

impl Drop for SealService {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.configured_master_key.zeroize();
    }
}

impl SealService {
    /// Creates a new seal service. If `auto_unseal` is set, the service
    /// starts UNSEALED without collecting shares; this is a development
    /// convenience only and must never be used in production (§4.2).
    pub fn new(
        master_key: Vec<u8>,
        total_shares: u8,
        threshold: u8,
        auto_unseal: bool,
    ) -> Result<Self, VaultError> {
        if threshold < 2 {
            return Err(VaultError::validation("unseal threshold must be >= 2"));
        }
        if threshold > total_shares {
            return Err(VaultError::validation("unseal threshold cannot exceed total shares"));
        }

        shamir::init();

        let crypto = if auto_unseal {
            Some(Arc::new(CryptoService::new(master_key.clone())?))
        } else {
            None
        };
        let state = if auto_unseal { SealState::Unsealed } else { SealState::Sealed };
        let unsealed_at = if auto_unseal { Some(Utc::now()) } else { None };

        Ok(Self {
            configured_master_key: master_key,
            total_shares,
            threshold,
            inner: Mutex::new(SealInner { state, collected: Vec::new(), crypto, unsealed_at }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SealInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SealStatus {
        let inner = self.lock();
        SealStatus {
            state: inner.state,
            collected_shares: inner.collected.len(),
            total_shares: self.total_shares,
            threshold: self.threshold,
            unsealed_at: inner.unsealed_at,
        }
    }

    /// Returns the crypto service if UNSEALED, otherwise `Sealed`. Every
    /// data-plane operation must call this first.
    pub fn require_unsealed(&self) -> Result<Arc<CryptoService>, VaultError> {
        let inner = self.lock();
        match &inner.crypto {
            Some(crypto) if inner.state == SealState::Unsealed => Ok(crypto.clone()),
            _ => Err(VaultError::Sealed),
        }
    }

    /// Splits the configured master key into `total_shares` Base64 shares
    /// with the given `threshold`. Requires UNSEALED.
    pub fn generate_key_shares(&self) -> Result<Vec<String>, VaultError> {
        {
            let inner = self.lock();
            if inner.state != SealState::Unsealed {
                return Err(VaultError::Sealed);
            }
        }
        let shares = shamir::split(&self.configured_master_key, self.total_shares, self.threshold)?;
        Ok(shares
            .into_iter()
            .map(|(index, bytes)| {
                let mut framed = Vec::with_capacity(1 + bytes.len());
                framed.push(index);
                framed.extend_from_slice(&bytes);
                BASE64.encode(framed)
            })
            .collect())
    }

    /// Submits one key share. Transitions SEALED -> UNSEALING on the first
    /// share, UNSEALED once `threshold` shares reconstruct the configured
    /// master key, or back to SEALED with `UnsealVerifyFailed` if they
    /// don't.
    pub fn submit_key_share(&self, share_b64: &str) -> Result<SealState, VaultError> {
        let mut inner = self.lock();

        if inner.state == SealState::Unsealed {
            return Err(VaultError::Conflict("already unsealed".into()));
        }

        let raw = BASE64
            .decode(share_b64.trim())
            .map_err(|e| VaultError::validation(format!("invalid share encoding: {e}")))?;
        if raw.len() < 2 {
            return Err(VaultError::validation("share too short"));
        }
        let index = raw[0];
        let body = raw[1..].to_vec();

        inner.state = SealState::Unsealing;
        inner.collected.push((index, body));

        if inner.collected.len() < self.threshold as usize {
            return Ok(SealState::Unsealing);
        }

        let reconstructed = shamir::reconstruct(&inner.collected)?;
        if reconstructed != self.configured_master_key {
            inner.collected.clear();
            inner.state = SealState::Sealed;
            return Err(VaultError::UnsealVerifyFailed(
                "reconstructed key did not match the configured master key".into(),
            ));
        }

        let crypto = Arc::new(CryptoService::new(reconstructed)?);
        inner.crypto = Some(crypto);
        inner.state = SealState::Unsealed;
        inner.unsealed_at = Some(Utc::now());
        inner.collected.clear();
        Ok(SealState::Unsealed)
    }

    /// Reseals the vault: clears the crypto handle and any partially
    /// collected shares. Fails if already SEALED.
    pub fn seal(&self) -> Result<(), VaultError> {
        let mut inner = self.lock();
        if inner.state == SealState::Sealed {
            return Err(VaultError::Conflict("already sealed".into()));
        }
        inner.state = SealState::Sealed;
        inner.collected.clear();
        inner.crypto = None;
        inner.unsealed_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_key() -> Vec<u8> {
        vec![0x42u8; 32]
    }

    #[test]
    fn starts_sealed_without_auto_unseal() {
        let svc = SealService::new(master_key(), 5, 3, false).unwrap();
        assert_eq!(svc.status().state, SealState::Sealed);
        assert!(svc.require_unsealed().is_err());
    }

    #[test]
    fn auto_unseal_starts_unsealed() {
        let svc = SealService::new(master_key(), 5, 3, true).unwrap();
        assert_eq!(svc.status().state, SealState::Unsealed);
        assert!(svc.require_unsealed().is_ok());
    }

    #[test]
    fn happy_path_unseal_with_threshold_shares() {
        let svc = SealService::new(master_key(), 5, 3, true).unwrap();
        let shares = svc.generate_key_shares().unwrap();
        assert_eq!(shares.len(), 5);

        svc.seal().unwrap();
        assert_eq!(svc.status().state, SealState::Sealed);

        assert_eq!(svc.submit_key_share(&shares[0]).unwrap(), SealState::Unsealing);
        assert_eq!(svc.submit_key_share(&shares[2]).unwrap(), SealState::Unsealing);
        let result = svc.submit_key_share(&shares[4]).unwrap();
        assert_eq!(result, SealState::Unsealed);
        assert!(svc.status().unsealed_at.is_some());
    }

    #[test]
    fn failure_path_reverts_to_sealed_and_clears_shares() {
        let svc = SealService::new(master_key(), 5, 3, false).unwrap();
        // Bogus shares: correct index framing, random bodies, won't reconstruct.
        let bogus: Vec<String> = (1u8..=3)
            .map(|i| {
                let mut framed = vec![i];
                framed.extend_from_slice(&[7u8; 32]);
                BASE64.encode(framed)
            })
            .collect();

        svc.submit_key_share(&bogus[0]).unwrap();
        svc.submit_key_share(&bogus[1]).unwrap();
        let result = svc.submit_key_share(&bogus[2]);
        assert!(matches!(result, Err(VaultError::UnsealVerifyFailed(_))));
        assert_eq!(svc.status().state, SealState::Sealed);
        assert_eq!(svc.status().collected_shares, 0);
    }

    #[test]
    fn seal_while_sealed_fails() {
        let svc = SealService::new(master_key(), 5, 3, false).unwrap();
        assert!(svc.seal().is_err());
    }

    #[test]
    fn submit_share_while_unsealed_fails() {
        let svc = SealService::new(master_key(), 5, 3, true).unwrap();
        let shares = svc.generate_key_shares().unwrap();
        assert!(svc.submit_key_share(&shares[0]).is_err());
    }

    #[test]
    fn generate_key_shares_requires_unsealed() {
        let svc = SealService::new(master_key(), 5, 3, false).unwrap();
        assert!(svc.generate_key_shares().is_err());
    }
}

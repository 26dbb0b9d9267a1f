//! Credential pool with per-credential concurrency admission.
//!
//! Every credential carries a live in-use counter and a ceiling. Slots are
//! handed out as [`CredentialLease`]s which give the slot back when dropped,
//! so a lease cannot outlive the work it admitted.

use rand::seq::IndexedRandom;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bearer secret for the remote service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: Arc<str>,
    fingerprint: Arc<str>,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret: String = secret.into();
        let fingerprint = fingerprint(&secret);
        Self {
            secret: Arc::from(secret),
            fingerprint: Arc::from(fingerprint),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Non-reversible tag persisted with each job.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Short prefix of the fingerprint, safe for logs.
    pub fn tag(&self) -> &str {
        &self.fingerprint[..8]
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("fingerprint", &self.tag()).finish()
    }
}

/// SHA-256 hex digest of a credential secret.
pub fn fingerprint(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    format!("{hash:x}")
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("No credentials are configured")]
    NoCredentialsConfigured,

    #[error("All credentials are at their concurrency limit, try again later")]
    AllBusy,
}

impl AdmissionError {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::NoCredentialsConfigured => "no_credentials",
            AdmissionError::AllBusy => "all_busy",
        }
    }
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    in_use: u32,
}

#[derive(Debug)]
struct PoolInner {
    slots: Mutex<Vec<Slot>>,
    ceiling: u32,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        // Counters stay consistent under poisoning: every mutation is a single step.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, credential: &Credential) {
        let mut slots = self.lock();
        let Some(slot) = slots
            .iter_mut()
            .find(|s| s.credential.fingerprint() == credential.fingerprint())
        else {
            tracing::warn!(credential = credential.tag(), "Released a credential the pool does not own");
            return;
        };

        if slot.in_use == 0 {
            tracing::warn!(credential = credential.tag(), "Credential in-use counter underflow, clamped to 0");
        } else {
            slot.in_use -= 1;
        }
        publish_in_use(&slots);
    }
}

/// Pool of credentials shared by every job flow in the process.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    inner: Arc<PoolInner>,
}

/// Read-only view of one credential's load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUsage {
    pub tag: String,
    pub in_use: u32,
    pub ceiling: u32,
}

impl CredentialPool {
    pub fn new<I, S>(secrets: I, ceiling: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut slots: Vec<Slot> = Vec::new();
        for secret in secrets {
            let secret: String = secret.into();
            let secret = secret.trim();
            if secret.is_empty() {
                continue;
            }
            let credential = Credential::new(secret);
            if slots.iter().any(|s| s.credential == credential) {
                continue;
            }
            slots.push(Slot { credential, in_use: 0 });
        }

        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(slots),
                ceiling: ceiling.max(1),
            }),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.inner.ceiling
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a slot on a randomly chosen credential that is below its ceiling.
    pub fn acquire(&self) -> Result<CredentialLease, AdmissionError> {
        self.acquire_excluding(&[])
    }

    /// Like [`acquire`](Self::acquire), skipping the given fingerprints.
    pub fn acquire_excluding(&self, excluded: &[String]) -> Result<CredentialLease, AdmissionError> {
        let mut slots = self.inner.lock();
        if slots.is_empty() {
            return Err(AdmissionError::NoCredentialsConfigured);
        }

        let ceiling = self.inner.ceiling;
        let eligible: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use < ceiling)
            .filter(|(_, s)| !excluded.iter().any(|fp| fp == s.credential.fingerprint()))
            .map(|(i, _)| i)
            .collect();

        let Some(&index) = eligible.choose(&mut rand::rng()) else {
            return Err(AdmissionError::AllBusy);
        };

        let slot = &mut slots[index];
        slot.in_use += 1;
        let credential = slot.credential.clone();
        publish_in_use(&slots);

        tracing::debug!(credential = credential.tag(), "Credential slot acquired");
        Ok(CredentialLease {
            pool: Arc::clone(&self.inner),
            credential,
            counted: true,
        })
    }

    /// Re-derive the credential that produced a stored job and take a slot on it.
    ///
    /// A job that already exists remotely has to be observed with its own
    /// credential, so a saturated counter is clamped to the ceiling instead of
    /// rejecting the claim.
    pub fn claim(&self, fingerprint: &str) -> Option<CredentialLease> {
        let mut slots = self.inner.lock();
        let ceiling = self.inner.ceiling;
        let slot = slots
            .iter_mut()
            .find(|s| s.credential.fingerprint() == fingerprint)?;

        let counted = slot.in_use < ceiling;
        if counted {
            slot.in_use += 1;
        } else {
            slot.in_use = ceiling;
            tracing::warn!(
                credential = slot.credential.tag(),
                ceiling,
                "Credential already at its concurrency limit, using it anyway"
            );
        }
        let credential = slot.credential.clone();
        publish_in_use(&slots);

        Some(CredentialLease {
            pool: Arc::clone(&self.inner),
            credential,
            counted,
        })
    }

    /// Give a slot back. Prefer dropping the [`CredentialLease`].
    pub fn release(&self, credential: &Credential) {
        self.inner.release(credential);
    }

    pub fn in_use(&self, fingerprint: &str) -> Option<u32> {
        self.inner
            .lock()
            .iter()
            .find(|s| s.credential.fingerprint() == fingerprint)
            .map(|s| s.in_use)
    }

    pub fn snapshot(&self) -> Vec<SlotUsage> {
        let ceiling = self.inner.ceiling;
        self.inner
            .lock()
            .iter()
            .map(|s| SlotUsage {
                tag: s.credential.tag().to_string(),
                in_use: s.in_use,
                ceiling,
            })
            .collect()
    }
}

fn publish_in_use(slots: &[Slot]) {
    let total: u32 = slots.iter().map(|s| s.in_use).sum();
    metrics::gauge!("video_credentials_in_use").set(f64::from(total));
}

/// A held credential slot. Dropping it releases the slot exactly once.
///
/// A lease claimed past the ceiling holds no slot and releases nothing.
#[derive(Debug)]
pub struct CredentialLease {
    pool: Arc<PoolInner>,
    credential: Credential,
    counted: bool,
}

impl CredentialLease {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if self.counted {
            self.pool.release(&self.credential);
            tracing::debug!(credential = self.credential.tag(), "Credential slot released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_rejects_with_no_credentials() {
        let pool = CredentialPool::new(Vec::<String>::new(), 2);
        assert_eq!(pool.acquire().unwrap_err(), AdmissionError::NoCredentialsConfigured);
    }

    #[test]
    fn blank_and_duplicate_secrets_are_ignored() {
        let pool = CredentialPool::new(["tok-a", " ", "tok-a", "tok-b"], 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn acquire_increments_and_drop_restores() {
        let pool = CredentialPool::new(["tok-a"], 2);
        let fp = fingerprint("tok-a");
        assert_eq!(pool.in_use(&fp), Some(0));

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.credential().secret(), "tok-a");
        assert_eq!(pool.in_use(&fp), Some(1));

        drop(lease);
        assert_eq!(pool.in_use(&fp), Some(0));
    }

    #[test]
    fn saturated_pool_is_all_busy() {
        let pool = CredentialPool::new(["tok-a", "tok-b"], 2);
        let leases: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.snapshot().iter().all(|s| s.in_use == 2));
        assert_eq!(pool.acquire().unwrap_err(), AdmissionError::AllBusy);

        drop(leases);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn acquire_only_picks_credentials_below_ceiling() {
        let pool = CredentialPool::new(["tok-a", "tok-b"], 1);
        let first = pool.acquire().unwrap();
        for _ in 0..20 {
            let second = pool.acquire().unwrap();
            assert_ne!(second.credential(), first.credential());
        }
    }

    #[test]
    fn selection_spreads_across_credentials() {
        let pool = CredentialPool::new(["tok-a", "tok-b", "tok-c"], 5);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let lease = pool.acquire().unwrap();
            seen.insert(lease.credential().fingerprint().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn excluded_credentials_are_skipped() {
        let pool = CredentialPool::new(["tok-a", "tok-b"], 2);
        let excluded = vec![fingerprint("tok-a")];
        for _ in 0..20 {
            let lease = pool.acquire_excluding(&excluded).unwrap();
            assert_eq!(lease.credential().secret(), "tok-b");
        }
        let all = vec![fingerprint("tok-a"), fingerprint("tok-b")];
        assert_eq!(pool.acquire_excluding(&all).unwrap_err(), AdmissionError::AllBusy);
    }

    #[test]
    fn release_clamps_at_zero() {
        let pool = CredentialPool::new(["tok-a"], 2);
        let credential = Credential::new("tok-a");
        pool.release(&credential);
        pool.release(&credential);
        assert_eq!(pool.in_use(credential.fingerprint()), Some(0));
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn claim_clamps_to_ceiling() {
        let pool = CredentialPool::new(["tok-a"], 2);
        let fp = fingerprint("tok-a");
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        let claimed = pool.claim(&fp).expect("credential is configured");
        assert_eq!(claimed.credential().secret(), "tok-a");
        assert_eq!(pool.in_use(&fp), Some(2));

        drop(claimed);
        assert_eq!(pool.in_use(&fp), Some(2));
        drop(_a);
        assert_eq!(pool.in_use(&fp), Some(1));
    }

    #[test]
    fn claim_below_ceiling_takes_a_slot() {
        let pool = CredentialPool::new(["tok-a"], 2);
        let fp = fingerprint("tok-a");

        let claimed = pool.claim(&fp).unwrap();
        assert_eq!(pool.in_use(&fp), Some(1));
        drop(claimed);
        assert_eq!(pool.in_use(&fp), Some(0));
    }

    #[test]
    fn claim_unknown_fingerprint_is_none() {
        let pool = CredentialPool::new(["tok-a"], 2);
        assert!(pool.claim(&fingerprint("tok-z")).is_none());
    }

    #[test]
    fn fingerprint_is_full_sha256_hex() {
        let fp = fingerprint("tok-a");
        assert_eq!(fp.len(), 64);
        assert_ne!(fp, fingerprint("tok-b"));
        assert!(!format!("{:?}", Credential::new("tok-a")).contains("tok-a"));
    }
}

//! Mask selection policies.
//!
//! A [`BlockSelector`] decides which pool members mask a payload block.
//! Three implementations exist:
//! - [`NaturalPoolSelector`]: uniform CSPRNG sample, no correlation with content.
//! - [`WeightedDpSelector`]: content-derived rank perturbed by discrete Laplace
//!   noise, steering reuse toward popular blocks while staying differentially private.
//! - [`DeterministicDedupSelector`]: deterministic pre-encryption, optionally
//!   followed by one of the other two policies.

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::dedup::DedupKey;
use crate::error::{RandomFsError, Result};
use crate::fingerprint::{hash_to_u64, BlockHash};
use crate::pool::MaskPool;

/// Redraws allowed when two DP draws land on the same rank.
const MAX_REDRAWS: usize = 16;

/// Per-block input to a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionContext {
    /// BLAKE3 hash of the (pre-encrypted) payload
    pub fingerprint: BlockHash,
    /// Position of the block within its file
    pub position: u64,
    /// Number of distinct masks to pick
    pub mask_count: usize,
}

/// Chooses mask blocks for one payload block.
pub trait BlockSelector: Send + Sync + std::fmt::Debug {
    /// Short policy name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Pick masks from `pool`. An empty result stores the block as-is.
    fn choose_masks(&self, pool: &MaskPool, ctx: &SelectionContext) -> Result<Vec<BlockHash>>;

    /// Key for deterministic pre-encryption, if this policy applies one.
    fn dedup_key(&self) -> Option<&DedupKey> {
        None
    }
}

/// Uniform random selection from the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalPoolSelector;

impl BlockSelector for NaturalPoolSelector {
    fn name(&self) -> &'static str {
        "natural_pool"
    }

    fn choose_masks(&self, pool: &MaskPool, ctx: &SelectionContext) -> Result<Vec<BlockHash>> {
        pool.select(ctx.mask_count)
    }
}

/// Differentially private, popularity-biased selection.
#[derive(Debug, Clone, Copy)]
pub struct WeightedDpSelector {
    epsilon: f64,
}

impl WeightedDpSelector {
    /// Create a selector with privacy budget `epsilon` (> 0). Lower is noisier.
    pub fn new(epsilon: f64) -> Result<Self> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(RandomFsError::InvalidConfig(format!(
                "epsilon must be a positive finite number, got {epsilon}"
            )));
        }
        Ok(Self { epsilon })
    }

    /// The configured privacy budget.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn base_index(fingerprint: &BlockHash, draw: usize, len: usize) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(fingerprint.as_bytes());
        hasher.update(format!("mask-{draw}").as_bytes());
        let digest = BlockHash(*hasher.finalize().as_bytes());
        (hash_to_u64(&digest) % len as u64) as usize
    }
}

/// Sample a geometric count of failures with continuation probability `alpha`.
fn geometric<R: Rng + ?Sized>(rng: &mut R, alpha: f64) -> i64 {
    if alpha <= 0.0 {
        return 0;
    }
    // u in (0, 1]
    let u: f64 = 1.0 - rng.gen::<f64>();
    let k = (u.ln() / alpha.ln()).floor();
    if k.is_nan() {
        0
    } else {
        k as i64
    }
}

/// Two-sided geometric (discrete Laplace) noise with `P(k) ∝ exp(-epsilon * |k|)`.
pub fn discrete_laplace_noise<R: Rng + ?Sized>(rng: &mut R, epsilon: f64) -> i64 {
    let alpha = (-epsilon).exp();
    geometric(rng, alpha).saturating_sub(geometric(rng, alpha))
}

fn wrap_index(base: usize, noise: i64, len: usize) -> usize {
    (base as i128 + noise as i128).rem_euclid(len as i128) as usize
}

impl BlockSelector for WeightedDpSelector {
    fn name(&self) -> &'static str {
        "weighted_dp"
    }

    fn choose_masks(&self, pool: &MaskPool, ctx: &SelectionContext) -> Result<Vec<BlockHash>> {
        let ranked = pool.ranked();
        let len = ranked.len();
        if len < ctx.mask_count {
            return Err(RandomFsError::PoolUnderflow {
                requested: ctx.mask_count,
                available: len,
            });
        }

        let mut rng = OsRng;
        let mut chosen: Vec<usize> = Vec::with_capacity(ctx.mask_count);
        for draw in 0..ctx.mask_count {
            let base = Self::base_index(&ctx.fingerprint, draw, len);
            let drawn = (0..MAX_REDRAWS)
                .map(|_| wrap_index(base, discrete_laplace_noise(&mut rng, self.epsilon), len))
                .find(|idx| !chosen.contains(idx));
            let idx = match drawn {
                Some(idx) => idx,
                None => (0..len)
                    .map(|offset| (base + offset) % len)
                    .find(|idx| !chosen.contains(idx))
                    .ok_or(RandomFsError::PoolUnderflow {
                        requested: ctx.mask_count,
                        available: len,
                    })?,
            };
            chosen.push(idx);
        }
        Ok(chosen.into_iter().map(|i| ranked[i].hash).collect())
    }
}

/// Deterministic pre-encryption with optional masking on top.
#[derive(Debug)]
pub struct DeterministicDedupSelector {
    key: DedupKey,
    masking: Option<Box<dyn BlockSelector>>,
}

impl DeterministicDedupSelector {
    /// Store ciphertext verbatim, no masks.
    pub fn new(key: DedupKey) -> Self {
        Self { key, masking: None }
    }

    /// Mask the ciphertext with `masking` after pre-encryption.
    pub fn with_masking(key: DedupKey, masking: Box<dyn BlockSelector>) -> Self {
        Self {
            key,
            masking: Some(masking),
        }
    }
}

impl BlockSelector for DeterministicDedupSelector {
    fn name(&self) -> &'static str {
        "deterministic_dedup"
    }

    fn choose_masks(&self, pool: &MaskPool, ctx: &SelectionContext) -> Result<Vec<BlockHash>> {
        match &self.masking {
            Some(inner) => inner.choose_masks(pool, ctx),
            None => Ok(Vec::new()),
        }
    }

    fn dedup_key(&self) -> Option<&DedupKey> {
        Some(&self.key)
    }
}

/// Masking policy, serializable for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskPolicy {
    /// Uniform random masks
    NaturalPool,
    /// Differentially private popularity-biased masks
    WeightedDp {
        /// Privacy budget, lower is noisier
        epsilon: f64,
    },
}

impl MaskPolicy {
    /// Build the selector for this policy.
    pub fn build(&self) -> Result<Box<dyn BlockSelector>> {
        Ok(match *self {
            MaskPolicy::NaturalPool => Box::new(NaturalPoolSelector),
            MaskPolicy::WeightedDp { epsilon } => Box::new(WeightedDpSelector::new(epsilon)?),
        })
    }
}

/// Per-file storage policy.
#[derive(Clone)]
pub enum StorePolicy {
    /// Mask blocks drawn from the pool
    Masked(MaskPolicy),
    /// Deterministic pre-encryption; `masking` of `None` stores ciphertext verbatim
    DeterministicDedup {
        /// Password the keystream is derived from
        password: Zeroizing<String>,
        /// Optional masking applied on top of the ciphertext
        masking: Option<MaskPolicy>,
    },
}

impl std::fmt::Debug for StorePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorePolicy::Masked(policy) => f.debug_tuple("Masked").field(policy).finish(),
            StorePolicy::DeterministicDedup { masking, .. } => f
                .debug_struct("DeterministicDedup")
                .field("password", &"[REDACTED]")
                .field("masking", masking)
                .finish(),
        }
    }
}

impl StorePolicy {
    /// Uniform random masking.
    pub fn natural_pool() -> Self {
        StorePolicy::Masked(MaskPolicy::NaturalPool)
    }

    /// Differentially private masking with budget `epsilon`.
    pub fn weighted_dp(epsilon: f64) -> Self {
        StorePolicy::Masked(MaskPolicy::WeightedDp { epsilon })
    }

    /// Deterministic encryption stored verbatim.
    pub fn deterministic_dedup(password: impl Into<String>) -> Self {
        StorePolicy::DeterministicDedup {
            password: Zeroizing::new(password.into()),
            masking: None,
        }
    }

    /// Deterministic encryption followed by `masking`.
    pub fn deterministic_dedup_masked(password: impl Into<String>, masking: MaskPolicy) -> Self {
        StorePolicy::DeterministicDedup {
            password: Zeroizing::new(password.into()),
            masking: Some(masking),
        }
    }

    /// Build the selector implementing this policy.
    pub fn build_selector(&self) -> Result<Box<dyn BlockSelector>> {
        match self {
            StorePolicy::Masked(policy) => policy.build(),
            StorePolicy::DeterministicDedup { password, masking } => {
                let key = DedupKey::from_password(password.as_str());
                Ok(Box::new(match masking {
                    Some(policy) => DeterministicDedupSelector::with_masking(key, policy.build()?),
                    None => DeterministicDedupSelector::new(key),
                }))
            }
        }
    }
}

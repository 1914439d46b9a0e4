//! Fee policy: confirmation-target urgency and claim-tx fee capping.

use bitcoin::Transaction;

use crate::error::{Error, Result};
use crate::types::{BlockHeight, FeeRate};

/// Below this many blocks to timeout, urgency overrides the caller's preferred
/// sweep confirmation target.
pub const DEFAULT_SWEEP_CONF_TARGET_DELTA: u32 = 18;
/// The urgency-downgraded confirmation target.
pub const DEFAULT_SWEEP_CONF_TARGET: u32 = 9;

/// Decide which confirmation target to ask the fee estimator for, given how close
/// the swap is to its timeout.
pub fn sweep_conf_target(
    current_height: BlockHeight,
    timeout: BlockHeight,
    configured_conf_target: u32,
) -> u32 {
    let remaining = current_height.remaining_until(timeout);
    if remaining <= DEFAULT_SWEEP_CONF_TARGET_DELTA && configured_conf_target > DEFAULT_SWEEP_CONF_TARGET {
        DEFAULT_SWEEP_CONF_TARGET
    } else {
        configured_conf_target
    }
}

/// Outcome of evaluating the claim-tx fee cap against a quoted rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapDecision {
    /// Publish at the quoted rate; it fits under `max_miner_fee`.
    Publish(FeeRate),
    /// The quoted rate would exceed the cap, but the preimage is already public —
    /// we must proceed; republish at the highest rate the cap still allows.
    Bump(FeeRate),
    /// The quoted rate exceeds the cap and nothing has been published yet; wait
    /// for the caller to re-evaluate on the next tick.
    Wait,
}

/// Apply the claim-tx fee cap policy (spec §4.2) to a candidate unsigned claim
/// transaction at a quoted `rate`.
///
/// `preimage_revealed` is true once a claim tx has previously been published for
/// this swap (the preimage is already irrevocably public, so from then on we must
/// publish something rather than let the counterparty win the refund race).
pub fn evaluate_claim_fee_cap(
    max_miner_fee: u64,
    rate: FeeRate,
    unsigned_claim_tx: &Transaction,
    preimage_revealed: bool,
) -> CapDecision {
    let vsize = unsigned_claim_tx.vsize() as u64;
    let quoted_fee = rate.fee_for_vsize(vsize);

    if max_miner_fee > quoted_fee {
        return CapDecision::Publish(rate);
    }

    if preimage_revealed {
        let bumped_rate = FeeRate(max_miner_fee / vsize.max(1));
        return CapDecision::Bump(bumped_rate);
    }

    CapDecision::Wait
}

/// Compute the absolute fee a published claim transaction would carry, verifying
/// it never exceeds `max(max_miner_fee, estimated_fee(target))` (invariant 8, §8).
pub fn published_claim_fee(rate: FeeRate, vsize: u64) -> u64 {
    rate.fee_for_vsize(vsize)
}

/// Validate the fee-cap-monotonicity invariant against a recorded history of
/// published claim-tx fees for a swap with the given cap.
pub fn validate_fee_cap_monotonicity(
    max_miner_fee: u64,
    estimated_fee_at_target: u64,
    published_fees: &[u64],
) -> Result<()> {
    let ceiling = max_miner_fee.max(estimated_fee_at_target);
    if let Some(&overshoot) = published_fees.iter().find(|&&f| f > ceiling) {
        return Err(Error::Transaction(format!(
            "published claim fee {overshoot} exceeds cap {ceiling}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrades_conf_target_near_timeout() {
        let target = sweep_conf_target(BlockHeight(132), BlockHeight(150), 20);
        assert_eq!(target, DEFAULT_SWEEP_CONF_TARGET);
    }

    #[test]
    fn keeps_configured_conf_target_far_from_timeout() {
        let target = sweep_conf_target(BlockHeight(100), BlockHeight(150), 20);
        assert_eq!(target, 20);
    }

    #[test]
    fn keeps_lower_configured_target_even_near_timeout() {
        let target = sweep_conf_target(BlockHeight(140), BlockHeight(150), 5);
        assert_eq!(target, 5);
    }

    #[test]
    fn boundary_at_exactly_delta_downgrades() {
        let target = sweep_conf_target(BlockHeight(132), BlockHeight(150), 20);
        assert_eq!(target, DEFAULT_SWEEP_CONF_TARGET);
        let target = sweep_conf_target(BlockHeight(131), BlockHeight(150), 20);
        assert_eq!(target, 20);
    }
}

//! Gas policy applied to every broadcast attempt

use crate::chain::{FeeData, TransactionRequest};

/// Fill missing fee fields from the node's suggestion.
///
/// EIP-1559 fields win when the node offers them; otherwise legacy pricing.
pub fn fill_fees(request: &mut TransactionRequest, fee: &FeeData) {
    if request.has_fees() {
        return;
    }
    match (fee.max_fee_per_gas, fee.max_priority_fee_per_gas) {
        (Some(max_fee), priority) => {
            request.max_fee_per_gas = Some(max_fee);
            request.max_priority_fee_per_gas = Some(priority.unwrap_or(0).min(max_fee));
        }
        (None, _) => request.gas_price = fee.gas_price,
    }
}

/// Clamp fees to `cap` (wei).
///
/// `maxFeePerGas` is clamped to the cap and `maxPriorityFeePerGas` to a tenth
/// of it; the priority fee never exceeds the max fee afterwards. A legacy
/// `gasPrice` is clamped to the cap. With no cap only the ordering between the
/// two EIP-1559 fields is enforced.
pub fn apply_gas_policy(request: &mut TransactionRequest, cap: Option<u128>) {
    if let Some(max_fee) = request.max_fee_per_gas {
        let max_fee = cap.map_or(max_fee, |cap| max_fee.min(cap));
        request.max_fee_per_gas = Some(max_fee);
        request.max_priority_fee_per_gas = request.max_priority_fee_per_gas.map(|priority| {
            let priority = cap.map_or(priority, |cap| priority.min(cap / 10));
            priority.min(max_fee)
        });
        // EIP-1559 fields take precedence; drop a stray legacy price
        request.gas_price = None;
    } else if let (Some(price), Some(cap)) = (request.gas_price, cap) {
        request.gas_price = Some(price.min(cap));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GWEI: u128 = 1_000_000_000;

    fn eip1559(max_fee: u128, priority: u128) -> TransactionRequest {
        TransactionRequest {
            max_fee_per_gas: Some(max_fee),
            max_priority_fee_per_gas: Some(priority),
            ..Default::default()
        }
    }

    #[test]
    fn test_cap_invariant_grid() {
        let cap = 100 * GWEI;
        let values = [0, 1, GWEI, 5 * GWEI, 10 * GWEI, 50 * GWEI, 100 * GWEI, 500 * GWEI];
        for max_fee in values {
            for priority in values {
                let mut req = eip1559(max_fee, priority);
                apply_gas_policy(&mut req, Some(cap));
                let max_fee = req.max_fee_per_gas.unwrap();
                let priority = req.max_priority_fee_per_gas.unwrap();
                assert!(max_fee <= cap);
                assert!(priority <= cap / 10);
                assert!(max_fee >= priority, "{} < {}", max_fee, priority);
            }
        }
    }

    #[test]
    fn test_priority_above_max_fee_without_cap() {
        let mut req = eip1559(3 * GWEI, 5 * GWEI);
        apply_gas_policy(&mut req, None);
        assert_eq!(req.max_fee_per_gas, Some(3 * GWEI));
        assert_eq!(req.max_priority_fee_per_gas, Some(3 * GWEI));
    }

    #[test]
    fn test_legacy_price_clamped() {
        let mut req = TransactionRequest {
            gas_price: Some(900 * GWEI),
            ..Default::default()
        };
        apply_gas_policy(&mut req, Some(100 * GWEI));
        assert_eq!(req.gas_price, Some(100 * GWEI));
        assert_eq!(req.max_fee_per_gas, None);
    }

    #[test]
    fn test_fill_fees_prefers_eip1559() {
        let fee = FeeData {
            max_fee_per_gas: Some(40 * GWEI),
            max_priority_fee_per_gas: Some(2 * GWEI),
            gas_price: Some(20 * GWEI),
        };
        let mut req = TransactionRequest::default();
        fill_fees(&mut req, &fee);
        assert_eq!(req.max_fee_per_gas, Some(40 * GWEI));
        assert_eq!(req.max_priority_fee_per_gas, Some(2 * GWEI));
        assert_eq!(req.gas_price, None);

        let legacy_only = FeeData {
            gas_price: Some(20 * GWEI),
            ..Default::default()
        };
        let mut req = TransactionRequest::default();
        fill_fees(&mut req, &legacy_only);
        assert_eq!(req.gas_price, Some(20 * GWEI));
    }

    #[test]
    fn test_fill_fees_keeps_builder_fees() {
        let mut req = eip1559(7 * GWEI, GWEI);
        fill_fees(
            &mut req,
            &FeeData {
                max_fee_per_gas: Some(40 * GWEI),
                ..Default::default()
            },
        );
        assert_eq!(req.max_fee_per_gas, Some(7 * GWEI));
    }
}

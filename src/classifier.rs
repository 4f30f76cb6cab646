//! Activity classification heuristics.
//!
//! Pure, deterministic functions over enhanced transaction payloads:
//! transfer-vs-swap classification relative to a target mint, buy/sell
//! direction, swap metadata extraction, and batch-level liquidity-pool
//! hub detection. Nothing here mutates the entity registry.

use std::collections::{HashMap, HashSet};

use crate::entities::dex_name;
use crate::upstream::types::{
    EnhancedTransaction, SwapDirection, SwapInfo, Transfer, TxType, WRAPPED_SOL_MINT,
};

/// Wrapped-SOL movements at or below this UI amount are routing dust and
/// do not count toward the significant-mint set.
const WSOL_DUST_CEILING: f64 = 0.1;

/// Minimum unique counterparties for pool-hub detection.
const POOL_MIN_COUNTERPARTIES: usize = 10;
/// Minimum swap participations for pool-hub detection.
const POOL_MIN_SWAPS: usize = 5;

/// Distinct mints moved by the transaction, excluding wrapped-SOL dust.
fn significant_mints(tx: &EnhancedTransaction) -> HashSet<&str> {
    tx.token_transfers
        .iter()
        .filter(|t| !(t.mint == WRAPPED_SOL_MINT && t.token_amount <= WSOL_DUST_CEILING))
        .map(|t| t.mint.as_str())
        .collect()
}

/// Classify a transaction's activity relative to a target mint.
///
/// A single-mint movement is a transfer for the target even when the
/// upstream tags the transaction SWAP: DEX-routed movements of one token
/// are plain transfers from the target's point of view.
pub fn classify_tx_type(tx: &EnhancedTransaction, _target_mint: &str) -> TxType {
    let kind = tx.tx_kind.as_deref().unwrap_or("");
    if kind.eq_ignore_ascii_case("TRANSFER") {
        return TxType::Transfer;
    }

    let mints = significant_mints(tx);
    if mints.len() < 2 {
        return TxType::Transfer;
    }

    let has_swap_event = tx.events.as_ref().is_some_and(|e| e.swap.is_some());
    if has_swap_event || kind.to_ascii_uppercase().contains("SWAP") || mints.len() >= 2 {
        return TxType::Swap;
    }

    TxType::Unknown
}

/// Infer the swap side relative to `target_mint`.
///
/// The fee payer is the acting wallet: a transfer of the target crediting
/// it is a buy, debiting it a sell. Falls back to the swap event's legs,
/// then to the first native transfer's source wallet.
pub fn swap_direction(tx: &EnhancedTransaction, target_mint: &str) -> Option<SwapDirection> {
    if let Some(fee_payer) = tx.fee_payer.as_deref() {
        if let Some(direction) = direction_for_wallet(tx, target_mint, fee_payer) {
            return Some(direction);
        }
    }

    if let Some(swap) = tx.events.as_ref().and_then(|e| e.swap.as_ref()) {
        if swap
            .token_outputs
            .iter()
            .any(|leg| leg.mint.as_deref() == Some(target_mint))
        {
            return Some(SwapDirection::Buy);
        }
        if swap
            .token_inputs
            .iter()
            .any(|leg| leg.mint.as_deref() == Some(target_mint))
        {
            return Some(SwapDirection::Sell);
        }
    }

    let native_source = tx
        .native_transfers
        .first()
        .and_then(|n| n.from_user_account.as_deref())?;
    direction_for_wallet(tx, target_mint, native_source)
}

fn direction_for_wallet(
    tx: &EnhancedTransaction,
    target_mint: &str,
    wallet: &str,
) -> Option<SwapDirection> {
    for transfer in tx.token_transfers.iter().filter(|t| t.mint == target_mint) {
        if transfer.to_user_account.as_deref() == Some(wallet) {
            return Some(SwapDirection::Buy);
        }
        if transfer.from_user_account.as_deref() == Some(wallet) {
            return Some(SwapDirection::Sell);
        }
    }
    None
}

/// Extract swap metadata: the DEX (first known program in the instruction
/// list, falling back to instruction account keys) and the in/out legs of
/// the swap event when present.
pub fn swap_info(tx: &EnhancedTransaction) -> SwapInfo {
    let mut dex = tx
        .instructions
        .iter()
        .filter_map(|ix| ix.program_id.as_deref())
        .find_map(dex_name);
    if dex.is_none() {
        dex = tx
            .instructions
            .iter()
            .flat_map(|ix| ix.accounts.iter())
            .find_map(|account| dex_name(account));
    }

    let swap = tx.events.as_ref().and_then(|e| e.swap.as_ref());
    let input = swap.and_then(|s| s.token_inputs.first());
    let output = swap.and_then(|s| s.token_outputs.first());

    SwapInfo {
        dex: dex.map(str::to_string),
        token_in: input.and_then(|leg| leg.mint.clone()),
        token_out: output.and_then(|leg| leg.mint.clone()),
        amount_in: input
            .and_then(|leg| leg.raw_token_amount.as_ref())
            .map(|raw| raw.token_amount.clone()),
        amount_out: output
            .and_then(|leg| leg.raw_token_amount.as_ref())
            .map(|raw| raw.token_amount.clone()),
    }
}

/// Flatten one enhanced transaction into transfers of `target_mint`,
/// classifying the transaction once and annotating every emitted transfer
/// with the transaction-level type, direction and swap metadata.
pub fn transfers_for_mint(tx: &EnhancedTransaction, target_mint: &str) -> Vec<Transfer> {
    let tx_type = classify_tx_type(tx, target_mint);
    let (direction, info) = if tx_type == TxType::Swap {
        (swap_direction(tx, target_mint), Some(swap_info(tx)))
    } else {
        (None, None)
    };

    tx.token_transfers
        .iter()
        .enumerate()
        .filter(|(_, t)| t.mint == target_mint)
        .map(|(index, t)| Transfer {
            signature: tx.signature.clone(),
            from_address: t.from_user_account.clone().unwrap_or_default(),
            to_address: t.to_user_account.clone().unwrap_or_default(),
            token_mint: t.mint.clone(),
            amount: t.raw_amount(),
            decimals: t.decimals(),
            instruction_index: index as u32,
            block_time: tx.timestamp.unwrap_or(0),
            tx_type,
            swap_direction: direction,
            swap_info: info.clone(),
        })
        .collect()
}

/// Detect likely liquidity-pool hubs in a batch of transfers.
///
/// An address qualifies with at least ten unique counterparties and at
/// least five swap participations across the batch.
pub fn detect_pool_hubs(transfers: &[Transfer]) -> HashSet<String> {
    let mut counterparties: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut swap_counts: HashMap<&str, usize> = HashMap::new();

    for transfer in transfers {
        let from = transfer.from_address.as_str();
        let to = transfer.to_address.as_str();
        if from.is_empty() || to.is_empty() {
            continue;
        }
        counterparties.entry(from).or_default().insert(to);
        counterparties.entry(to).or_default().insert(from);
        if transfer.tx_type == TxType::Swap {
            *swap_counts.entry(from).or_default() += 1;
            *swap_counts.entry(to).or_default() += 1;
        }
    }

    counterparties
        .into_iter()
        .filter(|(address, peers)| {
            peers.len() >= POOL_MIN_COUNTERPARTIES
                && swap_counts.get(address).copied().unwrap_or(0) >= POOL_MIN_SWAPS
        })
        .map(|(address, _)| address.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::types::{EnhancedTokenTransfer, NativeTransfer, SwapEvent, TxEvents};

    fn token_transfer(from: &str, to: &str, mint: &str, amount: f64) -> EnhancedTokenTransfer {
        EnhancedTokenTransfer {
            from_user_account: Some(from.to_string()),
            to_user_account: Some(to.to_string()),
            mint: mint.to_string(),
            token_amount: amount,
            decimals: Some(6),
            token_standard: None,
        }
    }

    fn base_tx(kind: &str) -> EnhancedTransaction {
        EnhancedTransaction {
            signature: "sig".into(),
            tx_kind: Some(kind.to_string()),
            source: None,
            fee_payer: None,
            fee: Some(5000),
            slot: Some(1),
            timestamp: Some(1_700_000_000),
            token_transfers: vec![],
            native_transfers: vec![],
            events: None,
            instructions: vec![],
        }
    }

    #[test]
    fn upstream_transfer_tag_wins() {
        let mut tx = base_tx("TRANSFER");
        tx.token_transfers = vec![
            token_transfer("a", "b", "MintA", 10.0),
            token_transfer("b", "a", "MintB", 5.0),
        ];
        assert_eq!(classify_tx_type(&tx, "MintA"), TxType::Transfer);
    }

    #[test]
    fn single_mint_swap_is_reclassified_as_transfer() {
        let mut tx = base_tx("SWAP");
        tx.token_transfers = vec![token_transfer("a", "b", "MintA", 10.0)];
        assert_eq!(classify_tx_type(&tx, "MintA"), TxType::Transfer);
    }

    #[test]
    fn wsol_dust_does_not_count_as_significant() {
        let mut tx = base_tx("SWAP");
        tx.token_transfers = vec![
            token_transfer("a", "b", "MintA", 10.0),
            token_transfer("b", "a", WRAPPED_SOL_MINT, 0.05),
        ];
        assert_eq!(classify_tx_type(&tx, "MintA"), TxType::Transfer);

        // Above the dust ceiling the wrapped-SOL leg makes it a swap.
        tx.token_transfers[1].token_amount = 2.0;
        assert_eq!(classify_tx_type(&tx, "MintA"), TxType::Swap);
    }

    #[test]
    fn two_mints_classify_as_swap() {
        let mut tx = base_tx("UNKNOWN");
        tx.token_transfers = vec![
            token_transfer("pool", "user", "MintA", 100.0),
            token_transfer("user", "pool", "Usdc", 5.0),
        ];
        assert_eq!(classify_tx_type(&tx, "MintA"), TxType::Swap);
    }

    #[test]
    fn fee_payer_credit_is_buy() {
        let mut tx = base_tx("SWAP");
        tx.fee_payer = Some("user".into());
        tx.token_transfers = vec![
            token_transfer("pool", "user", "MintA", 100.0),
            token_transfer("user", "pool", "Usdc", 5.0),
        ];
        assert_eq!(swap_direction(&tx, "MintA"), Some(SwapDirection::Buy));
        assert_eq!(swap_direction(&tx, "Usdc"), Some(SwapDirection::Sell));
    }

    #[test]
    fn swap_event_fallback_when_fee_payer_uninvolved() {
        let mut tx = base_tx("SWAP");
        tx.fee_payer = Some("relayer".into());
        tx.token_transfers = vec![
            token_transfer("pool", "user", "MintA", 100.0),
            token_transfer("user", "pool", "Usdc", 5.0),
        ];
        tx.events = Some(TxEvents {
            swap: Some(SwapEvent {
                token_inputs: vec![],
                token_outputs: vec![crate::upstream::types::SwapTokenLeg {
                    user_account: Some("user".into()),
                    mint: Some("MintA".into()),
                    raw_token_amount: None,
                }],
            }),
        });
        assert_eq!(swap_direction(&tx, "MintA"), Some(SwapDirection::Buy));
    }

    #[test]
    fn native_transfer_fallback() {
        let mut tx = base_tx("SWAP");
        tx.token_transfers = vec![
            token_transfer("pool", "user", "MintA", 100.0),
            token_transfer("user", "pool", "Usdc", 5.0),
        ];
        tx.native_transfers = vec![NativeTransfer {
            from_user_account: Some("user".into()),
            to_user_account: Some("pool".into()),
            amount: 1_000_000,
        }];
        assert_eq!(swap_direction(&tx, "MintA"), Some(SwapDirection::Buy));
    }

    #[test]
    fn transfers_for_mint_annotates_swaps() {
        let mut tx = base_tx("SWAP");
        tx.fee_payer = Some("user".into());
        tx.token_transfers = vec![
            token_transfer("pool", "user", "MintA", 100.0),
            token_transfer("user", "pool", "Usdc", 5.0),
        ];
        let transfers = transfers_for_mint(&tx, "MintA");
        assert_eq!(transfers.len(), 1);
        let t = &transfers[0];
        assert_eq!(t.tx_type, TxType::Swap);
        assert_eq!(t.swap_direction, Some(SwapDirection::Buy));
        assert_eq!(t.amount, 100_000_000);
        assert_eq!(t.from_address, "pool");
    }

    #[test]
    fn pool_hub_detection_thresholds() {
        let mut transfers = Vec::new();
        // "hub" swaps with 10 unique counterparties
        for i in 0..10 {
            transfers.push(Transfer {
                signature: format!("sig{}", i),
                from_address: "hub".into(),
                to_address: format!("wallet{}", i),
                token_mint: "MintA".into(),
                amount: 1_000,
                decimals: 6,
                instruction_index: 0,
                block_time: 1_700_000_000 + i,
                tx_type: TxType::Swap,
                swap_direction: None,
                swap_info: None,
            });
        }
        let hubs = detect_pool_hubs(&transfers);
        assert!(hubs.contains("hub"));
        // counterparties only ever saw one peer
        assert!(!hubs.contains("wallet0"));
    }

    #[test]
    fn pool_hub_requires_swap_participation() {
        let mut transfers = Vec::new();
        for i in 0..12 {
            transfers.push(Transfer {
                signature: format!("sig{}", i),
                from_address: "hub".into(),
                to_address: format!("wallet{}", i),
                token_mint: "MintA".into(),
                amount: 1_000,
                decimals: 6,
                instruction_index: 0,
                block_time: 1_700_000_000 + i,
                tx_type: TxType::Transfer,
                swap_direction: None,
                swap_info: None,
            });
        }
        assert!(detect_pool_hubs(&transfers).is_empty());
    }
}

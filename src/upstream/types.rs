//! Wire models for the enhanced-RPC provider and the parsed domain types.
//!
//! Two payload families come back from the upstream: plain JSON-RPC
//! (`getTransaction`, `getSignaturesForAddress`, token-account queries)
//! and the enhanced-transactions API with pre-parsed token transfers and
//! swap events. Decimal-to-integer conversion happens once here, at the
//! boundary; everything past this module works in exact `u128` amounts.

use serde::{Deserialize, Serialize};

/// Wrapped-SOL mint, excluded from significant-mint counting below a dust
/// threshold.
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Fallback when the enhanced payload omits token decimals (SPL default).
pub const DEFAULT_TOKEN_DECIMALS: u8 = 9;

/// Convert a UI token amount to its exact raw integer representation:
/// `floor(ui_amount * 10^decimals)`.
pub fn ui_amount_to_raw(ui_amount: f64, decimals: u8) -> u128 {
    if !ui_amount.is_finite() || ui_amount <= 0.0 {
        return 0;
    }
    let scaled = ui_amount * 10f64.powi(decimals.min(18) as i32);
    scaled.floor() as u128
}

/// serde adapter: `u128` amounts as decimal strings on the wire.
pub mod amount_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>().map_err(de::Error::custom)
    }
}

/// Classification of a transaction's token activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Transfer,
    Swap,
    Unknown,
}

/// Swap side relative to a target mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapDirection {
    Buy,
    Sell,
}

/// Extracted swap metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInfo {
    /// DEX name resolved from the program-ID table, if any
    pub dex: Option<String>,
    pub token_in: Option<String>,
    pub token_out: Option<String>,
    /// Raw input amount as a decimal string
    pub amount_in: Option<String>,
    /// Raw output amount as a decimal string
    pub amount_out: Option<String>,
}

/// A single parsed token movement. Immutable once parsed.
///
/// Self-transfers are legal: `from_address == to_address` is not ruled out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub signature: String,
    pub from_address: String,
    pub to_address: String,
    pub token_mint: String,
    /// Exact raw amount; never floating point past the adapter boundary
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub decimals: u8,
    pub instruction_index: u32,
    /// Unix seconds
    pub block_time: i64,
    pub tx_type: TxType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_direction: Option<SwapDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_info: Option<SwapInfo>,
}

/// A transaction resolved through plain JSON-RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub signature: String,
    pub block_time: Option<i64>,
    pub slot: u64,
    pub fee: u64,
    pub success: bool,
    /// Account addresses in on-chain order
    pub accounts: Vec<String>,
    /// Opaque structured instruction list, forwarded to the intent service
    pub instructions: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Enhanced-transactions API payloads
// ---------------------------------------------------------------------------

/// One entry of the enhanced transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedTransaction {
    pub signature: String,
    /// Upstream's own classification tag, e.g. "TRANSFER" or "SWAP"
    #[serde(rename = "type", default)]
    pub tx_kind: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub fee_payer: Option<String>,
    #[serde(default)]
    pub fee: Option<u64>,
    #[serde(default)]
    pub slot: Option<u64>,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub token_transfers: Vec<EnhancedTokenTransfer>,
    #[serde(default)]
    pub native_transfers: Vec<NativeTransfer>,
    #[serde(default)]
    pub events: Option<TxEvents>,
    #[serde(default)]
    pub instructions: Vec<EnhancedInstruction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedTokenTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    pub mint: String,
    /// UI amount; converted to raw once, with [`ui_amount_to_raw`]
    pub token_amount: f64,
    #[serde(default)]
    pub decimals: Option<u8>,
    #[serde(default)]
    pub token_standard: Option<String>,
}

impl EnhancedTokenTransfer {
    pub fn raw_amount(&self) -> u128 {
        ui_amount_to_raw(self.token_amount, self.decimals())
    }

    pub fn decimals(&self) -> u8 {
        self.decimals.unwrap_or(DEFAULT_TOKEN_DECIMALS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    /// Lamports
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxEvents {
    #[serde(default)]
    pub swap: Option<SwapEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    #[serde(default)]
    pub token_inputs: Vec<SwapTokenLeg>,
    #[serde(default)]
    pub token_outputs: Vec<SwapTokenLeg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapTokenLeg {
    #[serde(default)]
    pub user_account: Option<String>,
    #[serde(default)]
    pub mint: Option<String>,
    #[serde(default)]
    pub raw_token_amount: Option<RawTokenAmount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenAmount {
    /// Raw integer amount as a decimal string
    pub token_amount: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedInstruction {
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
}

// ---------------------------------------------------------------------------
// Plain JSON-RPC payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSignatureInfo {
    pub signature: String,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    pub transaction: RpcTransactionData,
    #[serde(default)]
    pub meta: Option<RpcTransactionMeta>,
}

#[derive(Debug, Deserialize)]
pub struct RpcTransactionData {
    pub signatures: Vec<String>,
    pub message: RpcTransactionMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransactionMessage {
    pub account_keys: Vec<RpcAccountKey>,
    #[serde(default)]
    pub instructions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RpcAccountKey {
    pub pubkey: String,
    #[serde(default)]
    pub signer: bool,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Debug, Deserialize)]
pub struct RpcTransactionMeta {
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    pub fee: u64,
}

impl RpcTransaction {
    /// Flatten the RPC shape into the domain type.
    pub fn into_parsed(self) -> ParsedTransaction {
        let success = self
            .meta
            .as_ref()
            .map(|m| m.err.is_none() || m.err.as_ref().is_some_and(|e| e.is_null()))
            .unwrap_or(false);
        ParsedTransaction {
            signature: self.transaction.signatures.first().cloned().unwrap_or_default(),
            block_time: self.block_time,
            slot: self.slot,
            fee: self.meta.as_ref().map(|m| m.fee).unwrap_or(0),
            success,
            accounts: self
                .transaction
                .message
                .account_keys
                .iter()
                .map(|k| k.pubkey.clone())
                .collect(),
            instructions: self.transaction.message.instructions,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcTokenLargestAccounts {
    pub value: Vec<RpcTokenAccountBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTokenAccountBalance {
    pub address: String,
    #[serde(default)]
    pub ui_amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RpcAccountInfo {
    pub value: Option<RpcAccountValue>,
}

#[derive(Debug, Deserialize)]
pub struct RpcAccountValue {
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RpcAccountValue {
    /// Owner wallet of a parsed SPL token account, when present.
    pub fn token_account_owner(&self) -> Option<String> {
        self.data
            .get("parsed")?
            .get("info")?
            .get("owner")?
            .as_str()
            .map(str::to_string)
    }
}

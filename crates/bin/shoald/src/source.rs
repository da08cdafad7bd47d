//! where ledger events come from
//!
//! the syncer needs the current head, the insertion events of a block range
//! and the pool contract's view of its own roots. [`RpcLedgerSource`] reads
//! them from a starknet-style JSON-RPC node; tests plug in the in-process
//! ledger.

use crate::error::{Result, ShoaldError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use shoal_core::{mask, EventId, EventPosition, Felt, LedgerEvent};
use tracing::debug;

/// selector of the leaf insertion event (`sn_keccak("Deposit")`)
pub const DEPOSIT_EVENT_SELECTOR: &str =
    "0x9149d2123147c5f43d258257fef0b7b969db78269369ebcf5ebb9eef8592f2";

/// events requested per `starknet_getEvents` page
pub const EVENTS_CHUNK_SIZE: u64 = 1000;

#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// latest block number
    async fn head(&self) -> Result<u64>;

    /// insertion events of blocks `from_block..=to_block`, in canonical order
    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<LedgerEvent>>;

    /// current root of the ledger's commitment tree
    async fn ledger_root(&self) -> Result<Felt>;

    /// whether the ledger still accepts spend proofs against `root`
    async fn is_root_known(&self, root: &Felt) -> Result<bool>;

    async fn is_nullifier_spent(&self, nullifier: &Felt) -> Result<bool>;
}

#[derive(Clone)]
pub struct RpcLedgerSource {
    url: String,
    contract: String,
    selector: String,
    client: Client,
}

/// `sn_keccak(name)`: keccak-256 truncated to 250 bits, as starknet derives
/// entry point and event selectors
pub fn selector(name: &str) -> String {
    let digest: [u8; 32] = Keccak256::digest(name.as_bytes()).into();
    let hex = mask(digest).to_hex();
    let digits = hex.trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        "0x0".into()
    } else {
        format!("0x{}", digits)
    }
}

impl RpcLedgerSource {
    /// `contract` and `selector` are full-width starknet felts, kept as hex
    pub fn new(url: &str, contract: &str, selector: &str) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            contract: normalize_hex(contract)?,
            selector: normalize_hex(selector)?,
            client: Client::new(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": "shoald",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ShoaldError::Rpc(e.to_string()))?;

        let json: RpcResponse = response
            .json()
            .await
            .map_err(|e| ShoaldError::Rpc(e.to_string()))?;

        if let Some(error) = json.error {
            return Err(ShoaldError::Rpc(format!(
                "RPC error {}: {}",
                error.code, error.message
            )));
        }

        json.result
            .ok_or_else(|| ShoaldError::Rpc("no result in response".into()))
    }

    /// `starknet_call` against the pool contract at the latest block
    async fn call_contract(&self, entry_point: &str, calldata: &[Felt]) -> Result<Vec<String>> {
        let calldata: Vec<String> = calldata
            .iter()
            .map(|f| normalize_hex(&f.to_hex()))
            .collect::<Result<_>>()?;
        let params = json!({
            "request": {
                "contract_address": self.contract,
                "entry_point_selector": selector(entry_point),
                "calldata": calldata,
            },
            "block_id": "latest",
        });

        let result = self.call("starknet_call", params).await?;
        let values: Vec<String> =
            serde_json::from_value(result).map_err(|e| ShoaldError::Rpc(e.to_string()))?;
        if values.is_empty() {
            return Err(ShoaldError::Rpc(format!("empty response from {}", entry_point)));
        }
        Ok(values)
    }
}

#[async_trait]
impl LedgerSource for RpcLedgerSource {
    async fn head(&self) -> Result<u64> {
        let result = self.call("starknet_blockNumber", json!([])).await?;
        serde_json::from_value(result).map_err(|e| ShoaldError::Rpc(e.to_string()))
    }

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<LedgerEvent>> {
        let mut raw = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut filter = json!({
                "from_block": { "block_number": from_block },
                "to_block": { "block_number": to_block },
                "address": self.contract,
                "keys": [[self.selector]],
                "chunk_size": EVENTS_CHUNK_SIZE,
            });
            if let Some(token) = &continuation_token {
                filter["continuation_token"] = json!(token);
            }

            let result = self.call("starknet_getEvents", json!({ "filter": filter })).await?;
            let page: EventsPage =
                serde_json::from_value(result).map_err(|e| ShoaldError::Rpc(e.to_string()))?;
            raw.extend(page.events);

            continuation_token = page.continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }

        debug!("fetched {} events from blocks {}..={}", raw.len(), from_block, to_block);
        parse_events(&raw, &self.selector)
    }

    async fn ledger_root(&self) -> Result<Felt> {
        let values = self.call_contract("get_merkle_root", &[]).await?;
        Ok(Felt::from_hex(&values[0])?)
    }

    async fn is_root_known(&self, root: &Felt) -> Result<bool> {
        let values = self.call_contract("is_root_known", &[*root]).await?;
        parse_bool(&values[0])
    }

    async fn is_nullifier_spent(&self, nullifier: &Felt) -> Result<bool> {
        let values = self.call_contract("is_nullifier_spent", &[*nullifier]).await?;
        parse_bool(&values[0])
    }
}

/// cairo `bool`: zero is false, anything else true
fn parse_bool(value: &str) -> Result<bool> {
    Ok(normalize_hex(value)? != "0x0")
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    events: Vec<RawEvent>,
    continuation_token: Option<String>,
}

/// `EMITTED_EVENT` as returned by `starknet_getEvents`
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub keys: Vec<String>,
    pub data: Vec<String>,
    /// absent for events of pending blocks
    pub block_number: Option<u64>,
    pub transaction_hash: String,
}

/// turn a page of raw events into ledger events
///
/// the node returns events in canonical order but without transaction or
/// event indices, so positions are assigned by counting: a new transaction
/// hash within a block bumps the tx ordinal, each further event of the same
/// transaction bumps the event ordinal. events of other kinds and of pending
/// blocks are skipped.
pub fn parse_events(raw: &[RawEvent], selector: &str) -> Result<Vec<LedgerEvent>> {
    let selector = normalize_hex(selector)?;
    let mut events = Vec::with_capacity(raw.len());
    let mut last: Option<(u64, String)> = None;
    let mut tx: u32 = 0;
    let mut event: u32 = 0;

    for item in raw {
        let Some(block) = item.block_number else {
            continue;
        };

        match &last {
            Some((b, hash)) if *b == block && *hash == item.transaction_hash => event += 1,
            Some((b, _)) if *b == block => {
                tx += 1;
                event = 0;
            }
            _ => {
                tx = 0;
                event = 0;
            }
        }
        last = Some((block, item.transaction_hash.clone()));

        let is_insertion = item
            .keys
            .iter()
            .any(|k| normalize_hex(k).map(|k| k == selector).unwrap_or(false));
        if !is_insertion {
            continue;
        }

        events.push(parse_event(item, EventPosition::new(block, tx, event))?);
    }

    Ok(events)
}

/// canonical RPC form: lowercase, `0x` prefix, no leading zeros
pub fn normalize_hex(s: &str) -> Result<String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ShoaldError::Validation(format!("invalid felt hex: {}", s)));
    }
    let trimmed = digits.trim_start_matches('0').to_ascii_lowercase();
    if trimmed.is_empty() {
        Ok("0x0".into())
    } else {
        Ok(format!("0x{}", trimmed))
    }
}

/// data layout `[commitment, leaf_index, new_root]`
pub fn parse_event(raw: &RawEvent, position: EventPosition) -> Result<LedgerEvent> {
    if raw.data.len() < 3 {
        return Err(ShoaldError::Validation(format!(
            "insertion event has {} data fields, expected 3",
            raw.data.len()
        )));
    }

    let commitment = Felt::from_hex(&raw.data[0])?;
    let index = Felt::from_hex(&raw.data[1])?
        .to_u64()
        .ok_or_else(|| ShoaldError::Validation(format!("leaf index {} out of range", raw.data[1])))?;
    let new_root = Felt::from_hex(&raw.data[2])?;
    // transaction hashes use the full ledger field width
    let tx_hash = Felt::from_hex_masked(&raw.transaction_hash)?;

    Ok(LedgerEvent {
        id: EventId {
            tx_hash,
            event_index: position.event,
        },
        position,
        commitment,
        index,
        new_root,
    })
}

//! API data transfer objects.
//!
//! These types define the wire contract shared between the server and
//! clients. Field names follow the BIP22-style convention external
//! miners expect (`longpollid`, `curtime`, `previousblockhash`), so
//! every struct carries explicit serde renames.

use serde::{Deserialize, Serialize};

/// Request body for `POST /getblocktemplate`.
///
/// An empty `longpollid` asks for the current template immediately; a
/// previously returned id parks the request until a different
/// template exists.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GetBlockTemplateRequest {
    #[serde(default, rename = "longpollid")]
    pub long_poll_id: String,
}

/// One transaction slot in a template.
///
/// `data` is the hex-encoded native wire form; `txtype` tags it as
/// legacy (`"1"`), post-hardfork (`"2"`), or, for the miner payout
/// pseudo-entry, empty.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TemplateTransaction {
    pub data: String,
    pub hash: String,
    pub txid: String,
    pub depends: Option<Vec<String>>,
    pub fee: u64,
    pub sigops: u64,
    #[serde(rename = "txtype")]
    pub tx_type: String,
}

/// Response body for `POST /getblocktemplate`: a candidate block,
/// complete except for the nonce.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetBlockTemplateResponse {
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "minerpayout")]
    pub miner_payout: Vec<TemplateTransaction>,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(rename = "longpollid")]
    pub long_poll_id: String,
    pub target: String,
    pub height: u64,
    #[serde(rename = "curtime")]
    pub timestamp: u64,
    pub version: u8,
    pub bits: String,
    pub commitment: String,
}

/// Request body for `POST /submitblock`: a single hex-encoded block
/// in the params array, mirroring the classic JSON-RPC shape.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SubmitBlockRequest {
    pub params: Vec<String>,
}

//! HTTP mining API.
//!
//! The API is polymorphic over the chain layer: anything satisfying
//! [`ChainManager`] and [`Syncer`] can host it, including the
//! in-memory manager in [`crate::chain`] and the test fakes in
//! [`crate::testutil`].

pub mod client;
pub mod server;
pub mod template;
pub mod types;

pub use client::Client;
pub use server::{Server, ServerOptions};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::consensus::ChainState;
use crate::types::encoding::DecodeError;
use crate::types::{
    Block, BlockHeader, BlockId, ChainIndex, Transaction, V2BlockOutline, V2Transaction,
};

/// Chain capabilities the mining API consumes.
///
/// Snapshot reads must be cheap: the template builder runs them under
/// the cache lock. Pool snapshots preserve the pool's insertion
/// order, which is the order transactions enter the template.
pub trait ChainManager: Send + Sync {
    fn tip(&self) -> ChainIndex;
    fn tip_state(&self) -> ChainState;
    fn block(&self, id: BlockId) -> Option<Block>;
    fn pool_transactions(&self) -> Vec<Transaction>;
    fn v2_pool_transactions(&self) -> Vec<V2Transaction>;
    fn add_blocks(&self, blocks: Vec<Block>) -> anyhow::Result<()>;

    /// Registers a callback fired on every pool mutation. Dropping
    /// the returned subscription deregisters it.
    fn on_pool_change(&self, f: Box<dyn Fn() + Send + Sync>) -> Subscription;

    /// Registers a callback fired on every tip change, with the new
    /// tip. Dropping the returned subscription deregisters it.
    fn on_reorg(&self, f: Box<dyn Fn(ChainIndex) + Send + Sync>) -> Subscription;
}

/// Gossip capabilities used to announce accepted blocks.
pub trait Syncer: Send + Sync {
    fn broadcast_header(&self, header: BlockHeader) -> anyhow::Result<()>;
    fn broadcast_v2_block_outline(&self, outline: V2BlockOutline) -> anyhow::Result<()>;
}

/// Deregisters a chain listener when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Subscription {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// API failure, mapped onto an HTTP status.
#[derive(Debug, Error)]
pub enum Error {
    #[error("can't use getblocktemplate without specifying a payout address")]
    NoPayoutAddress,
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("couldn't decode block: {0}")]
    DecodeBlock(#[from] DecodeError),
    #[error("failed to add block to chain manager: {0}")]
    ChainReject(#[source] anyhow::Error),
    #[error("failed to broadcast block: {0}")]
    Broadcast(#[source] anyhow::Error),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::NoPayoutAddress => StatusCode::SERVICE_UNAVAILABLE,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) | Error::DecodeBlock(_) => StatusCode::BAD_REQUEST,
            Error::ChainReject(_) | Error::Broadcast(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

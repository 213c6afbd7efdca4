//! Per-swap state machine.
//!
//! A trade advances `Undefined → Proposal → Accepted → Completed`, with
//! `Failed` reachable from every non-terminal state. Transitions are
//! monotonic: terminal states reject every further event with
//! `TradeStatusNotValid`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ports::{SwapAccept, SwapComplete, SwapFail, SwapRequest};
use crate::types::{AssetId, Outpoint};

// ── Status & fail codes ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Undefined,
    Proposal,
    Accepted,
    Completed,
    Failed,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Failed)
    }
}

/// Numeric codes carried by swap fail messages so the counterparty can
/// tell why a negotiation died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SwapFailCode {
    MessageMalformed = 1,
    AssetMismatch = 2,
    AmountMismatch = 3,
    Expired = 4,
    Aborted = 5,
    FailedToComplete = 6,
}

impl SwapFailCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

// ── Trade ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    id: Uuid,
    market_quote_asset: AssetId,
    status: TradeStatus,
    pending: bool,
    swap_request: Option<SwapRequest>,
    swap_accept: Option<SwapAccept>,
    swap_complete: Option<SwapComplete>,
    swap_fail: Option<SwapFail>,
    /// Transaction id of the completed swap, once known.
    txid: Option<String>,
    request_timestamp: u64,
    accept_timestamp: u64,
    complete_timestamp: u64,
    expiry_timestamp: u64,
    locked_outpoints: BTreeSet<Outpoint>,
}

impl Trade {
    pub fn new(market_quote_asset: AssetId) -> Self {
        Self {
            id: Uuid::new_v4(),
            market_quote_asset,
            status: TradeStatus::Undefined,
            pending: false,
            swap_request: None,
            swap_accept: None,
            swap_complete: None,
            swap_fail: None,
            txid: None,
            request_timestamp: 0,
            accept_timestamp: 0,
            complete_timestamp: 0,
            expiry_timestamp: 0,
            locked_outpoints: BTreeSet::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn market_quote_asset(&self) -> AssetId {
        self.market_quote_asset
    }

    pub fn status(&self) -> TradeStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn swap_request(&self) -> Option<&SwapRequest> {
        self.swap_request.as_ref()
    }

    pub fn swap_accept(&self) -> Option<&SwapAccept> {
        self.swap_accept.as_ref()
    }

    pub fn swap_fail(&self) -> Option<&SwapFail> {
        self.swap_fail.as_ref()
    }

    pub fn txid(&self) -> Option<&str> {
        self.txid.as_deref()
    }

    pub fn accept_timestamp(&self) -> u64 {
        self.accept_timestamp
    }

    pub fn expiry_timestamp(&self) -> u64 {
        self.expiry_timestamp
    }

    pub fn locked_outpoints(&self) -> impl Iterator<Item = &Outpoint> {
        self.locked_outpoints.iter()
    }

    /// An accepted trade past its expiry that never completed.
    pub fn is_expired(&self, now: u64) -> bool {
        self.status == TradeStatus::Accepted && now >= self.expiry_timestamp
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Store the counterparty's opening message. Only a fresh trade can
    /// be proposed to.
    pub fn propose(&mut self, request: SwapRequest, now: u64) -> Result<()> {
        if self.status != TradeStatus::Undefined {
            return Err(Error::TradeStatusNotValid);
        }
        self.swap_request = Some(request);
        self.request_timestamp = now;
        self.pending = true;
        self.status = TradeStatus::Proposal;
        Ok(())
    }

    /// Store the provider's accept message and arm the expiry timer. The
    /// caller must have locked `locked_outpoints` in the same storage
    /// transaction.
    pub fn accept(
        &mut self,
        accept: SwapAccept,
        locked_outpoints: impl IntoIterator<Item = Outpoint>,
        now: u64,
        expiry_seconds: u64,
    ) -> Result<()> {
        if self.status != TradeStatus::Proposal {
            return Err(Error::TradeStatusNotValid);
        }
        self.swap_accept = Some(accept);
        self.locked_outpoints = locked_outpoints.into_iter().collect();
        self.accept_timestamp = now;
        self.expiry_timestamp = now + expiry_seconds;
        self.status = TradeStatus::Accepted;
        Ok(())
    }

    /// Store the counterparty's completion and the final txid. Only an
    /// accepted, unexpired trade can complete.
    pub fn complete(&mut self, complete: SwapComplete, txid: String, now: u64) -> Result<()> {
        if self.status != TradeStatus::Accepted {
            return Err(Error::TradeStatusNotValid);
        }
        if self.is_expired(now) {
            return Err(Error::TradeExpired);
        }
        self.swap_complete = Some(complete);
        self.txid = Some(txid);
        self.complete_timestamp = now;
        self.pending = false;
        self.status = TradeStatus::Completed;
        Ok(())
    }

    /// Record a failure. Legal from any non-terminal state.
    pub fn fail(&mut self, code: SwapFailCode, message: impl Into<String>, now: u64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::TradeStatusNotValid);
        }
        let message_id = self
            .swap_accept
            .as_ref()
            .map(|a| a.id.clone())
            .or_else(|| self.swap_request.as_ref().map(|r| r.id.clone()))
            .unwrap_or_default();
        self.swap_fail = Some(SwapFail {
            id: Uuid::new_v4().to_string(),
            message_id,
            code: code.as_u32(),
            message: message.into(),
        });
        if self.complete_timestamp == 0 {
            self.complete_timestamp = now;
        }
        self.pending = false;
        self.status = TradeStatus::Failed;
        Ok(())
    }
}

// ── Operator projection ─────────────────────────────────────────────

/// Flattened view of a trade for ListSwaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapInfo {
    pub trade_id: Uuid,
    pub status: TradeStatus,
    pub amount_p: u64,
    pub asset_p: Option<AssetId>,
    pub amount_r: u64,
    pub asset_r: Option<AssetId>,
    pub market_fee_basis_points: i64,
    pub request_timestamp: u64,
    pub accept_timestamp: u64,
    pub complete_timestamp: u64,
    pub expiry_timestamp: u64,
}

impl Trade {
    pub fn swap_info(&self, market_fee_basis_points: i64) -> SwapInfo {
        let req = self.swap_request.as_ref();
        SwapInfo {
            trade_id: self.id,
            status: self.status,
            amount_p: req.map(|r| r.amount_p).unwrap_or_default(),
            asset_p: req.map(|r| r.asset_p),
            amount_r: req.map(|r| r.amount_r).unwrap_or_default(),
            asset_r: req.map(|r| r.asset_r),
            market_fee_basis_points,
            request_timestamp: self.request_timestamp,
            accept_timestamp: self.accept_timestamp,
            complete_timestamp: self.complete_timestamp,
            expiry_timestamp: self.expiry_timestamp,
        }
    }
}

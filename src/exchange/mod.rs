// =============================================================================
// Exchange Adapter Capability — uniform operations against one perp venue
// =============================================================================
//
// Every operation is uniform across venues; the adapter hides symbol-format
// conversion, authentication, rate-limit friendliness, and precision
// rounding. Traders hold the adapter as `Arc<dyn Exchange>` so tests can
// supply fakes.
// =============================================================================

pub mod binance;
pub mod cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market::Bar;
use crate::types::{Position, PositionSide};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Structured failure kinds at the exchange seam.
///
/// `Transport` is the only retryable kind; everything else is a well-formed
/// venue answer the caller must handle. "Already satisfied" outcomes
/// (leverage unchanged, margin mode already set, nothing to cancel) are
/// swallowed by the adapter and never surface as errors.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("venue rejected request: {0}")]
    VenueReject(String),

    #[error("precision reject: {0}")]
    PrecisionReject(String),

    #[error("insufficient margin: required {required:.2} USDT, available {available:.2} USDT")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("position already open for {symbol} {side}")]
    AlreadyOpen { symbol: String, side: PositionSide },

    #[error("no open position for {symbol} {side}")]
    NoSuchPosition { symbol: String, side: PositionSide },

    #[error("leverage {requested}x out of range for {symbol}")]
    LeverageOutOfRange { symbol: String, requested: u32 },
}

impl ExchangeError {
    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// ---------------------------------------------------------------------------
// Operation inputs / results
// ---------------------------------------------------------------------------

/// Account-level balance summary in quote currency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_wallet: f64,
    pub total_equity: f64,
    pub available: f64,
    pub unrealized_pnl: f64,
    /// Used margin as a fraction of total equity, in [0, 1].
    pub margin_ratio: f64,
}

/// Everything the adapter needs to place an entry order.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: PositionSide,
    /// Raw quantity in base units; the adapter performs lot rounding.
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Venue acknowledgement of a filled (or accepted) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub executed_qty: f64,
    pub avg_price: f64,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Uniform capability over one perpetual-futures venue.
///
/// Caching contract: `get_balance` and `get_positions` may serve a snapshot
/// up to 10 seconds old; every successful mutation invalidates both caches.
/// Readers see either the pre-mutation or the post-mutation snapshot, never a
/// partial view.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_balance(&self) -> Result<AccountBalance, ExchangeError>;

    /// Open positions with zero-quantity (ghost) entries stripped.
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Tolerates "already set".
    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> Result<(), ExchangeError>;

    /// Tolerates "no change".
    async fn set_leverage(
        &self,
        symbol: &str,
        side: Option<PositionSide>,
        leverage: u32,
    ) -> Result<(), ExchangeError>;

    /// Place an entry order with protective stop/take orders.
    ///
    /// The adapter re-reads positions (bypassing cache) and refuses with
    /// `AlreadyOpen` when a same-symbol same-side position exists; rounds the
    /// quantity up to lot size; fails fast with `InsufficientMargin` when the
    /// post-rounding margin exceeds available balance; and sanity-checks the
    /// stop/take prices against current mark price.
    async fn open(&self, req: &OpenRequest) -> Result<OrderFill, ExchangeError>;

    /// Close `quantity` of the position (0 means the full position).
    async fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> Result<OrderFill, ExchangeError>;

    /// Returns the number of orders cancelled (0 is success, not an error).
    async fn cancel_stop_loss(&self, symbol: &str) -> Result<u32, ExchangeError>;
    async fn cancel_take_profit(&self, symbol: &str) -> Result<u32, ExchangeError>;
    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<u32, ExchangeError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError>;

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Live last-trade price; may be momentarily unavailable.
    async fn get_ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Quantity precision in decimal digits.
    async fn get_symbol_precision(&self, symbol: &str) -> Result<u32, ExchangeError>;

    /// Minimum quantity increment.
    async fn get_lot_size(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// OHLCV bars, oldest first. Uncached.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, ExchangeError>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn get_open_interest(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Recent open-interest history (oldest first), for averaging.
    async fn get_open_interest_hist(
        &self,
        symbol: &str,
        points: u32,
    ) -> Result<Vec<f64>, ExchangeError>;
}

// =============================================================================
// Binance USDT-M Futures Adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
//
// Transport failures and 5xx responses are retried up to three times with a
// 2·attempt-second backoff; 4xx responses are never retried.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::exchange::cache::TtlCell;
use crate::exchange::{AccountBalance, Exchange, ExchangeError, OpenRequest, OrderFill};
use crate::market::Bar;
use crate::types::{normalize_symbol, Position, PositionSide};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Freshness window for balance / position snapshots.
const CACHE_TTL: Duration = Duration::from_secs(10);

/// Transport attempts per request.
const MAX_ATTEMPTS: u32 = 3;

/// Per-symbol order filters from exchangeInfo (fetched once, kept for the
/// process lifetime — Binance changes these rarely and never mid-session).
#[derive(Debug, Clone, Copy)]
struct SymbolFilters {
    lot_size: f64,
    quantity_precision: u32,
}

/// Binance USDT-M futures REST adapter with HMAC-SHA256 request signing.
pub struct BinanceFutures {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    balance_cache: TtlCell<AccountBalance>,
    positions_cache: TtlCell<Vec<Position>>,
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl BinanceFutures {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new adapter.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    /// * `testnet` — route requests to the futures testnet.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet {
            "https://testnet.binancefuture.com".to_string()
        } else {
            "https://fapi.binance.com".to_string()
        };

        debug!(base_url = %base_url, "BinanceFutures adapter initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            balance_cache: TtlCell::new(CACHE_TTL),
            positions_cache: TtlCell::new(CACHE_TTL),
            filters: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport with retry
    // -------------------------------------------------------------------------

    /// Send one request, retrying transport failures and 5xx responses with a
    /// 2·attempt-second backoff. 4xx responses surface immediately.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut last_err = ExchangeError::Transport("no attempt made".to_string());

        for attempt in 1..=MAX_ATTEMPTS {
            let qs = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };
            let url = if qs.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, qs)
            };

            let resp = self.client.request(method.clone(), &url).send().await;

            match resp {
                Ok(resp) => {
                    let status = resp.status();
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();

                    if status.is_success() {
                        return Ok(body);
                    }

                    let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
                    let msg = body
                        .get("msg")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();

                    if status.is_server_error() {
                        last_err =
                            ExchangeError::Transport(format!("{path} returned {status}: {msg}"));
                    } else if status.as_u16() == 401 || status.as_u16() == 403 || code == -2015 {
                        return Err(ExchangeError::Auth(format!("{path}: {msg}")));
                    } else {
                        return Err(ExchangeError::VenueReject(format!(
                            "{path} returned {status} (code {code}): {msg}"
                        )));
                    }
                }
                Err(e) => {
                    last_err = ExchangeError::Transport(format!("{path}: {e}"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff = Duration::from_secs(2 * attempt as u64);
                warn!(
                    path,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %last_err,
                    "exchange request failed — retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    // -------------------------------------------------------------------------
    // Uncached reads
    // -------------------------------------------------------------------------

    async fn fetch_balance_uncached(&self) -> Result<AccountBalance, ExchangeError> {
        let body = self
            .send(reqwest::Method::GET, "/fapi/v2/account", "", true)
            .await?;

        let total_wallet = Self::parse_str_f64(&body["totalWalletBalance"]);
        let total_equity = Self::parse_str_f64(&body["totalMarginBalance"]);
        let available = Self::parse_str_f64(&body["availableBalance"]);
        let unrealized_pnl = Self::parse_str_f64(&body["totalUnrealizedProfit"]);
        let used_margin = Self::parse_str_f64(&body["totalInitialMargin"]);

        let margin_ratio = if total_equity > 0.0 {
            used_margin / total_equity
        } else {
            0.0
        };

        Ok(AccountBalance {
            total_wallet,
            total_equity,
            available,
            unrealized_pnl,
            margin_ratio,
        })
    }

    /// Fetch positions from /fapi/v2/positionRisk with zero-quantity (ghost)
    /// entries stripped. In one-way mode the side comes from the sign of
    /// `positionAmt`; in hedge mode the LONG/SHORT entries surface separately.
    async fn fetch_positions_uncached(&self) -> Result<Vec<Position>, ExchangeError> {
        let body = self
            .send(reqwest::Method::GET, "/fapi/v2/positionRisk", "", true)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::VenueReject("positionRisk is not an array".into()))?;

        let mut positions = Vec::new();
        for entry in entries {
            let amt = Self::parse_str_f64(&entry["positionAmt"]);
            if amt == 0.0 {
                // Ghost position — never surfaced upward.
                continue;
            }

            let side = match entry["positionSide"].as_str() {
                Some("LONG") => PositionSide::Long,
                Some("SHORT") => PositionSide::Short,
                _ if amt > 0.0 => PositionSide::Long,
                _ => PositionSide::Short,
            };

            let entry_price = Self::parse_str_f64(&entry["entryPrice"]);
            let mark_price = Self::parse_str_f64(&entry["markPrice"]);
            let leverage = Self::parse_str_f64(&entry["leverage"]).max(1.0) as u32;
            let unrealized = Self::parse_str_f64(&entry["unRealizedProfit"]);
            let quantity = amt.abs();

            let margin_used = quantity * mark_price / leverage as f64;
            let unrealized_pnl_pct = if margin_used > 0.0 {
                unrealized / margin_used * 100.0
            } else {
                0.0
            };

            positions.push(Position {
                symbol: entry["symbol"].as_str().unwrap_or("").to_string(),
                side,
                entry_price,
                mark_price,
                quantity,
                leverage,
                unrealized_pnl: unrealized,
                unrealized_pnl_pct,
                liquidation_price: Self::parse_str_f64(&entry["liquidationPrice"]),
                margin_used,
                first_observed_at: None,
            });
        }

        Ok(positions)
    }

    /// Invalidate both read caches. Called after every successful mutation.
    fn invalidate_caches(&self) {
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
    }

    // -------------------------------------------------------------------------
    // Symbol filters
    // -------------------------------------------------------------------------

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(*f);
        }

        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .ok_or_else(|| {
                ExchangeError::VenueReject(format!("symbol {symbol} not in exchangeInfo"))
            })?;

        let quantity_precision = info["quantityPrecision"].as_u64().unwrap_or(3) as u32;
        let lot_size = info["filters"]
            .as_array()
            .and_then(|fs| {
                fs.iter()
                    .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            })
            .map(|f| Self::parse_str_f64(&f["stepSize"]))
            .filter(|v| *v > 0.0)
            .unwrap_or(0.001);

        let filters = SymbolFilters {
            lot_size,
            quantity_precision,
        };
        self.filters.write().insert(symbol.to_string(), filters);

        debug!(symbol, lot_size, quantity_precision, "symbol filters cached");
        Ok(filters)
    }

    /// Render a quantity with the venue's precision digits.
    fn format_quantity(qty: f64, precision: u32) -> String {
        format!("{:.*}", precision as usize, qty)
    }

    // -------------------------------------------------------------------------
    // Order helpers
    // -------------------------------------------------------------------------

    /// Cancel all open orders for `symbol` whose type is in `order_types`.
    async fn cancel_orders_of_type(
        &self,
        symbol: &str,
        order_types: &[&str],
    ) -> Result<u32, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/openOrders",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;

        let orders = body.as_array().cloned().unwrap_or_default();
        let mut cancelled = 0u32;

        for order in &orders {
            let otype = order["type"].as_str().unwrap_or("");
            if !order_types.is_empty() && !order_types.contains(&otype) {
                continue;
            }
            let Some(order_id) = order["orderId"].as_u64() else {
                continue;
            };
            match self
                .send(
                    reqwest::Method::DELETE,
                    "/fapi/v1/order",
                    &format!("symbol={symbol}&orderId={order_id}"),
                    true,
                )
                .await
            {
                Ok(_) => cancelled += 1,
                Err(e) => warn!(symbol = %symbol, order_id, error = %e, "cancel failed"),
            }
        }

        if cancelled > 0 {
            self.invalidate_caches();
        }
        Ok(cancelled)
    }

    /// Place a protective STOP_MARKET / TAKE_PROFIT_MARKET order.
    async fn place_protection(
        &self,
        symbol: &str,
        side: PositionSide,
        order_type: &str,
        quantity: f64,
        price: f64,
        precision: u32,
    ) -> Result<(), ExchangeError> {
        let params = format!(
            "symbol={symbol}&side={}&type={order_type}&stopPrice={price}&quantity={}&reduceOnly=true",
            side.exit_order_side(),
            Self::format_quantity(quantity, precision),
        );
        self.send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pure helpers (unit-tested without a network)
// ---------------------------------------------------------------------------

/// Round `quantity` **up** to the nearest lot. A request strictly below one
/// lot becomes one lot. An exact multiple is returned unchanged.
pub fn round_up_to_lot(quantity: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return quantity;
    }
    if quantity <= lot_size {
        return lot_size;
    }
    // Epsilon guard so an exact multiple does not creep up one lot.
    let lots = (quantity / lot_size - 1e-9).ceil();
    lots * lot_size
}

/// Pre-placement sanity on caller-provided protection prices against the
/// current mark price and a liquidation estimate of `mark × (1 ∓ 1/leverage)`.
pub fn validate_protection(
    side: PositionSide,
    mark: f64,
    leverage: u32,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Result<(), ExchangeError> {
    let lev = leverage.max(1) as f64;
    match side {
        PositionSide::Long => {
            let liq_estimate = mark * (1.0 - 1.0 / lev);
            if let Some(sl) = stop_loss {
                if sl >= mark {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "long stop-loss {sl} must be below mark {mark}"
                    )));
                }
                if sl <= liq_estimate {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "long stop-loss {sl} at or below liquidation estimate {liq_estimate:.8}"
                    )));
                }
            }
            if let Some(tp) = take_profit {
                if tp <= mark {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "long take-profit {tp} must be above mark {mark}"
                    )));
                }
            }
            if let (Some(sl), Some(tp)) = (stop_loss, take_profit) {
                if sl >= tp {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "long stop-loss {sl} must be below take-profit {tp}"
                    )));
                }
            }
        }
        PositionSide::Short => {
            let liq_estimate = mark * (1.0 + 1.0 / lev);
            if let Some(sl) = stop_loss {
                if sl <= mark {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "short stop-loss {sl} must be above mark {mark}"
                    )));
                }
                if sl >= liq_estimate {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "short stop-loss {sl} at or above liquidation estimate {liq_estimate:.8}"
                    )));
                }
            }
            if let Some(tp) = take_profit {
                if tp >= mark {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "short take-profit {tp} must be below mark {mark}"
                    )));
                }
            }
            if let (Some(sl), Some(tp)) = (stop_loss, take_profit) {
                if sl <= tp {
                    return Err(ExchangeError::PrecisionReject(format!(
                        "short stop-loss {sl} must be above take-profit {tp}"
                    )));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Capability implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Exchange for BinanceFutures {
    async fn get_balance(&self) -> Result<AccountBalance, ExchangeError> {
        if let Some(cached) = self.balance_cache.get() {
            return Ok(cached);
        }
        let fresh = self.fetch_balance_uncached().await?;
        self.balance_cache.put(fresh.clone());
        Ok(fresh)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        if let Some(cached) = self.positions_cache.get() {
            return Ok(cached);
        }
        let fresh = self.fetch_positions_uncached().await?;
        self.positions_cache.put(fresh.clone());
        Ok(fresh)
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> Result<(), ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let mode = if cross { "CROSSED" } else { "ISOLATED" };
        match self
            .send(
                reqwest::Method::POST,
                "/fapi/v1/marginType",
                &format!("symbol={symbol}&marginType={mode}"),
                true,
            )
            .await
        {
            Ok(_) => Ok(()),
            // -4046: "No need to change margin type" — already satisfied.
            Err(ExchangeError::VenueReject(msg)) if msg.contains("-4046") => {
                debug!(symbol = %symbol, mode, "margin mode already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        _side: Option<PositionSide>,
        leverage: u32,
    ) -> Result<(), ExchangeError> {
        let symbol = normalize_symbol(symbol);
        match self
            .send(
                reqwest::Method::POST,
                "/fapi/v1/leverage",
                &format!("symbol={symbol}&leverage={leverage}"),
                true,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::VenueReject(msg)) if msg.contains("No need to change") => {
                debug!(symbol = %symbol, leverage, "leverage already at target");
                Ok(())
            }
            // -4028: leverage not valid for this symbol.
            Err(ExchangeError::VenueReject(msg)) if msg.contains("-4028") => {
                Err(ExchangeError::LeverageOutOfRange {
                    symbol: symbol.clone(),
                    requested: leverage,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn open(&self, req: &OpenRequest) -> Result<OrderFill, ExchangeError> {
        let symbol = normalize_symbol(&req.symbol);

        // Duplicate-position rule: re-read positions bypassing the cache.
        let fresh = self.fetch_positions_uncached().await?;
        if fresh
            .iter()
            .any(|p| p.symbol == symbol && p.side == req.side && p.quantity > 0.0)
        {
            return Err(ExchangeError::AlreadyOpen {
                symbol,
                side: req.side,
            });
        }

        let mark = self.get_mark_price(&symbol).await?;
        let filters = self.symbol_filters(&symbol).await?;

        // Precision rule: round the requested quantity up to the nearest lot.
        let rounded = round_up_to_lot(req.quantity, filters.lot_size);
        if req.quantity > 0.0 && rounded > req.quantity * 1.10 {
            warn!(
                symbol = %symbol,
                requested = req.quantity,
                rounded,
                "lot rounding increased quantity by more than 10%"
            );
        }

        // Post-rounding margin must fit the available balance.
        let required_margin = rounded * mark / req.leverage.max(1) as f64;
        let balance = self.fetch_balance_uncached().await?;
        if required_margin > balance.available {
            return Err(ExchangeError::InsufficientMargin {
                required: required_margin,
                available: balance.available,
            });
        }

        validate_protection(req.side, mark, req.leverage, req.stop_loss, req.take_profit)?;

        // Client order id makes accidental resubmission idempotent venue-side.
        let client_order_id = format!("nofx-{}", uuid::Uuid::new_v4().simple());
        let qty_str = Self::format_quantity(rounded, filters.quantity_precision);
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={qty_str}&newClientOrderId={client_order_id}",
            req.side.entry_order_side()
        );
        let body = self
            .send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;

        let order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let executed_qty = Self::parse_str_f64(&body["executedQty"]).max(rounded);
        let avg_price = {
            let p = Self::parse_str_f64(&body["avgPrice"]);
            if p > 0.0 {
                p
            } else {
                mark
            }
        };

        info!(
            symbol = %symbol,
            side = %req.side,
            quantity = executed_qty,
            leverage = req.leverage,
            order_id = %order_id,
            "entry order placed"
        );

        // Protective orders; the entry already filled, so a failure here is
        // logged rather than unwinding the fill.
        if let Some(sl) = req.stop_loss {
            if let Err(e) = self
                .place_protection(&symbol, req.side, "STOP_MARKET", executed_qty, sl, filters.quantity_precision)
                .await
            {
                warn!(symbol = %symbol, price = sl, error = %e, "stop-loss placement failed");
            }
        }
        if let Some(tp) = req.take_profit {
            if let Err(e) = self
                .place_protection(&symbol, req.side, "TAKE_PROFIT_MARKET", executed_qty, tp, filters.quantity_precision)
                .await
            {
                warn!(symbol = %symbol, price = tp, error = %e, "take-profit placement failed");
            }
        }

        self.invalidate_caches();

        Ok(OrderFill {
            order_id,
            executed_qty,
            avg_price,
        })
    }

    async fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> Result<OrderFill, ExchangeError> {
        let symbol = normalize_symbol(symbol);

        // Resolve "full close" against a fresh position read.
        let fresh = self.fetch_positions_uncached().await?;
        let position = fresh
            .iter()
            .find(|p| p.symbol == symbol && p.side == side && p.quantity > 0.0)
            .ok_or_else(|| ExchangeError::NoSuchPosition {
                symbol: symbol.clone(),
                side,
            })?;

        let close_qty = if quantity <= 0.0 {
            position.quantity
        } else {
            quantity.min(position.quantity)
        };

        let filters = self.symbol_filters(&symbol).await?;
        let client_order_id = format!("nofx-{}", uuid::Uuid::new_v4().simple());
        let qty_str = Self::format_quantity(close_qty, filters.quantity_precision);
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={qty_str}&reduceOnly=true&newClientOrderId={client_order_id}",
            side.exit_order_side()
        );
        let body = self
            .send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;

        self.invalidate_caches();

        let order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .unwrap_or_default();

        info!(
            symbol = %symbol,
            side = %side,
            quantity = close_qty,
            order_id = %order_id,
            "close order placed"
        );

        Ok(OrderFill {
            order_id,
            executed_qty: close_qty,
            avg_price: Self::parse_str_f64(&body["avgPrice"]),
        })
    }

    async fn cancel_stop_loss(&self, symbol: &str) -> Result<u32, ExchangeError> {
        self.cancel_orders_of_type(symbol, &["STOP_MARKET", "STOP"])
            .await
    }

    async fn cancel_take_profit(&self, symbol: &str) -> Result<u32, ExchangeError> {
        self.cancel_orders_of_type(symbol, &["TAKE_PROFIT_MARKET", "TAKE_PROFIT"])
            .await
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<u32, ExchangeError> {
        self.cancel_orders_of_type(symbol, &[]).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let filters = self.symbol_filters(&symbol).await?;
        self.place_protection(&symbol, side, "STOP_MARKET", quantity, price, filters.quantity_precision)
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let filters = self.symbol_filters(&symbol).await?;
        self.place_protection(&symbol, side, "TAKE_PROFIT_MARKET", quantity, price, filters.quantity_precision)
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        let price = Self::parse_str_f64(&body["markPrice"]);
        if price <= 0.0 {
            return Err(ExchangeError::VenueReject(format!(
                "no mark price for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        let price = Self::parse_str_f64(&body["price"]);
        if price <= 0.0 {
            return Err(ExchangeError::VenueReject(format!(
                "no ticker price for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_symbol_precision(&self, symbol: &str) -> Result<u32, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        Ok(self.symbol_filters(&symbol).await?.quantity_precision)
    }

    async fn get_lot_size(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        Ok(self.symbol_filters(&symbol).await?.lot_size)
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
                false,
            )
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::VenueReject("klines response is not an array".into()))?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else {
                continue;
            };
            if arr.len() < 7 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }
            bars.push(Bar {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1]),
                high: Self::parse_str_f64(&arr[2]),
                low: Self::parse_str_f64(&arr[3]),
                close: Self::parse_str_f64(&arr[4]),
                volume: Self::parse_str_f64(&arr[5]),
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol = %symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        Ok(Self::parse_str_f64(&body["lastFundingRate"]))
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/fapi/v1/openInterest",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        Ok(Self::parse_str_f64(&body["openInterest"]))
    }

    async fn get_open_interest_hist(
        &self,
        symbol: &str,
        points: u32,
    ) -> Result<Vec<f64>, ExchangeError> {
        let symbol = normalize_symbol(symbol);
        let body = self
            .send(
                reqwest::Method::GET,
                "/futures/data/openInterestHist",
                &format!("symbol={symbol}&period=5m&limit={points}"),
                false,
            )
            .await?;

        Ok(body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|e| Self::parse_str_f64(&e["sumOpenInterest"]))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for BinanceFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFutures")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // ---- round_up_to_lot ---------------------------------------------------

    #[test]
    fn exactly_one_lot_accepted_unchanged() {
        assert_eq!(round_up_to_lot(0.001, 0.001), 0.001);
    }

    #[test]
    fn below_one_lot_rounds_up_to_one() {
        assert_eq!(round_up_to_lot(0.0004, 0.001), 0.001);
    }

    #[test]
    fn partial_lot_rounds_up() {
        let rounded = round_up_to_lot(0.0015, 0.001);
        assert!((rounded - 0.002).abs() < 1e-12, "got {rounded}");
    }

    #[test]
    fn exact_multiple_unchanged() {
        let rounded = round_up_to_lot(0.01, 0.001);
        assert!((rounded - 0.01).abs() < 1e-12, "got {rounded}");
    }

    #[test]
    fn degenerate_lot_passes_through() {
        assert_eq!(round_up_to_lot(1.5, 0.0), 1.5);
    }

    // ---- validate_protection -------------------------------------------------

    #[test]
    fn long_protection_ok() {
        // mark 60000, 10x: liq estimate 54000.
        assert!(validate_protection(
            PositionSide::Long,
            60000.0,
            10,
            Some(58000.0),
            Some(63000.0)
        )
        .is_ok());
    }

    #[test]
    fn long_stop_above_mark_rejected() {
        let err = validate_protection(PositionSide::Long, 60000.0, 10, Some(61000.0), None)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PrecisionReject(_)));
    }

    #[test]
    fn long_stop_below_liquidation_rejected() {
        // liq estimate = 54000; 53000 is beyond it.
        let err = validate_protection(PositionSide::Long, 60000.0, 10, Some(53000.0), None)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PrecisionReject(_)));
    }

    #[test]
    fn long_take_profit_below_mark_rejected() {
        let err = validate_protection(PositionSide::Long, 60000.0, 10, None, Some(59000.0))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PrecisionReject(_)));
    }

    #[test]
    fn equal_stop_and_take_rejected() {
        let err = validate_protection(
            PositionSide::Short,
            60000.0,
            10,
            Some(61000.0),
            Some(61000.0),
        )
        .unwrap_err();
        assert!(matches!(err, ExchangeError::PrecisionReject(_)));
    }

    #[test]
    fn short_protection_mirrored() {
        // mark 60000, 10x short: liq estimate 66000.
        assert!(validate_protection(
            PositionSide::Short,
            60000.0,
            10,
            Some(62000.0),
            Some(56000.0)
        )
        .is_ok());

        // Stop below mark is wrong for a short.
        assert!(validate_protection(
            PositionSide::Short,
            60000.0,
            10,
            Some(59000.0),
            None
        )
        .is_err());

        // Stop at/above liquidation estimate rejected.
        assert!(validate_protection(
            PositionSide::Short,
            60000.0,
            10,
            Some(67000.0),
            None
        )
        .is_err());
    }

    #[test]
    fn protection_absent_prices_skipped() {
        assert!(validate_protection(PositionSide::Long, 60000.0, 10, None, None).is_ok());
    }

    // ---- misc ---------------------------------------------------------------

    #[test]
    fn quantity_formatting_respects_precision() {
        assert_eq!(BinanceFutures::format_quantity(0.0015, 3), "0.002");
        assert_eq!(BinanceFutures::format_quantity(1.0, 0), "1");
    }

    #[test]
    fn debug_redacts_secrets() {
        let client = BinanceFutures::new("key-abc123", "hunter2-secret", false);
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("hunter2"), "secret leaked: {rendered}");
        assert!(!rendered.contains("abc123"), "api key leaked: {rendered}");
        assert!(rendered.contains("<redacted>"));
    }
}

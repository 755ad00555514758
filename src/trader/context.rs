// =============================================================================
// Context Builder — assembles the per-cycle prompt input
// =============================================================================
//
// Two pieces, for clarity and future prompt caching:
//
//   system prompt — persona template + overlay + the hard-rules tail; a pure
//                   function of (template, overlay, leverage ceilings).
//   user prompt   — time, cycle, account block, BTC block, positions with
//                   holding durations, candidate indicator summaries, a
//                   compact performance figure, and the last completed
//                   decisions with their realised outcomes.
//
// Candidate selection happens before market-data fetch: all held symbols
// unconditionally (exit decisions need them), then candidates up to a cap
// that shrinks as the book fills. Snapshot fetches retry transport failures
// up to three times; symbols that still fail are silently dropped.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{ConfigStore, TraderConfig};
use crate::exchange::Exchange;
use crate::journal::{ActionRecord, CycleRecord, Journal, PerformanceSummary};
use crate::market::{MarketDataProvider, MarketSnapshot};
use crate::prompt;
use crate::signals::CandidateSources;
use crate::types::{AccountState, CandidateCoin, Position, PositionSide, SourceTag};

/// Snapshot fetch attempts per symbol.
const SNAPSHOT_ATTEMPTS: u32 = 3;

/// Pause between snapshot retries.
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Completed records rendered into the prompt.
const RECENT_RECORDS: usize = 3;

/// Fallback watchlist when no candidate source yields anything.
const DEFAULT_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT"];

/// Candidate cap by open-position count: a fuller book needs less breadth.
pub fn candidate_cap(position_count: usize) -> usize {
    match position_count {
        0 => 30,
        1 => 25,
        2 => 20,
        _ => 15,
    }
}

/// The assembled per-cycle input.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Trimmed candidate list (snapshot-backed symbols only).
    pub candidates: Vec<CandidateCoin>,
}

/// Everything the engine passes into one build call.
pub struct ContextInputs<'a> {
    pub config: &'a TraderConfig,
    pub cycle_number: u64,
    pub runtime_minutes: i64,
    pub account: &'a AccountState,
    /// Positions already stamped with first-observed timestamps.
    pub positions: &'a [Position],
}

pub struct ContextBuilder {
    market: MarketDataProvider,
    signals: Arc<CandidateSources>,
    journal: Arc<Journal>,
    store: Arc<dyn ConfigStore>,
}

impl ContextBuilder {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        signals: Arc<CandidateSources>,
        journal: Arc<Journal>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            market: MarketDataProvider::new(exchange),
            signals,
            journal,
            store,
        }
    }

    pub async fn build(&self, inputs: ContextInputs<'_>) -> Result<CycleContext> {
        let config = inputs.config;

        // -- system prompt --------------------------------------------------
        let template_body = self
            .store
            .prompt_template(&config.prompt_template)
            .or_else(|| {
                warn!(
                    template = %config.prompt_template,
                    "unknown prompt template — falling back to default"
                );
                prompt::builtin_template("default").map(|s| s.to_string())
            })
            .context("no prompt template available")?;

        let system_prompt = prompt::system_prompt(
            &template_body,
            config.prompt_overlay.as_deref(),
            config.btc_eth_leverage,
            config.altcoin_leverage,
        );

        // -- candidate selection --------------------------------------------
        let raw_candidates = if !config.symbols.is_empty() {
            config
                .symbols
                .iter()
                .map(|s| CandidateCoin::new(crate::types::normalize_symbol(s), SourceTag::Custom))
                .collect()
        } else {
            let mut from_sources = self
                .signals
                .candidates(config.use_coin_pool, config.use_oi_top)
                .await;
            if from_sources.is_empty() {
                from_sources = DEFAULT_SYMBOLS
                    .iter()
                    .map(|s| CandidateCoin::new(*s, SourceTag::Default))
                    .collect();
            }
            from_sources
        };

        let trimmed = trim_candidates(raw_candidates, inputs.positions.len());

        // -- snapshots: held symbols first, then candidates ------------------
        let mut fetch_order: Vec<String> =
            inputs.positions.iter().map(|p| p.symbol.clone()).collect();
        for candidate in &trimmed {
            if !fetch_order.contains(&candidate.symbol) {
                fetch_order.push(candidate.symbol.clone());
            }
        }

        let mut snapshots: HashMap<String, MarketSnapshot> = HashMap::new();
        for symbol in &fetch_order {
            if let Some(snapshot) = self.snapshot_with_retry(symbol).await {
                snapshots.insert(symbol.clone(), snapshot);
            }
        }

        // Candidates whose snapshot failed are silently dropped.
        let candidates: Vec<CandidateCoin> = trimmed
            .into_iter()
            .filter(|c| snapshots.contains_key(&c.symbol))
            .collect();

        // -- history --------------------------------------------------------
        let performance = self
            .journal
            .performance_summary(&config.id, crate::journal::DEFAULT_SUMMARY_WINDOW);
        let recent = self.journal.recent(&config.id, RECENT_RECORDS);

        let user_prompt = render_user_prompt(
            &inputs,
            Utc::now(),
            &snapshots,
            &candidates,
            &performance,
            &recent,
        );

        Ok(CycleContext {
            system_prompt,
            user_prompt,
            candidates,
        })
    }

    async fn snapshot_with_retry(&self, symbol: &str) -> Option<MarketSnapshot> {
        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            match self.market.snapshot(symbol).await {
                Ok(snapshot) => return Some(snapshot),
                Err(e) if e.is_retryable() && attempt < SNAPSHOT_ATTEMPTS => {
                    debug!(symbol, attempt, error = %e, "snapshot retry");
                    tokio::time::sleep(SNAPSHOT_RETRY_DELAY).await;
                }
                Err(e) => {
                    debug!(symbol, error = %e, "snapshot dropped");
                    return None;
                }
            }
        }
        None
    }
}

/// Trim the candidate list to the per-cycle cap for this position count.
pub fn trim_candidates(candidates: Vec<CandidateCoin>, position_count: usize) -> Vec<CandidateCoin> {
    let cap = candidate_cap(position_count);
    candidates.into_iter().take(cap).collect()
}

// ---------------------------------------------------------------------------
// User-prompt rendering
// ---------------------------------------------------------------------------

fn render_user_prompt(
    inputs: &ContextInputs<'_>,
    now: DateTime<Utc>,
    snapshots: &HashMap<String, MarketSnapshot>,
    candidates: &[CandidateCoin],
    performance: &PerformanceSummary,
    recent: &[CycleRecord],
) -> String {
    let config = inputs.config;
    let account = inputs.account;
    let tz = crate::config::display_timezone();
    let local = now.with_timezone(&tz);

    let mut out = String::with_capacity(4096);

    out.push_str(&format!(
        "Current time: {} | cycle #{} | runtime {} minutes\n\n",
        local.format("%Y-%m-%d %H:%M:%S %Z"),
        inputs.cycle_number,
        inputs.runtime_minutes
    ));

    // -- account block ------------------------------------------------------
    let total_pnl = account.total_equity - config.initial_balance;
    let total_pnl_pct = if config.initial_balance > 0.0 {
        total_pnl / config.initial_balance * 100.0
    } else {
        0.0
    };
    out.push_str("== ACCOUNT ==\n");
    out.push_str(&format!(
        "Equity: {:.2} USDT | Available: {:.2} USDT | Used margin: {:.2} USDT ({:.1}% of equity)\n",
        account.total_equity,
        account.available_balance,
        account.used_margin,
        account.margin_ratio * 100.0
    ));
    out.push_str(&format!(
        "Total PnL: {:+.2} USDT ({:+.2}%) | Unrealised: {:+.2} USDT | Open positions: {}\n",
        total_pnl, total_pnl_pct, account.unrealized_pnl, account.position_count
    ));
    out.push_str(&format!(
        "Max openable notional: {:.0} USDT at {}x (BTC/ETH) | {:.0} USDT at {}x (altcoins)\n\n",
        account.available_balance * config.btc_eth_leverage as f64,
        config.btc_eth_leverage,
        account.available_balance * config.altcoin_leverage as f64,
        config.altcoin_leverage
    ));

    // -- BTC block ----------------------------------------------------------
    if let Some(btc) = snapshots.get("BTCUSDT") {
        out.push_str("== BTC MARKET ==\n");
        out.push_str(&render_snapshot_line(btc));
        out.push('\n');
    }

    // -- positions ----------------------------------------------------------
    out.push_str("== OPEN POSITIONS ==\n");
    if inputs.positions.is_empty() {
        out.push_str("none\n");
    } else {
        for p in inputs.positions {
            let held_minutes = p
                .first_observed_at
                .map(|t| (now - t).num_minutes().max(0).to_string())
                .unwrap_or_else(|| "?".to_string());
            out.push_str(&format!(
                "- {} {} qty {} | entry {} mark {} | {}x | uPnL {:+.2} USDT ({:+.1}% of margin) | liq {} | held {}m\n",
                p.symbol,
                p.side,
                p.quantity,
                p.entry_price,
                p.mark_price,
                p.leverage,
                p.unrealized_pnl,
                p.unrealized_pnl_pct,
                p.liquidation_price,
                held_minutes
            ));
        }
    }
    out.push('\n');

    // -- candidates ---------------------------------------------------------
    out.push_str("== CANDIDATE COINS ==\n");
    if candidates.is_empty() {
        out.push_str("none\n");
    } else {
        for c in candidates {
            let tags: Vec<String> = c.sources.iter().map(|s| s.to_string()).collect();
            match snapshots.get(&c.symbol) {
                Some(snapshot) => out.push_str(&format!(
                    "- {} [{}] {}",
                    c.symbol,
                    tags.join(","),
                    render_snapshot_line(snapshot)
                )),
                None => out.push_str(&format!("- {} [{}]\n", c.symbol, tags.join(","))),
            }
        }
    }
    out.push('\n');

    // -- performance --------------------------------------------------------
    out.push_str(&format!(
        "== PERFORMANCE (last {} cycles) ==\nactions {} | success rate {:.1}% | opens {} | closes {}\n\n",
        performance.cycles,
        performance.total_actions,
        performance.action_success_rate * 100.0,
        performance.open_actions,
        performance.close_actions
    ));

    // -- recent decisions with outcomes -------------------------------------
    out.push_str("== RECENT DECISIONS ==\n");
    if recent.is_empty() {
        out.push_str("none\n");
    } else {
        for record in recent {
            out.push_str(&format!("cycle #{}:\n", record.cycle_number));
            for action in &record.actions {
                out.push_str(&render_action_outcome(action, inputs.positions));
            }
        }
    }
    out.push('\n');

    out.push_str(
        "Review the data above and produce your decisions for this cycle. \
         Reply with exactly one JSON array of decision objects as specified.\n",
    );

    out
}

fn render_snapshot_line(s: &MarketSnapshot) -> String {
    let t = &s.intraday;
    format!(
        "price {:.6} | 1h {} 4h {} | RSI7 {} | MACD {} | EMA20 {} | BB {}/{}/{} | KDJ {}/{}/{} | OI {} | funding {}\n",
        s.current_price,
        fmt_pct(s.price_change_1h_pct),
        fmt_pct(s.price_change_4h_pct),
        fmt_opt(t.rsi7),
        fmt_opt(t.macd),
        fmt_opt(t.ema20),
        fmt_opt(t.boll_lower),
        fmt_opt(t.boll_middle),
        fmt_opt(t.boll_upper),
        fmt_opt(t.kdj_k),
        fmt_opt(t.kdj_d),
        fmt_opt(t.kdj_j),
        s.open_interest
            .map(|oi| format!("{:.0}/{:.0}", oi.latest, oi.average))
            .unwrap_or_else(|| "n/a".to_string()),
        s.funding_rate
            .map(|f| format!("{:+.4}%", f * 100.0))
            .unwrap_or_else(|| "n/a".to_string()),
    )
}

/// One line per recorded action, with its realised outcome: the position is
/// either still open (with live PnL) or closed.
fn render_action_outcome(action: &ActionRecord, positions: &[Position]) -> String {
    if !action.success {
        return format!(
            "  {} {} FAILED: {}\n",
            action.action,
            action.symbol,
            action.error.as_deref().unwrap_or("unknown error")
        );
    }

    let outcome = if action.action.starts_with("open_") {
        let side = if action.action == "open_long" {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        match positions
            .iter()
            .find(|p| p.symbol == action.symbol && p.side == side)
        {
            Some(p) => format!("still open, uPnL {:+.1}% of margin", p.unrealized_pnl_pct),
            None => "closed".to_string(),
        }
    } else {
        "done".to_string()
    };

    if action.symbol.is_empty() {
        format!("  {}\n", action.action)
    } else {
        format!(
            "  {} {} qty {} @ {} -> {}\n",
            action.action, action.symbol, action.quantity, action.price, outcome
        )
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "n/a".to_string())
}

fn fmt_pct(v: Option<f64>) -> String {
    v.map(|x| format!("{x:+.2}%")).unwrap_or_else(|| "n/a".to_string())
}

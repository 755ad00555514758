// =============================================================================
// Trader Engine — owns the cycle, balance auto-sync, and lifecycle
// =============================================================================
//
// One engine per configured trader. On start it spawns the drawdown monitor
// and a cycle task firing on a wall-clock timer at the configured scan
// period (first cycle immediately). Ticks are skipped while a cycle is still
// running — two concurrent cycles for the same trader are forbidden. Stop
// refuses new ticks immediately and waits for the in-flight cycle and the
// monitor; it never interrupts an in-flight exchange call.
//
// Each cycle: halt gate → daily reset → balance auto-sync → sense (balance,
// positions, first-observed reconciliation) → context → LLM → validate →
// execute → journal. Cycle-level failures journal a failed record and the
// next tick proceeds normally.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::{BalanceSyncBasis, ConfigStore, TraderConfig};
use crate::decision::parse::parse_decisions;
use crate::decision::validator::{validate_decisions, RiskLimits};
use crate::exchange::{AccountBalance, Exchange};
use crate::journal::{CycleRecord, Journal};
use crate::llm::LlmGateway;
use crate::signals::CandidateSources;
use crate::trader::context::{ContextBuilder, ContextInputs, CycleContext};
use crate::trader::executor::{ExecutionSequencer, FirstObservedMap};
use crate::trader::monitor::DrawdownMonitor;
use crate::types::{AccountState, Position};

/// Minimum spacing between balance auto-sync probes.
const BALANCE_SYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Relative drift beyond which the declared initial balance is replaced.
const BALANCE_DRIFT_THRESHOLD: f64 = 0.05;

/// Daily-PnL counter reset period.
const DAILY_RESET_INTERVAL: chrono::Duration = chrono::Duration::hours(24);

/// Lifecycle state of one trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderState {
    Stopped,
    Running,
    Stopping,
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

pub struct TraderEngine {
    /// Mutable only for the auto-synced initial balance.
    config: RwLock<TraderConfig>,
    exchange: Arc<dyn Exchange>,
    gateway: Arc<dyn LlmGateway>,
    store: Arc<dyn ConfigStore>,
    journal: Arc<Journal>,
    context: ContextBuilder,
    sequencer: ExecutionSequencer,

    state: RwLock<TraderState>,
    /// Last issued cycle number; strictly monotonic and contiguous.
    cycle_counter: AtomicU64,
    /// Engine-assigned first-observed timestamps. Touched only from the
    /// cycle task.
    first_observed: Mutex<FirstObservedMap>,
    /// Risk-imposed trading halt.
    halt_until: RwLock<Option<DateTime<Utc>>>,

    last_daily_reset: RwLock<DateTime<Utc>>,
    daily_pnl_anchor: RwLock<Option<f64>>,
    last_balance_sync: RwLock<Option<Instant>>,
    started_at: RwLock<Option<Instant>>,

    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TraderEngine {
    pub fn new(
        config: TraderConfig,
        exchange: Arc<dyn Exchange>,
        gateway: Arc<dyn LlmGateway>,
        signals: Arc<CandidateSources>,
        store: Arc<dyn ConfigStore>,
        journal: Arc<Journal>,
    ) -> Self {
        let context = ContextBuilder::new(
            exchange.clone(),
            signals,
            journal.clone(),
            store.clone(),
        );
        let sequencer = ExecutionSequencer::new(exchange.clone(), config.exchange.cross_margin);
        // Resume numbering after the last journaled cycle so records stay
        // contiguous across restarts.
        let last_cycle = journal.last_cycle_number(&config.id).unwrap_or(0);

        Self {
            config: RwLock::new(config),
            exchange,
            gateway,
            store,
            journal,
            context,
            sequencer,
            state: RwLock::new(TraderState::Stopped),
            cycle_counter: AtomicU64::new(last_cycle),
            first_observed: Mutex::new(FirstObservedMap::new()),
            halt_until: RwLock::new(None),
            last_daily_reset: RwLock::new(Utc::now()),
            daily_pnl_anchor: RwLock::new(None),
            last_balance_sync: RwLock::new(None),
            started_at: RwLock::new(None),
            stop_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    pub fn current_initial_balance(&self) -> f64 {
        self.config.read().initial_balance
    }

    /// Impose a trading halt; cycles until then journal a skip record.
    pub fn halt_until(&self, until: DateTime<Utc>) {
        *self.halt_until.write() = Some(until);
        warn!(trader_id = %self.id(), until = %until, "trading halted");
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the monitor and the cycle timer. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if *state != TraderState::Stopped {
                info!(trader_id = %self.id(), state = %*state, "start ignored — not stopped");
                return;
            }
            *state = TraderState::Running;
        }
        *self.started_at.write() = Some(Instant::now());

        let (tx, rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);

        let trader_id = self.id();
        info!(trader_id = %trader_id, "trader starting");

        // Drawdown monitor task.
        let monitor = Arc::new(DrawdownMonitor::new(trader_id.clone(), self.exchange.clone()));
        let monitor_handle = tokio::spawn(monitor.run(rx.clone()));

        // Cycle task: first tick fires immediately, then every scan period.
        // Skipped ticks guarantee no two concurrent cycles per trader.
        let engine = Arc::clone(self);
        let mut stop_rx = rx;
        let cycle_handle = tokio::spawn(async move {
            let period = Duration::from_secs(engine.config.read().scan_interval_secs.max(1));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.run_cycle().await {
                            error!(trader_id = %engine.id(), error = %e, "cycle crashed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(trader_id = %engine.id(), "cycle task stopped");
        });

        self.tasks.lock().extend([monitor_handle, cycle_handle]);
    }

    /// Signal both tasks, wait for them, return. Idempotent while stopped.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == TraderState::Stopped {
                return;
            }
            *state = TraderState::Stopping;
        }

        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }

        *self.state.write() = TraderState::Stopped;
        info!(trader_id = %self.id(), "trader stopped");
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&self) -> Result<()> {
        let cycle_number = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        info!(trader_id = %self.id(), cycle = cycle_number, "cycle started");

        // 1. Halt gate.
        if let Some(until) = *self.halt_until.read() {
            if until > started_at {
                let reason = format!("halted until {until}");
                warn!(trader_id = %self.id(), cycle = cycle_number, %reason, "cycle skipped");
                self.journal_record(empty_record(cycle_number, started_at, Some(reason)));
                return Ok(());
            }
        }

        // 2. Daily reset.
        self.maybe_daily_reset(started_at);

        // 3. Balance auto-sync.
        self.maybe_sync_balance().await;

        let config = self.config.read().clone();

        // 4. Sense.
        let balance = match self.exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                let mut record = empty_record(cycle_number, started_at, None);
                record.error = Some(format!("balance fetch failed: {e}"));
                self.journal_record(record);
                return Ok(());
            }
        };
        let mut positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                let mut record = empty_record(cycle_number, started_at, None);
                record.error = Some(format!("position fetch failed: {e}"));
                self.journal_record(record);
                return Ok(());
            }
        };

        // First-observed reconciliation: assign on first sighting, clear on
        // disappearance, stamp the surfaced positions.
        {
            let mut observed = self.first_observed.lock();
            observed.retain(|key, _| {
                positions
                    .iter()
                    .any(|p| p.symbol == key.symbol && p.side == key.side)
            });
            for position in &mut positions {
                let at = *observed.entry(position.key()).or_insert(started_at);
                position.first_observed_at = Some(at);
            }
        }

        let account = account_state(&balance, &config, positions.len());
        let runtime_minutes = self
            .started_at
            .read()
            .map(|t| (t.elapsed().as_secs() / 60) as i64)
            .unwrap_or(0);

        // 5. Context.
        let ctx: CycleContext = match self
            .context
            .build(ContextInputs {
                config: &config,
                cycle_number,
                runtime_minutes,
                account: &account,
                positions: &positions,
            })
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                let mut record = empty_record(cycle_number, started_at, None);
                record.account = account;
                record.positions = positions;
                record.error = Some(format!("context build failed: {e}"));
                self.journal_record(record);
                return Ok(());
            }
        };

        // 6. Decide.
        let raw_text = match self
            .gateway
            .complete(&ctx.system_prompt, &ctx.user_prompt)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                let mut record = empty_record(cycle_number, started_at, None);
                record.account = account;
                record.positions = positions;
                record.candidates = ctx.candidates;
                record.system_prompt = ctx.system_prompt;
                record.user_prompt = ctx.user_prompt;
                record.error = Some(format!("llm call failed: {e}"));
                self.journal_record(record);
                return Ok(());
            }
        };

        let raw_decisions = parse_decisions(&raw_text);
        let limits = RiskLimits {
            btc_eth_leverage: config.btc_eth_leverage,
            altcoin_leverage: config.altcoin_leverage,
        };

        // 7. Validate and execute.
        let (actions, success, cycle_error) = match validate_decisions(&raw_decisions, &limits) {
            Ok(decisions) => {
                let mut observed = self.first_observed.lock().clone();
                let records = self.sequencer.execute_all(decisions, &mut observed).await;
                *self.first_observed.lock() = observed;
                let all_ok = records.iter().all(|r| r.success);
                (records, all_ok, None)
            }
            Err(e) => {
                warn!(trader_id = %self.id(), cycle = cycle_number, error = %e, "decision list rejected");
                (Vec::new(), false, Some(e.to_string()))
            }
        };

        // 8. Journal.
        let record = CycleRecord {
            cycle_number,
            started_at,
            account,
            positions,
            candidates: ctx.candidates,
            system_prompt: ctx.system_prompt,
            user_prompt: ctx.user_prompt,
            chain_of_thought: raw_text,
            decisions: raw_decisions,
            actions,
            success,
            error: cycle_error,
        };
        self.journal_record(record);

        info!(trader_id = %self.id(), cycle = cycle_number, success, "cycle finished");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cycle sub-steps
    // -------------------------------------------------------------------------

    fn maybe_daily_reset(&self, now: DateTime<Utc>) {
        let due = {
            let last = self.last_daily_reset.read();
            now - *last > DAILY_RESET_INTERVAL
        };
        if due {
            *self.last_daily_reset.write() = now;
            *self.daily_pnl_anchor.write() = None;
            info!(trader_id = %self.id(), "daily PnL counter reset");
        }
    }

    /// Fetch balance at most every 10 minutes; when the venue figure drifts
    /// more than 5% from the declared initial balance (or the declared value
    /// is invalid), replace it and persist through the configuration store.
    async fn maybe_sync_balance(&self) {
        let due = {
            let last = self.last_balance_sync.read();
            last.map_or(true, |t| t.elapsed() >= BALANCE_SYNC_INTERVAL)
        };
        if !due {
            return;
        }

        let balance = match self.exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(trader_id = %self.id(), error = %e, "balance sync fetch failed");
                return;
            }
        };
        *self.last_balance_sync.write() = Some(Instant::now());

        // Daily-PnL observability: anchor equity after each daily reset.
        {
            let mut anchor = self.daily_pnl_anchor.write();
            match *anchor {
                None => *anchor = Some(balance.total_equity),
                Some(a) => info!(
                    trader_id = %self.id(),
                    daily_pnl = balance.total_equity - a,
                    "daily PnL"
                ),
            }
        }

        let (trader_id, declared, basis_value) = {
            let config = self.config.read();
            let basis_value = match config.balance_sync_basis {
                BalanceSyncBasis::Available => balance.available,
                BalanceSyncBasis::Equity => balance.total_equity,
            };
            (config.id.clone(), config.initial_balance, basis_value)
        };

        let replace = if declared <= 0.0 {
            // Invalid declared balance: resync unconditionally, never divide.
            true
        } else {
            (basis_value - declared).abs() / declared > BALANCE_DRIFT_THRESHOLD
        };

        if replace && basis_value > 0.0 {
            self.config.write().initial_balance = basis_value;
            info!(
                trader_id = %trader_id,
                old_balance = declared,
                new_balance = basis_value,
                "initial balance auto-synced"
            );
            if let Err(e) = self.store.persist_initial_balance(&trader_id, basis_value) {
                warn!(trader_id = %trader_id, error = %e, "failed to persist corrected balance");
            }
        }
    }

    /// Journal failures are logged, never fatal to the cycle.
    fn journal_record(&self, record: CycleRecord) {
        let trader_id = self.id();
        if let Err(e) = self.journal.append(&trader_id, &record) {
            warn!(trader_id = %trader_id, cycle = record.cycle_number, error = %e, "journal write failed");
        }
    }
}

impl std::fmt::Debug for TraderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraderEngine")
            .field("id", &self.config.read().id)
            .field("state", &*self.state.read())
            .field("cycle", &self.cycle_counter.load(Ordering::SeqCst))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn account_state(
    balance: &AccountBalance,
    config: &TraderConfig,
    position_count: usize,
) -> AccountState {
    let total_pnl = balance.total_equity - config.initial_balance;
    AccountState {
        total_equity: balance.total_equity,
        available_balance: balance.available,
        used_margin: balance.total_equity * balance.margin_ratio,
        margin_ratio: balance.margin_ratio,
        realized_pnl: total_pnl - balance.unrealized_pnl,
        unrealized_pnl: balance.unrealized_pnl,
        position_count,
    }
}

fn empty_record(
    cycle_number: u64,
    started_at: DateTime<Utc>,
    error: Option<String>,
) -> CycleRecord {
    CycleRecord {
        cycle_number,
        started_at,
        account: AccountState::default(),
        positions: Vec::<Position>::new(),
        candidates: Vec::new(),
        system_prompt: String::new(),
        user_prompt: String::new(),
        chain_of_thought: String::new(),
        decisions: Vec::new(),
        actions: Vec::new(),
        success: false,
        error,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeProfile, LlmProfile};
    use crate::exchange::mock::MockExchange;
    use crate::llm::mock::ScriptedGateway;
    use crate::llm::Dialect;
    use crate::prompt;
    use crate::types::{PositionKey, PositionSide};

    struct RecordingStore {
        persisted: Mutex<Vec<(String, f64)>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                persisted: Mutex::new(Vec::new()),
            }
        }
    }

    impl ConfigStore for RecordingStore {
        fn load_traders(&self) -> Result<Vec<TraderConfig>> {
            Ok(Vec::new())
        }
        fn persist_initial_balance(&self, trader_id: &str, new_balance: f64) -> Result<()> {
            self.persisted
                .lock()
                .push((trader_id.to_string(), new_balance));
            Ok(())
        }
        fn prompt_template(&self, name: &str) -> Option<String> {
            prompt::builtin_template(name).map(|s| s.to_string())
        }
    }

    fn config(initial_balance: f64) -> TraderConfig {
        TraderConfig {
            id: "t1".to_string(),
            name: "test trader".to_string(),
            llm: LlmProfile {
                provider: "openai".to_string(),
                api_key: "k".to_string(),
                model: "m".to_string(),
                endpoint: None,
                dialect: Dialect::ChatCompletions,
                thread_id: None,
            },
            exchange: ExchangeProfile {
                venue: "binance".to_string(),
                api_key: "k".to_string(),
                api_secret: "s".to_string(),
                testnet: true,
                cross_margin: true,
            },
            scan_interval_secs: 180,
            initial_balance,
            btc_eth_leverage: 20,
            altcoin_leverage: 10,
            symbols: vec!["BTCUSDT".to_string()],
            prompt_template: "default".to_string(),
            prompt_overlay: None,
            use_coin_pool: false,
            use_oi_top: false,
            balance_sync_basis: BalanceSyncBasis::Available,
        }
    }

    struct Harness {
        engine: Arc<TraderEngine>,
        exchange: Arc<MockExchange>,
        store: Arc<RecordingStore>,
        journal: Arc<Journal>,
        _dir: tempfile::TempDir,
    }

    fn harness(cfg: TraderConfig, gateway: ScriptedGateway) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::new().with_mark_price("BTCUSDT", 60000.0));
        let store = Arc::new(RecordingStore::new());
        let journal = Arc::new(Journal::new(dir.path()));
        let engine = Arc::new(TraderEngine::new(
            cfg,
            exchange.clone(),
            Arc::new(gateway),
            Arc::new(CandidateSources::new(None, None)),
            store.clone(),
            journal.clone(),
        ));
        Harness {
            engine,
            exchange,
            store,
            journal,
            _dir: dir,
        }
    }

    fn held_btc_long() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: 60000.0,
            mark_price: 60000.0,
            quantity: 0.01,
            leverage: 10,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 54000.0,
            margin_used: 60.0,
            first_observed_at: None,
        }
    }

    #[tokio::test]
    async fn swap_cycle_end_to_end() {
        let gateway = ScriptedGateway::new().reply(
            r#"Closing the long and flipping short.
[{"action":"open_short","symbol":"BTCUSDT","leverage":10,"position_size_usd":600,"stop_loss":62000,"take_profit":56000,"reasoning":"flip"},
 {"action":"close_long","symbol":"BTCUSDT","reasoning":"exit"}]"#,
        );
        let h = harness(config(1000.0), gateway);
        h.exchange.push_position(held_btc_long());

        h.engine.run_cycle().await.unwrap();

        let records = h.journal.recent("t1", 1);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.success, "cycle failed: {:?}", record.error);
        assert_eq!(record.actions.len(), 2);
        // Close fires first regardless of LLM-supplied order.
        assert_eq!(record.actions[0].action, "close_long");
        assert!(record.actions[0].success);
        assert_eq!(record.actions[1].action, "open_short");
        assert!(record.actions[1].success);

        let positions = h.exchange.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
    }

    #[tokio::test]
    async fn wait_cycle_makes_no_mutation() {
        let gateway =
            ScriptedGateway::new().reply(r#"[{"action":"wait","reasoning":"nothing to do"}]"#);
        let h = harness(config(1000.0), gateway);

        h.engine.run_cycle().await.unwrap();

        let records = h.journal.recent("t1", 1);
        assert_eq!(records[0].actions.len(), 1);
        assert_eq!(records[0].actions[0].action, "wait");
        assert!(records[0].success);

        let mutations: Vec<String> = h
            .exchange
            .call_log()
            .into_iter()
            .filter(|c| {
                c.starts_with("open")
                    || c.starts_with("close")
                    || c.starts_with("cancel")
                    || c.starts_with("set_")
            })
            .collect();
        assert!(mutations.is_empty(), "unexpected mutations: {mutations:?}");
    }

    #[tokio::test]
    async fn validator_rejection_fails_cycle_without_execution() {
        let gateway = ScriptedGateway::new().reply(
            r#"[{"action":"open_long","symbol":"ETHUSDT","leverage":0,"position_size_usd":100,"stop_loss":100,"take_profit":200,"reasoning":"bad"}]"#,
        );
        let h = harness(config(1000.0), gateway);

        h.engine.run_cycle().await.unwrap();

        let record = &h.journal.recent("t1", 1)[0];
        assert!(!record.success);
        assert!(record.actions.is_empty());
        let error = record.error.as_deref().unwrap();
        assert!(
            error.contains("leverage") && error.contains("range"),
            "got: {error}"
        );
        assert!(h
            .exchange
            .call_log()
            .iter()
            .all(|c| !c.starts_with("open")));
    }

    #[tokio::test]
    async fn balance_resync_replaces_and_persists() {
        let gateway = ScriptedGateway::new().reply(r#"[{"action":"wait","reasoning":"-"}]"#);
        let h = harness(config(100.0), gateway);
        // Venue reports 120 available against a declared 100 — 20% drift.
        h.exchange.balance.lock().available = 120.0;

        h.engine.run_cycle().await.unwrap();

        assert!((h.engine.current_initial_balance() - 120.0).abs() < 1e-9);
        let persisted = h.store.persisted.lock().clone();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].0, "t1");
        assert!((persisted[0].1 - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn balance_within_threshold_not_replaced() {
        let gateway = ScriptedGateway::new().reply(r#"[{"action":"wait","reasoning":"-"}]"#);
        let h = harness(config(1000.0), gateway);
        // 2% drift stays under the 5% threshold.
        h.exchange.balance.lock().available = 1020.0;

        h.engine.run_cycle().await.unwrap();

        assert!((h.engine.current_initial_balance() - 1000.0).abs() < 1e-9);
        assert!(h.store.persisted.lock().is_empty());
    }

    #[tokio::test]
    async fn fullwidth_json_repaired_into_wait() {
        let gateway =
            ScriptedGateway::new().reply("［｛\"action\":\"wait\",\"leverage\":\"\"｝］");
        let h = harness(config(1000.0), gateway);

        h.engine.run_cycle().await.unwrap();

        let record = &h.journal.recent("t1", 1)[0];
        assert!(record.success, "repair should save the cycle: {:?}", record.error);
        assert_eq!(record.decisions.len(), 1);
        assert_eq!(record.decisions[0].action, "wait");
        assert_eq!(record.decisions[0].leverage, None);
    }

    #[tokio::test]
    async fn llm_garbage_becomes_wait_fallback() {
        let gateway = ScriptedGateway::new().reply("I refuse to answer in JSON today.");
        let h = harness(config(1000.0), gateway);

        h.engine.run_cycle().await.unwrap();

        let record = &h.journal.recent("t1", 1)[0];
        assert_eq!(record.decisions.len(), 1);
        assert_eq!(record.decisions[0].action, "wait");
        assert!(record.decisions[0]
            .reasoning
            .contains("I refuse to answer in JSON today."));
    }

    #[tokio::test]
    async fn halted_cycle_journals_skip() {
        let gateway = ScriptedGateway::new();
        let h = harness(config(1000.0), gateway);
        h.engine.halt_until(Utc::now() + chrono::Duration::hours(1));

        h.engine.run_cycle().await.unwrap();

        let record = &h.journal.recent("t1", 1)[0];
        assert!(!record.success);
        assert!(record.error.as_deref().unwrap().contains("halted"));
        assert!(h.exchange.call_log().is_empty());
    }

    #[tokio::test]
    async fn cycle_numbers_are_contiguous() {
        let gateway = ScriptedGateway::new()
            .reply(r#"[{"action":"wait","reasoning":"1"}]"#)
            .reply(r#"[{"action":"wait","reasoning":"2"}]"#)
            .reply(r#"[{"action":"wait","reasoning":"3"}]"#);
        let h = harness(config(1000.0), gateway);

        for _ in 0..3 {
            h.engine.run_cycle().await.unwrap();
        }

        let records = h.journal.recent("t1", 10);
        let numbers: Vec<u64> = records.iter().map(|r| r.cycle_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn first_observed_set_then_cleared() {
        let gateway = ScriptedGateway::new()
            .reply(r#"[{"action":"wait","reasoning":"observe"}]"#)
            .reply(r#"[{"action":"wait","reasoning":"observe again"}]"#);
        let h = harness(config(1000.0), gateway);
        h.exchange.push_position(held_btc_long());

        h.engine.run_cycle().await.unwrap();

        let key = PositionKey {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
        };
        let observed_at = *h.engine.first_observed.lock().get(&key).unwrap();

        // The journaled position carries the engine-assigned timestamp.
        let record = &h.journal.recent("t1", 1)[0];
        assert_eq!(record.positions[0].first_observed_at, Some(observed_at));

        // Position disappears (closed externally) — the entry is cleared on
        // the next cycle.
        h.exchange.positions.lock().clear();
        h.engine.run_cycle().await.unwrap();
        assert!(!h.engine.first_observed.lock().contains_key(&key));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let gateway = ScriptedGateway::new().reply(r#"[{"action":"wait","reasoning":"-"}]"#);
        let h = harness(config(1000.0), gateway);

        h.engine.start();
        assert_eq!(h.engine.state(), TraderState::Running);
        h.engine.start(); // second start is a no-op
        assert_eq!(h.engine.state(), TraderState::Running);

        h.engine.stop().await;
        assert_eq!(h.engine.state(), TraderState::Stopped);
        h.engine.stop().await; // second stop is a no-op
        assert_eq!(h.engine.state(), TraderState::Stopped);
    }
}

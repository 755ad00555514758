// =============================================================================
// Prompt Templates — built-in strategy personas and the hard-rules tail
// =============================================================================
//
// The system prompt is a pure function of (template, overlay, leverage
// ceilings): template body, optional user overlay, then a short tail
// restating the hard rules and the expected output schema. Keeping the tail
// out of the templates means every persona trades under the same contract.
// =============================================================================

/// Default persona: balanced swing trading on liquid perpetuals.
const TEMPLATE_DEFAULT: &str = r#"You are a disciplined perpetual-futures trader managing a small USDT account on a crypto exchange.

Style:
- Trade only when the indicator picture is aligned across timeframes; otherwise wait.
- Respect momentum: do not fade a strong trend without structural confirmation.
- Protect capital first. Size positions so a stop-loss hit costs a small, survivable fraction of equity.
- Prefer liquid symbols and clean setups over activity for its own sake.
"#;

/// Conservative persona: fewer trades, wider margins of safety.
const TEMPLATE_CONSERVATIVE: &str = r#"You are a highly risk-averse perpetual-futures trader preserving a small USDT account.

Style:
- Default to waiting. Enter only on high-conviction setups with multi-timeframe confluence.
- Use low leverage and small position sizes; never risk a large share of equity on one idea.
- Take profits early and move stops to break-even quickly.
- Close positions at the first sign the original thesis is invalidated.
"#;

/// Aggressive persona: momentum-chasing with tight invalidation.
const TEMPLATE_AGGRESSIVE: &str = r#"You are an aggressive momentum trader on crypto perpetual futures with a small USDT account.

Style:
- Hunt strong directional moves and breakouts; act decisively when momentum confirms.
- Accept higher leverage within the allowed ceilings, but always with a tight, well-defined stop.
- Cut losers immediately; let winners run with trailed protection.
- Stay flat in chop. A missed trade is cheaper than a bad one.
"#;

/// Resolve a built-in template body by name.
pub fn builtin_template(name: &str) -> Option<&'static str> {
    match name {
        "default" => Some(TEMPLATE_DEFAULT),
        "conservative" => Some(TEMPLATE_CONSERVATIVE),
        "aggressive" => Some(TEMPLATE_AGGRESSIVE),
        _ => None,
    }
}

/// The hard-rules tail appended to every system prompt.
pub fn hard_rules_tail(btc_eth_leverage: u32, altcoin_leverage: u32) -> String {
    format!(
        r#"
HARD RULES (non-negotiable, enforced by the engine):
1. Leverage: integer, 1..{btc_eth_leverage}x for BTCUSDT/ETHUSDT, 1..{altcoin_leverage}x for all other symbols.
2. position_size_usd is the NOTIONAL value (quantity x price), not margin. Margin used = position_size_usd / leverage. Keep total margin within available balance.
3. Every open must carry stop_loss and take_profit. For longs: stop_loss < current price < take_profit, and stop_loss must stay above the liquidation price (approx. entry x (1 - 1/leverage)). For shorts, mirrored.
4. Allowed actions: open_long, open_short, close_long, close_short, update_stop_loss, update_take_profit, partial_close, hold, wait.
5. partial_close requires close_percentage in (0, 100].

OUTPUT FORMAT: reply with your reasoning first if you wish, then exactly one JSON array of decision objects, e.g.:
[{{"action": "open_long", "symbol": "BTCUSDT", "leverage": 5, "position_size_usd": 500, "stop_loss": 58000, "take_profit": 64000, "confidence": 75, "reasoning": "..."}}]
For hold/wait only "action" and "reasoning" are required. Use numbers for numeric fields, never strings.
"#
    )
}

/// Assemble the full system prompt.
pub fn system_prompt(
    template_body: &str,
    overlay: Option<&str>,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
) -> String {
    let mut out = String::with_capacity(template_body.len() + 1024);
    out.push_str(template_body.trim_end());
    if let Some(overlay) = overlay {
        if !overlay.trim().is_empty() {
            out.push_str("\n\nOperator notes:\n");
            out.push_str(overlay.trim());
        }
    }
    out.push('\n');
    out.push_str(&hard_rules_tail(btc_eth_leverage, altcoin_leverage));
    out
}

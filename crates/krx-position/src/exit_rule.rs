//! Exit decision engine.
//!
//! Turns one raw quote frame into a verdict for a held position:
//!
//! 1. Control / ack frames -> `Pending`
//! 2. Best ask from field 15; missing or unparseable -> `Pending`
//! 3. `safe_price = max(ask - 2 * tick(ask), tick(ask))`
//! 4. Outside the trading window -> `Hold` (throttled log, nothing else)
//! 5. Conditions, evaluated in order, later ones overriding earlier:
//!    - A `expired`: today is past the target date and the end-of-day exit
//!      time has been reached
//!    - B `profit`: `safe > avg * selling_point_upper`
//!    - C `stop-loss`: otherwise, `safe < avg * risk_mgmt_upper`
//! 6. Nothing fired -> `Hold`
//!
//! A price condition therefore replaces a pending expiry reason when both
//! hold on the same frame. Either way the position is sold at the safe
//! price; only the recorded reason differs.

use chrono::{NaiveDate, NaiveDateTime};
use krx_core::{safe_price, ExitReason, Price, TradingWindow};
use krx_telemetry::LogThrottle;
use krx_ws::{best_ask, is_control_frame};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Interval between "outside trading hours" log lines per monitor.
const OUTSIDE_HOURS_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Exit thresholds and trading window.
#[derive(Debug, Clone, Deserialize)]
pub struct ExitRuleConfig {
    /// Profit target as a multiple of the average cost.
    #[serde(default = "default_selling_point_upper")]
    pub selling_point_upper: Decimal,
    /// Stop-loss level as a multiple of the average cost.
    #[serde(default = "default_risk_mgmt_upper")]
    pub risk_mgmt_upper: Decimal,
    #[serde(default)]
    pub window: TradingWindow,
}

fn default_selling_point_upper() -> Decimal {
    Decimal::new(102, 2)
}

fn default_risk_mgmt_upper() -> Decimal {
    Decimal::new(93, 2)
}

impl Default for ExitRuleConfig {
    fn default() -> Self {
        Self {
            selling_point_upper: default_selling_point_upper(),
            risk_mgmt_upper: default_risk_mgmt_upper(),
            window: TradingWindow::default(),
        }
    }
}

/// Outcome of evaluating one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No decision: control frame or no usable ask.
    Pending,
    Hold,
    Exit { reason: ExitReason, safe_price: Price },
}

/// Decide on a parsed best ask.
#[must_use]
pub fn decide(
    config: &ExitRuleConfig,
    ask: Price,
    avg_price: Price,
    target_date: NaiveDate,
    now: NaiveDateTime,
) -> Verdict {
    let safe = safe_price(ask);
    if !config.window.contains(now) {
        return Verdict::Hold;
    }

    let mut reason = None;
    if now.date() > target_date && config.window.past_eod_exit(now) {
        reason = Some(ExitReason::Expired);
    }
    let avg = avg_price.inner();
    if safe.inner() > avg * config.selling_point_upper {
        reason = Some(ExitReason::Profit);
    } else if safe.inner() < avg * config.risk_mgmt_upper {
        reason = Some(ExitReason::StopLoss);
    }

    match reason {
        Some(reason) => Verdict::Exit {
            reason,
            safe_price: safe,
        },
        None => Verdict::Hold,
    }
}

/// Per-monitor decision engine. Owns the throttle for its log lines.
#[derive(Debug)]
pub struct ExitRule {
    config: ExitRuleConfig,
    outside_hours: LogThrottle,
}

impl ExitRule {
    pub fn new(config: ExitRuleConfig) -> Self {
        Self {
            config,
            outside_hours: LogThrottle::new(OUTSIDE_HOURS_LOG_INTERVAL),
        }
    }

    pub fn config(&self) -> &ExitRuleConfig {
        &self.config
    }

    /// Evaluate one raw frame for a position with `avg_price` and
    /// `target_date` at local time `now`.
    pub fn evaluate(
        &mut self,
        raw: &str,
        avg_price: Price,
        target_date: NaiveDate,
        now: NaiveDateTime,
    ) -> Verdict {
        if is_control_frame(raw) {
            return Verdict::Pending;
        }
        let Some(ask) = best_ask(raw) else {
            debug!(len = raw.len(), "No usable ask in frame");
            return Verdict::Pending;
        };
        if !avg_price.is_positive() {
            debug!(%avg_price, "No average cost, cannot evaluate");
            return Verdict::Pending;
        }

        if !self.config.window.contains(now) {
            if self.outside_hours.should_log() {
                let suppressed = self.outside_hours.take_suppressed();
                info!(%now, %ask, suppressed, "Outside trading hours, holding");
            }
            return Verdict::Hold;
        }

        let verdict = decide(&self.config, ask, avg_price, target_date, now);
        if let Verdict::Exit { reason, safe_price } = verdict {
            info!(
                %reason,
                %ask,
                %safe_price,
                %avg_price,
                %target_date,
                "Exit condition met"
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(ask: &str) -> String {
        let mut fields = vec!["0|H0STCNT0|001|005930".to_string()];
        for i in 1..20 {
            fields.push(if i == 15 { ask.to_string() } else { i.to_string() });
        }
        fields.join("^")
    }

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        // March 2026: the 2nd is a Monday.
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn target(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn rule() -> ExitRule {
        ExitRule::new(ExitRuleConfig::default())
    }

    /// Default rule against an average price of 10,000.
    fn judge(ask: &str, target_date: NaiveDate, now: NaiveDateTime) -> Verdict {
        rule().evaluate(&quote(ask), Price::from_krw(10_000), target_date, now)
    }

    #[test]
    fn test_profit_scenario() {
        // ask 10600 -> tick 50 -> safe 10500 > 10000 * 1.02
        let verdict = judge("10600", target(20), at(3, 10, 0));
        assert_eq!(
            verdict,
            Verdict::Exit {
                reason: ExitReason::Profit,
                safe_price: Price::from_krw(10_500)
            }
        );
    }

    #[test]
    fn test_stop_loss_scenario() {
        // ask 9000 -> tick 10 -> safe 8980 < 10000 * 0.93
        let verdict = judge("9000", target(20), at(3, 10, 0));
        assert_eq!(
            verdict,
            Verdict::Exit {
                reason: ExitReason::StopLoss,
                safe_price: Price::from_krw(8_980)
            }
        );
    }

    #[test]
    fn test_expired_scenario() {
        // safe 9900: neither above 10200 nor below 9300.
        let verdict = judge("10000", target(3), at(4, 15, 12));
        assert_eq!(
            verdict,
            Verdict::Exit {
                reason: ExitReason::Expired,
                safe_price: Price::from_krw(9_900)
            }
        );
    }

    #[test]
    fn test_expiry_waits_for_eod_cutoff() {
        let verdict = judge("10000", target(3), at(4, 15, 9));
        assert_eq!(verdict, Verdict::Hold);
        // On the target date itself, not yet expired.
        let verdict = judge("10000", target(4), at(4, 15, 12));
        assert_eq!(verdict, Verdict::Hold);
    }

    #[test]
    fn test_price_reason_overrides_expiry() {
        let verdict = judge("10600", target(3), at(4, 15, 12));
        assert!(matches!(
            verdict,
            Verdict::Exit {
                reason: ExitReason::Profit,
                ..
            }
        ));
        let verdict = judge("9000", target(3), at(4, 15, 12));
        assert!(matches!(
            verdict,
            Verdict::Exit {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
    }

    #[test]
    fn test_outside_window_always_holds() {
        let mut r = rule();
        let avg = Price::from_krw(10_000);
        // Would be profit, stop-loss and expired inside the window.
        for ask in ["10600", "9000", "10000"] {
            assert_eq!(r.evaluate(&quote(ask), avg, target(1), at(3, 8, 59)), Verdict::Hold);
            assert_eq!(r.evaluate(&quote(ask), avg, target(1), at(3, 15, 30)), Verdict::Hold);
            // Saturday.
            assert_eq!(r.evaluate(&quote(ask), avg, target(1), at(7, 10, 0)), Verdict::Hold);
        }
    }

    #[test]
    fn test_control_and_bad_frames_pending() {
        let mut r = rule();
        let avg = Price::from_krw(10_000);
        let ack = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930"},
            "body":{"rt_cd":"0","msg1":"SUBSCRIBE SUCCESS"}}"#;
        assert_eq!(r.evaluate(ack, avg, target(20), at(3, 10, 0)), Verdict::Pending);
        assert_eq!(r.evaluate("PINGPONG", avg, target(20), at(3, 10, 0)), Verdict::Pending);
        assert_eq!(r.evaluate(&quote("abc"), avg, target(20), at(3, 10, 0)), Verdict::Pending);
        let short = "0|H0STCNT0|001|005930^1^2";
        assert_eq!(r.evaluate(short, avg, target(20), at(3, 10, 0)), Verdict::Pending);
    }

    #[test]
    fn test_hold_between_thresholds() {
        let verdict = judge("10100", target(20), at(3, 10, 0));
        assert_eq!(verdict, Verdict::Hold);
    }

    #[test]
    fn test_custom_thresholds() {
        let config = ExitRuleConfig {
            selling_point_upper: dec!(1.10),
            risk_mgmt_upper: dec!(0.80),
            ..Default::default()
        };
        let ask = Price::from_krw(10_600);
        assert_eq!(
            decide(&config, ask, Price::from_krw(10_000), target(20), at(3, 10, 0)),
            Verdict::Hold
        );
    }

    #[test]
    fn test_config_from_toml() {
        let config: ExitRuleConfig = toml::from_str(
            r#"
            selling_point_upper = "1.05"

            [window]
            open = "09:00:00"
            close = "15:20:00"
            eod_exit = "15:00:00"
            "#,
        )
        .unwrap();
        assert_eq!(config.selling_point_upper, dec!(1.05));
        assert_eq!(config.risk_mgmt_upper, dec!(0.93));
        assert!(config.window.past_eod_exit(at(3, 15, 0)));
    }
}

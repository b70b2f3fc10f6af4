//! Wire formats for the realtime quote feed.
//!
//! Inbound text frames come in three shapes:
//! - Keepalive: a JSON frame whose header `tr_id` is `PINGPONG`. Echoed back
//!   verbatim.
//! - Control: any other JSON frame, e.g. the `SUBSCRIBE SUCCESS` ack.
//!   Consumed by the client, never forwarded.
//! - Quote: `0|TR_ID|NNN|TICKER^f1^f2...`. Caret-separated fields; the first
//!   field is a `|`-separated header whose last token is the ticker.
//!
//! Outbound frames are the JSON subscribe/unsubscribe envelope.

use crate::error::WsResult;
use krx_core::Price;
use serde::{Deserialize, Serialize};

/// Marker carried by keepalive frames.
pub const KEEPALIVE_MARKER: &str = "PINGPONG";

/// Caret field holding the best ask in a quote frame.
pub const ASK_FIELD_INDEX: usize = 15;

/// Default realtime quote transaction id.
pub const DEFAULT_TR_ID: &str = "H0STCNT0";

// ============================================================================
// Outbound
// ============================================================================

/// Subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionAction {
    /// `tr_type` value on the wire.
    pub fn tr_type(&self) -> &'static str {
        match self {
            Self::Subscribe => "1",
            Self::Unsubscribe => "2",
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestHeader<'a> {
    approval_key: &'a str,
    custtype: &'a str,
    tr_type: &'a str,
    #[serde(rename = "content-type")]
    content_type: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestInput<'a> {
    tr_id: &'a str,
    tr_key: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    input: RequestInput<'a>,
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    header: RequestHeader<'a>,
    body: RequestBody<'a>,
}

/// Build a subscribe/unsubscribe envelope.
pub fn subscription_request(
    approval_key: &str,
    tr_id: &str,
    ticker: &str,
    action: SubscriptionAction,
) -> WsResult<String> {
    let req = SubscriptionRequest {
        header: RequestHeader {
            approval_key,
            custtype: "P",
            tr_type: action.tr_type(),
            content_type: "utf-8",
        },
        body: RequestBody {
            input: RequestInput {
                tr_id,
                tr_key: ticker,
            },
        },
    };
    Ok(serde_json::to_string(&req)?)
}

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlHeader {
    #[serde(default)]
    pub tr_id: String,
    #[serde(default)]
    pub tr_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlBody {
    #[serde(default)]
    pub rt_cd: String,
    #[serde(default)]
    pub msg_cd: String,
    #[serde(default)]
    pub msg1: String,
}

/// JSON control frame (subscription ack or error).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlFrame {
    #[serde(default)]
    pub header: ControlHeader,
    #[serde(default)]
    pub body: Option<ControlBody>,
}

impl ControlFrame {
    /// `rt_cd == "0"`, or no body at all.
    pub fn is_success(&self) -> bool {
        self.body.as_ref().map_or(true, |b| b.rt_cd == "0")
    }

    pub fn message(&self) -> &str {
        self.body.as_ref().map_or("", |b| b.msg1.as_str())
    }

    /// The server refused the approval key.
    pub fn is_auth_failure(&self) -> bool {
        if self.is_success() {
            return false;
        }
        let msg = self.message().to_ascii_lowercase();
        msg.contains("approval") || msg.contains("appkey")
    }
}

/// Market-data frame borrowed from the raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteFrame<'a> {
    pub raw: &'a str,
    pub tr_id: &'a str,
    pub ticker: &'a str,
}

impl<'a> QuoteFrame<'a> {
    /// Parse the header of a plaintext quote frame.
    pub fn parse(raw: &'a str) -> Option<Self> {
        if !raw.starts_with('0') {
            return None;
        }
        let header = raw.split('^').next()?;
        let mut tokens = header.split('|');
        let _encrypted = tokens.next()?;
        let tr_id = tokens.next()?;
        let ticker = header.rsplit('|').next()?.trim();
        if ticker.is_empty() || tr_id.is_empty() {
            return None;
        }
        Some(Self { raw, tr_id, ticker })
    }

    pub fn best_ask(&self) -> Option<Price> {
        best_ask(self.raw)
    }
}

/// Best ask from caret field 15. `None` when absent, unparseable or not
/// positive.
pub fn best_ask(raw: &str) -> Option<Price> {
    let field = raw.split('^').nth(ASK_FIELD_INDEX)?;
    let price: Price = field.parse().ok()?;
    price.is_positive().then_some(price)
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone)]
pub enum InboundFrame<'a> {
    Keepalive,
    Control(ControlFrame),
    Quote(QuoteFrame<'a>),
    /// Encrypted or malformed frame.
    Unknown,
}

impl InboundFrame<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Keepalive => "keepalive",
            Self::Control(_) => "ack",
            Self::Quote(_) => "quote",
            Self::Unknown => "unknown",
        }
    }
}

/// Classify a text frame.
pub fn classify(text: &str) -> InboundFrame<'_> {
    if text.contains(KEEPALIVE_MARKER) {
        return InboundFrame::Keepalive;
    }
    if text.trim_start().starts_with('{') {
        return match serde_json::from_str::<ControlFrame>(text) {
            Ok(frame) => InboundFrame::Control(frame),
            Err(_) => InboundFrame::Unknown,
        };
    }
    match QuoteFrame::parse(text) {
        Some(q) => InboundFrame::Quote(q),
        None => InboundFrame::Unknown,
    }
}

/// Whether a raw frame is a control/ack frame rather than market data.
pub fn is_control_frame(text: &str) -> bool {
    matches!(
        classify(text),
        InboundFrame::Control(_) | InboundFrame::Keepalive
    )
}

#[cfg(test)]
pub(crate) mod test_frames {
    /// Quote frame with `ask` at field 15.
    pub fn quote(ticker: &str, ask: &str) -> String {
        let mut fields: Vec<String> = vec![format!("0|H0STCNT0|001|{ticker}")];
        for i in 1..20 {
            if i == super::ASK_FIELD_INDEX {
                fields.push(ask.to_string());
            } else {
                fields.push(format!("{i}"));
            }
        }
        fields.join("^")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_envelope_shape() {
        let text =
            subscription_request("KEY", "H0STCNT0", "005930", SubscriptionAction::Subscribe)
                .unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["header"]["approval_key"], "KEY");
        assert_eq!(v["header"]["custtype"], "P");
        assert_eq!(v["header"]["tr_type"], "1");
        assert_eq!(v["header"]["content-type"], "utf-8");
        assert_eq!(v["body"]["input"]["tr_id"], "H0STCNT0");
        assert_eq!(v["body"]["input"]["tr_key"], "005930");
    }

    #[test]
    fn test_unsubscribe_tr_type() {
        let text =
            subscription_request("KEY", "H0STCNT0", "005930", SubscriptionAction::Unsubscribe)
                .unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["header"]["tr_type"], "2");
    }

    #[test]
    fn test_classify_keepalive() {
        let raw = r#"{"header":{"tr_id":"PINGPONG","datetime":"20260302093000"}}"#;
        assert!(matches!(classify(raw), InboundFrame::Keepalive));
    }

    #[test]
    fn test_classify_subscribe_ack() {
        let raw = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930","encrypt":"N"},
            "body":{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"}}"#;
        match classify(raw) {
            InboundFrame::Control(frame) => {
                assert!(frame.is_success());
                assert_eq!(frame.message(), "SUBSCRIBE SUCCESS");
                assert_eq!(frame.header.tr_key.as_deref(), Some("005930"));
                assert!(!frame.is_auth_failure());
            }
            other => panic!("expected control frame, got {other:?}"),
        }
        assert!(is_control_frame(raw));
    }

    #[test]
    fn test_control_auth_failure() {
        let raw = r#"{"header":{"tr_id":"H0STCNT0"},
            "body":{"rt_cd":"1","msg_cd":"OPSP8996","msg1":"invalid approval : NOT FOUND"}}"#;
        match classify(raw) {
            InboundFrame::Control(frame) => assert!(frame.is_auth_failure()),
            other => panic!("expected control frame, got {other:?}"),
        }
    }

    #[test]
    fn test_quote_header_parsing() {
        let raw = test_frames::quote("005930", "71200");
        match classify(&raw) {
            InboundFrame::Quote(q) => {
                assert_eq!(q.ticker, "005930");
                assert_eq!(q.tr_id, "H0STCNT0");
                assert_eq!(q.best_ask(), Some(Price::new(dec!(71200))));
            }
            other => panic!("expected quote, got {other:?}"),
        }
        assert!(!is_control_frame(&raw));
    }

    #[test]
    fn test_best_ask_absent_or_bad() {
        assert_eq!(best_ask("0|H0STCNT0|001|005930^1^2"), None);
        assert_eq!(best_ask(&test_frames::quote("005930", "abc")), None);
        assert_eq!(best_ask(&test_frames::quote("005930", "0")), None);
    }

    #[test]
    fn test_encrypted_frame_is_unknown() {
        assert!(matches!(
            classify("1|H0STCNI0|001|abcdef"),
            InboundFrame::Unknown
        ));
    }
}

//! # Status Inference
//!
//! Rule-based derivation of a call's summary from its merged timeline. The
//! load-bearing part is hangup attribution, which is an explicit ordered
//! list of (predicate, resolver) rules evaluated first-match-wins:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Hangup attribution chain                 │
//! │                                                          │
//! │  COMPLETECALLER ──► caller (answered)                    │
//! │  COMPLETEAGENT ───► agent (answered)                     │
//! │  ABANDON ─────────► caller (not answered, wait = data3)  │
//! │  EXITWITHKEY ─────► caller_key (wait = data3)            │
//! │  EXITWITHTIMEOUT ─► timeout (wait = data3)               │
//! │  EXITEMPTY ───────► system                               │
//! │  CDR disposition ─► heuristic (answered/busy/failed/...) │
//! │  answered call ───► unknown                              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The ordering exists because multiple terminal queue events can be
//! present for one call under upstream race conditions (an `ABANDON` and a
//! late `COMPLETECALLER`): caller/agent completion is the most
//! authoritative signal and must win over abandonment heuristics derived
//! from absence-of-signal.

use crate::database::CdrRecord;
use crate::trace::types::{CallEvent, CallStatus, CallSummary, EventSource, HangupBy};

/// Queue-log event kinds the inference pass recognizes
pub const KIND_COMPLETE_CALLER: &str = "COMPLETECALLER";
pub const KIND_COMPLETE_AGENT: &str = "COMPLETEAGENT";
pub const KIND_ABANDON: &str = "ABANDON";
pub const KIND_EXIT_WITH_KEY: &str = "EXITWITHKEY";
pub const KIND_EXIT_WITH_TIMEOUT: &str = "EXITWITHTIMEOUT";
pub const KIND_EXIT_EMPTY: &str = "EXITEMPTY";
pub const KIND_CONNECT: &str = "CONNECT";
pub const KIND_AGENT_CONNECT: &str = "AGENTCONNECT";
pub const KIND_TRANSFER: &str = "TRANSFER";
pub const KIND_BLIND_TRANSFER: &str = "BLINDTRANSFER";
pub const KIND_ATTENDED_TRANSFER: &str = "ATTENDEDTRANSFER";
pub const KIND_ENTER_QUEUE: &str = "ENTERQUEUE";
pub const KIND_RING_NO_ANSWER: &str = "RINGNOANSWER";
pub const KIND_RING_CANCELED: &str = "RINGCANCELED";
/// IVR-side secondary signal for queue entry
pub const KIND_IVR_QUEUE_ENTER: &str = "QUEUE_ENTER";

/// The significant queue-log events found in one timeline, each the first
/// of its kind in timeline order.
#[derive(Debug, Default)]
pub struct QueueSignals<'a> {
    pub complete_caller: Option<&'a CallEvent>,
    pub complete_agent: Option<&'a CallEvent>,
    pub abandon: Option<&'a CallEvent>,
    pub exit_with_key: Option<&'a CallEvent>,
    pub exit_with_timeout: Option<&'a CallEvent>,
    pub exit_empty: Option<&'a CallEvent>,
    pub connect: Option<&'a CallEvent>,
    pub transfer: Option<&'a CallEvent>,
    pub enter_queue: Option<&'a CallEvent>,
    pub ivr_queue_enter: Option<&'a CallEvent>,
    /// Every ring attempt that went unanswered, in timeline order
    pub ring_no_answer: Vec<&'a CallEvent>,
}

impl<'a> QueueSignals<'a> {
    /// Scan a merged timeline for the recognized event kinds.
    pub fn collect(timeline: &'a [CallEvent]) -> Self {
        let mut signals = QueueSignals::default();
        for event in timeline {
            match event.source {
                EventSource::Queue => match event.kind.as_str() {
                    KIND_COMPLETE_CALLER => first(&mut signals.complete_caller, event),
                    KIND_COMPLETE_AGENT => first(&mut signals.complete_agent, event),
                    KIND_ABANDON => first(&mut signals.abandon, event),
                    KIND_EXIT_WITH_KEY => first(&mut signals.exit_with_key, event),
                    KIND_EXIT_WITH_TIMEOUT => first(&mut signals.exit_with_timeout, event),
                    KIND_EXIT_EMPTY => first(&mut signals.exit_empty, event),
                    KIND_CONNECT | KIND_AGENT_CONNECT => first(&mut signals.connect, event),
                    KIND_TRANSFER | KIND_BLIND_TRANSFER | KIND_ATTENDED_TRANSFER => {
                        first(&mut signals.transfer, event)
                    }
                    KIND_ENTER_QUEUE => first(&mut signals.enter_queue, event),
                    KIND_RING_NO_ANSWER | KIND_RING_CANCELED => {
                        signals.ring_no_answer.push(event)
                    }
                    _ => {}
                },
                EventSource::Ivr => {
                    if event.kind == KIND_IVR_QUEUE_ENTER {
                        first(&mut signals.ivr_queue_enter, event);
                    }
                }
                _ => {}
            }
        }
        signals
    }
}

fn first<'a>(slot: &mut Option<&'a CallEvent>, event: &'a CallEvent) {
    if slot.is_none() {
        *slot = Some(event);
    }
}

/// Inputs available to a hangup attribution rule
pub struct RuleContext<'a> {
    pub signals: &'a QueueSignals<'a>,
    pub cdr: Option<&'a CdrRecord>,
}

/// One (predicate, resolver) pair in the attribution chain
pub struct HangupRule {
    pub name: &'static str,
    pub applies: fn(&RuleContext<'_>, &CallSummary) -> bool,
    pub resolve: fn(&RuleContext<'_>, &mut CallSummary),
}

/// The attribution chain, in authority order. First match wins; this
/// ordering is a contract, not an implementation detail.
pub const HANGUP_RULES: &[HangupRule] = &[
    HangupRule {
        name: "complete-caller",
        applies: |ctx, _| ctx.signals.complete_caller.is_some(),
        resolve: |_, summary| {
            summary.answered = true;
            summary.hangup_by = Some(HangupBy::Caller);
        },
    },
    HangupRule {
        name: "complete-agent",
        applies: |ctx, _| ctx.signals.complete_agent.is_some(),
        resolve: |_, summary| {
            summary.answered = true;
            summary.hangup_by = Some(HangupBy::Agent);
        },
    },
    HangupRule {
        name: "abandon",
        applies: |ctx, _| ctx.signals.abandon.is_some(),
        resolve: |ctx, summary| {
            summary.answered = false;
            summary.hangup_by = Some(HangupBy::Caller);
            if let Some(event) = ctx.signals.abandon {
                if let Some(wait) = event.detail("data3").and_then(parse_seconds) {
                    summary.queue_wait_seconds = Some(wait);
                }
            }
        },
    },
    HangupRule {
        name: "exit-with-key",
        applies: |ctx, _| ctx.signals.exit_with_key.is_some(),
        resolve: |ctx, summary| {
            summary.hangup_by = Some(HangupBy::CallerKey);
            if let Some(event) = ctx.signals.exit_with_key {
                if let Some(wait) = event.detail("data3").and_then(parse_seconds) {
                    summary.queue_wait_seconds = Some(wait);
                }
            }
        },
    },
    HangupRule {
        name: "exit-with-timeout",
        applies: |ctx, _| ctx.signals.exit_with_timeout.is_some(),
        resolve: |ctx, summary| {
            summary.hangup_by = Some(HangupBy::Timeout);
            if let Some(event) = ctx.signals.exit_with_timeout {
                if let Some(wait) = event.detail("data3").and_then(parse_seconds) {
                    summary.queue_wait_seconds = Some(wait);
                }
            }
        },
    },
    HangupRule {
        name: "exit-empty",
        applies: |ctx, _| ctx.signals.exit_empty.is_some(),
        resolve: |_, summary| {
            summary.hangup_by = Some(HangupBy::System);
        },
    },
    HangupRule {
        name: "cdr-disposition",
        applies: |ctx, _| {
            matches!(
                ctx.cdr.map(|cdr| cdr.disposition.trim()),
                Some("ANSWERED" | "NO ANSWER" | "BUSY" | "FAILED")
            )
        },
        resolve: |ctx, summary| {
            let Some(cdr) = ctx.cdr else { return };
            summary.hangup_by = Some(match cdr.disposition.trim() {
                "ANSWERED" => {
                    // A missing destination channel means the agent leg was
                    // torn down first.
                    if cdr.dest_channel.as_deref().unwrap_or("").is_empty() {
                        HangupBy::Agent
                    } else {
                        HangupBy::Caller
                    }
                }
                "NO ANSWER" => HangupBy::Timeout,
                "BUSY" => HangupBy::Agent,
                _ => HangupBy::System,
            });
        },
    },
    HangupRule {
        name: "default-unknown",
        applies: |ctx, summary| {
            summary.answered
                || ctx
                    .cdr
                    .map(|cdr| cdr.disposition.trim() == "ANSWERED")
                    .unwrap_or(false)
        },
        resolve: |_, summary| {
            summary.hangup_by = Some(HangupBy::Unknown);
        },
    },
];

/// Run the full inference pass over a merged timeline, mutating the summary
/// draft in place. `started_at`/`ended_at` are derived by the builder before
/// this is called.
pub fn infer_summary(
    summary: &mut CallSummary,
    timeline: &[CallEvent],
    cdr: Option<&CdrRecord>,
) {
    let signals = QueueSignals::collect(timeline);

    // Queue entry, from the queue log first, the IVR log second.
    if let Some(event) = signals.enter_queue {
        summary.queue_entered = true;
        summary.queue_name = event.detail("queue").map(str::to_string);
    } else if let Some(event) = signals.ivr_queue_enter {
        summary.queue_entered = true;
        summary.queue_name = event.detail("meta").map(str::to_string);
    }

    // Ring attempts nobody picked up, duplicates preserved.
    summary.ignored_agents = signals
        .ring_no_answer
        .iter()
        .filter_map(|event| event.detail("agent"))
        .map(str::to_string)
        .collect();

    if let Some(event) = signals.transfer {
        summary.was_transferred = true;
        summary.transfer_target = event.detail("data1").map(str::to_string);
    }

    if let Some(event) = signals.connect {
        summary.answered = true;
        summary.agent = event.detail("agent").map(str::to_string);
        summary.answered_at = Some(event.timestamp);
        // The queue system's own recorded time-in-queue, not recomputed.
        summary.queue_wait_seconds = first_numeric_data(event);
    }

    let ctx = RuleContext { signals: &signals, cdr };
    for rule in HANGUP_RULES {
        if (rule.applies)(&ctx, summary) {
            (rule.resolve)(&ctx, summary);
            break;
        }
    }

    // Reconciling fallback: when the queue system never recorded a wait
    // time, recompute it from the timeline delta.
    if summary.queue_wait_seconds.is_none() && summary.queue_entered {
        summary.queue_wait_seconds = recompute_queue_wait(&signals);
    }

    // Final status. Answered (including a late completion that beat an
    // abandon) wins, then an observed abandon, then the CDR disposition.
    summary.status = if summary.answered {
        CallStatus::Answered
    } else if signals.abandon.is_some() {
        CallStatus::Abandon
    } else if let Some(cdr) = cdr {
        CallStatus::from_disposition(&cdr.disposition)
    } else {
        CallStatus::Unknown
    };
}

/// First of `data1..data5` that parses as whole seconds.
fn first_numeric_data(event: &CallEvent) -> Option<i64> {
    ["data1", "data2", "data3", "data4", "data5"]
        .iter()
        .filter_map(|key| event.detail(key))
        .find_map(|value| parse_seconds(value))
}

fn parse_seconds(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Delta between the queue entry and the first terminal/connect event.
fn recompute_queue_wait(signals: &QueueSignals<'_>) -> Option<i64> {
    let entered = signals.enter_queue?;
    let left = [
        signals.connect,
        signals.abandon,
        signals.exit_with_key,
        signals.exit_empty,
    ]
    .into_iter()
    .flatten()
    .min_by_key(|event| event.timestamp)?;
    Some((left.timestamp - entered.timestamp).num_seconds())
}

/// Build a queue-sourced timeline event (shared with the merge step).
pub(crate) fn queue_event_details(
    queue_name: &str,
    agent: Option<&str>,
    data: [Option<&str>; 5],
) -> std::collections::HashMap<String, String> {
    let mut details = std::collections::HashMap::new();
    details.insert("queue".to_string(), queue_name.to_string());
    if let Some(agent) = agent {
        details.insert("agent".to_string(), agent.to_string());
    }
    for (index, value) in data.iter().enumerate() {
        if let Some(value) = value {
            details.insert(format!("data{}", index + 1), value.to_string());
        }
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::normalize_timestamp;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    fn queue_event(
        offset_secs: i64,
        kind: &str,
        agent: Option<&str>,
        data: [Option<&str>; 5],
    ) -> CallEvent {
        let base = normalize_timestamp(Some("2024-03-01T10:00:00Z"));
        CallEvent {
            timestamp: base + Duration::seconds(offset_secs),
            source: EventSource::Queue,
            kind: kind.to_string(),
            details: queue_event_details("sales", agent, data),
        }
    }

    fn summary() -> CallSummary {
        CallSummary::empty("test-call", Utc::now())
    }

    #[test]
    fn complete_caller_beats_abandon() {
        // Upstream race: both an ABANDON and a late COMPLETECALLER exist.
        let timeline = vec![
            queue_event(0, KIND_ENTER_QUEUE, None, [None; 5]),
            queue_event(30, KIND_ABANDON, None, [Some("1"), Some("1"), Some("30"), None, None]),
            queue_event(35, KIND_COMPLETE_CALLER, Some("Agent/100"), [None; 5]),
        ];
        let mut s = summary();
        infer_summary(&mut s, &timeline, None);
        assert!(s.answered, "completion rule must win over abandon");
        assert_eq!(s.hangup_by, Some(HangupBy::Caller));
    }

    #[test]
    fn abandon_sets_wait_from_data3() {
        let timeline = vec![
            queue_event(0, KIND_ENTER_QUEUE, None, [None; 5]),
            queue_event(30, KIND_ABANDON, None, [Some("1"), Some("1"), Some("30"), None, None]),
        ];
        let mut s = summary();
        infer_summary(&mut s, &timeline, None);
        assert!(!s.answered);
        assert_eq!(s.hangup_by, Some(HangupBy::Caller));
        assert_eq!(s.queue_wait_seconds, Some(30));
        assert!(s.queue_entered);
        assert_eq!(s.queue_name.as_deref(), Some("sales"));
    }

    #[test]
    fn exit_variants_attribute_correctly() {
        for (kind, expected) in [
            (KIND_EXIT_WITH_KEY, HangupBy::CallerKey),
            (KIND_EXIT_WITH_TIMEOUT, HangupBy::Timeout),
            (KIND_EXIT_EMPTY, HangupBy::System),
        ] {
            let timeline = vec![
                queue_event(0, KIND_ENTER_QUEUE, None, [None; 5]),
                queue_event(45, kind, None, [None, None, Some("45"), None, None]),
            ];
            let mut s = summary();
            infer_summary(&mut s, &timeline, None);
            assert_eq!(s.hangup_by, Some(expected), "kind {}", kind);
        }
    }

    #[test]
    fn connect_records_agent_and_recorded_wait() {
        let timeline = vec![
            queue_event(0, KIND_ENTER_QUEUE, None, [None; 5]),
            queue_event(12, KIND_CONNECT, Some("Agent/101"), [Some("12"), None, None, None, None]),
        ];
        let mut s = summary();
        infer_summary(&mut s, &timeline, None);
        assert!(s.answered);
        assert_eq!(s.agent.as_deref(), Some("Agent/101"));
        assert_eq!(s.queue_wait_seconds, Some(12));
        assert!(s.answered_at.is_some());
        // No terminal event and no CDR: answered call defaults to unknown.
        assert_eq!(s.hangup_by, Some(HangupBy::Unknown));
    }

    #[test]
    fn ignored_agents_preserve_order_and_duplicates() {
        let timeline = vec![
            queue_event(0, KIND_ENTER_QUEUE, None, [None; 5]),
            queue_event(5, KIND_RING_NO_ANSWER, Some("Agent/100"), [None; 5]),
            queue_event(10, KIND_RING_NO_ANSWER, Some("Agent/101"), [None; 5]),
            queue_event(15, KIND_RING_CANCELED, Some("Agent/100"), [None; 5]),
            queue_event(20, KIND_TRANSFER, None, [Some("2000"), None, None, None, None]),
        ];
        let mut s = summary();
        infer_summary(&mut s, &timeline, None);
        assert_eq!(s.ignored_agents, vec!["Agent/100", "Agent/101", "Agent/100"]);
        assert!(s.was_transferred);
        assert_eq!(s.transfer_target.as_deref(), Some("2000"));
    }

    #[test]
    fn cdr_disposition_heuristic() {
        let cdr = |disposition: &str, dest_channel: Option<&str>| CdrRecord {
            sequence_id: 1,
            unique_id: "100.1".to_string(),
            call_time: "2024-03-01T10:00:00Z".to_string(),
            duration_seconds: 42,
            disposition: disposition.to_string(),
            source_number: Some("5551000".to_string()),
            dest_number: Some("200".to_string()),
            dest_channel: dest_channel.map(str::to_string),
            caller_id_text: None,
            userfield: None,
        };

        let cases = [
            ("ANSWERED", Some("SIP/200"), HangupBy::Caller),
            ("ANSWERED", None, HangupBy::Agent),
            ("NO ANSWER", None, HangupBy::Timeout),
            ("BUSY", None, HangupBy::Agent),
            ("FAILED", None, HangupBy::System),
        ];
        for (disposition, dest_channel, expected) in cases {
            let record = cdr(disposition, dest_channel);
            let mut s = summary();
            infer_summary(&mut s, &[], Some(&record));
            assert_eq!(s.hangup_by, Some(expected), "disposition {}", disposition);
        }
    }

    #[test]
    fn queue_wait_recomputed_from_timeline_delta() {
        // EXITEMPTY carries no recorded wait time; the delta fallback kicks in.
        let timeline = vec![
            queue_event(0, KIND_ENTER_QUEUE, None, [None; 5]),
            queue_event(25, KIND_EXIT_EMPTY, None, [None; 5]),
        ];
        let mut s = summary();
        infer_summary(&mut s, &timeline, None);
        assert_eq!(s.hangup_by, Some(HangupBy::System));
        assert_eq!(s.queue_wait_seconds, Some(25));
    }

    #[test]
    fn ivr_queue_enter_is_secondary_signal() {
        let base = normalize_timestamp(Some("2024-03-01T10:00:00Z"));
        let mut details = HashMap::new();
        details.insert("meta".to_string(), "support".to_string());
        let timeline = vec![CallEvent {
            timestamp: base,
            source: EventSource::Ivr,
            kind: KIND_IVR_QUEUE_ENTER.to_string(),
            details,
        }];
        let mut s = summary();
        infer_summary(&mut s, &timeline, None);
        assert!(s.queue_entered);
        assert_eq!(s.queue_name.as_deref(), Some("support"));
    }

    #[test]
    fn no_signals_leaves_safe_defaults() {
        let mut s = summary();
        infer_summary(&mut s, &[], None);
        assert!(!s.answered);
        assert!(!s.queue_entered);
        assert_eq!(s.hangup_by, None);
        assert!(s.ignored_agents.is_empty());
    }

    #[test]
    fn rule_chain_order_is_stable() {
        let names: Vec<&str> = HANGUP_RULES.iter().map(|rule| rule.name).collect();
        assert_eq!(
            names,
            vec![
                "complete-caller",
                "complete-agent",
                "abandon",
                "exit-with-key",
                "exit-with-timeout",
                "exit-empty",
                "cdr-disposition",
                "default-unknown",
            ]
        );
    }
}

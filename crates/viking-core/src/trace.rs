//! Request-scoped trace collection.
//!
//! A `RequestTrace` is bound to one API call and collects timed events,
//! cumulative counters, and final gauges into a stable `schema_version: "v1"`
//! JSON shape. Disabled collectors are zero-cost: every method early-returns.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};

const TRACE_SCHEMA_VERSION: &str = "v1";

/// Single structured trace event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TraceEvent {
    pub stage: String,
    pub name: String,
    pub ts_ms: f64,
    pub status: String,
    pub attrs: Value,
}

/// Final request trace output.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceResult {
    pub summary: Value,
    pub events: Vec<TraceEvent>,
}

impl TraceResult {
    /// Renders the stable wire shape.
    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": TRACE_SCHEMA_VERSION,
            "summary": self.summary,
            "events": self.events.iter().map(|event| {
                json!({
                    "stage": event.stage,
                    "name": event.name,
                    "ts_ms": round_ms(event.ts_ms),
                    "status": event.status,
                    "attrs": event.attrs,
                })
            }).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Default)]
struct TraceState {
    events: Vec<TraceEvent>,
    counters: BTreeMap<String, f64>,
    gauges: BTreeMap<String, Value>,
    dropped_events: u64,
    error_stage: String,
    error_code: String,
    error_message: String,
}

/// Request-scoped trace collector with a low-overhead disabled mode.
#[derive(Debug)]
pub struct RequestTrace {
    operation: String,
    enabled: bool,
    trace_id: String,
    max_events: usize,
    started: Instant,
    state: Mutex<TraceState>,
}

impl RequestTrace {
    /// Creates an active collector for `operation`.
    pub fn enabled(operation: impl Into<String>, max_events: usize) -> Self {
        Self {
            operation: operation.into(),
            enabled: true,
            trace_id: format!("tr_{}", uuid::Uuid::new_v4().simple()),
            max_events,
            started: Instant::now(),
            state: Mutex::new(TraceState::default()),
        }
    }

    /// Creates a collector whose every method is a no-op.
    pub fn disabled(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            enabled: false,
            trace_id: String::new(),
            max_events: 0,
            started: Instant::now(),
            state: Mutex::new(TraceState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Records a timed event; drops it (and counts the drop) past the cap.
    pub fn event(&self, stage: &str, name: &str, status: &str, attrs: Value) {
        if !self.enabled {
            return;
        }
        let ts_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        let mut state = self.state.lock().expect("trace state lock");
        if state.events.len() >= self.max_events {
            state.dropped_events += 1;
            return;
        }
        state.events.push(TraceEvent {
            stage: stage.to_string(),
            name: name.to_string(),
            ts_ms,
            status: status.to_string(),
            attrs,
        });
    }

    /// Adds `delta` to a cumulative counter.
    pub fn count(&self, key: &str, delta: f64) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().expect("trace state lock");
        *state.counters.entry(key.to_string()).or_insert(0.0) += delta;
    }

    /// Sets a final-snapshot gauge.
    pub fn gauge(&self, key: &str, value: Value) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().expect("trace state lock");
        state.gauges.insert(key.to_string(), value);
    }

    /// Accumulates provider token usage.
    pub fn add_token_usage(&self, input_tokens: u64, output_tokens: u64) {
        if !self.enabled {
            return;
        }
        self.count("token.input_tokens", input_tokens as f64);
        self.count("token.output_tokens", output_tokens as f64);
        self.count("token.total_tokens", (input_tokens + output_tokens) as f64);
    }

    /// Records the terminal error block shown in the summary.
    pub fn set_error(&self, stage: &str, code: &str, message: &str) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().expect("trace state lock");
        state.error_stage = stage.to_string();
        state.error_code = code.to_string();
        state.error_message = message.to_string();
    }

    /// Finalises the collector. Returns `None` when disabled.
    pub fn finish(&self, status: &str) -> Option<TraceResult> {
        if !self.enabled {
            return None;
        }
        let duration_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        let state = self.state.lock().expect("trace state lock");
        let summary = build_summary(
            &self.trace_id,
            &self.operation,
            status,
            duration_ms,
            &state,
        );
        Some(TraceResult {
            summary,
            events: state.events.clone(),
        })
    }
}

fn counter_i64(state: &TraceState, key: &str) -> i64 {
    state.counters.get(key).copied().unwrap_or(0.0) as i64
}

fn gauge_or_counter(state: &TraceState, key: &str) -> Value {
    if let Some(value) = state.gauges.get(key) {
        return value.clone();
    }
    match state.counters.get(key) {
        Some(value) => json!(*value as i64),
        None => Value::Null,
    }
}

fn build_summary(
    trace_id: &str,
    operation: &str,
    status: &str,
    duration_ms: f64,
    state: &TraceState,
) -> Value {
    json!({
        "trace_id": trace_id,
        "operation": operation,
        "status": status,
        "total_duration_ms": round_ms(duration_ms),
        "token_usage": {
            "input_tokens": counter_i64(state, "token.input_tokens"),
            "output_tokens": counter_i64(state, "token.output_tokens"),
            "total_tokens": counter_i64(state, "token.total_tokens"),
        },
        "vector": {
            "search_calls": counter_i64(state, "vector.search_calls"),
            "candidates_scored": counter_i64(state, "vector.candidates_scored"),
            "candidates_after_threshold": counter_i64(state, "vector.candidates_after_threshold"),
            "returned": gauge_or_counter(state, "vector.returned"),
            "vectors_scanned": gauge_or_counter(state, "vector.vectors_scanned"),
        },
        "semantic_nodes": {
            "total_nodes": state.gauges.get("semantic_nodes.total_nodes").cloned().unwrap_or(Value::Null),
            "done_nodes": state.gauges.get("semantic_nodes.done_nodes").cloned().unwrap_or(Value::Null),
            "pending_nodes": state.gauges.get("semantic_nodes.pending_nodes").cloned().unwrap_or(Value::Null),
            "in_progress_nodes": state.gauges.get("semantic_nodes.in_progress_nodes").cloned().unwrap_or(Value::Null),
        },
        "memory": {
            "memories_extracted": state.gauges.get("memory.memories_extracted").cloned().unwrap_or(Value::Null),
        },
        "errors": {
            "error_stage": state.error_stage.clone(),
            "error_code": state.error_code.clone(),
            "message": state.error_message.clone(),
        },
        "events_truncated": state.dropped_events > 0,
        "dropped_events": state.dropped_events,
    })
}

fn round_ms(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RequestTrace;

    #[test]
    fn disabled_collector_produces_nothing() {
        let trace = RequestTrace::disabled("find");
        trace.event("search", "shortlist", "ok", json!({}));
        trace.count("vector.search_calls", 1.0);
        trace.add_token_usage(10, 5);
        assert!(trace.finish("ok").is_none());
        assert!(trace.trace_id().is_empty());
    }

    #[test]
    fn summary_carries_counters_and_error_block() {
        let trace = RequestTrace::enabled("find", 16);
        trace.count("vector.search_calls", 2.0);
        trace.count("vector.candidates_scored", 12.0);
        trace.gauge("vector.returned", json!(3));
        trace.add_token_usage(100, 40);
        trace.set_error("route", "DEPENDENCY_ERROR", "backend down");

        let result = trace.finish("error").expect("enabled trace");
        let value = result.to_value();
        assert_eq!(value["schema_version"], "v1");
        let summary = &value["summary"];
        assert_eq!(summary["operation"], "find");
        assert_eq!(summary["status"], "error");
        assert_eq!(summary["vector"]["search_calls"], 2);
        assert_eq!(summary["vector"]["candidates_scored"], 12);
        assert_eq!(summary["vector"]["returned"], 3);
        assert_eq!(summary["token_usage"]["total_tokens"], 140);
        assert_eq!(summary["errors"]["error_code"], "DEPENDENCY_ERROR");
        // Gauges never set are explicit nulls, not omissions.
        assert!(summary["semantic_nodes"]["total_nodes"].is_null());
        assert!(summary["memory"]["memories_extracted"].is_null());
    }

    #[test]
    fn event_cap_records_drops() {
        let trace = RequestTrace::enabled("ingest", 2);
        for index in 0..5 {
            trace.event("parse", &format!("section-{index}"), "ok", json!({}));
        }
        let result = trace.finish("ok").expect("enabled trace");
        assert_eq!(result.events.len(), 2);
        let summary = result.summary;
        assert_eq!(summary["events_truncated"], true);
        assert_eq!(summary["dropped_events"], 3);
    }

    #[test]
    fn trace_ids_use_stable_prefix() {
        let trace = RequestTrace::enabled("commit", 8);
        assert!(trace.trace_id().starts_with("tr_"));
    }
}

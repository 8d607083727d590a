//! Text renderings of trace data for the model.

use std::collections::HashMap;
use std::fmt::Write;

use crate::trace::{Bounds, EventKind, Insight, TraceEvent, TraceModel};

/// Maximum number of entries listed in track summaries.
pub const SUMMARY_LIMIT: usize = 10;

pub const CALL_TREE_FORMAT: &str = "\
Call trees are given as one node per line, indented by two spaces per level:
`<eventKey> <name> (<url>:<line>:<column>) total=<ms> self=<ms>`.
`total` is the node's whole duration, `self` the part not spent in children.
Refer to nodes by their event key.";

pub const NETWORK_REQUEST_FORMAT: &str = "\
Network requests are described with their event key (`r-<n>`), URL, method, \
status, MIME type, transfer size, priority, whether they block rendering, and \
start time and duration relative to the start of the trace.";

/// Microseconds as milliseconds with one decimal.
pub fn fmt_ms(us: u64) -> String {
    format!("{:.1}ms", us as f64 / 1000.0)
}

pub fn fmt_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} kB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

pub fn trace_summary(model: &TraceModel) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Trace of {}", model.url);
    let _ = writeln!(out, "Duration: {}", fmt_ms(model.bounds.duration()));
    let _ = writeln!(
        out,
        "Trace bounds: {{min: {}, max: {}}}",
        model.bounds.min, model.bounds.max
    );
    let _ = writeln!(
        out,
        "Main-thread tasks: {}",
        model
            .events
            .iter()
            .filter(|e| e.is_main_thread_work() && e.parent.is_none())
            .count()
    );
    let _ = writeln!(out, "Network requests: {}", model.network_requests().count());
    if !model.insights.is_empty() {
        let _ = writeln!(out, "Insights:");
        for insight in &model.insights {
            let _ = writeln!(out, "- {} ({})", insight.title, insight.id);
        }
    }
    out
}

/// Detail block for a network request. `None` for other events.
pub fn network_request(model: &TraceModel, event: &TraceEvent) -> Option<String> {
    let EventKind::NetworkRequest {
        url,
        method,
        status,
        mime_type,
        transfer_size,
        priority,
        render_blocking,
    } = &event.kind
    else {
        return None;
    };

    let mut out = String::new();
    let _ = writeln!(out, "Network request {}", event.key);
    let _ = writeln!(out, "URL: {url}");
    let _ = writeln!(out, "Method: {method}");
    let _ = writeln!(out, "Status: {status}");
    if !mime_type.is_empty() {
        let _ = writeln!(out, "MIME type: {mime_type}");
    }
    let _ = writeln!(out, "Transfer size: {}", fmt_bytes(*transfer_size));
    if !priority.is_empty() {
        let _ = writeln!(out, "Priority: {priority}");
    }
    let _ = writeln!(out, "Render blocking: {}", if *render_blocking { "yes" } else { "no" });
    let _ = writeln!(
        out,
        "Start: {} after trace start",
        fmt_ms(event.ts.saturating_sub(model.bounds.min))
    );
    let _ = writeln!(out, "Duration: {}", fmt_ms(event.dur));
    Some(out)
}

/// Any event, for `getEventByKey`.
pub fn event_details(model: &TraceModel, event: &TraceEvent) -> String {
    if let Some(text) = network_request(model, event) {
        return text;
    }
    let mut out = String::new();
    let _ = writeln!(out, "Event {}: {}", event.key, event.name);
    let _ = writeln!(
        out,
        "Start: {} after trace start",
        fmt_ms(event.ts.saturating_sub(model.bounds.min))
    );
    let _ = writeln!(out, "Duration: {}", fmt_ms(event.dur));
    if let Some(location) = event.location() {
        let _ = writeln!(out, "Location: {location}");
    }
    if let Some(parent) = &event.parent {
        let _ = writeln!(out, "Parent: {parent}");
    }
    let children: Vec<&str> = model.children(&event.key).map(|c| c.key.as_str()).collect();
    if !children.is_empty() {
        let _ = writeln!(out, "Children: {}", children.join(", "));
    }
    out
}

/// Bottom-up view of main-thread activity: self time grouped by name.
pub fn main_thread_summary(model: &TraceModel, bounds: &Bounds) -> String {
    let events: Vec<&TraceEvent> = model.main_thread_events_in(bounds).collect();
    if events.is_empty() {
        return format!(
            "No main-thread activity between {} and {}.",
            bounds.min, bounds.max
        );
    }

    let mut self_by_name: HashMap<String, (u64, usize, Option<String>)> = HashMap::new();
    for event in &events {
        let covered: u64 = model
            .children(&event.key)
            .filter(|c| c.is_main_thread_work())
            .map(|c| c.dur)
            .sum();
        let entry = self_by_name
            .entry(event.name.clone())
            .or_insert_with(|| (0, 0, event.location()));
        entry.0 += event.dur.saturating_sub(covered);
        entry.1 += 1;
    }

    let mut rows: Vec<_> = self_by_name.into_iter().collect();
    rows.sort_by(|a, b| b.1.0.cmp(&a.1.0).then_with(|| a.0.cmp(&b.0)));

    let total: u64 = events.iter().filter(|e| e.parent.is_none()).map(|e| e.dur).sum();
    let mut out = String::new();
    let _ = writeln!(out, "Main thread between {} and {}", bounds.min, bounds.max);
    let _ = writeln!(out, "Top-level task time: {}", fmt_ms(total));
    let _ = writeln!(out, "Bottom-up (by self time):");
    for (name, (self_time, count, location)) in rows.into_iter().take(SUMMARY_LIMIT) {
        let _ = write!(out, "- {name}: self={} calls={count}", fmt_ms(self_time));
        if let Some(location) = location {
            let _ = write!(out, " ({location})");
        }
        out.push('\n');
    }
    out
}

pub fn network_summary(model: &TraceModel, bounds: &Bounds) -> String {
    let mut requests: Vec<&TraceEvent> = model.network_requests_in(bounds).collect();
    if requests.is_empty() {
        return format!("No network requests between {} and {}.", bounds.min, bounds.max);
    }
    requests.sort_by_key(|e| e.ts);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Network requests between {} and {} ({} total)",
        bounds.min,
        bounds.max,
        requests.len()
    );
    for event in requests.iter().take(SUMMARY_LIMIT) {
        if let EventKind::NetworkRequest {
            url,
            status,
            transfer_size,
            render_blocking,
            ..
        } = &event.kind
        {
            let _ = write!(
                out,
                "- {} {url} status={status} size={} start={} duration={}",
                event.key,
                fmt_bytes(*transfer_size),
                fmt_ms(event.ts.saturating_sub(model.bounds.min)),
                fmt_ms(event.dur)
            );
            if *render_blocking {
                out.push_str(" render-blocking");
            }
            out.push('\n');
        }
    }
    if requests.len() > SUMMARY_LIMIT {
        let _ = writeln!(
            out,
            "... {} more; narrow the bounds to see them",
            requests.len() - SUMMARY_LIMIT
        );
    }
    out
}

pub fn insight_details(model: &TraceModel, insight: &Insight) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Insight: {} ({})", insight.title, insight.id);
    if !insight.summary.is_empty() {
        let _ = writeln!(out, "{}", insight.summary);
    }
    if let Some(bounds) = &insight.bounds {
        let _ = writeln!(out, "Bounds: {{min: {}, max: {}}}", bounds.min, bounds.max);
    }
    if !insight.related_events.is_empty() {
        let _ = writeln!(out, "Related events:");
        for key in &insight.related_events {
            match model.event(key) {
                Some(event) => {
                    let _ = writeln!(out, "- {key}: {} ({})", describe(event), fmt_ms(event.dur));
                }
                None => {
                    let _ = writeln!(out, "- {key}");
                }
            }
        }
    }
    out
}

fn describe(event: &TraceEvent) -> &str {
    match &event.kind {
        EventKind::NetworkRequest { url, .. } => url.as_str(),
        EventKind::Function { function_name, .. } => function_name.as_str(),
        _ => event.name.as_str(),
    }
}

//! Server-rendered dashboard page.
//!
//! One static HTML page listing work units and the attention queue, with
//! plain form posts for answers and conflict resolution. Live updates come
//! over the `/ws` endpoint; this page is the no-JS fallback view.

use ve_core::WorkUnit;

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the dashboard from current state.
pub fn render(work_units: &[WorkUnit], attention: &[(WorkUnit, i64)]) -> String {
    let mut rows = String::new();
    for unit in work_units {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&unit.chunk),
            unit.phase.as_str(),
            unit.status.as_str(),
            escape(&unit.blocked_by.join(", ")),
            unit.priority,
        ));
    }

    let mut attention_rows = String::new();
    for (unit, blocking) in attention {
        attention_rows.push_str(&format!(
            "<tr><td>{chunk}</td><td>{blocking}</td><td>{reason}</td>\
             <td><form method=\"post\" action=\"/work-units/{chunk}/answer\">\
             <input name=\"answer\" placeholder=\"answer\">\
             <button type=\"submit\">Send</button></form></td></tr>\n",
            chunk = escape(&unit.chunk),
            blocking = blocking,
            reason = escape(unit.attention_reason.as_deref().unwrap_or("")),
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>ve orchestrator</title>
<style>
body {{ font-family: monospace; margin: 2rem; }}
table {{ border-collapse: collapse; margin-bottom: 2rem; }}
td, th {{ border: 1px solid #999; padding: 0.3rem 0.6rem; text-align: left; }}
</style></head>
<body>
<h1>ve orchestrator</h1>
<h2>Work units</h2>
<table>
<tr><th>chunk</th><th>phase</th><th>status</th><th>blocked by</th><th>priority</th></tr>
{rows}</table>
<h2>Attention queue</h2>
<table>
<tr><th>chunk</th><th>blocking</th><th>reason</th><th>answer</th></tr>
{attention_rows}</table>
</body>
</html>
"#
    )
}

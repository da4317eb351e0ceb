//! Structured audit event lines.
//!
//! Events render as `event=… key=value …` on a single line, under a
//! reserved logger target, so downstream tooling can filter on the
//! target alone and split fields on whitespace.

/// Logger target reserved for audit events.
pub const AUDIT_TARGET: &str = "pixiv_backup::audit";

/// Collapse a value to a single whitespace-free-ish token: newlines and
/// runs of whitespace become single spaces, empty values become `-`.
pub fn normalize(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "-".to_string()
    } else {
        collapsed
    }
}

/// Render one audit event line.
pub fn event_line(event: &str, fields: &[(&str, String)]) -> String {
    let mut parts = Vec::with_capacity(fields.len() + 1);
    parts.push(format!("event={}", normalize(event)));
    for (key, value) in fields {
        parts.push(format!("{}={}", normalize(key), normalize(value)));
    }
    parts.join(" ")
}

/// Log an audit event under the reserved target.
#[macro_export]
macro_rules! audit_event {
    ($event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(
            target: $crate::audit::AUDIT_TARGET,
            "{}",
            $crate::audit::event_line($event, &[$((stringify!($key), $value.to_string())),*])
        );
    };
}

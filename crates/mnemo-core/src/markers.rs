//! Stream markers
//!
//! Text directives embedded in model output, stripped before display:
//!
//! - `@@ref('id1,id2')@@` queue page loads
//! - `@@ref('?query')@@` explicit semantic search
//! - `@@unref('id')@@` queue a page release
//! - `@@importance('0.0-1.0')@@` annotate the next message
//! - `@@thinking('0.0-1.0')@@` scale compaction aggressiveness
//! - `@@important@@` / `@@ephemeral@@` line-level preserve/drop tags
//! - `@@reboot@@` host-level advisory
//!
//! Parsing is plain string scanning; malformed directives are skipped, not
//! surfaced as errors.

/// Line-level tag marking content the summarizer must preserve verbatim.
pub const IMPORTANT_TAG: &str = "@@important@@";

/// Line-level tag marking content the summarizer must drop.
pub const EPHEMERAL_TAG: &str = "@@ephemeral@@";

/// A parsed stream marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// Page ids to load.
    Ref(Vec<String>),
    /// Explicit semantic search (`@@ref('?…')@@`).
    Query(String),
    /// Page ids to release.
    Unref(Vec<String>),
    /// Importance for the next message, in [0, 1].
    Importance(f32),
    /// Thinking budget in [0, 1].
    Thinking(f32),
    /// Host-level reboot advisory.
    Reboot,
}

/// Parse every marker in `text`, in order of appearance.
pub fn parse_markers(text: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    for (name, arg) in scan_directives(text) {
        match name {
            "ref" => {
                if let Some(query) = arg.strip_prefix('?') {
                    let query = query.trim();
                    if !query.is_empty() {
                        markers.push(Marker::Query(query.to_string()));
                    }
                } else {
                    let ids = split_ids(arg);
                    if !ids.is_empty() {
                        markers.push(Marker::Ref(ids));
                    }
                }
            }
            "unref" => {
                let ids = split_ids(arg);
                if !ids.is_empty() {
                    markers.push(Marker::Unref(ids));
                }
            }
            "importance" => {
                if let Ok(v) = arg.trim().parse::<f32>() {
                    markers.push(Marker::Importance(v.clamp(0.0, 1.0)));
                }
            }
            "thinking" => {
                if let Ok(v) = arg.trim().parse::<f32>() {
                    markers.push(Marker::Thinking(v.clamp(0.0, 1.0)));
                }
            }
            _ => {}
        }
    }
    if text.contains("@@reboot@@") {
        markers.push(Marker::Reboot);
    }
    markers
}

/// Collect page ids from `@@ref('…')@@` directives, skipping `?query` forms.
///
/// Refs emitted inside generated summaries are harvested once by the caller;
/// this function never recurses into loaded content.
pub fn harvest_refs(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for (name, arg) in scan_directives(text) {
        if name == "ref" && !arg.starts_with('?') {
            for id in split_ids(arg) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
    }
    ids
}

/// Remove every marker directive and bare tag from `text` for display.
pub fn strip_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("@@") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        // A directive ends at the next "@@"; anything without a terminator
        // is kept literally.
        match after.find("@@") {
            Some(end) if is_known_directive(&after[..end]) => {
                rest = &after[end + 2..];
            }
            _ => {
                out.push_str("@@");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Drop every line carrying the `@@ephemeral@@` tag.
pub fn strip_ephemeral_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.contains(EPHEMERAL_TAG))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collect lines carrying the `@@important@@` tag, with the tag removed.
pub fn important_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.contains(IMPORTANT_TAG))
        .map(|line| line.replace(IMPORTANT_TAG, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Render the load directive for a page id.
pub fn ref_marker(id: &str) -> String {
    format!("@@ref('{}')@@", id)
}

/// Render the release directive for a page id.
pub fn unref_marker(id: &str) -> String {
    format!("@@unref('{}')@@", id)
}

/// Scan `text` for `@@name('arg')@@` directives.
fn scan_directives(text: &str) -> Vec<(&str, &str)> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("@@") {
        let after = &rest[start + 2..];
        if let Some(open) = after.find("('") {
            let name = &after[..open];
            if name.chars().all(|c| c.is_ascii_alphabetic()) && !name.is_empty() {
                let body = &after[open + 2..];
                if let Some(close) = body.find("')@@") {
                    found.push((name, &body[..close]));
                    rest = &body[close + 4..];
                    continue;
                }
            }
        }
        rest = after;
    }
    found
}

fn split_ids(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_known_directive(body: &str) -> bool {
    const BARE: [&str; 3] = ["important", "ephemeral", "reboot"];
    if BARE.contains(&body) {
        return true;
    }
    const WITH_ARG: [&str; 4] = ["ref", "unref", "importance", "thinking"];
    WITH_ARG
        .iter()
        .any(|name| body.starts_with(name) && body[name.len()..].starts_with("('") && body.ends_with("')"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref_ids() {
        let markers = parse_markers("load these @@ref('pg_a, pg_b')@@ now");
        assert_eq!(
            markers,
            vec![Marker::Ref(vec!["pg_a".to_string(), "pg_b".to_string()])]
        );
    }

    #[test]
    fn test_parse_query() {
        let markers = parse_markers("@@ref('?what did we decide about auth')@@");
        assert_eq!(
            markers,
            vec![Marker::Query("what did we decide about auth".to_string())]
        );
    }

    #[test]
    fn test_parse_scalars_clamped() {
        let markers = parse_markers("@@importance('1.7')@@ @@thinking('0.25')@@");
        assert_eq!(
            markers,
            vec![Marker::Importance(1.0), Marker::Thinking(0.25)]
        );
    }

    #[test]
    fn test_parse_reboot_and_malformed() {
        let markers = parse_markers("@@importance('abc')@@ @@reboot@@");
        assert_eq!(markers, vec![Marker::Reboot]);
    }

    #[test]
    fn test_harvest_skips_queries_and_dedups() {
        let ids = harvest_refs("@@ref('pg_a')@@ @@ref('?find')@@ @@ref('pg_a,pg_b')@@");
        assert_eq!(ids, vec!["pg_a".to_string(), "pg_b".to_string()]);
    }

    #[test]
    fn test_strip_markers() {
        let text = "keep this @@ref('pg_a')@@and this @@important@@ line";
        assert_eq!(strip_markers(text), "keep this and this  line");
        // Unterminated or unknown directives are preserved.
        assert_eq!(strip_markers("a @@ b"), "a @@ b");
        assert_eq!(strip_markers("email@@example@@com"), "email@@example@@com");
    }

    #[test]
    fn test_line_tags() {
        let text = "STATUS ok\nsecret scratch @@ephemeral@@\nfinal answer @@important@@";
        assert_eq!(
            strip_ephemeral_lines(text),
            "STATUS ok\nfinal answer @@important@@"
        );
        assert_eq!(important_lines(text), vec!["final answer".to_string()]);
    }

    #[test]
    fn test_marker_rendering_round_trips() {
        let rendered = ref_marker("pg_123abc");
        assert_eq!(harvest_refs(&rendered), vec!["pg_123abc".to_string()]);
        assert_eq!(
            parse_markers(&unref_marker("pg_x")),
            vec![Marker::Unref(vec!["pg_x".to_string()])]
        );
    }
}

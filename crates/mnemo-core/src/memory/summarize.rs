//! Page summarization (synchronous path)
//!
//! Builds the summarizer prompt from a page's raw content, calls the
//! driver, and guarantees the result carries the page's ref marker. Driver
//! failures degrade to a fallback summary; the surrounding system retries
//! at its own layer.

use tracing::warn;

use crate::driver::{ChatDriver, SUMMARIZER_INSTRUCTION};
use crate::markers::{important_lines, ref_marker, strip_ephemeral_lines};

use super::message::MessageRole;

/// Cap on transcript characters handed to the summarizer in one request.
pub const MAX_TRANSCRIPT_CHARS: usize = 24_000;

/// Placeholder summary written while a page waits in the batch queue.
pub fn pending_summary(message_count: usize, label: &str, page_id: &str) -> String {
    format!(
        "[Pending summary: {} messages, {}] {}",
        message_count,
        label,
        ref_marker(page_id)
    )
}

/// Fallback summary used when the driver fails.
pub fn fallback_summary(message_count: usize, label: &str, page_id: &str) -> String {
    format!(
        "[Summary of {} messages: {}] {}",
        message_count,
        label,
        ref_marker(page_id)
    )
}

/// Cap a transcript at [`MAX_TRANSCRIPT_CHARS`], respecting UTF-8
/// boundaries.
pub fn cap_transcript(transcript: &str) -> String {
    if transcript.len() <= MAX_TRANSCRIPT_CHARS {
        return transcript.to_string();
    }
    let mut end = MAX_TRANSCRIPT_CHARS;
    while !transcript.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...[truncated]", &transcript[..end])
}

/// Build the summarizer user prompt for a page.
pub fn build_summary_prompt(
    page_id: &str,
    label: &str,
    lane: MessageRole,
    raw_content: &str,
) -> String {
    let transcript = cap_transcript(&strip_ephemeral_lines(raw_content));

    let mut prompt = format!(
        "Page id: {}\nLabel: {}\nLane focus: these are {} messages; weight what matters to that lane.\n",
        page_id, label, lane
    );

    let verbatim = important_lines(raw_content);
    if !verbatim.is_empty() {
        prompt.push_str("\nPreserve these lines verbatim:\n");
        for line in &verbatim {
            prompt.push_str("- ");
            prompt.push_str(line);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nTranscript:\n");
    prompt.push_str(&transcript);
    prompt.push_str(&format!(
        "\n\nEnd your summary with: {}",
        ref_marker(page_id)
    ));
    prompt
}

/// Ensure a summary carries the literal ref marker for its page.
pub fn ensure_ref_marker(summary: &str, page_id: &str) -> String {
    let marker = ref_marker(page_id);
    if summary.contains(&marker) {
        summary.to_string()
    } else {
        format!("{} {}", summary.trim_end(), marker)
    }
}

/// Summarize a page's raw content through the driver. Infallible: driver
/// errors produce the fallback summary.
pub async fn summarize_content(
    driver: &dyn ChatDriver,
    page_id: &str,
    label: &str,
    lane: MessageRole,
    raw_content: &str,
    message_count: usize,
) -> String {
    let prompt = build_summary_prompt(page_id, label, lane, raw_content);
    match driver.chat(SUMMARIZER_INSTRUCTION, &prompt).await {
        Ok(text) => ensure_ref_marker(&text, page_id),
        Err(e) => {
            warn!("Summarization failed for {}, using fallback: {}", page_id, e);
            fallback_summary(message_count, label, page_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FailingDriver, FixedDriver};

    #[tokio::test]
    async fn test_summary_gets_ref_marker_appended() {
        let driver = FixedDriver::new("STATUS: done\n- a thing happened");
        let summary = summarize_content(
            &driver,
            "pg_abc",
            "assistant x3",
            MessageRole::Assistant,
            "[assistant]: hi",
            3,
        )
        .await;
        assert!(summary.ends_with("@@ref('pg_abc')@@"));
        assert!(summary.starts_with("STATUS: done"));
    }

    #[tokio::test]
    async fn test_existing_marker_not_duplicated() {
        let driver = FixedDriver::new("STATUS: ok @@ref('pg_abc')@@");
        let summary = summarize_content(
            &driver,
            "pg_abc",
            "l",
            MessageRole::User,
            "[user]: hi",
            1,
        )
        .await;
        assert_eq!(summary.matches("@@ref('pg_abc')@@").count(), 1);
    }

    #[tokio::test]
    async fn test_driver_failure_falls_back() {
        let summary = summarize_content(
            &FailingDriver,
            "pg_x",
            "tool x4",
            MessageRole::Tool,
            "[tool]: output",
            4,
        )
        .await;
        assert_eq!(summary, "[Summary of 4 messages: tool x4] @@ref('pg_x')@@");
    }

    #[test]
    fn test_prompt_strips_ephemeral_and_lists_important() {
        let raw = "[assistant]: keep me @@important@@\n[assistant]: scratch @@ephemeral@@\n[assistant]: normal";
        let prompt =
            build_summary_prompt("pg_1", "label", MessageRole::Assistant, raw);
        assert!(!prompt.contains("scratch"));
        assert!(prompt.contains("Preserve these lines verbatim:\n- [assistant]: keep me"));
        assert!(prompt.contains("normal"));
    }

    #[test]
    fn test_cap_transcript() {
        let long = "é".repeat(MAX_TRANSCRIPT_CHARS); // 2 bytes each
        let capped = cap_transcript(&long);
        assert!(capped.len() <= MAX_TRANSCRIPT_CHARS + 20);
        assert!(capped.ends_with("...[truncated]"));
    }
}

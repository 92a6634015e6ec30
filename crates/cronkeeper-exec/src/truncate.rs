//! Output truncation helpers.
//!
//! Scheduled commands can print without bound, and every attempt's output is
//! kept in the execution history. Middle-omission keeps both the beginning
//! (what the command started doing) and the end (the final result or error).

/// Default maximum characters kept per stream (10 000).
pub const DEFAULT_MAX_CHARS: usize = 10_000;

/// Truncate `output` to at most `max_chars` characters using middle-omission.
///
/// If `output` fits within `max_chars` it is returned unchanged. Otherwise the
/// result is:
///
/// ```text
/// <first max_chars/2 chars>
///
/// ... [OUTPUT TRUNCATED: N chars omitted] ...
///
/// <last max_chars/2 chars>
/// ```
///
/// The split is done on character boundaries, never inside a multi-byte
/// sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_owned();
    }

    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{tail}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// Closes up a partial response left behind by an interrupted stream

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const CODE_FENCE: &str = "```";
pub const CANCELLED_MARKER: &str = "_CANCELLED_";

/// Repairs a partial response so it renders sanely once committed.
///
/// A lone reasoning marker gets a closing `</think>`, an unbalanced code
/// fence gets a closing fence (otherwise a `---` separator is added), and
/// the text always ends with the cancellation marker on its own line.
pub fn repair_truncated(partial: &str) -> String {
    let mut repaired = String::with_capacity(partial.len() + 32);
    repaired.push_str(partial);

    let think_markers = partial.matches(THINK_OPEN).count() + partial.matches(THINK_CLOSE).count();
    if think_markers == 1 {
        repaired.push('\n');
        repaired.push_str(THINK_CLOSE);
        repaired.push('\n');
    }

    if partial.matches(CODE_FENCE).count() % 2 == 1 {
        repaired.push('\n');
        repaired.push_str(CODE_FENCE);
        repaired.push('\n');
    } else {
        repaired.push_str("\n\n---\n");
    }

    repaired.push('\n');
    repaired.push_str(CANCELLED_MARKER);
    repaired
}

//! Parsing of raw policy responses.
//!
//! Policies are asked to wrap their reasoning in
//! `<|think_start|>...<|think_end|>` and the action in
//! `<|action_start|>...<|action_end|>`. Parsing never fails: a missing or
//! malformed block substitutes placeholder text and clears the format flag,
//! so malformed output scores zero instead of aborting the step.

/// Opens the reasoning block.
pub const THINK_START: &str = "<|think_start|>";
/// Closes the reasoning block.
pub const THINK_END: &str = "<|think_end|>";
/// Opens the action block.
pub const ACTION_START: &str = "<|action_start|>";
/// Closes the action block.
pub const ACTION_END: &str = "<|action_end|>";

/// Recorded as the thinking text when no think block is present.
pub const NO_THINK_FALLBACK: &str = "[No think block found]";
/// Recorded as the action text when no usable action block is present.
pub const NO_ACTION_FALLBACK: &str = "[No action block found]";

/// Kitchen action id substituted when the action block is unusable.
const KITCHEN_FALLBACK_ACTION: u32 = 1;

/// The structured fields every parsed response carries.
///
/// `thinking` and `action` are always populated (with fallbacks when the
/// corresponding block is absent) and feed the interaction history verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Trimmed text of the think block, or [`NO_THINK_FALLBACK`].
    pub thinking: String,
    /// Canonical rendering of the action block, or [`NO_ACTION_FALLBACK`].
    pub action: String,
    /// Whether both blocks were present and well formed.
    pub format_correct: bool,
}

/// Parse a kitchen response. The action block must hold `[id, name]` with a
/// bare integer id; the id is returned alongside the shared fields.
pub fn parse_kitchen_response(raw: &str) -> (u32, ParsedResponse) {
    let (thinking, think_ok) = extract_thinking(raw);

    let mut action_index = KITCHEN_FALLBACK_ACTION;
    let mut action = NO_ACTION_FALLBACK.to_string();
    let mut action_ok = false;

    if let Some(inner) = between(raw, ACTION_START, ACTION_END)
        .and_then(|block| block.strip_prefix('['))
        .and_then(|block| block.strip_suffix(']'))
    {
        // The id must sit directly after the bracket; the name may carry
        // whatever punctuation the inventory uses.
        if let Some((id_part, detail)) = inner.split_once(',') {
            if let Ok(id) = id_part.parse::<u32>() {
                action_index = id;
                action = format!("[{id}, {}]", detail.trim());
                action_ok = true;
            }
        }
    }

    let parsed = ParsedResponse {
        thinking,
        action,
        format_correct: think_ok && action_ok,
    };
    (action_index, parsed)
}

/// Parse a tabletop response. The action block must hold a single-line
/// bracketed list of integers (the 7-DoF gripper pose); malformed blocks
/// yield an empty pose.
pub fn parse_tabletop_response(raw: &str) -> (Vec<i64>, ParsedResponse) {
    let (thinking, think_ok) = extract_thinking(raw);

    let mut pose = Vec::new();
    let mut action = NO_ACTION_FALLBACK.to_string();
    let mut action_ok = false;

    if let Some(inner) = between(raw, ACTION_START, ACTION_END)
        .and_then(|block| block.strip_prefix('['))
        .and_then(|block| block.strip_suffix(']'))
    {
        // The pose must fit on one line.
        if !inner.contains('\n') {
            if let Some(values) = parse_int_list(inner) {
                action = render_pose(&values);
                pose = values;
                action_ok = true;
            }
        }
    }

    let parsed = ParsedResponse {
        thinking,
        action,
        format_correct: think_ok && action_ok,
    };
    (pose, parsed)
}

/// Canonical text form of a pose, e.g. `[50, 50, 30, 0, 60, 0, 1]`.
pub fn render_pose(pose: &[i64]) -> String {
    let parts: Vec<String> = pose.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn extract_thinking(raw: &str) -> (String, bool) {
    match between(raw, THINK_START, THINK_END) {
        Some(text) => (text.trim().to_string(), true),
        None => (NO_THINK_FALLBACK.to_string(), false),
    }
}

/// The substring strictly between the first `start`..`end` delimiter pair.
fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let to = text[from..].find(end)? + from;
    Some(&text[from..to])
}

fn parse_int_list(inner: &str) -> Option<Vec<i64>> {
    inner
        .split(',')
        .map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(think: &str, action: &str) -> String {
        format!("{THINK_START}{think}{THINK_END}{ACTION_START}{action}{ACTION_END}")
    }

    #[test]
    fn test_parse_kitchen_well_formed() {
        let raw = wrap("I should grab the mug first.", "[5, pick up the Mug]");
        let (index, parsed) = parse_kitchen_response(&raw);
        assert_eq!(index, 5);
        assert_eq!(parsed.action, "[5, pick up the Mug]");
        assert_eq!(parsed.thinking, "I should grab the mug first.");
        assert!(parsed.format_correct);
    }

    #[test]
    fn test_parse_kitchen_normalizes_detail_spacing() {
        let raw = wrap("ok", "[3,   find a Fridge  ]");
        let (index, parsed) = parse_kitchen_response(&raw);
        assert_eq!(index, 3);
        assert_eq!(parsed.action, "[3, find a Fridge]");
        assert!(parsed.format_correct);
    }

    #[test]
    fn test_parse_kitchen_missing_action_block() {
        let raw = format!("{THINK_START}thinking hard{THINK_END} and nothing else");
        let (index, parsed) = parse_kitchen_response(&raw);
        assert_eq!(index, 1);
        assert_eq!(parsed.action, NO_ACTION_FALLBACK);
        assert_eq!(parsed.thinking, "thinking hard");
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_parse_kitchen_missing_think_block() {
        let raw = format!("{ACTION_START}[2, open the Fridge]{ACTION_END}");
        let (index, parsed) = parse_kitchen_response(&raw);
        assert_eq!(index, 2);
        assert_eq!(parsed.thinking, NO_THINK_FALLBACK);
        // The action block alone is not enough for the format bonus.
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_parse_kitchen_non_numeric_id_falls_back() {
        let raw = wrap("hm", "[two, open the Fridge]");
        let (index, parsed) = parse_kitchen_response(&raw);
        assert_eq!(index, 1);
        assert_eq!(parsed.action, NO_ACTION_FALLBACK);
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_parse_kitchen_empty_input() {
        let (index, parsed) = parse_kitchen_response("");
        assert_eq!(index, 1);
        assert_eq!(parsed.thinking, NO_THINK_FALLBACK);
        assert_eq!(parsed.action, NO_ACTION_FALLBACK);
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_parse_kitchen_ignores_surrounding_text() {
        let raw = format!(
            "Sure, here is my move.\n{}\nTrailing commentary.",
            wrap("check the counter", "[0, find a CounterTop]")
        );
        let (index, parsed) = parse_kitchen_response(&raw);
        assert_eq!(index, 0);
        assert!(parsed.format_correct);
    }

    #[test]
    fn test_parse_tabletop_well_formed() {
        let raw = wrap("move above the block", "[10, 20, 30, 0, 60, 0, 1]");
        let (pose, parsed) = parse_tabletop_response(&raw);
        assert_eq!(pose, vec![10, 20, 30, 0, 60, 0, 1]);
        assert_eq!(parsed.action, "[10, 20, 30, 0, 60, 0, 1]");
        assert!(parsed.format_correct);
    }

    #[test]
    fn test_parse_tabletop_non_integer_entry() {
        let raw = wrap("hm", "[10, twenty, 30, 0, 60, 0, 1]");
        let (pose, parsed) = parse_tabletop_response(&raw);
        assert!(pose.is_empty());
        assert_eq!(parsed.action, NO_ACTION_FALLBACK);
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_parse_tabletop_multiline_action_rejected() {
        let raw = wrap("hm", "[10, 20,\n30, 0, 60, 0, 1]");
        let (pose, parsed) = parse_tabletop_response(&raw);
        assert!(pose.is_empty());
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_parse_tabletop_empty_input() {
        let (pose, parsed) = parse_tabletop_response("");
        assert!(pose.is_empty());
        assert_eq!(parsed.thinking, NO_THINK_FALLBACK);
        assert!(!parsed.format_correct);
    }

    #[test]
    fn test_render_pose() {
        assert_eq!(render_pose(&[1, 2, 3]), "[1, 2, 3]");
        assert_eq!(render_pose(&[]), "[]");
    }
}

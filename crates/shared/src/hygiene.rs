//! Name and address clean-up applied before rows are written

/// First whitespace-separated token, capitalized (`"  mARY ann"` -> `"Mary"`)
pub fn format_name(raw: &str) -> String {
    let Some(first) = raw.split_whitespace().next() else {
        return String::new();
    };

    let lower = first.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(head) => head.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Trimmed title case: every letter after a non-word character is upper-cased
pub fn format_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut boundary = true;

    for ch in raw.trim().to_lowercase().chars() {
        if boundary {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        boundary = !(ch.is_alphanumeric() || ch == '_');
    }

    out
}

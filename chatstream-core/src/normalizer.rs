use unicode_normalization::UnicodeNormalization;

/// Clean an outgoing chat message. Returns `None` when nothing is left to send.
pub fn normalize_message(s: &str) -> Option<String> {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    let t = t.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Identifiers (agent, workspace, conversation) are sent verbatim but must not be blank.
pub fn clean_id(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

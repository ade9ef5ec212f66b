/// Cheap pre-filter applied to every channel message before any parser runs.
///
/// A message is worth parsing only when it mentions an entry, a stop and a
/// target, and is long enough to be a real signal rather than chatter.
pub fn looks_like_signal(text: &str) -> bool {
    if text.len() < 20 {
        return false;
    }
    let lower = text.to_lowercase();
    lower.contains("entry")
        && (lower.contains("stop") || lower.contains("sl"))
        && (lower.contains("target") || lower.contains("tp"))
}

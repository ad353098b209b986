//! Output filename sanitization (spec §4.3).

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_LEN: usize = 200;

pub fn sanitize_title(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !FORBIDDEN.contains(c)).collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim();
    let truncated: String = trimmed.chars().take(MAX_LEN).collect();
    if truncated.is_empty() {
        "download".to_string()
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_forbidden_characters_and_collapses_whitespace() {
        assert_eq!(sanitize_title("My:  Video / Title?"), "My Video Title");
    }

    #[test]
    fn truncates_to_max_len() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_title(&long).chars().count(), MAX_LEN);
    }

    #[test]
    fn falls_back_when_everything_is_stripped() {
        assert_eq!(sanitize_title("///???"), "download");
    }
}

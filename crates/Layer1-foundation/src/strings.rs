//! String helpers shared across layers
//!
//! Proxmox accepts container tags matching `[a-z0-9_][a-z0-9_+.-]*`, joined
//! with `;`. Anything user-supplied (template names, usernames) goes through
//! [`sanitize_tag`] before it reaches the API.

/// Longest tag we emit
pub const MAX_TAG_LEN: usize = 50;

/// Tag separator in the `tags` container option
pub const TAG_SEPARATOR: char = ';';

fn is_tag_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '0'..='9' | '_' | '+' | '.' | '-')
}

/// Normalize an arbitrary string into a valid tag
///
/// Lowercases, maps every other character to `-`, collapses `-` runs, drops
/// leading `+.-`, caps the length, and drops trailing `-`. Total and
/// idempotent; returns an empty string when nothing usable is left.
pub fn sanitize_tag(input: &str) -> String {
    let mut collapsed = String::with_capacity(input.len());
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        let c = if is_tag_char(c) { c } else { '-' };
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }

    let trimmed = collapsed.trim_start_matches(|c: char| matches!(c, '+' | '.' | '-'));
    // all remaining chars are ASCII, byte index == char index
    let capped = &trimmed[..trimmed.len().min(MAX_TAG_LEN)];
    capped.trim_end_matches('-').to_string()
}

/// Sanitize, drop empties and duplicates, and join with `;`
pub fn sanitize_tags<I, S>(tags: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = sanitize_tag(tag.as_ref());
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out.join(&TAG_SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_tag("My Template"), "my-template");
        assert_eq!(sanitize_tag("node_v20.1+build"), "node_v20.1+build");
        assert_eq!(sanitize_tag("--weird!!name--"), "weird-name");
        assert_eq!(sanitize_tag("...+abc"), "abc");
        assert_eq!(sanitize_tag(""), "");
        assert_eq!(sanitize_tag("!!!"), "");
    }

    #[test]
    fn test_sanitize_non_ascii() {
        assert_eq!(sanitize_tag("café"), "caf");
        assert_eq!(sanitize_tag("日本 dev"), "dev");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_tag(&long).len(), MAX_TAG_LEN);

        // cut lands right after a dash
        let input = format!("{}-b", "a".repeat(49));
        assert_eq!(sanitize_tag(&input), "a".repeat(49));
    }

    #[test]
    fn test_sanitize_tags_joins_and_dedups() {
        assert_eq!(
            sanitize_tags(["burrow", "template", "My Template", "BURROW", "!!"]),
            "burrow;template;my-template"
        );
    }

    fn matches_tag_pattern(tag: &str) -> bool {
        let mut chars = tag.chars();
        match chars.next() {
            None => true,
            Some(first) => {
                matches!(first, 'a'..='z' | '0'..='9' | '_')
                    && tag.len() <= MAX_TAG_LEN
                    && chars.all(is_tag_char)
            }
        }
    }

    proptest! {
        #[test]
        fn prop_sanitize_idempotent(input in ".*") {
            let once = sanitize_tag(&input);
            prop_assert_eq!(sanitize_tag(&once), once);
        }

        #[test]
        fn prop_sanitize_matches_pattern(input in ".*") {
            let tag = sanitize_tag(&input);
            prop_assert!(matches_tag_pattern(&tag), "bad tag: {:?}", tag);
        }

        #[test]
        fn prop_sanitize_ascii_heavy(input in "[A-Za-z0-9 _+.!-]{0,80}") {
            let tag = sanitize_tag(&input);
            prop_assert!(matches_tag_pattern(&tag));
            prop_assert!(!tag.contains("--"));
        }
    }
}

//! Fixed-width strings and chat wrapping

/// Width of every string field on the wire.
pub const STRING_LEN: usize = 64;

/// Maps a string onto the printable ASCII range the protocol can carry.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}

/// Appends `text` as a 64-byte field, truncated and space-padded.
pub fn write_fixed_string(out: &mut Vec<u8>, text: &str) {
    let clean = sanitize(text);
    let bytes = clean.as_bytes();
    let len = bytes.len().min(STRING_LEN);
    out.extend_from_slice(&bytes[..len]);
    out.resize(out.len() + (STRING_LEN - len), b' ');
}

/// Reads a 64-byte field, dropping the trailing padding.
pub fn read_fixed_string(field: &[u8]) -> String {
    let text: String = field
        .iter()
        .map(|&b| if b.is_ascii() && b >= 0x20 { b as char } else { '?' })
        .collect();
    text.trim_end_matches(' ').to_string()
}

/// Splits `text` into lines that each fit a string field.
///
/// Text that already fits comes back as a single line. Longer text breaks on
/// spaces; continuation lines start with `prefix` so the reader can tell they
/// belong to the previous one. A word longer than a whole line is cut.
pub fn wrap_chat(text: &str, prefix: &str) -> Vec<String> {
    let text = sanitize(text);
    if text.len() <= STRING_LEN {
        return vec![text];
    }

    let prefix = sanitize(prefix);
    let prefix = &prefix[..prefix.len().min(STRING_LEN / 2)];

    let mut lines = Vec::new();
    let mut current = String::new();
    let mut has_words = false;

    for word in text.split(' ').filter(|w| !w.is_empty()) {
        let mut word = word;
        while !word.is_empty() {
            let sep = usize::from(has_words);
            if current.len() + sep + word.len() <= STRING_LEN {
                if has_words {
                    current.push(' ');
                }
                current.push_str(word);
                has_words = true;
                break;
            }

            if !has_words {
                // Cannot fit even on an empty line.
                let room = STRING_LEN - current.len();
                current.push_str(&word[..room]);
                word = &word[room..];
            }

            lines.push(std::mem::replace(&mut current, prefix.to_string()));
            has_words = false;
        }
    }

    if has_words {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_string_padding() {
        let mut out = Vec::new();
        write_fixed_string(&mut out, "hello");
        assert_eq!(out.len(), STRING_LEN);
        assert_eq!(&out[..5], b"hello");
        assert!(out[5..].iter().all(|&b| b == b' '));
        assert_eq!(read_fixed_string(&out), "hello");
    }

    #[test]
    fn test_fixed_string_truncates() {
        let long = "x".repeat(100);
        let mut out = Vec::new();
        write_fixed_string(&mut out, &long);
        assert_eq!(out.len(), STRING_LEN);
        assert_eq!(read_fixed_string(&out), "x".repeat(STRING_LEN));
    }

    #[test]
    fn test_non_ascii_replaced() {
        let mut out = Vec::new();
        write_fixed_string(&mut out, "caf\u{e9}");
        assert_eq!(read_fixed_string(&out), "caf?");
    }

    #[test]
    fn test_short_chat_single_line() {
        assert_eq!(wrap_chat("hi there", "> "), vec!["hi there".to_string()]);
    }

    #[test]
    fn test_wrap_130_chars_preserves_words() {
        let words: Vec<String> = (0..18).map(|i| format!("word{:02}", i)).collect();
        let text = format!("{} abcd", words.join(" "));
        assert_eq!(text.len(), 130);

        let lines = wrap_chat(&text, "> ");
        assert!(lines.len() > 1);
        for (i, line) in lines.iter().enumerate() {
            assert!(line.len() <= STRING_LEN, "line {} too long: {}", i, line.len());
            if i > 0 {
                assert!(line.starts_with("> "));
            }
        }

        let rebuilt: Vec<&str> = lines
            .iter()
            .enumerate()
            .flat_map(|(i, l)| {
                let body = if i == 0 { l.as_str() } else { &l[2..] };
                body.split(' ')
            })
            .filter(|w| !w.is_empty())
            .collect();
        let original: Vec<&str> = text.split(' ').collect();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_wrap_hard_splits_long_word() {
        let text = "a".repeat(150);
        let lines = wrap_chat(&text, "> ");
        assert!(lines.iter().all(|l| l.len() <= STRING_LEN));
        let joined: String = lines
            .iter()
            .enumerate()
            .map(|(i, l)| if i == 0 { l.as_str() } else { &l[2..] })
            .collect();
        assert_eq!(joined, text);
    }
}

/// Splits a raw email into its header block and its body.
///
/// The split happens at the first blank line. The header block keeps the
/// line terminator of its last header line, and the body starts with the
/// blank line itself, so that `header + body` always reproduces the input.
/// A message without a blank line is treated as header only, with an
/// empty body.
///
/// # Examples
///
/// ```rust
/// let (header, body) = tumble_utils::split_message("Subject: Hi\r\n\r\nHello");
/// assert_eq!(header, "Subject: Hi\r\n");
/// assert_eq!(body, "\r\nHello");
/// ```
///
/// Messages without a body separator keep everything in the header:
///
/// ```rust
/// let (header, body) = tumble_utils::split_message("Subject: Hi\r\nTo: a@b.c");
/// assert_eq!(header, "Subject: Hi\r\nTo: a@b.c");
/// assert_eq!(body, "");
/// ```
pub fn split_message(raw: &str) -> (&str, &str) {
    let mut pos = 0;
    while pos < raw.len() {
        let rest = &raw[pos..];
        if rest.starts_with("\r\n") || rest.starts_with('\n') {
            return (&raw[..pos], rest);
        }
        match rest.find('\n') {
            Some(index) => pos += index + 1,
            None => break,
        }
    }
    (raw, "")
}

/// Returns the line terminator used by a block of header text.
///
/// CRLF wins as soon as it is seen once, bare LF is used otherwise.
///
/// ```rust
/// assert_eq!(tumble_utils::line_ending("From: a@b.c\r\n"), "\r\n");
/// assert_eq!(tumble_utils::line_ending("From: a@b.c\n"), "\n");
/// ```
pub fn line_ending(text: &str) -> &'static str {
    if text.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Collapses a folded header value into a single line.
///
/// Every line break followed by leading whitespace (a continuation line)
/// is replaced by a single space.
///
/// ```rust
/// assert_eq!(
///     tumble_utils::unfold("\"Doe, Jane\"\r\n\t<jane@example.com>"),
///     "\"Doe, Jane\" <jane@example.com>"
/// );
/// ```
pub fn unfold(value: &str) -> String {
    let mut unfolded = String::with_capacity(value.len());
    for (index, line) in value.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if index == 0 {
            unfolded.push_str(line);
        } else {
            unfolded.push(' ');
            unfolded.push_str(line.trim_start());
        }
    }
    unfolded
}

/// Extracts the domain part of an address, if it has one.
///
/// ```rust
/// assert_eq!(tumble_utils::address_domain("info@Example.com"), Some("Example.com"));
/// assert_eq!(tumble_utils::address_domain("info"), None);
/// ```
pub fn address_domain(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim_end_matches('>'))
        .filter(|domain| !domain.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message_lf() {
        let (header, body) = split_message("From: a@b.c\nSubject: x\n\nline one\nline two\n");
        assert_eq!(header, "From: a@b.c\nSubject: x\n");
        assert_eq!(body, "\nline one\nline two\n");
    }

    #[test]
    fn test_split_message_roundtrip_keeps_bytes() {
        let raw = "From: a@b.c\r\nX-Folded: one\r\n two\r\n\r\nBody\r\n\r\nMore\r\n";
        let (header, body) = split_message(raw);
        assert_eq!(format!("{header}{body}"), raw);
        assert_eq!(header, "From: a@b.c\r\nX-Folded: one\r\n two\r\n");
    }

    #[test]
    fn test_split_message_leading_blank_line() {
        let (header, body) = split_message("\r\nonly body");
        assert_eq!(header, "");
        assert_eq!(body, "\r\nonly body");
    }

    #[test]
    fn test_split_message_empty() {
        assert_eq!(split_message(""), ("", ""));
    }

    #[test]
    fn test_unfold_single_line() {
        assert_eq!(unfold("Jane <jane@example.com>"), "Jane <jane@example.com>");
    }

    #[test]
    fn test_unfold_lf_continuation() {
        assert_eq!(unfold("Jane\n    <jane@example.com>"), "Jane <jane@example.com>");
    }

    #[test]
    fn test_address_domain_strips_angle() {
        assert_eq!(address_domain("<jim@lists.example.com>"), Some("lists.example.com"));
        assert_eq!(address_domain("jim@"), None);
    }
}

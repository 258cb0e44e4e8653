use anyhow::bail;

/// Decode a line of hex text into bytes.
///
/// Whitespace between octets is skipped; a `#` ends the scan and consumes
/// the rest of the line (comment). Two adjacent hex digits form one byte,
/// most significant nybble first. The scan stops at the first character
/// that cannot continue an octet: a lone digit is left unconsumed, as is
/// any non-hex, non-whitespace character.
///
/// Returns the decoded bytes and the index of the first unconsumed
/// character, so callers can tell clean termination from trailing garbage.
pub fn decode(text: &str) -> (Vec<u8>, usize) {
    let s = text.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    let mut i = 0;

    loop {
        while i < s.len() && s[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == s.len() {
            return (out, i);
        }
        if s[i] == b'#' {
            return (out, s.len());
        }
        let hi = match nybble_of(s[i]) {
            Some(n) => n,
            None => return (out, i),
        };
        let lo = match s.get(i + 1).and_then(|&c| nybble_of(c)) {
            Some(n) => n,
            None => return (out, i),
        };
        out.push(hi << 4 | lo);
        i += 2;
    }
}

/// Decode one line of input, treating leftover input as an error.
///
/// The error message carries the 1-based line number so it can be
/// correlated with the input; the line is meant to be logged and skipped,
/// not to abort the session.
pub fn decode_line(line: &str, lineno: u64) -> anyhow::Result<Vec<u8>> {
    let (octets, consumed) = decode(line);
    match line[consumed..].chars().next() {
        None => Ok(octets),
        Some(c) if c.is_ascii_hexdigit() => {
            bail!("line {}: odd number of hex digits", lineno)
        }
        Some(c) => bail!("line {}: unexpected character '{}'", lineno, c),
    }
}

/// Format bytes as lowercase hex octets separated by single spaces, as many
/// as fit in `max_width` characters.
///
/// Returns the formatted text and the index of the first unformatted byte.
/// Looping until that index reaches `buf.len()` gives a paged hex dump of a
/// long buffer without reallocation.
pub fn encode(buf: &[u8], max_width: usize) -> (String, usize) {
    let mut out = String::new();
    let mut i = 0;

    while i < buf.len() {
        let needed = if out.is_empty() { 2 } else { 3 };
        if out.len() + needed > max_width {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push(nybble_char(buf[i] >> 4));
        out.push(nybble_char(buf[i] & 0x0f));
        i += 1;
    }
    (out, i)
}

fn nybble_of(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn nybble_char(n: u8) -> char {
    if n < 10 {
        (b'0' + n) as char
    } else {
        (b'a' + n - 10) as char
    }
}

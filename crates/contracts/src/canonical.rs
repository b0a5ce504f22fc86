use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

/// Collapses whitespace runs and drops `#` line comments so that two renderings
/// of the same operation text hash identically.
pub fn canonicalize_operation_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for line in input.lines() {
        let line = strip_comment(line);
        for token in line.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(token);
        }
    }

    out
}

pub fn operation_fingerprint(query: &str) -> String {
    sha256_hex(canonicalize_operation_text(query).as_bytes())
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut prev_backslash = false;

    for (idx, ch) in line.char_indices() {
        if in_string {
            if ch == '"' && !prev_backslash {
                in_string = false;
            }
            prev_backslash = ch == '\\' && !prev_backslash;
        } else if ch == '"' {
            in_string = true;
        } else if ch == '#' {
            return &line[..idx];
        }
    }

    line
}

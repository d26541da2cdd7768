//! Glob matching with server semantics.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[a-z]`, `[^x]`) and `\`
//! escapes. Matching is byte-oriented, so multi-byte characters only match
//! `?` one byte at a time, the same way the server sees them.

/// Check whether `text` matches the glob `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    matches(pattern.as_bytes(), text.as_bytes())
}

/// Iterative matcher. Every token other than `*` consumes exactly one byte,
/// so on a mismatch it is enough to resume from the most recent star with
/// one more byte swallowed. Runs in `O(pattern * text)`.
fn matches(p: &[u8], s: &[u8]) -> bool {
    let (mut pi, mut si) = (0, 0);
    // Pattern index after the last star, and the text index it resumes at.
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if p.get(pi) == Some(&b'*') {
            pi += 1;
            star = Some((pi, si));
            continue;
        }
        if let Some(next) = match_token(p, pi, s[si]) {
            pi = next;
            si += 1;
            continue;
        }
        match star {
            Some((resume, from)) => {
                pi = resume;
                si = from + 1;
                star = Some((resume, si));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == b'*')
}

/// Match one non-star token at `p[pi]` against `ch`. Returns the pattern
/// index after the token on success.
fn match_token(p: &[u8], pi: usize, ch: u8) -> Option<usize> {
    match *p.get(pi)? {
        b'?' => Some(pi + 1),
        b'[' => {
            let (matched, rest) = match_class(&p[pi + 1..], ch);
            matched.then(|| p.len() - rest.len())
        }
        b'\\' if pi + 1 < p.len() => (p[pi + 1] == ch).then_some(pi + 2),
        c => (c == ch).then_some(pi + 1),
    }
}

/// Match one byte against a class body (after `[`). Returns the verdict and
/// the pattern remaining after the closing `]`. An unterminated class ends at
/// the end of the pattern.
fn match_class(mut p: &[u8], ch: u8) -> (bool, &[u8]) {
    let negate = p.first() == Some(&b'^');
    if negate {
        p = &p[1..];
    }

    let mut matched = false;
    loop {
        match p {
            [] => break,
            [b'\\', escaped, rest @ ..] => {
                matched |= *escaped == ch;
                p = rest;
            }
            [b']', rest @ ..] => {
                p = rest;
                break;
            }
            [start, b'-', end, rest @ ..] => {
                let (lo, hi) = if start <= end {
                    (*start, *end)
                } else {
                    (*end, *start)
                };
                matched |= (lo..=hi).contains(&ch);
                p = rest;
            }
            [c, rest @ ..] => {
                matched |= *c == ch;
                p = rest;
            }
        }
    }

    (matched != negate, p)
}

use std::sync::LazyLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 2048;

// CSI, OSC (BEL or ST terminated), DCS/SOS/PM/APC, then lone two-byte escapes.
static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[PX^_][^\x1b]*\x1b\\",
        r"|\x1b[@-Z\\-_]?",
    ))
    .expect("invalid escape pattern")
});

/// Make remote output safe to embed in a single log line.
pub fn sanitize_for_log(input: &str) -> String {
    let stripped = ESCAPE_RE.replace_all(input, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut count = 0usize;
    for c in stripped.chars() {
        let c = match c {
            '\n' | '\r' | '\t' => ' ',
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };
        if count == MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        out.push(c);
        count += 1;
    }
    out.trim().to_string()
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Drop shell xtrace lines (`set -x` output), which echo sentinel strings
/// without meaning the step ran.
pub fn strip_xtrace_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('+'))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn last_nonblank_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_escapes_and_flattens_lines() {
        let input = "ok \u{1b}[31mred\u{1b}[0m\n\u{1b}]0;title\u{7}done\t\u{202e}x";
        assert_eq!(sanitize_for_log(input), "ok red done x");
    }

    #[test]
    fn long_output_is_capped() {
        let got = sanitize_for_log(&"a".repeat(MAX_LOG_CHARS + 10));
        assert_eq!(got, format!("{} ...[truncated]", "a".repeat(MAX_LOG_CHARS)));
    }

    #[test]
    fn xtrace_lines_are_dropped() {
        let text = "start\n+ echo 所有步骤完成\n  ++ nested\nreal line";
        assert_eq!(strip_xtrace_lines(text), "start\nreal line");
    }

    #[test]
    fn last_nonblank_skips_trailing_whitespace() {
        assert_eq!(last_nonblank_line("motd\n4242\n\n  \n"), Some("4242"));
        assert_eq!(last_nonblank_line(" \n"), None);
    }
}

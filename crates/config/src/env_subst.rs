/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            // Unterminated: the remainder is literal text.
            out.push_str(&rest[open..]);
            return out;
        };
        let placeholder = &rest[open..open + close + 3];
        match Some(&after[..close])
            .filter(|name| !name.is_empty())
            .and_then(&lookup)
        {
            Some(value) => out.push_str(&value),
            None => out.push_str(placeholder),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_env(name: &str) -> Option<String> {
        (name == "NODEGATE_TEST_HOST").then(|| "203.0.113.7".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("announce_host = \"${NODEGATE_TEST_HOST}\"", fake_env),
            "announce_host = \"203.0.113.7\""
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_with("${NODEGATE_NONEXISTENT_XYZ}", fake_env),
            "${NODEGATE_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("x = ${OPEN", fake_env), "x = ${OPEN");
    }

    #[test]
    fn reads_process_environment() {
        // cargo sets this for every test binary it runs.
        let expected = env!("CARGO_MANIFEST_DIR");
        assert_eq!(substitute_env("${CARGO_MANIFEST_DIR}"), expected);
    }

    #[test]
    fn empty_and_repeated_placeholders() {
        assert_eq!(substitute_with("${}", fake_env), "${}");
        assert_eq!(
            substitute_with("${NODEGATE_TEST_HOST}:${NODEGATE_TEST_HOST}", fake_env),
            "203.0.113.7:203.0.113.7"
        );
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}

//! Template rendering for transfer scripts and their wrappers.
//!
//! Transfer scripts use `{{ ... }}` variables describing the two endpoints;
//! wrapper templates use the doubly-demarcated `[[ script ]]` so wrapping
//! never collides with the inner template's variables. An endpoint variable
//! may be piped through the `sh_escape` filter, which backslash-escapes the
//! characters the shell would otherwise interpret inside double quotes.

use std::sync::OnceLock;

use regex::{NoExpand, Regex};

use crate::filesystem::Data;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*(?P<variable>[a-z_]+(?:\.[a-z_]+)?)\s*(?:\|\s*(?P<filter>[a-z_]+)\s*)?\}\}")
            .expect("variable pattern is valid")
    })
}

fn script_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[\[\s*script\s*\]\]").expect("script pattern is valid"))
}

fn sh_escape_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"(["$])"#).expect("escape pattern is valid"))
}

/// Backslash-escape double quotes and dollar signs.
pub fn sh_escape(value: &str) -> String {
    sh_escape_pattern().replace_all(value, r"\$1").into_owned()
}

/// Render a transfer script template against its two endpoints.
///
/// Recognised variables: `source`, `target`, and their `.filesystem` and
/// `.address` attributes (the bare endpoint renders as its address).
/// Unrecognised variables are left untouched.
pub fn render_script(template: &str, source: &Data, target: &Data) -> String {
    variable_pattern()
        .replace_all(template, |captures: &regex::Captures<'_>| {
            let value = match &captures["variable"] {
                "source" | "source.address" => source.address.display().to_string(),
                "source.filesystem" => source.filesystem.name().to_string(),
                "target" | "target.address" => target.address.display().to_string(),
                "target.filesystem" => target.filesystem.name().to_string(),
                _ => return captures[0].to_string(),
            };

            match captures.name("filter").map(|f| f.as_str()) {
                Some("sh_escape") => sh_escape(&value),
                _ => value,
            }
        })
        .into_owned()
}

/// Substitute a script into a wrapper template at `[[ script ]]`.
///
/// The substituted text is not rescanned, so a wrapper embedded as the script
/// of an outer wrapper keeps its own `[[ script ]]` placeholder intact.
pub fn wrap_script(wrapper: &str, script: &str) -> String {
    script_pattern()
        .replace_all(wrapper, NoExpand(script))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::mock_data;

    #[test]
    fn renders_endpoint_variables() {
        let source = mock_data("Lustre", "/lustre/a.dat");
        let target = mock_data("iRODS", "/zone/a.dat");

        let rendered = render_script(
            "cp \"{{ source.address }}\" \"{{ target.address }}\" # {{source.filesystem}} -> {{target.filesystem}}",
            &source,
            &target,
        );

        assert_eq!(
            rendered,
            "cp \"/lustre/a.dat\" \"/zone/a.dat\" # Lustre -> iRODS"
        );
    }

    #[test]
    fn bare_endpoints_render_as_addresses() {
        let source = mock_data("a", "/in");
        let target = mock_data("b", "/out");
        assert_eq!(
            render_script("{{source}} -> {{target}}", &source, &target),
            "/in -> /out"
        );
    }

    #[test]
    fn unknown_variables_are_left_untouched() {
        let source = mock_data("a", "/in");
        let target = mock_data("b", "/out");
        assert_eq!(
            render_script("{{ mystery }}", &source, &target),
            "{{ mystery }}"
        );
    }

    #[test]
    fn sh_escape_filter_escapes_quotes_and_dollars() {
        let source = mock_data("a", "/in/$weird\"name");
        let target = mock_data("b", "/out");
        assert_eq!(
            render_script(r#"echo "{{ source.address | sh_escape }}""#, &source, &target),
            r#"echo "/in/\$weird\"name""#
        );
    }

    #[test]
    fn wrapping_substitutes_the_script_placeholder() {
        let wrapped = wrap_script("before\n[[ script ]]\nafter", "middle");
        assert_eq!(wrapped, "before\nmiddle\nafter");
    }

    #[test]
    fn wrapping_tolerates_tight_demarcation() {
        assert_eq!(wrap_script("a [[script]] b", "x"), "a x b");
    }

    #[test]
    fn wrapped_scripts_keep_their_own_placeholder() {
        // An inner wrapper substituted into an outer one must survive with
        // its placeholder intact for later substitution
        let combined = wrap_script("outer([[script]])", "inner([[script]])");
        assert_eq!(combined, "outer(inner([[script]]))");
    }

    #[test]
    fn substituted_text_with_dollars_is_literal() {
        let wrapped = wrap_script("[[script]]", "echo \"$1\"");
        assert_eq!(wrapped, "echo \"$1\"");
    }
}

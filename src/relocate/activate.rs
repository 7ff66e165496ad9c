//! Activation script rewriting.
//!
//! `venv` writes the absolute root into its activation scripts. The POSIX
//! and fish scripts can compute the root from their own location instead;
//! the remaining shells are left untouched and reported.

/// Root of the environment as seen from a sourced POSIX script.
///
/// bash exposes the sourced file as `$BASH_SOURCE` and zsh as `$0`. Shells
/// that report neither (dash) only resolve when sourced from `bin/` itself;
/// otherwise the root is left empty and an error is printed.
const POSIX_ROOT: &str = concat!(
    r#""$(_activate_dir="$(dirname -- "${BASH_SOURCE:-$0}")" && "#,
    r#"[ -f "$_activate_dir/activate" ] && "#,
    r#"CDPATH= cd -- "$_activate_dir/.." && pwd || "#,
    r#"echo "activate: cannot locate the environment, source this file from bash or zsh" >&2)""#,
);

/// Root of the environment as seen from a sourced fish script.
const FISH_ROOT: &str = "(builtin realpath (dirname (status -f))/..)";

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ActivationRewrite {
    Rewritten(String),
    Unchanged,
    Unsupported,
}

pub(super) fn rewrite_activation(name: &str, text: &str, root: &str) -> ActivationRewrite {
    let replacement = match name {
        "activate" => Some(POSIX_ROOT),
        "activate.fish" => Some(FISH_ROOT),
        _ => None,
    };

    let scan = replace_root(text, root, replacement);
    if scan.remaining > 0 {
        ActivationRewrite::Unsupported
    } else if scan.replaced > 0 {
        ActivationRewrite::Rewritten(scan.text)
    } else {
        ActivationRewrite::Unchanged
    }
}

struct Scan {
    text: String,
    replaced: usize,
    /// References to the root (or a path below it) left in place
    remaining: usize,
}

/// Replace quoted (`"root"`, `'root'`) and whitespace-delimited occurrences
/// of `root`. Longer names such as `root2` are not references to the root.
fn replace_root(text: &str, root: &str, replacement: Option<&str>) -> Scan {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut replaced = 0;
    let mut remaining = 0;
    let mut copied = 0;
    let mut search = 0;

    while let Some(offset) = text[search..].find(root) {
        let start = search + offset;
        let end = start + root.len();
        search = end;

        let before = start.checked_sub(1).map(|i| bytes[i]);
        let after = bytes.get(end).copied();

        if after.is_some_and(continues_name) {
            continue;
        }
        let Some(replacement) = replacement else {
            remaining += 1;
            continue;
        };

        let quoted =
            start > copied && matches!(before, Some(q @ (b'"' | b'\'')) if after == Some(q));
        if quoted {
            out.push_str(&text[copied..start - 1]);
            out.push_str(replacement);
            copied = end + 1;
            search = copied;
            replaced += 1;
        } else if starts_word(before) && ends_word(after) {
            out.push_str(&text[copied..start]);
            out.push_str(replacement);
            copied = end;
            replaced += 1;
        } else {
            remaining += 1;
        }
    }
    out.push_str(&text[copied..]);

    Scan {
        text: out,
        replaced,
        remaining,
    }
}

fn continues_name(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

fn starts_word(before: Option<u8>) -> bool {
    matches!(before, None | Some(b'=' | b' ' | b'\t' | b'\n' | b'('))
}

fn ends_word(after: Option<u8>) -> bool {
    matches!(after, None | Some(b'\n' | b' ' | b'\t' | b')' | b';'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/work/slave-env";

    fn rewritten(name: &str, text: &str) -> String {
        match rewrite_activation(name, text, ROOT) {
            ActivationRewrite::Rewritten(text) => text,
            other => panic!("expected a rewrite, got {:?}", other),
        }
    }

    #[test]
    fn test_posix_double_quoted_root() {
        let text = "VIRTUAL_ENV=\"/work/slave-env\"\nexport VIRTUAL_ENV\n";
        assert_eq!(
            rewritten("activate", text),
            format!("VIRTUAL_ENV={}\nexport VIRTUAL_ENV\n", POSIX_ROOT)
        );
    }

    #[test]
    fn test_posix_root_avoids_bash_only_syntax() {
        assert!(!POSIX_ROOT.contains("[0]"));
        assert!(POSIX_ROOT.contains("${BASH_SOURCE:-$0}"));
    }

    #[test]
    fn test_posix_single_quoted_root() {
        let text = "VIRTUAL_ENV='/work/slave-env'\n";
        assert_eq!(
            rewritten("activate", text),
            format!("VIRTUAL_ENV={}\n", POSIX_ROOT)
        );
    }

    #[test]
    fn test_posix_unquoted_root() {
        let text = "VIRTUAL_ENV=/work/slave-env\nexport VIRTUAL_ENV=$(cygpath /work/slave-env)\n";
        let result = rewritten("activate", text);
        assert!(!result.contains(ROOT));
        assert!(result.contains(&format!("$(cygpath {})", POSIX_ROOT)));
    }

    #[test]
    fn test_fish_root() {
        let text = "set -gx VIRTUAL_ENV \"/work/slave-env\"\n";
        assert_eq!(
            rewritten("activate.fish", text),
            format!("set -gx VIRTUAL_ENV {}\n", FISH_ROOT)
        );
    }

    #[test]
    fn test_script_without_root_is_unchanged() {
        let text = "export PATH=\"$VIRTUAL_ENV/bin:$PATH\"\n";
        assert_eq!(
            rewrite_activation("activate", text, ROOT),
            ActivationRewrite::Unchanged
        );
    }

    #[test]
    fn test_rewritten_script_is_unchanged_on_second_pass() {
        let once = rewritten("activate", "VIRTUAL_ENV=\"/work/slave-env\"\n");
        assert_eq!(
            rewrite_activation("activate", &once, ROOT),
            ActivationRewrite::Unchanged
        );
    }

    #[test]
    fn test_longer_names_are_not_the_root() {
        let text = "OTHER=\"/work/slave-env2\"\nVIRTUAL_ENV=\"/work/slave-env\"\n";
        let result = rewritten("activate", text);
        assert!(result.starts_with("OTHER=\"/work/slave-env2\"\n"));
    }

    #[test]
    fn test_paths_below_the_root_are_unsupported() {
        let text = "PATH=\"/work/slave-env/bin:$PATH\"\n";
        assert_eq!(
            rewrite_activation("activate", text, ROOT),
            ActivationRewrite::Unsupported
        );
    }

    #[test]
    fn test_other_shells_are_unsupported() {
        let text = "setenv VIRTUAL_ENV \"/work/slave-env\"\n";
        assert_eq!(
            rewrite_activation("activate.csh", text, ROOT),
            ActivationRewrite::Unsupported
        );
        assert_eq!(
            rewrite_activation("activate.csh", "setenv FOO bar\n", ROOT),
            ActivationRewrite::Unchanged
        );
    }
}

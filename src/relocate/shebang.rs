//! Console script shebang rewriting.
//!
//! A script whose interpreter lives inside the environment gets this header:
//!
//! ```text
//! #!/bin/sh
//! '''exec' "$(dirname -- "$(realpath -- "$0")")/python" "$0" "$@"
//! ' '''
//! ```
//!
//! The shell runs the second line and execs the interpreter found next to
//! the script; Python reads lines two and three as a string literal. pip
//! emits the same header with an absolute interpreter path when the path is
//! too long for a `#!` line, and that form is rewritten as well.

use std::path::Path;

use crate::runtime::is_path_under;
use crate::runtime::path::normalize_path;

const LAUNCHER_SHELL: &str = "#!/bin/sh";
const LAUNCHER_EXEC: &str = "'''exec' ";
const LAUNCHER_END: &str = "' '''";
const LAUNCHER_ARGS: &str = "\"$0\" \"$@\"";
const SCRIPT_DIR: &str = "\"$(dirname -- \"$(realpath -- \"$0\")\")/";

pub(super) enum ShebangRewrite {
    Rewritten(Vec<u8>),
    Unchanged,
    Unsupported(String),
}

pub(super) fn rewrite_shebang(content: &[u8], root: &Path, bin_dir: &Path) -> ShebangRewrite {
    if !content.starts_with(b"#!") {
        return ShebangRewrite::Unchanged;
    }

    let (first, rest) = split_line(content);
    let Ok(first) = std::str::from_utf8(first) else {
        return ShebangRewrite::Unchanged;
    };
    let first = first.trim_end_matches('\r');

    if first.trim_end() == LAUNCHER_SHELL {
        return rewrite_launcher(rest, root, bin_dir);
    }

    let line = first[2..].trim();
    let (interpreter, args) = match line.split_once(char::is_whitespace) {
        Some((interpreter, args)) => (interpreter, args.trim()),
        None => (line, ""),
    };
    build_launcher(interpreter, args, rest, root, bin_dir)
}

/// Handle a script that already starts with a `/bin/sh` launcher header.
fn rewrite_launcher(rest: &[u8], root: &Path, bin_dir: &Path) -> ShebangRewrite {
    let (second, after_second) = split_line(rest);
    let Ok(second) = std::str::from_utf8(second) else {
        return ShebangRewrite::Unchanged;
    };
    let Some(exec) = second.trim_end_matches('\r').strip_prefix(LAUNCHER_EXEC) else {
        // A plain shell script
        return ShebangRewrite::Unchanged;
    };

    let (third, body) = split_line(after_second);
    if std::str::from_utf8(third).map(|l| l.trim_end()) != Ok(LAUNCHER_END) {
        return ShebangRewrite::Unchanged;
    }
    if exec.starts_with(SCRIPT_DIR) {
        return ShebangRewrite::Unchanged;
    }

    let (interpreter, remainder) = match exec.strip_prefix('"') {
        Some(quoted) => match quoted.split_once('"') {
            Some(parts) => parts,
            None => return ShebangRewrite::Unchanged,
        },
        None => match exec.split_once(char::is_whitespace) {
            Some(parts) => parts,
            None => return ShebangRewrite::Unchanged,
        },
    };
    let Some(args) = remainder.trim().strip_suffix(LAUNCHER_ARGS) else {
        return ShebangRewrite::Unchanged;
    };

    build_launcher(interpreter, args.trim(), body, root, bin_dir)
}

fn build_launcher(
    interpreter: &str,
    args: &str,
    body: &[u8],
    root: &Path,
    bin_dir: &Path,
) -> ShebangRewrite {
    let interpreter = Path::new(interpreter);
    if !interpreter.is_absolute() || !is_path_under(interpreter, root) {
        return ShebangRewrite::Unchanged;
    }

    let Some(relative) = pathdiff::diff_paths(normalize_path(interpreter), normalize_path(bin_dir))
    else {
        return ShebangRewrite::Unsupported(format!(
            "cannot express {:?} relative to {:?}",
            interpreter, bin_dir
        ));
    };
    let relative = relative.to_string_lossy();
    if relative.contains(['"', '$', '`', '\\']) {
        return ShebangRewrite::Unsupported(format!(
            "interpreter path {:?} cannot be quoted for the shell",
            relative
        ));
    }

    let mut exec = format!("{}{}{}\"", LAUNCHER_EXEC, SCRIPT_DIR, relative);
    if !args.is_empty() {
        exec.push(' ');
        exec.push_str(args);
    }
    exec.push(' ');
    exec.push_str(LAUNCHER_ARGS);

    let header = format!("{}\n{}\n{}\n", LAUNCHER_SHELL, exec, LAUNCHER_END);
    let mut content = header.into_bytes();
    content.extend_from_slice(body);
    ShebangRewrite::Rewritten(content)
}

fn split_line(content: &[u8]) -> (&[u8], &[u8]) {
    match content.iter().position(|&b| b == b'\n') {
        Some(i) => (&content[..i], &content[i + 1..]),
        None => (content, &[]),
    }
}

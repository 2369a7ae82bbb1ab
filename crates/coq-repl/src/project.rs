//! Startup flags from a `_CoqProject` file.
//!
//! Only lines that start with `-` are flags. The first token of such a line
//! is the flag itself; the rest of the line is split with shell-like quoting.
//! `-arg` wrappers are dropped since their payload is passed through as-is.

use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "_CoqProject";

/// Find the nearest `_CoqProject` in `start` or one of its ancestors.
pub fn find_project_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_FILE))
        .find(|candidate| candidate.is_file())
}

/// Locate and parse the nearest `_CoqProject`.
///
/// Returns `None` when there is no project file or it cannot be read.
pub fn read_project_flags(start: &Path) -> Option<Vec<String>> {
    let path = find_project_file(start)?;
    match std::fs::read_to_string(&path) {
        Ok(contents) => Some(parse_project_flags(&contents)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read _CoqProject");
            None
        }
    }
}

/// Extract backend flags from the contents of a `_CoqProject`.
pub fn parse_project_flags(contents: &str) -> Vec<String> {
    let mut flags = Vec::new();
    for line in contents.lines().map(str::trim) {
        if !line.starts_with('-') {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((flag, rest)) => {
                flags.push(flag.to_string());
                flags.extend(split_args(rest));
            }
            None => flags.push(line.to_string()),
        }
    }
    flags.retain(|flag| flag != "-arg");
    flags
}

/// Split `line` into arguments.
///
/// Double- or single-quoted spans are taken verbatim (no escapes), and
/// unquoted whitespace separates arguments. An explicitly quoted empty span
/// yields an empty argument.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_token = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                has_token = true;
            }
            None if c.is_whitespace() => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            None => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_words() {
        assert_eq!(split_args("theories Foo"), vec!["theories", "Foo"]);
        assert_eq!(split_args("  a \t  b  "), vec!["a", "b"]);
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn split_quoted_spans() {
        assert_eq!(
            split_args(r#""my dir" 'Lib Name'"#),
            vec!["my dir", "Lib Name"]
        );
        assert_eq!(split_args(r#"pre"fix 'x"#), vec!["prefix 'x"]);
        assert_eq!(split_args(r#"'say "hi"'"#), vec![r#"say "hi""#]);
        assert_eq!(split_args(r#""" b"#), vec!["", "b"]);
    }

    #[test]
    fn parse_flags_skips_files_and_arg_wrappers() {
        let contents = "\
-R theories MyLib
-Q \"src dir\" Other

theories/Foo.v
-arg -w -arg -notation-overridden
-noinit
";
        assert_eq!(
            parse_project_flags(contents),
            vec![
                "-R",
                "theories",
                "MyLib",
                "-Q",
                "src dir",
                "Other",
                "-w",
                "-notation-overridden",
                "-noinit"
            ]
        );
    }

    #[test]
    fn find_walks_up_to_ancestor() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(PROJECT_FILE), "-noinit\n").unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_project_file(&nested),
            Some(root.path().join(PROJECT_FILE))
        );
        assert_eq!(read_project_flags(&nested), Some(vec!["-noinit".to_string()]));
    }

    #[test]
    fn nearest_project_file_wins() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(PROJECT_FILE), "-outer\n").unwrap();
        let inner = root.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(inner.join(PROJECT_FILE), "-inner\n").unwrap();

        assert_eq!(read_project_flags(&inner), Some(vec!["-inner".to_string()]));
    }
}

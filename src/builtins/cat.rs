use std::fs;

use anyhow::{anyhow, Result};

use crate::job::script::{Invocation, ScriptValue};

/// Options for the cat command
#[derive(Debug, Default)]
struct CatOptions {
    /// Show line numbers
    number_lines: bool,
    /// Files to concatenate, "-" for stdin
    files: Vec<String>,
}

impl CatOptions {
    fn parse(args: &[String]) -> Result<Self> {
        let mut opts = CatOptions::default();
        for arg in args {
            if arg.starts_with('-') && arg.len() > 1 {
                for ch in arg[1..].chars() {
                    match ch {
                        'n' => opts.number_lines = true,
                        _ => return Err(anyhow!("cat: invalid option -- '{}'", ch)),
                    }
                }
            } else {
                opts.files.push(arg.clone());
            }
        }

        if opts.files.is_empty() {
            opts.files.push("-".to_string());
        }
        Ok(opts)
    }
}

pub fn builtin_cat(inv: &mut Invocation<'_>) -> Result<ScriptValue> {
    let opts = match CatOptions::parse(inv.args) {
        Ok(opts) => opts,
        Err(err) => {
            inv.io.eprint(&format!("{err}\n"));
            return Ok(ScriptValue::Status(1));
        }
    };

    let mut content = Vec::new();
    let mut status = 0;
    for file in &opts.files {
        if file == "-" {
            content.extend_from_slice(inv.io.stdin());
            continue;
        }
        match fs::read(file) {
            Ok(bytes) => content.extend_from_slice(&bytes),
            Err(err) => {
                inv.io.eprint(&format!("cat: {file}: {err}\n"));
                status = 1;
            }
        }
    }

    if opts.number_lines {
        let text = String::from_utf8_lossy(&content).into_owned();
        for (index, line) in text.split_inclusive('\n').enumerate() {
            inv.io.print(&format!("{:>6}\t{}", index + 1, line));
        }
    } else {
        inv.io.write(&content);
    }
    Ok(ScriptValue::Status(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Assignments;
    use crate::job::script::ScriptIo;
    use std::io::Write;

    fn run(args: &[&str], input: &str) -> (ScriptValue, String, String) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let env = Assignments::new();
        let mut io = ScriptIo::with_input(input.as_bytes().to_vec());
        let mut escapes = Vec::new();
        let value = {
            let mut inv = Invocation::new("cat", &args, &env, &mut io, &mut escapes);
            builtin_cat(&mut inv).unwrap()
        };
        let (out, err) = io.into_parts();
        (
            value,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_stdin_passthrough() {
        let (value, out, _) = run(&[], "a\nb\n");
        assert_eq!(value, ScriptValue::Status(0));
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn test_files_and_numbering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "one\ntwo\n").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let (_, out, _) = run(&["-n", &path], "");
        assert_eq!(out, "     1\tone\n     2\ttwo\n");

        let (_, out, _) = run(&[&path, "-"], "three\n");
        assert_eq!(out, "one\ntwo\nthree\n");
    }

    #[test]
    fn test_missing_file() {
        let (value, out, err) = run(&["/no/such/file", "-"], "still\n");
        assert_eq!(value, ScriptValue::Status(1));
        assert_eq!(out, "still\n");
        assert!(err.starts_with("cat: /no/such/file: "));
    }

    #[test]
    fn test_invalid_option() {
        let (value, _, err) = run(&["-z"], "");
        assert_eq!(value, ScriptValue::Status(1));
        assert!(err.contains("invalid option"));
    }
}

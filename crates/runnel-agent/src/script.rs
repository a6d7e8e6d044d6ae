//! Compiles a step's command list into one script for the sandbox shell.
//!
//! The script travels in the `RUNNER_SCRIPT` environment variable and is fed
//! to the shell by a fixed launcher command.

use runnel_core::{Error, Result};

/// Environment variable carrying the compiled script.
pub const SCRIPT_ENV: &str = "RUNNER_SCRIPT";

const UNIX_PRELUDE: &str = "\nset -e\n\n";

const PS_HEADER: &str = "& {\r\n";
const PS_OPTIONS: &str = "$ErrorActionPreference=\"Stop\";\r\n";
const PS_CHECK_ERROR: &str =
    "if(!$?) { Exit &{if($LASTEXITCODE) {$LASTEXITCODE} else {1}} }\r\n";
const PS_FOOTER: &str = "}\r\n\r\n";

/// Launcher and script for a step, chosen by the sandbox OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub launcher: Vec<String>,
    pub script: String,
}

impl CompiledScript {
    /// The `KEY=VALUE` pair that hands the script to the launcher.
    pub fn env(&self) -> String {
        format!("{SCRIPT_ENV}={}", self.script)
    }
}

pub fn compile(os: &str, commands: &[String]) -> Result<CompiledScript> {
    match os {
        "windows" => Ok(CompiledScript {
            launcher: windows_launcher(),
            script: compile_windows(commands),
        }),
        "linux" | "darwin" | "macos" | "freebsd" => Ok(CompiledScript {
            launcher: unix_launcher(),
            script: compile_unix(commands),
        }),
        other => Err(Error::UnsupportedOs(other.to_string())),
    }
}

/// `set -e`, then each command preceded by a trace line.
pub fn compile_unix(commands: &[String]) -> String {
    let mut script = String::from(UNIX_PRELUDE);
    for command in commands {
        script.push_str(&format!(
            "\nprintf '+ {}\\n'\n\n{}\n",
            encode_command_line(command),
            command
        ));
    }
    script
}

pub fn compile_windows(commands: &[String]) -> String {
    let mut script = String::from(PS_HEADER);
    script.push_str(PS_OPTIONS);
    for command in commands {
        script.push_str(&format!("\"+ {}\"\r\n", escape_powershell(command)));
        script.push_str(command);
        script.push_str("\r\n");
        script.push_str(PS_CHECK_ERROR);
    }
    script.push_str(PS_FOOTER);
    script
}

pub fn unix_launcher() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("printf '%s' \"${SCRIPT_ENV}\" | /bin/sh"),
    ]
}

pub fn windows_launcher() -> Vec<String> {
    vec![
        "powershell.exe".to_string(),
        "-NoProfile".to_string(),
        "-c".to_string(),
        format!(
            "echo $env:{SCRIPT_ENV} | powershell.exe -NoProfile -NoLogo -InputFormat text \
             -OutputFormat text -ExecutionPolicy Bypass -NonInteractive -Command -"
        ),
    ]
}

/// Keeps ASCII letters, digits and spaces. Every other byte becomes an
/// octal escape understood by `printf`.
fn encode_command_line(line: &str) -> String {
    let mut encoded = String::with_capacity(line.len());
    for c in line.chars() {
        if c.is_ascii_alphanumeric() || c == ' ' {
            encoded.push(c);
            continue;
        }
        let mut buf = [0u8; 4];
        for byte in c.encode_utf8(&mut buf).bytes() {
            encoded.push_str(&format!("\\{byte:03o}"));
        }
    }
    encoded
}

fn escape_powershell(command: &str) -> String {
    const REPLACEMENTS: [(&str, &str); 13] = [
        ("`", "``"),
        ("\u{7}", "`a"),
        ("\u{8}", "`b"),
        ("\u{c}", "^f"),
        ("\r", "`r"),
        ("\n", "`n"),
        ("\t", "^t"),
        ("\u{b}", "^v"),
        ("#", "`#"),
        ("'", "`'"),
        ("\"", "`\""),
        ("$", "`$"),
        ("``e", "`e"),
    ];
    REPLACEMENTS
        .iter()
        .fold(command.to_string(), |acc, (from, to)| acc.replace(from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unix_script() {
        let script = compile_unix(&["go build -o server".to_string()]);
        assert_eq!(
            script,
            "\nset -e\n\n\nprintf '+ go build \\055o server\\n'\n\ngo build -o server\n"
        );
    }

    #[test]
    fn test_multibyte_characters_are_octal_escaped() {
        assert_eq!(encode_command_line("echo é"), "echo \\303\\251");
        assert_eq!(encode_command_line("a'b"), "a\\047b");
    }

    #[test]
    fn test_windows_script() {
        let script = compile_windows(&["echo $HOME".to_string()]);
        assert_eq!(
            script,
            "& {\r\n$ErrorActionPreference=\"Stop\";\r\n\"+ echo `$HOME\"\r\necho $HOME\r\n\
             if(!$?) { Exit &{if($LASTEXITCODE) {$LASTEXITCODE} else {1}} }\r\n}\r\n\r\n"
        );
    }

    #[test]
    fn test_compile_selects_by_os() {
        let commands = vec!["true".to_string()];
        assert_eq!(compile("linux", &commands).unwrap().launcher[0], "/bin/sh");
        assert_eq!(compile("macos", &commands).unwrap().launcher[0], "/bin/sh");
        assert_eq!(
            compile("windows", &commands).unwrap().launcher[0],
            "powershell.exe"
        );
        assert!(matches!(
            compile("plan9", &commands),
            Err(Error::UnsupportedOs(os)) if os == "plan9"
        ));
    }

    #[test]
    fn test_launcher_reads_script_from_env() {
        let compiled = compile("linux", &["true".to_string()]).unwrap();
        assert_eq!(
            compiled.launcher[2],
            "printf '%s' \"$RUNNER_SCRIPT\" | /bin/sh"
        );
        assert!(compiled.env().starts_with("RUNNER_SCRIPT=\nset -e"));
    }
}

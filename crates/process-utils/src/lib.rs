//! Child process construction helpers shared across the workspace.
//!
//! Every external program is launched from an argument vector. Nothing here
//! goes through a shell, so user supplied values can never be reinterpreted
//! as shell syntax.

#[cfg(feature = "tokio")]
use std::ffi::OsStr;

#[cfg(all(windows, feature = "tokio"))]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
#[cfg(feature = "tokio")]
trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// How the standard streams of a spawned child are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioLayout {
    /// stdin closed, stdout and stderr piped. Producers.
    Producer,
    /// stdin, stdout and stderr all piped. Filters in the middle of a chain.
    Filter,
    /// stdin closed, stdout discarded, stderr piped. Processes writing to disk.
    Sink,
}

/// Create a `tokio::process::Command` ready for supervised use.
///
/// The command has `kill_on_drop` set so an abandoned handle never leaves an
/// orphan behind, and the requested stdio layout applied.
#[cfg(feature = "tokio")]
pub fn supervised_command<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    layout: StdioLayout,
) -> tokio::process::Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    use std::process::Stdio;

    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.args(args).kill_on_drop(true);

    match layout {
        StdioLayout::Producer => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        StdioLayout::Filter => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        StdioLayout::Sink => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
        }
    }
    cmd
}

/// Render an argument vector for log output.
///
/// Arguments containing whitespace or quotes are wrapped in single quotes.
/// The result is for humans only and is never executed.
pub fn display_command<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::from(program);
    for arg in args {
        let arg = arg.as_ref();
        out.push(' ');
        if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
            out.push('\'');
            out.push_str(&arg.replace('\'', "'\\''"));
            out.push('\'');
        } else {
            out.push_str(arg);
        }
    }
    out
}

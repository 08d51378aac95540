//! Invocation of privileged external tools (`chattr`, `xfs_quota`, `setquota`, ...).
//!
//! Everything that shells out goes through [`CommandRunner`] so the quota driver can
//! be exercised without root privileges or a quota-enabled filesystem.

use std::fmt;
use std::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A command that could not be spawned or exited unsuccessfully.
///
/// Carries the full invocation context so callers can surface it unchanged.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "`{command}` failed, stdout: ({stdout}), stderr: ({stderr}), exit: ({})",
        exit_code(.code)
    )]
    Failed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Returns the captured stderr, empty if the command never ran.
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Spawn { .. } => "",
            CommandError::Failed { stderr, .. } => stderr,
        }
    }
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_owned(),
    }
}

/// Runs external programs to completion and captures their output.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `program` with `args` and returns its captured output.
    ///
    /// A non-zero exit code is *not* an error at this level; see [`run_checked`].
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Renders a program and its arguments the way a shell user would type them.
pub fn display_command(program: &str, args: &[&str]) -> String {
    let mut out = String::from(program);
    for arg in args {
        out.push(' ');
        if arg.contains(char::is_whitespace) {
            out.push('\'');
            out.push_str(arg);
            out.push('\'');
        } else {
            out.push_str(arg);
        }
    }
    out
}

/// Runs a command and turns a spawn failure or non-zero exit into a [`CommandError`].
///
/// The outcome is logged at info level either way.
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput, CommandError> {
    let command = display_command(program, args);
    let output = runner
        .run(program, args)
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;

    log::info!(
        "ran `{}`, stdout: ({}), stderr: ({}), exit: ({})",
        command,
        output.stdout.trim(),
        output.stderr.trim(),
        exit_code(&output.code)
    );

    if !output.success() {
        return Err(CommandError::Failed {
            command,
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    Ok(output)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner shared by the quota and repair tests.

    use std::collections::{BTreeMap, HashSet};
    use std::path::Path;
    use std::sync::Mutex;

    use super::{CommandOutput, CommandRunner};

    /// Emulates the quota tools against an in-memory table of project ids.
    #[derive(Debug, Default)]
    pub struct FakeQuotaTools {
        pub project_ids: Mutex<BTreeMap<String, u32>>,
        pub repquota_ids: Vec<u32>,
        pub calls: Mutex<Vec<String>>,
        pub failing: HashSet<&'static str>,
        pub quotaon_stderr: Option<&'static str>,
    }

    impl FakeQuotaTools {
        pub fn stamp(&self, path: &str, id: u32) {
            self.project_ids.lock().unwrap().insert(path.to_owned(), id);
        }

        pub fn id_of(&self, path: &str) -> Option<u32> {
            self.project_ids.lock().unwrap().get(path).copied()
        }

        pub fn calls_to(&self, program: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.split(' ').next() == Some(program))
                .cloned()
                .collect()
        }

        fn ok(stdout: String) -> CommandOutput {
            CommandOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            }
        }

        fn fail(stderr: &str) -> CommandOutput {
            CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_owned(),
            }
        }
    }

    impl CommandRunner for FakeQuotaTools {
        fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(super::display_command(program, args));

            if self.failing.contains(program) {
                return Ok(Self::fail("operation not permitted"));
            }

            let out = match (program, args) {
                ("quotaon", _) => match self.quotaon_stderr {
                    Some(stderr) => Self::fail(stderr),
                    None => Self::ok(String::new()),
                },
                ("chattr", ["-p", id, "+P", path]) | ("chattr", ["-R", "-p", id, "+P", path]) => {
                    self.stamp(path, id.parse().unwrap());
                    Self::ok(String::new())
                }
                ("xfs_quota", ["-x", "-c", cmd]) => {
                    let parts: Vec<&str> = cmd.split_whitespace().collect();
                    if let ["project", "-s", "-p", path, id] = parts.as_slice() {
                        self.stamp(path, id.parse().unwrap());
                    }
                    Self::ok(String::new())
                }
                ("lsattr", ["-p", parent]) => {
                    let ids = self.project_ids.lock().unwrap();
                    let stdout = ids
                        .iter()
                        .filter(|(p, _)| Path::new(p).parent() == Some(Path::new(parent)))
                        .map(|(p, id)| format!("{id} --------------e---P {p}\n"))
                        .collect();
                    Self::ok(stdout)
                }
                ("repquota", _) => {
                    let mut stdout = String::from(
                        "*** Report for project quotas on device /dev/sdb1\n\
                         Block grace time: 7days; Inode grace time: 7days\n\
                         #0        --       4       0       0              2     0     0\n",
                    );
                    for id in &self.repquota_ids {
                        stdout.push_str(&format!("#{id}  --  0  0  0  1  0  0\n"));
                    }
                    Self::ok(stdout)
                }
                _ => Self::ok(String::new()),
            };
            Ok(out)
        }
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Error, Result};

/// Disk usage measured from inside a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes used.
    pub size: u64,
    pub used_percent: u64,
}

/// Measures the disk usage of a container's root filesystem from inside its
/// namespaces.
pub trait UsageProber: Send + Sync {
    fn probe(
        &self,
        pid: u32,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<DiskUsage>> + Send;
}

/// Runs `df -k /` in the target's namespaces through `nsenter`.
#[derive(Debug, Clone)]
pub struct NsenterProber {
    nsenter: PathBuf,
    df: PathBuf,
    timeout: Duration,
}

impl NsenterProber {
    pub fn new(nsenter: impl Into<PathBuf>, df: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            nsenter: nsenter.into(),
            df: df.into(),
            timeout,
        }
    }
}

impl UsageProber for NsenterProber {
    /// # Errors
    ///
    /// - [`Error::NotFound`] if `nsenter`, the process or `df` inside it is missing.
    /// - [`Error::Timeout`] or [`Error::Cancelled`]; the child is killed in both cases.
    /// - [`Error::ProbeFailed`] or [`Error::DfOutput`] for any other failure.
    async fn probe(&self, pid: u32, cancel: &CancellationToken) -> Result<DiskUsage> {
        let pid = pid.to_string();
        let mut cmd = tokio::process::Command::new(&self.nsenter);
        cmd.args(["--target", &pid, "--mount", "--uts", "--ipc", "--net", "--pid"])
            .arg(&self.df)
            .args(["-k", "/"])
            .kill_on_drop(true);
        let command = format!("{:?}", cmd.as_std());

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, cmd.output()) => match res {
                Err(_) => {
                    return Err(Error::Timeout {
                        command,
                        timeout: self.timeout,
                    })
                }
                Ok(Err(source)) if source.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::NotFound(format!("failed to exec {command}: {source}")))
                }
                Ok(Err(source)) => return Err(Error::Spawn { command, source }),
                Ok(Ok(output)) => output,
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let combined = format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr));
            if combined.contains("No such file or directory") {
                return Err(Error::NotFound(format!(
                    "failed to exec {command}:\n{combined}"
                )));
            }
            return Err(Error::ProbeFailed {
                command,
                code: output.status.code(),
                output: combined,
            });
        }

        log::debug!("{}:\n{}", command, stdout.trim());
        parse_df_output(&stdout)
    }
}

/// Parses `df -k` output for a single filesystem.
///
/// Columns are located by header name since `df` versions differ in layout:
///
/// ```text
/// Filesystem     1K-blocks    Used Available Use% Mounted on
/// overlay         10485760 1048576   9437184  10% /
/// ```
///
/// # Errors
///
/// Returns [`Error::DfOutput`] unless the output is exactly a header and one data
/// line with parseable `Used` and `Use%` columns, the latter within 0..=100.
pub fn parse_df_output(output: &str) -> Result<DiskUsage> {
    let output = output.trim();
    let invalid = |reason: &str| Error::DfOutput {
        reason: reason.to_owned(),
        output: output.to_owned(),
    };

    let lines: Vec<&str> = output.lines().collect();
    let [header, data] = lines.as_slice() else {
        return Err(invalid("df should return header and data"));
    };

    let header = header.trim();
    if header.is_empty() {
        return Err(invalid("df returned no header"));
    }
    let columns: HashMap<String, usize> = header
        .split_whitespace()
        .enumerate()
        .map(|(idx, key)| (key.to_lowercase(), idx))
        .collect();

    let used_idx = *columns
        .get("used")
        .ok_or_else(|| invalid("header without used column"))?;
    let percent_idx = *columns
        .get("use%")
        .ok_or_else(|| invalid("header without use% column"))?;

    let values: Vec<&str> = data.split_whitespace().collect();

    let used: u64 = values
        .get(used_idx)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid("failed to parse used"))?;
    let size = used
        .checked_mul(1024)
        .ok_or_else(|| invalid("used overflows"))?;

    let percent: i64 = values
        .get(percent_idx)
        .and_then(|v| v.strip_suffix('%'))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid("failed to parse used percent"))?;
    if !(0..=100).contains(&percent) {
        return Err(invalid("invalid percent"));
    }

    Ok(DiskUsage {
        size,
        used_percent: percent as u64,
    })
}

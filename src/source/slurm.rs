//! Slurm accounting adapter driving `sacctmgr` and `sshare`.
//!
//! Usage and limits are TRES billing minutes. Limits live in the
//! association's `GrpTRESMins=billing=N`; usage comes from `sshare`'s
//! `GrpTRESRaw` column for the account row.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::{SourceError, SourceResult, UsageSource};

#[derive(Clone, Debug)]
pub struct SlurmConfig {
    pub sacctmgr: String,
    pub sshare: String,
    /// Hard bound on one command; the child is killed when it elapses.
    pub command_timeout: Duration,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sacctmgr: "sacctmgr".into(),
            sshare: "sshare".into(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SlurmSource {
    config: SlurmConfig,
}

impl SlurmSource {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    /// Run a command and return its stdout, classifying a non-zero exit.
    async fn run(
        &self,
        cluster: &str,
        account: Option<&str>,
        program: &str,
        args: &[String],
    ) -> SourceResult<String> {
        let output = self.spawn(cluster, program, args).await?;
        if !output.status.success() {
            return Err(exit_failure(
                cluster,
                account,
                &command_line(program, args),
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn spawn(
        &self,
        cluster: &str,
        program: &str,
        args: &[String],
    ) -> SourceResult<std::process::Output> {
        tracing::debug!(
            cluster,
            command = %command_line(program, args),
            "Running accounting command"
        );

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Io(format!("{}: {}", program, e)))?;

        tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| SourceError::Timeout(self.config.command_timeout))?
            .map_err(|e| SourceError::Io(format!("{}: {}", program, e)))
    }
}

#[async_trait::async_trait]
impl UsageSource for SlurmSource {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn list_accounts(&self, cluster: &str) -> SourceResult<BTreeSet<String>> {
        validate_name("cluster", cluster)?;
        let args = vec![
            "show".into(),
            "-nP".into(),
            "account".into(),
            "withassoc".into(),
            "where".into(),
            "parents=root".into(),
            format!("cluster={cluster}"),
            "format=Account".into(),
        ];
        let stdout = self.run(cluster, None, &self.config.sacctmgr, &args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn get_usage(&self, cluster: &str, account: &str) -> SourceResult<u64> {
        validate_name("cluster", cluster)?;
        validate_name("account", account)?;
        let args = vec![
            "-nP".into(),
            "-A".into(),
            account.into(),
            "-M".into(),
            cluster.into(),
            "--format=GrpTRESRaw".into(),
        ];
        let stdout = self.run(cluster, Some(account), &self.config.sshare, &args).await?;

        // First row is the account itself; per-user rows follow.
        let Some(row) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Err(not_found(cluster, account));
        };
        billing_or_zero(&self.config.sshare, row)
    }

    async fn get_limit(&self, cluster: &str, account: &str) -> SourceResult<u64> {
        validate_name("cluster", cluster)?;
        validate_name("account", account)?;
        let args = vec![
            "show".into(),
            "-nP".into(),
            "association".into(),
            "where".into(),
            format!("account={account}"),
            format!("cluster={cluster}"),
            "format=GrpTRESMins".into(),
        ];
        let stdout = self.run(cluster, Some(account), &self.config.sacctmgr, &args).await?;

        let mut rows = stdout.lines().map(str::trim).peekable();
        if rows.peek().is_none() {
            return Err(not_found(cluster, account));
        }
        // An association with no billing cap reports an empty column.
        match rows.find(|row| !row.is_empty()) {
            Some(row) => billing_or_zero(&self.config.sacctmgr, row),
            None => Ok(0),
        }
    }

    async fn set_limit(&self, cluster: &str, account: &str, limit: u64) -> SourceResult<()> {
        validate_name("cluster", cluster)?;
        validate_name("account", account)?;
        let args = vec![
            "modify".into(),
            "-i".into(),
            "account".into(),
            "where".into(),
            format!("account={account}"),
            format!("cluster={cluster}"),
            "set".into(),
            format!("GrpTRESMins=billing={limit}"),
        ];
        let output = self.spawn(cluster, &self.config.sacctmgr, &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || reports_no_change(&stdout, &stderr) {
            tracing::debug!(cluster, account, limit, "Limit written");
            return Ok(());
        }
        Err(exit_failure(
            cluster,
            Some(account),
            &command_line(&self.config.sacctmgr, &args),
            output.status.code(),
            &stderr,
        ))
    }
}

/// Extract the `billing=N` entry from a TRES list such as
/// `cpu=100,mem=2000,billing=350`.
pub fn parse_billing(tres: &str) -> Option<u64> {
    billing_entry(tres)?.parse().ok()
}

fn billing_entry(tres: &str) -> Option<&str> {
    tres.split(',')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == "billing")
        .map(|(_, value)| value.trim())
}

/// `billing=N` from a row; a row without a billing entry means zero.
fn billing_or_zero(command: &str, row: &str) -> SourceResult<u64> {
    match billing_entry(row) {
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| SourceError::Parse {
            command: command.to_string(),
            output: row.to_string(),
        }),
    }
}

fn command_line(program: &str, args: &[String]) -> String {
    format!("{} {}", program, args.join(" "))
}

fn exit_failure(
    cluster: &str,
    account: Option<&str>,
    command_line: &str,
    code: Option<i32>,
    stderr: &str,
) -> SourceError {
    let stderr = stderr.trim();
    if let Some(account) = account
        && mentions_missing_account(stderr)
    {
        return not_found(cluster, account);
    }
    SourceError::Unavailable {
        cluster: cluster.to_string(),
        message: format!("`{}` exited with {:?}: {}", command_line, code, stderr),
    }
}

fn mentions_missing_account(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["does not exist", "no associations", "invalid account"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

/// `sacctmgr modify` answers "Nothing modified", sometimes with a non-zero
/// exit, when the association already carries the requested value.
fn reports_no_change(stdout: &str, stderr: &str) -> bool {
    [stdout, stderr]
        .iter()
        .any(|out| out.to_ascii_lowercase().contains("nothing modified"))
}

fn not_found(cluster: &str, account: &str) -> SourceError {
    SourceError::AccountNotFound {
        cluster: cluster.to_string(),
        account: account.to_string(),
    }
}

/// Names are passed as argv entries, but `sacctmgr` also parses them as
/// `key=value` filters, so only a conservative alphabet is accepted.
fn validate_name(kind: &str, name: &str) -> SourceResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SourceError::Parse {
            command: format!("{kind} name"),
            output: name.to_string(),
        })
    }
}

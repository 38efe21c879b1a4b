use std::{
    cmp::Ordering,
    collections::HashSet,
    future::Future,
    time::{Duration, Instant, SystemTime},
};

use anyhow::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[cfg(feature = "ssh")]
use async_ssh2_tokio::Client;

use crate::{parse_slurm_duration, JobState, SLURM_DATE_FORMAT};

// https://slurm.schedmd.com/sacct.html#OPT_format
pub(crate) const SACCT_FORMAT_STR: &str = "jobid,jobname,alloccpus,elapsed,start,end,state";
const SACCT_COLUMNS: usize = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Struct for parsed output row of `sacct` command
///
/// Contains the accounting information about one job allocation
pub struct SacctRow {
    /// "`JobID`"
    ///
    /// 49848561 or `49869434_2` for array tasks
    pub job_id: String,
    /// Array task index, if the job is part of a job array
    pub array_task: Option<String>,
    /// "`JobName`"
    pub name: String,
    /// "`AllocCPUS`"
    pub alloc_cpus: usize,
    /// "Elapsed"
    pub elapsed: Option<Duration>,
    /// "Start"
    pub start: Option<NaiveDateTime>,
    /// "End"
    pub end: Option<NaiveDateTime>,
    /// "State"
    pub state: JobState,
}

fn parse_sacct_time(s: &str) -> Result<Option<NaiveDateTime>, Error> {
    match s {
        "" | "Unknown" | "None" | "N/A" => Ok(None),
        s => Ok(Some(NaiveDateTime::parse_from_str(s, SLURM_DATE_FORMAT)?)),
    }
}

impl SacctRow {
    fn parse_from_strs(vals: &[&str]) -> Result<Self, Error> {
        if vals.len() < SACCT_COLUMNS {
            return Err(Error::msg(format!(
                "Invalid length of values: expected {SACCT_COLUMNS}, got {}.",
                vals.len()
            )));
        }
        if vals[0].is_empty() {
            return Err(Error::msg("Missing job id."));
        }
        // JobName is the only free-text column, so surplus delimiters belong to it
        let name_end = vals.len() - (SACCT_COLUMNS - 2);
        let rest = &vals[name_end..];
        Ok(Self {
            job_id: vals[0].to_string(),
            array_task: vals[0].split_once('_').map(|(_, task)| task.to_string()),
            name: vals[1..name_end].join("|"),
            alloc_cpus: rest[0].parse()?,
            elapsed: match rest[1] {
                "" | "INVALID" => None,
                s => parse_slurm_duration(s)
                    .inspect_err(|err| warn!("Elapsed {s:?} failed to parse: {err}"))
                    .ok(),
            },
            start: parse_sacct_time(rest[2])?,
            end: parse_sacct_time(rest[3])?,
            state: rest[4].parse()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
/// Time window passed to `sacct -S`
pub enum SacctWindow {
    #[default]
    /// No start time, `sacct` then reports jobs since midnight
    Default,
    /// Jobs since 00:00 today
    Today,
    /// Jobs since the given (local) time
    Since(NaiveDateTime),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
/// Parameter for `sacct` extraction, specifying which jobs to include
pub struct SacctQuery {
    /// Only include jobs of this user (`-u`); `sacct` defaults to the calling user
    pub user: Option<String>,
    /// Which time window to query
    pub window: SacctWindow,
}

impl SacctQuery {
    /// The shell command line for this query
    pub fn to_command(&self) -> String {
        let mut cmd = format!("sacct -n -P -X --format={SACCT_FORMAT_STR}");
        if let Some(user) = &self.user {
            cmd.push_str(&format!(" -u {}", shell_quote(user)));
        }
        match &self.window {
            SacctWindow::Default => {}
            SacctWindow::Today => cmd.push_str(" -S 00:00"),
            SacctWindow::Since(time) => {
                cmd.push_str(&format!(" -S {}", time.format(SLURM_DATE_FORMAT)))
            }
        }
        cmd
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Parse the `|`-delimited output of `sacct -n -P`
///
/// Job steps and rows that fail to parse are skipped.
pub fn parse_sacct_output(output: &str) -> Vec<SacctRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            if line.is_empty() {
                return None;
            }
            let vals = line.split('|').collect::<Vec<_>>();
            if vals[0].contains('.') {
                debug!("Skipping job step {:?}", vals[0]);
                return None;
            }
            match SacctRow::parse_from_strs(&vals) {
                Ok(row) => Some(row),
                Err(err) => {
                    warn!("{:?} for {:?}", err, &line);
                    None
                }
            }
        })
        .collect()
}

/// Get sacct results using the provided `execute_cmd` function
///
/// The returned time is taken right before `sacct` runs.
pub async fn get_sacct_res<F, Fut>(
    query: &SacctQuery,
    execute_cmd: F,
) -> Result<(DateTime<Utc>, Vec<SacctRow>), Error>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<String, Error>>,
{
    let cmd = query.to_command();
    debug!("Running {cmd}");
    let time: DateTime<Utc> = SystemTime::now().into();
    let result = execute_cmd(cmd).await?;
    Ok((time, parse_sacct_output(&result)))
}

/// Run and parse `sacct` result locally (i.e., not via SSH)
pub async fn get_sacct_res_locally(
    query: &SacctQuery,
) -> Result<(DateTime<Utc>, Vec<SacctRow>), Error> {
    get_sacct_res(query, |cmd_s| async move {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&cmd_s);
        let d = Instant::now();
        let out = cmd.output().await?;
        debug!("Running sacct took {:?}", d.elapsed());
        if !out.status.success() {
            return Err(Error::msg(format!(
                "sacct failed ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8(out.stdout)?)
    })
    .await
}

#[cfg(feature = "ssh")]
/// Run and parse `sacct` result over SSH
pub async fn get_sacct_res_ssh(
    client: &Client,
    query: &SacctQuery,
) -> Result<(DateTime<Utc>, Vec<SacctRow>), Error> {
    get_sacct_res(query, |cmd| async move {
        let r = client.execute(&cmd).await?;
        if r.exit_status != 0 {
            return Err(Error::msg(format!(
                "sacct failed on remote host (exit status {}): {}",
                r.exit_status,
                r.stderr.trim()
            )));
        }
        Ok(r.stdout)
    })
    .await
}

/// Execute `sacct` and keep only finished jobs that are not in `known_ids`
///
/// New rows are sorted by start time; jobs without a start time come last.
pub async fn sacct_diff<F, Fut>(
    get_sacct: F,
    known_ids: &HashSet<String>,
) -> Result<(DateTime<Utc>, Vec<SacctRow>), Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(DateTime<Utc>, Vec<SacctRow>), Error>>,
{
    let (time, rows) = get_sacct().await?;
    let total = rows.len();
    let mut seen = HashSet::new();
    let mut new_rows = rows
        .into_iter()
        .filter(|row| row.state.is_finished())
        .filter(|row| !known_ids.contains(&row.job_id))
        .filter(|row| seen.insert(row.job_id.clone()))
        .collect::<Vec<_>>();
    new_rows.sort_by(|a, b| {
        match (&a.start, &b.start) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.job_id.cmp(&b.job_id))
    });
    debug!("{} of {total} sacct rows are newly finished", new_rows.len());
    Ok((time, new_rows))
}

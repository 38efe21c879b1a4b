#![warn(
    clippy::doc_markdown,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility,
    missing_docs
)]
#![doc = include_str!("../README.md")]

use std::{fmt, str::FromStr, time::Duration};

use anyhow::Error;
use log::warn;
use serde::{Deserialize, Serialize};

#[cfg(feature = "ssh")]
use async_ssh2_tokio::client::{AuthMethod, ServerCheckMethod};
#[cfg(feature = "ssh")]
const SERVER_CHECK_METHOD: ServerCheckMethod = ServerCheckMethod::DefaultKnownHostsFile;
#[cfg(feature = "ssh")]
pub use async_ssh2_tokio::Client;

/// Module for extracting data from SLURM systems
/// e.g., about recently finished jobs
pub mod data_extraction;

/// Module for the on-disk bookkeeping of already reported jobs
pub mod ledger;

/// Module for printing finished jobs as a colored table
pub mod display;

#[doc(inline)]
pub use data_extraction::{get_sacct_res, get_sacct_res_locally, sacct_diff};

#[cfg(feature = "ssh")]
#[doc(inline)]
pub use data_extraction::get_sacct_res_ssh;

pub use data_extraction::{SacctQuery, SacctRow, SacctWindow};
pub use ledger::JobLedger;

/// Timestamp format used by `sacct` (and by the ledger for the last poll)
pub(crate) const SLURM_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn checked_secs(days: u64, hours: u64, mins: u64, secs: u64) -> Option<u64> {
    days.checked_mul(24)?
        .checked_add(hours)?
        .checked_mul(60)?
        .checked_add(mins)?
        .checked_mul(60)?
        .checked_add(secs)
}

/// Parse a SLURM duration (`days-hours:minutes:seconds` and its shorter forms)
///
/// Accepted: `D-H:M:S`, `D-H:M`, `D-H`, `H:M:S`, `M:S` and bare minutes.
pub fn parse_slurm_duration(s: &str) -> Result<Duration, Error> {
    let (days_part, hms_part) = match s.split_once('-') {
        Some((days, rest)) => (Some(days), rest),
        None => (None, s),
    };
    let days: u64 = match days_part {
        Some(days) => days.parse()?,
        None => 0,
    };
    let hms = hms_part
        .split(':')
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>()?;

    let (hours, mins, secs) = match (days_part.is_some(), hms.as_slice()) {
        (_, [hours, mins, secs]) => (*hours, *mins, *secs),
        // with a days part, two fields are hours:minutes
        (true, [hours, mins]) => (*hours, *mins, 0),
        (false, [mins, secs]) => (0, *mins, *secs),
        (true, [hours]) => (*hours, 0, 0),
        (false, [mins]) => (0, *mins, 0),
        _ => {
            return Err(Error::msg(format!(
                "Invalid duration format: got {} splits for {s:?}.",
                hms.len()
            )))
        }
    };

    checked_secs(days, hours, mins, secs)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::msg(format!("Duration {s:?} is out of range.")))
}

/// Format a duration the way `sacct` prints elapsed time
///
/// `HH:MM:SS`, prefixed with `D-` once at least one day has passed.
pub fn format_slurm_duration(dur: &Duration) -> String {
    let total = dur.as_secs();
    let days = total / (60 * 60 * 24);
    let rest = total % (60 * 60 * 24);
    let (hours, mins, secs) = (rest / 3600, rest % 3600 / 60, rest % 60);
    if days > 0 {
        format!("{days}-{hours:02}:{mins:02}:{secs:02}")
    } else {
        format!("{hours:02}:{mins:02}:{secs:02}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
/// State of a SLURM job (according to `sacct`)
///
/// Documentation taken from <https://slurm.schedmd.com/sacct.html#SECTION_JOB-STATE-CODES>.
pub enum JobState {
    /// Job currently has an allocation.
    RUNNING,
    /// Job is awaiting resource allocation.
    PENDING,
    /// Job is in the process of completing. Some processes on some nodes may still be active.
    COMPLETING,
    /// Job has terminated all processes on all nodes with an exit code of zero.
    COMPLETED,
    /// Job was explicitly cancelled by the user or system administrator. The job may or may not have been initiated.
    CANCELLED,
    /// Job terminated with non-zero exit code or other failure condition.
    FAILED,
    /// Job terminated upon reaching its time limit.
    TIMEOUT,
    /// Job experienced out of memory error.
    #[allow(non_camel_case_types)]
    OUT_OF_MEMORY,
    /// Job terminated due to failure of one or more allocated nodes.
    #[allow(non_camel_case_types)]
    NODE_FAIL,
    /// Job terminated due to preemption.
    PREEMPTED,
    /// Job has an allocation, but execution has been suspended.
    SUSPENDED,
    /// Job was requeued.
    REQUEUED,
    /// Job terminated due to launch failure.
    #[allow(non_camel_case_types)]
    BOOT_FAIL,
    /// Job terminated on deadline.
    DEADLINE,
    /// Other Job state, specifying the concrete job state as a [`String`]
    OTHER(String),
}

impl JobState {
    /// The state as spelled by SLURM
    pub fn as_str(&self) -> &str {
        match self {
            Self::RUNNING => "RUNNING",
            Self::PENDING => "PENDING",
            Self::COMPLETING => "COMPLETING",
            Self::COMPLETED => "COMPLETED",
            Self::CANCELLED => "CANCELLED",
            Self::FAILED => "FAILED",
            Self::TIMEOUT => "TIMEOUT",
            Self::OUT_OF_MEMORY => "OUT_OF_MEMORY",
            Self::NODE_FAIL => "NODE_FAIL",
            Self::PREEMPTED => "PREEMPTED",
            Self::SUSPENDED => "SUSPENDED",
            Self::REQUEUED => "REQUEUED",
            Self::BOOT_FAIL => "BOOT_FAIL",
            Self::DEADLINE => "DEADLINE",
            Self::OTHER(s) => s,
        }
    }

    /// Whether the job is done for good, i.e., neither queued nor still holding its allocation
    pub fn is_finished(&self) -> bool {
        !matches!(
            self,
            Self::RUNNING | Self::PENDING | Self::COMPLETING | Self::SUSPENDED | Self::REQUEUED
        )
    }

    /// Whether the job finished successfully
    pub fn is_success(&self) -> bool {
        matches!(self, Self::COMPLETED)
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // sacct prints e.g. `CANCELLED by 1234`, and appends `+` when the column is truncated
        let code = s
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+');
        match code {
            "RUNNING" => Ok(Self::RUNNING),
            "PENDING" => Ok(Self::PENDING),
            "COMPLETING" => Ok(Self::COMPLETING),
            "COMPLETED" => Ok(Self::COMPLETED),
            "CANCELLED" => Ok(Self::CANCELLED),
            "FAILED" => Ok(Self::FAILED),
            "TIMEOUT" => Ok(Self::TIMEOUT),
            "OUT_OF_MEMORY" | "OUT_OF_ME" => Ok(Self::OUT_OF_MEMORY),
            "NODE_FAIL" => Ok(Self::NODE_FAIL),
            "PREEMPTED" => Ok(Self::PREEMPTED),
            "SUSPENDED" => Ok(Self::SUSPENDED),
            "REQUEUED" => Ok(Self::REQUEUED),
            "BOOT_FAIL" => Ok(Self::BOOT_FAIL),
            "DEADLINE" => Ok(Self::DEADLINE),
            s => {
                warn!("Unhandled job state: {s} detected!");
                Ok(Self::OTHER(s.to_string()))
            }
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "ssh")]
#[derive(Debug, Clone, Serialize, Deserialize)]
/// A connection config for running `sacct` on a login node over SSH
pub struct ConnectionConfig {
    /// The host (hostname and port) to connect to
    pub host: (String, u16),
    /// The username to use for connecting
    pub username: String,
    /// The authentication configuration
    pub auth: ConnectionAuth,
}

#[cfg(feature = "ssh")]
impl ConnectionConfig {
    /// Create a new connection configuration using the given parameters
    pub fn new(host: (String, u16), username: String, auth: ConnectionAuth) -> Self {
        ConnectionConfig {
            host,
            username,
            auth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
#[cfg(feature = "ssh")]
/// Authentication Settings for a SSH Connection ([`ConnectionConfig`])
pub enum ConnectionAuth {
    #[serde(rename = "password")]
    /// Login via password
    Password {
        /// Password
        password: String,
    },
    #[serde(rename = "ssh-key")]
    /// Login via an SSH key
    SSHKey {
        /// Path to where the SSH key is stored
        path: String,
        /// Optional passphrase for the SSH key
        passphrase: Option<String>,
    },
}

#[cfg(feature = "ssh")]
impl From<&ConnectionAuth> for AuthMethod {
    fn from(val: &ConnectionAuth) -> Self {
        match val {
            ConnectionAuth::Password { password } => AuthMethod::with_password(password),
            ConnectionAuth::SSHKey { path, passphrase } => {
                AuthMethod::with_key_file(path, passphrase.as_deref())
            }
        }
    }
}

#[cfg(feature = "ssh")]
/// Login via SSH using the specified configuration
pub async fn login_with_cfg(cfg: &ConnectionConfig) -> Result<Client, Error> {
    let auth_method = (&cfg.auth).into();
    let client = Client::connect(
        cfg.host.clone(),
        &cfg.username,
        auth_method,
        SERVER_CHECK_METHOD,
    )
    .await?;
    Ok(client)
}

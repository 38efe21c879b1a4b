use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use log::debug;

use crate::{SacctRow, SLURM_DATE_FORMAT};

/// File holding reported job IDs, followed by the last poll time
pub const PREV_JOBS_FILE: &str = "prev_job";
/// Append-only `jobid;start;state` log
pub const STATS_FILE: &str = "stats";

const STATS_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
/// Flat-file record of which jobs were already reported and when we last polled
pub struct JobLedger {
    dir: PathBuf,
    /// In file order
    job_ids: Vec<String>,
    known: HashSet<String>,
    last_session: Option<NaiveDateTime>,
    /// `prev_job` exists and does not end with a newline
    needs_newline: bool,
}

impl JobLedger {
    /// Load the ledger kept in `dir`
    ///
    /// A missing directory or file is an empty ledger. Lines holding a
    /// timestamp mark a poll (the last one counts), `HH:MM` lines are
    /// ignored and every other line is a job ID.
    pub fn open(dir: &Path) -> Result<Self, Error> {
        let mut ledger = Self {
            dir: dir.to_path_buf(),
            job_ids: Vec::new(),
            known: HashSet::new(),
            last_session: None,
            needs_newline: false,
        };
        let path = ledger.prev_jobs_path();
        if !path.is_file() {
            debug!("No ledger at {}, starting fresh", path.display());
            return Ok(ledger);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        ledger.needs_newline = !content.is_empty() && !content.ends_with('\n');

        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Ok(time) = NaiveDateTime::parse_from_str(line, SLURM_DATE_FORMAT) {
                ledger.last_session = Some(time);
            } else if NaiveTime::parse_from_str(line, "%H:%M").is_ok() {
                continue;
            } else if ledger.known.insert(line.to_string()) {
                ledger.job_ids.push(line.to_string());
            }
        }
        debug!(
            "Loaded {} known jobs, last session {:?}",
            ledger.job_ids.len(),
            ledger.last_session
        );
        Ok(ledger)
    }

    /// Path of the `prev_job` file
    pub fn prev_jobs_path(&self) -> PathBuf {
        self.dir.join(PREV_JOBS_FILE)
    }

    /// Path of the `stats` file
    pub fn stats_path(&self) -> PathBuf {
        self.dir.join(STATS_FILE)
    }

    /// Whether the job was reported before
    pub fn is_known(&self, job_id: &str) -> bool {
        self.known.contains(job_id)
    }

    /// All reported job IDs
    pub fn known_ids(&self) -> &HashSet<String> {
        &self.known
    }

    /// Time of the last poll, if any
    pub fn last_session(&self) -> Option<NaiveDateTime> {
        self.last_session
    }

    /// Append newly reported jobs to `prev_job` and `stats`
    ///
    /// Jobs that are already known are skipped.
    pub fn record(&mut self, rows: &[SacctRow]) -> Result<(), Error> {
        if rows.iter().all(|row| self.known.contains(&row.job_id)) {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create {}", self.dir.display()))?;
        let mut prev = BufWriter::new(append_to(&self.prev_jobs_path())?);
        let mut stats = BufWriter::new(append_to(&self.stats_path())?);
        if self.needs_newline {
            writeln!(prev)?;
            self.needs_newline = false;
        }

        for row in rows {
            if !self.known.insert(row.job_id.clone()) {
                continue;
            }
            self.job_ids.push(row.job_id.clone());
            let start = row
                .start
                .map(|s| s.format(STATS_DATE_FORMAT).to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            writeln!(prev, "{}", row.job_id)?;
            writeln!(stats, "{};{};{}", row.job_id, start, row.state)?;
        }
        prev.flush()?;
        stats.flush()?;
        Ok(())
    }

    /// Store `at` as the last poll time
    ///
    /// Rewrites `prev_job` as all known IDs followed by a single timestamp.
    pub fn save_session(&mut self, at: NaiveDateTime) -> Result<(), Error> {
        let at = at.with_nanosecond(0).unwrap_or(at);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create {}", self.dir.display()))?;
        let path = self.prev_jobs_path();
        let tmp_path = path.with_extension("tmp");
        {
            let mut out = BufWriter::new(
                File::create(&tmp_path)
                    .with_context(|| format!("Could not create {}", tmp_path.display()))?,
            );
            for id in &self.job_ids {
                writeln!(out, "{id}")?;
            }
            writeln!(out, "{}", at.format(SLURM_DATE_FORMAT))?;
            out.flush()?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Could not replace {}", path.display()))?;
        self.last_session = Some(at);
        self.needs_newline = false;
        Ok(())
    }
}

fn append_to(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{NaiveDate, NaiveDateTime};

    use super::{JobLedger, PREV_JOBS_FILE, STATS_FILE};
    use crate::{JobState, SacctRow};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn row(job_id: &str, start: Option<NaiveDateTime>, state: JobState) -> SacctRow {
        SacctRow {
            job_id: job_id.to_string(),
            array_task: None,
            name: "job".to_string(),
            alloc_cpus: 1,
            elapsed: None,
            start,
            end: None,
            state,
        }
    }

    #[test]
    fn missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(&dir.path().join("not-there")).unwrap();
        assert!(ledger.known_ids().is_empty());
        assert_eq!(ledger.last_session(), None);
    }

    #[test]
    fn record_then_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut ledger = JobLedger::open(&state_dir).unwrap();
        ledger
            .record(&[
                row("101", Some(at(9, 0, 0)), JobState::COMPLETED),
                row("102", None, JobState::CANCELLED),
                row("101", Some(at(9, 0, 0)), JobState::COMPLETED),
            ])
            .unwrap();
        ledger.save_session(at(12, 30, 0)).unwrap();

        assert_eq!(
            fs::read_to_string(state_dir.join(PREV_JOBS_FILE)).unwrap(),
            "101\n102\n2024-03-04T12:30:00\n"
        );
        assert_eq!(
            fs::read_to_string(state_dir.join(STATS_FILE)).unwrap(),
            "101;2024-03-04 09:00:00;COMPLETED\n102;Unknown;CANCELLED\n"
        );

        let reopened = JobLedger::open(&state_dir).unwrap();
        assert!(reopened.is_known("101"));
        assert!(reopened.is_known("102"));
        assert!(!reopened.is_known("103"));
        assert_eq!(reopened.last_session(), Some(at(12, 30, 0)));
    }

    #[test]
    fn known_jobs_are_not_written_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = JobLedger::open(dir.path()).unwrap();
        ledger
            .record(&[row("7", None, JobState::FAILED)])
            .unwrap();
        ledger
            .record(&[row("7", None, JobState::FAILED), row("8", None, JobState::TIMEOUT)])
            .unwrap();
        let stats = fs::read_to_string(dir.path().join(STATS_FILE)).unwrap();
        assert_eq!(stats.lines().count(), 2);
    }

    #[test]
    fn tolerates_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        // older files carry stale markers between IDs and no trailing newline
        fs::write(
            dir.path().join(PREV_JOBS_FILE),
            "4001\n2024-03-01T08:00:00\n4002\n10:15\n2024-03-02T18:45:10",
        )
        .unwrap();

        let mut ledger = JobLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.known_ids().len(), 2);
        assert_eq!(
            ledger.last_session(),
            NaiveDate::from_ymd_opt(2024, 3, 2)
                .unwrap()
                .and_hms_opt(18, 45, 10)
        );

        ledger
            .record(&[row("4003", None, JobState::COMPLETED)])
            .unwrap();
        let content = fs::read_to_string(dir.path().join(PREV_JOBS_FILE)).unwrap();
        assert!(content.ends_with("2024-03-02T18:45:10\n4003\n"));

        ledger.save_session(at(7, 0, 0)).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(PREV_JOBS_FILE)).unwrap(),
            "4001\n4002\n4003\n2024-03-04T07:00:00\n"
        );
    }

    #[test]
    fn empty_record_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = JobLedger::open(dir.path()).unwrap();
        ledger.record(&[]).unwrap();
        assert!(!dir.path().join(STATS_FILE).exists());
        assert!(!dir.path().join(PREV_JOBS_FILE).exists());
    }
}

use std::fmt;

use chrono::NaiveDateTime;
use console::style;

use crate::{format_slurm_duration, SacctRow};

const DISPLAY_DATE_FORMAT: &str = "%b-%d %H:%M";

/// Column headers and their widths; the last column is not padded
pub const COLUMNS: [(&str, usize); 7] = [
    ("JobID", 10),
    ("JobName", 24),
    ("CPUs", 5),
    ("Elapsed", 10),
    ("Start", 14),
    ("End", 14),
    ("State", 0),
];
const NAME_WIDTH: usize = COLUMNS[1].1;

/// Pad `s` to `width`; values that do not fit still get one trailing space
fn pad(s: &str, width: usize) -> String {
    if width == 0 {
        return s.to_string();
    }
    let fill = width - 1;
    format!("{s:<fill$} ")
}

/// Cut `name` so that at least one space separates it from the next column
fn fit_name(name: &str) -> String {
    if name.chars().count() < NAME_WIDTH {
        return name.to_string();
    }
    name.chars().take(NAME_WIDTH - 1).collect()
}

fn format_time(time: Option<&NaiveDateTime>) -> String {
    time.map(|t| t.format(DISPLAY_DATE_FORMAT).to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[derive(Debug, Clone)]
/// Console report of newly finished jobs
pub struct Report<'a> {
    rows: &'a [SacctRow],
    last_session: Option<NaiveDateTime>,
    color: bool,
}

impl<'a> Report<'a> {
    /// Report `rows`, which finished after `last_session` (`None` meaning today)
    pub fn new(rows: &'a [SacctRow], last_session: Option<NaiveDateTime>, color: bool) -> Self {
        Self {
            rows,
            last_session,
            color,
        }
    }

    /// Bold header line with all column names
    pub fn header(&self) -> String {
        COLUMNS
            .iter()
            .map(|(name, width)| {
                style(pad(name, *width))
                    .bold()
                    .force_styling(self.color)
                    .to_string()
            })
            .collect()
    }

    /// One table line; the state is green on success and red otherwise
    pub fn row(&self, row: &SacctRow) -> String {
        let elapsed = row
            .elapsed
            .as_ref()
            .map(format_slurm_duration)
            .unwrap_or_else(|| "Unknown".to_string());
        let state = style(row.state.to_string()).force_styling(self.color);
        let state = if row.state.is_success() {
            state.green()
        } else {
            state.red()
        };
        format!(
            "{}{}{}{}{}{}{}",
            pad(&row.job_id, COLUMNS[0].1),
            pad(&fit_name(&row.name), COLUMNS[1].1),
            pad(&row.alloc_cpus.to_string(), COLUMNS[2].1),
            pad(&elapsed, COLUMNS[3].1),
            pad(&format_time(row.start.as_ref()), COLUMNS[4].1),
            pad(&format_time(row.end.as_ref()), COLUMNS[5].1),
            state
        )
    }

    /// All output lines: title, header and one line per job, or a single
    /// notice when nothing finished
    pub fn lines(&self) -> Vec<String> {
        if self.rows.is_empty() {
            let since = self
                .last_session
                .map(|t| t.date().to_string())
                .unwrap_or_else(|| "today".to_string());
            return vec![style(format!("No jobs have finished since {since}"))
                .bold()
                .underlined()
                .force_styling(self.color)
                .to_string()];
        }
        let mut lines = Vec::with_capacity(self.rows.len() + 2);
        lines.push(
            style("Jobs completed since last session:")
                .bold()
                .underlined()
                .force_styling(self.color)
                .to_string(),
        );
        lines.push(self.header());
        lines.extend(self.rows.iter().map(|row| self.row(row)));
        lines
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

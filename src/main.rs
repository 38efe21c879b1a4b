use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::Error;
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use env_logger::Env;
use jobsdone::{
    display::Report, get_sacct_res_locally, sacct_diff, JobLedger, SacctQuery, SacctRow,
    SacctWindow,
};
use log::debug;

mod config;

use crate::config::{Settings, CONFIG_FILE_NAME};

/// Print the SLURM jobs that finished since the last run
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Show finished jobs since 00:00 today (state files are left untouched)
    #[arg(long)]
    day: bool,

    /// User whose jobs to report [default: $USER]
    #[arg(short, long)]
    user: Option<String>,

    /// Folder holding the `prev_job` and `stats` files [default: next to the executable]
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    /// TOML settings file [default: jobs_done.toml next to the executable]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the new jobs as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[cfg(feature = "ssh")]
    #[command(flatten)]
    ssh: SshOptions,
}

#[cfg(feature = "ssh")]
/// Run `sacct` on a login node instead of locally
#[derive(clap::Args, Debug)]
struct SshOptions {
    /// Host to run sacct on over SSH
    #[arg(long)]
    ssh_host: Option<String>,

    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// SSH login name [default: the reported user]
    #[arg(long)]
    ssh_user: Option<String>,

    /// Private key to log in with
    #[arg(long, requires = "ssh_host")]
    ssh_key: Option<PathBuf>,

    #[arg(long, requires = "ssh_key")]
    ssh_key_passphrase: Option<String>,
}

#[cfg(feature = "ssh")]
impl SshOptions {
    fn connection_config(
        &self,
        fallback_user: Option<&str>,
    ) -> Result<Option<jobsdone::ConnectionConfig>, Error> {
        let Some(host) = &self.ssh_host else {
            return Ok(None);
        };
        let username = self
            .ssh_user
            .as_deref()
            .or(fallback_user)
            .ok_or(Error::msg("No SSH user given (--ssh-user)."))?;
        let key = self
            .ssh_key
            .as_ref()
            .ok_or(Error::msg("No SSH key given (--ssh-key)."))?;
        Ok(Some(jobsdone::ConnectionConfig::new(
            (host.clone(), self.ssh_port),
            username.to_string(),
            jobsdone::ConnectionAuth::SSHKey {
                path: key.to_string_lossy().to_string(),
                passphrase: self.ssh_key_passphrase.clone(),
            },
        )))
    }
}

#[cfg(not(feature = "ssh"))]
async fn fetch(
    _args: &Args,
    query: &SacctQuery,
) -> Result<(DateTime<Utc>, Vec<SacctRow>), Error> {
    get_sacct_res_locally(query).await
}

#[cfg(feature = "ssh")]
async fn fetch(
    args: &Args,
    query: &SacctQuery,
) -> Result<(DateTime<Utc>, Vec<SacctRow>), Error> {
    match args.ssh.connection_config(query.user.as_deref())? {
        Some(cfg) => {
            let client = jobsdone::login_with_cfg(&cfg).await?;
            jobsdone::get_sacct_res_ssh(&client, query).await
        }
        None => get_sacct_res_locally(query).await,
    }
}

fn executable_dir() -> Result<PathBuf, Error> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or(Error::msg("Executable has no parent folder."))
}

/// Query sacct through `fetch`, print the newly finished jobs and update the ledger
///
/// The ledger is only written after a successful fetch, and never with `--day`.
async fn run<F, Fut>(
    args: &Args,
    settings: Settings,
    default_state_dir: PathBuf,
    fetch: F,
) -> Result<(), Error>
where
    F: FnOnce(SacctQuery) -> Fut,
    Fut: Future<Output = Result<(DateTime<Utc>, Vec<SacctRow>), Error>>,
{
    let user = args
        .user
        .clone()
        .or(settings.user)
        .or_else(|| std::env::var("USER").ok());
    let state_dir = args
        .state_dir
        .clone()
        .or(settings.state_dir)
        .unwrap_or(default_state_dir);
    let color = !args.no_color && settings.color.unwrap_or(true) && console::colors_enabled();

    let mut ledger = JobLedger::open(&state_dir)?;
    let no_known_jobs = HashSet::new();
    let (window, known, since) = if args.day {
        (SacctWindow::Today, &no_known_jobs, None)
    } else {
        let last = ledger.last_session();
        (
            last.map(SacctWindow::Since).unwrap_or_default(),
            ledger.known_ids(),
            last,
        )
    };
    let query = SacctQuery { user, window };

    let (time, rows) = sacct_diff(|| fetch(query), known).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", Report::new(&rows, since, color));
    }

    if !args.day {
        ledger.record(&rows)?;
        ledger.save_session(time.with_timezone(&Local).naive_local())?;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let exe_dir = executable_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| exe_dir.join(CONFIG_FILE_NAME));
    let settings = Settings::new(&config_path)?;
    debug!("Settings from {}: {settings:?}", config_path.display());

    let args_ref = &args;
    run(args_ref, settings, exe_dir, move |query| async move {
        fetch(args_ref, &query).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use anyhow::Error;
    use chrono::{NaiveDate, Utc};
    use clap::Parser;
    use jobsdone::{data_extraction::parse_sacct_output, SacctWindow};

    use super::{run, Args};
    use crate::config::Settings;

    const FINISHED: &str = "\
4001|old|1|00:01:00|2024-03-04T08:00:00|2024-03-04T08:01:00|COMPLETED
4002|new|2|00:02:00|2024-03-04T09:00:00|2024-03-04T09:02:00|FAILED
4003|busy|2|00:02:00|2024-03-04T09:30:00|Unknown|RUNNING
";
    const PREV_JOBS: &str = "4001\n2024-03-04T07:00:00\n";

    fn args_for(state_dir: &std::path::Path, extra: &[&str]) -> Args {
        let mut argv = vec!["jobs-done", "--no-color", "--state-dir"];
        argv.push(state_dir.to_str().unwrap());
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn new_jobs_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prev_job"), PREV_JOBS).unwrap();
        let args = args_for(dir.path(), &[]);

        run(&args, Settings::default(), PathBuf::new(), |query| async move {
            let last = NaiveDate::from_ymd_opt(2024, 3, 4)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap();
            assert_eq!(query.window, SacctWindow::Since(last));
            Ok((Utc::now(), parse_sacct_output(FINISHED)))
        })
        .await
        .unwrap();

        let prev = fs::read_to_string(dir.path().join("prev_job")).unwrap();
        let lines = prev.lines().collect::<Vec<_>>();
        assert_eq!(&lines[..2], &["4001", "4002"]);
        assert_eq!(lines.len(), 3);
        assert_eq!(
            fs::read_to_string(dir.path().join("stats")).unwrap(),
            "4002;2024-03-04 09:00:00;FAILED\n"
        );
    }

    #[tokio::test]
    async fn day_mode_leaves_state_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prev_job"), PREV_JOBS).unwrap();
        let args = args_for(dir.path(), &["--day"]);

        run(&args, Settings::default(), PathBuf::new(), |query| async move {
            assert_eq!(query.window, SacctWindow::Today);
            Ok((Utc::now(), parse_sacct_output(FINISHED)))
        })
        .await
        .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("prev_job")).unwrap(),
            PREV_JOBS
        );
        assert!(!dir.path().join("stats").exists());
    }

    #[tokio::test]
    async fn failed_sacct_leaves_state_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prev_job"), PREV_JOBS).unwrap();
        let args = args_for(dir.path(), &[]);

        let res = run(&args, Settings::default(), PathBuf::new(), |_query| async move {
            Err(Error::msg("sacct failed (exit status: 1): slurmdbd unreachable"))
        })
        .await;

        assert!(res.is_err());
        assert_eq!(
            fs::read_to_string(dir.path().join("prev_job")).unwrap(),
            PREV_JOBS
        );
        assert!(!dir.path().join("stats").exists());
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["jobs-done"]).unwrap();
        assert!(!args.day);
        assert!(!args.json);
        assert!(!args.no_color);
        assert_eq!(args.user, None);
        assert_eq!(args.state_dir, None);
    }

    #[test]
    fn all_flags() {
        let args = Args::try_parse_from([
            "jobs-done",
            "--day",
            "--user",
            "alice",
            "--state-dir",
            "/tmp/jobs",
            "--config",
            "/etc/jobs_done.toml",
            "--json",
            "--no-color",
        ])
        .unwrap();
        assert!(args.day);
        assert!(args.json);
        assert!(args.no_color);
        assert_eq!(args.user.as_deref(), Some("alice"));
        assert_eq!(args.state_dir, Some(PathBuf::from("/tmp/jobs")));
        assert_eq!(args.config, Some(PathBuf::from("/etc/jobs_done.toml")));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(Args::try_parse_from(["jobs-done", "--since", "yesterday"]).is_err());
    }
}

//! Logging initialization.
//!
//! Lines render as `TS - target - LEVEL - message` both on stdout and in
//! the per-day file `data/logs/pixiv-backup-YYYYMMDD.log`, so the log
//! follower and the LuCI page can parse either stream the same way.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "{} - {} - {} - ",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            meta.target(),
            meta.level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Appends to `pixiv-backup-YYYYMMDD.log`, rolling to a new file when
/// the local date changes.
pub struct DailyLogWriter {
    dir: PathBuf,
    state: Mutex<Option<(String, File)>>,
}

impl DailyLogWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            state: Mutex::new(None),
        }
    }

    pub fn file_name_for(day: &str) -> String {
        format!("pixiv-backup-{day}.log")
    }

    pub fn today_path(dir: &std::path::Path) -> PathBuf {
        dir.join(Self::file_name_for(&Local::now().format("%Y%m%d").to_string()))
    }

    fn write_line(&self, buf: &[u8]) -> io::Result<usize> {
        let today = Local::now().format("%Y%m%d").to_string();
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;

        let rotate = !matches!(state.as_ref(), Some((day, _)) if *day == today);
        if rotate {
            std::fs::create_dir_all(&self.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(Self::file_name_for(&today)))?;
            *state = Some((today, file));
        }
        let (_, file) = state.as_mut().expect("state populated above");
        file.write_all(buf)?;
        Ok(buf.len())
    }
}

pub struct DailyLogHandle<'a>(&'a DailyLogWriter);

impl io::Write for DailyLogHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_line(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyLogWriter {
    type Writer = DailyLogHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyLogHandle(self)
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "pixiv_backup=info,info".into())
}

/// Daemon logging: stdout plus the per-day file.
pub fn init_daemon(log_dir: PathBuf) {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_writer(io::stdout),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_writer(DailyLogWriter::new(log_dir)),
        )
        .init();
}

/// One-shot CLI commands log to stderr only.
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_writer(io::stderr),
        )
        .init();
}

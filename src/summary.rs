use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tfrecord::{EventWriter, EventWriterInit};
use tracing::debug;

/// Event files are named `events.out.tfevents.<time>.<host>`.
pub const EVENT_FILE_PREFIX: &str = "events";

/// Writes TensorBoard scalar summaries into `<log_dir>/<run start>/`.
#[derive(Debug)]
pub struct SummaryWriter {
    run_dir: PathBuf,
    event_writer: EventWriter<BufWriter<File>>,
}

impl SummaryWriter {
    /// Creates the run directory, named after `started`, replacing any
    /// directory of the same name.
    pub fn create(log_dir: &Path, started: DateTime<Local>) -> Result<Self> {
        let run_dir = log_dir.join(started.format("%Y-%m-%d_%H-%M-%S").to_string());

        if run_dir.exists() {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to clear {}", run_dir.display()))?;
        }
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;

        let prefix = run_dir.join(EVENT_FILE_PREFIX);
        let prefix = prefix
            .to_str()
            .with_context(|| format!("{} is not valid UTF-8", prefix.display()))?;
        let event_writer = EventWriterInit::default()
            .from_prefix(prefix, None)
            .with_context(|| format!("failed to create event file in {}", run_dir.display()))?;
        debug!("writing events to {}", run_dir.display());

        Ok(Self {
            run_dir,
            event_writer,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<()> {
        self.event_writer
            .write_scalar(tag, step as i64, value as f32)
            .with_context(|| format!("failed to write scalar {tag}"))?;
        self.event_writer.flush()?;

        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: i64,
    pub value: f32,
}

/// Reads back every scalar summary of the event file in `run_dir`.
#[cfg(test)]
pub fn read_scalars(run_dir: &Path) -> Result<Vec<ScalarEvent>> {
    use tfrecord::{
        protobuf::{event::What, summary::value::Value},
        EventIter,
    };

    let path = fs::read_dir(run_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(EVENT_FILE_PREFIX))
        })
        .with_context(|| format!("no event file in {}", run_dir.display()))?;

    let mut scalars = vec![];
    for event in EventIter::open(&path, Default::default())? {
        let event = event?;
        let Some(What::Summary(summary)) = event.what else {
            continue;
        };
        for value in summary.value {
            if let Some(Value::SimpleValue(simple)) = value.value {
                scalars.push(ScalarEvent {
                    tag: value.tag,
                    step: event.step,
                    value: simple,
                });
            }
        }
    }

    Ok(scalars)
}

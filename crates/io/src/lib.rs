use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use serde::Serialize;
use model::*;

/// Reads a demo dataset written by [`save_dataset`] or any compatible tool.
pub fn load_dataset(path: &Path) -> Result<DemoDataset> {
    let f = File::open(path).with_context(|| format!("open dataset {}", path.display()))?;
    let ds = serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("parse dataset {}", path.display()))?;
    Ok(ds)
}

pub fn save_dataset(ds: &DemoDataset, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, ds)?;
    writeln!(w)?;
    w.flush()?;
    Ok(())
}

/// Append-only NDJSON file of completed laps, one lap per line.
pub struct LapArchive {
    path: PathBuf,
    w: BufWriter<File>,
}

impl LapArchive {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open archive {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), w: BufWriter::new(f) })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Writes one lap and flushes, so a crash loses at most the lap in flight.
    pub fn append(&mut self, lap: &CompletedLap) -> Result<()> {
        serde_json::to_writer(&mut self.w, lap)?;
        writeln!(self.w)?;
        self.w.flush()?;
        Ok(())
    }
}

pub fn read_archive(path: &Path) -> Result<Vec<CompletedLap>> {
    let f = File::open(path).with_context(|| format!("open archive {}", path.display()))?;
    let mut laps = vec![];
    for (n, line) in BufReader::new(f).lines().enumerate() {
        let s = line?;
        if s.trim().is_empty() { continue; }
        let lap: CompletedLap = serde_json::from_str(&s)
            .with_context(|| format!("{} line {}", path.display(), n + 1))?;
        laps.push(lap);
    }
    Ok(laps)
}

/// One CSV row per frame, laps in the given order.
pub fn export_csv(laps: &[CompletedLap], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    for l in laps {
        for f in l.frames() {
            w.serialize(CsvRow {
                session_id: l.session_id(),
                lap_number: l.lap_number(),
                lap_duration_ms: l.duration_ms(),
                timestamp: f.received_at,
                lap_time_ms: f.lap_time_ms,
                normalized_position: f.normalized_position,
                speed: f.speed,
                throttle: f.throttle, brake: f.brake, steering: f.steering,
                gear: f.gear, rpm: f.rpm,
            })?;
        }
    }
    w.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct CsvRow<'a> {
    session_id: &'a str, lap_number: u32, lap_duration_ms: u64,
    timestamp: i64, lap_time_ms: u32, normalized_position: f32, speed: f32,
    throttle: f32, brake: f32, steering: f32, gear: i32, rpm: u32,
}

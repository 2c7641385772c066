//! Telemetry log sinks
//!
//! Append-only writers for decoded samples. Each row starts from a fixed,
//! ordered field list; `time` is seconds since the poller run started.
//! Rows are flushed as they are written so a crash loses at most one sample.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::{LogFormat, TelemetryConfig};
use crate::error::{Result, VescBridgeError};
use crate::vesc::protocol::TelemetrySample;

/// Destination for decoded telemetry samples
pub trait TelemetrySink: Send {
    /// Append one row and flush it
    fn write_sample(&mut self, elapsed: Duration, sample: &TelemetrySample) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// File backing this sink, if any
    fn path(&self) -> Option<&Path> {
        None
    }
}

fn format_time(elapsed: Duration) -> String {
    format!("{:.3}", elapsed.as_secs_f64())
}

/// Comma-separated rows with a header line
pub struct CsvSink<W: Write + Send> {
    writer: W,
    fields: Vec<String>,
    path: Option<PathBuf>,
}

impl<W: Write + Send> CsvSink<W> {
    /// Wrap a writer and emit the header row immediately
    pub fn new(mut writer: W, fields: Vec<String>) -> Result<Self> {
        writeln!(writer, "{}", fields.join(","))?;
        writer.flush()?;

        Ok(Self {
            writer,
            fields,
            path: None,
        })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TelemetrySink for CsvSink<W> {
    fn write_sample(&mut self, elapsed: Duration, sample: &TelemetrySample) -> Result<()> {
        let row: Vec<String> = self
            .fields
            .iter()
            .map(|field| match field.as_str() {
                "time" => format_time(elapsed),
                name => sample.format_field(name).unwrap_or_default(),
            })
            .collect();

        writeln!(self.writer, "{}", row.join(","))?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// One JSON object per line
pub struct JsonlSink<W: Write + Send> {
    writer: W,
    fields: Vec<String>,
    path: Option<PathBuf>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W, fields: Vec<String>) -> Self {
        Self {
            writer,
            fields,
            path: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TelemetrySink for JsonlSink<W> {
    fn write_sample(&mut self, elapsed: Duration, sample: &TelemetrySample) -> Result<()> {
        let all = match serde_json::to_value(sample)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(VescBridgeError::Telemetry(format!(
                    "sample serialized to non-object: {}",
                    other
                )))
            }
        };

        let mut row = serde_json::Map::with_capacity(self.fields.len());
        for field in &self.fields {
            if field == "time" {
                let secs = (elapsed.as_secs_f64() * 1000.0).round() / 1000.0;
                row.insert(field.clone(), serde_json::json!(secs));
            } else if let Some(value) = all.get(field) {
                row.insert(field.clone(), value.clone());
            }
        }

        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Build a fresh log file path: `{log_dir}/{label}_{YYYYmmdd_HHMMSS}.{ext}`
///
/// A numeric suffix is added when a file with that name already exists.
pub fn log_file_path(log_dir: &Path, label: &str, format: LogFormat) -> PathBuf {
    let ext = match format {
        LogFormat::Csv => "csv",
        LogFormat::Jsonl => "jsonl",
    };
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

    let mut path = log_dir.join(format!("{}_{}.{}", label, stamp, ext));
    let mut n = 1;
    while path.exists() {
        path = log_dir.join(format!("{}_{}_{}.{}", label, stamp, n, ext));
        n += 1;
    }
    path
}

/// Create the log directory and open a new file sink for one poller run
pub fn open_sink(config: &TelemetryConfig, label: &str) -> Result<Box<dyn TelemetrySink>> {
    let dir = Path::new(&config.log_dir);
    fs::create_dir_all(dir)?;

    let path = log_file_path(dir, label, config.format);
    let writer = BufWriter::new(File::create(&path)?);
    info!("Telemetry log: {}", path.display());

    let sink: Box<dyn TelemetrySink> = match config.format {
        LogFormat::Csv => {
            let mut sink = CsvSink::new(writer, config.fields.clone())?;
            sink.path = Some(path);
            Box::new(sink)
        }
        LogFormat::Jsonl => {
            let mut sink = JsonlSink::new(writer, config.fields.clone());
            sink.path = Some(path);
            Box::new(sink)
        }
    };

    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vesc::decoder::{decode_get_values, test_get_values_payload};
    use tempfile::tempdir;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> TelemetrySample {
        decode_get_values(&test_get_values_payload()).unwrap()
    }

    #[test]
    fn test_csv_header_and_row() {
        let mut sink = CsvSink::new(Vec::new(), fields(&["time", "duty", "rpm", "temp_fet"])).unwrap();
        sink.write_sample(Duration::from_millis(1234), &sample()).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["time,duty,rpm,temp_fet", "1.234,0.100,12345,25.0"]);
    }

    #[test]
    fn test_csv_precision_per_field() {
        let mut sink = CsvSink::new(
            Vec::new(),
            fields(&["current_motor", "v_in", "amp_hours", "tachometer"]),
        )
        .unwrap();
        sink.write_sample(Duration::ZERO, &sample()).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text.lines().nth(1), Some("12.34,24.3,1.5000,-4200"));
    }

    #[test]
    fn test_jsonl_row_contains_selected_fields() {
        let mut sink = JsonlSink::new(Vec::new(), fields(&["time", "rpm", "duty"]));
        sink.write_sample(Duration::from_micros(2_500_400), &sample()).unwrap();
        sink.write_sample(Duration::from_secs(3), &sample()).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["time"], serde_json::json!(2.5));
        assert_eq!(row["rpm"], serde_json::json!(12345));
        assert!((row["duty"].as_f64().unwrap() - 0.1).abs() < 1e-9);
        assert!(row.get("v_in").is_none());
    }

    #[test]
    fn test_log_file_path_naming() {
        let dir = tempdir().unwrap();
        let path = log_file_path(dir.path(), "telemetry", LogFormat::Csv);

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("telemetry_"));
        assert!(name.ends_with(".csv"));
        // telemetry_YYYYmmdd_HHMMSS.csv
        assert_eq!(name.len(), "telemetry_".len() + 15 + ".csv".len());
    }

    #[test]
    fn test_log_file_path_avoids_existing_file() {
        let dir = tempdir().unwrap();
        let first = log_file_path(dir.path(), "capture", LogFormat::Jsonl);
        File::create(&first).unwrap();

        let second = log_file_path(dir.path(), "capture", LogFormat::Jsonl);
        assert_ne!(first, second);
        assert!(second.to_str().unwrap().ends_with(".jsonl"));
    }

    #[test]
    fn test_open_sink_creates_directory_and_header() {
        let dir = tempdir().unwrap();
        let config = TelemetryConfig {
            log_dir: dir.path().join("nested").to_string_lossy().into_owned(),
            ..TelemetryConfig::default()
        };

        let mut sink = open_sink(&config, "telemetry").unwrap();
        sink.write_sample(Duration::from_millis(50), &sample()).unwrap();
        let path = sink.path().unwrap().to_path_buf();
        drop(sink);

        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text, "time,duty,rpm\n0.050,0.100,12345\n");
    }

    #[test]
    fn test_open_sink_jsonl() {
        let dir = tempdir().unwrap();
        let config = TelemetryConfig {
            log_dir: dir.path().to_string_lossy().into_owned(),
            format: LogFormat::Jsonl,
            ..TelemetryConfig::default()
        };

        let sink = open_sink(&config, "telemetry").unwrap();
        assert_eq!(
            sink.path().and_then(|p| p.extension()).and_then(|e| e.to_str()),
            Some("jsonl")
        );
    }
}

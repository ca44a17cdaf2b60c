//! Reads route topology and vehicle telemetry exported by the operator as CSV.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::catalog::{ArcCatalog, Direction, LineStop, Stop};
use crate::error::LoadError;
use crate::model::{Datagram, StreamingWindow};

const DATAGRAM_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Coordinates above this magnitude are stored as degrees * 10^7.
const SCALED_COORDINATE_THRESHOLD: f64 = 1_000_000.0;
const COORDINATE_SCALE: f64 = 10_000_000.0;

#[derive(Debug, Deserialize)]
struct StopRow {
    #[serde(rename = "STOPID")]
    stop_id: String,
    #[serde(rename = "SHORTNAME")]
    short_name: String,
    #[serde(rename = "LONGNAME")]
    long_name: String,
    #[serde(rename = "DECIMALLONGITUDE")]
    longitude: f64,
    #[serde(rename = "DECIMALLATITUDE")]
    latitude: f64,
}

#[derive(Debug, Deserialize)]
struct LineStopRow {
    #[serde(rename = "STOPSEQUENCE")]
    sequence: u32,
    #[serde(rename = "ORIENTATION")]
    orientation: u32,
    #[serde(rename = "LINEID")]
    line_id: String,
    #[serde(rename = "STOPID")]
    stop_id: String,
}

/// Loads `stops.csv` and `linestops.csv` from `data_dir` and builds the arc catalog.
pub fn load_topology(data_dir: &Path) -> Result<ArcCatalog, LoadError> {
    let stops = load_stops(&data_dir.join("stops.csv"))?;
    let line_stops = load_line_stops(&data_dir.join("linestops.csv"))?;

    let catalog = ArcCatalog::from_line_stops(stops, line_stops);
    info!(
        stops = catalog.stop_count(),
        arcs = catalog.arc_count(),
        dir = %data_dir.display(),
        "Topology loaded"
    );
    Ok(catalog)
}

pub fn load_stops(path: &Path) -> Result<Vec<Stop>, LoadError> {
    let mut rdr = open(path)?;
    let mut stops = Vec::new();
    let mut skipped = 0usize;

    for result in rdr.deserialize::<StopRow>() {
        match result {
            Ok(row) => stops.push(Stop {
                id: row.stop_id,
                short_name: row.short_name,
                long_name: row.long_name,
                latitude: row.latitude,
                longitude: row.longitude,
            }),
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Skipped unparseable stop rows");
    }
    Ok(stops)
}

pub fn load_line_stops(path: &Path) -> Result<Vec<LineStop>, LoadError> {
    let mut rdr = open(path)?;
    let mut line_stops = Vec::new();
    let mut skipped = 0usize;

    for result in rdr.deserialize::<LineStopRow>() {
        match result {
            Ok(row) => line_stops.push(LineStop {
                line_id: row.line_id,
                stop_id: row.stop_id,
                sequence: row.sequence,
                direction: Direction::from_orientation(row.orientation),
            }),
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Skipped unparseable line stop rows");
    }
    Ok(line_stops)
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, LoadError> {
    if !path.exists() {
        return Err(LoadError::MissingFile(path.to_path_buf()));
    }
    Ok(ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?)
}

/// Column positions of a datagram export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramColumns {
    pub event_type: usize,
    pub stop_id: usize,
    pub odometer: usize,
    pub latitude: usize,
    pub longitude: usize,
    pub line_id: usize,
    pub trip_id: usize,
    pub timestamp: usize,
    pub vehicle_id: usize,
}

impl Default for DatagramColumns {
    /// `eventType, registerDate, stopId, odometer, latitude, longitude, taskId, lineId, tripId,
    /// unknown, datagramDate, busId`
    fn default() -> Self {
        Self {
            event_type: 0,
            stop_id: 2,
            odometer: 3,
            latitude: 4,
            longitude: 5,
            line_id: 7,
            trip_id: 8,
            timestamp: 10,
            vehicle_id: 11,
        }
    }
}

impl DatagramColumns {
    /// Older 11-column export without the task column.
    pub fn legacy() -> Self {
        Self {
            line_id: 6,
            trip_id: 7,
            timestamp: 9,
            vehicle_id: 10,
            ..Self::default()
        }
    }

    /// Picks the layout from the header width.
    pub fn for_header(header: &StringRecord) -> Self {
        if header.len() <= 11 {
            Self::legacy()
        } else {
            Self::default()
        }
    }

    /// Parses one record. Returns `None` for rows that cannot yield a usable datagram.
    pub fn parse(&self, record: &StringRecord) -> Option<Datagram> {
        let field = |i: usize| record.get(i).map(str::trim);

        let line_id = field(self.line_id).filter(|s| is_known_id(s))?;
        let stop_id = field(self.stop_id).filter(|s| is_known_id(s))?;
        let timestamp = parse_timestamp(field(self.timestamp)?)?;

        Some(Datagram {
            event_type: field(self.event_type)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            vehicle_id: field(self.vehicle_id).unwrap_or_default().to_string(),
            trip_id: field(self.trip_id).unwrap_or_default().to_string(),
            line_id: line_id.to_string(),
            stop_id: stop_id.to_string(),
            odometer_meters: field(self.odometer)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            latitude: parse_coordinate(field(self.latitude)?)?,
            longitude: parse_coordinate(field(self.longitude)?)?,
            timestamp,
        })
    }
}

fn is_known_id(id: &str) -> bool {
    !id.is_empty() && id != "-1"
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    if value.abs() > SCALED_COORDINATE_THRESHOLD {
        Some(value / COORDINATE_SCALE)
    } else {
        Some(value)
    }
}

/// `%Y-%m-%d %H:%M:%S` as UTC, or epoch milliseconds. Truncated to whole seconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_opt(millis.div_euclid(1000), 0).single();
    }
    NaiveDateTime::parse_from_str(raw, DATAGRAM_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Loads datagrams from a headered export, detecting the column layout from the header.
///
/// Stops after `limit` datagrams when given. Unusable rows are skipped and counted.
pub fn load_datagrams(path: &Path, limit: Option<usize>) -> Result<Vec<Datagram>, LoadError> {
    let mut rdr = open(path)?;
    let columns = DatagramColumns::for_header(rdr.headers()?);
    load_datagrams_from(rdr, columns, limit, path)
}

/// Like [`load_datagrams`] with an explicit column layout.
pub fn load_datagrams_with(
    path: &Path,
    columns: DatagramColumns,
    limit: Option<usize>,
) -> Result<Vec<Datagram>, LoadError> {
    load_datagrams_from(open(path)?, columns, limit, path)
}

fn load_datagrams_from(
    mut rdr: csv::Reader<std::fs::File>,
    columns: DatagramColumns,
    limit: Option<usize>,
    path: &Path,
) -> Result<Vec<Datagram>, LoadError> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut datagrams = Vec::new();
    let mut skipped = 0usize;
    let mut record = StringRecord::new();

    while datagrams.len() < limit {
        match rdr.read_record(&mut record) {
            Ok(true) => match columns.parse(&record) {
                Some(d) => datagrams.push(d),
                None => skipped += 1,
            },
            Ok(false) => break,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                debug!(error = %e, "Unreadable datagram row");
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Skipped unusable datagram rows");
    }
    info!(path = %path.display(), datagrams = datagrams.len(), "Datagrams loaded");
    Ok(datagrams)
}

/// Slices datagrams into consecutive windows of `window_seconds`, starting at the earliest
/// timestamp. Each window covers `[start, start + window_seconds - 1s]`; empty windows are
/// not emitted.
pub fn split_windows(mut datagrams: Vec<Datagram>, window_seconds: i64) -> Vec<StreamingWindow> {
    let window_seconds = window_seconds.max(1);
    let span = Duration::seconds(window_seconds);
    datagrams.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let Some(origin) = datagrams.first().map(|d| d.timestamp) else {
        return Vec::new();
    };

    let mut windows: Vec<StreamingWindow> = Vec::new();
    for d in datagrams {
        let index = (d.timestamp - origin).num_seconds() / window_seconds;
        let start = origin + Duration::seconds(index * window_seconds);

        match windows.last_mut() {
            Some(w) if w.start == start => w.datagrams.push(d),
            _ => windows.push(StreamingWindow {
                window_id: format!("window-{}", index),
                datagrams: vec![d],
                start,
                end: start + span - Duration::seconds(1),
            }),
        }
    }
    windows
}

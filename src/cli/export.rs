//! Flat exports of the current snapshot.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::catalog::{AvailabilityRecord, Snapshot, Title};
use crate::query::FilteredView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// One row per title and availability record.
    Csv,
    /// The whole snapshot as JSON, loadable as a demo snapshot.
    Json,
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    title_id: &'a str,
    name: &'a str,
    media_type: &'static str,
    release_year: Option<i32>,
    genres: String,
    languages: String,
    countries: String,
    vote_average: Option<f64>,
    vote_count: Option<i64>,
    popularity: Option<f64>,
    runtime_minutes: Option<f64>,
    platform: &'a str,
    region: &'a str,
    availability_type: &'static str,
    observed_at: String,
}

fn joined<'a>(values: impl IntoIterator<Item = &'a String>) -> String {
    values.into_iter().map(String::as_str).collect::<Vec<_>>().join("|")
}

fn row<'a>(title: &'a Title, record: Option<&'a AvailabilityRecord>) -> ExportRow<'a> {
    ExportRow {
        title_id: title.id.as_str(),
        name: &title.name,
        media_type: title.kind.as_str(),
        release_year: title.release_year,
        genres: joined(&title.genres),
        languages: joined(&title.languages),
        countries: joined(&title.countries),
        vote_average: title.vote_average,
        vote_count: title.vote_count,
        popularity: title.popularity,
        runtime_minutes: title.runtime_minutes,
        platform: record.map_or("", |r| r.platform.as_str()),
        region: record.map_or("", |r| r.region.as_str()),
        availability_type: record.map_or("", |r| r.kind.as_str()),
        observed_at: record.map(|r| r.observed_at.to_rfc3339()).unwrap_or_default(),
    }
}

/// Writes the view as CSV. Titles without any matching availability get a
/// single row with empty platform columns. Returns the number of data rows.
pub fn write_csv<W: Write>(view: &FilteredView<'_>, writer: W) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut rows = 0usize;
    let mut records = view.availability.iter().peekable();
    for title in &view.titles {
        // Skip rows of titles the view dropped; both lists are sorted by title id.
        while records.next_if(|r| r.title_id < title.id).is_some() {}
        let mut wrote = false;
        while let Some(record) = records.next_if(|r| r.title_id == title.id) {
            wtr.serialize(row(title, Some(*record)))?;
            rows += 1;
            wrote = true;
        }
        if !wrote {
            wtr.serialize(row(title, None))?;
            rows += 1;
        }
    }
    wtr.flush()?;
    Ok(rows)
}

pub fn write_json<W: Write>(snapshot: &Snapshot, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, snapshot).context("encode snapshot")?;
    Ok(())
}

/// Exports to `out`, or stdout when `out` is `None`.
pub fn export(
    snapshot: &Snapshot,
    view: &FilteredView<'_>,
    format: ExportFormat,
    out: Option<&Path>,
) -> Result<usize> {
    let writer: Box<dyn Write> = match out {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    match format {
        ExportFormat::Csv => write_csv(view, writer),
        ExportFormat::Json => {
            write_json(snapshot, writer)?;
            Ok(snapshot.catalog.titles.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filters::tests::sample_catalog;
    use crate::query::{FilterParams, Filters};

    #[test]
    fn csv_has_one_row_per_availability_and_unlisted_title() {
        let catalog = sample_catalog();
        let view = Filters::default().apply(&catalog);
        let mut buf = Vec::new();
        let rows = write_csv(&view, &mut buf).unwrap();
        // 5 availability rows + d, which is on no platform
        assert_eq!(rows, 6);

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("title_id,name,media_type"));
        let d = text.lines().find(|l| l.starts_with("d,")).unwrap();
        assert!(d.contains("Horror"));
        assert!(d.ends_with(",,,,"));
    }

    #[test]
    fn csv_follows_the_filter() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams {
            platform: Some("Hulu".into()),
            ..FilterParams::default()
        })
        .unwrap();
        let view = filters.apply(&catalog);
        let mut buf = Vec::new();
        assert_eq!(write_csv(&view, &mut buf).unwrap(), 2);
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("Netflix"));
    }

    #[test]
    fn json_export_reloads_as_snapshot() {
        let snapshot = Snapshot {
            catalog: sample_catalog(),
            ..Snapshot::empty()
        };
        let mut buf = Vec::new();
        write_json(&snapshot, &mut buf).unwrap();
        let back: Snapshot = serde_json::from_slice(&buf).unwrap();
        assert_eq!(back, snapshot);
    }
}

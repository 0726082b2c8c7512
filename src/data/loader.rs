//! CSV ingestion and source joining.
//!
//! Three sources are combined into one date-aligned [`RegionDataset`]:
//! - county metadata, aggregated to region level
//! - a wide region × date table of confirmed cases
//! - a long daily table of active/recovered/death counts

use crate::core::{Error, Region, Result};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y", "%Y/%m/%d"];

/// Parse a date in any accepted layout. A trailing time part is ignored.
pub fn parse_date(column: &str, value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    let date_part = trimmed
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(trimmed);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
        .ok_or_else(|| Error::MalformedDate {
            column: column.to_string(),
            value: value.to_string(),
        })
}

/// Inclusive date window applied to the case table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

#[derive(Debug, Deserialize)]
struct CountyRow {
    state_name: String,
    population: f64,
    density: f64,
    lat: f64,
    lng: f64,
}

/// Load county metadata and aggregate to one [`Region`] per state:
/// population summed, density and coordinates averaged.
pub fn load_region_metadata(path: &Path) -> Result<Vec<Region>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;

    struct Acc {
        population: f64,
        density: f64,
        lat: f64,
        lng: f64,
        count: f64,
    }

    let mut order: Vec<String> = Vec::new();
    let mut acc: HashMap<String, Acc> = HashMap::new();
    for result in rdr.deserialize::<CountyRow>() {
        let row = result?;
        let entry = acc.entry(row.state_name.clone()).or_insert_with(|| {
            order.push(row.state_name.clone());
            Acc {
                population: 0.0,
                density: 0.0,
                lat: 0.0,
                lng: 0.0,
                count: 0.0,
            }
        });
        entry.population += row.population.max(0.0);
        entry.density += row.density;
        entry.lat += row.lat;
        entry.lng += row.lng;
        entry.count += 1.0;
    }

    let regions: Vec<Region> = order
        .iter()
        .filter_map(|name| {
            acc.get(name).map(|a| Region {
                name: name.clone(),
                latitude: a.lat / a.count,
                longitude: a.lng / a.count,
                population: a.population.round() as u64,
                density: a.density / a.count,
            })
        })
        .collect();

    info!(regions = regions.len(), path = %path.display(), "Loaded region metadata");
    Ok(regions)
}

/// Wide case-count table: one row per region, one column per date.
#[derive(Clone, Debug, Default)]
pub struct CaseTable {
    pub dates: Vec<NaiveDate>,
    /// `(region, counts aligned with dates)` in file order
    pub rows: Vec<(String, Vec<f64>)>,
    /// Empty cells read as zero
    pub missing_values: usize,
}

/// Load the wide case table, keeping only the date columns inside `range`.
pub fn load_case_table(path: &Path, range: &DateRange) -> Result<CaseTable> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = rdr.headers()?.clone();

    let mut columns: Vec<(usize, NaiveDate)> = Vec::new();
    for (idx, header) in headers.iter().enumerate().skip(1) {
        let date = parse_date("header", header)?;
        if range.contains(date) {
            columns.push((idx, date));
        }
    }

    let mut table = CaseTable {
        dates: columns.iter().map(|(_, d)| *d).collect(),
        ..Default::default()
    };
    for result in rdr.records() {
        let record = result?;
        let name = match record.get(0) {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => continue,
        };
        let mut values = Vec::with_capacity(columns.len());
        for (idx, _) in &columns {
            let cell = record.get(*idx).unwrap_or("").trim();
            if cell.is_empty() {
                table.missing_values += 1;
                values.push(0.0);
            } else {
                values.push(cell.parse::<f64>().map_err(|e| {
                    Error::Csv(format!("{name}: bad count '{cell}': {e}"))
                })?);
            }
        }
        table.rows.push((name, values));
    }

    info!(
        regions = table.rows.len(),
        dates = table.dates.len(),
        "Loaded case table"
    );
    Ok(table)
}

#[derive(Debug, Deserialize)]
struct DailyRow {
    state: String,
    date_today: String,
    active: Option<f64>,
    hospitalization: Option<f64>,
    new_cases: Option<f64>,
    deaths: Option<f64>,
    recovered: Option<f64>,
}

/// One region-day of the supplementary table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub region: String,
    pub date: NaiveDate,
    pub active: f64,
    pub hospitalized: f64,
    pub new_cases: f64,
    pub deaths: f64,
    pub recovered: f64,
}

/// Load the supplementary long table. Empty numeric cells become zero.
pub fn load_daily_table(path: &Path) -> Result<(Vec<DailyRecord>, usize)> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut records = Vec::new();
    let mut missing = 0usize;
    for result in rdr.deserialize::<DailyRow>() {
        let row = result?;
        let mut fill = |v: Option<f64>| {
            v.unwrap_or_else(|| {
                missing += 1;
                0.0
            })
        };
        let record = DailyRecord {
            region: row.state.trim().to_string(),
            date: parse_date("date_today", &row.date_today)?,
            active: fill(row.active),
            hospitalized: fill(row.hospitalization),
            new_cases: fill(row.new_cases),
            deaths: fill(row.deaths),
            recovered: fill(row.recovered),
        };
        records.push(record);
    }
    info!(rows = records.len(), missing, "Loaded daily table");
    Ok((records, missing))
}

/// Rows dropped while joining the three sources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinReport {
    /// Metadata regions with no case row
    pub metadata_regions_dropped: usize,
    /// Case rows whose region has no metadata
    pub case_rows_dropped: usize,
    /// Region-date case cells with no daily record
    pub case_cells_dropped: usize,
    /// Daily records with no matching case cell
    pub daily_rows_dropped: usize,
    /// Repeated (region, date) daily records ignored
    pub duplicate_daily_rows: usize,
    /// Joined cells removed to align every region on common dates
    pub unaligned_cells_dropped: usize,
    /// Empty numeric cells read as zero
    pub missing_values_filled: usize,
}

impl JoinReport {
    pub fn total_dropped(&self) -> usize {
        self.metadata_regions_dropped
            + self.case_rows_dropped
            + self.case_cells_dropped
            + self.daily_rows_dropped
            + self.duplicate_daily_rows
            + self.unaligned_cells_dropped
    }

    /// Emit the report through `tracing`.
    pub fn log(&self) {
        if self.total_dropped() > 0 {
            warn!(
                metadata_regions = self.metadata_regions_dropped,
                case_rows = self.case_rows_dropped,
                case_cells = self.case_cells_dropped,
                daily_rows = self.daily_rows_dropped,
                duplicates = self.duplicate_daily_rows,
                unaligned = self.unaligned_cells_dropped,
                "Join dropped rows"
            );
        } else {
            info!("Join kept every row");
        }
    }
}

/// Region time series aligned on a shared, ascending date axis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionDataset {
    pub regions: Vec<Region>,
    pub dates: Vec<NaiveDate>,
    pub confirmed: Vec<Vec<f64>>,
    pub active: Vec<Vec<f64>>,
    pub hospitalized: Vec<Vec<f64>>,
    pub new_cases: Vec<Vec<f64>>,
    pub deaths: Vec<Vec<f64>>,
    pub recovered: Vec<Vec<f64>>,
}

impl RegionDataset {
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn num_timesteps(&self) -> usize {
        self.dates.len()
    }

    /// `population − active − recovered` per region and day.
    pub fn susceptible(&self) -> Vec<Vec<f64>> {
        self.regions
            .iter()
            .zip(self.active.iter().zip(self.recovered.iter()))
            .map(|(region, (active, recovered))| {
                active
                    .iter()
                    .zip(recovered)
                    .map(|(a, r)| region.population as f64 - a - r)
                    .collect()
            })
            .collect()
    }

    /// Check every series has one value per region and date.
    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(Error::EmptyRegions);
        }
        let n = self.regions.len();
        let t = self.dates.len();
        for (label, series) in [
            ("confirmed", &self.confirmed),
            ("active", &self.active),
            ("hospitalized", &self.hospitalized),
            ("new_cases", &self.new_cases),
            ("deaths", &self.deaths),
            ("recovered", &self.recovered),
        ] {
            if series.len() != n || series.iter().any(|s| s.len() != t) {
                return Err(Error::ShapeMismatch(format!(
                    "{label} series is not {n} x {t}"
                )));
            }
        }
        Ok(())
    }
}

/// Inner-join metadata, case table and daily records into a dataset.
///
/// Region order follows the case table. Every region is reindexed to the
/// dates present for all regions.
pub fn join_sources(
    metadata: Vec<Region>,
    cases: CaseTable,
    daily: Vec<DailyRecord>,
) -> Result<(RegionDataset, JoinReport)> {
    let mut report = JoinReport {
        missing_values_filled: cases.missing_values,
        ..Default::default()
    };

    let meta_by_name: HashMap<&str, &Region> =
        metadata.iter().map(|r| (r.name.as_str(), r)).collect();
    let case_names: HashSet<&str> = cases.rows.iter().map(|(n, _)| n.as_str()).collect();
    report.metadata_regions_dropped = metadata
        .iter()
        .filter(|r| !case_names.contains(r.name.as_str()))
        .count();

    let mut regions: Vec<Region> = Vec::new();
    let mut case_rows: Vec<&Vec<f64>> = Vec::new();
    for (name, values) in &cases.rows {
        match meta_by_name.get(name.as_str()) {
            Some(region) if !regions.iter().any(|r: &Region| &r.name == name) => {
                regions.push((*region).clone());
                case_rows.push(values);
            }
            _ => report.case_rows_dropped += 1,
        }
    }
    if regions.is_empty() {
        return Err(Error::DataJoin {
            source_name: "metadata/cases".to_string(),
            detail: "no region appears in both tables".to_string(),
        });
    }

    let region_idx: HashMap<&str, usize> = regions
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();
    let case_dates: HashSet<NaiveDate> = cases.dates.iter().copied().collect();

    let mut by_key: HashMap<(usize, NaiveDate), DailyRecord> = HashMap::new();
    for record in daily {
        let idx = match region_idx.get(record.region.as_str()) {
            Some(&i) if case_dates.contains(&record.date) => i,
            _ => {
                report.daily_rows_dropped += 1;
                continue;
            }
        };
        if by_key.contains_key(&(idx, record.date)) {
            report.duplicate_daily_rows += 1;
            continue;
        }
        by_key.insert((idx, record.date), record);
    }

    // Dates each region has after the join.
    let mut joined_dates: Vec<BTreeSet<NaiveDate>> = vec![BTreeSet::new(); regions.len()];
    for (i, _) in regions.iter().enumerate() {
        for date in &cases.dates {
            if by_key.contains_key(&(i, *date)) {
                joined_dates[i].insert(*date);
            } else {
                report.case_cells_dropped += 1;
            }
        }
    }

    let common: BTreeSet<NaiveDate> = joined_dates
        .iter()
        .skip(1)
        .fold(joined_dates[0].clone(), |acc, s| {
            acc.intersection(s).copied().collect()
        });
    report.unaligned_cells_dropped = joined_dates
        .iter()
        .map(|s| s.len() - common.len())
        .sum();

    if common.is_empty() {
        report.log();
        return Err(Error::DataJoin {
            source_name: "cases/daily".to_string(),
            detail: "no date is shared by every region".to_string(),
        });
    }

    let dates: Vec<NaiveDate> = common.into_iter().collect();
    let date_col: HashMap<NaiveDate, usize> = cases
        .dates
        .iter()
        .enumerate()
        .map(|(i, d)| (*d, i))
        .collect();

    let n = regions.len();
    let t = dates.len();
    let mut dataset = RegionDataset {
        regions,
        dates: dates.clone(),
        confirmed: vec![Vec::with_capacity(t); n],
        active: vec![Vec::with_capacity(t); n],
        hospitalized: vec![Vec::with_capacity(t); n],
        new_cases: vec![Vec::with_capacity(t); n],
        deaths: vec![Vec::with_capacity(t); n],
        recovered: vec![Vec::with_capacity(t); n],
    };
    for i in 0..n {
        for date in &dates {
            let daily = &by_key[&(i, *date)];
            dataset.confirmed[i].push(case_rows[i][date_col[date]]);
            dataset.active[i].push(daily.active);
            dataset.hospitalized[i].push(daily.hospitalized);
            dataset.new_cases[i].push(daily.new_cases);
            dataset.deaths[i].push(daily.deaths);
            dataset.recovered[i].push(daily.recovered);
        }
    }

    report.log();
    info!(
        regions = dataset.num_regions(),
        timesteps = dataset.num_timesteps(),
        "Joined region dataset"
    );
    Ok((dataset, report))
}

/// Paths of the three input tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataPaths {
    pub metadata: std::path::PathBuf,
    pub cases: std::path::PathBuf,
    pub daily: std::path::PathBuf,
}

/// Load and join all sources.
pub fn load_dataset(paths: &DataPaths, range: &DateRange) -> Result<(RegionDataset, JoinReport)> {
    let metadata = load_region_metadata(&paths.metadata)?;
    let cases = load_case_table(&paths.cases, range)?;
    let (daily, missing) = load_daily_table(&paths.daily)?;
    let (dataset, mut report) = join_sources(metadata, cases, daily)?;
    report.missing_values_filled += missing;
    Ok((dataset, report))
}

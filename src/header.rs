//! Header dictionaries and the modality-specific header policies

use crate::error::{CubeError, Result};
use crate::types::Modality;
use chrono::{NaiveDateTime, TimeDelta};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// A scalar header value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{}", v),
            HeaderValue::Int(v) => write!(f, "{}", v),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

/// Key → scalar header dictionary
pub type Header = BTreeMap<String, HeaderValue>;

/// Keys of a record-table extension header that describe structure, not columns
pub const STRUCTURAL_KEYS: [&str; 7] = [
    "XTENSION", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "PCOUNT", "GCOUNT",
];

/// Date format of `STARTOBS` / `DATE_OBS`
pub const T_FORMAT_MS: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Parse `2014-03-29T14:09:38.830` or `2014-03-29T14:09:38`
pub fn parse_date(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| CubeError::Serialization(format!("invalid date '{}': {}", value, e)))
}

/// Format a date with millisecond precision
pub fn format_date(date: &NaiveDateTime) -> String {
    date.format(T_FORMAT_MS).to_string()
}

/// Seconds since the Unix epoch
pub fn to_epoch(date: &NaiveDateTime) -> f64 {
    date.and_utc().timestamp_micros() as f64 / 1e6
}

/// Resolve a channel selector against the `TDESCn` keys of a primary header
///
/// Returns the zero-based position among the described channels. An empty
/// selector picks the first channel.
pub fn find_channel(primary: &Header, selector: &str) -> Result<usize> {
    let mut keys: Vec<(usize, &str)> = primary
        .iter()
        .filter_map(|(key, value)| {
            let n = key.strip_prefix("TDESC")?.parse::<usize>().ok()?;
            Some((n, value.as_str()?))
        })
        .collect();
    keys.sort_by_key(|(n, _)| *n);

    if selector.is_empty() {
        return Ok(0);
    }

    let matches: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, (_, desc))| desc.contains(selector))
        .map(|(pos, _)| pos)
        .collect();

    match matches.as_slice() {
        [pos] => Ok(*pos),
        [] => Err(CubeError::InvalidChannel(format!(
            "no channel matches '{}'",
            selector
        ))),
        _ => Err(CubeError::InvalidChannel(format!(
            "'{}' matches {} channels",
            selector,
            matches.len()
        ))),
    }
}

/// Human readable channel description with slit-jaw names expanded
pub fn describe_line(tdesc: &str) -> String {
    tdesc
        .replace("SJI_1330", "C II 1330")
        .replace("SJI_1400", "Si IV 1400")
        .replace("SJI_2796", "Mg II h/k 2796")
        .replace("SJI_2832", "Mg II wing 2832")
}

/// Detect the modality from the `INSTRUME` key
pub fn detect_modality(primary: &Header, path: &Path) -> Result<Modality> {
    match primary.get("INSTRUME").and_then(HeaderValue::as_str) {
        Some(s) if s.contains("SJI") => Ok(Modality::Sji),
        Some(s) if s.contains("SPEC") => Ok(Modality::Raster),
        _ => Err(CubeError::UnsupportedFile(format!(
            "{} is neither a slit-jaw nor a raster file",
            path.display()
        ))),
    }
}

/// Normalize the primary header of an observation file
pub fn prepare_primary(raw: &Header, path: &Path) -> Result<Header> {
    let mut header = raw.clone();
    header.remove("");
    if let Some(HeaderValue::Text(saa)) = header.get_mut("SAA") {
        *saa = saa.trim().to_string();
    }
    header.insert("NAXIS".to_string(), HeaderValue::Int(2));

    let start = match header.get("STARTOBS").and_then(HeaderValue::as_str) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => return Err(CubeError::corrupt(path, "no STARTOBS in primary header")),
    };
    header.insert("DATE_OBS".to_string(), HeaderValue::Text(start));
    Ok(header)
}

/// Column layout of a per-step record table, `(key, column)` in header order
pub fn record_columns(table_header: &Header) -> Vec<(String, usize)> {
    let mut columns: Vec<(String, usize)> = table_header
        .iter()
        .filter(|(key, _)| !STRUCTURAL_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| Some((key.clone(), value.as_i64()? as usize)))
        .collect();
    columns.sort_by_key(|(_, col)| *col);
    columns
}

/// Turn a record table into one header per row
///
/// `DATE_OBS` is rebuilt as `STARTOBS + TIME`.
pub fn records_to_headers(
    table_header: &Header,
    data: &Array2<f64>,
    start_obs: &NaiveDateTime,
    path: &Path,
) -> Result<Vec<Header>> {
    let declared = table_header
        .keys()
        .filter(|key| !STRUCTURAL_KEYS.contains(&key.as_str()))
        .count();
    let columns = record_columns(table_header);
    if data.ncols() != declared || columns.len() != declared {
        return Err(CubeError::corrupt(
            path,
            format!(
                "record table has {} columns but {} header keys",
                data.ncols(),
                declared
            ),
        ));
    }
    if let Some((key, col)) = columns.iter().find(|(_, col)| *col >= data.ncols()) {
        return Err(CubeError::corrupt(
            path,
            format!("header key {} points at missing column {}", key, col),
        ));
    }

    let mut headers = Vec::with_capacity(data.nrows());
    for row in data.rows() {
        let mut header: Header = columns
            .iter()
            .map(|(key, col)| (key.clone(), HeaderValue::Float(row[*col])))
            .collect();
        if let Some(seconds) = header.get("TIME").and_then(HeaderValue::as_f64) {
            let offset = TimeDelta::microseconds((seconds * 1e6).round() as i64);
            header.insert(
                "DATE_OBS".to_string(),
                HeaderValue::Text(format_date(&(*start_obs + offset))),
            );
        }
        headers.push(header);
    }
    Ok(headers)
}

fn copy_key(header: &mut Header, to: &str, from: &str) {
    if let Some(value) = header.get(from).cloned() {
        header.insert(to.to_string(), value);
    }
}

/// Modality-specific header corrections
pub trait HeaderPolicy: Send + Sync + fmt::Debug {
    fn modality(&self) -> Modality;

    /// Fix one time-specific record in place
    fn fix_time_specific(&self, _header: &mut Header) {}

    /// Line-specific header of the selected channel, if the modality has one
    ///
    /// `channel` is the one-based channel number used by `TDESCn`-style keys.
    fn line_specific(&self, _primary_raw: &Header, _extension: &Header, _channel: usize) -> Option<Header> {
        None
    }

    /// Merge primary, line-specific and time-specific headers into one step header
    fn combine(
        &self,
        primary: &Header,
        line_specific: Option<&Header>,
        time_specific: &Header,
        channel: usize,
    ) -> Header;
}

/// Slit-jaw corrections
#[derive(Debug, Default, Clone, Copy)]
pub struct SjiHeaderPolicy;

impl HeaderPolicy for SjiHeaderPolicy {
    fn modality(&self) -> Modality {
        Modality::Sji
    }

    fn combine(
        &self,
        primary: &Header,
        _line_specific: Option<&Header>,
        time_specific: &Header,
        _channel: usize,
    ) -> Header {
        let mut header = primary.clone();
        header.extend(time_specific.iter().map(|(k, v)| (k.clone(), v.clone())));

        copy_key(&mut header, "XCEN", "XCENIX");
        copy_key(&mut header, "YCEN", "YCENIX");
        copy_key(&mut header, "PC1_1", "PC1_1IX");
        copy_key(&mut header, "PC1_2", "PC1_2IX");
        copy_key(&mut header, "PC2_1", "PC2_1IX");
        copy_key(&mut header, "PC2_2", "PC2_2IX");
        copy_key(&mut header, "CRVAL1", "XCENIX");
        copy_key(&mut header, "CRVAL2", "YCENIX");
        copy_key(&mut header, "EXPTIME", "EXPTIMES");
        header
    }
}

/// Spectrograph raster corrections
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterHeaderPolicy;

const RASTER_DROPPED_KEYS: [&str; 10] = [
    "PC1_1IX", "PC1_2IX", "PC2_1IX", "PC2_2IX", "PC2_3IX", "PC3_1IX", "PC3_2IX", "PC3_3IX",
    "OPHASEIX", "OBS_VRIX",
];

impl HeaderPolicy for RasterHeaderPolicy {
    fn modality(&self) -> Modality {
        Modality::Raster
    }

    fn fix_time_specific(&self, header: &mut Header) {
        if let Some(value) = header.remove("DSRCNIX") {
            header.insert("DSRCRCNIX".to_string(), value);
        }
        for key in RASTER_DROPPED_KEYS {
            header.remove(key);
        }
    }

    fn line_specific(&self, primary_raw: &Header, extension: &Header, channel: usize) -> Option<Header> {
        let mut header = extension.clone();
        for (to, from) in [
            ("WAVELNTH", "TWAVE"),
            ("WAVENAME", "TDESC"),
            ("WAVEMIN", "TWMIN"),
            ("WAVEMAX", "TWMAX"),
        ] {
            if let Some(value) = primary_raw.get(&format!("{}{}", from, channel)) {
                header.insert(to.to_string(), value.clone());
            }
        }
        Some(header)
    }

    fn combine(
        &self,
        primary: &Header,
        line_specific: Option<&Header>,
        time_specific: &Header,
        channel: usize,
    ) -> Header {
        let mut header = primary.clone();
        if let Some(line) = line_specific {
            header.extend(line.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        header.extend(time_specific.iter().map(|(k, v)| (k.clone(), v.clone())));

        copy_key(&mut header, "XCEN", "XCENIX");
        copy_key(&mut header, "YCEN", "YCENIX");
        copy_key(&mut header, "CRVAL2", "YCENIX");

        // FUV detectors report EXPTIMEF, NUV detectors EXPTIMEN
        let band = header
            .get(&format!("TDET{}", channel))
            .and_then(HeaderValue::as_str)
            .and_then(|det| det.chars().next());
        if let Some(band) = band {
            copy_key(&mut header, "EXPTIME", &format!("EXPTIME{}", band));
        }
        header
    }
}

/// Pick the header policy for a modality
pub fn policy_for(modality: Modality) -> Box<dyn HeaderPolicy> {
    match modality {
        Modality::Sji => Box::new(SjiHeaderPolicy),
        Modality::Raster => Box::new(RasterHeaderPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn primary() -> Header {
        let mut h = Header::new();
        h.insert("INSTRUME".into(), "SPEC".into());
        h.insert("STARTOBS".into(), "2014-03-29T14:09:38.830".into());
        h.insert("SAA".into(), "           0".into());
        h.insert("TDESC1".into(), "C II 1336".into());
        h.insert("TDESC2".into(), "Fe XII 1349".into());
        h.insert("TDESC3".into(), "Mg II k 2796".into());
        h.insert("TWAVE3".into(), 2796.35.into());
        h.insert("TDET3".into(), "NUV".into());
        h
    }

    #[test]
    fn test_find_channel() {
        let h = primary();
        assert_eq!(find_channel(&h, "Mg").unwrap(), 2);
        assert_eq!(find_channel(&h, "").unwrap(), 0);
        assert!(matches!(
            find_channel(&h, "Si"),
            Err(CubeError::InvalidChannel(_))
        ));
        // ambiguous: C II, Fe XII and Mg II
        assert!(matches!(
            find_channel(&h, "II"),
            Err(CubeError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_prepare_primary() {
        let h = prepare_primary(&primary(), Path::new("a")).unwrap();
        assert_eq!(h["SAA"], HeaderValue::Text("0".into()));
        assert_eq!(h["NAXIS"], HeaderValue::Int(2));
        assert_eq!(h["DATE_OBS"], h["STARTOBS"]);

        let mut raw = primary();
        raw.remove("STARTOBS");
        assert!(prepare_primary(&raw, Path::new("a")).is_err());
    }

    #[test]
    fn test_records_to_headers() {
        let mut table = Header::new();
        table.insert("XTENSION".into(), "IMAGE".into());
        table.insert("NAXIS".into(), HeaderValue::Int(2));
        table.insert("TIME".into(), HeaderValue::Int(0));
        table.insert("EXPTIMEN".into(), HeaderValue::Int(1));
        let data = array![[0.0, 8.0], [18.82, 8.0]];
        let start = parse_date("2014-03-29T14:09:38.830").unwrap();

        let headers = records_to_headers(&table, &data, &start, Path::new("a")).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers[1]["DATE_OBS"],
            HeaderValue::Text("2014-03-29T14:09:57.650".into())
        );
        assert_eq!(headers[0]["EXPTIMEN"].as_f64(), Some(8.0));
    }

    #[test]
    fn test_records_column_mismatch() {
        let mut table = Header::new();
        table.insert("TIME".into(), HeaderValue::Int(0));
        let data = array![[0.0, 1.0]];
        let start = parse_date("2014-03-29T14:09:38").unwrap();
        assert!(matches!(
            records_to_headers(&table, &data, &start, Path::new("a")),
            Err(CubeError::CorruptFile { .. })
        ));
    }

    #[test]
    fn test_raster_policy() {
        let policy = RasterHeaderPolicy;
        let mut t = Header::new();
        t.insert("DSRCNIX".into(), 1.0.into());
        t.insert("PC1_1IX".into(), 1.0.into());
        t.insert("XCENIX".into(), 10.0.into());
        t.insert("YCENIX".into(), 20.0.into());
        t.insert("EXPTIMEN".into(), 8.0.into());
        policy.fix_time_specific(&mut t);
        assert!(t.contains_key("DSRCRCNIX"));
        assert!(!t.contains_key("PC1_1IX"));

        let raw = primary();
        let line = policy.line_specific(&raw, &Header::new(), 3).unwrap();
        assert_eq!(line["WAVELNTH"].as_f64(), Some(2796.35));

        let combined = policy.combine(&raw, Some(&line), &t, 3);
        assert_eq!(combined["XCEN"].as_f64(), Some(10.0));
        assert_eq!(combined["CRVAL2"].as_f64(), Some(20.0));
        assert_eq!(combined["EXPTIME"].as_f64(), Some(8.0));
    }

    #[test]
    fn test_sji_policy() {
        let mut t = Header::new();
        t.insert("XCENIX".into(), 1.5.into());
        t.insert("EXPTIMES".into(), 4.0.into());
        let combined = SjiHeaderPolicy.combine(&primary(), None, &t, 1);
        assert_eq!(combined["CRVAL1"].as_f64(), Some(1.5));
        assert_eq!(combined["EXPTIME"].as_f64(), Some(4.0));
        assert!(!combined.contains_key("YCEN"));
    }

    #[test]
    fn test_dates() {
        let d = parse_date("2014-03-29T14:09:38").unwrap();
        assert_eq!(format_date(&d), "2014-03-29T14:09:38.000");
        assert_eq!(to_epoch(&parse_date("1970-01-01T00:00:01.500").unwrap()), 1.5);
        assert_eq!(describe_line("SJI_1400"), "Si IV 1400");
    }
}

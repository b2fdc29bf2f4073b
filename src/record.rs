use std::num::ParseFloatError;
use thiserror::Error;

/// Minimum number of tab-separated fields in a valid line.
pub const MIN_FIELDS: usize = 5;

/// One parsed `device_type \t device_id \t lat \t lon \t apps` line.
///
/// Borrows the identifiers from the source line; the record lives only as long
/// as a worker needs it to encode and store.
#[derive(Debug, Clone, PartialEq)]
pub struct AppsInstalled<'a> {
    pub device_type: &'a str,
    pub device_id: &'a str,
    pub lat: f64,
    pub lon: f64,
    pub apps: Vec<u32>,
}

impl AppsInstalled<'_> {
    /// Store key: `"{device_type}:{device_id}"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.device_type, self.device_id)
    }
}

/// Why a line could not become an [`AppsInstalled`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    #[error("expected at least 5 tab-separated fields, got {0}")]
    TooFewFields(usize),
    #[error("empty {0}")]
    EmptyField(&'static str),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("line is not valid {0}")]
    InvalidEncoding(&'static str),
    #[error("invalid latitude `{value}`: {source}")]
    InvalidLatitude {
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("invalid longitude `{value}`: {source}")]
    InvalidLongitude {
        value: String,
        #[source]
        source: ParseFloatError,
    },
}

/// Parse one (already trimmed) input line.
///
/// Fields past the fifth are ignored. App ids are lenient: blank tokens and
/// tokens that are not a `u32` are dropped without failing the record.
pub fn parse_apps_installed(line: &str) -> Result<AppsInstalled<'_>, FormatError> {
    let mut fields = line.splitn(MIN_FIELDS + 1, '\t');
    let mut parts: [&str; MIN_FIELDS] = [""; MIN_FIELDS];
    for (i, slot) in parts.iter_mut().enumerate() {
        *slot = fields.next().ok_or(FormatError::TooFewFields(i))?;
    }
    let [device_type, device_id, raw_lat, raw_lon, raw_apps] = parts;

    if device_type.is_empty() {
        return Err(FormatError::EmptyField("device_type"));
    }
    if device_id.is_empty() {
        return Err(FormatError::EmptyField("device_id"));
    }

    let lat = raw_lat
        .parse::<f64>()
        .map_err(|source| FormatError::InvalidLatitude {
            value: raw_lat.to_string(),
            source,
        })?;
    let lon = raw_lon
        .parse::<f64>()
        .map_err(|source| FormatError::InvalidLongitude {
            value: raw_lon.to_string(),
            source,
        })?;

    Ok(AppsInstalled {
        device_type,
        device_id,
        lat,
        lon,
        apps: parse_app_ids(raw_apps),
    })
}

fn parse_app_ids(raw: &str) -> Vec<u32> {
    raw.split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .filter_map(|tok| tok.parse::<u32>().ok())
        .collect()
}

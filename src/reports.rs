//! Pure assembly of report filter payloads: date normalization, range
//! validation, and the flat key/value map reporting endpoints expect.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::Error;
use crate::locations::LocationSelection;

/// Normalizes a local datetime (`YYYY-MM-DDTHH:MM[:SS]`) to the
/// `"YYYY-MM-DD HH:MM:00"` shape the kardex-style endpoints expect.
///
/// Seconds in the input are truncated and re-padded as `:00`. Empty input
/// stays empty (open-ended range side).
pub fn to_report_datetime(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let (date, time) = match value.split_once('T') {
        Some((date, time)) => (date, time),
        None => (value, "00:00"),
    };
    let hhmm = if time.len() >= 5 { &time[..5] } else { "00:00" };
    format!("{date} {hhmm}:00")
}

/// The order-endpoint variant: `T` becomes a space, seconds are neither
/// added nor stripped.
///
/// The two formats coexist per endpoint in the backend contract; keep them
/// separate rather than unifying.
pub fn to_report_datetime_minutes(value: &str) -> String {
    value.replace('T', " ")
}

/// Validates a date range. Either side may be empty (open-ended); a
/// non-empty start strictly after a non-empty end is an error.
pub fn validate_range(start: &str, end: &str) -> Result<(), Error> {
    if start.is_empty() || end.is_empty() {
        return Ok(());
    }
    let begin = parse_local(start)?;
    let finish = parse_local(end)?;
    if begin > finish {
        return Err(Error::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(())
}

fn parse_local(value: &str) -> Result<NaiveDateTime, Error> {
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default());
    }
    Err(Error::Validation(format!("unparseable date: {value}")))
}

/// What to do with an absent filter value. Most endpoints want the key
/// dropped; the kardex endpoint expects explicit empty-string placeholders.
/// That inconsistency is the documented backend contract, not ours to fix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmptyPolicy {
    Omit,
    Placeholder,
}

/// Flat, ordered key/value parameter set for a reporting endpoint.
///
/// Feed the result straight into `reqwest`'s `.query()` or a JSON body.
#[derive(Clone, Debug)]
pub struct ReportParams {
    policy: EmptyPolicy,
    pairs: Vec<(String, String)>,
}

impl ReportParams {
    pub fn new(policy: EmptyPolicy) -> Self {
        ReportParams {
            policy,
            pairs: Vec::new(),
        }
    }

    /// Adds a key with a value that is always present
    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    /// Adds a key whose value may be absent, applying the empty policy
    pub fn set_opt(mut self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.pairs.push((key.to_string(), value.to_string())),
            None => {
                if self.policy == EmptyPolicy::Placeholder {
                    self.pairs.push((key.to_string(), String::new()));
                }
            }
        }
        self
    }

    pub fn empresa(self, empresa_id: i64) -> Self {
        self.set("empresa_id", empresa_id)
    }

    /// Adds a pre-normalized date range under the conventional keys
    pub fn date_range(self, fecha_inicio: &str, fecha_fin: &str) -> Self {
        self.set_opt(
            "fecha_inicio",
            (!fecha_inicio.is_empty()).then(|| fecha_inicio.to_string()),
        )
        .set_opt(
            "fecha_fin",
            (!fecha_fin.is_empty()).then(|| fecha_fin.to_string()),
        )
    }

    /// Adds every location level under its wire key
    pub fn location(self, selection: &LocationSelection) -> Self {
        self.set_opt("pais_id", selection.country_id)
            .set_opt("departamento_id", selection.department_id)
            .set_opt("municipio_id", selection.municipality_id)
            .set_opt("sede_id", selection.site_id)
            .set_opt("bloque_id", selection.block_id)
            .set_opt("espacio_id", selection.space_id)
            .set_opt("almacen_id", selection.warehouse_id)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kardex_datetime_gets_padded_seconds() {
        assert_eq!(to_report_datetime("2024-03-15T14:30"), "2024-03-15 14:30:00");
        assert_eq!(to_report_datetime("2024-03-15T14:30:45"), "2024-03-15 14:30:00");
        assert_eq!(to_report_datetime("2024-03-15"), "2024-03-15 00:00:00");
        assert_eq!(to_report_datetime(""), "");
    }

    #[test]
    fn order_datetime_only_swaps_the_separator() {
        assert_eq!(
            to_report_datetime_minutes("2024-03-15T14:30"),
            "2024-03-15 14:30"
        );
        assert_eq!(to_report_datetime_minutes(""), "");
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = validate_range("2024-03-10", "2024-03-01").unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
    }

    #[test]
    fn open_ended_ranges_are_valid() {
        assert!(validate_range("", "2024-03-01").is_ok());
        assert!(validate_range("2024-03-01", "").is_ok());
        assert!(validate_range("", "").is_ok());
    }

    #[test]
    fn ordered_range_is_valid() {
        assert!(validate_range("2024-03-01T08:00", "2024-03-01T09:30").is_ok());
    }

    #[test]
    fn omit_policy_drops_null_levels() {
        let selection = LocationSelection {
            country_id: Some(1),
            department_id: Some(5),
            ..Default::default()
        };
        let params = ReportParams::new(EmptyPolicy::Omit)
            .empresa(9)
            .date_range("2024-03-01 00:00:00", "")
            .location(&selection);

        let keys: Vec<&str> = params.pairs().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["empresa_id", "fecha_inicio", "pais_id", "departamento_id"]);
    }

    #[test]
    fn placeholder_policy_emits_empty_strings() {
        let params = ReportParams::new(EmptyPolicy::Placeholder)
            .empresa(9)
            .location(&LocationSelection::default());

        assert_eq!(params.pairs().len(), 8);
        assert!(params
            .pairs()
            .iter()
            .skip(1)
            .all(|(_, v)| v.is_empty()));
    }
}

//! Heater telemetry decoding.
//!
//! The heater board answers `RDH` with a comma-delimited status line such as
//! `$HC,MODE,1,PWM,400,TEMP,26.5,END`. Only the measured temperature is
//! consumed here; the remaining fields ride along untouched (the logging loop
//! records the raw line verbatim).

use crate::error::{SpimError, SpimResult};

/// Decoded heater status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    /// Measured bath temperature in °C.
    pub temperature_c: f64,
}

/// Decode the measured temperature from a heater status line.
///
/// The value is located positionally: the first `TEMP` token, then the two
/// comma delimiters at or after it — the temperature lies strictly between
/// them. A line without the `END` completion marker is a truncated read and
/// fails outright; callers retry rather than propagate garbage.
pub fn decode_heater_status(line: &str) -> SpimResult<TelemetryFrame> {
    if !line.contains("END") {
        return Err(SpimError::Decode(format!(
            "heater status missing END marker: {:?}",
            line.trim_end()
        )));
    }

    let keyword = line.find("TEMP").ok_or_else(|| {
        SpimError::Decode(format!(
            "heater status missing TEMP field: {:?}",
            line.trim_end()
        ))
    })?;

    let mut delimiters = line
        .char_indices()
        .filter(|&(index, ch)| ch == ',' && index >= keyword)
        .map(|(index, _)| index);
    let (Some(first), Some(second)) = (delimiters.next(), delimiters.next()) else {
        return Err(SpimError::Decode(format!(
            "heater status TEMP field not delimited: {:?}",
            line.trim_end()
        )));
    };

    let field = line[first + 1..second].trim();
    let temperature_c = if field.contains('.') {
        field
            .parse::<f64>()
            .map_err(|err| SpimError::Decode(format!("bad temperature {field:?}: {err}")))?
    } else {
        field
            .parse::<i64>()
            .map_err(|err| SpimError::Decode(format!("bad temperature {field:?}: {err}")))?
            as f64
    };

    Ok(TelemetryFrame { temperature_c })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_fractional_temperature() {
        let frame = decode_heater_status("$HC,MODE,1,PWM,400,TEMP,26.5,END").unwrap();
        assert_eq!(frame.temperature_c, 26.5);
    }

    #[test]
    fn test_decode_integer_temperature() {
        let frame = decode_heater_status("$HC,MODE,2,PWM,799,TEMP,40,END").unwrap();
        assert_eq!(frame.temperature_c, 40.0);
    }

    #[test]
    fn test_decode_recovers_synthetic_value_exactly() {
        let line = format!("$HC,MODE,1,PWM,120,TEMP,{},END", 19.875);
        let frame = decode_heater_status(&line).unwrap();
        assert_eq!(frame.temperature_c, 19.875);
    }

    #[test]
    fn test_truncated_line_without_end_fails() {
        let err = decode_heater_status("$HC,MODE,1,PWM,400,TEMP,26.5").unwrap_err();
        assert!(err.to_string().contains("END"));
    }

    #[test]
    fn test_line_without_temp_keyword_fails() {
        assert!(decode_heater_status("$HC,MODE,1,PWM,400,END").is_err());
    }

    #[test]
    fn test_temp_field_without_two_delimiters_fails() {
        assert!(decode_heater_status("$HC,TEMP END").is_err());
    }

    #[test]
    fn test_trailing_newline_tolerated() {
        let frame = decode_heater_status("$HC,MODE,0,PWM,0,TEMP,17.25,END\r\n").unwrap();
        assert_eq!(frame.temperature_c, 17.25);
    }
}

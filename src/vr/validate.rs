use super::code::VrCode;
use regex::Regex;
use std::sync::LazyLock;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VrValidationError {
    #[error("value for VR {vr} does not match the expected format")]
    BadFormat { vr: VrCode },
    #[error("value exceeds maximum length {max} for VR {vr}")]
    TooLong { vr: VrCode, max: usize },
}

/// Per-VR literal format checks, enforced on rule save and at match time,
/// per spec.md §4.1.
pub fn validate_literal(vr: VrCode, value: &str) -> Result<(), VrValidationError> {
    use VrCode::*;
    let ok = match vr {
        Ae => value.len() <= 16 && !value.contains('\\') && !value.chars().any(|c| c.is_control()),
        As => AS_RE.is_match(value),
        At => AT_RE.is_match(value),
        Cs => value.len() <= 16 && CS_RE.is_match(value),
        Da => value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()) && is_valid_gregorian(value),
        Ds => value.len() <= 16 && DS_RE.is_match(value),
        Dt => value.len() <= 26 && DT_RE.is_match(value),
        Fl => value.parse::<f64>().map(|v| v.abs() <= 3.4e38).unwrap_or(false),
        Fd => value.parse::<f64>().is_ok(),
        Is => value.len() <= 12 && value.parse::<i64>().map(|v| v >= i32::MIN as i64 && v <= i32::MAX as i64).unwrap_or(false),
        Lo => value.len() <= 64 && !value.contains('\\'),
        Lt => value.len() <= 10240,
        Pn => value.split(['^', '=']).all(|c| c.len() <= 64) && !value.contains('\\'),
        Sh => value.len() <= 16 && !value.contains('\\'),
        Sl => value.parse::<i64>().map(|v| v >= i32::MIN as i64 && v <= i32::MAX as i64).unwrap_or(false),
        Ss => value.parse::<i64>().map(|v| v >= i16::MIN as i64 && v <= i16::MAX as i64).unwrap_or(false),
        St => value.len() <= 1024,
        Tm => TM_RE.is_match(value) && value.len() <= 16,
        Ui => value.len() <= 64 && UI_RE.is_match(value),
        Ul => value.parse::<i64>().map(|v| v >= 0 && v <= u32::MAX as i64).unwrap_or(false),
        Us => value.parse::<i64>().map(|v| v >= 0 && v <= u16::MAX as i64).unwrap_or(false),
        Ut => (value.len() as u64) <= (u32::MAX as u64 - 2),
        Other => value.len() <= 1024,
    };
    if ok {
        Ok(())
    } else {
        Err(VrValidationError::BadFormat { vr })
    }
}

fn is_valid_gregorian(s: &str) -> bool {
    let (Ok(y), Ok(m), Ok(d)) = (s[0..4].parse::<i32>(), s[4..6].parse::<u32>(), s[6..8].parse::<u32>()) else {
        return false;
    };
    time::Date::from_calendar_date(y, time_month(m), d as u8).is_ok()
}

fn time_month(m: u32) -> time::Month {
    use time::Month::*;
    [
        January, February, March, April, May, June, July, August, September, October, November,
        December,
    ]
    .get((m.wrapping_sub(1)) as usize)
    .copied()
    .unwrap_or(January)
}

static AS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{3}[DWMY]$").unwrap());
static AT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\([0-9A-Fa-f]{4},[0-9A-Fa-f]{4}\)$").unwrap());
static CS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 _]*$").unwrap());
static DS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap());
static DT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}(\d{2}(\d{2}(\d{2}(\d{2}(\d{2}(\.\d{1,6})?)?)?)?)?)?([+-]\d{4})?$").unwrap()
});
static TM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}(\d{2}(\d{2}(\.\d{1,6})?)?)?$").unwrap());
static UI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)*$").unwrap());

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(VrCode::Da, "20240131", true)]
    #[case(VrCode::Da, "20240230", false)]
    #[case(VrCode::As, "030Y", true)]
    #[case(VrCode::As, "30Y", false)]
    #[case(VrCode::Ui, "1.2.840.10008.1.1", true)]
    #[case(VrCode::Ui, "1.2.a", false)]
    #[case(VrCode::Is, "2147483647", true)]
    #[case(VrCode::Is, "9999999999", false)]
    fn test_validate_literal(#[case] vr: VrCode, #[case] value: &str, #[case] expected: bool) {
        assert_eq!(validate_literal(vr, value).is_ok(), expected);
    }
}

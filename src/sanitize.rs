use regex::Regex;
use std::sync::LazyLock;

/// Replace disallowed characters with "_". Also strips NUL bytes, which a
/// malformed DICOM string value can carry.
pub(crate) fn sanitize_path<S: AsRef<str>>(s: S) -> String {
    let s_nonull = s.as_ref().replace('\0', "");
    VALID_CHARS_RE.replace_all(&s_nonull, "_").to_string()
}

static VALID_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^A-Za-z0-9\.\-]+"#).unwrap());

/// Sanitize a patient id for use in the reidentified RT Structure filename,
/// per spec.md §4.8 step 4: replace any character not in `[A-Za-z0-9_-]`
/// with `_`, collapse runs of `_`, strip leading/trailing `_`, falling back
/// to `"UNKNOWN"` if nothing remains.
pub(crate) fn sanitize_patient_id<S: AsRef<str>>(s: S) -> String {
    let replaced = PATIENT_ID_INVALID_RE.replace_all(s.as_ref(), "_");
    let collapsed = PATIENT_ID_RUNS_RE.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        "UNKNOWN".to_string()
    } else {
        trimmed.to_string()
    }
}

static PATIENT_ID_INVALID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^A-Za-z0-9_\-]"#).unwrap());
static PATIENT_ID_RUNS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"_+"#).unwrap());

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Patient 001", "Patient_001")]
    #[case("__lead_trail__", "lead_trail")]
    #[case("!!!", "UNKNOWN")]
    #[case("John^Doe", "John_Doe")]
    fn test_sanitize_patient_id(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_patient_id(input), expected);
    }
}

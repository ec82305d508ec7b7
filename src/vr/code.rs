use std::fmt;
use std::str::FromStr;

/// DICOM Value Representation categories used to decide which operators are
/// legal, per spec.md §4.1 "VR categories".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrCategory {
    Numeric,
    String,
    DateTime,
    Special,
}

/// The two-letter VR code of a DICOM tag's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VrCode {
    Ae,
    As,
    At,
    Cs,
    Da,
    Ds,
    Dt,
    Fl,
    Fd,
    Is,
    Lo,
    Lt,
    Pn,
    Sh,
    Sl,
    Ss,
    St,
    Tm,
    Ui,
    Ul,
    Us,
    Ut,
    /// Any VR code not enumerated above (SQ, OB, OW, UN, ...).
    Other,
}

impl VrCode {
    pub fn category(self) -> VrCategory {
        use VrCode::*;
        match self {
            Fl | Fd | Sl | Ss | Ul | Us | Is | Ds => VrCategory::Numeric,
            Ae | Cs | Lo | Lt | Pn | Sh | St | Ut | Ui => VrCategory::String,
            Da | Dt | Tm => VrCategory::DateTime,
            Other => VrCategory::Special,
        }
    }
}

impl FromStr for VrCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use VrCode::*;
        let code = match s.to_ascii_uppercase().as_str() {
            "AE" => Ae,
            "AS" => As,
            "AT" => At,
            "CS" => Cs,
            "DA" => Da,
            "DS" => Ds,
            "DT" => Dt,
            "FL" => Fl,
            "FD" => Fd,
            "IS" => Is,
            "LO" => Lo,
            "LT" => Lt,
            "PN" => Pn,
            "SH" => Sh,
            "SL" => Sl,
            "SS" => Ss,
            "ST" => St,
            "TM" => Tm,
            "UI" => Ui,
            "UL" => Ul,
            "US" => Us,
            "UT" => Ut,
            _ => Other,
        };
        Ok(code)
    }
}

impl fmt::Display for VrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use VrCode::*;
        let s = match self {
            Ae => "AE",
            As => "AS",
            At => "AT",
            Cs => "CS",
            Da => "DA",
            Ds => "DS",
            Dt => "DT",
            Fl => "FL",
            Fd => "FD",
            Is => "IS",
            Lo => "LO",
            Lt => "LT",
            Pn => "PN",
            Sh => "SH",
            Sl => "SL",
            Ss => "SS",
            St => "ST",
            Tm => "TM",
            Ui => "UI",
            Ul => "UL",
            Us => "US",
            Ut => "UT",
            Other => "??",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("CS", VrCategory::String)]
    #[case("DA", VrCategory::DateTime)]
    #[case("US", VrCategory::Numeric)]
    #[case("SQ", VrCategory::Special)]
    fn test_category(#[case] code: &str, #[case] expected: VrCategory) {
        assert_eq!(code.parse::<VrCode>().unwrap().category(), expected);
    }
}

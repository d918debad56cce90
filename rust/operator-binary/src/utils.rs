use std::fmt::Write as _; // import without risk of name clashing
use std::fmt::LowerHex;

use openssl::{
    asn1::{Asn1Time, Asn1TimeRef, TimeDiff},
    sha::Sha256,
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use time::OffsetDateTime;

/// Helper for formatting byte arrays
pub struct FmtByteSlice<'a>(pub &'a [u8]);
impl LowerHex for FmtByteSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            f.write_fmt(format_args!("{:02x}", byte))?;
        }
        Ok(())
    }
}

/// Combines the messages of an error and its sources into a [`String`] of the form `"error: source 1: source 2: root error"`
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    // Build the full hierarchy of error messages by walking up the stack until an error
    // without `source` set is encountered and concatenating all encountered error strings.
    let mut full_msg = format!("{}", err);
    let mut curr_err = err.source();
    while let Some(curr_source) = curr_err {
        let _ = write!(full_msg, ": {}", curr_source);
        curr_err = curr_source.source();
    }
    full_msg
}

/// Hex-encoded SHA-256 over the concatenation of `chunks`.
pub fn sha256_hex<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    format!("{:x}", FmtByteSlice(&hasher.finish()))
}

/// Converts an [`OffsetDateTime`] into an OpenSSL [`Asn1Time`], truncating to whole seconds.
pub fn offsetdatetime_to_asn1time(
    dt: OffsetDateTime,
) -> Result<Asn1Time, openssl::error::ErrorStack> {
    Asn1Time::from_unix(dt.unix_timestamp())
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Asn1TimeParseError {
    #[snafu(display("unix epoch is not a valid Asn1Time"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("unable to diff Asn1Time"))]
    Diff { source: openssl::error::ErrorStack },

    #[snafu(display("unable to parse as OffsetDateTime"))]
    Parse { source: time::error::ComponentRange },

    #[snafu(display("time overflowed"))]
    Overflow,
}

/// Converts an OpenSSL [`Asn1TimeRef`] into a Rustier [`OffsetDateTime`].
pub fn asn1time_to_offsetdatetime(asn: &Asn1TimeRef) -> Result<OffsetDateTime, Asn1TimeParseError> {
    use asn1_time_parse_error::*;
    const SECS_PER_DAY: i64 = 60 * 60 * 24;
    let epoch = Asn1Time::from_unix(0).context(EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(DiffSnafu)?;
    OffsetDateTime::from_unix_timestamp(
        i64::from(days)
            .checked_mul(SECS_PER_DAY)
            .and_then(|day_secs| day_secs.checked_add(i64::from(secs)))
            .context(OverflowSnafu)?,
    )
    .context(ParseSnafu)
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use time::OffsetDateTime;

    use super::{asn1time_to_offsetdatetime, offsetdatetime_to_asn1time, sha256_hex};
    use crate::utils::{error_full_message, FmtByteSlice};

    #[test]
    fn fmt_hex_byte_slice() {
        assert_eq!(format!("{:x}", FmtByteSlice(&[1, 2, 255, 128])), "0102ff80");
    }

    #[test]
    fn sha256_hex_is_chunking_independent() {
        assert_eq!(
            sha256_hex([b"".as_slice()]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex([b"ab".as_slice(), b"c"]),
            sha256_hex([b"abc".as_slice()])
        );
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            error_full_message(anyhow::anyhow!("standalone error").as_ref()),
            "standalone error"
        );
        assert_eq!(
            error_full_message(
                anyhow::anyhow!("root error")
                    .context("middleware")
                    .context("leaf")
                    .as_ref()
            ),
            "leaf: middleware: root error"
        );
    }

    #[test]
    fn asn1time_to_offsetdatetime_should_work() {
        assert_eq!(
            asn1time_to_offsetdatetime(
                // Asn1Time uses a custom time format (https://www.openssl.org/docs/man3.2/man3/ASN1_TIME_set.html)
                // that is _roughly_ "ISO8601-1 without separator characters"
                &Asn1Time::from_str("20240102020304Z").unwrap()
            )
            .unwrap(),
            OffsetDateTime::parse(
                "2024-01-02T02:03:04Z",
                &time::format_description::well_known::Iso8601::DEFAULT
            )
            .unwrap()
        );
    }

    #[test]
    fn offsetdatetime_asn1time_roundtrip_drops_subseconds() {
        let dt = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
            + time::Duration::milliseconds(250);
        assert_eq!(
            asn1time_to_offsetdatetime(&offsetdatetime_to_asn1time(dt).unwrap()).unwrap(),
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
        );
    }
}

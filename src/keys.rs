//! Storage key conventions shared by every stage.
//!
//! Each stage finds its input and names its output purely from keys, so these
//! derivations must agree exactly across stages:
//!
//! | artifact            | key                                         |
//! |---------------------|---------------------------------------------|
//! | conversion shards   | `<prefix>/<basename>_pqs/00001.parquet`     |
//! | conversion marker   | `<prefix>/<basename>.done_pqs`              |
//! | result shards       | `<prefix>/<submission>_res/00001.parquet`   |
//! | validation marker   | `<prefix>/<submission>.done_res`            |
//! | report              | `<prefix>/<submission>_report.csv`          |
//!
//! `<submission>` is the leading run of digits of the last path segment.

use crate::error::{PipelineError, Result};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use std::sync::OnceLock;

pub const SHARD_EXTENSION: &str = ".parquet";
pub const CONVERSION_SUFFIX: &str = "_pqs";
pub const RESULT_SUFFIX: &str = "_res";
pub const CONVERSION_MARKER: &str = ".done_pqs";
pub const VALIDATION_MARKER: &str = ".done_res";
pub const REPORT_SUFFIX: &str = "report.csv";

fn leading_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+").expect("static pattern is valid"))
}

/// Non-empty `/`-separated segments of `key`.
#[must_use]
pub fn segments(key: &str) -> Vec<&str> {
    key.split('/').filter(|s| !s.is_empty()).collect()
}

fn split_last(key: &str) -> Result<(String, &str)> {
    let segs = segments(key);
    let Some((last, parents)) = segs.split_last() else {
        return Err(PipelineError::invalid_key(key, "key has no path segments"));
    };
    Ok((parents.join("/"), *last))
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Strip the extension from a file name (`123.csv` -> `123`).
#[must_use]
pub fn stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Submission id of the last segment of `key`: its leading digits.
///
/// # Errors
/// Returns [`PipelineError::InvalidKey`] if the last segment does not start
/// with a digit.
pub fn submission_id(key: &str) -> Result<String> {
    let (_, last) = split_last(key)?;
    leading_digits()
        .find(last)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| PipelineError::invalid_key(key, "last segment has no leading submission number"))
}

/// Zero-padded key of the `index`th (1-based) shard inside `dir`.
#[must_use]
pub fn shard_key(dir: &str, index: usize) -> String {
    format!("{}/{index:05}{SHARD_EXTENSION}", dir.trim_end_matches('/'))
}

/// Directory (with trailing `/`) holding the conversion shards of `source_key`.
///
/// # Errors
/// Returns an error if `source_key` is empty.
pub fn conversion_dir(source_key: &str) -> Result<String> {
    let (prefix, last) = split_last(source_key)?;
    Ok(format!("{}/", join(&prefix, &format!("{}{CONVERSION_SUFFIX}", stem(last)))))
}

/// Completion marker written once every conversion shard is stored.
///
/// # Errors
/// Returns an error if `source_key` is empty.
pub fn conversion_marker(source_key: &str) -> Result<String> {
    let (prefix, last) = split_last(source_key)?;
    Ok(join(&prefix, &format!("{}{CONVERSION_MARKER}", stem(last))))
}

/// Conversion shard directory named by any key the validate stage may receive:
/// a `.done_pqs` marker, a `_pqs/` directory (or a shard inside it), or the
/// raw upload key.
///
/// # Errors
/// Returns an error if `key` is empty.
pub fn conversion_dir_for(key: &str) -> Result<String> {
    let (prefix, last) = split_last(key)?;
    if let Some(base) = last.strip_suffix(CONVERSION_MARKER) {
        return Ok(format!("{}/", join(&prefix, &format!("{base}{CONVERSION_SUFFIX}"))));
    }
    let segs = segments(key);
    if let Some(pos) = segs.iter().rposition(|s| s.ends_with(CONVERSION_SUFFIX)) {
        return Ok(format!("{}/", segs[..=pos].join("/")));
    }
    conversion_dir(key)
}

/// Key of the shard-set (`_pqs` or `_res` directory, marker or upload) with
/// trailing shard names removed, so the submission segment is last.
fn submission_anchor(key: &str) -> Result<(String, String)> {
    let segs = segments(key);
    let end = segs
        .iter()
        .rposition(|s| s.ends_with(CONVERSION_SUFFIX) || s.ends_with(RESULT_SUFFIX))
        .map_or(segs.len(), |pos| pos + 1);
    let anchor = segs[..end].join("/");
    let sub = submission_id(&anchor)?;
    let (prefix, _) = split_last(&anchor)?;
    Ok((prefix, sub))
}

/// Directory (with trailing `/`) holding the result shards of the submission
/// `key` belongs to.
///
/// # Errors
/// Returns an error if no submission id can be derived from `key`.
pub fn result_dir(key: &str) -> Result<String> {
    let (prefix, sub) = submission_anchor(key)?;
    Ok(format!("{}/", join(&prefix, &format!("{sub}{RESULT_SUFFIX}"))))
}

/// Completion marker written by the validate stage.
///
/// # Errors
/// Returns an error if no submission id can be derived from `key`.
pub fn validation_marker(key: &str) -> Result<String> {
    let (prefix, sub) = submission_anchor(key)?;
    Ok(join(&prefix, &format!("{sub}{VALIDATION_MARKER}")))
}

/// Key of the downloadable report.
///
/// With a `root` override the first segment of the prefix is replaced by it.
///
/// # Errors
/// Returns an error if no submission id can be derived from `key`.
pub fn report_key(key: &str, root: Option<&str>) -> Result<String> {
    let (prefix, sub) = submission_anchor(key)?;
    let name = format!("{sub}_{REPORT_SUFFIX}");
    match root {
        Some(root) => {
            let root = root.trim_end_matches('/');
            let rest: Vec<&str> = segments(&prefix).into_iter().skip(1).collect();
            if rest.is_empty() {
                Ok(format!("{root}/{name}"))
            } else {
                Ok(format!("{root}/{}/{name}", rest.join("/")))
            }
        }
        None => Ok(join(&prefix, &name)),
    }
}

/// Whether `key` is a report written by the aggregate stage.
#[must_use]
pub fn is_report_key(key: &str) -> bool {
    key.ends_with(REPORT_SUFFIX)
}

/// Whether `key` names a shard file.
#[must_use]
pub fn is_shard_key(key: &str) -> bool {
    key.ends_with(SHARD_EXTENSION)
}

/// Characters left as-is in event keys: alphanumerics, `/` and the URL
/// unreserved marks.
const EVENT_KEY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Decode a key as it arrives in a storage event: `+` is a space and `%XX`
/// is a percent-encoded byte. Malformed escapes are kept verbatim.
#[must_use]
pub fn decode_event_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

/// Encode a key for a storage event body; the inverse of [`decode_event_key`].
#[must_use]
pub fn encode_event_key(key: &str) -> String {
    utf8_percent_encode(key, EVENT_KEY).to_string().replace("%20", "+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_layout() -> Result<()> {
        let key = "upload/2024/123456E/42.csv";
        assert_eq!(conversion_dir(key)?, "upload/2024/123456E/42_pqs/");
        assert_eq!(conversion_marker(key)?, "upload/2024/123456E/42.done_pqs");
        assert_eq!(shard_key(&conversion_dir(key)?, 3), "upload/2024/123456E/42_pqs/00003.parquet");
        Ok(())
    }

    #[test]
    fn validate_inputs_resolve_to_the_same_shards() -> Result<()> {
        let expected = "upload/2024/LEI/42_pqs/";
        assert_eq!(conversion_dir_for("upload/2024/LEI/42.done_pqs")?, expected);
        assert_eq!(conversion_dir_for("upload/2024/LEI/42_pqs/")?, expected);
        assert_eq!(conversion_dir_for("upload/2024/LEI/42_pqs/00001.parquet")?, expected);
        assert_eq!(conversion_dir_for("upload/2024/LEI/42.csv")?, expected);
        Ok(())
    }

    #[test]
    fn result_layout_uses_the_submission_number() -> Result<()> {
        assert_eq!(result_dir("upload/2024/LEI/42_v2.done_pqs")?, "upload/2024/LEI/42_res/");
        assert_eq!(result_dir("upload/2024/LEI/42_res/00002.parquet")?, "upload/2024/LEI/42_res/");
        assert_eq!(validation_marker("upload/2024/LEI/42_pqs/")?, "upload/2024/LEI/42.done_res");
        assert_eq!(report_key("upload/2024/LEI/42_res/", None)?, "upload/2024/LEI/42_report.csv");
        Ok(())
    }

    #[test]
    fn report_root_replaces_the_first_segment() -> Result<()> {
        assert_eq!(
            report_key("upload/2024/LEI/42_res/", Some("reports/"))?,
            "reports/2024/LEI/42_report.csv"
        );
        Ok(())
    }

    #[test]
    fn keys_without_a_submission_number_are_rejected() {
        assert!(matches!(result_dir("upload/2024/LEI/final.csv"), Err(PipelineError::InvalidKey { .. })));
        assert!(submission_id("").is_err());
    }

    #[test]
    fn event_keys_are_url_decoded() {
        assert_eq!(decode_event_key("upload/2024/LEI/42+copy.csv"), "upload/2024/LEI/42 copy.csv");
        assert_eq!(decode_event_key("a%2Fb%20c"), "a/b c");
        assert_eq!(decode_event_key("100%"), "100%");
        assert_eq!(decode_event_key("%zz"), "%zz");
        let key = "upload/2024/LEI/42 copy+1%.csv";
        assert_eq!(decode_event_key(&encode_event_key(key)), key);
        assert_eq!(encode_event_key("a b/é.csv"), "a+b/%C3%A9.csv");
        assert_eq!(decode_event_key("a+b/%C3%A9.csv"), "a b/é.csv");
    }

    #[test]
    fn report_keys_are_recognised() {
        assert!(is_report_key("upload/2024/LEI/42_report.csv"));
        assert!(!is_report_key("upload/2024/LEI/42.csv"));
    }
}

//! Canonical subject and scan identifiers for Scantrack.
//!
//! Every subject and scan in a study is named by a structured token:
//! study code, site code, subject number, optional timepoint and optional
//! session (repeat) number. Scan names extend the subject token with a
//! series tag, series number and free-form description.
//!
//! Two surface styles are in circulation and both are accepted:
//! underscored (`STUDY_SITE_0001_01`) and compact (`STU01SITE0001_01`).
//! The parsed identifier remembers which style it came from so that
//! formatting is an exact inverse of parsing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Identifier parsing result type.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Error returned when a raw token does not match the identifier grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("'{0}' does not match the subject identifier grammar")]
    MalformedIdentifier(String),

    #[error("'{0}' does not match the scan name grammar")]
    MalformedScanName(String),

    #[error("'{0}' has an unrecognized file extension")]
    UnrecognizedExtension(String),
}

/// Error returned when a well-formed identifier refers to a study or site
/// that is not registered in the active configuration.
///
/// Kept distinct from [`ParseError`] so callers can tell malformed input
/// apart from correctly-formed-but-unregistered input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("subject id '{subject}' has undefined study code '{study}'")]
    UnknownStudy { subject: String, study: String },

    #[error("subject id '{subject}' has undefined site '{site}' for study '{study}'")]
    UnknownSite {
        subject: String,
        site: String,
        study: String,
    },
}

/// Surface style the identifier token used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStyle {
    /// `STUDY_SITE_0001[_01[_01]]`
    Underscored,
    /// `STU01SITE0001[_01[_01]]`
    Compact,
}

/// What kind of subject an identifier names, judged purely by the shape of
/// the subject-number field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    /// A regular human participant.
    Subject,
    /// A scanner phantom (`PHA…` subject field).
    Phantom,
    /// A travelling human phantom (leading `P`, not `PHA`).
    HumanPhantom,
}

/// A parsed subject/session identifier.
///
/// Only the canonical string form is ever persisted; this struct is
/// reconstructed from the raw token on every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanIdentifier {
    study: String,
    site: String,
    subject: String,
    timepoint: Option<String>,
    session: Option<String>,
    style: IdStyle,
}

/// A parsed scan name: identifier plus tag, series and description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub ident: ScanIdentifier,
    pub tag: String,
    pub series: String,
    pub description: String,
}

/// File extensions recognized on scan filenames. Longest match wins so
/// `.nii.gz` is not mistaken for `.gz`.
const KNOWN_EXTENSIONS: &[&str] = &[
    ".nii.gz", ".tar.gz", ".mnc.gz", ".nii", ".mnc", ".dcm", ".bvec", ".bval", ".json", ".html",
];

fn compact_base_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // study tag: letters then digits; site: letters (lazy); subject:
        // PHA token, human-phantom P-number, or plain number.
        Regex::new(r"^([A-Z]+[0-9]+)([A-Z]+?)(PHA[A-Z0-9]*|P?[0-9]{2,})$").expect("static regex")
    })
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]+$").expect("static regex"))
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl ScanIdentifier {
    /// Parse a raw subject/session token.
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split('_').collect();
        if fields.iter().any(|f| f.is_empty()) {
            return Err(ParseError::MalformedIdentifier(raw.to_string()));
        }

        // Compact style: one base field, then up to two numeric suffixes.
        if let Some(caps) = compact_base_regex().captures(fields[0]) {
            let suffixes = &fields[1..];
            if suffixes.len() <= 2 && suffixes.iter().all(|f| is_numeric(f)) {
                return Ok(Self {
                    study: caps[1].to_string(),
                    site: caps[2].to_string(),
                    subject: caps[3].to_string(),
                    timepoint: suffixes.first().map(|s| s.to_string()),
                    session: suffixes.get(1).map(|s| s.to_string()),
                    style: IdStyle::Compact,
                });
            }
        }

        // Underscored style: study, site, subject, then up to two numeric
        // suffixes.
        if fields.len() >= 3 && fields.len() <= 5 {
            let valid_head = fields[..3].iter().all(|f| field_regex().is_match(f));
            let valid_tail = fields[3..].iter().all(|f| is_numeric(f));
            if valid_head && valid_tail {
                return Ok(Self {
                    study: fields[0].to_string(),
                    site: fields[1].to_string(),
                    subject: fields[2].to_string(),
                    timepoint: fields.get(3).map(|s| s.to_string()),
                    session: fields.get(4).map(|s| s.to_string()),
                    style: IdStyle::Underscored,
                });
            }
        }

        Err(ParseError::MalformedIdentifier(raw.to_string()))
    }

    pub fn study(&self) -> &str {
        &self.study
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn timepoint(&self) -> Option<&str> {
        self.timepoint.as_deref()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn style(&self) -> IdStyle {
        self.style
    }

    /// The repeat number of this visit, when the token carries one.
    pub fn repeat_number(&self) -> Option<i64> {
        self.session.as_deref().and_then(|s| s.parse().ok())
    }

    /// True when the subject-number field names a scanner phantom.
    pub fn is_phantom(&self) -> bool {
        self.subject.starts_with("PHA")
    }

    /// Classify the subject by the shape of its subject-number field.
    pub fn subject_kind(&self) -> SubjectKind {
        if self.is_phantom() {
            SubjectKind::Phantom
        } else if self.subject.starts_with('P') {
            SubjectKind::HumanPhantom
        } else {
            SubjectKind::Subject
        }
    }

    fn base(&self) -> String {
        match self.style {
            IdStyle::Underscored => format!("{}_{}_{}", self.study, self.site, self.subject),
            IdStyle::Compact => format!("{}{}{}", self.study, self.site, self.subject),
        }
    }

    /// The subject id without the session/repeat number. This is the key
    /// used by the QC checklist.
    pub fn subject_id(&self) -> String {
        let mut out = self.base();
        if let Some(tp) = &self.timepoint {
            out.push('_');
            out.push_str(tp);
        }
        out
    }

    /// The full identifier including the session number when present.
    pub fn full_id(&self) -> String {
        let mut out = self.subject_id();
        if let Some(sess) = &self.session {
            out.push('_');
            out.push_str(sess);
        }
        out
    }
}

impl fmt::Display for ScanIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_id())
    }
}

impl FromStr for ScanIdentifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl ParsedFilename {
    /// The scan id used as the database key: identifier + tag + series,
    /// without the free-form description.
    pub fn scan_id(&self) -> String {
        format!("{}_{}_{}", self.ident, self.tag, self.series)
    }

    /// The full scan name including the description.
    pub fn scan_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.ident, self.tag, self.series, self.description
        )
    }
}

impl fmt::Display for ParsedFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scan_name())
    }
}

/// Parse a raw subject/session token.
pub fn parse(raw: &str) -> Result<ScanIdentifier> {
    ScanIdentifier::parse(raw)
}

/// True when the token parses as a subject/session identifier.
pub fn is_scan_id(raw: &str) -> bool {
    ScanIdentifier::parse(raw).is_ok()
}

/// Parse a scan filename into identifier, tag, series and description.
///
/// Accepts a bare scan name, or a path with a recognized imaging extension.
/// An extension that is present but not recognized is an error.
pub fn parse_filename(raw: &str) -> Result<ParsedFilename> {
    let file_name = Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ParseError::MalformedScanName(raw.to_string()))?;

    let stem = strip_extension(file_name)?;

    let fields: Vec<&str> = stem.split('_').collect();
    if fields.iter().any(|f| f.is_empty()) {
        return Err(ParseError::MalformedScanName(raw.to_string()));
    }

    // Work out how many leading fields belong to the identifier. The base
    // is one field (compact) or three (underscored), followed by up to two
    // numeric suffixes. Tag, series and description always remain.
    let base_len = if compact_base_regex().is_match(fields[0]) {
        1
    } else {
        3
    };

    let mut ident_len = base_len;
    while ident_len < base_len + 2
        && fields.len() > ident_len + 3
        && is_numeric(fields[ident_len])
    {
        ident_len += 1;
    }

    if fields.len() < ident_len + 3 {
        return Err(ParseError::MalformedScanName(raw.to_string()));
    }

    let ident = ScanIdentifier::parse(&fields[..ident_len].join("_"))
        .map_err(|_| ParseError::MalformedScanName(raw.to_string()))?;

    let tag = fields[ident_len];
    let series = fields[ident_len + 1];
    if !is_numeric(series) {
        return Err(ParseError::MalformedScanName(raw.to_string()));
    }
    let description = fields[ident_len + 2..].join("_");

    Ok(ParsedFilename {
        ident,
        tag: tag.to_string(),
        series: series.to_string(),
        description,
    })
}

/// Strip a recognized imaging extension from a filename. A name with no
/// dot is returned unchanged; a dot with an unknown extension is an error.
fn strip_extension(name: &str) -> Result<&str> {
    for ext in KNOWN_EXTENSIONS {
        if let Some(stem) = name.strip_suffix(ext) {
            return Ok(stem);
        }
    }
    if name.contains('.') {
        return Err(ParseError::UnrecognizedExtension(name.to_string()));
    }
    Ok(name)
}

/// Cross-check a parsed identifier against the study-tag-to-site-list
/// lookup supplied by configuration.
pub fn validate(
    ident: &ScanIdentifier,
    study_tags: &HashMap<String, Vec<String>>,
) -> std::result::Result<(), ValidationError> {
    let sites = study_tags
        .get(ident.study())
        .ok_or_else(|| ValidationError::UnknownStudy {
            subject: ident.to_string(),
            study: ident.study().to_string(),
        })?;

    if !sites.iter().any(|s| s == ident.site()) {
        return Err(ValidationError::UnknownSite {
            subject: ident.to_string(),
            site: ident.site().to_string(),
            study: ident.study().to_string(),
        });
    }

    Ok(())
}

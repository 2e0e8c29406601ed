use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_CONTINUATION_TEMPLATE: &str = "{previous}{part}";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown barcode format: {0}")]
    UnknownFormat(String),
    #[error("invalid continuation template `{template}`: {reason}")]
    Template { template: String, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Symbology of a scanned code, persisted by its canonical name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BarcodeFormat {
    #[serde(rename = "AZTEC")]
    Aztec,
    #[serde(rename = "CODABAR")]
    Codabar,
    #[serde(rename = "CODE_39")]
    Code39,
    #[serde(rename = "CODE_93")]
    Code93,
    #[serde(rename = "CODE_128")]
    Code128,
    #[serde(rename = "DATA_MATRIX")]
    DataMatrix,
    #[serde(rename = "EAN_8")]
    Ean8,
    #[serde(rename = "EAN_13")]
    Ean13,
    #[serde(rename = "ITF")]
    Itf,
    #[serde(rename = "MAXICODE")]
    Maxicode,
    #[serde(rename = "PDF_417")]
    Pdf417,
    #[serde(rename = "QR_CODE")]
    QrCode,
    #[serde(rename = "RSS_14")]
    Rss14,
    #[serde(rename = "RSS_EXPANDED")]
    RssExpanded,
    #[serde(rename = "UPC_A")]
    UpcA,
    #[serde(rename = "UPC_E")]
    UpcE,
    #[serde(rename = "UPC_EAN_EXTENSION")]
    UpcEanExtension,
}

impl BarcodeFormat {
    pub const ALL: [Self; 17] = [
        Self::Aztec,
        Self::Codabar,
        Self::Code39,
        Self::Code93,
        Self::Code128,
        Self::DataMatrix,
        Self::Ean8,
        Self::Ean13,
        Self::Itf,
        Self::Maxicode,
        Self::Pdf417,
        Self::QrCode,
        Self::Rss14,
        Self::RssExpanded,
        Self::UpcA,
        Self::UpcE,
        Self::UpcEanExtension,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aztec => "AZTEC",
            Self::Codabar => "CODABAR",
            Self::Code39 => "CODE_39",
            Self::Code93 => "CODE_93",
            Self::Code128 => "CODE_128",
            Self::DataMatrix => "DATA_MATRIX",
            Self::Ean8 => "EAN_8",
            Self::Ean13 => "EAN_13",
            Self::Itf => "ITF",
            Self::Maxicode => "MAXICODE",
            Self::Pdf417 => "PDF_417",
            Self::QrCode => "QR_CODE",
            Self::Rss14 => "RSS_14",
            Self::RssExpanded => "RSS_EXPANDED",
            Self::UpcA => "UPC_A",
            Self::UpcE => "UPC_E",
            Self::UpcEanExtension => "UPC_EAN_EXTENSION",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AZTEC" => Some(Self::Aztec),
            "CODABAR" => Some(Self::Codabar),
            "CODE_39" => Some(Self::Code39),
            "CODE_93" => Some(Self::Code93),
            "CODE_128" => Some(Self::Code128),
            "DATA_MATRIX" => Some(Self::DataMatrix),
            "EAN_8" => Some(Self::Ean8),
            "EAN_13" => Some(Self::Ean13),
            "ITF" => Some(Self::Itf),
            "MAXICODE" => Some(Self::Maxicode),
            "PDF_417" => Some(Self::Pdf417),
            "QR_CODE" => Some(Self::QrCode),
            "RSS_14" => Some(Self::Rss14),
            "RSS_EXPANDED" => Some(Self::RssExpanded),
            "UPC_A" => Some(Self::UpcA),
            "UPC_E" => Some(Self::UpcE),
            "UPC_EAN_EXTENSION" => Some(Self::UpcEanExtension),
            _ => None,
        }
    }
}

impl Display for BarcodeFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarcodeFormat {
    type Err = HistoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| HistoryError::UnknownFormat(value.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub format: BarcodeFormat,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub is_favorite: bool,
    pub name: Option<String>,
}

/// A decoded code that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewRecord {
    pub format: BarcodeFormat,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl NewRecord {
    #[must_use]
    pub fn new(format: BarcodeFormat, text: impl Into<String>) -> Self {
        Self { format, text: text.into(), date: now_millis(), is_favorite: false, name: None }
    }

    #[must_use]
    pub fn favorite(mut self, is_favorite: bool) -> Self {
        self.is_favorite = is_favorite;
        self
    }

    #[must_use]
    pub fn named(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn at(mut self, date: OffsetDateTime) -> Self {
        self.date = truncate_to_millis(date);
        self
    }

    /// Display label to persist; a blank label is stored as absent.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        normalize_name(self.name.as_deref())
    }
}

/// Treat an empty or whitespace-only label as no label.
#[must_use]
pub fn normalize_name(name: Option<&str>) -> Option<&str> {
    name.filter(|name| !name.trim().is_empty())
}

/// Read-only `(date, format, text)` view handed to export consumers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub format: BarcodeFormat,
    pub text: String,
}

impl From<&Record> for ExportRecord {
    fn from(record: &Record) -> Self {
        Self { date: record.date, format: record.format, text: record.text.clone() }
    }
}

#[must_use]
pub fn now_millis() -> OffsetDateTime {
    truncate_to_millis(OffsetDateTime::now_utc())
}

#[must_use]
pub fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.nanosecond();
    value.replace_nanosecond(nanos - nanos % 1_000_000).unwrap_or(value)
}

/// Convert a timestamp into the persisted unix-milliseconds representation.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when the instant does not fit into an `i64`.
pub fn date_to_millis(value: OffsetDateTime) -> Result<i64, HistoryError> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| HistoryError::Validation(format!("date out of range: {value}")))
}

/// Convert persisted unix milliseconds back into a UTC timestamp.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when the value is outside the supported date range.
pub fn date_from_millis(millis: i64) -> Result<OffsetDateTime, HistoryError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| HistoryError::Validation(format!("invalid stored date {millis}: {err}")))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Listing {
    All,
    Favorites,
}

impl Listing {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Favorites => "favorites",
        }
    }
}

/// Offset/limit window into an ordered listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Page {
    pub offset: u64,
    pub limit: u32,
}

impl Page {
    #[must_use]
    pub fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }

    /// Build a page window.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] when `limit` is zero.
    pub fn new(offset: u64, limit: u32) -> Result<Self, HistoryError> {
        let page = Self { offset, limit };
        page.validate()?;
        Ok(page)
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self { offset: self.offset.saturating_add(u64::from(self.limit)), limit: self.limit }
    }

    /// # Errors
    /// Returns [`HistoryError::Validation`] when `limit` is zero.
    pub fn validate(self) -> Result<(), HistoryError> {
        if self.limit == 0 {
            return Err(HistoryError::Validation("page limit MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Previous,
    Part,
}

/// Pattern combining the last stored text with an incoming continuation part.
///
/// `{previous}` expands to the stored text, `{part}` to the incoming text, and
/// `{{` / `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContinuationTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl ContinuationTemplate {
    /// Parse and validate a template.
    ///
    /// # Errors
    /// Returns [`HistoryError::Template`] for unbalanced braces, unknown placeholders,
    /// or a template that drops either `{previous}` or `{part}`.
    pub fn parse(source: &str) -> Result<Self, HistoryError> {
        let invalid = |reason: String| HistoryError::Template {
            template: source.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(invalid("unterminated placeholder".to_string())),
                        }
                    }
                    let segment = match name.as_str() {
                        "previous" => Segment::Previous,
                        "part" => Segment::Part,
                        other => return Err(invalid(format!("unknown placeholder {{{other}}}"))),
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched `}`".to_string())),
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.contains(&Segment::Previous) {
            return Err(invalid("missing {previous} placeholder".to_string()));
        }
        if !segments.contains(&Segment::Part) {
            return Err(invalid("missing {part} placeholder".to_string()));
        }

        Ok(Self { source: source.to_string(), segments })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn render(&self, previous: &str, part: &str) -> String {
        let mut out = String::with_capacity(self.source.len() + previous.len() + part.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Previous => out.push_str(previous),
                Segment::Part => out.push_str(part),
            }
        }
        out
    }
}

impl Default for ContinuationTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_CONTINUATION_TEMPLATE.to_string(),
            segments: vec![Segment::Previous, Segment::Part],
        }
    }
}

impl Display for ContinuationTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for ContinuationTemplate {
    type Err = HistoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for ContinuationTemplate {
    type Error = HistoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContinuationTemplate> for String {
    fn from(value: ContinuationTemplate) -> Self {
        value.source
    }
}

/// First code point of every run of ten Unicode decimal digits (general category Nd).
const DECIMAL_DIGIT_ZEROS: [u32; 68] = [
    0x0030, 0x0660, 0x06F0, 0x07C0, 0x0966, 0x09E6, 0x0A66, 0x0AE6, 0x0B66, 0x0BE6, 0x0C66,
    0x0CE6, 0x0D66, 0x0DE6, 0x0E50, 0x0ED0, 0x0F20, 0x1040, 0x1090, 0x17E0, 0x1810, 0x1946,
    0x19D0, 0x1A80, 0x1A90, 0x1B50, 0x1BB0, 0x1C40, 0x1C50, 0xA620, 0xA8D0, 0xA900, 0xA9D0,
    0xA9F0, 0xAA50, 0xABF0, 0xFF10, 0x104A0, 0x10D30, 0x11066, 0x110F0, 0x11136, 0x111D0,
    0x112F0, 0x11450, 0x114D0, 0x11650, 0x116C0, 0x11730, 0x118E0, 0x11950, 0x11C50, 0x11D50,
    0x11DA0, 0x11F50, 0x16A60, 0x16AC0, 0x16B50, 0x1D7CE, 0x1D7D8, 0x1D7E2, 0x1D7EC, 0x1D7F6,
    0x1E140, 0x1E2F0, 0x1E4F0, 0x1E950, 0x1FBF0,
];

/// True for a Unicode decimal digit in any script; superscripts, fractions and
/// numeric letters such as roman numerals are not decimal digits.
#[must_use]
pub fn is_decimal_digit(ch: char) -> bool {
    if ch.is_ascii() {
        return ch.is_ascii_digit();
    }

    let code = u32::from(ch);
    let run = DECIMAL_DIGIT_ZEROS.partition_point(|&zero| zero <= code);
    run > 0 && code - DECIMAL_DIGIT_ZEROS[run - 1] < 10
}

/// True when `text` is non-empty and made only of decimal digits.
#[must_use]
pub fn is_digit_only(text: &str) -> bool {
    !text.is_empty() && text.chars().all(is_decimal_digit)
}

/// The subset of record-store operations the write policy composes.
///
/// Implementations are expected to run every call of one [`SavePolicy::apply`]
/// against the same transaction.
pub trait RecordRepository {
    type Error: Display;

    /// # Errors
    /// Returns the repository error when the lookup cannot be performed.
    fn find_by_natural_key(
        &self,
        format: BarcodeFormat,
        text: &str,
    ) -> Result<Option<Record>, Self::Error>;

    /// # Errors
    /// Returns the repository error when the lookup cannot be performed.
    fn last_record_id(&self) -> Result<Option<RecordId>, Self::Error>;

    /// # Errors
    /// Returns the repository error when the lookup cannot be performed.
    fn last_record_text(&self) -> Result<Option<String>, Self::Error>;

    /// # Errors
    /// Returns the repository error when the row cannot be written.
    fn insert(&self, record: &NewRecord) -> Result<RecordId, Self::Error>;

    /// # Errors
    /// Returns the repository error when the row cannot be updated.
    fn update_text(&self, id: RecordId, text: &str) -> Result<bool, Self::Error>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// A new row was written.
    Inserted(RecordId),
    /// An identical `(format, text)` row already existed; nothing was written.
    Duplicate(RecordId),
    /// The incoming text was folded into the last record.
    Merged(RecordId),
}

impl SaveOutcome {
    #[must_use]
    pub fn id(self) -> RecordId {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) | Self::Merged(id) => id,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted(_) => "inserted",
            Self::Duplicate(_) => "duplicate",
            Self::Merged(_) => "merged",
        }
    }
}

/// Decides whether an incoming record is inserted, collapsed into an existing
/// duplicate, or merged into the last record as a continuation part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePolicy {
    #[serde(default)]
    pub skip_duplicates: bool,
    #[serde(default)]
    pub continuation: ContinuationTemplate,
}

impl SavePolicy {
    #[must_use]
    pub fn new(skip_duplicates: bool, continuation: ContinuationTemplate) -> Self {
        Self { skip_duplicates, continuation }
    }

    #[must_use]
    pub fn with_skip_duplicates(mut self, skip_duplicates: bool) -> Self {
        self.skip_duplicates = skip_duplicates;
        self
    }

    /// Persist `record` through `repo` according to this policy.
    ///
    /// Issues at most one mutating call. A failed read while checking whether the
    /// last record awaits a continuation falls back to a plain insert.
    ///
    /// # Errors
    /// Returns the repository error from the natural-key lookup or the write.
    pub fn apply<R>(&self, repo: &R, record: &NewRecord) -> Result<SaveOutcome, R::Error>
    where
        R: RecordRepository + ?Sized,
    {
        if self.skip_duplicates {
            if let Some(existing) = repo.find_by_natural_key(record.format, &record.text)? {
                tracing::debug!(id = %existing.id, format = %record.format, "duplicate skipped");
                return Ok(SaveOutcome::Duplicate(existing.id));
            }
            return repo.insert(record).map(SaveOutcome::Inserted);
        }

        if let Some((id, previous)) = Self::continuation_target(repo) {
            let merged = self.continuation.render(&previous, &record.text);
            if repo.update_text(id, &merged)? {
                tracing::debug!(%id, "continuation part merged into last record");
                return Ok(SaveOutcome::Merged(id));
            }
        }

        repo.insert(record).map(SaveOutcome::Inserted)
    }

    fn continuation_target<R>(repo: &R) -> Option<(RecordId, String)>
    where
        R: RecordRepository + ?Sized,
    {
        let text = match repo.last_record_text() {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(error = %err, "last record text unreadable; treating as not numeric");
                return None;
            }
        };

        if !is_digit_only(&text) {
            return None;
        }

        match repo.last_record_id() {
            Ok(id) => id.map(|id| (id, text)),
            Err(err) => {
                tracing::warn!(error = %err, "last record id unreadable; treating as not numeric");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn template(source: &str) -> ContinuationTemplate {
        match ContinuationTemplate::parse(source) {
            Ok(template) => template,
            Err(err) => panic!("invalid fixture template {source}: {err}"),
        }
    }

    #[derive(Default)]
    struct MemoryRepository {
        rows: RefCell<Vec<Record>>,
        writes: RefCell<usize>,
        fail_reads: bool,
    }

    impl MemoryRepository {
        fn seeded(texts: &[&str]) -> Self {
            let repo = Self::default();
            for (offset, text) in texts.iter().enumerate() {
                let seconds = i64::try_from(offset).unwrap_or(i64::MAX);
                let record = NewRecord::new(BarcodeFormat::QrCode, *text)
                    .at(fixture_time() + Duration::seconds(seconds));
                if let Err(err) = repo.insert(&record) {
                    panic!("seed insert failed: {err}");
                }
            }
            *repo.writes.borrow_mut() = 0;
            repo
        }

        fn last(&self) -> Option<Record> {
            self.rows.borrow().iter().max_by_key(|row| (row.date, row.id)).cloned()
        }

        fn len(&self) -> usize {
            self.rows.borrow().len()
        }
    }

    impl RecordRepository for MemoryRepository {
        type Error = String;

        fn find_by_natural_key(
            &self,
            format: BarcodeFormat,
            text: &str,
        ) -> Result<Option<Record>, Self::Error> {
            Ok(self
                .rows
                .borrow()
                .iter()
                .filter(|row| row.format == format && row.text == text)
                .max_by_key(|row| row.id)
                .cloned())
        }

        fn last_record_id(&self) -> Result<Option<RecordId>, Self::Error> {
            if self.fail_reads {
                return Err("disk I/O error".to_string());
            }
            Ok(self.last().map(|row| row.id))
        }

        fn last_record_text(&self) -> Result<Option<String>, Self::Error> {
            if self.fail_reads {
                return Err("disk I/O error".to_string());
            }
            Ok(self.last().map(|row| row.text))
        }

        fn insert(&self, record: &NewRecord) -> Result<RecordId, Self::Error> {
            let mut rows = self.rows.borrow_mut();
            let next = rows.iter().map(|row| row.id.0).max().unwrap_or(0) + 1;
            rows.push(Record {
                id: RecordId(next),
                format: record.format,
                text: record.text.clone(),
                date: record.date,
                is_favorite: record.is_favorite,
                name: record.name.clone(),
            });
            *self.writes.borrow_mut() += 1;
            Ok(RecordId(next))
        }

        fn update_text(&self, id: RecordId, text: &str) -> Result<bool, Self::Error> {
            let mut rows = self.rows.borrow_mut();
            let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
                return Ok(false);
            };
            row.text = text.to_string();
            *self.writes.borrow_mut() += 1;
            Ok(true)
        }
    }

    #[test]
    fn format_names_are_unique_and_parse_back() {
        let names = BarcodeFormat::ALL.iter().map(|format| format.as_str()).collect::<BTreeSet<_>>();
        assert_eq!(names.len(), BarcodeFormat::ALL.len());

        for format in BarcodeFormat::ALL {
            assert_eq!(BarcodeFormat::parse(format.as_str()), Some(format));
            let json = match serde_json::to_string(&format) {
                Ok(json) => json,
                Err(err) => panic!("format should serialize: {err}"),
            };
            assert_eq!(json, format!("\"{}\"", format.as_str()));
        }
    }

    #[test]
    fn unknown_format_name_is_rejected() {
        assert_eq!(BarcodeFormat::parse("qr_code"), None);
        assert_eq!(
            "HOLOGRAM".parse::<BarcodeFormat>(),
            Err(HistoryError::UnknownFormat("HOLOGRAM".to_string()))
        );
    }

    #[test]
    fn default_template_concatenates() {
        assert_eq!(ContinuationTemplate::default().render("42", "7"), "427");
        assert_eq!(ContinuationTemplate::default(), template(DEFAULT_CONTINUATION_TEMPLATE));
    }

    #[test]
    fn template_supports_literals_and_escaped_braces() {
        let parsed = template("corpus/{previous}/part?id={part}&raw={{x}}");
        assert_eq!(parsed.render("42", "7"), "corpus/42/part?id=7&raw={x}");
        assert_eq!(parsed.as_str(), "corpus/{previous}/part?id={part}&raw={{x}}");
    }

    #[test]
    fn template_rejects_malformed_patterns() {
        for source in ["{previous}", "{part}", "{previous}{part", "{previous}}{part}", "{host}{previous}{part}", ""] {
            let Err(err) = ContinuationTemplate::parse(source) else {
                panic!("template `{source}` should be rejected");
            };
            assert!(matches!(err, HistoryError::Template { .. }), "unexpected error {err}");
        }
    }

    #[test]
    fn template_deserializes_with_validation() {
        let parsed: Result<ContinuationTemplate, _> = serde_json::from_str("\"{previous}-{part}\"");
        assert!(matches!(parsed, Ok(ref t) if t.render("1", "2") == "1-2"));

        let rejected: Result<ContinuationTemplate, _> = serde_json::from_str("\"{part}\"");
        assert!(rejected.is_err());
    }

    #[test]
    fn digit_only_check_rejects_empty_and_mixed_text() {
        assert!(is_digit_only("42"));
        assert!(is_digit_only("0007"));
        assert!(!is_digit_only(""));
        assert!(!is_digit_only("abc"));
        assert!(!is_digit_only("4 2"));
        assert!(!is_digit_only("-42"));
        assert!(!is_digit_only("4²"));
        assert!(!is_digit_only("½"));
        assert!(!is_digit_only("Ⅻ"));
        assert!(!is_digit_only("①"));
    }

    #[test]
    fn digit_only_accepts_decimal_digits_of_any_script() {
        assert!(is_digit_only("٤٢"));
        assert!(is_digit_only("۱۲۳"));
        assert!(is_digit_only("४२"));
        assert!(is_digit_only("４２"));
        assert!(is_digit_only("1٤2"));
        assert!(!is_digit_only("٤a"));
        assert!(is_decimal_digit('\u{0669}'));
        assert!(!is_decimal_digit('\u{066A}'));
        assert!(!is_decimal_digit('\u{065F}'));
    }

    #[test]
    fn page_rejects_zero_limit_and_advances() -> Result<(), HistoryError> {
        assert!(Page::new(0, 0).is_err());
        let page = Page::new(10, 5)?;
        assert_eq!(page.next(), Page { offset: 15, limit: 5 });
        assert_eq!(Page::default(), Page::first(DEFAULT_PAGE_SIZE));
        Ok(())
    }

    #[test]
    fn millis_conversion_truncates_sub_millisecond_precision() -> Result<(), HistoryError> {
        let precise = fixture_time() + Duration::nanoseconds(123_456_789);
        let millis = date_to_millis(precise)?;
        assert_eq!(millis, 1_700_000_000_123);
        assert_eq!(date_from_millis(millis)?, truncate_to_millis(precise));
        Ok(())
    }

    #[test]
    fn blank_display_name_is_treated_as_absent() {
        let record = NewRecord::new(BarcodeFormat::QrCode, "X").named(Some("  ".to_string()));
        assert_eq!(record.display_name(), None);
        let record = NewRecord::new(BarcodeFormat::QrCode, "X").named(Some(String::new()));
        assert_eq!(record.display_name(), None);
        let record = NewRecord::new(BarcodeFormat::QrCode, "X").named(Some("Lobby".to_string()));
        assert_eq!(record.display_name(), Some("Lobby"));
        assert_eq!(normalize_name(Some(" Lobby ")), Some(" Lobby "));
    }

    #[test]
    fn skip_duplicates_returns_existing_id_without_writing() -> Result<(), String> {
        let repo = MemoryRepository::default();
        let policy = SavePolicy::default().with_skip_duplicates(true);
        let record = NewRecord::new(BarcodeFormat::QrCode, "X");

        let first = policy.apply(&repo, &record)?;
        let second = policy.apply(&repo, &record)?;

        assert_eq!(first, SaveOutcome::Inserted(RecordId(1)));
        assert_eq!(second, SaveOutcome::Duplicate(RecordId(1)));
        assert_eq!(repo.len(), 1);
        Ok(())
    }

    #[test]
    fn skip_duplicates_never_merges_numeric_text() -> Result<(), String> {
        let repo = MemoryRepository::seeded(&["42"]);
        let policy = SavePolicy::default().with_skip_duplicates(true);

        let outcome = policy.apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "7"))?;

        assert_eq!(outcome, SaveOutcome::Inserted(RecordId(2)));
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.rows.borrow()[0].text, "42");
        Ok(())
    }

    #[test]
    fn numeric_last_record_absorbs_continuation_part() -> Result<(), String> {
        let repo = MemoryRepository::seeded(&["abc", "42"]);
        let policy = SavePolicy::new(false, template("{previous}:{part}"));

        let outcome = policy.apply(&repo, &NewRecord::new(BarcodeFormat::Ean13, "7"))?;

        assert_eq!(outcome, SaveOutcome::Merged(RecordId(2)));
        assert_eq!(repo.len(), 2);
        assert_eq!(*repo.writes.borrow(), 1);
        let last = repo.last().ok_or("missing last record")?;
        assert_eq!(last.id, RecordId(2));
        assert_eq!(last.text, "42:7");
        assert_eq!(last.format, BarcodeFormat::QrCode);
        Ok(())
    }

    #[test]
    fn merge_leaves_favorite_and_name_untouched() -> Result<(), String> {
        let repo = MemoryRepository::default();
        repo.insert(
            &NewRecord::new(BarcodeFormat::QrCode, "12")
                .favorite(true)
                .named(Some("pallet".to_string())),
        )?;

        SavePolicy::default().apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "34"))?;

        let last = repo.last().ok_or("missing last record")?;
        assert_eq!(last.text, "1234");
        assert!(last.is_favorite);
        assert_eq!(last.name.as_deref(), Some("pallet"));
        Ok(())
    }

    #[test]
    fn non_ascii_digit_last_record_absorbs_continuation_part() -> Result<(), String> {
        let repo = MemoryRepository::seeded(&["٤٢"]);

        let outcome = SavePolicy::default().apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "7"))?;

        assert_eq!(outcome, SaveOutcome::Merged(RecordId(1)));
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.last().map(|row| row.text), Some("٤٢7".to_string()));
        Ok(())
    }

    #[test]
    fn non_numeric_last_record_starts_a_new_entry() -> Result<(), String> {
        let repo = MemoryRepository::seeded(&["abc"]);

        let outcome = SavePolicy::default().apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "7"))?;

        assert_eq!(outcome, SaveOutcome::Inserted(RecordId(2)));
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.rows.borrow()[0].text, "abc");
        Ok(())
    }

    #[test]
    fn empty_last_text_never_triggers_merge() -> Result<(), String> {
        let repo = MemoryRepository::seeded(&[""]);

        let outcome = SavePolicy::default().apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "7"))?;

        assert_eq!(outcome, SaveOutcome::Inserted(RecordId(2)));
        Ok(())
    }

    #[test]
    fn empty_repository_inserts_fresh_row() -> Result<(), String> {
        let repo = MemoryRepository::default();

        let outcome = SavePolicy::default().apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "42"))?;

        assert_eq!(outcome, SaveOutcome::Inserted(RecordId(1)));
        assert_eq!(repo.len(), 1);
        Ok(())
    }

    #[test]
    fn unreadable_last_record_falls_back_to_insert() -> Result<(), String> {
        let mut repo = MemoryRepository::seeded(&["42"]);
        repo.fail_reads = true;

        let outcome = SavePolicy::default().apply(&repo, &NewRecord::new(BarcodeFormat::QrCode, "7"))?;

        assert_eq!(outcome, SaveOutcome::Inserted(RecordId(2)));
        assert_eq!(repo.rows.borrow()[0].text, "42");
        Ok(())
    }

    #[test]
    fn save_outcome_serializes_with_tag() {
        let json = serde_json::to_value(SaveOutcome::Merged(RecordId(9)));
        assert!(matches!(
            json,
            Ok(ref value) if *value == serde_json::json!({"outcome": "merged", "id": 9})
        ));
    }

    proptest! {
        #[test]
        fn digit_only_accepts_mixed_script_digit_strings(text in "[0-9٠-٩۰-۹०-९０-９]{1,12}") {
            prop_assert!(is_digit_only(&text));
        }

        #[test]
        fn digit_only_rejects_any_non_digit(
            digits in "[0-9٠-٩]{0,6}",
            other in "[a-zA-Z ./:²½Ⅻ-]",
            tail in "[0-9]{0,6}",
        ) {
            let text = format!("{digits}{other}{tail}");
            prop_assert!(!is_digit_only(&text));
        }

        #[test]
        fn rendered_text_keeps_previous_before_part(
            prefix in "[a-z/:]{0,8}",
            infix in "[a-z/?=]{0,8}",
            previous in "[0-9]{1,10}",
            part in "[0-9A-Z]{0,10}",
        ) {
            let source = format!("{prefix}{{previous}}{infix}{{part}}");
            let parsed = ContinuationTemplate::parse(&source);
            prop_assert!(parsed.is_ok());
            if let Ok(parsed) = parsed {
                let rendered = parsed.render(&previous, &part);
                prop_assert_eq!(rendered, format!("{prefix}{previous}{infix}{part}"));
            }
        }
    }
}

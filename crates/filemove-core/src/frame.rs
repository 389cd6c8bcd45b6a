//! Frame encoding and decoding for the FileMove wire protocol.
//!
//! A frame is the single metadata message exchanged at the start of a
//! session, before any raw file bytes. Two encodings exist:
//!
//! - [`FrameFormat::Delimited`]: fields joined by `|` and terminated by
//!   `\n`. Fields cannot contain `|` or line breaks; this is a hard input
//!   constraint and encoding such a field fails rather than escaping it.
//! - [`FrameFormat::LengthPrefixed`]: a 4-byte big-endian body length, a
//!   1-byte protocol version, then each field as a 2-byte big-endian length
//!   followed by its UTF-8 bytes. Any field content is allowed.
//!
//! Both peers must use the same format. The message type is chosen by the
//! action field (index 1) and the field count is then checked strictly.

use crate::PROTOCOL_VERSION;
use crate::error::{FrameError, ValidationError};
use crate::identity::Username;
use filemove_files::{FileDigest, validate_file_name};
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Field delimiter of the delimited format
pub const DELIMITER: char = '|';

/// Frame terminator of the delimited format
pub const TERMINATOR: u8 = b'\n';

/// Fields in an upload metadata frame
pub const UPLOAD_FIELDS: usize = 5;

/// Fields in a download request frame
pub const DOWNLOAD_FIELDS: usize = 3;

/// Size of the body length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest field a length-prefixed frame can carry
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Transfer action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Client sends a file to the server
    Upload,
    /// Client fetches a file from the server
    Download,
}

impl Action {
    /// Wire literal
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "Upload",
            Self::Download => "Download",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Upload" => Ok(Self::Upload),
            "Download" => Ok(Self::Download),
            other => Err(FrameError::UnknownAction(other.to_string())),
        }
    }
}

/// Frame encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameFormat {
    /// `|`-joined fields terminated by `\n`
    #[default]
    Delimited,
    /// Versioned frames with length-prefixed fields
    LengthPrefixed,
}

impl FrameFormat {
    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delimited => "delimited",
            Self::LengthPrefixed => "length-prefixed",
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delimited" => Ok(Self::Delimited),
            "length-prefixed" | "length_prefixed" => Ok(Self::LengthPrefixed),
            other => Err(format!("unknown frame format: {other}")),
        }
    }
}

// ============================================================================
// Field-level encoding
// ============================================================================

/// Encode fields into one frame
pub fn encode_fields<S: AsRef<str>>(fields: &[S], format: FrameFormat) -> Result<Vec<u8>, FrameError> {
    match format {
        FrameFormat::Delimited => {
            let mut out = Vec::new();
            for (index, field) in fields.iter().enumerate() {
                let field = field.as_ref();
                if field.contains([DELIMITER, '\n', '\r']) {
                    return Err(FrameError::DelimiterInField { index });
                }
                if index > 0 {
                    out.push(DELIMITER as u8);
                }
                out.extend_from_slice(field.as_bytes());
            }
            out.push(TERMINATOR);
            Ok(out)
        }
        FrameFormat::LengthPrefixed => {
            let mut body = vec![PROTOCOL_VERSION];
            for (index, field) in fields.iter().enumerate() {
                let bytes = field.as_ref().as_bytes();
                if bytes.len() > MAX_FIELD_LEN {
                    return Err(FrameError::FieldTooLong {
                        index,
                        len: bytes.len(),
                        max: MAX_FIELD_LEN,
                    });
                }
                body.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                body.extend_from_slice(bytes);
            }

            let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
            Ok(out)
        }
    }
}

/// Encoded size of `fields` in `format`
pub fn wire_len<S: AsRef<str>>(fields: &[S], format: FrameFormat) -> usize {
    let payload: usize = fields.iter().map(|f| f.as_ref().len()).sum();
    match format {
        // n - 1 delimiters plus the terminator
        FrameFormat::Delimited => payload + fields.len().max(1),
        FrameFormat::LengthPrefixed => LENGTH_PREFIX_SIZE + 1 + 2 * fields.len() + payload,
    }
}

/// Split one delimited line (without its terminator) into fields
pub fn decode_line(line: &[u8]) -> Result<Vec<String>, FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line).map_err(|_| FrameError::NonUtf8)?;
    Ok(text.split(DELIMITER).map(str::to_string).collect())
}

/// Parse the body of a length-prefixed frame (everything after the prefix)
pub fn decode_body(body: &[u8]) -> Result<Vec<String>, FrameError> {
    let (&version, mut rest) = body
        .split_first()
        .ok_or(FrameError::Truncated { received: 0 })?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let mut fields = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(FrameError::Truncated {
                received: body.len(),
            });
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(FrameError::Truncated {
                received: body.len(),
            });
        }
        let field = std::str::from_utf8(&rest[..len]).map_err(|_| FrameError::NonUtf8)?;
        fields.push(field.to_string());
        rest = &rest[len..];
    }
    Ok(fields)
}

// ============================================================================
// Reading frames from a stream
// ============================================================================

/// Failure to read a frame from a stream
#[derive(Debug, thiserror::Error)]
pub enum ReadFrameError {
    /// Stream ended before the first byte of a frame
    #[error("connection closed before a frame arrived")]
    Closed,

    /// Stream I/O error
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Frame exceeds the reader's limit
    ///
    /// `action` is set when the part that arrived already names one.
    #[error("frame exceeds {limit} bytes")]
    TooLong {
        /// Reader limit in bytes
        limit: usize,
        /// Action named by the head of the frame
        action: Option<Action>,
    },

    /// Bytes arrived but do not form a frame
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Read exactly one frame and split it into fields
///
/// Consumes the frame and nothing after it, so the byte stream that follows
/// stays in `reader`. A frame larger than `limit` bytes (terminator or
/// length prefix included) fails with [`ReadFrameError::TooLong`].
pub async fn read_fields<R>(
    reader: &mut R,
    format: FrameFormat,
    limit: usize,
) -> Result<Vec<String>, ReadFrameError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    match format {
        FrameFormat::Delimited => {
            let line = read_line(reader, limit).await?;
            Ok(decode_line(&line)?)
        }
        FrameFormat::LengthPrefixed => {
            let body = read_prefixed(reader, limit).await?;
            Ok(decode_body(&body)?)
        }
    }
}

async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ReadFrameError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Err(ReadFrameError::Closed);
            }
            return Err(FrameError::Truncated {
                received: line.len(),
            }
            .into());
        }

        let (taken, done) = match available.iter().position(|&b| b == TERMINATOR) {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                (pos + 1, true)
            }
            None => {
                line.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(taken);

        // The terminator counts toward the limit
        if line.len() + 1 > limit {
            return Err(ReadFrameError::TooLong {
                limit,
                action: action_hint(&line),
            });
        }
        if done {
            return Ok(line);
        }
    }
}

async fn read_prefixed<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ReadFrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let n = read_full(reader, &mut prefix).await?;
    if n == 0 {
        return Err(ReadFrameError::Closed);
    }
    if n < LENGTH_PREFIX_SIZE {
        return Err(FrameError::Truncated { received: n }.into());
    }

    let body_len = u32::from_be_bytes(prefix) as usize;
    if LENGTH_PREFIX_SIZE.saturating_add(body_len) > limit {
        return Err(ReadFrameError::TooLong {
            limit,
            action: None,
        });
    }

    let mut body = vec![0u8; body_len];
    let m = read_full(reader, &mut body).await?;
    if m < body_len {
        return Err(FrameError::Truncated {
            received: LENGTH_PREFIX_SIZE + m,
        }
        .into());
    }
    Ok(body)
}

/// Action of a partial delimited line, once its action field is complete
fn action_hint(line: &[u8]) -> Option<Action> {
    let mut parts = line.split(|&b| b == DELIMITER as u8);
    parts.next()?;
    let action = parts.next()?;
    parts.next()?;
    std::str::from_utf8(action).ok()?.parse().ok()
}

/// Fill `buf` unless EOF comes first; returns bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ============================================================================
// Messages
// ============================================================================

/// Action named by a frame's fields
pub fn peek_action(fields: &[String]) -> Result<Action, FrameError> {
    fields
        .get(1)
        .ok_or(FrameError::MissingAction(fields.len()))?
        .parse()
}

/// Metadata sent before a file's bytes: `username|action|name|size|checksum`
///
/// The uploader sends it with action `Upload`; the serving side of a
/// download replies with the same shape and action `Download`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Owner of the file
    pub username: String,
    /// `Upload`, or `Download` in a download reply
    pub action: Action,
    /// Bare file name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256 of the content
    pub checksum: String,
}

impl UploadMetadata {
    /// Metadata for an upload
    pub fn new(
        username: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        checksum: &FileDigest,
    ) -> Self {
        Self {
            username: username.into(),
            action: Action::Upload,
            name: name.into(),
            size,
            checksum: checksum.to_hex(),
        }
    }

    /// Metadata describing a file about to be served for download
    pub fn download_reply(
        username: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        checksum: &FileDigest,
    ) -> Self {
        Self {
            action: Action::Download,
            ..Self::new(username, name, size, checksum)
        }
    }

    /// Decode from exactly five fields
    pub fn from_fields(fields: &[String]) -> Result<Self, FrameError> {
        if fields.len() != UPLOAD_FIELDS {
            return Err(FrameError::FieldCount {
                expected: UPLOAD_FIELDS,
                actual: fields.len(),
            });
        }

        let action = fields[1].parse()?;
        let size = parse_size(&fields[3])?;

        Ok(Self {
            username: fields[0].clone(),
            action,
            name: fields[2].clone(),
            size,
            checksum: fields[4].clone(),
        })
    }

    /// Fields in wire order
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.action.as_str().to_string(),
            self.name.clone(),
            self.size.to_string(),
            self.checksum.clone(),
        ]
    }

    /// Encode as one frame
    pub fn encode(&self, format: FrameFormat) -> Result<Vec<u8>, FrameError> {
        encode_fields(&self.to_fields(), format)
    }

    /// Check required fields, size and checksum shape
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.username.is_empty() {
            return Err(ValidationError::EmptyField("username"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if self.checksum.is_empty() {
            return Err(ValidationError::EmptyField("checksum"));
        }
        if self.size == 0 {
            return Err(ValidationError::ZeroSize);
        }
        if Username::new(self.username.as_str()).is_err() {
            return Err(ValidationError::InvalidUsername(self.username.clone()));
        }
        if validate_file_name(&self.name).is_err() {
            return Err(ValidationError::InvalidFileName(self.name.clone()));
        }
        if FileDigest::from_hex(&self.checksum).is_err() {
            return Err(ValidationError::InvalidChecksum(self.checksum.clone()));
        }
        Ok(())
    }
}

fn parse_size(field: &str) -> Result<u64, FrameError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::InvalidSize(field.to_string()));
    }
    field
        .parse()
        .map_err(|_| FrameError::InvalidSize(field.to_string()))
}

/// Request for a stored file: `username|Download|name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Owner of the file
    pub username: String,
    /// Bare file name
    pub name: String,
}

impl DownloadRequest {
    /// Create a request
    pub fn new(username: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            name: name.into(),
        }
    }

    /// Decode from exactly three fields
    pub fn from_fields(fields: &[String]) -> Result<Self, FrameError> {
        if fields.len() != DOWNLOAD_FIELDS {
            return Err(FrameError::FieldCount {
                expected: DOWNLOAD_FIELDS,
                actual: fields.len(),
            });
        }

        let action: Action = fields[1].parse()?;
        if action != Action::Download {
            return Err(FrameError::UnexpectedAction {
                expected: Action::Download,
                actual: action,
            });
        }

        Ok(Self {
            username: fields[0].clone(),
            name: fields[2].clone(),
        })
    }

    /// Fields in wire order
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            Action::Download.as_str().to_string(),
            self.name.clone(),
        ]
    }

    /// Encode as one frame
    pub fn encode(&self, format: FrameFormat) -> Result<Vec<u8>, FrameError> {
        encode_fields(&self.to_fields(), format)
    }

    /// Check required fields
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.username.is_empty() {
            return Err(ValidationError::EmptyField("username"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if Username::new(self.username.as_str()).is_err() {
            return Err(ValidationError::InvalidUsername(self.username.clone()));
        }
        if validate_file_name(&self.name).is_err() {
            return Err(ValidationError::InvalidFileName(self.name.clone()));
        }
        Ok(())
    }
}

/// First frame of a session, as seen by the serving side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Upload metadata
    Upload(UploadMetadata),
    /// Download request
    Download(DownloadRequest),
}

impl Frame {
    /// Decode by action, then check the field count for that action
    pub fn decode(fields: &[String]) -> Result<Self, FrameError> {
        match peek_action(fields)? {
            Action::Upload => UploadMetadata::from_fields(fields).map(Self::Upload),
            Action::Download => DownloadRequest::from_fields(fields).map(Self::Download),
        }
    }

    /// Action of the frame
    pub fn action(&self) -> Action {
        match self {
            Self::Upload(meta) => meta.action,
            Self::Download(_) => Action::Download,
        }
    }

    /// Username carried by the frame
    pub fn username(&self) -> &str {
        match self {
            Self::Upload(meta) => &meta.username,
            Self::Download(req) => &req.username,
        }
    }

    /// Fields in wire order
    pub fn to_fields(&self) -> Vec<String> {
        match self {
            Self::Upload(meta) => meta.to_fields(),
            Self::Download(req) => req.to_fields(),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Response frame sent by the serving side
///
/// Codes are stable. The delimited format carries only the text (the
/// strings older peers expect); the length-prefixed format carries
/// `[code, text]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Response {
    /// Upload verified and stored
    ChecksumMatch = 0,
    /// Upload failed verification and was discarded
    ChecksumMismatch = 1,
    /// Upload frame could not be decoded or validated
    InvalidUploadMetadata = 2,
    /// Download frame could not be decoded or validated
    InvalidDownloadMetadata = 3,
    /// Requested file does not exist
    FileNotFound = 4,
    /// Requested file has no content
    EmptyFile = 5,
    /// Frame action could not be determined
    UnknownAction = 6,
    /// Serving side failed locally
    ServerError = 7,
}

impl Response {
    /// Every response, in code order
    pub const ALL: [Response; 8] = [
        Self::ChecksumMatch,
        Self::ChecksumMismatch,
        Self::InvalidUploadMetadata,
        Self::InvalidDownloadMetadata,
        Self::FileNotFound,
        Self::EmptyFile,
        Self::UnknownAction,
        Self::ServerError,
    ];

    /// Stable numeric code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human-readable text
    pub fn text(self) -> &'static str {
        match self {
            Self::ChecksumMatch => "Checksum match",
            Self::ChecksumMismatch => "Checksum mismatch",
            Self::InvalidUploadMetadata => "Invalid file upload metadata format",
            Self::InvalidDownloadMetadata => "Invalid file download metadata format",
            Self::FileNotFound => "File not found",
            Self::EmptyFile => "File is empty",
            Self::UnknownAction => "Unknown action",
            Self::ServerError => "Internal server error",
        }
    }

    /// Look up a response by its text
    pub fn from_text(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.text() == text)
    }

    /// Whether this is the positive acknowledgement
    pub fn is_success(self) -> bool {
        self == Self::ChecksumMatch
    }

    /// Number of fields a response frame has in `format`
    pub fn field_count(format: FrameFormat) -> usize {
        match format {
            FrameFormat::Delimited => 1,
            FrameFormat::LengthPrefixed => 2,
        }
    }

    /// Fields in wire order
    pub fn to_fields(self, format: FrameFormat) -> Vec<String> {
        match format {
            FrameFormat::Delimited => vec![self.text().to_string()],
            FrameFormat::LengthPrefixed => {
                vec![self.code().to_string(), self.text().to_string()]
            }
        }
    }

    /// Decode a response frame
    pub fn from_fields(fields: &[String], format: FrameFormat) -> Result<Self, FrameError> {
        let expected = Self::field_count(format);
        if fields.len() != expected {
            return Err(FrameError::FieldCount {
                expected,
                actual: fields.len(),
            });
        }

        match format {
            FrameFormat::Delimited => Self::from_text(&fields[0])
                .ok_or_else(|| FrameError::UnknownResponse(fields[0].clone())),
            FrameFormat::LengthPrefixed => fields[0]
                .parse::<u8>()
                .map_err(|_| FrameError::UnknownResponse(fields[0].clone()))
                .and_then(Self::try_from),
        }
    }

    /// Encode as one frame
    pub fn encode(self, format: FrameFormat) -> Result<Vec<u8>, FrameError> {
        encode_fields(&self.to_fields(format), format)
    }
}

impl TryFrom<u8> for Response {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|r| r.code() == value)
            .ok_or_else(|| FrameError::UnknownResponse(value.to_string()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// What the serving side answers to a download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadReply {
    /// File follows, described by this metadata
    Metadata(UploadMetadata),
    /// No file follows
    Response(Response),
}

impl DownloadReply {
    /// Decode by shape: response-sized frames are responses
    pub fn from_fields(fields: &[String], format: FrameFormat) -> Result<Self, FrameError> {
        if fields.len() == Response::field_count(format) {
            Response::from_fields(fields, format).map(Self::Response)
        } else {
            UploadMetadata::from_fields(fields).map(Self::Metadata)
        }
    }
}

//! Mail reader: `.eml` messages to plain text.

use super::inputs::select_sources;
use super::{item_error, Emitter, Stage, StageContext, StageOutcome};
use crate::config::WorkingArea;
use crate::core::{Artifact, ArtifactKind, StageKind};
use crate::errors::StageError;
use async_trait::async_trait;
use base64::Engine;
use scraper::{Html, Node};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const EXTENSIONS: &[&str] = &["eml"];
const ATTACHMENT_EXTENSIONS: &[&str] = &["csv"];

/// Reads `.eml` files from `source/` and writes their bodies to
/// `processing/<stem>.txt`.
///
/// HTML bodies win over plain text and are reduced to text. Spreadsheet
/// attachments are saved under `processing/<stem>/` for the table reader.
/// Files that cannot be read are moved to `error/`.
#[derive(Debug, Clone)]
pub struct MailReaderStage {
    name: String,
    area: WorkingArea,
    files: Option<Vec<String>>,
}

impl MailReaderStage {
    /// Creates a reader over the working area.
    #[must_use]
    pub fn new(area: WorkingArea) -> Self {
        Self {
            name: "mail_reader".to_string(),
            area,
            files: None,
        }
    }

    /// Restricts the reader to the given source files.
    #[must_use]
    pub fn with_files(mut self, files: Option<Vec<String>>) -> Self {
        self.files = files;
        self
    }

    async fn read_one(&self, path: &Path) -> Result<ReadMail, String> {
        let raw = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        let message = MailMessage::parse(&raw);
        let body = strip_body(&message.body_text()?);

        let stem = file_stem(path);
        let processing = self.area.processing();
        tokio::fs::create_dir_all(&processing).await.map_err(|e| e.to_string())?;
        let text_path = processing.join(format!("{stem}.txt"));
        tokio::fs::write(&text_path, body).await.map_err(|e| e.to_string())?;

        let mut read = ReadMail {
            text: text_path,
            attachments: Vec::new(),
            rejected: Vec::new(),
        };
        let attachments = message.attachments(ATTACHMENT_EXTENSIONS);
        if !attachments.is_empty() {
            let dir = processing.join(&stem);
            tokio::fs::create_dir_all(&dir).await.map_err(|e| e.to_string())?;
            for (name, data) in attachments {
                let data = match data {
                    Ok(data) => data,
                    Err(reason) => {
                        read.rejected.push((name, reason));
                        continue;
                    }
                };
                let target = dir.join(sanitize_file_name(&name));
                tokio::fs::write(&target, data).await.map_err(|e| e.to_string())?;
                read.attachments.push(target);
            }
        }
        Ok(read)
    }
}

/// What one message produced.
struct ReadMail {
    text: PathBuf,
    attachments: Vec<PathBuf>,
    /// Attachments that could not be decoded, with the reason.
    rejected: Vec<(String, String)>,
}

#[async_trait]
impl Stage for MailReaderStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Reader
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        let sources = select_sources(&self.area.source(), self.files.as_deref(), EXTENSIONS)
            .await
            .map_err(|e| StageError::fatal(&self.name, format!("cannot list source files: {e}")))?;
        info!(task_id = %ctx.task_id(), count = sources.len(), "Found mail files");

        for path in sources {
            ctx.checkpoint()?;
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            match self.read_one(&path).await {
                Ok(read) => {
                    debug!(file = %file_name, attachments = read.attachments.len(), "Read mail");
                    out.emit(Artifact::file(ArtifactKind::Text, &self.name, read.text)).await?;
                    for attachment in read.attachments {
                        out.emit(Artifact::file(ArtifactKind::Other, &self.name, attachment)).await?;
                    }
                    for (attachment, reason) in read.rejected {
                        warn!(file = %file_name, %attachment, error = %reason, "Cannot decode attachment");
                        let subject = format!("{file_name}/{attachment}");
                        item_error(out, &self.name, subject, reason).await?;
                    }
                }
                Err(reason) => {
                    warn!(file = %file_name, error = %reason, "Cannot read mail");
                    if let Err(e) = self.area.quarantine(&path).await {
                        warn!(file = %file_name, error = %e, "Cannot move mail to error area");
                    }
                    item_error(out, &self.name, file_name, reason).await?;
                }
            }
        }
        Ok(())
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

/// Trims each line and drops the empty ones.
fn strip_body(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// One MIME entity: lowercase header names and the raw body.
#[derive(Debug, Default)]
struct MailMessage {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MailMessage {
    fn parse(raw: &[u8]) -> Self {
        let (head, body) = split_head(raw);
        let head = String::from_utf8_lossy(head);
        let mut headers: Vec<(String, String)> = Vec::new();
        for line in head.lines() {
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }
        Self {
            headers,
            body: body.to_vec(),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    fn content_type(&self) -> (String, HashMap<String, String>) {
        parse_header_value(self.header("content-type").unwrap_or("text/plain"))
    }

    fn filename(&self) -> Option<String> {
        let (_, disposition) = parse_header_value(self.header("content-disposition").unwrap_or(""));
        let (_, content_type) = self.content_type();
        disposition
            .get("filename")
            .or_else(|| content_type.get("name"))
            .map(|n| decode_encoded_words(n))
    }

    fn is_attachment(&self) -> bool {
        self.header("content-disposition")
            .is_some_and(|d| d.to_ascii_lowercase().contains("attachment"))
    }

    fn decoded(&self) -> Result<Vec<u8>, String> {
        let encoding = self
            .header("content-transfer-encoding")
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match encoding.as_str() {
            "base64" => {
                let compact: Vec<u8> = self.body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
                base64::engine::general_purpose::STANDARD
                    .decode(compact)
                    .map_err(|e| format!("invalid base64: {e}"))
            }
            "quoted-printable" => Ok(decode_quoted_printable(&self.body)),
            _ => Ok(self.body.clone()),
        }
    }

    fn text(&self) -> Result<String, String> {
        let (_, params) = self.content_type();
        Ok(decode_charset(&self.decoded()?, params.get("charset").map(String::as_str)))
    }

    fn parts(&self) -> Vec<MailMessage> {
        let (mime, params) = self.content_type();
        let Some(boundary) = params.get("boundary").filter(|_| mime.starts_with("multipart/")) else {
            return Vec::new();
        };
        split_multipart(&self.body, boundary)
            .into_iter()
            .map(MailMessage::parse)
            .collect()
    }

    fn walk(&self, visit: &mut dyn FnMut(&MailMessage)) {
        visit(self);
        for part in self.parts() {
            part.walk(visit);
        }
    }

    /// The preferred body as plain text: HTML over plain text, attachments skipped.
    fn body_text(&self) -> Result<String, String> {
        let (mime, _) = self.content_type();
        if !mime.starts_with("multipart/") {
            let text = self.text()?;
            return Ok(if mime == "text/html" { html_to_text(&text) } else { text });
        }

        let mut plain = None;
        let mut html = None;
        self.walk(&mut |part| {
            if part.is_attachment() {
                return;
            }
            match part.content_type().0.as_str() {
                "text/plain" if plain.is_none() => plain = Some(part.text()),
                "text/html" if html.is_none() => html = Some(part.text()),
                _ => {}
            }
        });
        match html.transpose()?.filter(|h| !h.trim().is_empty()) {
            Some(html) => Ok(html_to_text(&html)),
            None => plain.transpose().map(Option::unwrap_or_default),
        }
    }

    /// Wanted attachments by file name; a part that fails to decode keeps
    /// its error.
    fn attachments(&self, extensions: &[&str]) -> Vec<(String, Result<Vec<u8>, String>)> {
        let mut found = Vec::new();
        self.walk(&mut |part| {
            let Some(name) = part.filename() else {
                return;
            };
            let wanted = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
            if wanted {
                match part.decoded() {
                    Ok(data) if data.is_empty() => {}
                    decoded => found.push((name, decoded)),
                }
            }
        });
        found
    }
}

fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    for (i, window) in raw.windows(2).enumerate() {
        if window == b"\n\n" {
            return (&raw[..i], &raw[i + 2..]);
        }
        if window == b"\r\n" && raw[i + 2..].starts_with(b"\r\n") {
            return (&raw[..i], &raw[i + 4..]);
        }
    }
    (raw, &[])
}

/// Splits `type/sub; key=value; ...` into the lowercase value and its parameters.
fn parse_header_value(value: &str) -> (String, HashMap<String, String>) {
    let mut pieces = value.split(';');
    let main = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
    let params = pieces
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_ascii_lowercase(),
                v.trim().trim_matches('"').to_string(),
            )
        })
        .collect();
    (main, params)
}

fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let closing = format!("{delimiter}--");
    let mut parts = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive(|b| *b == b'\n') {
        let trimmed = line.trim_ascii_end();
        let is_closing = trimmed == closing.as_bytes();
        if is_closing || trimmed == delimiter.as_bytes() {
            if let Some(s) = start {
                parts.push(trim_part(&body[s..offset]));
            }
            if is_closing {
                return parts;
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }
    parts
}

fn trim_part(part: &[u8]) -> &[u8] {
    let part = part.strip_suffix(b"\n").unwrap_or(part);
    part.strip_suffix(b"\r").unwrap_or(part)
}

fn decode_quoted_printable(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] == b'=' {
            match body.get(i + 1..i + 3) {
                Some(b"\r\n") => i += 3,
                Some([b'\n', _]) => i += 2,
                Some(hex) => match std::str::from_utf8(hex).ok().and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                },
                None => {
                    // Soft break on the last line.
                    if body.get(i + 1) != Some(&b'\n') {
                        out.push(b'=');
                    }
                    i = body.len();
                }
            }
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out
}

fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        Some("iso-8859-1" | "latin1" | "us-ascii" | "ascii") => bytes.iter().map(|&b| char::from(b)).collect(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Decodes RFC 2047 words such as `=?utf-8?B?...?=`.
fn decode_encoded_words(value: &str) -> String {
    let mut out = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("=?") {
        out.push_str(&rest[..start]);
        let word = &rest[start + 2..];
        let mut fields = word.splitn(3, '?');
        let (Some(charset), Some(encoding), Some(tail)) = (fields.next(), fields.next(), fields.next()) else {
            out.push_str(&rest[start..]);
            return out;
        };
        let Some(end) = tail.find("?=") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let text = &tail[..end];
        let bytes = if encoding.eq_ignore_ascii_case("b") {
            base64::engine::general_purpose::STANDARD
                .decode(text)
                .unwrap_or_default()
        } else {
            decode_quoted_printable(text.replace('_', " ").as_bytes())
        };
        out.push_str(&decode_charset(&bytes, Some(charset)));
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    out
}

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "tr", "li", "table", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre",
];

/// Reduces an HTML body to text, one line per block element.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    for node in document.tree.root().descendants() {
        match node.value() {
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => out.push('\n'),
            Node::Element(el) if matches!(el.name(), "td" | "th") => out.push(' '),
            Node::Text(text) => {
                let hidden = node
                    .parent()
                    .and_then(|p| p.value().as_element())
                    .is_some_and(|el| matches!(el.name(), "script" | "style" | "head" | "title"));
                if !hidden {
                    out.push_str(text);
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::core::StageResult;
    use crate::profile::{InMemoryProfileStore, ProfileStore};
    use crate::stages::stage_stream;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const MULTIPART: &str = "From: a@example.com\r\n\
Subject: report\r\n\
Content-Type: multipart/mixed;\r\n\
 boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: multipart/alternative; boundary=\"YY\"\r\n\
\r\n\
--YY\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain body\r\n\
--YY\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
<html><body><p>Name: Zhang =E5=BC=A0</p>\r\n\
<p>  </p><div>Amount: 12</div></body></html>\r\n\
--YY--\r\n\
--XX\r\n\
Content-Type: text/csv; name=\"data.csv\"\r\n\
Content-Disposition: attachment; filename=\"data.csv\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
bmFtZSxhbW91bnQKQSwx\r\n\
--XX--\r\n";

    #[test]
    fn test_prefers_html_body() {
        let message = MailMessage::parse(MULTIPART.as_bytes());
        assert_eq!(strip_body(&message.body_text().unwrap()), "Name: Zhang 张\nAmount: 12");
    }

    #[test]
    fn test_plain_message_and_folded_headers() {
        let raw = "Subject: hi\n there\nContent-Type: text/plain\n\n  line one  \n\n\nline two\n";
        let message = MailMessage::parse(raw.as_bytes());
        assert_eq!(message.header("subject"), Some("hi there"));
        assert_eq!(strip_body(&message.body_text().unwrap()), "line one\nline two");
    }

    #[test]
    fn test_csv_attachment_is_decoded() {
        let message = MailMessage::parse(MULTIPART.as_bytes());
        let attachments = message.attachments(ATTACHMENT_EXTENSIONS);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].0, "data.csv");
        assert_eq!(attachments[0].1.as_deref(), Ok(&b"name,amount\nA,1"[..]));
    }

    #[tokio::test]
    async fn test_corrupt_attachment_is_an_item_error() {
        let corrupt = MULTIPART.replace("bmFtZSxhbW91bnQKQSwx", "bm!!ZSx@@W91bnQ");
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();
        tokio::fs::write(area.source().join("a.eml"), corrupt).await.unwrap();

        let stage = Arc::new(MailReaderStage::new(area.clone()));
        let ctx = StageContext::new(
            "t",
            Arc::new(CancellationToken::new()),
            InMemoryProfileStore::new().snapshot(),
        );
        let results: Vec<StageResult> = stage_stream(stage, ctx, 4).collect().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].artifact().unwrap().name, "a.txt");
        match &results[1] {
            StageResult::Error(e) => {
                assert!(!e.is_fatal());
                assert_eq!(e.subject.as_deref(), Some("a.eml/data.csv"));
                assert!(e.message.contains("invalid base64"));
            }
            other => panic!("expected an item error, got {other:?}"),
        }
        assert!(!area.processing().join("a").join("data.csv").exists());
    }

    #[test]
    fn test_corrupt_base64_body_fails_the_message() {
        let raw = "Content-Type: text/plain\r\nContent-Transfer-Encoding: base64\r\n\r\n%%%not base64%%%\r\n";
        let message = MailMessage::parse(raw.as_bytes());
        assert!(message.body_text().unwrap_err().contains("invalid base64"));
    }

    #[test]
    fn test_encoded_word_file_name() {
        assert_eq!(decode_encoded_words("=?utf-8?B?5pWw5o2uLmNzdg==?="), "数据.csv");
        assert_eq!(decode_encoded_words("a=?utf-8?Q?b_c?=d"), "ab cd");
    }

    #[tokio::test]
    async fn test_stage_writes_text_and_quarantines_failures() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();
        tokio::fs::write(area.source().join("a.eml"), MULTIPART).await.unwrap();
        let files = vec!["a.eml".to_string(), "missing.eml".to_string()];

        let stage = Arc::new(MailReaderStage::new(area.clone()).with_files(Some(files)));
        let ctx = StageContext::new(
            "t",
            Arc::new(CancellationToken::new()),
            InMemoryProfileStore::new().snapshot(),
        );
        let results: Vec<StageResult> = stage_stream(stage, ctx, 4).collect().await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].artifact().unwrap().name, "a.txt");
        assert_eq!(results[1].artifact().unwrap().name, "data.csv");
        assert!(matches!(&results[2], StageResult::Error(e) if !e.is_fatal()));

        let text = tokio::fs::read_to_string(area.processing().join("a.txt")).await.unwrap();
        assert_eq!(text, "Name: Zhang 张\nAmount: 12");
        assert!(area.processing().join("a").join("data.csv").exists());
    }
}

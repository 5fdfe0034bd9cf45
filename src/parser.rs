//! Raw message parsing
//!
//! Turns RFC 5322 bytes into a [`ParsedMessage`] with `mailparse`.

use crate::model::{HeaderField, ParsedMessage};
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use thiserror::Error;

/// Parse failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("undecodable body: {0}")]
    Body(String),
}

impl From<mailparse::MailParseError> for ParseError {
    fn from(err: mailparse::MailParseError) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

/// Parser capability used by the pipeline
pub trait MessageParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage, ParseError>;
}

/// `mailparse`-backed parser
#[derive(Debug, Clone, Default)]
pub struct MailParser;

impl MailParser {
    pub fn new() -> Self {
        Self
    }
}

impl MessageParser for MailParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage, ParseError> {
        let mail = mailparse::parse_mail(raw)?;
        if mail.headers.is_empty() {
            return Err(ParseError::Malformed("no header section".to_string()));
        }

        let headers = mail.get_headers();
        let message_id = headers
            .get_first_value("Message-ID")
            .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|v| !v.is_empty());

        let sender = headers
            .get_first_header("From")
            .and_then(|h| addresses(h).into_iter().next());
        let recipients = headers
            .get_all_headers("To")
            .into_iter()
            .flat_map(addresses)
            .collect();
        let cc = headers
            .get_all_headers("Cc")
            .into_iter()
            .flat_map(addresses)
            .collect();

        let received_at = headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

        let mut bodies = Bodies::default();
        collect_bodies(&mail, &mut bodies)?;

        Ok(ParsedMessage {
            message_id,
            sender,
            recipients,
            cc,
            subject: headers.get_first_value("Subject"),
            text_body: bodies.text,
            html_body: bodies.html,
            headers: mail
                .headers
                .iter()
                .map(|h| HeaderField {
                    name: h.get_key(),
                    value: h.get_value(),
                })
                .collect(),
            has_attachments: bodies.has_attachments,
            received_at,
        })
    }
}

/// Bare addresses from an address header; unparseable headers yield nothing
fn addresses(header: &mailparse::MailHeader<'_>) -> Vec<String> {
    let Ok(list) = mailparse::addrparse_header(header) else {
        return Vec::new();
    };

    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![info.addr.clone()],
            MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.clone()).collect(),
        })
        .collect()
}

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
    has_attachments: bool,
}

/// Walk the MIME tree keeping the first inline text and html parts
fn collect_bodies(part: &ParsedMail<'_>, out: &mut Bodies) -> Result<(), ParseError> {
    let disposition = part.get_content_disposition();
    let named = disposition.params.contains_key("filename") || part.ctype.params.contains_key("name");

    if disposition.disposition == DispositionType::Attachment || (named && part.subparts.is_empty())
    {
        out.has_attachments = true;
        return Ok(());
    }

    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, out)?;
        }
        return Ok(());
    }

    let slot = match part.ctype.mimetype.to_ascii_lowercase().as_str() {
        "text/plain" => &mut out.text,
        "text/html" => &mut out.html,
        _ => return Ok(()),
    };
    if slot.is_none() {
        let body = part
            .get_body()
            .map_err(|e| ParseError::Body(e.to_string()))?;
        *slot = Some(body);
    }
    Ok(())
}

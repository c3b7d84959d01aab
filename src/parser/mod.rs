//! Turns one raw fetched message into the structured record the correlator
//! consumes. Pure transformation: nothing here touches the network or the
//! database.

use mailparse::{
    addrparse, msgidparse, parse_mail, DispositionType, MailAddr, MailHeaderMap, ParsedMail,
    SingleInfo,
};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

static TICKET_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[#(\d+)\]").expect("ticket tag pattern"));

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message carries neither a Message-ID nor a usable sender")]
    Unidentifiable,
}

#[derive(Debug, Clone)]
pub struct ParsedEmail {
    /// Dedup key half. Taken from the Message-ID header, or synthesized
    /// deterministically when the header is absent.
    pub message_id: String,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    /// Thread ancestry, nearest parent first: In-Reply-To, then References
    /// newest to oldest.
    pub thread_refs: Vec<String>,
    /// Ticket number found in a `[#1234]` subject tag.
    pub ticket_hint: Option<i64>,
}

pub fn parse_email(raw: &[u8]) -> Result<ParsedEmail, ParseError> {
    let parsed = parse_mail(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default()
        .trim()
        .to_string();
    let from = parsed.headers.get_first_value("From").unwrap_or_default();
    let date = parsed.headers.get_first_value("Date").unwrap_or_default();

    let (sender, sender_name) = extract_sender(&from);

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| normalize_message_id(&v))
        .filter(|v| !v.is_empty());

    let message_id = match (message_id, &sender) {
        (Some(id), _) => id,
        (None, Some(addr)) => synthesized_id(addr, &subject, &date),
        (None, None) => return Err(ParseError::Unidentifiable),
    };

    let mut thread_refs = Vec::new();
    if let Some(value) = parsed.headers.get_first_value("In-Reply-To") {
        thread_refs.extend(extract_message_ids(&value));
    }
    if let Some(value) = parsed.headers.get_first_value("References") {
        let mut references = extract_message_ids(&value);
        references.reverse();
        for id in references {
            if !thread_refs.contains(&id) {
                thread_refs.push(id);
            }
        }
    }

    Ok(ParsedEmail {
        message_id,
        sender,
        sender_name,
        ticket_hint: ticket_hint(&subject),
        body: extract_body(&parsed),
        subject,
        thread_refs,
    })
}

pub fn ticket_hint(subject: &str) -> Option<i64> {
    TICKET_TAG
        .captures(subject)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn extract_sender(from: &str) -> (Option<String>, Option<String>) {
    if let Ok(list) = addrparse(from) {
        for address in list.into_inner() {
            match address {
                MailAddr::Single(single) => return normalized_address(single),
                MailAddr::Group(group) => {
                    if let Some(single) = group.addrs.into_iter().next() {
                        return normalized_address(single);
                    }
                }
            }
        }
    }

    // Bare angle-bracket scan for From lines addrparse rejects.
    let raw = from.trim();
    let candidate = match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    let candidate = candidate.trim().to_lowercase();
    if candidate.contains('@') {
        (Some(candidate), None)
    } else {
        (None, None)
    }
}

fn normalized_address(single: SingleInfo) -> (Option<String>, Option<String>) {
    let addr = single.addr.trim().to_lowercase();
    if addr.contains('@') {
        (Some(addr), single.display_name)
    } else {
        (None, single.display_name)
    }
}

fn extract_message_ids(value: &str) -> Vec<String> {
    msgidparse(value)
        .map(|ids| {
            ids.iter()
                .map(|id| normalize_message_id(id.as_str()))
                .filter(|id| !id.is_empty())
                .collect::<Vec<String>>()
        })
        .unwrap_or_default()
}

fn normalize_message_id(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

fn synthesized_id(sender: &str, subject: &str, date: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"\0");
    hasher.update(subject.as_bytes());
    hasher.update(b"\0");
    hasher.update(date.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn extract_body(parsed: &ParsedMail) -> String {
    let body = if let Some(part) = find_text_part(parsed, "text/plain") {
        part.get_body().unwrap_or_default()
    } else if let Some(part) = find_text_part(parsed, "text/html") {
        strip_html_tags(&part.get_body().unwrap_or_default())
    } else {
        parsed.get_body().unwrap_or_default()
    };
    body.replace("\r\n", "\n").trim().to_string()
}

fn find_text_part<'a>(part: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if part.subparts.is_empty() {
        if part.ctype.mimetype == mimetype
            && part.get_content_disposition().disposition != DispositionType::Attachment
        {
            return Some(part);
        }
        return None;
    }
    part.subparts
        .iter()
        .find_map(|p| find_text_part(p, mimetype))
}

fn strip_html_tags(html: &str) -> String {
    let text = html
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let text = text
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("</p>", "\n")
        .replace("</div>", "\n")
        .replace("</li>", "\n");

    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;

    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    let mut cleaned = String::new();
    let mut prev_newline = false;
    for c in result.chars() {
        if c == '\n' {
            if !prev_newline {
                cleaned.push(c);
            }
            prev_newline = true;
        } else {
            cleaned.push(c);
            prev_newline = false;
        }
    }

    cleaned.trim().to_string()
}

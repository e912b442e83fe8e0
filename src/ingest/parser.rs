// src/ingest/parser.rs
//! Best-effort RSS 2.0 / RSS 1.0 / Atom parser.
//!
//! Walks the document with the quick-xml event reader instead of a serde
//! model, so a feed that breaks halfway through still yields every entry that
//! closed cleanly before the error.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::normalize_text;
use crate::ingest::types::FeedItem;

/// Outcome of a parse. `error` is set when the reader stopped early.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub items: Vec<FeedItem>,
    pub error: Option<String>,
    /// Whether an `<rss>`, `<feed>`, `<RDF>` or `<channel>` element was seen.
    pub recognized: bool,
}

impl ParsedFeed {
    /// Nothing usable came out of the document.
    pub fn is_unusable(&self) -> bool {
        self.items.is_empty() && (self.error.is_some() || !self.recognized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Link,
    Id,
    Published,
    Updated,
    Summary,
    Content,
}

fn field_for(local_name: &[u8]) -> Option<Field> {
    match local_name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"guid" | b"id" => Some(Field::Id),
        b"pubDate" | b"published" | b"date" | b"issued" => Some(Field::Published),
        b"updated" | b"modified" => Some(Field::Updated),
        b"description" | b"summary" => Some(Field::Summary),
        b"encoded" | b"content" => Some(Field::Content),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Draft {
    title: String,
    link: String,
    id: String,
    published: String,
    updated: String,
    summary: String,
    content: String,
}

impl Draft {
    fn assign(&mut self, field: Field, text: &str) {
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Id => &mut self.id,
            Field::Published => &mut self.published,
            Field::Updated => &mut self.updated,
            Field::Summary => &mut self.summary,
            Field::Content => &mut self.content,
        };
        // First occurrence wins (e.g. Atom href already set from attributes).
        if slot.trim().is_empty() {
            *slot = text.trim().to_string();
        }
    }

    fn finish(self, source_id: &str) -> FeedItem {
        let published = parse_timestamp(&self.published).or_else(|| parse_timestamp(&self.updated));
        let summary = if self.summary.is_empty() {
            normalize_text(&self.content)
        } else {
            normalize_text(&self.summary)
        };
        let id = Some(html_escape::decode_html_entities(&self.id).trim().to_string())
            .filter(|s| !s.is_empty());

        FeedItem {
            title: normalize_text(&self.title),
            link: html_escape::decode_html_entities(&self.link).trim().to_string(),
            published,
            summary,
            source_id: source_id.to_string(),
            id,
        }
    }
}

/// Atom `<link href=".." rel="alternate"/>`; other rels (self, enclosure) are ignored.
fn alternate_href(e: &BytesStart<'_>) -> Option<String> {
    let rel = e
        .try_get_attribute("rel")
        .ok()
        .flatten()
        .map(|a| String::from_utf8_lossy(&a.value).into_owned());
    if !matches!(rel.as_deref(), None | Some("alternate")) {
        return None;
    }
    e.try_get_attribute("href")
        .ok()
        .flatten()
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
        .filter(|s| !s.trim().is_empty())
}

/// Parse a feed body. Never fails; inspect [`ParsedFeed::error`] and
/// [`ParsedFeed::is_unusable`] instead.
pub fn parse_feed(body: &str, source_id: &str) -> ParsedFeed {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut out = ParsedFeed::default();
    let mut draft: Option<Draft> = None;
    // Element depth below the open item/entry element.
    let mut depth = 0usize;
    let mut field: Option<Field> = None;
    let mut buf = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let name = local.as_ref();
                if matches!(name, b"rss" | b"feed" | b"RDF" | b"channel") {
                    out.recognized = true;
                }
                match draft.as_mut() {
                    None => {
                        if name == b"item" || name == b"entry" {
                            draft = Some(Draft::default());
                            depth = 0;
                        }
                    }
                    Some(d) => {
                        depth += 1;
                        if depth == 1 {
                            if name == b"link" {
                                if let Some(href) = alternate_href(&e) {
                                    d.assign(Field::Link, &href);
                                }
                            }
                            field = field_for(name);
                            buf.clear();
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(d) = draft.as_mut() {
                    if depth == 0 && e.local_name().as_ref() == b"link" {
                        if let Some(href) = alternate_href(&e) {
                            d.assign(Field::Link, &href);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if field.is_some() {
                    if !buf.is_empty() {
                        buf.push(' ');
                    }
                    buf.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::CData(c)) => {
                if field.is_some() {
                    if !buf.is_empty() {
                        buf.push(' ');
                    }
                    buf.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(_)) => {
                if draft.is_none() {
                    continue;
                }
                if depth == 0 {
                    if let Some(done) = draft.take() {
                        out.items.push(done.finish(source_id));
                    }
                    continue;
                }
                if depth == 1 {
                    if let (Some(f), Some(d)) = (field.take(), draft.as_mut()) {
                        d.assign(f, &buf);
                    }
                    buf.clear();
                }
                depth -= 1;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                out.error = Some(format!("{e} (at byte {})", reader.buffer_position()));
                break;
            }
        }
    }

    if out.error.is_none() && draft.is_some() {
        out.error = Some("document ended inside an entry".to_string());
    }
    out
}

/// RFC 2822 first (RSS `pubDate`), then RFC 3339 (Atom), then chrono's lenient 2822.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

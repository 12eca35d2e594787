use std::time::Duration;

use feed_rs::parser;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = "gator";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("aggregation deadline exceeded")]
    DeadlineExceeded,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("HTTP client must have a timeout configured")]
    MissingTimeout,
}

impl FetchError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// A decoded feed, alive only between fetch and persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedDocument {
    pub title: String,
    pub description: String,
    pub entries: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Raw publish date exactly as the publisher wrote it.
    pub pub_date: String,
    pub guid: String,
}

impl FeedDocument {
    /// Publishers routinely double-encode entities, so one more decoding
    /// pass is applied on top of the XML decoding.
    fn unescape_html(&mut self) {
        unescape_in_place(&mut self.title);
        unescape_in_place(&mut self.description);
        for entry in &mut self.entries {
            unescape_in_place(&mut entry.title);
            unescape_in_place(&mut entry.description);
        }
    }
}

/// Decodes each well-formed `&name;` / `&#n;` reference once. Anything
/// `htmlescape` cannot decode, including a bare `&`, is copied through.
fn unescape_in_place(text: &mut String) {
    if !text.contains('&') {
        return;
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = reference_len(candidate).and_then(|len| {
            htmlescape::decode_html(&candidate[..len])
                .ok()
                .map(|decoded| (len, decoded))
        });
        match decoded {
            Some((len, decoded)) => {
                out.push_str(&decoded);
                rest = &candidate[len..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    *text = out;
}

/// Byte length of the character reference `text` starts with, `&` and `;`
/// included.
fn reference_len(text: &str) -> Option<usize> {
    let name_end = text[1..].find(|c: char| !(c.is_ascii_alphanumeric() || c == '#'))? + 1;
    (name_end > 1 && text[name_end..].starts_with(';')).then_some(name_end + 1)
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// Builds a fetcher whose every request is bounded by `timeout`.
    /// A missing or zero timeout is rejected.
    pub fn new(timeout: Option<Duration>, user_agent: &str) -> Result<Self, FetchError> {
        let timeout = match timeout {
            Some(t) if !t.is_zero() => t,
            _ => return Err(FetchError::MissingTimeout),
        };

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Single-attempt fetch and decode of the feed at `url`.
    pub async fn fetch(&self, url: &str) -> Result<FeedDocument, FetchError> {
        debug!("Fetching feed: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(FetchError::from_transport)?;

        let mut document = decode_document(&bytes)?;
        document.unescape_html();

        debug!("Decoded {} entries from {}", document.entries.len(), url);
        Ok(document)
    }
}

// Element paths below the <rss> root. Names are compared as written, so a
// namespaced sibling such as <itunes:title> or <atom:link> never matches.
const CHANNEL: &[&[u8]] = &[b"rss", b"channel"];
const ITEM: &[&[u8]] = &[b"rss", b"channel", b"item"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RssField {
    ChannelTitle,
    ChannelDescription,
    Title,
    Link,
    Description,
    PubDate,
    Guid,
}

impl RssField {
    fn at(path: &[Vec<u8>], name: &[u8]) -> Option<Self> {
        if path_is(path, CHANNEL) {
            match name {
                b"title" => Some(RssField::ChannelTitle),
                b"description" => Some(RssField::ChannelDescription),
                _ => None,
            }
        } else if path_is(path, ITEM) {
            match name {
                b"title" => Some(RssField::Title),
                b"link" => Some(RssField::Link),
                b"description" => Some(RssField::Description),
                b"pubDate" => Some(RssField::PubDate),
                b"guid" => Some(RssField::Guid),
                _ => None,
            }
        } else {
            None
        }
    }

    fn store(self, value: String, document: &mut FeedDocument, item: Option<&mut FeedEntry>) {
        match (self, item) {
            (RssField::ChannelTitle, _) => document.title = value,
            (RssField::ChannelDescription, _) => document.description = value,
            (RssField::Title, Some(entry)) => entry.title = value,
            (RssField::Link, Some(entry)) => entry.link = value,
            (RssField::Description, Some(entry)) => entry.description = value,
            (RssField::PubDate, Some(entry)) => entry.pub_date = value,
            (RssField::Guid, Some(entry)) => entry.guid = value,
            (_, None) => {}
        }
    }
}

fn path_is(path: &[Vec<u8>], expected: &[&[u8]]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a.as_slice() == *b)
}

/// Walks an RSS 2.0 document event by event. Unknown and extension elements
/// are skipped, items may be interleaved with other channel children, and
/// every field is optional.
fn decode_rss(bytes: &[u8]) -> Result<FeedDocument, FetchError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    let mut document = FeedDocument::default();
    let mut has_channel = false;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut item: Option<FeedEntry> = None;
    // Field being read and the depth of its element.
    let mut capture: Option<(RssField, usize)> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        match event {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if capture.is_none() {
                    if let Some(field) = RssField::at(&path, &name) {
                        capture = Some((field, path.len() + 1));
                        text.clear();
                    } else if path_is(&path, CHANNEL) && name == b"item" {
                        item = Some(FeedEntry::default());
                    } else if path_is(&path, &CHANNEL[..1]) && name == b"channel" {
                        has_channel = true;
                    }
                }
                path.push(name);
            }
            Event::Empty(e) => {
                let name = e.name();
                if path_is(&path, CHANNEL) && name.as_ref() == b"item" {
                    document.entries.push(FeedEntry::default());
                } else if path_is(&path, &CHANNEL[..1]) && name.as_ref() == b"channel" {
                    has_channel = true;
                }
            }
            Event::Text(t) if capture.is_some() => match t.unescape() {
                Ok(unescaped) => text.push_str(&unescaped),
                Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
            },
            Event::CData(c) if capture.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Event::End(_) => {
                let name = path.pop().unwrap_or_default();
                if let Some((field, depth)) = capture {
                    if depth == path.len() + 1 {
                        field.store(text.trim().to_string(), &mut document, item.as_mut());
                        capture = None;
                    }
                } else if path_is(&path, CHANNEL) && name == b"item" {
                    if let Some(entry) = item.take() {
                        document.entries.push(entry);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !path.is_empty() {
        return Err(FetchError::Parse(format!(
            "unexpected end of document inside <{}>",
            String::from_utf8_lossy(path.last().map(Vec::as_slice).unwrap_or_default())
        )));
    }
    if !has_channel {
        return Err(FetchError::Parse("missing <channel> element".to_string()));
    }
    Ok(document)
}

impl From<feed_rs::model::Feed> for FeedDocument {
    fn from(feed: feed_rs::model::Feed) -> Self {
        FeedDocument {
            title: feed.title.map(|t| t.content).unwrap_or_default(),
            description: feed.description.map(|t| t.content).unwrap_or_default(),
            entries: feed
                .entries
                .into_iter()
                .map(|entry| FeedEntry {
                    title: entry.title.map(|t| t.content).unwrap_or_default(),
                    link: entry
                        .links
                        .first()
                        .map(|l| l.href.clone())
                        .unwrap_or_default(),
                    description: entry
                        .summary
                        .map(|s| s.content)
                        .or_else(|| entry.content.and_then(|c| c.body))
                        .unwrap_or_default(),
                    pub_date: entry
                        .published
                        .or(entry.updated)
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_default(),
                    guid: entry.id,
                })
                .collect(),
        }
    }
}

/// Decodes a feed body. RSS 2.0 is read directly so raw `pubDate` strings
/// survive; any other syndication format goes through `feed_rs`.
pub fn decode_document(bytes: &[u8]) -> Result<FeedDocument, FetchError> {
    match root_element(bytes).as_deref() {
        Some(b"rss") => decode_rss(bytes),
        _ => {
            let feed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
            Ok(feed.into())
        }
    }
}

fn root_element(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(e.local_name().as_ref().to_vec())
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

//! HTTP-backed source handle with range-request random access.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};

use crate::error::{IoError, SciioResult};

use super::{ByteOrder, SourceHandle};

/// Bytes fetched per range request beyond what the caller asked for.
const WINDOW_SIZE: usize = 256 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_error(err: reqwest::Error) -> crate::error::SciioError {
    IoError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
    .into()
}

/// A read-only source handle over an HTTP(S) URL.
///
/// `length()` reports the server's `Content-Length`, or 0 when the server
/// does not provide one. Random seeks refill a sliding buffer via `Range`
/// requests.
pub struct UrlHandle {
    client: Client,
    url: String,
    length: u64,
    position: u64,
    order: ByteOrder,
    window: Vec<u8>,
    window_start: u64,
    closed: bool,
}

impl UrlHandle {
    pub fn open(url: &str) -> SciioResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(http_error)?;
        let length = content_length(&client, url)?;
        Ok(UrlHandle {
            client,
            url: url.to_string(),
            length,
            position: 0,
            order: ByteOrder::BigEndian,
            window: Vec::new(),
            window_start: 0,
            closed: false,
        })
    }

    /// The URL this handle reads, for logging and cache keys.
    pub fn identifier(&self) -> &str {
        &self.url
    }

    fn check_open(&self) -> SciioResult<()> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        Ok(())
    }

    fn fill_window(&mut self, start: u64, want: usize) -> SciioResult<()> {
        let len = want.max(WINDOW_SIZE) as u64;
        let end = if self.length > 0 {
            (start + len).min(self.length)
        } else {
            start + len
        };
        if end <= start {
            self.window.clear();
            self.window_start = start;
            return Ok(());
        }
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .map_err(http_error)?;
        let body = response.bytes().map_err(http_error)?;
        self.window = body.to_vec();
        self.window_start = start;
        Ok(())
    }
}

fn content_length(client: &Client, url: &str) -> SciioResult<u64> {
    let response = client.head(url).send().map_err(http_error)?;
    let length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    Ok(length)
}

impl SourceHandle for UrlHandle {
    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> SciioResult<()> {
        self.check_open()?;
        if self.length > 0 && pos > self.length {
            return Err(IoError::UnexpectedEnd.into());
        }
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize> {
        self.check_open()?;
        if self.length > 0 && self.position >= self.length {
            return Ok(0);
        }
        let in_window = self.position >= self.window_start
            && self.position < self.window_start + self.window.len() as u64;
        if !in_window {
            self.fill_window(self.position, buf.len())?;
        }
        let offset = (self.position - self.window_start) as usize;
        if offset >= self.window.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.window.len() - offset);
        buf[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn order(&self) -> ByteOrder {
        self.order
    }

    fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    fn close(&mut self) -> SciioResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Lists the children of a URL using the HTML directory-index convention:
/// the page is fetched as text, `<a href="…">` targets are collected, and
/// each candidate is probed for existence.
pub fn list_url_directory(url: &str, include_hidden: bool) -> SciioResult<Vec<String>> {
    let client = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(http_error)?;
    let base = if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    };
    let page = client
        .get(&base)
        .send()
        .map_err(http_error)?
        .text()
        .map_err(http_error)?;

    let mut names = Vec::new();
    for name in scan_hrefs(&page) {
        if !include_hidden && name.starts_with('.') {
            continue;
        }
        let child = format!("{base}{name}");
        if client
            .head(&child)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
        {
            names.push(name);
        }
    }
    Ok(names)
}

/// Extracts relative link targets from an HTML directory-index page.
fn scan_hrefs(page: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = page;
    while let Some(at) = rest.find("<a href=\"") {
        rest = &rest[at + 9..];
        let Some(end) = rest.find('"') else { break };
        let target = &rest[..end];
        rest = &rest[end..];
        // skip parent links, anchors, queries and absolute targets
        if target.is_empty()
            || target.starts_with("..")
            || target.starts_with('#')
            || target.starts_with('?')
            || target.starts_with('/')
            || target.contains("://")
        {
            continue;
        }
        let name = target.trim_end_matches('/').to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_index_page_links() {
        let page = r#"
            <html><body>
            <a href="../">Parent</a>
            <a href="stack.tif">stack.tif</a>
            <a href="sub/">sub</a>
            <a href="?C=M;O=A">sort</a>
            <a href="http://elsewhere/">other</a>
            </body></html>
        "#;
        assert_eq!(scan_hrefs(page), vec!["stack.tif", "sub"]);
    }
}

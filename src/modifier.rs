use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::HeaderValue;

use crate::parse::ScrapeResponse;

/// Hook applied to scraped responses before they are streamed back to the
/// proxy.
pub trait ResponseModifier: Send + Sync {
    fn modify(&self, response: &mut ScrapeResponse) -> Result<()>;
}

/// Adds configured label pairs to every sample of a Prometheus text
/// exposition, unless the sample already carries the label. Gzip-encoded
/// bodies are decoded and re-encoded transparently.
pub struct LabelInjector {
    labels: BTreeMap<String, String>,
}

impl LabelInjector {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        LabelInjector { labels }
    }

    fn inject(&self, text: &str) -> String {
        let mut out: String = text
            .lines()
            .map(|line| self.inject_line(line))
            .collect::<Vec<_>>()
            .join("\n");
        if text.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    fn inject_line(&self, line: &str) -> String {
        if line.is_empty() || line.starts_with('#') {
            return line.to_string();
        }
        match line.find('{') {
            Some(open) => {
                let Some(close) = line[open..].rfind('}').map(|i| i + open) else {
                    return line.to_string();
                };
                let existing = &line[open + 1..close];
                let present = label_names(existing);
                let additions: Vec<String> = self
                    .labels
                    .iter()
                    .filter(|(name, _)| !present.iter().any(|p| p == *name))
                    .map(|(name, value)| format!("{name}=\"{}\"", escape_label_value(value)))
                    .collect();
                if additions.is_empty() {
                    return line.to_string();
                }
                let trimmed = existing.trim_end();
                let separator = if trimmed.is_empty() || trimmed.ends_with(',') {
                    ""
                } else {
                    ","
                };
                format!(
                    "{}{}{}{}",
                    &line[..close],
                    separator,
                    additions.join(","),
                    &line[close..]
                )
            }
            None => {
                let name_end = line
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(line.len());
                let additions: Vec<String> = self
                    .labels
                    .iter()
                    .map(|(name, value)| format!("{name}=\"{}\"", escape_label_value(value)))
                    .collect();
                format!(
                    "{}{{{}}}{}",
                    &line[..name_end],
                    additions.join(","),
                    &line[name_end..]
                )
            }
        }
    }
}

/// Label names present in a label set, respecting quoted values that may
/// contain commas or escaped quotes.
fn label_names(labels: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = labels.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return names;
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            name.push(c);
            chars.next();
        }
        names.push(name.trim().to_string());
        // skip `="value"` with escapes
        if chars.next() != Some('=') {
            return names;
        }
        if chars.next() != Some('"') {
            return names;
        }
        let mut escaped = false;
        for c in chars.by_ref() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                break;
            }
        }
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl ResponseModifier for LabelInjector {
    fn modify(&self, response: &mut ScrapeResponse) -> Result<()> {
        let gzipped = response
            .headers
            .get(CONTENT_ENCODING)
            .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
            .unwrap_or(false);

        let raw = if gzipped {
            let mut decoder = GzDecoder::new(&response.body[..]);
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .context("failed to decode gzip scrape body")?;
            decoded
        } else {
            response.body.to_vec()
        };
        let text = String::from_utf8(raw).context("scrape body is not utf-8")?;
        let injected = self.inject(&text);

        let body = if gzipped {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(injected.as_bytes())
                .context("failed to re-encode scrape body")?;
            encoder.finish().context("failed to re-encode scrape body")?
        } else {
            injected.into_bytes()
        };
        response.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        response.body = Bytes::from(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{HeaderMap, StatusCode};

    fn injector(pairs: &[(&str, &str)]) -> LabelInjector {
        LabelInjector::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn adds_labels_to_bare_samples() {
        let inj = injector(&[("node", "my-node")]);
        assert_eq!(inj.inject_line("up 1"), "up{node=\"my-node\"} 1");
    }

    #[test]
    fn extends_existing_label_sets() {
        let inj = injector(&[("node", "my-node")]);
        assert_eq!(
            inj.inject_line("up{job=\"x\"} 1"),
            "up{job=\"x\",node=\"my-node\"} 1"
        );
    }

    #[test]
    fn keeps_samples_that_already_carry_the_label() {
        let inj = injector(&[("node", "my-node")]);
        assert_eq!(
            inj.inject_line("up{node=\"other\"} 1"),
            "up{node=\"other\"} 1"
        );
    }

    #[test]
    fn quoted_commas_do_not_confuse_the_parser() {
        let inj = injector(&[("node", "my-node")]);
        assert_eq!(
            inj.inject_line("up{job=\"a,node=b\"} 1"),
            "up{job=\"a,node=b\",node=\"my-node\"} 1"
        );
    }

    #[test]
    fn comments_and_blank_lines_pass_through() {
        let inj = injector(&[("node", "my-node")]);
        let text = "# TYPE up gauge\nup 1\n";
        assert_eq!(
            inj.inject(text),
            "# TYPE up gauge\nup{node=\"my-node\"} 1\n"
        );
    }

    #[test]
    fn modifies_plain_bodies_and_updates_content_length() {
        let inj = injector(&[("node", "my-node")]);
        let mut response = ScrapeResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"up 1\n"),
        };
        inj.modify(&mut response).unwrap();
        assert_eq!(&response.body[..], b"up{node=\"my-node\"} 1\n");
        assert_eq!(
            response.headers.get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from(response.body.len())
        );
    }

    #[test]
    fn gzip_bodies_survive_the_roundtrip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"up 1\n").unwrap();
        let gz = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let mut response = ScrapeResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(gz),
        };
        let inj = injector(&[("node", "my-node")]);
        inj.modify(&mut response).unwrap();

        let mut decoder = GzDecoder::new(&response.body[..]);
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "up{node=\"my-node\"} 1\n");
    }
}

//! Parsing helpers shared by the providers.

use crate::error::CrawlerError;
use crate::models::WebNovelAttention;
use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use scraper::node::Node;
use scraper::{ElementRef, Selector};

pub fn selector(css: &str) -> Result<Selector, CrawlerError> {
    Selector::parse(css).map_err(|e| CrawlerError::parse(format!("bad selector {}: {:?}", css, e)))
}

pub fn remove_prefix<'a>(input: &'a str, prefix: &str) -> &'a str {
    input.strip_prefix(prefix).unwrap_or(input)
}

pub fn remove_suffix<'a>(input: &'a str, suffix: &str) -> &'a str {
    input.strip_suffix(suffix).unwrap_or(input)
}

pub fn substring_after_last<'a>(input: &'a str, delimiter: &str) -> &'a str {
    match input.rfind(delimiter) {
        Some(idx) => &input[idx + delimiter.len()..],
        None => input,
    }
}

/// Maps a site's content-warning label onto a [`WebNovelAttention`].
pub fn attention_from_label(tag: &str) -> Option<WebNovelAttention> {
    match tag {
        "R15" | "R-15" => Some(WebNovelAttention::R15),
        "R18" | "R-18" => Some(WebNovelAttention::R18),
        "残酷描写有り" | "残酷描写あり" | "残酷な描写" | "残酷な描写あり" => {
            Some(WebNovelAttention::Cruelty)
        }
        "暴力描写有り" | "暴力描写あり" => Some(WebNovelAttention::Violence),
        "性描写有り" | "性的表現あり" => Some(WebNovelAttention::SexualContent),
        _ => None,
    }
}

/// Keeps only the digits of `text`, e.g. `"12,345 pt"` -> `12345`.
pub fn extract_number(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Parses a timestamp written in Japan time into epoch seconds.
pub fn parse_japan_date(format: &str, input: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(input.trim(), format).ok()?;
    let jst = FixedOffset::east_opt(9 * 3600)?;
    jst.from_local_datetime(&naive).single().map(|dt| dt.timestamp())
}

/// Text content of an element with ruby annotations (`rp`, `rt`) dropped and
/// `<br>` rendered as a newline.
pub fn element_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(el, &mut out);
    out
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(e) => match e.name() {
                "br" => out.push('\n'),
                "rp" | "rt" => {}
                _ => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        collect_text(child_el, out);
                    }
                }
            },
            _ => {}
        }
    }
}

/// Text of the element's direct text children only.
pub fn own_text(el: ElementRef<'_>) -> String {
    el.children()
        .filter_map(|child| match child.value() {
            Node::Text(text) => Some(&**text),
            _ => None,
        })
        .collect()
}

pub fn trimmed_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

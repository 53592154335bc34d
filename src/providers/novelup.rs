use super::utils::{
    attention_from_label, element_text, extract_number, own_text, parse_japan_date, selector,
    substring_after_last, trimmed_text,
};
use super::{ProviderId, WebNovelProvider};
use crate::error::CrawlerError;
use crate::http_client::FetchClient;
use crate::models::{RemoteChapter, RemoteNovelMetadata, TocItem, WebNovelAuthor, WebNovelType};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use scraper::node::Node;
use scraper::{ElementRef, Html};

const BASE_URL: &str = "https://novelup.plus";

/// Table-of-contents pages fetched at once.
const TOC_PAGE_CONCURRENCY: usize = 2;

const TOC_DATE_FORMAT: &str = "%Y/%m/%d %H:%M";

/// Scraper for novelup.plus. Ranking is not supported.
pub struct Novelup {
    client: FetchClient,
}

impl Novelup {
    pub fn new(client: FetchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebNovelProvider for Novelup {
    fn id(&self) -> ProviderId {
        ProviderId::Novelup
    }

    async fn get_metadata(&self, novel_id: &str) -> Result<Option<RemoteNovelMetadata>, CrawlerError> {
        let url = format!("{}/story/{}", BASE_URL, novel_id);
        let first_page = self.client.get_text(&url).await?;
        let (mut metadata, total_pages) = parse_story_page(&first_page)?;

        let extra_pages: Vec<String> = futures::stream::iter(2..=total_pages)
            .map(|page| {
                let url = format!("{}/story/{}?p={}", BASE_URL, novel_id, page);
                async move { self.client.get_text(&url).await }
            })
            .buffered(TOC_PAGE_CONCURRENCY)
            .try_collect()
            .await?;

        for page in &extra_pages {
            metadata.toc.extend(parse_episodes(page)?);
        }
        Ok(Some(metadata))
    }

    async fn get_chapter(&self, novel_id: &str, chapter_id: &str) -> Result<RemoteChapter, CrawlerError> {
        let url = format!("{}/story/{}/{}", BASE_URL, novel_id, chapter_id);
        let html = self.client.get_text(&url).await?;
        parse_chapter(&html)
    }
}

/// Value cell of the `storyMeta` row whose header mentions `label`.
fn meta_row<'a>(document: &'a Html, label: &str) -> Result<Option<ElementRef<'a>>, CrawlerError> {
    let th_sel = selector("table.storyMeta th")?;
    Ok(document
        .select(&th_sel)
        .find(|th| own_text(*th).contains(label))
        .and_then(|th| th.next_siblings().find_map(ElementRef::wrap)))
}

fn meta_number(document: &Html, label: &str) -> Result<Option<i64>, CrawlerError> {
    Ok(meta_row(document, label)?.and_then(|cell| extract_number(&trimmed_text(cell))))
}

/// Parses the first story page into metadata (with that page's episodes) and
/// the number of table-of-contents pages.
pub(crate) fn parse_story_page(html: &str) -> Result<(RemoteNovelMetadata, u32), CrawlerError> {
    let document = Html::parse_document(html);

    let title = document
        .select(&selector("h1.storyTitle")?)
        .next()
        .map(trimmed_text)
        .ok_or_else(|| CrawlerError::parse("story title missing"))?;

    let authors = document
        .select(&selector("a.storyAuthor")?)
        .next()
        .map(|a| WebNovelAuthor {
            name: trimmed_text(a),
            link: a.value().attr("href").filter(|h| !h.is_empty()).map(str::to_string),
        })
        .into_iter()
        .collect();

    let status = document
        .select(&selector("p.state_lamp span")?)
        .last()
        .map(trimmed_text)
        .unwrap_or_default();
    let novel_type = match status.as_str() {
        "連載中" => WebNovelType::Ongoing,
        "完結済" => WebNovelType::Completed,
        other => return Err(CrawlerError::parse(format!("unrecognized novel status: {}", other))),
    };

    let attentions = match meta_row(&document, "セルフレイティング")? {
        Some(cell) => cell
            .children()
            .filter_map(|node| match node.value() {
                Node::Text(text) => attention_from_label(text.trim()),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    };

    let keywords = match meta_row(&document, "タグ")? {
        Some(cell) => cell.children().filter_map(ElementRef::wrap).map(trimmed_text).collect(),
        None => Vec::new(),
    };

    let introduction = document
        .select(&selector("div.novel_synopsis")?)
        .next()
        .map(trimmed_text)
        .unwrap_or_default();

    let total_pages = document
        .select(&selector("ul.pagination > li:last-child a")?)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| substring_after_last(href, "=").parse::<u32>().ok())
        .unwrap_or(1)
        .max(1);

    let metadata = RemoteNovelMetadata {
        title,
        authors,
        novel_type,
        attentions,
        keywords,
        points: meta_number(&document, "応援ポイント")?,
        total_characters: meta_number(&document, "文字数")?,
        introduction,
        toc: episodes(&document)?,
    };
    Ok((metadata, total_pages))
}

pub(crate) fn parse_episodes(html: &str) -> Result<Vec<TocItem>, CrawlerError> {
    episodes(&Html::parse_document(html))
}

fn episodes(document: &Html) -> Result<Vec<TocItem>, CrawlerError> {
    let list_sel = selector("div.episodeList")?;
    let item_sel = selector("div.episodeListItem")?;
    let a_sel = selector("a")?;
    let date_sel = selector("p.publishDate")?;

    let Some(list) = document.select(&list_sel).next() else {
        return Ok(Vec::new());
    };

    let mut toc = Vec::new();
    for item in list.select(&item_sel) {
        let Some(a) = item.select(&a_sel).next() else {
            toc.push(TocItem::heading(&trimmed_text(item)));
            continue;
        };
        let number = a.value().attr("data-number").unwrap_or("").trim();
        let title = format!("{} {}", number, trimmed_text(a)).trim().to_string();
        let chapter_id = a
            .value()
            .attr("href")
            .map(|href| substring_after_last(href, "/").to_string());
        let create_at = item
            .select(&date_sel)
            .next()
            .map(trimmed_text)
            .and_then(|date| parse_japan_date(TOC_DATE_FORMAT, &format!("20{}", date)));

        toc.push(TocItem {
            title,
            chapter_id,
            create_at,
        });
    }
    Ok(toc)
}

pub(crate) fn parse_chapter(html: &str) -> Result<RemoteChapter, CrawlerError> {
    let document = Html::parse_document(html);
    let content = document
        .select(&selector("p#episode_content")?)
        .next()
        .ok_or_else(|| CrawlerError::parse("episode content missing"))?;
    let paragraphs = element_text(content)
        .lines()
        .map(|line| line.trim().to_string())
        .collect();
    Ok(RemoteChapter { paragraphs })
}

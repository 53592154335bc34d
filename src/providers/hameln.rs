use super::utils::{
    attention_from_label, element_text, extract_number, parse_japan_date, remove_prefix,
    remove_suffix, selector, trimmed_text,
};
use super::{ProviderId, WebNovelProvider};
use crate::error::CrawlerError;
use crate::http_client::FetchClient;
use crate::models::{RemoteChapter, RemoteNovelMetadata, TocItem, WebNovelAuthor, WebNovelType};
use async_trait::async_trait;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html};

const URL_ORIGIN: &str = "https://syosetu.org";
const URL_MIRROR: &str = "https://hml.xkvi.top";

/// Chapter id used for single-page novels, whose text lives on the novel page.
pub const DEFAULT_CHAPTER_ID: &str = "default";

const TOC_DATE_FORMAT: &str = "%Y年%m月%d日 %H:%M";

const TYPE_PREFIXES: &[(&str, WebNovelType)] = &[
    ("連載(完結)", WebNovelType::Completed),
    ("連載(未完)", WebNovelType::Ongoing),
    ("連載(連載中)", WebNovelType::Ongoing),
    ("短編", WebNovelType::ShortStory),
];

/// Scraper for syosetu.org (Hameln). Ranking is not supported.
pub struct Hameln {
    client: FetchClient,
    use_mirror: bool,
}

impl Hameln {
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            use_mirror: false,
        }
    }

    pub fn use_mirror(mut self, use_mirror: bool) -> Self {
        self.use_mirror = use_mirror;
        self
    }

    fn base_url(&self) -> &'static str {
        if self.use_mirror {
            URL_MIRROR
        } else {
            URL_ORIGIN
        }
    }

    fn chapter_url(&self, novel_id: &str, chapter_id: &str) -> String {
        if chapter_id == DEFAULT_CHAPTER_ID {
            format!("{}/novel/{}", self.base_url(), novel_id)
        } else {
            format!("{}/novel/{}/{}.html", self.base_url(), novel_id, chapter_id)
        }
    }
}

#[async_trait]
impl WebNovelProvider for Hameln {
    fn id(&self) -> ProviderId {
        ProviderId::Hameln
    }

    async fn get_metadata(&self, novel_id: &str) -> Result<Option<RemoteNovelMetadata>, CrawlerError> {
        let novel_url = format!("{}/novel/{}", self.base_url(), novel_id);
        let detail_url = format!("{}/?mode=ss_detail&nid={}", self.base_url(), novel_id);
        let (novel_page, detail_page) = futures::try_join!(
            self.client.get_text(&novel_url),
            self.client.get_text(&detail_url)
        )?;
        parse_metadata(&novel_page, &detail_page, self.base_url()).map(Some)
    }

    async fn get_chapter(&self, novel_id: &str, chapter_id: &str) -> Result<RemoteChapter, CrawlerError> {
        let html = self.client.get_text(&self.chapter_url(novel_id, chapter_id)).await?;
        parse_chapter(&html)
    }
}

/// Cell following the `td` whose text is exactly `label`.
fn row<'a>(cells: &[ElementRef<'a>], label: &str) -> Result<ElementRef<'a>, CrawlerError> {
    cells
        .iter()
        .find(|td| trimmed_text(**td) == label)
        .and_then(|td| td.next_siblings().find_map(ElementRef::wrap))
        .ok_or_else(|| CrawlerError::parse(format!("Failed to find row: {}", label)))
}

fn link_texts(cell: ElementRef<'_>) -> Result<Vec<String>, CrawlerError> {
    let a_sel = selector("a")?;
    Ok(cell.select(&a_sel).map(trimmed_text).collect())
}

pub(crate) fn parse_metadata(
    novel_page: &str,
    detail_page: &str,
    base_url: &str,
) -> Result<RemoteNovelMetadata, CrawlerError> {
    let detail = Html::parse_document(detail_page);
    let td_sel = selector("td")?;
    let a_sel = selector("a")?;
    let cells: Vec<ElementRef> = detail.select(&td_sel).collect();

    let title = trimmed_text(row(&cells, "タイトル")?);

    let author_cell = row(&cells, "作者")?;
    let author = WebNovelAuthor {
        name: trimmed_text(author_cell),
        link: author_cell
            .select(&a_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| href.replace(URL_ORIGIN, base_url)),
    };

    let count_text = trimmed_text(row(&cells, "話数")?);
    let novel_type = TYPE_PREFIXES
        .iter()
        .find(|(prefix, _)| count_text.starts_with(*prefix))
        .map(|(_, t)| *t)
        .ok_or_else(|| CrawlerError::parse(format!("unrecognized novel status: {}", count_text)))?;

    let mut attentions = Vec::new();
    let mut keywords = link_texts(row(&cells, "原作")?)?;
    for label in ["タグ", "必須タグ"] {
        for tag in link_texts(row(&cells, label)?)? {
            match attention_from_label(&tag) {
                Some(attention) => attentions.push(attention),
                None => keywords.push(tag),
            }
        }
    }

    let points = extract_number(&trimmed_text(row(&cells, "総合評価")?));
    let total_characters = extract_number(&trimmed_text(row(&cells, "合計文字数")?));
    let introduction = trimmed_text(row(&cells, "あらすじ")?);

    Ok(RemoteNovelMetadata {
        title,
        authors: vec![author],
        novel_type,
        attentions,
        keywords,
        points,
        total_characters,
        introduction,
        toc: parse_toc(novel_page)?,
    })
}

pub(crate) fn parse_toc(novel_page: &str) -> Result<Vec<TocItem>, CrawlerError> {
    let document = Html::parse_document(novel_page);
    if document.select(&selector("span[itemprop=name]")?).next().is_none() {
        return Ok(vec![TocItem {
            title: "无名".to_string(),
            chapter_id: Some(DEFAULT_CHAPTER_ID.to_string()),
            create_at: None,
        }]);
    }

    let row_sel = selector("tbody > tr")?;
    let a_sel = selector("a")?;
    let nobr_sel = selector("nobr")?;
    let annotation =
        Regex::new(r"\(.*?\)").map_err(|e| CrawlerError::parse(format!("bad pattern: {}", e)))?;

    let mut toc = Vec::new();
    for tr in document.select(&row_sel) {
        let Some(a) = tr.select(&a_sel).next() else {
            toc.push(TocItem::heading(&trimmed_text(tr)));
            continue;
        };
        let chapter_id = a
            .value()
            .attr("href")
            .map(|href| remove_suffix(remove_prefix(href, "./"), ".html").to_string());
        let create_at = tr
            .select(&nobr_sel)
            .next()
            .and_then(|nobr| nobr.children().next())
            .map(|first| match first.value() {
                Node::Text(text) => text.to_string(),
                _ => ElementRef::wrap(first).map(trimmed_text).unwrap_or_default(),
            })
            .and_then(|raw| parse_japan_date(TOC_DATE_FORMAT, annotation.replace_all(&raw, "").trim()));

        toc.push(TocItem {
            title: trimmed_text(a),
            chapter_id,
            create_at,
        });
    }
    Ok(toc)
}

pub(crate) fn parse_chapter(html: &str) -> Result<RemoteChapter, CrawlerError> {
    let document = Html::parse_document(html);
    let body_sel = selector("div#honbun")?;
    let p_sel = selector("p")?;
    let body = document
        .select(&body_sel)
        .next()
        .ok_or_else(|| CrawlerError::parse("chapter body missing"))?;
    let paragraphs = body
        .select(&p_sel)
        .filter(|p| p.value().attr("id").is_some())
        .map(|p| element_text(p).trim().to_string())
        .collect();
    Ok(RemoteChapter { paragraphs })
}

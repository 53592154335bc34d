use super::utils::{attention_from_label, element_text, remove_prefix, selector};
use super::{ProviderId, RankParams, WebNovelProvider};
use crate::error::CrawlerError;
use crate::http_client::FetchClient;
use crate::models::{
    Page, RemoteChapter, RemoteNovelListItem, RemoteNovelMetadata, TocItem, WebNovelAttention,
    WebNovelAuthor, WebNovelType,
};
use async_trait::async_trait;
use chrono::DateTime;
use scraper::Html;
use serde_json::Value;

const BASE_URL: &str = "https://kakuyomu.jp";

const RANGE_IDS: &[(&str, &str)] = &[
    ("每日", "daily"),
    ("每周", "weekly"),
    ("每月", "monthly"),
    ("每年", "yearly"),
    ("总计", "entire"),
];

const GENRE_IDS: &[(&str, &str)] = &[
    ("综合", "all"),
    ("异世界幻想", "fantasy"),
    ("现代幻想", "action"),
    ("科幻", "sf"),
    ("恋爱", "love_story"),
    ("浪漫喜剧", "romance"),
    ("现代戏剧", "drama"),
    ("恐怖", "horror"),
    ("推理", "mystery"),
    ("散文·纪实", "nonfiction"),
    ("历史·时代·传奇", "history"),
    ("创作论·评论", "criticism"),
    ("诗·童话·其他", "others"),
];

const STATUS_IDS: &[(&str, &str)] = &[("全部", "all"), ("短篇", "short"), ("长篇", "long")];

/// Scraper for kakuyomu.jp.
pub struct Kakuyomu {
    client: FetchClient,
}

impl Kakuyomu {
    pub fn new(client: FetchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebNovelProvider for Kakuyomu {
    fn id(&self) -> ProviderId {
        ProviderId::Kakuyomu
    }

    async fn get_rank(&self, params: &RankParams) -> Result<Page<RemoteNovelListItem>, CrawlerError> {
        let url = rank_url(params)?;
        let html = self.client.get_text(&url).await?;
        parse_rank(&html)
    }

    async fn get_metadata(&self, novel_id: &str) -> Result<Option<RemoteNovelMetadata>, CrawlerError> {
        let url = format!("{}/works/{}", BASE_URL, novel_id);
        let html = self.client.get_text(&url).await?;
        parse_metadata(&html, novel_id)
    }

    async fn get_chapter(&self, novel_id: &str, chapter_id: &str) -> Result<RemoteChapter, CrawlerError> {
        let url = format!("{}/works/{}/episodes/{}", BASE_URL, novel_id, chapter_id);
        let html = self.client.get_text(&url).await?;
        parse_chapter(&html)
    }
}

fn lookup(table: &[(&str, &'static str)], params: &RankParams, key: &str) -> Result<&'static str, CrawlerError> {
    let label = params
        .get(key)
        .ok_or_else(|| CrawlerError::parse(format!("missing rank parameter: {}", key)))?;
    table
        .iter()
        .find(|(name, _)| *name == label.as_str())
        .map(|(_, id)| *id)
        .ok_or_else(|| CrawlerError::parse(format!("invalid rank parameter {}: {}", key, label)))
}

pub(crate) fn rank_url(params: &RankParams) -> Result<String, CrawlerError> {
    let genre = lookup(GENRE_IDS, params, "genre")?;
    let range = lookup(RANGE_IDS, params, "range")?;
    let status = lookup(STATUS_IDS, params, "status")?;
    Ok(format!(
        "{}/rankings/{}/{}?work_variation={}",
        BASE_URL, genre, range, status
    ))
}

pub(crate) fn parse_rank(html: &str) -> Result<Page<RemoteNovelListItem>, CrawlerError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.widget-media-genresWorkList-right > div.widget-work")?;
    let title_sel = selector("a.bookWalker-work-title")?;
    let tag_sel = selector("span.widget-workCard-tags > a")?;
    let meta_sel = selector("p.widget-workCard-meta > *")?;

    let mut items = Vec::new();
    for card in document.select(&card_sel) {
        let Some(link) = card.select(&title_sel).next() else {
            continue;
        };
        let novel_id = match link.value().attr("href") {
            Some(href) => remove_prefix(href, "/works/").to_string(),
            None => continue,
        };
        let title = link.text().collect::<String>().trim().to_string();
        let keywords: Vec<String> = card
            .select(&tag_sel)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .collect();
        let attentions = keywords.iter().filter_map(|k| attention_from_label(k)).collect();
        let extra = card
            .select(&meta_sel)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .collect::<Vec<_>>()
            .join(" / ");

        items.push(RemoteNovelListItem {
            novel_id,
            title,
            attentions,
            keywords,
            extra,
        });
    }
    Ok(Page::single(items))
}

fn resolve<'a>(apollo: &'a Value, reference: &Value) -> Option<&'a Value> {
    reference
        .get("__ref")
        .and_then(Value::as_str)
        .and_then(|key| apollo.get(key))
}

fn resolve_list<'a>(apollo: &'a Value, refs: Option<&Value>) -> Vec<&'a Value> {
    refs.and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|r| resolve(apollo, r)).collect())
        .unwrap_or_default()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn parse_metadata(html: &str, novel_id: &str) -> Result<Option<RemoteNovelMetadata>, CrawlerError> {
    let script = {
        let document = Html::parse_document(html);
        let script_sel = selector("#__NEXT_DATA__")?;
        match document.select(&script_sel).next() {
            Some(el) => el.text().collect::<String>(),
            None => return Ok(None),
        }
    };

    let data: Value = serde_json::from_str(&script)
        .map_err(|e| CrawlerError::parse(format!("Failed to parse novel metadata: {}", e)))?;
    let apollo = data
        .pointer("/props/pageProps/__APOLLO_STATE__")
        .filter(|v| v.is_object())
        .ok_or_else(|| CrawlerError::parse("Failed to parse novel metadata"))?;

    let work = apollo
        .get(format!("Work:{}", novel_id))
        .ok_or_else(|| CrawlerError::parse(format!("work {} missing from page state", novel_id)))?;

    let title = str_field(work, "alternativeTitle")
        .or_else(|| str_field(work, "title"))
        .ok_or_else(|| CrawlerError::parse("novel title missing"))?;

    let authors = work
        .get("author")
        .and_then(|r| resolve(apollo, r))
        .map(|user| WebNovelAuthor {
            name: str_field(user, "activityName").unwrap_or_default(),
            link: str_field(user, "name").map(|name| format!("{}/users/{}", BASE_URL, name)),
        })
        .into_iter()
        .collect();

    let status = work.get("serialStatus").and_then(Value::as_str).unwrap_or("");
    let novel_type = match status {
        "RUNNING" => WebNovelType::Ongoing,
        "COMPLETED" => WebNovelType::Completed,
        other => return Err(CrawlerError::parse(format!("unrecognized novel status: {}", other))),
    };

    let mut attentions = Vec::new();
    for (flag, attention) in [
        ("isCruel", WebNovelAttention::Cruelty),
        ("isViolent", WebNovelAttention::Violence),
        ("isSexual", WebNovelAttention::SexualContent),
    ] {
        if work.get(flag).and_then(Value::as_bool).unwrap_or(false) {
            attentions.push(attention);
        }
    }

    let keywords = work
        .get("tagLabels")
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let mut toc = Vec::new();
    for entry in resolve_list(apollo, work.get("tableOfContents")) {
        if let Some(chapter) = entry.get("chapter").and_then(|r| resolve(apollo, r)) {
            toc.push(TocItem::heading(&str_field(chapter, "title").unwrap_or_default()));
        }
        for episode in resolve_list(apollo, entry.get("episodeUnions")) {
            toc.push(TocItem {
                title: str_field(episode, "title").unwrap_or_default(),
                chapter_id: str_field(episode, "id"),
                create_at: episode
                    .get("publishedAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp()),
            });
        }
    }

    Ok(Some(RemoteNovelMetadata {
        title,
        authors,
        novel_type,
        attentions,
        keywords,
        points: work.get("totalReviewPoint").and_then(Value::as_i64),
        total_characters: work.get("totalCharacterCount").and_then(Value::as_i64),
        introduction: str_field(work, "introduction").unwrap_or_default(),
        toc,
    }))
}

pub(crate) fn parse_chapter(html: &str) -> Result<RemoteChapter, CrawlerError> {
    let document = Html::parse_document(html);
    let paragraph_sel = selector("div.widget-episodeBody > p")?;
    let paragraphs: Vec<String> = document.select(&paragraph_sel).map(element_text).collect();
    if paragraphs.is_empty() {
        return Err(CrawlerError::parse("paid chapter, content unavailable"));
    }
    Ok(RemoteChapter { paragraphs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn rank_params(genre: &str, range: &str, status: &str) -> RankParams {
        [("genre", genre), ("range", range), ("status", status)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rank_url_maps_labels() {
        let url = rank_url(&rank_params("异世界幻想", "每周", "长篇")).unwrap();
        assert_eq!(url, "https://kakuyomu.jp/rankings/fantasy/weekly?work_variation=long");
    }

    #[test]
    fn test_rank_url_rejects_unknown_label() {
        let err = rank_url(&rank_params("fantasy", "每周", "长篇")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(rank_url(&RankParams::new()).is_err());
    }

    #[test]
    fn test_parse_rank_cards() {
        let html = r#"<div class="widget-media-genresWorkList-right">
            <div class="widget-work">
              <a class="bookWalker-work-title" href="/works/1177354054880000001"> 転生したら </a>
              <span class="widget-workCard-tags"><a>異世界</a><a>残酷描写有り</a></span>
              <p class="widget-workCard-meta"><span>連載中</span><span>12話</span></p>
            </div>
        </div>"#;
        let page = parse_rank(html).unwrap();
        assert_eq!(page.page_number, 1);
        assert_eq!(page.items.len(), 1);
        let item = &page.items[0];
        assert_eq!(item.novel_id, "1177354054880000001");
        assert_eq!(item.title, "転生したら");
        assert_eq!(item.keywords, vec!["異世界", "残酷描写有り"]);
        assert_eq!(item.attentions, vec![WebNovelAttention::Cruelty]);
        assert_eq!(item.extra, "連載中 / 12話");
    }

    fn next_data(status: &str) -> String {
        let state = serde_json::json!({
            "props": {"pageProps": {"__APOLLO_STATE__": {
                "Work:42": {
                    "title": "本題",
                    "alternativeTitle": null,
                    "author": {"__ref": "UserAccount:7"},
                    "serialStatus": status,
                    "isCruel": true,
                    "isViolent": false,
                    "isSexual": true,
                    "tagLabels": ["ファンタジー", "異世界"],
                    "totalReviewPoint": 1234,
                    "totalCharacterCount": 98765,
                    "introduction": "あらすじ",
                    "tableOfContents": [{"__ref": "TableOfContentsChapter:1"}]
                },
                "UserAccount:7": {"activityName": "作者", "name": "writer"},
                "TableOfContentsChapter:1": {
                    "chapter": {"__ref": "Chapter:1"},
                    "episodeUnions": [{"__ref": "Episode:100"}]
                },
                "Chapter:1": {"title": "第一章"},
                "Episode:100": {"id": "100", "title": "第1話", "publishedAt": "2024-01-01T00:00:00Z"}
            }}}
        });
        format!(
            "<html><body><script id=\"__NEXT_DATA__\" type=\"application/json\">{}</script></body></html>",
            state
        )
    }

    #[test]
    fn test_parse_metadata_from_apollo_state() {
        let meta = parse_metadata(&next_data("RUNNING"), "42").unwrap().unwrap();
        assert_eq!(meta.title, "本題");
        assert_eq!(meta.novel_type, WebNovelType::Ongoing);
        assert_eq!(meta.authors[0].name, "作者");
        assert_eq!(meta.authors[0].link.as_deref(), Some("https://kakuyomu.jp/users/writer"));
        assert_eq!(
            meta.attentions,
            vec![WebNovelAttention::Cruelty, WebNovelAttention::SexualContent]
        );
        assert_eq!(meta.points, Some(1234));
        assert_eq!(meta.total_characters, Some(98765));
        assert_eq!(meta.toc.len(), 2);
        assert_eq!(meta.toc[0], TocItem::heading("第一章"));
        assert_eq!(meta.toc[1].chapter_id.as_deref(), Some("100"));
        assert_eq!(meta.toc[1].create_at, Some(1_704_067_200));
    }

    #[test]
    fn test_parse_metadata_unknown_status_is_parse_error() {
        let err = parse_metadata(&next_data("HIATUS"), "42").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_parse_metadata_without_script_is_none() {
        assert!(parse_metadata("<html><body></body></html>", "42").unwrap().is_none());
    }

    #[test]
    fn test_parse_chapter() {
        let html = r#"<div class="widget-episodeBody">
            <p><ruby>魔法<rp>(</rp><rt>まほう</rt><rp>)</rp></ruby>の話</p>
            <p>二行目<br>続き</p>
        </div>"#;
        let chapter = parse_chapter(html).unwrap();
        assert_eq!(chapter.paragraphs, vec!["魔法の話", "二行目\n続き"]);
    }

    #[test]
    fn test_parse_chapter_without_body_is_paid() {
        let err = parse_chapter("<div class=\"widget-episodeBody\"></div>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}

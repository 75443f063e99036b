//! 新闻工具：财联社「你需要知道的隔夜全球要闻」电报
//!
//! 只返回当天发布的一条；非当天（旧闻）时返回提示文本。HTML 用 html2text 去除标签。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, TimeZone};
use regex::Regex;
use reqwest::Client;
use serde_json::Value;

use crate::tools::{Tool, ToolCallResult};

const WEEK: [&str; 7] = ["周一", "周二", "周三", "周四", "周五", "周六", "周日"];
const KEYWORD: &str = "你需要知道的隔夜全球要闻";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/110.0";

pub struct NewsTool {
    client: Client,
    url: String,
}

impl NewsTool {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    async fn fetch(&self) -> Result<Value, reqwest::Error> {
        let form = [
            ("type", "telegram"),
            ("keyword", KEYWORD),
            ("page", "0"),
            ("rn", "1"),
            ("os", "web"),
            ("sv", "7.7.5"),
            ("app", "CailianpressWeb"),
        ];
        self.client
            .post(&self.url)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

static NUMBERING_RE: OnceLock<Regex> = OnceLock::new();
static WEEKDAY_PREFIX_RE: OnceLock<Regex> = OnceLock::new();

/// 把电报条目整理为文本；非 `today` 当天发布的返回 None
pub fn format_telegram<Tz: TimeZone>(item: &Value, today: &DateTime<Tz>) -> Option<String>
where
    Tz::Offset: std::fmt::Display,
{
    let descr = item.get("descr")?.as_str()?;
    let ts = item.get("time")?.as_i64()?;
    let published = today.timezone().timestamp_opt(ts, 0).single()?;
    if published.weekday() != today.weekday() {
        return None;
    }

    let numbering = NUMBERING_RE.get_or_init(|| Regex::new(r"(\d{1,2}、)").unwrap());
    let numbered = numbering.replace_all(descr, "<br>$1");
    let text = match html2text::from_read(numbered.as_bytes(), 1000) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => numbered.replace("<br>", "\n"),
    };
    let prefix =
        WEEKDAY_PREFIX_RE.get_or_init(|| Regex::new(r"周[一二三四五六日]你需要知道的").unwrap());
    let text = prefix.replace_all(text.trim(), "");
    let weekday = WEEK[published.weekday().num_days_from_monday() as usize];
    Some(format!(
        "{} {}\n{}",
        published.format("%Y年%m月%d日"),
        weekday,
        text
    ))
}

#[async_trait]
impl Tool for NewsTool {
    fn name(&self) -> &str {
        "get_news"
    }

    fn description(&self) -> &str {
        "获取最新新闻"
    }

    async fn execute(&self, _args: Value) -> Result<ToolCallResult, String> {
        let resp = self.fetch().await.map_err(|e| format!("news request failed: {e}"))?;
        let item = resp
            .pointer("/data/telegram/data/0")
            .ok_or_else(|| "unexpected news response shape".to_string())?;
        let text = format_telegram(item, &Local::now())
            .unwrap_or_else(|| "今日要闻尚未发布".to_string());
        Ok(ToolCallResult::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_format_telegram_same_day() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let today = tz.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let published = tz.with_ymd_and_hms(2024, 3, 5, 6, 30, 0).unwrap();
        let item = serde_json::json!({
            "descr": "周二你需要知道的隔夜全球要闻：1、美股收涨；2、油价下跌。",
            "time": published.timestamp(),
        });
        let text = format_telegram(&item, &today).unwrap();
        assert!(text.starts_with("2024年03月05日 周二\n"));
        assert!(text.contains("隔夜全球要闻"));
        assert!(!text.contains("周二你需要知道的"));
        assert!(text.contains("\n2、") || text.contains("2、油价下跌"));
    }

    #[test]
    fn test_format_telegram_stale() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let today = tz.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap();
        let published = tz.with_ymd_and_hms(2024, 3, 5, 6, 30, 0).unwrap();
        let item = serde_json::json!({ "descr": "x", "time": published.timestamp() });
        assert!(format_telegram(&item, &today).is_none());
    }
}

//! 时间工具：当前日期、时间与星期

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, TimeZone};
use serde_json::Value;

use crate::tools::{Tool, ToolCallResult};

const WEEKDAYS: [&str; 7] = ["星期一", "星期二", "星期三", "星期四", "星期五", "星期六", "星期日"];

pub struct ClockTool;

/// 形如 `2024年01月01日 08:00:00 星期一`
pub fn format_now<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let weekday = WEEKDAYS[now.weekday().num_days_from_monday() as usize];
    format!("{} {}", now.format("%Y年%m月%d日 %H:%M:%S"), weekday)
}

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "获取当前日期，时间，星期几"
    }

    async fn execute(&self, _args: Value) -> Result<ToolCallResult, String> {
        Ok(ToolCallResult::Text(format_now(&Local::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_format_now() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let t = tz.with_ymd_and_hms(2024, 1, 1, 8, 5, 9).unwrap();
        assert_eq!(format_now(&t), "2024年01月01日 08:05:09 星期一");
    }
}

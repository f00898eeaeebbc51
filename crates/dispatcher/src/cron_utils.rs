use chrono::{DateTime, FixedOffset, Offset, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, warn};

use taskrelay_core::{RelayError, RelayResult};

/// 5段表达式（分钟精度）补齐秒字段
pub fn normalize_expression(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// 解析时区：`UTC`、`Z` 或 `+08:00` / `-0530` 形式的固定偏移
pub fn parse_timezone(tz: &str) -> RelayResult<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Ok(Utc.fix());
    }

    let invalid = || RelayError::config_error(format!("无效的时区: {tz}"));
    let (sign, rest) = match tz.chars().next() {
        Some('+') => (1, &tz[1..]),
        Some('-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// CRON表达式解析和调度工具
pub struct CronScheduler {
    schedule: Schedule,
    offset: FixedOffset,
}

impl CronScheduler {
    /// 创建新的CRON调度器（UTC）
    pub fn new(cron_expr: &str) -> RelayResult<Self> {
        Self::with_timezone(cron_expr, None)
    }

    /// 在指定时区解释表达式
    pub fn with_timezone(cron_expr: &str, tz: Option<&str>) -> RelayResult<Self> {
        let normalized = normalize_expression(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| RelayError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        let offset = match tz {
            Some(tz) => parse_timezone(tz)?,
            None => Utc.fix(),
        };

        Ok(Self { schedule, offset })
    }

    /// 获取 `from` 之后的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = from.with_timezone(&self.offset);
        let next = self
            .schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc));
        match next {
            Some(next) => debug!(
                "下次执行时间: {} (基准 {})",
                next.format("%Y-%m-%d %H:%M:%S UTC"),
                from.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => warn!(
                "无法计算下一次执行时间，基准时间: {}",
                from.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        }
        next
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let local = from.with_timezone(&self.offset);
        self.schedule
            .after(&local)
            .take(count)
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> RelayResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

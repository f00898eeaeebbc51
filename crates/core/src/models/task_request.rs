use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RelayConfig;
use crate::RelayResult;

use super::Job;

/// 请求签名所在的HTTP头
pub const SIGNATURE_HEADER: &str = "X-TaskRelay-Signature";

/// 投递后端在之后重放的HTTP请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub http_method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// 交给投递后端的任务请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub queue: String,
    pub schedule_time: Option<DateTime<Utc>>,
    pub dispatch_deadline_secs: u64,
    pub http_request: HttpRequest,
}

impl TaskRequest {
    /// 将任务序列化为请求体并包装为POST请求
    ///
    /// 任务的队列必须已经被解析，未解析时使用配置中的默认队列。
    pub fn for_job(
        job: &Job,
        time_at: Option<DateTime<Utc>>,
        config: &RelayConfig,
    ) -> RelayResult<Self> {
        let body = job.to_json()?;

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(SIGNATURE_HEADER.to_string(), sign_body(&config.secret, &body));

        Ok(Self {
            queue: job
                .queue
                .clone()
                .unwrap_or_else(|| config.default_queue.clone()),
            schedule_time: time_at,
            dispatch_deadline_secs: config.dispatch_deadline_secs,
            http_request: HttpRequest {
                http_method: "POST".to_string(),
                url: config.processor_url.clone(),
                headers,
                body,
            },
        })
    }

    /// 解码请求体中的任务
    pub fn job(&self) -> RelayResult<Job> {
        Ok(Job::from_json(&self.http_request.body)?)
    }

    pub fn signature(&self) -> Option<&str> {
        self.http_request
            .headers
            .get(SIGNATURE_HEADER)
            .map(String::as_str)
    }
}

/// 计算请求体签名：SHA-256(secret + body) 的十六进制摘要
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn verify_signature(secret: &str, body: &str, signature: &str) -> bool {
    constant_time_eq(sign_body(secret, body).as_bytes(), signature.as_bytes())
}

/// 比较耗时只取决于长度，与首个不同字节的位置无关
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

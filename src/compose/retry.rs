//! # 外部调用重试模块
//!
//! ## 设计思路
//!
//! 生成式与背景移除服务都是网络调用，瞬时故障（超时、连接失败、408/429/5xx）
//! 允许有限重试；持续失败仍然是请求终止性的错误，不改变对外契约。
//!
//! ## 实现思路
//!
//! - 指数退避 + 抖动，优先采用服务端 `Retry-After` 提示。
//! - 抖动源为无锁 xorshift，避免并发请求同步重试。
//! - 请求体（multipart）不可克隆，因此每次尝试都通过闭包重新构建请求。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// 单次外部调用的重试策略。
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u8,
    pub(crate) base_delay_ms: u64,
}

static JITTER_STATE: AtomicU64 = AtomicU64::new(0);

fn seed_jitter_state() -> u64 {
    let time_seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut state = time_seed ^ ((std::process::id() as u64) << 32) ^ 0x9E37_79B9_7F4A_7C15;
    if state == 0 {
        state = 0xA5A5_5A5A_0123_4567;
    }
    state
}

fn next_jitter_u64() -> u64 {
    let mut current = JITTER_STATE.load(Ordering::Relaxed);

    loop {
        let seeded = if current == 0 {
            seed_jitter_state()
        } else {
            current
        };

        let mut next = seeded;
        next ^= next << 13;
        next ^= next >> 7;
        next ^= next << 17;

        match JITTER_STATE.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

/// 计算第 `attempt` 次失败后的等待时间（毫秒）。
pub(crate) fn compute_retry_delay_with_jitter(
    base_delay_ms: u64,
    attempt: u8,
    server_hint_ms: Option<u64>,
) -> u64 {
    let exp = base_delay_ms.saturating_mul(1_u64 << (attempt.saturating_sub(1).min(8) as u32));
    let base = server_hint_ms.unwrap_or(exp).min(RETRY_MAX_DELAY_MS);
    let jitter_bound = (base / 2).max(1);
    let jitter = next_jitter_u64() % (jitter_bound + 1);
    base.saturating_add(jitter)
}

pub(crate) fn retry_after_hint_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?;
    let secs = value.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(secs.saturating_mul(1000))
}

pub(crate) fn is_retryable_http_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub(crate) fn is_retryable_network_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }

    let msg = error.to_string().to_lowercase();
    msg.contains("connection reset")
        || msg.contains("connection closed before message completed")
        || msg.contains("peer closed connection")
}

/// 截断响应体用于错误信息，避免把整张 base64 图片塞进日志。
pub(crate) fn truncate_for_log(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let head: String = body.chars().take(max_chars).collect();
    format!("{}…", head)
}

/// 发送请求并在瞬时故障时重试。
///
/// 返回的响应可能仍是非 2xx（重试耗尽或不可重试的状态码），由调用方判断。
/// 构建请求本身失败（如非法 MIME）不会重试。
pub(crate) async fn send_with_retry<F>(
    label: &str,
    policy: RetryPolicy,
    mut build_request: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> Result<reqwest::RequestBuilder, reqwest::Error>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u8 = 1;

    loop {
        match build_request()?.send().await {
            Ok(resp) => {
                if attempt < max_attempts && is_retryable_http_status(resp.status()) {
                    let delay_ms = compute_retry_delay_with_jitter(
                        policy.base_delay_ms,
                        attempt,
                        retry_after_hint_ms(resp.headers()),
                    );
                    log::warn!(
                        "⚠️ {} 返回 HTTP {}（第 {}/{} 次，可重试）；{}ms 后重试",
                        label,
                        resp.status().as_u16(),
                        attempt,
                        max_attempts,
                        delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }

                return Ok(resp);
            }
            Err(err) => {
                if attempt >= max_attempts || !is_retryable_network_error(&err) {
                    return Err(err);
                }

                let delay_ms = compute_retry_delay_with_jitter(policy.base_delay_ms, attempt, None);
                log::warn!(
                    "⚠️ {} 请求失败（第 {}/{} 次，可重试）：{}；{}ms 后重试",
                    label,
                    attempt,
                    max_attempts,
                    err,
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_stays_within_jitter_bounds() {
        let delay = compute_retry_delay_with_jitter(200, 3, None);

        assert!(delay >= 800, "delay should be at least exponential base");
        assert!(delay <= 1200, "delay should include bounded jitter only");
    }

    #[test]
    fn retry_delay_prefers_server_hint_and_caps_it() {
        let hinted = compute_retry_delay_with_jitter(200, 1, Some(2_000));
        assert!((2_000..=3_000).contains(&hinted));

        let capped = compute_retry_delay_with_jitter(200, 1, Some(120_000));
        assert!(capped <= RETRY_MAX_DELAY_MS + RETRY_MAX_DELAY_MS / 2);
    }

    #[test]
    fn retryable_http_status_is_expected() {
        assert!(is_retryable_http_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_http_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(is_retryable_http_status(reqwest::StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_http_status(reqwest::StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_http_status(reqwest::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn retry_after_header_is_parsed_as_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "3".parse().expect("header value"));
        assert_eq!(retry_after_hint_ms(&headers), Some(3_000));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().expect("header value"));
        assert_eq!(retry_after_hint_ms(&headers), None);
    }

    #[test]
    fn truncate_for_log_keeps_short_bodies() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdefghij", 4), "abcd…");
    }
}

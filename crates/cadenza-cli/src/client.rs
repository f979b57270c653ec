use std::path::Path;

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::RequestBuilder;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

pub fn auth(builder: RequestBuilder, token: Option<&String>) -> RequestBuilder {
    match token {
        Some(t) => builder.bearer_auth(t),
        None => builder,
    }
}

pub fn url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Pulls the human-readable message out of an error payload, falling back
/// to the raw body.
pub fn error_message(body: &str) -> String {
    let Ok(v) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    v.pointer("/error/message")
        .or_else(|| v.pointer("/predictions/0/error"))
        .or_else(|| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Streams a response body to `dest`, returning the byte count.
pub async fn save_body(resp: reqwest::Response, dest: &Path) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        assert_eq!(url("http://h:8080/", "/health"), "http://h:8080/health");
        assert_eq!(url("http://h:8080", "/status/x"), "http://h:8080/status/x");
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"error":{"message":"queue is full","type":"queue_full"}}"#),
            "queue is full"
        );
        assert_eq!(
            error_message(r#"{"predictions":[{"request_id":"x","error":"request id not found"}]}"#),
            "request id not found"
        );
        assert_eq!(error_message(r#"{"status":"error","message":"boom"}"#), "boom");
        assert_eq!(error_message("bad gateway"), "bad gateway");
    }
}

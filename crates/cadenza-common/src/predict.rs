use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{GenerationRequest, JobStatus};

/// What a `/predict` body asks for.
#[derive(Debug, Clone)]
pub enum PredictCall {
    /// `{"instances":[{"status_request_id": "..."}]}`
    Status(String),
    Generate(GenerationRequest),
}

/// Accepts the serving-platform envelope (`{"instances":[{...}]}`, where an
/// instance may wrap its payload in `data`) as well as a bare request object.
pub fn parse_predict_body(body: Value) -> Result<PredictCall, String> {
    let instance = match body {
        Value::Object(mut map) if map.contains_key("instances") => {
            let instances = map.remove("instances").unwrap_or(Value::Null);
            let Value::Array(items) = instances else {
                return Err("instances must be an array".to_string());
            };
            let Some(first) = items.into_iter().next() else {
                return Err("no instances provided".to_string());
            };
            first
        }
        Value::Object(map) => Value::Object(map),
        _ => return Err("request body must be a JSON object".to_string()),
    };

    if let Some(id) = instance.get("status_request_id").and_then(|v| v.as_str()) {
        return Ok(PredictCall::Status(id.to_string()));
    }

    let payload = match instance {
        Value::Object(mut map) if map.get("data").map(Value::is_object).unwrap_or(false) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    serde_json::from_value::<GenerationRequest>(payload)
        .map(PredictCall::Generate)
        .map_err(|e| format!("invalid request: {e}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse<T> {
    pub predictions: Vec<T>,
}

impl<T> PredictResponse<T> {
    pub fn single(item: T) -> Self {
        Self {
            predictions: vec![item],
        }
    }
}

/// Returned when a generation job was admitted to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub request_id: String,
    pub status: JobStatus,
    pub queue_position: u64,
    pub estimated_wait_time_seconds: u64,
    pub message: String,
    pub user_id: String,
    pub song_name: String,
}

/// Returned for `lyrics_only` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyricsResult {
    pub request_id: String,
    pub status: JobStatus,
    pub lyrics: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_instances_with_data_wrapper() {
        let body = json!({"instances": [{"data": {"lyrics": "[verse]\nhi", "genre": "rock"}}]});
        match parse_predict_body(body).unwrap() {
            PredictCall::Generate(req) => {
                assert_eq!(req.genre.as_deref(), Some("rock"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_status_lookup() {
        let body = json!({"instances": [{"status_request_id": "abc"}]});
        assert!(matches!(parse_predict_body(body).unwrap(), PredictCall::Status(id) if id == "abc"));
    }

    #[test]
    fn test_parse_bare_object_and_errors() {
        let body = json!({"prompt": "summer night"});
        assert!(matches!(parse_predict_body(body).unwrap(), PredictCall::Generate(_)));

        assert_eq!(
            parse_predict_body(json!({"instances": []})).unwrap_err(),
            "no instances provided"
        );
        assert!(parse_predict_body(json!([1, 2])).is_err());
    }
}

//! HTTP implementation of [`BatchApi`] against an Anthropic-style
//! message-batches endpoint.

use {
    crate::{BatchApi, Error, Result},
    chrono::{DateTime, Utc},
    model::batch::{
        BatchCreated, BatchInfo, BatchResultItem, BatchState, RequestCounts, ResultEntry,
    },
    serde::{Deserialize, Serialize},
    url::Url,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Included in error strings; bodies can be arbitrarily large.
const ERROR_BODY_LIMIT: usize = 1_000;

pub struct HttpBatchApi {
    client: reqwest::Client,
    base: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HttpBatchApi {
    pub fn new(
        client: reqwest::Client,
        base: Url,
        api_key: String,
        model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            client,
            base,
            api_key,
            model,
            max_tokens,
        }
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<String> {
        let response = request
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|err| Error::classified(format!("{what}: request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| Error::classified(format!("{what}: reading body: {err}")))?;
        if !status.is_success() {
            return Err(Error::classified(format!(
                "{what}: bad status {status}, body {:?}",
                truncated(&body)
            )));
        }
        Ok(body)
    }

    async fn fetch_batch(&self, batch_id: &str) -> Result<WireBatch> {
        let url = self.url(&format!("v1/messages/batches/{batch_id}"));
        let body = self.send(self.client.get(url), "batch status").await?;
        serde_json::from_str(&body)
            .map_err(|err| Error::permanent(format!("decoding batch status: {err}")))
    }
}

#[async_trait::async_trait]
impl BatchApi for HttpBatchApi {
    async fn create_batch(&self, custom_id: &str, prompt: &str) -> Result<BatchCreated> {
        let body = CreateBatchBody {
            requests: vec![Request {
                custom_id,
                params: Params {
                    model: &self.model,
                    max_tokens: self.max_tokens,
                    temperature: 0.0,
                    messages: vec![Message {
                        role: "user",
                        content: prompt,
                    }],
                },
            }],
        };
        let request = self.client.post(self.url("v1/messages/batches")).json(&body);
        let body = self.send(request, "batch create").await?;
        let batch: WireBatch = serde_json::from_str(&body)
            .map_err(|err| Error::permanent(format!("decoding batch create: {err}")))?;
        Ok(BatchCreated {
            batch_id: batch.id,
            state: batch.processing_status,
            created_at: batch.created_at,
            expires_at: batch.expires_at,
        })
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchInfo> {
        let batch = self.fetch_batch(batch_id).await?;
        Ok(BatchInfo {
            batch_id: batch.id,
            state: batch.processing_status,
            created_at: batch.created_at,
            ended_at: batch.ended_at,
            expires_at: batch.expires_at,
            results_url: batch.results_url,
            request_counts: batch.request_counts,
        })
    }

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultItem>> {
        let batch = self.fetch_batch(batch_id).await?;
        if !batch.processing_status.is_ended() {
            return Err(Error::transient(format!(
                "batch {batch_id} has not ended yet, current status {}",
                batch.processing_status
            )));
        }
        let Some(results_url) = batch.results_url else {
            return Err(Error::permanent(format!(
                "batch {batch_id} reports no results url"
            )));
        };
        let body = self
            .send(self.client.get(results_url), "batch results")
            .await?;
        parse_results(&body)
    }
}

#[derive(Serialize)]
struct CreateBatchBody<'a> {
    requests: Vec<Request<'a>>,
}

#[derive(Serialize)]
struct Request<'a> {
    custom_id: &'a str,
    params: Params<'a>,
}

#[derive(Serialize)]
struct Params<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireBatch {
    id: String,
    processing_status: BatchState,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    results_url: Option<String>,
    #[serde(default)]
    request_counts: RequestCounts,
}

#[derive(Deserialize)]
struct WireResultLine {
    custom_id: String,
    result: WireResult,
}

/// Probes the per-request result without committing to a closed set of
/// `type`s; anything unknown maps to [`ResultEntry::Other`].
#[derive(Deserialize)]
struct WireResult {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Decodes the results body: one JSON object per line.
fn parse_results(body: &str) -> Result<Vec<BatchResultItem>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let line: WireResultLine = serde_json::from_str(line)
                .map_err(|err| Error::permanent(format!("decoding result entry: {err}")))?;
            Ok(BatchResultItem {
                custom_id: line.custom_id,
                result: convert_result(line.result),
            })
        })
        .collect()
}

fn convert_result(result: WireResult) -> ResultEntry {
    match result.kind.as_str() {
        "succeeded" => {
            let message = result.message.unwrap_or_else(|| WireMessage {
                id: String::new(),
                content: vec![],
                usage: WireUsage::default(),
            });
            // The answer is the first text content item; tool calls and the
            // like come before it.
            let text = message
                .content
                .iter()
                .find(|content| content.kind == "text")
                .map(|content| content.text.clone())
                .unwrap_or_default();
            ResultEntry::Succeeded {
                text,
                message_id: message.id,
                input_tokens: message.usage.input_tokens,
                output_tokens: message.usage.output_tokens,
            }
        }
        "errored" => {
            let message = match &result.error {
                Some(error) => error
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
                None => "unknown error".to_string(),
            };
            ResultEntry::Errored { message }
        }
        kind => ResultEntry::Other {
            kind: kind.to_string(),
        },
    }
}

fn truncated(body: &str) -> &str {
    let end = body
        .char_indices()
        .take_while(|(at, _)| *at <= ERROR_BODY_LIMIT)
        .map(|(at, char)| at + char.len_utf8())
        .last()
        .unwrap_or(0);
    &body[..end]
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn serializes_create_request() {
        let body = CreateBatchBody {
            requests: vec![Request {
                custom_id: "d1",
                params: Params {
                    model: "some-model",
                    max_tokens: 1024,
                    temperature: 0.0,
                    messages: vec![Message {
                        role: "user",
                        content: "classify X",
                    }],
                },
            }],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "requests": [{
                    "custom_id": "d1",
                    "params": {
                        "model": "some-model",
                        "max_tokens": 1024,
                        "temperature": 0.0,
                        "messages": [{"role": "user", "content": "classify X"}],
                    },
                }],
            })
        );
    }

    #[test]
    fn parses_result_lines() {
        let body = concat!(
            r#"{"custom_id":"d1","result":{"type":"succeeded","message":{"id":"msg_1","content":[{"type":"tool_use","id":"t1"},{"type":"text","text":"26.30.11.150-00000123"}],"usage":{"input_tokens":420,"output_tokens":18}}}}"#,
            "\n",
            r#"{"custom_id":"d2","result":{"type":"errored","error":{"type":"invalid_request_error","message":"bad model"}}}"#,
            "\n\n",
            r#"{"custom_id":"d3","result":{"type":"canceled"}}"#,
            "\n",
        );
        let results = parse_results(body).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].custom_id, "d1");
        assert_eq!(
            results[0].result,
            ResultEntry::Succeeded {
                text: "26.30.11.150-00000123".to_string(),
                message_id: "msg_1".to_string(),
                input_tokens: 420,
                output_tokens: 18,
            }
        );
        assert_eq!(
            results[1].result,
            ResultEntry::Errored {
                message: "bad model".to_string(),
            }
        );
        assert_eq!(
            results[2].result,
            ResultEntry::Other {
                kind: "canceled".to_string(),
            }
        );
    }

    #[test]
    fn succeeded_without_text_content_yields_empty_text() {
        let body =
            r#"{"custom_id":"d1","result":{"type":"succeeded","message":{"id":"msg_1","content":[{"type":"tool_use","id":"t1"}],"usage":{"input_tokens":1,"output_tokens":2}}}}"#;
        let results = parse_results(body).unwrap();
        match &results[0].result {
            ResultEntry::Succeeded { text, .. } => assert_eq!(text, ""),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn decodes_batch_wire_format() {
        let batch: WireBatch = serde_json::from_value(json!({
            "id": "msgbatch_1",
            "type": "message_batch",
            "processing_status": "ended",
            "request_counts": {"processing": 0, "succeeded": 1, "errored": 0, "canceled": 0, "expired": 0},
            "created_at": "2025-01-01T12:00:00Z",
            "ended_at": "2025-01-01T12:01:30Z",
            "expires_at": "2025-01-02T12:00:00Z",
            "results_url": "https://api.example.com/v1/messages/batches/msgbatch_1/results",
        }))
        .unwrap();
        assert_eq!(batch.id, "msgbatch_1");
        assert_eq!(batch.processing_status, BatchState::Ended);
        assert_eq!(batch.request_counts.succeeded, 1);
        let info = BatchInfo {
            batch_id: batch.id,
            state: batch.processing_status,
            created_at: batch.created_at,
            ended_at: batch.ended_at,
            expires_at: batch.expires_at,
            results_url: batch.results_url,
            request_counts: batch.request_counts,
        };
        assert_eq!(info.processing_time(), Some(90.0));
    }

    #[test]
    fn truncates_error_bodies_at_char_boundaries() {
        let body = "ы".repeat(2_000);
        let cut = truncated(&body);
        assert!(cut.len() <= ERROR_BODY_LIMIT + 2);
        assert!(body.starts_with(cut));
        assert_eq!(truncated(""), "");
    }
}

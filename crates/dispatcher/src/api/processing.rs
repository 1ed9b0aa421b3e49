//! Text-processing endpoints: submit a task, poll a task.

use {
    super::{ApiError, AppContext},
    axum::{
        Json,
        extract::{Path, State},
        http::StatusCode,
    },
    model::task::TaskState,
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    store::tasks::NewTask,
};

#[derive(Debug, Deserialize)]
pub struct ProcessingRequest {
    pub text: String,
    #[serde(default)]
    pub document_id: Option<String>,
    /// Overrides the configured prompt template. Must contain `{text}`.
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProcessingResponse {
    pub request_id: String,
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskState>,
    /// Fetched lazily from the remote API; absent when unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_status: Option<String>,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub processing_time: f64,
}

/// Accepts a text for classification. The task starts out `pending`; the
/// dispatch loop owns the actual submission.
pub async fn submit(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ProcessingRequest>,
) -> Result<(StatusCode, Json<ProcessingResponse>), ApiError> {
    let template = request
        .prompt_template
        .as_deref()
        .unwrap_or(&ctx.prompt_template);
    let prompt = format_prompt(template, &request.text).map_err(ApiError::bad_request)?;

    let task_id = format!("task_{}", uuid::Uuid::new_v4());
    let document_id = request
        .document_id
        .unwrap_or_else(|| format!("doc_{}", uuid::Uuid::new_v4()));
    let task = ctx
        .store
        .tasks()
        .create_task(NewTask {
            task_id: task_id.clone(),
            document_id: document_id.clone(),
            prompt,
            callback_url: ctx.callback_url.clone(),
            callback_secret: ctx.callback_secret.clone(),
            batch_id: None,
        })
        .await
        .map_err(|err| ApiError::internal(format!("failed to create task: {err}")))?;
    tracing::info!(task = task_id, document = document_id, "accepted task");

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessingResponse {
            request_id: task.task_id,
            batch_id: task.batch_id,
            status: Some(task.state),
            batch_status: None,
            result: serde_json::json!({}),
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            processing_time: 0.0,
        }),
    ))
}

/// Full task view; the remote batch status is looked up on the fly when the
/// task has been submitted.
pub async fn status(
    State(ctx): State<Arc<AppContext>>,
    Path(task_id): Path<String>,
) -> Result<Json<ProcessingResponse>, ApiError> {
    let task = ctx
        .store
        .tasks()
        .get_task(&task_id, false)
        .await
        .map_err(|err| ApiError::internal(format!("failed to load task: {err}")))?
        .ok_or_else(|| ApiError::not_found(format!("task {task_id} not found")))?;

    let batch_status = match &task.batch_id {
        Some(batch_id) => match ctx.batch_api.batch_status(batch_id).await {
            Ok(info) => Some(info.state.to_string()),
            Err(err) => {
                tracing::warn!(%err, batch = batch_id, "failed to fetch batch status");
                None
            }
        },
        None => None,
    };

    Ok(Json(ProcessingResponse {
        request_id: task.task_id,
        batch_id: task.batch_id,
        status: Some(task.state),
        batch_status,
        result: task.result.unwrap_or_else(|| serde_json::json!({})),
        error: task.error,
        input_tokens: task.input_tokens.unwrap_or_default(),
        output_tokens: task.output_tokens.unwrap_or_default(),
        processing_time: task.processing_time.unwrap_or_default(),
    }))
}

/// Substitutes the submitted text into the template.
pub fn format_prompt(template: &str, text: &str) -> Result<String, String> {
    if !template.contains("{text}") {
        return Err("prompt template must contain a {text} placeholder".to_string());
    }
    Ok(template.replace("{text}", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_prompt() {
        assert_eq!(
            format_prompt("classify: {text}!", "some document").unwrap(),
            "classify: some document!"
        );
    }

    #[test]
    fn rejects_templates_without_placeholder() {
        assert!(format_prompt("classify this", "some document").is_err());
    }
}

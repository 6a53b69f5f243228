//! Task endpoints: lifecycle, edits, stream replay and live events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use futures::stream::Stream;
use tokio::sync::broadcast;

use super::routes::AppState;
use super::types::*;
use crate::pipeline::Stage;
use crate::service::{EventFeed, ServiceError, TaskFilter, TaskService};
use crate::store::AssetStore;
use crate::stream::StreamEvent;
use crate::task::{AssetRef, CropRegion, ProblemOverride, ProblemSummary, Task, TaskHints, TaskStatus, TraceEvent};

type ApiResult<T> = Result<T, (StatusCode, String)>;

impl From<ServiceError> for (StatusCode, String) {
    fn from(err: ServiceError) -> Self {
        (err.status_code(), err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

/// Mime type embedded in a `data:image/png;base64,...` payload.
fn data_url_mime(payload: &str) -> Option<String> {
    let rest = payload.strip_prefix("data:")?;
    let (mime, _) = rest.split_once(";base64,")?;
    (!mime.is_empty()).then(|| mime.to_string())
}

async fn resolve_asset(assets: &AssetStore, req: &CreateTaskRequest) -> ApiResult<AssetRef> {
    match (&req.image_url, &req.image_base64) {
        (Some(url), None) => {
            let mime = req.mime_type.clone().unwrap_or_else(|| "image/jpeg".to_string());
            Ok(AssetRef::remote(url.clone(), mime))
        }
        (None, Some(payload)) => {
            let mime = req
                .mime_type
                .clone()
                .or_else(|| data_url_mime(payload))
                .unwrap_or_else(|| "image/jpeg".to_string());
            assets.save_base64(payload, &mime).await.map_err(bad_request)
        }
        _ => Err(bad_request("Provide exactly one of image_url or image_base64")),
    }
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let asset = resolve_asset(&state.assets, &req).await?;
    let task = state.service.create(asset, req.hints, req.regions).await?;
    let task = if req.auto_start {
        state.service.start(&task.id, req.background).await?
    } else {
        task
    };
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .map_err(bad_request)?;
    let filter = TaskFilter {
        status,
        active_only: query.active_only,
        subject: query.subject,
    };
    Ok(Json(state.service.list(&filter).await?))
}

/// Fields collected from a multipart upload.
#[derive(Debug, Default)]
struct UploadForm {
    image: Option<(Vec<u8>, String)>,
    hints: Option<TaskHints>,
    regions: Vec<CropRegion>,
    subject: Option<String>,
    grade: Option<String>,
}

impl UploadForm {
    /// Take one form part. The image part is `file` or `image`; `hints` and `regions`
    /// hold JSON; `subject` and `grade` override the matching hint.
    fn accept(&mut self, name: &str, content_type: Option<&str>, data: &[u8]) -> ApiResult<()> {
        let text = || {
            std::str::from_utf8(data)
                .map(|s| s.trim().to_string())
                .map_err(|_| bad_request(format!("Field {} is not UTF-8", name)))
        };
        match name {
            "file" | "image" => {
                let mime = content_type
                    .filter(|m| m.starts_with("image/"))
                    .unwrap_or("image/jpeg");
                self.image = Some((data.to_vec(), mime.to_string()));
            }
            "hints" => {
                let hints = serde_json::from_slice(data).map_err(|e| bad_request(format!("Invalid hints: {}", e)))?;
                self.hints = Some(hints);
            }
            "regions" => {
                self.regions =
                    serde_json::from_slice(data).map_err(|e| bad_request(format!("Invalid regions: {}", e)))?;
            }
            "subject" => self.subject = Some(text()?).filter(|s| !s.is_empty()),
            "grade" => self.grade = Some(text()?).filter(|s| !s.is_empty()),
            other => tracing::debug!(field = %other, "Ignoring unknown upload field"),
        }
        Ok(())
    }

    fn hints(&mut self) -> TaskHints {
        let mut hints = self.hints.take().unwrap_or_default();
        if let Some(subject) = self.subject.take() {
            hints.subject = subject;
        }
        if let Some(grade) = self.grade.take() {
            hints.grade = Some(grade);
        }
        hints
    }
}

async fn submit_upload(state: &AppState, mut form: UploadForm, query: &UploadQuery) -> ApiResult<Task> {
    let (data, mime) = form
        .image
        .take()
        .ok_or_else(|| bad_request("No image uploaded"))?;
    let hints = form.hints();
    let asset = state.assets.save_bytes(&data, &mime).await.map_err(bad_request)?;
    let task = state.service.create(asset, hints, form.regions).await?;
    if query.auto_process {
        return Ok(state.service.start(&task.id, query.background).await?);
    }
    Ok(task)
}

/// POST /api/upload - create a task from a multipart image upload.
///
/// Accepts a `file` (or `image`) part plus optional `hints`, `regions`, `subject` and
/// `grade` parts. Processing starts right away unless `auto_process=false`.
pub async fn upload_task(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Failed to read upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("Failed to read field {}: {}", name, e)))?;
        form.accept(&name, content_type.as_deref(), &data)?;
    }
    let task = submit_upload(&state, form, &query).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// Problems across all tasks, optionally narrowed by subject and knowledge point.
pub async fn list_problems(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProblemsQuery>,
) -> ApiResult<Json<Vec<ProblemSummary>>> {
    let problems = state
        .service
        .list_problems(query.subject.as_deref(), query.tag.as_deref())
        .await?;
    Ok(Json(problems))
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(state.service.get(&id).await?))
}

pub async fn delete_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.service.delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn process_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ProcessQuery>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.service.start(&id, query.background).await?))
}

pub async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(state.service.cancel(&id).await?))
}

pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RetryQuery>,
) -> ApiResult<Json<Task>> {
    Ok(Json(
        state
            .service
            .retry(&id, query.clear_stream, query.background)
            .await?,
    ))
}

pub async fn read_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Json<StreamTextResponse>> {
    let text = state.service.read_stream(&id, query.max_chars).await?;
    Ok(Json(StreamTextResponse { task_id: id, text }))
}

pub async fn list_traces(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<TraceEvent>>> {
    Ok(Json(state.service.traces(&id).await?))
}

pub async fn override_problem(
    State(state): State<Arc<AppState>>,
    Path((id, problem_id)): Path<(String, String)>,
    Json(fields): Json<ProblemOverride>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.service.override_problem(&id, &problem_id, fields).await?))
}

pub async fn delete_problem(
    State(state): State<Arc<AppState>>,
    Path((id, problem_id)): Path<(String, String)>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.service.delete_problem(&id, &problem_id).await?))
}

pub async fn rerun_problem(
    State(state): State<Arc<AppState>>,
    Path((id, problem_id)): Path<(String, String)>,
    Json(req): Json<RerunRequest>,
) -> ApiResult<Json<Task>> {
    let stage: Stage = req.stage.parse().map_err(bad_request)?;
    Ok(Json(state.service.rerun_stage(&id, &problem_id, stage).await?))
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Drops the broker channel once the last follower goes away.
struct ReleaseOnDrop {
    service: TaskService,
    task_id: String,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.service.release(&self.task_id);
    }
}

/// Live progress over SSE.
///
/// Every connection starts with a `progress` event and an `llm_snapshot` of the text so far,
/// then relays the live events until `done`. Finished tasks get the same three events at once.
pub async fn task_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let feed = state.service.events(&id).await?;
    let service = state.service.clone();

    let stream = async_stream::stream! {
        match feed {
            EventFeed::Finished { task, text } => {
                yield Ok(sse_event(&StreamEvent::progress(
                    &task.id,
                    task.status,
                    task.stage.clone(),
                    task.stage_message.clone(),
                )));
                yield Ok(sse_event(&StreamEvent::LlmSnapshot { task_id: task.id.clone(), text }));
                yield Ok(sse_event(&StreamEvent::Done { task_id: task.id.clone(), status: task.status }));
            }
            EventFeed::Live { task, subscription } => {
                let _release = ReleaseOnDrop { service, task_id: task.id.clone() };
                let mut rx = subscription.rx;

                yield Ok(sse_event(&StreamEvent::progress(
                    &task.id,
                    task.status,
                    task.stage.clone(),
                    task.stage_message.clone(),
                )));
                yield Ok(sse_event(&StreamEvent::LlmSnapshot {
                    task_id: task.id.clone(),
                    text: subscription.snapshot,
                }));

                loop {
                    match rx.recv().await {
                        Ok(ev) => {
                            let done = ev.is_done();
                            yield Ok(sse_event(&ev));
                            if done {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(task_id = %task.id, skipped, "Event subscriber lagged");
                            yield Ok(sse_event(&StreamEvent::Error {
                                message: Some("event stream lagged; reconnect to resync".to_string()),
                            }));
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

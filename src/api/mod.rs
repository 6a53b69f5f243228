//! HTTP API for oopsnote.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/tasks` - Upload an exercise image (URL or base64), optionally start it
//! - `POST /api/upload` - Multipart image upload; starts processing unless `auto_process=false`
//! - `GET /api/tasks` - List tasks (`status`, `active_only`, `subject`)
//! - `GET /api/problems` - Problem library across tasks (`subject`, `tag`)
//! - `GET /api/tasks/{id}` - Task snapshot
//! - `DELETE /api/tasks/{id}` - Delete a task that is not running
//! - `POST /api/tasks/{id}/process` - Start a pending task
//! - `POST /api/tasks/{id}/cancel` - Cancel a pending or running task
//! - `POST /api/tasks/{id}/retry` - Resume a failed task or recompute a completed one
//! - `GET /api/tasks/{id}/stream` - Replay the accumulated model output
//! - `GET /api/tasks/{id}/events` - Live progress via SSE
//! - `GET /api/tasks/{id}/traces` - Model call records
//! - `PATCH /api/tasks/{id}/problems/{pid}` - Human correction of one problem
//! - `DELETE /api/tasks/{id}/problems/{pid}` - Remove one problem
//! - `POST /api/tasks/{id}/problems/{pid}/rerun` - Recompute one stage for one problem
//! - `GET /api/tags` - Known tags (`dimension`)

mod routes;
mod tags;
mod tasks;
pub mod types;

pub use routes::{build_state, router, serve, AppState};

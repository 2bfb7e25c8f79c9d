use axum::{Extension, Json};
use serde_json::{json, Value};
use crate::state::Registry;

pub async fn health(Extension(rooms): Extension<Registry>) -> Json<Value> {
    let reg = rooms.read().await;
    Json(json!({
        "status":      "ok",
        "rooms":       reg.room_count(),
        "connections": reg.session_count(),
    }))
}

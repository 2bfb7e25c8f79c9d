use tokio::time;
use tracing::info;
use crate::state::Registry;

/// Logs a room/connection summary every `every`.
pub async fn task(registry: Registry, every: time::Duration) {
    let mut tick = time::interval(every);
    tick.tick().await; // 第一下立即返回，略過
    loop {
        tick.tick().await;
        let reg = registry.read().await;
        let rooms = reg.room_sizes();
        if rooms.is_empty() {
            info!(connections = reg.session_count(), "stats: no active rooms");
            continue;
        }
        let detail: Vec<String> = rooms
            .iter()
            .map(|(id, n)| format!("{id}:{n}/{}", reg.capacity()))
            .collect();
        info!(
            connections = reg.session_count(),
            rooms = rooms.len(),
            detail = %detail.join(", "),
            "stats"
        );
    }
}

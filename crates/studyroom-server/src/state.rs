use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::history::HistoryRecorder;
use crate::presence::PresenceRegistry;
use crate::rate_limit::IpRateLimiter;
use crate::room_manager::RoomManager;

pub type SharedRoomManager = Arc<RoomManager>;

#[derive(Clone)]
pub struct AppState {
    pub rooms: SharedRoomManager,
    pub presence: Arc<PresenceRegistry>,
    pub history: Arc<HistoryRecorder>,
    pub config: Arc<ServerConfig>,
    pub api_limiter: Arc<IpRateLimiter>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub ws_per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
    pub sse_subscriber_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: ServerConfig, history: HistoryRecorder) -> Self {
        let history = Arc::new(history);
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(RoomManager::new(
            config.rooms.clone(),
            Arc::clone(&history),
            Arc::clone(&presence),
        ));
        let api_limiter = Arc::new(IpRateLimiter::new(
            config.limits.api_rate_limit_burst as f64,
            config.limits.api_rate_limit_per_sec,
        ));
        Self {
            rooms,
            presence,
            history,
            config: Arc::new(config),
            api_limiter,
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            ws_per_ip: Arc::new(Mutex::new(HashMap::new())),
            sse_subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Counts a live connection for as long as it is held.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Holds one of an IP's WebSocket slots.
pub struct IpConnectionGuard {
    ip: IpAddr,
    per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl IpConnectionGuard {
    /// Take a slot, or `None` when the IP is at `max`.
    pub async fn try_acquire(
        ip: IpAddr,
        per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
        max: usize,
    ) -> Option<Self> {
        {
            let mut counts = per_ip.lock().await;
            let count = counts.entry(ip).or_insert(0);
            if *count >= max {
                return None;
            }
            *count += 1;
        }
        Some(Self { ip, per_ip })
    }
}

impl Drop for IpConnectionGuard {
    fn drop(&mut self) {
        let ip = self.ip;
        let per_ip = Arc::clone(&self.per_ip);
        // Drop can't await; release the slot from a task.
        tokio::spawn(async move {
            let mut counts = per_ip.lock().await;
            if let Some(count) = counts.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&ip);
                }
            }
        });
    }
}

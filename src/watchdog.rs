use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::accessor::SettingsAccessor;
use crate::clock::Clock;
use crate::document::{lock, looks_empty};
use crate::events::{Observers, StateEvent};
use crate::host::HostBridge;
use crate::layout::{self, LAUNCHER_ID, MENU_ID};
use crate::mirror::MirrorManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogTick {
    /// A drag is in progress; nothing was touched.
    Dragging,
    Idle,
    Recovered,
}

/// Periodic self-heal: puts lost floating UI back on screen and restores the
/// document from the mirror when it was wiped underneath us.
pub struct FailsafeWatchdog {
    accessor: Arc<SettingsAccessor>,
    mirror: Arc<MirrorManager>,
    host: Arc<dyn HostBridge>,
    observers: Arc<Observers>,
    clock: Arc<dyn Clock>,
    recover_min_interval_ms: u64,
    dragging: AtomicBool,
    last_recover_at: AtomicU64,
}

impl FailsafeWatchdog {
    pub fn new(
        accessor: Arc<SettingsAccessor>,
        host: Arc<dyn HostBridge>,
        observers: Arc<Observers>,
        clock: Arc<dyn Clock>,
        recover_min_interval_ms: u64,
    ) -> Self {
        Self {
            mirror: accessor.mirror().clone(),
            accessor,
            host,
            observers,
            clock,
            recover_min_interval_ms,
            dragging: AtomicBool::new(false),
            last_recover_at: AtomicU64::new(0),
        }
    }

    pub fn set_dragging(&self, dragging: bool) {
        self.dragging.store(dragging, Ordering::SeqCst);
    }

    pub fn tick(&self) -> WatchdogTick {
        if self.dragging.load(Ordering::SeqCst) {
            return WatchdogTick::Dragging;
        }

        self.clamp_floating();

        let now = self.clock.now_millis();
        let last = self.last_recover_at.load(Ordering::SeqCst);
        if last > 0 && now.saturating_sub(last) < self.recover_min_interval_ms {
            return WatchdogTick::Idle;
        }

        let live = self.accessor.get();
        let empty = looks_empty(&lock(&live));
        if empty && self.mirror.has_non_empty_mirror() {
            self.last_recover_at.store(now.max(1), Ordering::SeqCst);
            self.recover("empty_settings");
            return WatchdogTick::Recovered;
        }
        WatchdogTick::Idle
    }

    /// Force a mirror restore attempt and let the UI re-render.
    pub fn recover(&self, reason: &str) {
        tracing::warn!(reason, "settings document looks wiped, recovering from mirror");
        self.mirror.kick_durable_load();
        self.accessor.restore_from_mirror_if_empty();
        self.observers.emit(StateEvent::FailsafeRecovered {
            reason: reason.to_string(),
        });
    }

    fn clamp_floating(&self) {
        let Some(viewport) = self.host.viewport() else {
            return;
        };
        let doc = self.accessor.peek();
        let plan = layout::clamp_floating(
            &doc,
            &viewport,
            self.host.element_rect(MENU_ID),
            self.host.element_rect(LAUNCHER_ID),
        );
        if let Some(plan) = plan {
            tracing::debug!(moved = plan.placements.len(), "clamped off-screen ui");
            self.host.apply_layout(&plan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::document::Document;
    use crate::host::MemoryHost;
    use crate::layout::{Rect, Viewport};
    use crate::storage::{MemoryDurableStore, MemoryStorage};
    use serde_json::json;

    fn setup() -> (Arc<MemoryHost>, Arc<ManualClock>, Arc<SettingsAccessor>, FailsafeWatchdog) {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mirror = Arc::new(MirrorManager::new(
            Arc::new(MemoryStorage::new(1 << 20)),
            Arc::new(MemoryDurableStore::new()),
            host.clone(),
            clock.clone(),
        ));
        let observers = Arc::new(Observers::new());
        let accessor = SettingsAccessor::new(
            EngineConfig::default(),
            host.clone(),
            mirror,
            clock.clone(),
            observers.clone(),
        );
        let watchdog = FailsafeWatchdog::new(accessor.clone(), host.clone(), observers, clock.clone(), 2_500);
        (host, clock, accessor, watchdog)
    }

    #[tokio::test]
    async fn test_wiped_document_is_healed() {
        let (host, _clock, accessor, watchdog) = setup();
        lock(&accessor.get()).insert("diary".into(), json!({"d": "entry"}));
        accessor.persist();
        assert_eq!(watchdog.tick(), WatchdogTick::Idle);

        host.clear_bucket();
        watchdog.tick();
        assert_eq!(host.bucket_snapshot().unwrap()["diary"]["d"], json!("entry"));
    }

    #[tokio::test]
    async fn test_recovery_is_rate_limited() {
        let (_host, clock, accessor, watchdog) = setup();
        let shell = json!({"ui": {"scale": 0.8}}).as_object().cloned().unwrap();
        accessor.mirror().write_mirror(&shell);

        assert_eq!(watchdog.tick(), WatchdogTick::Recovered);
        clock.advance(100);
        assert_eq!(watchdog.tick(), WatchdogTick::Idle);
        clock.advance(2_500);
        assert_eq!(watchdog.tick(), WatchdogTick::Recovered);
    }

    #[tokio::test]
    async fn test_recover_emits_event() {
        let (_host, _clock, _accessor, watchdog) = setup();
        let mut rx = watchdog.observers.subscribe();
        watchdog.recover("manual");
        assert_eq!(
            rx.recv().await.unwrap(),
            StateEvent::FailsafeRecovered { reason: "manual".into() }
        );
    }

    #[tokio::test]
    async fn test_dragging_skips_everything() {
        let (host, _clock, _accessor, watchdog) = setup();
        host.set_viewport(Some(Viewport { width: 1280.0, height: 720.0, touch: false }));
        host.set_element_rect(MENU_ID, Rect { left: 4000.0, top: 10.0, width: 320.0, height: 420.0 });

        watchdog.set_dragging(true);
        assert_eq!(watchdog.tick(), WatchdogTick::Dragging);
        assert!(host.layouts().is_empty());

        watchdog.set_dragging(false);
        watchdog.tick();
        let plan = host.layouts().pop().unwrap();
        assert_eq!(plan.placements[0].id, MENU_ID);
        assert_eq!(plan.placements[0].left, 1280.0 - 320.0 - 10.0);
    }
}

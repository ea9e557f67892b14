//! Render-target synchronizer.
//!
//! Keeps named overlays (one source plus its layers) present on a render
//! target that may not be ready yet and may drop every resource on a style
//! swap. Per overlay the state moves `Detached -> Attempting -> Attached`
//! and back to `Detached` on handle loss or a style reload.
//!
//! Notes:
//! - Failed upserts are retried after `retry_delay`. At most one retry timer
//!   is pending per overlay, and it reads the latest collection when it
//!   fires, never the one captured at schedule time.
//! - Every timer and listener checks the overlay's cancelled flag before
//!   touching the target.
//! - Readiness failures are absorbed here. Nothing is surfaced to callers.
//! - Hover requests outlive the handle: they are bound on every new target
//!   and unbound when the handle goes away.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use foundation::geo::{FeatureCollection, Properties};
use foundation::time::Time;
use runtime::scheduler::Scheduler;
use runtime::timer_queue::TimerId;

use crate::hover::{Formatter, HoverBinding, HoverConfig};
use crate::layer::LayerSpec;
use crate::target::{ListenerId, PopupId, RenderTarget, TargetError, TargetHandle, same_target};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SyncState {
    Detached,
    Attempting,
    Attached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Delay before retrying a rejected upsert.
    pub retry_delay: Duration,
    /// Delay between a style-load signal and the re-upsert.
    pub style_settle_delay: Duration,
    /// How long a streak of failed attempts may last before the overlay is
    /// left `Detached`. `None` retries forever.
    pub max_retry_window: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(200),
            style_settle_delay: Duration::from_millis(100),
            max_retry_window: Some(Duration::from_secs(10)),
        }
    }
}

struct Overlay {
    name: String,
    features: RefCell<Rc<FeatureCollection>>,
    layers: RefCell<Rc<Vec<LayerSpec>>>,
    state: Cell<SyncState>,
    cancelled: Cell<bool>,
    retry: Cell<Option<TimerId>>,
    /// Start of the current streak of failed attempts.
    failing_since: Cell<Option<Time>>,
    /// Whether our source is believed to exist on the current target.
    source_known: Cell<bool>,
    style_listener: Cell<Option<ListenerId>>,
}

impl Overlay {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            features: RefCell::new(Rc::new(FeatureCollection::default())),
            layers: RefCell::new(Rc::new(Vec::new())),
            state: Cell::new(SyncState::Detached),
            cancelled: Cell::new(false),
            retry: Cell::new(None),
            failing_since: Cell::new(None),
            source_known: Cell::new(false),
            style_listener: Cell::new(None),
        }
    }

    fn set_state(&self, next: SyncState) {
        let prev = self.state.replace(next);
        if prev == next {
            return;
        }
        match next {
            SyncState::Attached => tracing::info!(overlay = %self.name, "overlay attached"),
            SyncState::Detached if prev == SyncState::Attached => {
                tracing::info!(overlay = %self.name, "overlay detached")
            }
            _ => tracing::trace!(overlay = %self.name, ?prev, ?next, "overlay state"),
        }
    }
}

/// A requested hover popup, bound to whichever target is current.
struct HoverSlot {
    layer_id: String,
    formatter: Formatter,
    config: HoverConfig,
    binding: RefCell<Option<HoverBinding>>,
}

impl HoverSlot {
    fn release(&self) {
        // Taken first so the binding's drop runs with no borrow held.
        let binding = self.binding.take();
        drop(binding);
    }
}

struct Shared {
    scheduler: Rc<dyn Scheduler>,
    config: SyncConfig,
    target: RefCell<TargetHandle>,
    overlays: RefCell<BTreeMap<String, Rc<Overlay>>>,
    hovers: RefCell<BTreeMap<u64, Rc<HoverSlot>>>,
    next_hover: Cell<u64>,
}

impl Shared {
    fn target(&self) -> TargetHandle {
        self.target.borrow().clone()
    }

    fn overlays(&self) -> Vec<Rc<Overlay>> {
        self.overlays.borrow().values().cloned().collect()
    }

    fn hovers(&self) -> Vec<Rc<HoverSlot>> {
        self.hovers.borrow().values().cloned().collect()
    }

    /// Drops the slot's binding and, with a handle present, binds it again.
    fn rebind(&self, slot: &HoverSlot) {
        slot.release();
        let Some(target) = self.target() else {
            return;
        };
        let binding = HoverBinding::bind_with(
            target,
            Rc::clone(&self.scheduler),
            &slot.layer_id,
            Rc::clone(&slot.formatter),
            slot.config.clone(),
        );
        slot.binding.replace(Some(binding));
    }

    fn cancel_retry(&self, overlay: &Overlay) {
        if let Some(id) = overlay.retry.take() {
            self.scheduler.cancel(id);
        }
    }

    /// Schedules an upsert after `delay`, replacing any pending one.
    fn schedule_attempt(self: &Rc<Self>, overlay: &Rc<Overlay>, delay: Duration) {
        self.cancel_retry(overlay);
        let shared = Rc::downgrade(self);
        let weak = Rc::downgrade(overlay);
        let id = self.scheduler.schedule(
            delay,
            Box::new(move || {
                let (Some(shared), Some(overlay)) = (shared.upgrade(), weak.upgrade()) else {
                    return;
                };
                overlay.retry.set(None);
                if overlay.cancelled.get() {
                    return;
                }
                shared.attempt(&overlay);
            }),
        );
        overlay.retry.set(Some(id));
        overlay.set_state(SyncState::Attempting);
    }

    fn subscribe(self: &Rc<Self>, overlay: &Rc<Overlay>, target: &Rc<dyn RenderTarget>) {
        if overlay.style_listener.get().is_some() {
            return;
        }
        let shared = Rc::downgrade(self);
        let weak: Weak<Overlay> = Rc::downgrade(overlay);
        let id = target.on_style_load(Rc::new(move || {
            let (Some(shared), Some(overlay)) = (shared.upgrade(), weak.upgrade()) else {
                return;
            };
            if overlay.cancelled.get() {
                return;
            }
            tracing::debug!(overlay = %overlay.name, "style loaded, re-attaching");
            // Whatever we had on the target is gone.
            overlay.source_known.set(false);
            overlay.failing_since.set(None);
            overlay.set_state(SyncState::Detached);
            shared.schedule_attempt(&overlay, shared.config.style_settle_delay);
        }));
        overlay.style_listener.set(Some(id));
    }

    fn unsubscribe(&self, overlay: &Overlay, target: &dyn RenderTarget) {
        if let Some(id) = overlay.style_listener.take() {
            if let Err(e) = target.off(id) {
                tracing::debug!(overlay = %overlay.name, %e, "style listener already gone");
            }
        }
    }

    fn attempt(self: &Rc<Self>, overlay: &Rc<Overlay>) {
        if overlay.cancelled.get() {
            return;
        }
        let Some(target) = self.target() else {
            overlay.set_state(SyncState::Detached);
            return;
        };

        let features = Rc::clone(&overlay.features.borrow());
        if features.is_empty() && !overlay.source_known.get() {
            overlay.failing_since.set(None);
            overlay.set_state(SyncState::Detached);
            return;
        }
        let layers = Rc::clone(&overlay.layers.borrow());

        match upsert(target.as_ref(), &overlay.name, &features, &layers) {
            Ok(()) => {
                overlay.source_known.set(true);
                overlay.failing_since.set(None);
                overlay.set_state(SyncState::Attached);
            }
            Err(e) => self.on_failure(overlay, &e),
        }
    }

    fn on_failure(self: &Rc<Self>, overlay: &Rc<Overlay>, err: &TargetError) {
        let now = self.scheduler.now();
        let since = overlay.failing_since.get().unwrap_or(now);
        overlay.failing_since.set(Some(since));

        if err.is_not_ready() {
            tracing::debug!(overlay = %overlay.name, "render target not ready, retrying");
        } else {
            tracing::warn!(overlay = %overlay.name, %err, "render target rejected upsert, retrying");
        }

        if let Some(window) = self.config.max_retry_window {
            if now.saturating_duration_since(since) >= window {
                tracing::warn!(
                    overlay = %overlay.name,
                    window_ms = window.as_millis() as u64,
                    "giving up on overlay until next update or style load"
                );
                overlay.failing_since.set(None);
                self.cancel_retry(overlay);
                overlay.set_state(SyncState::Detached);
                return;
            }
        }
        self.schedule_attempt(overlay, self.config.retry_delay);
    }

    fn teardown(&self, overlay: &Overlay) {
        overlay.cancelled.set(true);
        self.cancel_retry(overlay);
        if let Some(target) = self.target() {
            self.unsubscribe(overlay, target.as_ref());
        }
        overlay.set_state(SyncState::Detached);
    }
}

/// Test-then-create upsert of one overlay.
fn upsert(
    target: &dyn RenderTarget,
    name: &str,
    features: &FeatureCollection,
    layers: &[LayerSpec],
) -> Result<(), TargetError> {
    if target.has_source(name)? {
        target.set_source_data(name, features)?;
    } else {
        target.add_source(name, features)?;
    }
    for spec in layers {
        if !target.has_layer(&spec.id)? {
            target.add_layer(name, spec)?;
        }
    }
    Ok(())
}

/// Reconciles overlays with one render target.
///
/// Dropping the synchronizer tears down every overlay: pending retries are
/// cancelled and style listeners removed. Sources and layers already on the
/// target are left alone.
pub struct Synchronizer {
    shared: Rc<Shared>,
}

impl Synchronizer {
    pub fn new(scheduler: Rc<dyn Scheduler>, config: SyncConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                scheduler,
                config,
                target: RefCell::new(None),
                overlays: RefCell::new(BTreeMap::new()),
                hovers: RefCell::new(BTreeMap::new()),
                next_hover: Cell::new(0),
            }),
        }
    }

    pub fn with_target(
        scheduler: Rc<dyn Scheduler>,
        config: SyncConfig,
        target: Rc<dyn RenderTarget>,
    ) -> Self {
        let sync = Self::new(scheduler, config);
        sync.set_target(Some(target));
        sync
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn target(&self) -> TargetHandle {
        self.shared.target()
    }

    /// Records the latest data for `name` and tries to push it to the
    /// target right away.
    pub fn synchronize(&self, name: &str, features: FeatureCollection, layers: Vec<LayerSpec>) {
        let overlay = {
            let mut overlays = self.shared.overlays.borrow_mut();
            Rc::clone(
                overlays
                    .entry(name.to_string())
                    .or_insert_with(|| Rc::new(Overlay::new(name))),
            )
        };
        overlay.features.replace(Rc::new(features));
        overlay.layers.replace(Rc::new(layers));

        if let Some(target) = self.shared.target() {
            self.shared.subscribe(&overlay, &target);
        }
        // A fresh update restarts the retry window unless a streak is still
        // being retried.
        if overlay.state.get() != SyncState::Attempting {
            overlay.failing_since.set(None);
        }
        self.shared.cancel_retry(&overlay);
        self.shared.attempt(&overlay);
    }

    /// Swaps the render target. Bindings on the old target are removed best
    /// effort, every overlay is re-attempted on the new one and hover
    /// bindings follow.
    pub fn set_target(&self, target: TargetHandle) {
        let previous = self.shared.target.replace(target.clone());
        if let (Some(a), Some(b)) = (&previous, &target) {
            if same_target(a, b) {
                return;
            }
        }

        let overlays = self.shared.overlays();
        for overlay in &overlays {
            if let Some(old) = &previous {
                self.shared.unsubscribe(overlay, old.as_ref());
            }
            overlay.style_listener.set(None);
            self.shared.cancel_retry(overlay);
            overlay.source_known.set(false);
            overlay.failing_since.set(None);
            overlay.set_state(SyncState::Detached);
        }

        if let Some(target) = &target {
            for overlay in &overlays {
                self.shared.subscribe(overlay, target);
                self.shared.attempt(overlay);
            }
        }
        for slot in self.shared.hovers() {
            self.shared.rebind(&slot);
        }
    }

    /// Stops maintaining `name`. Returns `false` if it was never synchronized.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.shared.overlays.borrow_mut().remove(name);
        match removed {
            Some(overlay) => {
                self.shared.teardown(&overlay);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, name: &str) -> Option<SyncState> {
        self.shared.overlays.borrow().get(name).map(|o| o.state.get())
    }

    pub fn overlay_names(&self) -> Vec<String> {
        self.shared.overlays.borrow().keys().cloned().collect()
    }

    /// Binds a hover popup to `layer_id`. A missing handle is treated like
    /// a missing layer: the popup is bound once a target is set, and again
    /// on every later target.
    pub fn bind_hover(
        &self,
        layer_id: &str,
        formatter: impl Fn(&Properties) -> String + 'static,
        config: HoverConfig,
    ) -> SyncedHover {
        let key = self.shared.next_hover.get() + 1;
        self.shared.next_hover.set(key);
        let slot = Rc::new(HoverSlot {
            layer_id: layer_id.to_string(),
            formatter: Rc::new(formatter),
            config,
            binding: RefCell::new(None),
        });
        self.shared.hovers.borrow_mut().insert(key, Rc::clone(&slot));
        self.shared.rebind(&slot);
        SyncedHover {
            shared: Rc::downgrade(&self.shared),
            key,
            slot,
        }
    }
}

/// A hover binding maintained by a [`Synchronizer`].
///
/// Unbinding (explicitly or on drop) stops the synchronizer from binding
/// it again.
pub struct SyncedHover {
    shared: Weak<Shared>,
    key: u64,
    slot: Rc<HoverSlot>,
}

impl SyncedHover {
    pub fn layer_id(&self) -> &str {
        &self.slot.layer_id
    }

    /// Whether a target handle exists and the layer listeners are attached.
    pub fn is_attached(&self) -> bool {
        self.slot
            .binding
            .borrow()
            .as_ref()
            .is_some_and(HoverBinding::is_attached)
    }

    pub fn is_polling(&self) -> bool {
        self.slot
            .binding
            .borrow()
            .as_ref()
            .is_some_and(HoverBinding::is_polling)
    }

    /// The popup on the current target, if any.
    pub fn popup(&self) -> Option<PopupId> {
        self.slot.binding.borrow().as_ref().and_then(HoverBinding::popup)
    }

    pub fn unbind(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.hovers.borrow_mut().remove(&self.key);
        }
        self.slot.release();
    }
}

impl Drop for SyncedHover {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl std::fmt::Debug for SyncedHover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedHover")
            .field("layer_id", &self.slot.layer_id)
            .field("attached", &self.is_attached())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        let overlays = std::mem::take(&mut *self.shared.overlays.borrow_mut());
        for overlay in overlays.values() {
            self.shared.teardown(overlay);
        }
        let hovers = std::mem::take(&mut *self.shared.hovers.borrow_mut());
        for slot in hovers.values() {
            slot.release();
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states: BTreeMap<String, SyncState> = self
            .shared
            .overlays
            .borrow()
            .iter()
            .map(|(k, o)| (k.clone(), o.state.get()))
            .collect();
        f.debug_struct("Synchronizer")
            .field("config", &self.shared.config)
            .field("has_target", &self.shared.target.borrow().is_some())
            .field("overlays", &states)
            .field("hovers", &self.shared.hovers.borrow().len())
            .finish()
    }
}

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use foundation::geo::Properties;
use foundation::time::Time;
use runtime::scheduler::Scheduler;
use runtime::timer_queue::TimerId;

use crate::target::{
    Cursor, ListenerId, PointerEvent, PointerEventKind, PopupId, PopupOptions, RenderTarget,
};

/// Builds popup content from a hovered feature's properties.
pub type Formatter = Rc<dyn Fn(&Properties) -> String>;

#[derive(Debug, Clone, PartialEq)]
pub struct HoverConfig {
    /// How often to look for the layer while it does not exist yet.
    pub poll_interval: Duration,
    /// Stop polling after this long. `None` polls until unbound.
    pub give_up_after: Option<Duration>,
    pub popup: PopupOptions,
}

impl Default for HoverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            give_up_after: None,
            popup: PopupOptions::default(),
        }
    }
}

struct Inner {
    target: Rc<dyn RenderTarget>,
    scheduler: Rc<dyn Scheduler>,
    layer_id: String,
    formatter: Formatter,
    config: HoverConfig,
    started_at: Time,
    popup: Cell<Option<PopupId>>,
    listeners: RefCell<Vec<ListenerId>>,
    poll: Cell<Option<TimerId>>,
    cancelled: Cell<bool>,
}

impl Inner {
    fn is_attached(&self) -> bool {
        !self.listeners.borrow().is_empty()
    }

    fn try_attach(self: &Rc<Self>) -> bool {
        match self.target.has_layer(&self.layer_id) {
            Ok(true) => {}
            Ok(false) | Err(_) => return false,
        }

        let weak = Rc::downgrade(self);
        let on_move = Rc::new(move |event: &PointerEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_move(event);
            }
        });
        let weak = Rc::downgrade(self);
        let on_leave = Rc::new(move |_: &PointerEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_leave();
            }
        });

        let target = &self.target;
        let Ok(move_id) = target.on_layer_pointer(&self.layer_id, PointerEventKind::Move, on_move)
        else {
            return false;
        };
        let Ok(leave_id) = target.on_layer_pointer(&self.layer_id, PointerEventKind::Leave, on_leave)
        else {
            if let Err(e) = target.off(move_id) {
                tracing::debug!(layer = %self.layer_id, %e, "move listener already gone");
            }
            return false;
        };

        *self.listeners.borrow_mut() = vec![move_id, leave_id];
        tracing::debug!(layer = %self.layer_id, "hover attached");
        true
    }

    fn schedule_poll(self: &Rc<Self>) {
        let weak: Weak<Inner> = Rc::downgrade(self);
        let id = self.scheduler.schedule(
            self.config.poll_interval,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.poll.set(None);
                if inner.cancelled.get() || inner.try_attach() {
                    return;
                }
                if let Some(limit) = inner.config.give_up_after {
                    let waited = inner
                        .scheduler
                        .now()
                        .saturating_duration_since(inner.started_at);
                    if waited >= limit {
                        tracing::warn!(layer = %inner.layer_id, "layer never appeared, hover not bound");
                        return;
                    }
                }
                inner.schedule_poll();
            }),
        );
        self.poll.set(Some(id));
    }

    fn handle_move(&self, event: &PointerEvent) {
        if self.cancelled.get() {
            return;
        }
        let Some(feature) = event.features.first() else {
            return;
        };
        let Some(popup) = self.popup.get() else {
            return;
        };
        self.target.set_cursor(Cursor::Pointer);
        let at = feature
            .geometry
            .representative_point()
            .unwrap_or(event.lng_lat);
        let html = (self.formatter)(&feature.properties);
        self.target.show_popup(popup, at, &html);
    }

    fn handle_leave(&self) {
        if self.cancelled.get() {
            return;
        }
        self.target.set_cursor(Cursor::Default);
        if let Some(popup) = self.popup.get() {
            self.target.hide_popup(popup);
        }
    }

    fn unbind(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        if let Some(id) = self.poll.take() {
            self.scheduler.cancel(id);
        }
        if let Some(popup) = self.popup.take() {
            self.target.remove_popup(popup);
        }
        for id in self.listeners.take() {
            if let Err(e) = self.target.off(id) {
                tracing::debug!(layer = %self.layer_id, %e, "hover listener already gone");
            }
        }
    }
}

/// A hover popup bound to one layer.
///
/// The layer may not exist yet when binding: the binder polls until it
/// does. Unbinding (explicitly or on drop) is idempotent and never fails.
pub struct HoverBinding {
    inner: Rc<Inner>,
}

impl HoverBinding {
    pub fn bind(
        target: Rc<dyn RenderTarget>,
        scheduler: Rc<dyn Scheduler>,
        layer_id: &str,
        formatter: impl Fn(&Properties) -> String + 'static,
        config: HoverConfig,
    ) -> Self {
        Self::bind_with(target, scheduler, layer_id, Rc::new(formatter), config)
    }

    /// Like [`HoverBinding::bind`], sharing an existing formatter.
    pub fn bind_with(
        target: Rc<dyn RenderTarget>,
        scheduler: Rc<dyn Scheduler>,
        layer_id: &str,
        formatter: Formatter,
        config: HoverConfig,
    ) -> Self {
        let popup = target.create_popup(&config.popup);
        let inner = Rc::new(Inner {
            started_at: scheduler.now(),
            target,
            scheduler,
            layer_id: layer_id.to_string(),
            formatter,
            config,
            popup: Cell::new(Some(popup)),
            listeners: RefCell::new(Vec::new()),
            poll: Cell::new(None),
            cancelled: Cell::new(false),
        });
        if !inner.try_attach() {
            tracing::debug!(layer = %inner.layer_id, "layer not present yet, polling");
            inner.schedule_poll();
        }
        Self { inner }
    }

    pub fn layer_id(&self) -> &str {
        &self.inner.layer_id
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.poll.get().is_some()
    }

    /// The popup this binding reuses, `None` once unbound.
    pub fn popup(&self) -> Option<PopupId> {
        self.inner.popup.get()
    }

    pub fn unbind(&self) {
        self.inner.unbind();
    }
}

impl Drop for HoverBinding {
    fn drop(&mut self) {
        self.inner.unbind();
    }
}

impl std::fmt::Debug for HoverBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoverBinding")
            .field("layer_id", &self.inner.layer_id)
            .field("attached", &self.is_attached())
            .field("polling", &self.is_polling())
            .finish()
    }
}

//! Window assignment and trigger engine.
//!
//! Records are buffered per fixed time slice of the event clock. Each
//! slice walks an Open -> PendingClose -> Closed state machine: the slice
//! boundary moves it to PendingClose, and the end of the allowed-lateness
//! grace (or an early trigger firing inside the grace) closes it for good.
//! Accumulation is discarding: every release drains the buffer, so a
//! record appears in at most one pane. Records arriving for a closed
//! slice are dropped and counted.
//!
//! Boundary and close deadlines are fixed when a window opens, floored at
//! the processing clock: a slice whose event-time deadlines already
//! passed (a replayed or delayed envelope) still gets the full lateness
//! grace of processing time instead of dropping everything as late.
//!
//! The engine is a plain state machine over caller-supplied clocks
//! (`now_ms` is unix milliseconds of the processing clock); the driver
//! owns the timers.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::model::FlatRecord;

/// Windowing and trigger policy.
///
/// `early_quantum` and `count_threshold` are independent early-release
/// triggers; `None`/absent disables them. `fire_on_first` releases a
/// single-record pane as soon as the first record lands in a fresh
/// window, for low-latency delivery.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub slice: Duration,
    pub early_quantum: Option<Duration>,
    pub count_threshold: Option<usize>,
    pub fire_on_first: bool,
    pub allowed_lateness: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            slice: Duration::from_secs(30),
            early_quantum: Some(Duration::from_secs(5)),
            count_threshold: None,
            fire_on_first: true,
            allowed_lateness: Duration::from_secs(10),
        }
    }
}

/// One released batch of records for a slice.
#[derive(Debug)]
pub struct Pane {
    /// Start of the owning slice, unix seconds.
    pub slice_start: i64,
    pub records: Vec<FlatRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceState {
    Open,
    PendingClose,
    Closed,
}

#[derive(Debug)]
struct SliceWindow {
    state: SliceState,
    buffer: Vec<FlatRecord>,
    /// When the currently buffering pane started, unix millis. Reset on
    /// every release so the processing-time quantum is measured per pane.
    pane_started_ms: Option<i64>,
    panes_fired: u32,
    /// Processing-clock deadline for the Open -> PendingClose transition.
    boundary_at_ms: i64,
    /// Processing-clock deadline for the final fire and close.
    close_at_ms: i64,
}

impl SliceWindow {
    fn new(boundary_at_ms: i64, close_at_ms: i64) -> Self {
        Self {
            state: SliceState::Open,
            buffer: Vec::new(),
            pane_started_ms: None,
            panes_fired: 0,
            boundary_at_ms,
            close_at_ms,
        }
    }
}

#[derive(Debug)]
pub struct WindowEngine {
    cfg: WindowConfig,
    windows: BTreeMap<i64, SliceWindow>,
    late_drops: u64,
}

impl WindowEngine {
    pub fn new(cfg: WindowConfig) -> Self {
        assert!(cfg.slice.as_secs() >= 1, "window slice must be at least 1s");
        Self {
            cfg,
            windows: BTreeMap::new(),
            late_drops: 0,
        }
    }

    fn slice_secs(&self) -> i64 {
        self.cfg.slice.as_secs() as i64
    }

    fn lateness_ms(&self) -> i64 {
        self.cfg.allowed_lateness.as_millis() as i64
    }

    /// Event-derived slice boundary, unix millis. Saturating: an absurd
    /// timestamp pins the deadline instead of overflowing.
    fn boundary_ms(&self, slice_start: i64) -> i64 {
        slice_start
            .saturating_add(self.slice_secs())
            .saturating_mul(1000)
    }

    /// Event-derived close deadline, unix millis: boundary plus lateness.
    fn close_ms(&self, slice_start: i64) -> i64 {
        self.boundary_ms(slice_start).saturating_add(self.lateness_ms())
    }

    /// Buffers one record into its slice window and returns any panes
    /// released by the insert. Records for an already-closed slice are
    /// dropped and counted.
    pub fn insert(&mut self, record: FlatRecord, event_ts: i64, now_ms: i64) -> Vec<Pane> {
        let slice_start = event_ts
            .div_euclid(self.slice_secs())
            .saturating_mul(self.slice_secs());

        let already_closed = self
            .windows
            .get(&slice_start)
            .is_some_and(|w| w.state == SliceState::Closed);
        if already_closed {
            self.late_drops += 1;
            trace!(slice_start, "Dropped late record for closed window");
            return self.poll(now_ms);
        }

        // Deadlines anchor at open: a window whose event-time deadlines
        // already passed runs on processing time from here.
        let boundary_at = self.boundary_ms(slice_start).max(now_ms);
        let close_at = self
            .close_ms(slice_start)
            .max(now_ms.saturating_add(self.lateness_ms()));
        let win = self
            .windows
            .entry(slice_start)
            .or_insert_with(|| SliceWindow::new(boundary_at, close_at));
        if win.buffer.is_empty() {
            win.pane_started_ms = Some(now_ms);
        }
        win.buffer.push(record);

        let fire = (self.cfg.fire_on_first
            && self.windows[&slice_start].panes_fired == 0
            && self.windows[&slice_start].buffer.len() == 1)
            || self
                .cfg
                .count_threshold
                .is_some_and(|n| self.windows[&slice_start].buffer.len() >= n);

        let mut panes = Vec::new();
        if fire {
            panes.extend(self.release(slice_start, now_ms));
            // A trigger met inside the lateness grace closes the window
            // outright.
            let win = self.windows.get_mut(&slice_start).expect("window exists");
            if win.state == SliceState::PendingClose {
                win.state = SliceState::Closed;
                debug!(slice_start, "Window closed by early trigger in grace");
            }
        }
        panes.extend(self.poll(now_ms));
        panes
    }

    /// Advances window state for the given processing time and returns
    /// every pane that is due: quantum-triggered releases, boundary
    /// transitions to PendingClose, and final fires at close.
    pub fn poll(&mut self, now_ms: i64) -> Vec<Pane> {
        let keys: Vec<i64> = self.windows.keys().copied().collect();
        let mut panes = Vec::new();

        for slice_start in keys {
            let win = self.windows.get_mut(&slice_start).expect("window exists");
            let boundary = win.boundary_at_ms;
            let close = win.close_at_ms;

            if win.state == SliceState::Open && now_ms >= boundary {
                win.state = SliceState::PendingClose;
            }

            let quantum_due = self.cfg.early_quantum.is_some_and(|q| {
                win.pane_started_ms
                    .is_some_and(|start| now_ms - start >= q.as_millis() as i64)
            }) && !win.buffer.is_empty();

            match win.state {
                SliceState::Open if quantum_due => {
                    panes.extend(self.release(slice_start, now_ms));
                }
                SliceState::PendingClose if now_ms >= close || quantum_due => {
                    // Final pane; inside the grace an early trigger also
                    // closes the window outright.
                    panes.extend(self.release(slice_start, now_ms));
                    let win = self.windows.get_mut(&slice_start).expect("window exists");
                    win.state = SliceState::Closed;
                    debug!(slice_start, panes_fired = win.panes_fired, "Window closed");
                }
                _ => {}
            }
        }

        self.gc(now_ms);
        panes
    }

    /// Releases the buffered records of one slice as a pane and clears
    /// the buffer (discarding accumulation). Empty buffers release nothing.
    fn release(&mut self, slice_start: i64, _now_ms: i64) -> Option<Pane> {
        let win = self.windows.get_mut(&slice_start)?;
        if win.buffer.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut win.buffer);
        win.pane_started_ms = None;
        win.panes_fired += 1;
        trace!(
            slice_start,
            records = records.len(),
            pane = win.panes_fired,
            "Pane released"
        );
        Some(Pane {
            slice_start,
            records,
        })
    }

    /// Flushes every non-empty buffer and closes all windows. Used on
    /// graceful shutdown when the pipeline is configured to flush.
    pub fn drain(&mut self) -> Vec<Pane> {
        let keys: Vec<i64> = self.windows.keys().copied().collect();
        let mut panes = Vec::new();
        for slice_start in keys {
            if let Some(pane) = self.release(slice_start, 0) {
                panes.push(pane);
            }
            if let Some(win) = self.windows.get_mut(&slice_start) {
                win.state = SliceState::Closed;
            }
        }
        panes
    }

    /// Count of records dropped because their window was already closed.
    pub fn late_drops(&self) -> u64 {
        self.late_drops
    }

    pub fn open_windows(&self) -> usize {
        self.windows
            .values()
            .filter(|w| w.state != SliceState::Closed)
            .count()
    }

    /// Closed windows are only kept long enough to absorb stragglers; a
    /// record older than the retention horizon reopens a fresh
    /// processing-anchored window instead of dropping.
    fn gc(&mut self, now_ms: i64) {
        let horizon = self.slice_secs().saturating_mul(1000).saturating_mul(10);
        self.windows.retain(|_, win| {
            win.state != SliceState::Closed
                || now_ms.saturating_sub(win.close_at_ms) < horizon
        });
    }
}

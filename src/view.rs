use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::{dead_interval, proto};

/// The authoritative role assignment handed out by the view service.
///
/// The empty string stands for an unfilled role. `viewnum` never
/// decreases, and viewnum 0 is the reserved initial view with both
/// roles empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    pub viewnum: u64,
    pub primary: String,
    pub backup: String,
}

impl View {
    pub fn has_primary(&self) -> bool {
        !self.primary.is_empty()
    }

    pub fn has_backup(&self) -> bool {
        !self.backup.is_empty()
    }

    pub fn is_primary(&self, id: &str) -> bool {
        self.has_primary() && self.primary == id
    }

    pub fn is_backup(&self, id: &str) -> bool {
        self.has_backup() && self.backup == id
    }
}

impl From<proto::View> for View {
    fn from(view: proto::View) -> Self {
        View {
            viewnum: view.viewnum,
            primary: view.primary,
            backup: view.backup,
        }
    }
}

impl From<View> for proto::View {
    fn from(view: View) -> Self {
        proto::View {
            viewnum: view.viewnum,
            primary: view.primary,
            backup: view.backup,
        }
    }
}

/// The view manager itself: a state machine fed by server heartbeats
/// and a periodic tick, with the clock injected so every transition can
/// be driven deterministically.
///
/// A view advances only once the primary of the current view has pinged
/// with the current viewnum (`acked`). Promotion additionally requires
/// the backup to have confirmed receipt of the primary's state
/// (`backup_ready`), which a backup signals by advertising the current
/// viewnum in its pings.
pub struct ViewTracker {
    /// Most recent ping arrival for every server ever heard from.
    last_ping: HashMap<String, Instant>,
    view: View,
    /// Live servers holding no role, FIFO by first observation.
    idle: VecDeque<String>,
    acked: bool,
    primary_alive: bool,
    backup_ready: bool,
}

impl ViewTracker {
    pub fn new() -> Self {
        ViewTracker {
            last_ping: HashMap::new(),
            view: View::default(),
            idle: VecDeque::new(),
            acked: false,
            primary_alive: true,
            backup_ready: false,
        }
    }

    pub fn view(&self) -> View {
        self.view.clone()
    }

    /// Register a heartbeat from `sender` carrying the viewnum it
    /// currently holds, and reply with the current view.
    pub fn ping(&mut self, sender: &str, viewnum: u64, now: Instant) -> View {
        self.last_ping.insert(sender.to_owned(), now);

        if self.view.viewnum == 0 {
            // First ping ever: the sender becomes primary of view 1.
            self.view = View {
                viewnum: 1,
                primary: sender.to_owned(),
                backup: String::new(),
            };
            self.acked = false;
            self.primary_alive = true;
            self.backup_ready = false;
        } else if self.view.is_primary(sender) {
            if viewnum == 0 {
                // The primary restarted: treat it as dead so a ready
                // backup can take over at the next tick.
                self.primary_alive = false;
            } else {
                self.acked = viewnum == self.view.viewnum;
            }
        } else if self.view.is_backup(sender) {
            self.backup_ready = viewnum == self.view.viewnum;
        } else if !self.idle.iter().any(|s| s == sender) {
            self.idle.push_back(sender.to_owned());
        }

        self.view.clone()
    }

    /// Called once per ping interval: notice dead servers and advance
    /// the view if it is safe to do so.
    pub fn tick(&mut self, now: Instant) {
        if self.view.has_primary() && self.dead(&self.view.primary, now) {
            self.primary_alive = false;
        }
        if self.view.has_backup() && self.dead(&self.view.backup, now) {
            // Dropping an unreachable backup assigns no new role, so it
            // happens outside the ack gate.
            self.view.backup.clear();
            self.backup_ready = false;
        }
        let last_ping = &self.last_ping;
        self.idle
            .retain(|s| last_ping.get(s).map_or(false, |t| now.duration_since(*t) <= dead_interval()));
        self.advance();
    }

    fn dead(&self, id: &str, now: Instant) -> bool {
        self.last_ping
            .get(id)
            .map_or(true, |t| now.duration_since(*t) > dead_interval())
    }

    fn advance(&mut self) {
        if !self.acked {
            return;
        }
        let prev = self.view.viewnum;

        // Promote the backup if the primary is gone. A dead primary
        // with no ready backup is kept: replacing it would hand the
        // store to a server that may be missing acknowledged writes.
        if !self.primary_alive && self.view.has_backup() && self.backup_ready {
            self.view.primary = std::mem::take(&mut self.view.backup);
            self.primary_alive = true;
            self.backup_ready = false;
            self.view.viewnum = prev + 1;
        }

        // Fill an empty backup slot from the idle queue.
        if !self.view.has_backup() {
            if let Some(next) = self.idle.pop_front() {
                self.view.backup = next;
                self.view.viewnum = prev + 1;
            }
        }

        // The new view needs a fresh ack from its primary before it can
        // move again.
        self.acked = self.view.viewnum == prev;
    }
}

impl Default for ViewTracker {
    fn default() -> Self {
        Self::new()
    }
}

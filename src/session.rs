use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    log_line, Caller, CommandSpec, Target, Tier, TimeoutController, Transport, MENU_GLYPHS,
};

/// How many times stray reactions may restart one menu's expiry window.
const MAX_REARMS: u32 = 3;

/// One live menu. Keyed in the table by its target's name, so a target can
/// have at most one open menu at a time no matter who triggered it or where.
#[derive(Clone)]
pub(crate) struct Session {
    pub(crate) target: Arc<Target>,
    pub(crate) channel_id: u64,
    pub(crate) message_id: u64,
    /// Menu snapshot in display order; index N belongs to glyph N.
    pub(crate) commands: Vec<Arc<CommandSpec>>,
    /// Unique per armed window; expiry timers compare against it. A stale
    /// timer never matches, not even against a reopened menu for the same
    /// target.
    pub(crate) generation: u64,
    /// Window restarts spent so far, bounded by [`MAX_REARMS`].
    pub(crate) rearms: u32,
}

#[derive(Debug)]
pub(crate) enum OpenOutcome {
    Opened { message_id: u64 },
    /// A menu for this target already exists somewhere.
    AlreadyOpen { channel_id: u64, message_id: u64 },
    /// The caller's tier has no operations on this target.
    NoCommands,
}

pub(crate) enum SelectOutcome {
    /// Not a live menu, not a menu glyph, or the caller is not authorized.
    Ignored,
    Selected {
        target: Arc<Target>,
        channel_id: u64,
        message_id: u64,
        command: Arc<CommandSpec>,
    },
}

pub(crate) struct SessionManager {
    table: Arc<Mutex<HashMap<String, Session>>>,
    timeouts: TimeoutController,
    transport: Arc<dyn Transport>,
    menu_window: Duration,
    /// Source of generation tokens, shared by every session.
    generations: AtomicU64,
}

impl SessionManager {
    pub(crate) fn new(transport: Arc<dyn Transport>, menu_window: Duration) -> Self {
        let table: Arc<Mutex<HashMap<String, Session>>> = Arc::new(Mutex::new(HashMap::new()));
        let timeouts = TimeoutController::new(Arc::clone(&table), Arc::clone(&transport));
        SessionManager {
            table,
            timeouts,
            transport,
            menu_window,
            generations: AtomicU64::new(0),
        }
    }

    /// Opens a menu for `target` scoped to the caller's tier: posts the
    /// numbered embed, attaches one glyph per entry and arms the expiry
    /// timer. Deduplication happens first, before anything is sent.
    pub(crate) fn open(
        &self,
        target: &Arc<Target>,
        tier: Tier,
        channel_id: u64,
    ) -> Result<OpenOutcome, String> {
        {
            let table = self.table.lock().unwrap();
            if let Some(existing) = table.get(&target.name) {
                return Ok(OpenOutcome::AlreadyOpen {
                    channel_id: existing.channel_id,
                    message_id: existing.message_id,
                });
            }
        }

        let mut commands = target.authorized(tier);
        if commands.is_empty() {
            return Ok(OpenOutcome::NoCommands);
        }
        if commands.len() > MENU_GLYPHS.len() {
            log_line(
                "session",
                &format!(
                    "target {} offers {} commands for {tier}, truncating the menu to {}",
                    target.name,
                    commands.len(),
                    MENU_GLYPHS.len()
                ),
            );
            commands.truncate(MENU_GLYPHS.len());
        }

        let mut description = String::new();
        for (idx, command) in commands.iter().enumerate() {
            description.push_str(&format!("`{}.` {}\n", idx + 1, command.name));
        }

        let message_id = self
            .transport
            .send_embed(channel_id, &target.name, &description, None)
            .map_err(|err| format!("failed to post menu for {}: {err}", target.name))?;

        for idx in 0..commands.len() {
            if let Err(err) = self
                .transport
                .add_reaction(channel_id, message_id, MENU_GLYPHS[idx])
            {
                log_line(
                    "session",
                    &format!("failed to attach glyph {} to menu: {err}", idx + 1),
                );
            }
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let session = Session {
            target: Arc::clone(target),
            channel_id,
            message_id,
            commands,
            generation,
            rearms: 0,
        };
        self.table
            .lock()
            .unwrap()
            .insert(target.name.clone(), session);
        self.timeouts
            .arm(target.name.clone(), generation, self.menu_window);

        Ok(OpenOutcome::Opened { message_id })
    }

    /// Restarts the expiry window of a live menu, at most [`MAX_REARMS`]
    /// times per session so nobody can keep a menu alive forever. The old
    /// timer keeps sleeping but finds a newer generation when it wakes.
    /// Returns whether the window was restarted.
    pub(crate) fn rearm(&self, target_name: &str) -> bool {
        let mut table = self.table.lock().unwrap();
        if let Some(session) = table.get_mut(target_name) {
            if session.rearms >= MAX_REARMS {
                return false;
            }
            session.rearms += 1;
            session.generation = self.generations.fetch_add(1, Ordering::SeqCst);
            let generation = session.generation;
            drop(table);
            self.timeouts
                .arm(target_name.to_string(), generation, self.menu_window);
            return true;
        }
        false
    }

    /// Resolves a glyph reaction on a menu message into an operation.
    ///
    /// Authorization is re-checked against the selector's own tier, not the
    /// tier that opened the menu; an unauthorized pick is silently ignored
    /// and the menu stays live. A successful pick removes the session, which
    /// also neutralizes its pending timer.
    pub(crate) fn select(&self, message_id: u64, glyph: &str, caller: &Caller) -> SelectOutcome {
        let Some(index) = super::glyph_index(glyph) else {
            return SelectOutcome::Ignored;
        };

        let mut table = self.table.lock().unwrap();
        let Some(target_name) = table
            .values()
            .find(|session| session.message_id == message_id)
            .map(|session| session.target.name.clone())
        else {
            return SelectOutcome::Ignored;
        };

        let session = &table[&target_name];
        let Some(command) = session.commands.get(index).cloned() else {
            return SelectOutcome::Ignored;
        };

        let allowed = session.target.authorized(caller.tier);
        if !allowed.iter().any(|cmd| Arc::ptr_eq(cmd, &command)) {
            return SelectOutcome::Ignored;
        }

        let Some(session) = table.remove(&target_name) else {
            return SelectOutcome::Ignored;
        };
        SelectOutcome::Selected {
            target: session.target,
            channel_id: session.channel_id,
            message_id: session.message_id,
            command,
        }
    }

    /// Rearms the menu holding `message_id`, if any. Used when a reaction
    /// lands on a live menu without selecting anything; the wait window
    /// restarts (up to the rearm cap) instead of running out
    /// mid-interaction.
    pub(crate) fn rearm_for_message(&self, message_id: u64) {
        let name = {
            let table = self.table.lock().unwrap();
            table
                .values()
                .find(|session| session.message_id == message_id)
                .map(|session| session.target.name.clone())
        };
        if let Some(name) = name {
            self.rearm(&name);
        }
    }

    /// The menu message was deleted out from under us; just forget it.
    pub(crate) fn close_on_delete(&self, message_id: u64) {
        let mut table = self.table.lock().unwrap();
        table.retain(|_, session| session.message_id != message_id);
    }

    /// A human withdrew a reaction from a live menu before the timer fired.
    /// The menu closes immediately without executing anything.
    pub(crate) fn close_on_withdrawn(&self, message_id: u64) {
        let removed = {
            let mut table = self.table.lock().unwrap();
            let key = table
                .iter()
                .find(|(_, session)| session.message_id == message_id)
                .map(|(name, _)| name.clone());
            key.and_then(|name| table.remove(&name))
        };
        if let Some(session) = removed {
            let _ = self
                .transport
                .clear_reactions(session.channel_id, session.message_id);
        }
    }

    pub(crate) fn is_open(&self, target_name: &str) -> bool {
        self.table.lock().unwrap().contains_key(target_name)
    }

    pub(crate) fn holds_message(&self, message_id: u64) -> bool {
        self.table
            .lock()
            .unwrap()
            .values()
            .any(|session| session.message_id == message_id)
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{log_line, Session, Transport, TransportError};

/// Arms menu expiry timers against the shared session table.
///
/// A timer is a plain thread that sleeps for the window and then compares
/// the generation it captured at arm time against the live session's. Any
/// later rearm or cancellation bumps the generation (or drops the entry),
/// which turns the stale wakeup into a no-op. No timer handle is ever
/// joined or tracked.
pub(crate) struct TimeoutController {
    table: Arc<Mutex<HashMap<String, Session>>>,
    transport: Arc<dyn Transport>,
}

impl TimeoutController {
    pub(crate) fn new(
        table: Arc<Mutex<HashMap<String, Session>>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        TimeoutController { table, transport }
    }

    pub(crate) fn arm(&self, target_name: String, generation: u64, window: Duration) {
        let table = Arc::clone(&self.table);
        let transport = Arc::clone(&self.transport);
        thread::spawn(move || {
            thread::sleep(window);

            let expired = {
                let mut table = table.lock().unwrap();
                match table.get(&target_name) {
                    Some(session) if session.generation == generation => {
                        table.remove(&target_name)
                    }
                    _ => None,
                }
            };

            // The menu stays visible after expiry; only the reaction
            // affordance is withdrawn.
            if let Some(session) = expired {
                match transport.clear_reactions(session.channel_id, session.message_id) {
                    Ok(()) | Err(TransportError::Forbidden) | Err(TransportError::NotFound) => {}
                    Err(err) => log_line(
                        "session",
                        &format!("failed to clear reactions on expired menu: {err}"),
                    ),
                }
            }
        });
    }
}

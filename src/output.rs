use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{log_line, Transport};

/// Streams at or above this many characters go out as a file attachment
/// instead of an inline code block.
pub(crate) const INLINE_OUTPUT_LIMIT: usize = 3800;

/// How long a delivered output message stays visible before the bot deletes
/// it again.
pub(crate) const OUTPUT_LIFETIME: Duration = Duration::from_secs(300);

/// Delivers captured subprocess streams to a channel.
///
/// Small bodies are posted inline inside a fenced code block; anything at
/// the threshold or above is spilled to a temp file under `tmp_dir`, sent
/// as an attachment and the file removed right away, delivered or not. The
/// posted message itself is short-lived either way.
pub(crate) struct OutputRouter {
    transport: Arc<dyn Transport>,
    tmp_dir: PathBuf,
    lifetime: Duration,
}

impl OutputRouter {
    pub(crate) fn new(transport: Arc<dyn Transport>, tmp_dir: PathBuf) -> Self {
        OutputRouter {
            transport,
            tmp_dir,
            lifetime: OUTPUT_LIFETIME,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Routes one captured stream. `key` disambiguates temp file names; the
    /// session message id serves well. Empty bodies produce no message at
    /// all. Delivery failures are logged and absorbed.
    pub(crate) fn deliver(&self, channel_id: u64, label: &str, body: &str, key: u64) {
        if body.trim().is_empty() {
            return;
        }

        let sent = if body.chars().count() < INLINE_OUTPUT_LIMIT {
            self.transport
                .send_text(channel_id, &format!("{label}:\n```bash\n{body}```"))
        } else {
            if let Err(err) = fs::create_dir_all(&self.tmp_dir) {
                log_line("output", &format!("cannot create temp dir: {err}"));
                return;
            }
            let path = self.tmp_dir.join(key.to_string());
            if let Err(err) = fs::write(&path, body) {
                log_line("output", &format!("cannot spool output to {}: {err}", path.display()));
                return;
            }
            let sent = self.transport.send_file(channel_id, &path, label);
            if let Err(err) = fs::remove_file(&path) {
                log_line("output", &format!("cannot remove {}: {err}", path.display()));
            }
            sent
        };

        match sent {
            Ok(message_id) => self.schedule_delete(channel_id, message_id),
            Err(err) => log_line("output", &format!("failed to deliver {label}: {err}")),
        }
    }

    fn schedule_delete(&self, channel_id: u64, message_id: u64) {
        let transport = Arc::clone(&self.transport);
        let lifetime = self.lifetime;
        thread::spawn(move || {
            thread::sleep(lifetime);
            if let Err(err) = transport.delete_message(channel_id, message_id) {
                log_line("output", &format!("failed to expire output message: {err}"));
            }
        });
    }
}

pub(crate) mod discord;
pub(crate) mod gateway;

pub(crate) use discord::DiscordRest;
pub(crate) use gateway::spawn_gateway_listener;

use std::path::Path;

/// Menu glyph alphabet, index 0 maps to the first menu entry. Menus never
/// show more entries than there are glyphs.
pub(crate) const MENU_GLYPHS: [&str; 9] =
    ["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣"];

pub(crate) fn glyph_index(glyph: &str) -> Option<usize> {
    MENU_GLYPHS.iter().position(|g| *g == glyph)
}

#[derive(Debug)]
pub(crate) enum TransportError {
    /// The platform refused the action for permission reasons.
    Forbidden,
    /// The addressed message or channel no longer exists.
    NotFound,
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Forbidden => f.write_str("forbidden"),
            TransportError::NotFound => f.write_str("not found"),
            TransportError::Other(reason) => f.write_str(reason),
        }
    }
}

/// Everything the session engine needs from the chat platform. The engine
/// only ever talks to this trait; the REST client and the test double both
/// implement it.
pub(crate) trait Transport: Send + Sync {
    /// Whether the bot may both send and manage messages in the channel.
    fn channel_usable(&self, channel_id: u64) -> Result<bool, TransportError>;

    /// Sends plain text, returning the new message id.
    fn send_text(&self, channel_id: u64, content: &str) -> Result<u64, TransportError>;

    /// Sends an embed, returning the new message id.
    fn send_embed(
        &self,
        channel_id: u64,
        title: &str,
        description: &str,
        footer: Option<&str>,
    ) -> Result<u64, TransportError>;

    /// Replaces the embed on an existing message.
    fn edit_embed(
        &self,
        channel_id: u64,
        message_id: u64,
        title: &str,
        description: &str,
        footer: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Uploads a local file as an attachment, returning the new message id.
    fn send_file(&self, channel_id: u64, path: &Path, label: &str)
        -> Result<u64, TransportError>;

    fn add_reaction(&self, channel_id: u64, message_id: u64, glyph: &str)
        -> Result<(), TransportError>;

    fn clear_reactions(&self, channel_id: u64, message_id: u64) -> Result<(), TransportError>;

    fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), TransportError>;
}

/// One decoded gateway event, handed from the socket listener thread to the
/// main loop over an mpsc channel.
#[derive(Debug, Clone)]
pub(crate) enum TransportEvent {
    MessageCreated {
        channel_id: u64,
        message_id: u64,
        guild_id: Option<u64>,
        author_id: u64,
        author_name: String,
        author_is_bot: bool,
        content: String,
        author_roles: Vec<u64>,
    },
    ReactionAdded {
        channel_id: u64,
        message_id: u64,
        author_id: u64,
        author_name: String,
        author_is_bot: bool,
        glyph: String,
        author_roles: Vec<u64>,
    },
    ReactionRemoved {
        message_id: u64,
        author_is_bot: bool,
    },
    MessageDeleted {
        message_id: u64,
    },
    /// The socket closed or asked for a reconnect; the payload is the reason.
    Disconnected(String),
}

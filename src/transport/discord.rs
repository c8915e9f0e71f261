use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use super::{Transport, TransportError};
use crate::log_line;

const API_BASE: &str = "https://discord.com/api/v10";
const HTTP_TIMEOUT_SECS: u64 = 30;

const PERM_ADMINISTRATOR: u64 = 1 << 3;
const PERM_SEND_MESSAGES: u64 = 1 << 11;
const PERM_MANAGE_MESSAGES: u64 = 1 << 13;

/// Discord REST client. JSON endpoints go through a shared ureq agent;
/// attachments go through a blocking reqwest client because they need
/// multipart bodies.
pub(crate) struct DiscordRest {
    agent: ureq::Agent,
    upload: reqwest::blocking::Client,
    auth: String,
    embed_colour: u32,
    /// Filled from settings or fetched from the application endpoint the
    /// first time a permission failure needs reporting.
    owner_id: Mutex<Option<u64>>,
    /// The bot's own user id, fetched lazily for permission checks.
    self_id: Mutex<Option<u64>>,
}

fn map_ureq_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Status(403, _) => TransportError::Forbidden,
        ureq::Error::Status(404, _) => TransportError::NotFound,
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            TransportError::Other(format!("HTTP {code}: {body}"))
        }
        other => TransportError::Other(other.to_string()),
    }
}

/// Ids and permission bitfields arrive as strings or integers depending on
/// the endpoint.
fn u64_field(value: Option<&serde_json::Value>) -> Option<u64> {
    match value? {
        serde_json::Value::String(s) => s.parse::<u64>().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Computes the bot's effective permission bits in one channel: the union of
/// its role permissions with the channel overwrites applied in Discord's
/// order (everyone, roles, member). Administrator short-circuits everything.
pub(crate) fn effective_permissions(
    guild_id: u64,
    member_id: u64,
    member_roles: &[u64],
    guild_roles: &serde_json::Value,
    overwrites: &serde_json::Value,
) -> u64 {
    let empty = Vec::new();

    let mut base = 0u64;
    for role in guild_roles.as_array().unwrap_or(&empty) {
        let Some(id) = u64_field(role.get("id")) else {
            continue;
        };
        if id == guild_id || member_roles.contains(&id) {
            base |= u64_field(role.get("permissions")).unwrap_or(0);
        }
    }
    if base & PERM_ADMINISTRATOR != 0 {
        return u64::MAX;
    }

    let mut everyone_allow = 0u64;
    let mut everyone_deny = 0u64;
    let mut role_allow = 0u64;
    let mut role_deny = 0u64;
    let mut member_allow = 0u64;
    let mut member_deny = 0u64;
    for overwrite in overwrites.as_array().unwrap_or(&empty) {
        let Some(id) = u64_field(overwrite.get("id")) else {
            continue;
        };
        let kind = u64_field(overwrite.get("type")).unwrap_or(0);
        let allow = u64_field(overwrite.get("allow")).unwrap_or(0);
        let deny = u64_field(overwrite.get("deny")).unwrap_or(0);
        if kind == 0 && id == guild_id {
            everyone_allow |= allow;
            everyone_deny |= deny;
        } else if kind == 0 && member_roles.contains(&id) {
            role_allow |= allow;
            role_deny |= deny;
        } else if kind == 1 && id == member_id {
            member_allow |= allow;
            member_deny |= deny;
        }
    }
    base = (base & !everyone_deny) | everyone_allow;
    base = (base & !role_deny) | role_allow;
    (base & !member_deny) | member_allow
}

fn message_id_from(value: &serde_json::Value) -> Result<u64, TransportError> {
    value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .and_then(|id| id.parse::<u64>().ok())
        .ok_or_else(|| TransportError::Other("response carried no message id".to_string()))
}

pub(crate) fn embed_payload(
    colour: u32,
    title: &str,
    description: &str,
    footer: Option<&str>,
) -> serde_json::Value {
    let mut embed = json!({
        "title": title,
        "description": description,
        "color": colour,
    });
    if let Some(text) = footer {
        embed["footer"] = json!({ "text": text });
    }
    json!({ "embeds": [embed] })
}

impl DiscordRest {
    pub(crate) fn new(token: &str, embed_colour: u32, owner_id: Option<u64>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build();
        let upload = reqwest::blocking::Client::new();
        DiscordRest {
            agent,
            upload,
            auth: format!("Bot {token}"),
            embed_colour,
            owner_id: Mutex::new(owner_id),
            self_id: Mutex::new(None),
        }
    }

    fn get_json(&self, path: &str) -> Result<serde_json::Value, TransportError> {
        self.agent
            .get(&format!("{API_BASE}{path}"))
            .set("Authorization", &self.auth)
            .call()
            .map_err(map_ureq_error)?
            .into_json()
            .map_err(|err| TransportError::Other(err.to_string()))
    }

    fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        self.agent
            .post(&format!("{API_BASE}{path}"))
            .set("Authorization", &self.auth)
            .send_json(payload.clone())
            .map_err(map_ureq_error)?
            .into_json()
            .map_err(|err| TransportError::Other(err.to_string()))
    }

    fn patch_json(&self, path: &str, payload: &serde_json::Value) -> Result<(), TransportError> {
        self.agent
            .request("PATCH", &format!("{API_BASE}{path}"))
            .set("Authorization", &self.auth)
            .send_json(payload.clone())
            .map(|_| ())
            .map_err(map_ureq_error)
    }

    fn put_empty(&self, path: &str) -> Result<(), TransportError> {
        self.agent
            .put(&format!("{API_BASE}{path}"))
            .set("Authorization", &self.auth)
            .send_string("")
            .map(|_| ())
            .map_err(map_ureq_error)
    }

    fn delete(&self, path: &str) -> Result<(), TransportError> {
        self.agent
            .delete(&format!("{API_BASE}{path}"))
            .set("Authorization", &self.auth)
            .call()
            .map(|_| ())
            .map_err(map_ureq_error)
    }

    fn resolve_self(&self) -> Result<u64, TransportError> {
        {
            let cached = self.self_id.lock().unwrap();
            if let Some(id) = *cached {
                return Ok(id);
            }
        }
        let me = self.get_json("/users/@me")?;
        let id = u64_field(me.get("id"))
            .ok_or_else(|| TransportError::Other("no user id on /users/@me".to_string()))?;
        *self.self_id.lock().unwrap() = Some(id);
        Ok(id)
    }

    fn resolve_owner(&self) -> Option<u64> {
        {
            let cached = self.owner_id.lock().unwrap();
            if cached.is_some() {
                return *cached;
            }
        }
        let owner = self
            .get_json("/oauth2/applications/@me")
            .ok()?
            .pointer("/owner/id")?
            .as_str()?
            .parse::<u64>()
            .ok()?;
        *self.owner_id.lock().unwrap() = Some(owner);
        Some(owner)
    }

    /// Best-effort DM to the application owner when a channel refuses us.
    /// Failures here are swallowed; there is nobody left to tell.
    fn notify_owner(&self, channel_id: u64) {
        let Some(owner) = self.resolve_owner() else {
            return;
        };
        let dm = match self.post_json(
            "/users/@me/channels",
            &json!({ "recipient_id": owner.to_string() }),
        ) {
            Ok(dm) => dm,
            Err(err) => {
                log_line("discord", &format!("cannot open owner DM: {err}"));
                return;
            }
        };
        let Ok(dm_channel) = message_id_from(&dm) else {
            return;
        };
        let notice = format!(
            "I am unable to send messages in channel {channel_id}. \
             Without the proper permissions I'm unable to function properly!"
        );
        let _ = self.post_json(
            &format!("/channels/{dm_channel}/messages"),
            &json!({ "content": notice }),
        );
    }

    fn forbidden_hook(&self, channel_id: u64, err: TransportError) -> TransportError {
        if matches!(err, TransportError::Forbidden) {
            self.notify_owner(channel_id);
        }
        err
    }
}

impl Transport for DiscordRest {
    fn channel_usable(&self, channel_id: u64) -> Result<bool, TransportError> {
        let channel = self.get_json(&format!("/channels/{channel_id}"))?;
        let Some(guild_id) = u64_field(channel.get("guild_id")) else {
            // DM channels have no overwrites.
            return Ok(true);
        };
        let self_id = self.resolve_self()?;
        let member = self.get_json(&format!("/guilds/{guild_id}/members/{self_id}"))?;
        let member_roles: Vec<u64> = member
            .get("roles")
            .and_then(serde_json::Value::as_array)
            .map(|roles| roles.iter().filter_map(|role| u64_field(Some(role))).collect())
            .unwrap_or_default();
        let guild_roles = self.get_json(&format!("/guilds/{guild_id}/roles"))?;
        let overwrites = channel
            .get("permission_overwrites")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let perms =
            effective_permissions(guild_id, self_id, &member_roles, &guild_roles, &overwrites);
        let needed = PERM_SEND_MESSAGES | PERM_MANAGE_MESSAGES;
        let usable = perms & needed == needed;
        if !usable {
            self.notify_owner(channel_id);
        }
        Ok(usable)
    }

    fn send_text(&self, channel_id: u64, content: &str) -> Result<u64, TransportError> {
        let response = self
            .post_json(
                &format!("/channels/{channel_id}/messages"),
                &json!({ "content": content }),
            )
            .map_err(|err| self.forbidden_hook(channel_id, err))?;
        message_id_from(&response)
    }

    fn send_embed(
        &self,
        channel_id: u64,
        title: &str,
        description: &str,
        footer: Option<&str>,
    ) -> Result<u64, TransportError> {
        let payload = embed_payload(self.embed_colour, title, description, footer);
        let response = self
            .post_json(&format!("/channels/{channel_id}/messages"), &payload)
            .map_err(|err| self.forbidden_hook(channel_id, err))?;
        message_id_from(&response)
    }

    fn edit_embed(
        &self,
        channel_id: u64,
        message_id: u64,
        title: &str,
        description: &str,
        footer: Option<&str>,
    ) -> Result<(), TransportError> {
        let payload = embed_payload(self.embed_colour, title, description, footer);
        self.patch_json(
            &format!("/channels/{channel_id}/messages/{message_id}"),
            &payload,
        )
        .map_err(|err| self.forbidden_hook(channel_id, err))
    }

    fn send_file(
        &self,
        channel_id: u64,
        path: &Path,
        label: &str,
    ) -> Result<u64, TransportError> {
        let bytes =
            std::fs::read(path).map_err(|err| TransportError::Other(err.to_string()))?;
        let part = reqwest::blocking::multipart::Part::bytes(bytes)
            .file_name(label.to_string())
            .mime_str("text/plain")
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .text(
                "payload_json",
                json!({ "attachments": [{ "id": 0, "filename": label }] }).to_string(),
            )
            .part("files[0]", part);

        let response = self
            .upload
            .post(format!("{API_BASE}/channels/{channel_id}/messages"))
            .header("Authorization", &self.auth)
            .multipart(form)
            .send()
            .map_err(|err| TransportError::Other(err.to_string()))?;

        match response.status().as_u16() {
            403 => Err(self.forbidden_hook(channel_id, TransportError::Forbidden)),
            404 => Err(TransportError::NotFound),
            code if !(200..300).contains(&code) => Err(TransportError::Other(format!(
                "HTTP {code}: {}",
                response.text().unwrap_or_default()
            ))),
            _ => {
                let value: serde_json::Value = response
                    .json()
                    .map_err(|err| TransportError::Other(err.to_string()))?;
                message_id_from(&value)
            }
        }
    }

    fn add_reaction(
        &self,
        channel_id: u64,
        message_id: u64,
        glyph: &str,
    ) -> Result<(), TransportError> {
        let encoded = urlencoding::encode(glyph);
        self.put_empty(&format!(
            "/channels/{channel_id}/messages/{message_id}/reactions/{encoded}/@me"
        ))
    }

    fn clear_reactions(&self, channel_id: u64, message_id: u64) -> Result<(), TransportError> {
        self.delete(&format!(
            "/channels/{channel_id}/messages/{message_id}/reactions"
        ))
    }

    fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), TransportError> {
        self.delete(&format!("/channels/{channel_id}/messages/{message_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_payload_includes_footer_only_when_present() {
        let with = embed_payload(0xffffff, "csgo", "menu", Some("Start: 10:00:00"));
        assert_eq!(with["embeds"][0]["footer"]["text"], "Start: 10:00:00");
        assert_eq!(with["embeds"][0]["color"], 0xffffff);

        let without = embed_payload(0, "csgo", "menu", None);
        assert!(without["embeds"][0].get("footer").is_none());
    }

    #[test]
    fn message_id_parses_from_snowflake_string() {
        let value = json!({ "id": "1067834705440000000" });
        assert_eq!(message_id_from(&value).unwrap(), 1067834705440000000);
        assert!(message_id_from(&json!({})).is_err());
    }

    #[test]
    fn effective_permissions_union_roles_and_apply_overwrites() {
        // 2048 = send messages, 8192 = manage messages.
        let roles = json!([
            { "id": "1", "permissions": "2048" },
            { "id": "10", "permissions": "8192" }
        ]);
        let perms = effective_permissions(1, 99, &[10], &roles, &serde_json::Value::Null);
        let needed = PERM_SEND_MESSAGES | PERM_MANAGE_MESSAGES;
        assert_eq!(perms & needed, needed);

        let overwrites = json!([
            { "id": "1", "type": 0, "allow": "0", "deny": "2048" }
        ]);
        let perms = effective_permissions(1, 99, &[10], &roles, &overwrites);
        assert_eq!(perms & PERM_SEND_MESSAGES, 0);
        assert_ne!(perms & PERM_MANAGE_MESSAGES, 0);
    }

    #[test]
    fn administrator_ignores_channel_overwrites() {
        let roles = json!([{ "id": "1", "permissions": "8" }]);
        let overwrites = json!([{ "id": "1", "type": 0, "allow": "0", "deny": "2048" }]);
        let perms = effective_permissions(1, 99, &[], &roles, &overwrites);
        assert_ne!(perms & PERM_SEND_MESSAGES, 0);
    }

    #[test]
    fn member_overwrite_wins_over_role_deny() {
        let roles = json!([{ "id": "1", "permissions": "2048" }]);
        let overwrites = json!([
            { "id": "10", "type": 0, "allow": "0", "deny": "2048" },
            { "id": "99", "type": 1, "allow": "2048", "deny": "0" }
        ]);
        let perms = effective_permissions(1, 99, &[10], &roles, &overwrites);
        assert_ne!(perms & PERM_SEND_MESSAGES, 0);
    }

    #[test]
    fn reaction_glyphs_are_percent_encoded() {
        let encoded = urlencoding::encode("1️⃣");
        assert!(encoded.starts_with('1'));
        assert!(encoded.contains('%'));
    }
}

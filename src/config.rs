use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::{is_executable, log_line, Catalog, CommandSpec, Settings, Target, Tier};

pub(crate) const SETTINGS_FILE: &str = "settings.json";
pub(crate) const COMMANDS_FILE: &str = "commands.json";
pub(crate) const SERVERS_FILE: &str = "servers.json";

pub(crate) const DEFAULT_PREFIX: &str = "!!";

/// Names that collide with the bot's built-in triggers. A target with one of
/// these names could never be addressed, so it is refused at load time.
const FORBIDDEN_TARGET_NAMES: &[&str] = &[
    "restart", "reload", "refresh", "servers", "settings", "setting",
];

/// A reusable operation template from commands.json, before it is bound to
/// a concrete target.
#[derive(Debug, Clone)]
pub(crate) struct CommandTemplate {
    pub(crate) template: String,
    pub(crate) server_scoped: bool,
    pub(crate) require_path: bool,
    pub(crate) sanitize_paths: bool,
}

#[derive(Debug, Deserialize)]
struct CommandFileEntry {
    server_command: serde_json::Value,
    command: String,
    require_path: serde_json::Value,
    strip_user_input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ServerFileEntry {
    name: String,
    #[serde(default)]
    user: String,
    path: String,
    #[serde(default)]
    head_admin: Vec<String>,
    #[serde(default)]
    admin: Vec<String>,
    #[serde(default)]
    moderator: Vec<String>,
    commands: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ServerCommandEntry {
    name: String,
    #[serde(default)]
    user: String,
    command: String,
    #[serde(default)]
    path: Option<String>,
}

fn read_json(path: &Path) -> Result<serde_json::Value, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("could not read {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid JSON in {}: {err}", path.display()))
}

fn json_object(
    value: serde_json::Value,
    path: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(format!("{} must be a JSON object", path.display())),
    }
}

/// Accepts the bool spellings the config files have historically used:
/// real booleans, "true"/"false" strings and 0/1 integers.
fn parse_flex_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Snowflake ids arrive as strings or integers. Empty, absent or `0` means
/// disabled and maps to 0; anything else must look like a real id.
fn parse_snowflake(value: &serde_json::Value, what: &str) -> Result<u64, String> {
    let text = match value {
        serde_json::Value::Null => return Ok(0),
        serde_json::Value::String(s) if s.is_empty() => return Ok(0),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return Err(format!("'{value}' is not a valid {what} id")),
    };
    if text == "0" {
        return Ok(0);
    }
    if !text.chars().all(|c| c.is_ascii_digit()) || !(17..=20).contains(&text.len()) {
        return Err(format!(
            "'{text}' is not a valid {what} id. Leave empty or set to 0 to disable."
        ));
    }
    text.parse::<u64>()
        .map_err(|err| format!("'{text}' is not a valid {what} id: {err}"))
}

fn parse_embed_colour(values: &[serde_json::Value]) -> Result<u32, String> {
    if values.is_empty() {
        return Ok(0xffffff);
    }
    let complaint = "embed colour must be three integers between 0 and 255".to_string();
    if values.len() != 3 {
        return Err(complaint);
    }
    let mut channels = [0u32; 3];
    for (slot, value) in channels.iter_mut().zip(values) {
        let number = match value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        };
        match number {
            Some(n) if n <= 255 => *slot = n as u32,
            _ => return Err(complaint),
        }
    }
    Ok((channels[0] << 16) | (channels[1] << 8) | channels[2])
}

/// Parses and validates settings.json. Every problem here is fatal; a bot
/// with a broken token or no staff roles cannot do anything useful.
pub(crate) fn load_settings(config_dir: &Path) -> Result<Settings, String> {
    let path = config_dir.join(SETTINGS_FILE);
    let data = json_object(read_json(&path)?, &path)?;

    let missing = |key: &str| format!("'{key}' was not found in {}", path.display());
    let token = data
        .get("token")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| missing("token"))?
        .to_string();
    if token.split('.').count() != 3 || token.split('.').any(str::is_empty) {
        return Err("invalid bot token".to_string());
    }

    let mut prefix = data
        .get("prefix")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| missing("prefix"))?
        .to_string();
    if prefix.is_empty() {
        prefix = DEFAULT_PREFIX.to_string();
    }

    let guild_id = parse_snowflake(data.get("server").ok_or_else(|| missing("server"))?, "server")?;
    if guild_id == 0 {
        return Err("a server id is required".to_string());
    }

    let head_admin_role =
        parse_snowflake(data.get("head_admin").ok_or_else(|| missing("head_admin"))?, "role")?;
    let admin_role = parse_snowflake(data.get("admin").ok_or_else(|| missing("admin"))?, "role")?;
    let moderator_role =
        parse_snowflake(data.get("moderator").ok_or_else(|| missing("moderator"))?, "role")?;
    if head_admin_role == 0 && admin_role == 0 && moderator_role == 0 {
        return Err("you need to set at least one staff role".to_string());
    }

    let embed_colour = match data.get("embed_colour") {
        Some(serde_json::Value::Array(values)) => parse_embed_colour(values)?,
        Some(_) => return Err("embed colour must be a list".to_string()),
        None => 0xffffff,
    };

    let owner_id = match data.get("owner") {
        Some(value) => match parse_snowflake(value, "owner")? {
            0 => None,
            id => Some(id),
        },
        None => None,
    };

    Ok(Settings {
        prefix,
        token,
        guild_id,
        head_admin_role,
        admin_role,
        moderator_role,
        owner_id,
        embed_colour,
    })
}

/// Parses commands.json into named templates. A malformed entry is skipped
/// with a logged reason; an unreadable file is fatal.
pub(crate) fn load_templates(config_dir: &Path) -> Result<HashMap<String, CommandTemplate>, String> {
    let path = config_dir.join(COMMANDS_FILE);
    let data = json_object(read_json(&path)?, &path)?;

    let mut templates = HashMap::new();
    for (key, value) in data {
        let entry: CommandFileEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(err) => {
                log_line("config", &format!("skipping command '{key}': {err}"));
                continue;
            }
        };
        let Some(server_scoped) = parse_flex_bool(&entry.server_command) else {
            log_line(
                "config",
                &format!("skipping command '{key}': 'server_command' is not a boolean"),
            );
            continue;
        };
        let Some(require_path) = parse_flex_bool(&entry.require_path) else {
            log_line(
                "config",
                &format!("skipping command '{key}': 'require_path' is not a boolean"),
            );
            continue;
        };
        let Some(sanitize_paths) = parse_flex_bool(&entry.strip_user_input) else {
            log_line(
                "config",
                &format!("skipping command '{key}': 'strip_user_input' is not a boolean"),
            );
            continue;
        };
        templates.insert(
            key,
            CommandTemplate {
                template: entry.command,
                server_scoped,
                require_path,
                sanitize_paths,
            },
        );
    }
    Ok(templates)
}

/// Resolves the directory an operation runs from. Explicit per-entry paths
/// beginning with `./` are taken relative to the target script's directory.
fn resolve_command_path(server_path: &Path, entry_path: &str) -> PathBuf {
    if let Some(relative) = entry_path.strip_prefix("./") {
        server_path
            .parent()
            .map(|parent| parent.join(relative))
            .unwrap_or_else(|| PathBuf::from(entry_path))
    } else {
        PathBuf::from(entry_path)
    }
}

fn build_target(
    key: &str,
    entry: ServerFileEntry,
    templates: &HashMap<String, CommandTemplate>,
    existing: &[Arc<Target>],
) -> Option<Target> {
    let skip = |reason: &str| {
        log_line("config", &format!("skipping server '{key}': {reason}"));
    };

    if FORBIDDEN_TARGET_NAMES.contains(&entry.name.as_str()) {
        skip(&format!("'{}' collides with a built-in trigger", entry.name));
        return None;
    }
    let server_path = PathBuf::from(&entry.path);
    if !server_path.exists() {
        skip(&format!("path '{}' does not exist", entry.path));
        return None;
    }
    if !is_executable(&server_path) {
        skip(&format!("path '{}' is not executable", entry.path));
        return None;
    }
    if existing.iter().any(|target| target.name == entry.name) {
        skip("another server already uses that name");
        return None;
    }

    let mut target = Target::new(entry.name.clone(), server_path.clone(), entry.user.clone());
    for (command_key, value) in &entry.commands {
        let drop_entry = |reason: &str| {
            log_line(
                "config",
                &format!("dropping command '{command_key}' from '{}': {reason}", entry.name),
            );
        };
        let command: ServerCommandEntry = match serde_json::from_value(value.clone()) {
            Ok(command) => command,
            Err(err) => {
                drop_entry(&err.to_string());
                continue;
            }
        };
        if target.find_command(&command.name).is_some() {
            drop_entry("another command already uses that name");
            continue;
        }
        let Some(template) = templates.get(&command.command) else {
            drop_entry(&format!("'{}' is not in {COMMANDS_FILE}", command.command));
            continue;
        };

        let working_path = if template.server_scoped {
            server_path.clone()
        } else if template.require_path {
            match command.path.as_deref() {
                Some(entry_path) => resolve_command_path(&server_path, entry_path),
                None => {
                    drop_entry("it requires a 'path'");
                    continue;
                }
            }
        } else {
            // cd-rooted commands without an explicit path run from the
            // directory holding the target script.
            server_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| server_path.clone())
        };

        let privilege_user = if command.user.is_empty() {
            entry.user.clone()
        } else {
            command.user.clone()
        };

        let spec = Arc::new(CommandSpec {
            name: command.name.clone(),
            template: template.template.clone(),
            server_scoped: template.server_scoped,
            privilege_user,
            working_path,
            sanitize_paths: template.sanitize_paths,
        });

        let tier = if entry.head_admin.contains(&command.name) {
            Tier::HeadAdmin
        } else if entry.admin.contains(&command.name) {
            Tier::Admin
        } else if entry.moderator.contains(&command.name) {
            Tier::Moderator
        } else {
            drop_entry("it is not granted to any tier");
            continue;
        };
        target.add_command(tier, spec);
    }

    if target.is_empty() {
        skip("it does not have any valid commands");
        return None;
    }
    Some(target)
}

/// Parses commands.json plus servers.json into a fresh catalog. Ending up
/// with no usable targets at all is fatal.
pub(crate) fn load_catalog(config_dir: &Path) -> Result<Catalog, String> {
    let templates = load_templates(config_dir)?;

    let path = config_dir.join(SERVERS_FILE);
    let data = json_object(read_json(&path)?, &path)?;

    let mut targets: Vec<Arc<Target>> = Vec::new();
    for (key, value) in data {
        let entry: ServerFileEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(err) => {
                log_line("config", &format!("skipping server '{key}': {err}"));
                continue;
            }
        };
        if let Some(target) = build_target(&key, entry, &templates, &targets) {
            targets.push(Arc::new(target));
        }
    }

    if targets.is_empty() {
        return Err("there are no servers with any valid commands".to_string());
    }
    Ok(Catalog::new(targets))
}

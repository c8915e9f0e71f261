use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use super::{
    load_catalog, log_line, spawn_gateway_listener, Caller, Catalog, DiscordRest, ExecutionResult,
    OpenOutcome, OutputRouter, SelectOutcome, SessionManager, Settings, Target, Tier, Transport,
    TransportEvent,
};

pub(crate) const MENU_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const ARGUMENT_WAIT: Duration = Duration::from_secs(60);
const EVENT_POLL: Duration = Duration::from_millis(250);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Handed back from an execution worker thread when its subprocess is done.
pub(crate) struct CompletionEvent {
    target_name: String,
    command_name: String,
    channel_id: u64,
    message_id: u64,
    caller: Caller,
    started_label: String,
    elapsed: Duration,
    result: ExecutionResult,
}

/// The session engine behind the gateway loop. One instance lives for the
/// whole process; reconnects replace the socket, never the engine, so open
/// menus survive a gateway blip.
pub(crate) struct Engine {
    settings: Settings,
    catalog: RwLock<Catalog>,
    config_dir: PathBuf,
    transport: Arc<dyn Transport>,
    sessions: SessionManager,
    output: OutputRouter,
    /// Pending argument prompts, keyed by (channel, author). The next
    /// message from that pair is consumed as the argument reply.
    input_waiters: Arc<Mutex<HashMap<(u64, u64), mpsc::Sender<String>>>>,
    completion_tx: mpsc::Sender<CompletionEvent>,
    argument_wait: Duration,
}

impl Engine {
    pub(crate) fn new(
        settings: Settings,
        catalog: Catalog,
        config_dir: PathBuf,
        transport: Arc<dyn Transport>,
        menu_timeout: Duration,
        argument_wait: Duration,
        completion_tx: mpsc::Sender<CompletionEvent>,
    ) -> Self {
        let sessions = SessionManager::new(Arc::clone(&transport), menu_timeout);
        let output = OutputRouter::new(Arc::clone(&transport), PathBuf::from("./tmp"));
        Engine {
            settings,
            catalog: RwLock::new(catalog),
            config_dir,
            transport,
            sessions,
            output,
            input_waiters: Arc::new(Mutex::new(HashMap::new())),
            completion_tx,
            argument_wait,
        }
    }

    pub(crate) fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageCreated {
                author_is_bot: true,
                ..
            }
            | TransportEvent::ReactionAdded {
                author_is_bot: true,
                ..
            }
            | TransportEvent::ReactionRemoved {
                author_is_bot: true,
                ..
            } => {}
            TransportEvent::MessageCreated {
                channel_id,
                guild_id,
                author_id,
                author_name,
                content,
                author_roles,
                ..
            } => self.handle_message(channel_id, guild_id, author_id, author_name, content, author_roles),
            TransportEvent::ReactionAdded {
                message_id,
                author_id,
                author_name,
                glyph,
                author_roles,
                ..
            } => self.handle_reaction(message_id, author_id, author_name, glyph, author_roles),
            TransportEvent::ReactionRemoved { message_id, .. } => {
                if self.sessions.holds_message(message_id) {
                    self.sessions.close_on_withdrawn(message_id);
                }
            }
            TransportEvent::MessageDeleted { message_id } => {
                self.sessions.close_on_delete(message_id);
            }
            TransportEvent::Disconnected(_) => {}
        }
    }

    fn handle_message(
        &self,
        channel_id: u64,
        guild_id: Option<u64>,
        author_id: u64,
        author_name: String,
        content: String,
        author_roles: Vec<u64>,
    ) {
        if guild_id != Some(self.settings.guild_id) {
            return;
        }

        // An outstanding argument prompt claims the author's next message.
        {
            let waiters = self.input_waiters.lock().unwrap();
            if let Some(reply_tx) = waiters.get(&(channel_id, author_id)) {
                let _ = reply_tx.send(content);
                return;
            }
        }

        let Some(rest) = content.strip_prefix(&self.settings.prefix) else {
            return;
        };
        let Some(tier) = Tier::resolve(&author_roles, &self.settings) else {
            return;
        };
        let caller = Caller {
            id: author_id,
            name: author_name,
            tier,
        };

        match rest {
            "servers" => self.send_overview(channel_id, tier),
            "refresh" => self.refresh(channel_id),
            name => {
                let target = self.catalog.read().unwrap().resolve(name).cloned();
                if let Some(target) = target {
                    self.open_menu(&target, &caller, channel_id);
                }
            }
        }
    }

    fn open_menu(&self, target: &Arc<Target>, caller: &Caller, channel_id: u64) {
        // A menu needs send plus manage messages in its channel. The REST
        // client reports a refusal to the application owner.
        match self.transport.channel_usable(channel_id) {
            Ok(true) => {}
            Ok(false) => {
                log_line(
                    "bot",
                    &format!(
                        "not opening a menu for {}: missing permissions in channel {channel_id}",
                        target.name
                    ),
                );
                return;
            }
            Err(err) => {
                log_line("bot", &format!("cannot check channel permissions: {err}"));
            }
        }

        match self.sessions.open(target, caller.tier, channel_id) {
            Ok(OpenOutcome::Opened { .. }) => {
                log_line(
                    "bot",
                    &format!("{} opened a menu for {}", caller.name, target.name),
                );
            }
            Ok(OpenOutcome::AlreadyOpen {
                channel_id: menu_channel_id,
                message_id,
            }) => {
                let jump = format!(
                    "https://discord.com/channels/{}/{menu_channel_id}/{message_id}",
                    self.settings.guild_id
                );
                if let Err(err) = self.transport.send_embed(
                    channel_id,
                    "",
                    &format!(
                        "There already is a menu open to execute a command for {}!\n{jump}",
                        target.name
                    ),
                    None,
                ) {
                    log_line("bot", &format!("cannot report open menu: {err}"));
                }
            }
            Ok(OpenOutcome::NoCommands) => {}
            Err(err) => log_line("bot", &err),
        }
    }

    fn handle_reaction(
        &self,
        message_id: u64,
        author_id: u64,
        author_name: String,
        glyph: String,
        author_roles: Vec<u64>,
    ) {
        let Some(tier) = Tier::resolve(&author_roles, &self.settings) else {
            return;
        };
        let caller = Caller {
            id: author_id,
            name: author_name,
            tier,
        };

        let SelectOutcome::Selected {
            target,
            channel_id,
            message_id,
            command,
        } = self.sessions.select(message_id, &glyph, &caller)
        else {
            // A stray or unauthorized reaction restarts the menu's window,
            // up to the per-session rearm cap.
            self.sessions.rearm_for_message(message_id);
            return;
        };

        if let Err(err) = self.transport.clear_reactions(channel_id, message_id) {
            log_line("bot", &format!("cannot clear menu reactions: {err}"));
        }

        let started_label = Local::now().format("%H:%M:%S").to_string();
        let description = format!(
            "<@{}> used `{}`\n\nExecuting the command...",
            caller.id, command.name
        );
        if let Err(err) = self.transport.edit_embed(
            channel_id,
            message_id,
            &target.name,
            &description,
            Some(&format!("Start: {started_label}")),
        ) {
            log_line("bot", &format!("cannot mark menu as executing: {err}"));
        }

        let transport = Arc::clone(&self.transport);
        let waiters = Arc::clone(&self.input_waiters);
        let completion_tx = self.completion_tx.clone();
        let argument_wait = self.argument_wait;
        let target_name = target.name.clone();
        let command_name = command.name.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = command.execute(|count| {
                let (reply_tx, reply_rx) = mpsc::channel();
                waiters
                    .lock()
                    .unwrap()
                    .insert((channel_id, caller.id), reply_tx);
                let noun = if count == 1 { "argument" } else { "arguments" };
                let prompt = format!(
                    "`{command_name}` requires {count} {noun}. Reply within {} seconds.",
                    argument_wait.as_secs()
                );
                if let Err(err) = transport.send_text(channel_id, &prompt) {
                    log_line("bot", &format!("cannot prompt for arguments: {err}"));
                }
                let reply = reply_rx.recv_timeout(argument_wait).ok();
                waiters.lock().unwrap().remove(&(channel_id, caller.id));
                reply
            });
            let _ = completion_tx.send(CompletionEvent {
                target_name,
                command_name: command.name.clone(),
                channel_id,
                message_id,
                caller,
                started_label,
                elapsed: started.elapsed(),
                result,
            });
        });
    }

    pub(crate) fn handle_completion(&self, done: CompletionEvent) {
        let verdict = if done.result.success {
            "✅ Successfully executed the command".to_string()
        } else if done.result.input_failed {
            format!(
                "❌ Failed to execute the command\n`{}` requires input",
                done.command_name
            )
        } else {
            "❌ Failed to execute the command".to_string()
        };
        let description = format!(
            "<@{}> used `{}`\n\n{verdict}",
            done.caller.id, done.command_name
        );

        let ended_label = Local::now().format("%H:%M:%S").to_string();
        // Sub-five-second runs keep the footer short.
        let footer = if done.elapsed.as_secs() >= 5 {
            let secs = done.elapsed.as_secs();
            format!(
                "Start: {} ▫️ End: {ended_label} ▫️ Duration: {}:{:02}:{:02}",
                done.started_label,
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60
            )
        } else {
            format!("Start: {} ▫️ End: {ended_label}", done.started_label)
        };

        if let Err(err) = self.transport.edit_embed(
            done.channel_id,
            done.message_id,
            &done.target_name,
            &description,
            Some(&footer),
        ) {
            log_line("bot", &format!("cannot record command outcome: {err}"));
        }

        if let Some(stdout) = &done.result.stdout {
            self.output
                .deliver(done.channel_id, "Output", stdout, done.message_id);
        }
        if let Some(stderr) = &done.result.stderr {
            self.output
                .deliver(done.channel_id, "Errors", stderr, done.message_id);
        }
    }

    fn send_overview(&self, channel_id: u64, tier: Tier) {
        let (empty, description) = {
            let catalog = self.catalog.read().unwrap();
            let mut description = String::new();
            for (idx, target) in catalog.targets().iter().enumerate() {
                if target.has_commands_for(tier) {
                    description.push_str(&format!("`{}.` {}\n", idx + 1, target.name));
                }
            }
            (catalog.is_empty(), description)
        };

        let text = if empty {
            "There aren't any servers set up yet".to_string()
        } else if description.is_empty() {
            "You don't have access to any of the current servers".to_string()
        } else {
            description
        };
        if let Err(err) = self.transport.send_embed(channel_id, "", &text, None) {
            log_line("bot", &format!("cannot send server overview: {err}"));
        }
    }

    /// Re-parses commands.json and servers.json and swaps the catalog in one
    /// write. Open sessions keep their snapshot of the old targets.
    fn refresh(&self, channel_id: u64) {
        let progress = self
            .transport
            .send_embed(channel_id, "", "Refreshing all servers...", None);

        let outcome = match load_catalog(&self.config_dir) {
            Ok(fresh) => {
                *self.catalog.write().unwrap() = fresh;
                log_line("bot", "server list refreshed");
                "Refreshed servers"
            }
            Err(err) => {
                log_line("bot", &format!("refresh failed: {err}"));
                "Failed to refresh the servers\nPlease look at the console for more information"
            }
        };

        match progress {
            Ok(message_id) => {
                if let Err(err) =
                    self.transport
                        .edit_embed(channel_id, message_id, "", outcome, None)
                {
                    log_line("bot", &format!("cannot update refresh notice: {err}"));
                }
            }
            Err(err) => log_line("bot", &format!("cannot post refresh notice: {err}")),
        }
    }
}

/// Connects to the gateway and runs the engine until the process dies.
/// Socket drops trigger a reconnect with exponential backoff; the engine
/// and its open sessions carry over.
pub(crate) fn run_bot(
    settings: Settings,
    catalog: Catalog,
    config_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport: Arc<dyn Transport> = Arc::new(DiscordRest::new(
        &settings.token,
        settings.embed_colour,
        settings.owner_id,
    ));
    let (completion_tx, completion_rx) = mpsc::channel();
    let engine = Engine::new(
        settings.clone(),
        catalog,
        config_dir,
        transport,
        MENU_TIMEOUT,
        ARGUMENT_WAIT,
        completion_tx,
    );

    let mut reconnect_delay = Duration::from_secs(1);
    loop {
        let (event_tx, event_rx) = mpsc::channel();
        let _listener = spawn_gateway_listener(settings.token.clone(), event_tx);

        loop {
            match event_rx.recv_timeout(EVENT_POLL) {
                Ok(TransportEvent::Disconnected(reason)) => {
                    log_line("bot", &format!("gateway disconnected: {reason}"));
                    break;
                }
                Ok(event) => {
                    reconnect_delay = Duration::from_secs(1);
                    engine.handle_event(event);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            while let Ok(done) = completion_rx.try_recv() {
                engine.handle_completion(done);
            }
        }

        log_line(
            "bot",
            &format!("reconnecting in {} seconds", reconnect_delay.as_secs()),
        );
        thread::sleep(reconnect_delay);
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingTransport};
    use crate::CommandSpec;
    use std::fs;

    const GUILD: u64 = 123456789012345678;
    const HEAD_ROLE: u64 = 223456789012345678;
    const MOD_ROLE: u64 = 323456789012345678;

    fn settings() -> Settings {
        Settings {
            prefix: "!!".to_string(),
            token: "a.b.c".to_string(),
            guild_id: GUILD,
            head_admin_role: HEAD_ROLE,
            admin_role: 0,
            moderator_role: MOD_ROLE,
            owner_id: None,
            embed_colour: 0xffffff,
        }
    }

    fn command(name: &str, template: &str) -> Arc<CommandSpec> {
        Arc::new(CommandSpec {
            name: name.to_string(),
            template: template.to_string(),
            server_scoped: false,
            privilege_user: String::new(),
            working_path: std::env::temp_dir(),
            sanitize_paths: false,
        })
    }

    fn catalog() -> Catalog {
        let mut alpha = Target::new("alpha".to_string(), std::env::temp_dir(), String::new());
        alpha.add_command(Tier::HeadAdmin, command("restart", "echo alpha-restarted"));
        alpha.add_command(Tier::HeadAdmin, command("greet", "echo {}"));
        let mut beta = Target::new("beta".to_string(), std::env::temp_dir(), String::new());
        beta.add_command(Tier::Moderator, command("details", "echo beta-details"));
        Catalog::new(vec![Arc::new(alpha), Arc::new(beta)])
    }

    struct Fixture {
        transport: Arc<RecordingTransport>,
        engine: Engine,
        completion_rx: mpsc::Receiver<CompletionEvent>,
    }

    fn fixture() -> Fixture {
        fixture_with_config(std::env::temp_dir())
    }

    fn fixture_with_config(config_dir: PathBuf) -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let (completion_tx, completion_rx) = mpsc::channel();
        let engine = Engine::new(
            settings(),
            catalog(),
            config_dir,
            transport.clone(),
            Duration::from_secs(30),
            Duration::from_millis(500),
            completion_tx,
        );
        Fixture {
            transport,
            engine,
            completion_rx,
        }
    }

    fn trigger(content: &str, roles: Vec<u64>) -> TransportEvent {
        TransportEvent::MessageCreated {
            channel_id: 7,
            message_id: 1,
            guild_id: Some(GUILD),
            author_id: 55,
            author_name: "ops".to_string(),
            author_is_bot: false,
            content: content.to_string(),
            author_roles: roles,
        }
    }

    fn reaction(message_id: u64, glyph: &str, roles: Vec<u64>) -> TransportEvent {
        TransportEvent::ReactionAdded {
            channel_id: 7,
            message_id,
            author_id: 55,
            author_name: "ops".to_string(),
            author_is_bot: false,
            glyph: glyph.to_string(),
            author_roles: roles,
        }
    }

    fn menu_message_id(transport: &RecordingTransport) -> u64 {
        transport
            .calls()
            .iter()
            .find_map(|call| match call {
                Call::Embed { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .expect("a menu embed was posted")
    }

    #[test]
    fn trigger_from_wrong_guild_or_without_role_is_ignored() {
        let f = fixture();
        let mut wrong_guild = trigger("!!alpha", vec![HEAD_ROLE]);
        if let TransportEvent::MessageCreated { guild_id, .. } = &mut wrong_guild {
            *guild_id = Some(999);
        }
        f.engine.handle_event(wrong_guild);
        f.engine.handle_event(trigger("!!alpha", vec![]));
        f.engine.handle_event(trigger("alpha", vec![HEAD_ROLE]));
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn menu_is_not_opened_without_channel_permissions() {
        let f = fixture();
        f.transport.set_channel_usable(false);
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        assert!(f.transport.calls().is_empty());

        // Once the channel allows the bot again the trigger works.
        f.transport.set_channel_usable(true);
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        assert!(f
            .transport
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Embed { .. })));
    }

    #[test]
    fn bot_authored_events_are_ignored() {
        let f = fixture();
        let mut event = trigger("!!alpha", vec![HEAD_ROLE]);
        if let TransportEvent::MessageCreated { author_is_bot, .. } = &mut event {
            *author_is_bot = true;
        }
        f.engine.handle_event(event);
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn full_selection_round_trip_executes_and_reports() {
        let f = fixture();
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));

        let menu_id = menu_message_id(&f.transport);
        f.engine.handle_event(reaction(menu_id, "1️⃣", vec![HEAD_ROLE]));

        // The menu flips to executing and its reactions are withdrawn.
        let calls = f.transport.calls();
        assert!(calls.contains(&Call::ClearReactions { message_id: menu_id }));
        assert!(calls.iter().any(|call| matches!(
            call,
            Call::Edit { message_id, description, .. }
                if *message_id == menu_id && description.contains("Executing")
        )));

        let done = f
            .completion_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker finished");
        assert!(done.result.success);
        f.engine.handle_completion(done);

        let calls = f.transport.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            Call::Edit { description, .. } if description.contains("✅")
        )));
        assert!(calls.iter().any(|call| matches!(
            call,
            Call::Text { content, .. } if content.contains("alpha-restarted")
        )));
    }

    #[test]
    fn argument_reply_reaches_the_waiting_worker() {
        let f = fixture();
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        let menu_id = menu_message_id(&f.transport);

        // Glyph 2 picks the placeholder command.
        f.engine.handle_event(reaction(menu_id, "2️⃣", vec![HEAD_ROLE]));

        // Wait for the worker to post its argument prompt.
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let prompted = f.transport.calls().iter().any(|call| {
                matches!(call, Call::Text { content, .. } if content.contains("requires 1 argument"))
            });
            if prompted {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        f.engine.handle_event(trigger("hello-from-chat", vec![HEAD_ROLE]));
        let done = f
            .completion_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker finished");
        assert!(done.result.success);
        assert_eq!(done.result.stdout.as_deref(), Some("hello-from-chat\n"));
    }

    #[test]
    fn argument_timeout_reports_an_input_failure() {
        let f = fixture();
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        let menu_id = menu_message_id(&f.transport);
        f.engine.handle_event(reaction(menu_id, "2️⃣", vec![HEAD_ROLE]));

        // Nobody replies; the 500 ms test window lapses.
        let done = f
            .completion_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker finished");
        assert!(done.result.input_failed);
        f.engine.handle_completion(done);
        assert!(f.transport.calls().iter().any(|call| matches!(
            call,
            Call::Edit { description, .. } if description.contains("requires input")
        )));
    }

    #[test]
    fn moderator_cannot_select_from_a_head_admin_menu() {
        let f = fixture();
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        let menu_id = menu_message_id(&f.transport);
        let before = f.transport.calls().len();

        f.engine.handle_event(reaction(menu_id, "1️⃣", vec![MOD_ROLE]));
        assert_eq!(f.transport.calls().len(), before);
        assert!(f
            .completion_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn overview_lists_only_accessible_targets() {
        let f = fixture();
        f.engine.handle_event(trigger("!!servers", vec![MOD_ROLE]));
        let calls = f.transport.calls();
        match &calls[0] {
            Call::Embed { description, .. } => {
                assert!(description.contains("beta"));
                assert!(!description.contains("alpha"));
            }
            other => panic!("expected overview embed, got {other:?}"),
        }
    }

    #[test]
    fn refresh_swaps_in_the_reloaded_catalog() {
        let dir =
            std::env::temp_dir().join(format!("gsmcord-refresh-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(crate::COMMANDS_FILE),
            r#"{"restart": {"server_command": true, "command": "restart", "require_path": false, "strip_user_input": false}}"#,
        )
        .unwrap();
        fs::write(
            dir.join(crate::SERVERS_FILE),
            r#"{"gamma": {"name": "gamma", "user": "", "path": "/bin/sh", "head_admin": ["Restart"],
                 "commands": {"restart": {"name": "Restart", "user": "", "command": "restart"}}}}"#,
        )
        .unwrap();

        let f = fixture_with_config(dir.clone());
        f.engine.handle_event(trigger("!!refresh", vec![HEAD_ROLE]));

        let calls = f.transport.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            Call::Edit { description, .. } if description == "Refreshed servers"
        )));

        // The old target is gone, the new one resolves.
        f.engine.handle_event(trigger("!!gamma", vec![HEAD_ROLE]));
        assert!(f.transport.calls().iter().any(|call| matches!(
            call,
            Call::Embed { title, .. } if title == "gamma"
        )));
        let before = f.transport.calls().len();
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        assert_eq!(f.transport.calls().len(), before);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplicate_trigger_points_at_the_open_menu() {
        let f = fixture();
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));
        let menu_id = menu_message_id(&f.transport);
        f.engine.handle_event(trigger("!!alpha", vec![HEAD_ROLE]));

        let jump = format!("https://discord.com/channels/{GUILD}/7/{menu_id}");
        assert!(f.transport.calls().iter().any(|call| matches!(
            call,
            Call::Embed { description, .. }
                if description.contains("already is a menu open") && description.contains(&jump)
        )));
    }
}

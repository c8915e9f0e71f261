use std::path::PathBuf;
use std::sync::Arc;

use super::{CommandSpec, Tier};

/// A managed server target and its per-tier operation lists.
///
/// Commands are shared `Arc`s: an operation granted to several tiers is one
/// allocation referenced from each list, so identity comparisons work by
/// pointer.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) name: String,
    pub(crate) working_path: PathBuf,
    pub(crate) privilege_user: String,
    moderator: Vec<Arc<CommandSpec>>,
    admin: Vec<Arc<CommandSpec>>,
    head_admin: Vec<Arc<CommandSpec>>,
}

impl Target {
    pub(crate) fn new(name: String, working_path: PathBuf, privilege_user: String) -> Self {
        Target {
            name,
            working_path,
            privilege_user,
            moderator: Vec::new(),
            admin: Vec::new(),
            head_admin: Vec::new(),
        }
    }

    /// Registers an operation for one tier. Re-adding the same operation to
    /// the same tier is a no-op.
    pub(crate) fn add_command(&mut self, tier: Tier, command: Arc<CommandSpec>) {
        let list = match tier {
            Tier::Moderator => &mut self.moderator,
            Tier::Admin => &mut self.admin,
            Tier::HeadAdmin => &mut self.head_admin,
        };
        if !list.iter().any(|existing| Arc::ptr_eq(existing, &command)) {
            list.push(command);
        }
    }

    /// The operations a caller of `tier` may run: the tier's own list plus
    /// every lower tier's, first occurrence wins. Privilege is monotonic; a
    /// higher tier never sees fewer operations than a lower one.
    pub(crate) fn authorized(&self, tier: Tier) -> Vec<Arc<CommandSpec>> {
        let lists: &[&Vec<Arc<CommandSpec>>] = match tier {
            Tier::HeadAdmin => &[&self.head_admin, &self.admin, &self.moderator],
            Tier::Admin => &[&self.admin, &self.moderator],
            Tier::Moderator => &[&self.moderator],
        };
        let mut union: Vec<Arc<CommandSpec>> = Vec::new();
        for list in lists {
            for command in list.iter() {
                if !union.iter().any(|existing| Arc::ptr_eq(existing, command)) {
                    union.push(Arc::clone(command));
                }
            }
        }
        union
    }

    /// Exact lookup by display name across every tier's list. Names are
    /// unique within a target; duplicates are dropped at load time.
    pub(crate) fn find_command(&self, name: &str) -> Option<&Arc<CommandSpec>> {
        self.head_admin
            .iter()
            .chain(&self.admin)
            .chain(&self.moderator)
            .find(|command| command.name == name)
    }

    pub(crate) fn has_commands_for(&self, tier: Tier) -> bool {
        !self.authorized(tier).is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.moderator.is_empty() && self.admin.is_empty() && self.head_admin.is_empty()
    }
}

/// The full registry of targets, rebuilt wholesale on `refresh` and swapped
/// in atomically.
#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    targets: Vec<Arc<Target>>,
}

impl Catalog {
    pub(crate) fn new(targets: Vec<Arc<Target>>) -> Self {
        Catalog { targets }
    }

    /// Exact, case-sensitive lookup by target name.
    pub(crate) fn resolve(&self, name: &str) -> Option<&Arc<Target>> {
        self.targets.iter().find(|target| target.name == name)
    }

    pub(crate) fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str) -> Arc<CommandSpec> {
        Arc::new(CommandSpec {
            name: name.to_string(),
            template: name.to_string(),
            server_scoped: true,
            privilege_user: String::new(),
            working_path: PathBuf::from("/srv/game/server"),
            sanitize_paths: false,
        })
    }

    fn target_with_tiers() -> (Target, Arc<CommandSpec>, Arc<CommandSpec>, Arc<CommandSpec>) {
        let restart = command("restart");
        let update = command("update");
        let details = command("details");
        let mut target = Target::new(
            "csgo".to_string(),
            PathBuf::from("/srv/game/server"),
            String::new(),
        );
        target.add_command(Tier::HeadAdmin, Arc::clone(&update));
        target.add_command(Tier::Admin, Arc::clone(&restart));
        target.add_command(Tier::Moderator, Arc::clone(&details));
        (target, restart, update, details)
    }

    #[test]
    fn authorized_is_cumulative_across_tiers() {
        let (target, restart, update, details) = target_with_tiers();

        let moderator = target.authorized(Tier::Moderator);
        assert_eq!(moderator.len(), 1);
        assert!(Arc::ptr_eq(&moderator[0], &details));

        let admin = target.authorized(Tier::Admin);
        assert_eq!(admin.len(), 2);
        assert!(Arc::ptr_eq(&admin[0], &restart));
        assert!(Arc::ptr_eq(&admin[1], &details));

        let head = target.authorized(Tier::HeadAdmin);
        assert_eq!(head.len(), 3);
        assert!(Arc::ptr_eq(&head[0], &update));
    }

    #[test]
    fn lower_tier_commands_are_a_subset_of_higher() {
        let (target, ..) = target_with_tiers();
        let lower = target.authorized(Tier::Moderator);
        let higher = target.authorized(Tier::HeadAdmin);
        for cmd in &lower {
            assert!(higher.iter().any(|c| Arc::ptr_eq(c, cmd)));
        }
    }

    #[test]
    fn shared_command_appears_once_in_union() {
        let shared = command("restart");
        let mut target = Target::new("gmod".to_string(), PathBuf::from("/srv"), String::new());
        target.add_command(Tier::Moderator, Arc::clone(&shared));
        target.add_command(Tier::HeadAdmin, Arc::clone(&shared));
        let head = target.authorized(Tier::HeadAdmin);
        assert_eq!(head.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let cmd = command("restart");
        let mut target = Target::new("gmod".to_string(), PathBuf::from("/srv"), String::new());
        target.add_command(Tier::Admin, Arc::clone(&cmd));
        target.add_command(Tier::Admin, Arc::clone(&cmd));
        assert_eq!(target.authorized(Tier::Admin).len(), 1);
    }

    #[test]
    fn find_command_searches_all_tiers() {
        let (target, restart, ..) = target_with_tiers();
        assert!(Arc::ptr_eq(target.find_command("restart").unwrap(), &restart));
        assert_eq!(target.find_command("details").unwrap().name, "details");
        assert!(target.find_command("Restart").is_none());
        assert!(target.find_command("missing").is_none());
    }

    #[test]
    fn resolve_is_exact_match() {
        let (target, ..) = target_with_tiers();
        let catalog = Catalog::new(vec![Arc::new(target)]);
        assert!(catalog.resolve("csgo").is_some());
        assert!(catalog.resolve("CSGO").is_none());
        assert!(catalog.resolve("csg").is_none());
    }
}

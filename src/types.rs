/// Trust tiers, ordered from least to most privileged. A higher tier is
/// authorized for everything the tiers below it can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Tier {
    Moderator,
    Admin,
    HeadAdmin,
}

impl Tier {
    /// Maps a member's role ids onto a tier. Returns `None` when none of the
    /// configured staff roles match, which means the caller is ignored.
    pub(crate) fn resolve(role_ids: &[u64], settings: &Settings) -> Option<Tier> {
        if settings.head_admin_role != 0 && role_ids.contains(&settings.head_admin_role) {
            return Some(Tier::HeadAdmin);
        }
        if settings.admin_role != 0 && role_ids.contains(&settings.admin_role) {
            return Some(Tier::Admin);
        }
        if settings.moderator_role != 0 && role_ids.contains(&settings.moderator_role) {
            return Some(Tier::Moderator);
        }
        None
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Tier::Moderator => "moderator",
            Tier::Admin => "admin",
            Tier::HeadAdmin => "head admin",
        };
        f.write_str(label)
    }
}

/// Validated bot settings. Parsed once at startup and immutable afterwards;
/// the `refresh` trigger only reloads the command and server files.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) prefix: String,
    pub(crate) token: String,
    pub(crate) guild_id: u64,
    pub(crate) head_admin_role: u64,
    pub(crate) admin_role: u64,
    pub(crate) moderator_role: u64,
    pub(crate) owner_id: Option<u64>,
    pub(crate) embed_colour: u32,
}

/// The member behind a trigger or a menu selection.
#[derive(Debug, Clone)]
pub(crate) struct Caller {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) tier: Tier,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            prefix: "!!".to_string(),
            token: "a.b.c".to_string(),
            guild_id: 1,
            head_admin_role: 100,
            admin_role: 200,
            moderator_role: 300,
            owner_id: None,
            embed_colour: 0xffffff,
        }
    }

    #[test]
    fn tier_ordering_is_monotonic() {
        assert!(Tier::HeadAdmin > Tier::Admin);
        assert!(Tier::Admin > Tier::Moderator);
    }

    #[test]
    fn resolve_prefers_highest_matching_role() {
        let s = settings();
        assert_eq!(Tier::resolve(&[300, 100], &s), Some(Tier::HeadAdmin));
        assert_eq!(Tier::resolve(&[200], &s), Some(Tier::Admin));
        assert_eq!(Tier::resolve(&[300], &s), Some(Tier::Moderator));
        assert_eq!(Tier::resolve(&[999], &s), None);
        assert_eq!(Tier::resolve(&[], &s), None);
    }

    #[test]
    fn resolve_skips_disabled_roles() {
        let mut s = settings();
        s.moderator_role = 0;
        // A member whose only staff role is the disabled one has no tier.
        assert_eq!(Tier::resolve(&[0], &s), None);
    }
}

//! Static command registry.
//!
//! Commands are plain data registered once at startup: a name, help strings,
//! an explicit permission predicate and a handler tag the dispatcher matches
//! on. No runtime plugin discovery.

use crate::security::CommandClass;

/// Handler tag; the application layer matches on this to run the command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Groups,
    Join,
    AddMember,
    RemoveMember,
    Promote,
    Ai,
    Lookup,
    Status,
}

/// Independently combinable permission flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Permissions {
    pub admin_only: bool,
    pub group_only: bool,
    pub dm_only: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub perms: Permissions,
    pub kind: CommandKind,
    pub class: CommandClass,
}

pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
}

impl CommandRegistry {
    /// The built-in command set. Immutable after startup.
    pub fn builtin() -> Self {
        let commands = vec![
            CommandSpec {
                name: "help",
                description: "List available commands",
                usage: "/help",
                perms: Permissions::default(),
                kind: CommandKind::Help,
                class: CommandClass::General,
            },
            CommandSpec {
                name: "groups",
                description: "List groups with their numbers",
                usage: "/groups",
                perms: Permissions {
                    dm_only: true,
                    ..Permissions::default()
                },
                kind: CommandKind::Groups,
                class: CommandClass::General,
            },
            CommandSpec {
                name: "join",
                description: "Ask to join a group from the /groups listing",
                usage: "/join #<number>",
                perms: Permissions {
                    dm_only: true,
                    ..Permissions::default()
                },
                kind: CommandKind::Join,
                class: CommandClass::GroupMutation,
            },
            CommandSpec {
                name: "add",
                description: "Add a member to a group",
                usage: "/add <phone|uuid|@mention> [#number]",
                perms: Permissions {
                    admin_only: true,
                    ..Permissions::default()
                },
                kind: CommandKind::AddMember,
                class: CommandClass::GroupMutation,
            },
            CommandSpec {
                name: "remove",
                description: "Remove a member from a group",
                usage: "/remove <phone|uuid|@mention> [#number]",
                perms: Permissions {
                    admin_only: true,
                    ..Permissions::default()
                },
                kind: CommandKind::RemoveMember,
                class: CommandClass::GroupMutation,
            },
            CommandSpec {
                name: "promote",
                description: "Make a member an admin of this group",
                usage: "/promote <phone|uuid|@mention>",
                perms: Permissions {
                    admin_only: true,
                    group_only: true,
                    ..Permissions::default()
                },
                kind: CommandKind::Promote,
                class: CommandClass::GroupMutation,
            },
            CommandSpec {
                name: "ai",
                description: "Ask the assistant",
                usage: "/ai <question>",
                perms: Permissions::default(),
                kind: CommandKind::Ai,
                class: CommandClass::Ai,
            },
            CommandSpec {
                name: "lookup",
                description: "Check domains against the approved list",
                usage: "/lookup <domain> [domain ...]",
                perms: Permissions::default(),
                kind: CommandKind::Lookup,
                class: CommandClass::DomainLookup,
            },
            CommandSpec {
                name: "status",
                description: "Daemon health summary",
                usage: "/status",
                perms: Permissions {
                    admin_only: true,
                    dm_only: true,
                    ..Permissions::default()
                },
                kind: CommandKind::Status,
                class: CommandClass::General,
            },
        ];
        Self { commands }
    }

    pub fn find(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.name.to_string()).collect()
    }

    /// User-facing help text.
    pub fn help_text(&self) -> String {
        let mut out = String::from("Available commands:\n");
        for c in &self.commands {
            out.push_str(&format!("{} - {}\n", c.usage, c.description));
        }
        out.push_str("Messages that are not commands are answered by the assistant.");
        out
    }
}

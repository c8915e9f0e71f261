// Module declarations
mod bot;
mod catalog;
mod cli;
mod command;
mod config;
mod output;
mod session;
mod timeout;
mod transport;
mod types;
mod util;

// Re-export all module items at crate root so cross-module references work
// through a single namespace.
#[allow(unused_imports)]
pub(crate) use bot::*;
#[allow(unused_imports)]
pub(crate) use catalog::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use command::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use output::*;
#[allow(unused_imports)]
pub(crate) use session::*;
#[allow(unused_imports)]
pub(crate) use timeout::*;
#[allow(unused_imports)]
pub(crate) use transport::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::path::Path;

use clap::Parser;

fn load_everything(config_dir: &Path) -> Result<(Settings, Catalog), Box<dyn std::error::Error>> {
    log_line("startup", "1/4 parsing the settings file...");
    let settings = load_settings(config_dir)?;

    log_line("startup", "2/4 parsing the commands file...");
    let templates = load_templates(config_dir)?;
    log_line(
        "startup",
        &format!("loaded {} command template(s)", templates.len()),
    );

    log_line("startup", "3/4 parsing the servers file...");
    let catalog = load_catalog(config_dir)?;

    Ok((settings, catalog))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config_dir } => {
            let (settings, catalog) = load_everything(&config_dir)?;
            log_line("startup", "4/4 connecting to the gateway...");
            run_bot(settings, catalog, config_dir)
        }

        Command::Check { config_dir } => {
            let (settings, catalog) = load_everything(&config_dir)?;
            println!("prefix: {}", settings.prefix);
            println!("guild: {}", settings.guild_id);
            for target in catalog.targets() {
                println!(
                    "server '{}' at {} (user '{}'), {} head admin / {} admin / {} moderator command(s)",
                    target.name,
                    target.working_path.display(),
                    target.privilege_user,
                    target.authorized(Tier::HeadAdmin).len(),
                    target.authorized(Tier::Admin).len(),
                    target.authorized(Tier::Moderator).len(),
                );
            }
            Ok(())
        }
    }
}

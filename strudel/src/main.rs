//! Command line access to the local state of a strudel client.
//!
//! Manages the persisted accounts and prints settings drafts.  Relays are not contacted,
//! the client runs against an empty in-process relay set.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use n0_snafu::Result;
use strudel::{
    Account, Client, Config, MemRelays, SettingsSync,
    base::{PublicKey, RelayUrl, SecretKey},
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Manage strudel accounts and settings.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Manage accounts.
    #[clap(subcommand)]
    Accounts(AccountsCommand),
    /// Inspect settings.
    #[clap(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Subcommand, Debug, Clone)]
enum AccountsCommand {
    /// List all accounts, the current one is marked with `*`.
    List,
    /// Add a read-only account.
    AddPubkey {
        pubkey: PublicKey,
        /// Relays of the account.
        #[clap(long = "relay")]
        relays: Vec<RelayUrl>,
    },
    /// Add a local account for a hex encoded secret key, or a new key if none is given.
    AddLocal { secret: Option<SecretKey> },
    /// Remove an account.
    Remove { pubkey: PublicKey },
    /// Make an account current.
    Switch { pubkey: PublicKey },
    /// Log out of the current account.
    Logout {
        /// Also remove the account.
        #[clap(long)]
        clear: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum SettingsCommand {
    /// Print the settings of the current account.
    Show,
    /// Print the unsigned record storing the settings of the current account.
    Draft,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    debug!(?config, "loaded config");
    let client = Client::builder(MemRelays::new())
        .config(config)
        .spawn()
        .await?;
    let res = run(&client, cli.command);
    client.shutdown();
    res
}

fn run(client: &Client, command: Command) -> Result<()> {
    let accounts = client.accounts();
    match command {
        Command::Accounts(AccountsCommand::List) => {
            let current = accounts.current().value().map(|a| a.pubkey);
            for account in accounts.accounts().value() {
                let marker = if Some(account.pubkey) == current {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {} {}", account.pubkey, account.kind.name());
            }
            if accounts.is_ghost().value() {
                if let Some(pubkey) = current {
                    println!("* {pubkey} ghost");
                }
            }
        }
        Command::Accounts(AccountsCommand::AddPubkey { pubkey, relays }) => {
            let mut account = Account::read_only(pubkey);
            if !relays.is_empty() {
                account = account.with_relays(relays);
            }
            accounts.add_account(account)?;
            println!("added {pubkey}");
        }
        Command::Accounts(AccountsCommand::AddLocal { secret }) => {
            let secret = secret.unwrap_or_else(|| SecretKey::generate(&mut rand::rngs::OsRng));
            let account = client.add_local_account(&secret)?;
            println!("added {}", account.pubkey);
        }
        Command::Accounts(AccountsCommand::Remove { pubkey }) => {
            accounts.remove_account(&pubkey)?;
            println!("removed {pubkey}");
        }
        Command::Accounts(AccountsCommand::Switch { pubkey }) => {
            if !accounts.has_account(&pubkey) {
                snafu::whatever!("unknown account {pubkey}");
            }
            accounts.switch_account(&pubkey)?;
            println!("switched to {pubkey}");
        }
        Command::Accounts(AccountsCommand::Logout { clear }) => {
            accounts.logout(clear)?;
            println!("logged out");
        }
        Command::Settings(SettingsCommand::Show) => {
            let settings = client.app_settings().value();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Settings(SettingsCommand::Draft) => {
            let draft = SettingsSync::build_settings_record(&client.app_settings().value())?;
            println!("{}", serde_json::to_string_pretty(&draft)?);
        }
    }
    Ok(())
}

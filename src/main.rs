use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};

use mailsync::prelude::*;
use mailsync::sync::SyncMode;

#[derive(Parser)]
#[command(name = "mailsync", about = "Mirror IMAP accounts into a local store")]
struct Cli {
    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register an account (or refresh its connection parameters).
    AddAccount {
        #[arg(long)]
        email: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 993)]
        port: u16,
        /// IMAP login; defaults to the email address.
        #[arg(long)]
        user: Option<String>,
        #[arg(long, env = "MAILSYNC_PASSWORD")]
        password: String,
    },
    /// Stop syncing an account without deleting its local data.
    DisableAccount {
        #[arg(long)]
        email: String,
    },
    /// Run one sync pass, for one account or all active ones.
    Sync {
        #[arg(long)]
        email: Option<String>,
        /// Force a strategy instead of letting folder state decide.
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        /// Override the configured messages-per-batch for this run.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the configured wall-clock budget for this run.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Show the most recent run per account.
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Initial,
    Incremental,
}

impl From<Mode> for SyncMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Initial => SyncMode::Initial,
            Mode::Incremental => SyncMode::Incremental,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }

    let store = Store::connect(&settings.database_url).await?;
    let secrets = if settings.encryption_key.is_empty() {
        None
    } else {
        Some(SecretBox::from_hex_key(&settings.encryption_key)?)
    };

    match cli.command {
        Command::AddAccount {
            email,
            host,
            port,
            user,
            password,
        } => {
            let stored = match &secrets {
                Some(sb) => sb.encrypt(&password)?,
                None => password,
            };
            let user = user.unwrap_or_else(|| email.clone());
            let id = store
                .upsert_account(&email, &host, port, &user, &stored)
                .await?;
            info!("Account {} registered (id {})", email, id);
        }
        Command::DisableAccount { email } => {
            let account = store
                .account_by_email(&email)
                .await?
                .ok_or_else(|| SyncError::AccountNotFound(email.clone()))?;
            store.deactivate_account(account.id).await?;
            info!("Account {} disabled", email);
        }
        Command::Sync {
            email,
            mode,
            batch_size,
            timeout_secs,
        } => {
            let mut sync_settings = settings.sync;
            if let Some(batch) = batch_size {
                sync_settings.initial_batch = batch;
                sync_settings.incremental_batch = batch;
            }
            if let Some(secs) = timeout_secs {
                sync_settings.initial_budget_secs = secs;
                sync_settings.incremental_budget_secs = secs;
            }
            let engine = SyncEngine::new(store.clone(), sync_settings, secrets);
            match email {
                Some(email) => {
                    let account = store
                        .account_by_email(&email)
                        .await?
                        .ok_or_else(|| SyncError::AccountNotFound(email.clone()))?;
                    let report = match engine.sync_account(&account, mode.map(Into::into)).await {
                        Ok(report) => report,
                        Err(e) => {
                            error!("{}", e.user_message());
                            return Err(e);
                        }
                    };
                    info!(
                        "{}: {} run {} ({} processed, {} new, {} folders)",
                        email,
                        report.mode.as_str(),
                        report.status.as_str(),
                        report.processed,
                        report.new_messages,
                        report.folders_synced
                    );
                }
                None => {
                    let reports = engine.sync_all().await?;
                    info!("Synced {} account(s)", reports.len());
                }
            }
        }
        Command::Status => {
            for account in store.active_accounts().await? {
                match store.latest_run(account.id).await? {
                    Some(run) => info!(
                        "{}: {} {} started {} ({} processed, {} new{})",
                        account.email,
                        run.mode,
                        run.status,
                        run.started_at,
                        run.processed,
                        run.new_messages,
                        run.error
                            .map(|e| format!(", error: {}", e))
                            .unwrap_or_default()
                    ),
                    None => info!("{}: never synced", account.email),
                }
            }
        }
    }
    Ok(())
}

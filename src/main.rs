use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailmirror", version, about = "Local replica of a Gmail mailbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Database file (defaults to the settings file, then the data dir)
    #[arg(long, global = true, env = "MAILMIRROR_DB")]
    db: Option<PathBuf>,

    /// Account to sync (defaults to `email` in the settings file)
    #[arg(long, global = true, env = "MAILMIRROR_ACCOUNT")]
    account: Option<String>,

    /// Settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the local replica up to date
    Sync(SyncArgs),
    /// List labels, system labels first
    Labels,
    /// List messages carrying a label, newest first
    List(ListArgs),
    /// Most frequent correspondents
    Contacts(ContactsArgs),
    /// Show replica counts and the stored cursor
    Status,
    /// Manage stored credentials
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Rebuild from a full listing instead of the change feed
    #[arg(long, default_value_t = false)]
    full: bool,
    /// Keep syncing on the configured interval until interrupted
    #[arg(long, default_value_t = false)]
    watch: bool,
    /// Override the refresh interval in seconds
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, default_value = "INBOX")]
    label: String,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Args)]
struct ContactsArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
enum AuthCommands {
    /// Store a refresh token for the account
    SetToken { refresh_token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};

    use mailmirror::auth::token_store::parse_key_hex;
    use mailmirror::auth::{
        ClientSecrets, CredentialProvider, EncryptedFileTokenStore, OAuthCredentialProvider,
        StaticCredential, TokenStore,
    };
    use mailmirror::config::{self, Settings};
    use mailmirror::connectors::GmailApiConnector;
    use mailmirror::db::Database;
    use mailmirror::output::{self, OutputFormat};
    use mailmirror::sync::{SyncEngine, SyncEvent, SyncScheduler};

    use super::{AuthCommands, Cli, Commands};

    const ACCESS_TOKEN_ENV: &str = "MAILMIRROR_ACCESS_TOKEN";
    const TOKEN_KEY_ENV: &str = "MAILMIRROR_TOKEN_KEY";

    struct AppContext {
        settings: Settings,
        db_path: PathBuf,
        account: Option<String>,
        format: OutputFormat,
    }

    impl AppContext {
        fn load(cli: &Cli) -> Result<Self> {
            let config_path = match &cli.config {
                Some(path) => path.clone(),
                None => config::config_path()?,
            };
            let settings = Settings::load_or_init(&config_path)?;
            let db_path = match &cli.db {
                Some(path) => path.clone(),
                None => settings
                    .resolve_db_path()
                    .context("resolve mailmirror database path")?,
            };
            let account = cli
                .account
                .clone()
                .or_else(|| settings.email.clone())
                .map(|account| account.trim().to_string())
                .filter(|account| !account.is_empty());

            Ok(Self {
                settings,
                db_path,
                account,
                format: OutputFormat::from_json_flag(cli.json),
            })
        }

        fn open_db(&self) -> Result<Database> {
            Database::open(&self.db_path)
                .with_context(|| format!("open mailmirror database at {}", self.db_path.display()))
        }

        fn require_account(&self) -> Result<&str> {
            self.account.as_deref().ok_or_else(|| {
                anyhow!("no account configured (set `email` in the settings file or pass --account)")
            })
        }

        fn token_store(&self) -> Result<EncryptedFileTokenStore> {
            let key = std::env::var(TOKEN_KEY_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| parse_key_hex(&value))
                .transpose()
                .with_context(|| format!("{TOKEN_KEY_ENV} must be 64 hex characters (32 bytes)"))?;
            Ok(EncryptedFileTokenStore::new(config::token_store_path()?, key))
        }

        fn credentials(&self) -> Result<Arc<dyn CredentialProvider>> {
            if let Some(token) = std::env::var(ACCESS_TOKEN_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty())
            {
                return Ok(Arc::new(StaticCredential::new(token.trim())));
            }

            let account = self.require_account()?.to_string();
            let secrets_path = self.settings.resolve_client_secrets_path()?;
            let secrets = ClientSecrets::load(&secrets_path)
                .with_context(|| format!("load client secrets from {}", secrets_path.display()))?;
            let store: Arc<dyn TokenStore> = Arc::new(self.token_store()?);
            Ok(Arc::new(OAuthCredentialProvider::new(secrets, account, store)))
        }
    }

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let ctx = AppContext::load(&cli)?;
        match cli.command {
            Commands::Sync(args) => handle_sync(&ctx, args).await,
            Commands::Labels => handle_labels(&ctx),
            Commands::List(args) => handle_list(&ctx, args),
            Commands::Contacts(args) => handle_contacts(&ctx, args),
            Commands::Status => handle_status(&ctx),
            Commands::Auth { command } => handle_auth(&ctx, command),
        }
    }

    async fn handle_sync(ctx: &AppContext, args: super::SyncArgs) -> Result<()> {
        let db = Arc::new(ctx.open_db()?);
        let transport = GmailApiConnector::new(ctx.credentials()?);
        let engine = Arc::new(
            SyncEngine::new(db, transport).with_max_recent(ctx.settings.max_messages_cached),
        );

        if args.full || !args.watch {
            let outcome = if args.full {
                engine.full_sync().await
            } else {
                engine.sync().await
            }
            .context("sync mailbox")?;
            println!("{}", output::format_outcome(ctx.format, &outcome)?);
        }

        if !args.watch {
            return Ok(());
        }

        let period = args
            .interval
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or_else(|| ctx.settings.refresh_interval());
        let (scheduler, mut events) = SyncScheduler::new(engine);
        let format = ctx.format;

        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SyncEvent::Completed(outcome) => match output::format_outcome(format, &outcome) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(error) => eprintln!("render sync outcome: {error}"),
                    },
                    SyncEvent::Failed(error) => eprintln!("sync failed: {error}"),
                }
            }
        });

        eprintln!("watching mailbox every {}s, ctrl-c to stop", period.as_secs());
        tokio::select! {
            _ = scheduler.run_periodic(period) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
            }
        }

        scheduler.shutdown().await;
        drop(scheduler);
        printer.await.context("join outcome printer")?;
        Ok(())
    }

    fn handle_labels(ctx: &AppContext) -> Result<()> {
        let db = ctx.open_db()?;
        let labels = db.list_labels().context("list labels")?;
        println!("{}", output::format_labels(ctx.format, &labels)?);
        Ok(())
    }

    fn handle_list(ctx: &AppContext, args: super::ListArgs) -> Result<()> {
        let db = ctx.open_db()?;
        let messages = db
            .list_by_label(&args.label, args.limit, args.offset)
            .with_context(|| format!("list messages in {}", args.label))?;
        println!("{}", output::format_messages(ctx.format, &messages)?);
        Ok(())
    }

    fn handle_contacts(ctx: &AppContext, args: super::ContactsArgs) -> Result<()> {
        let db = ctx.open_db()?;
        let contacts = db.top_contacts(args.limit).context("rank contacts")?;
        println!("{}", output::format_contacts(ctx.format, &contacts)?);
        Ok(())
    }

    fn handle_status(ctx: &AppContext) -> Result<()> {
        let db = ctx.open_db()?;
        let stats = db.stats().context("read replica stats")?;
        println!("{}", output::format_stats(ctx.format, &stats)?);
        Ok(())
    }

    fn handle_auth(ctx: &AppContext, command: AuthCommands) -> Result<()> {
        match command {
            AuthCommands::SetToken { refresh_token } => {
                let account = ctx.require_account()?;
                let token = refresh_token.trim();
                if token.is_empty() {
                    return Err(anyhow!("refresh token must not be empty"));
                }
                let store = ctx.token_store()?;
                store
                    .set_refresh_token(account, token)
                    .with_context(|| format!("store refresh token in {}", store.path().display()))?;
                println!("Stored refresh token for {account}");
                Ok(())
            }
        }
    }
}

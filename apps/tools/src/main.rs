use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use jsonwebtoken::{encode, EncodingKey, Header};
use server_api::{channels, users, ApiContext};
use shared::{
    domain::{UserId, UserRole},
    error::{ApiError, ApiException},
    protocol::{CreateChannelRequest, SessionClaims},
};
use storage::{Storage, StoredUser};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Operational tasks against the chat database")]
struct Cli {
    #[arg(long, env = "APP__DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Make sure `general` exists, owned by the given admin.
    SeedGeneral {
        admin_email: String,
        #[arg(long, default_value = "")]
        admin_name: String,
    },
    /// Create a user (or re-sync an existing one) and join them to `general`.
    CreateUser {
        email: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    CreateChannel {
        creator_email: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        private: bool,
    },
    /// Grant the global admin role.
    PromoteAdmin { email: String },
    /// Print a session token for local testing.
    MintToken {
        email: String,
        #[arg(long, env = "APP__SESSION_SECRET")]
        secret: String,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
}

fn api_err(err: ApiError) -> anyhow::Error {
    ApiException::from(err).into()
}

async fn user_by_email(storage: &Storage, email: &str) -> Result<StoredUser> {
    storage
        .user_by_email(&email.trim().to_lowercase())
        .await?
        .ok_or_else(|| anyhow!("no user with email {email}"))
}

fn mint_token(user_id: UserId, email: &str, secret: &str, ttl_hours: i64) -> Result<String> {
    let claims = SessionClaims::new(
        user_id,
        email,
        Utc::now() + Duration::hours(ttl_hours.max(1)),
    );
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to sign session token")
}

async fn run(ctx: &ApiContext, command: Command) -> Result<String> {
    let output = match command {
        Command::SeedGeneral {
            admin_email,
            admin_name,
        } => {
            let admin = users::sync_user(ctx, &admin_email, &admin_name)
                .await
                .map_err(api_err)?;
            ctx.storage.set_user_role(admin.id, UserRole::Admin).await?;
            let general = ctx
                .storage
                .channel_by_name(shared::domain::GENERAL_CHANNEL)
                .await?
                .ok_or_else(|| anyhow!("general channel missing after sync"))?;
            info!(channel_id = general.id.0, admin_id = admin.id.0, "general seeded");
            format!("general channel_id={} admin_id={}", general.id, admin.id)
        }
        Command::CreateUser { email, name } => {
            let user = users::sync_user(ctx, &email, &name)
                .await
                .map_err(api_err)?;
            format!("user_id={} email={}", user.id, user.email)
        }
        Command::CreateChannel {
            creator_email,
            name,
            description,
            private,
        } => {
            let creator = user_by_email(&ctx.storage, &creator_email).await?;
            let channel = channels::create_channel(
                ctx,
                creator.id,
                CreateChannelRequest {
                    name,
                    description,
                    is_private: private,
                },
            )
            .await
            .map_err(api_err)?;
            format!("channel_id={} name={}", channel.id, channel.name)
        }
        Command::PromoteAdmin { email } => {
            let user = user_by_email(&ctx.storage, &email).await?;
            ctx.storage.set_user_role(user.id, UserRole::Admin).await?;
            format!("user_id={} is now admin", user.id)
        }
        Command::MintToken {
            email,
            secret,
            ttl_hours,
        } => {
            let user = user_by_email(&ctx.storage, &email).await?;
            mint_token(user.id, &user.email, &secret, ttl_hours)?
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;
    let ctx = ApiContext::new(storage);
    println!("{}", run(&ctx, cli.command).await?);
    Ok(())
}

//! Subcommand handlers.

use std::sync::Arc;

use paydash_core::AuthContext;
use paydash_core::auth::account::{CustomerRegistration, PasswordReset};
use paydash_core::config::ClientConfig;
use paydash_core::guard::GuardDecision;
use paydash_core::models::session::format_expiry;
use paydash_core::navigation::MemoryNavigator;
use paydash_core::observer::SessionObserver;
use paydash_core::storage::FileStorage;
use paydash_core::transport::HttpResponse;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::{Error, Result};

pub async fn execute(cli: Cli) -> Result<()> {
    if let Commands::Version = cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        println!("paydash_core {}", paydash_core::version());
        return Ok(());
    }

    let ctx = context(&cli)?;
    match cli.command {
        Commands::Login { email, password } => {
            let session = ctx.accounts.login(&email, &password).await?;
            print_json(&json!({
                "email": email,
                "is_staff": session.is_staff.unwrap_or(false),
                "expires_at": format_expiry(&session.tokens.expires_at),
            }));
        }
        Commands::Logout => {
            ctx.accounts.logout();
            println!("signed out");
        }
        Commands::Status { route } => print_json(&status_report(&ctx, &route)),
        Commands::Refresh => {
            if !ctx.sessions.refresh().await {
                return Err(Error::Custom("refresh failed; session cleared".into()));
            }
            let expires_at = ctx.store.expiry().map(|at| format_expiry(&at));
            print_json(&json!({ "refreshed": true, "expires_at": expires_at }));
        }
        Commands::Get { path } => print_response(ctx.api.get(&path).await?)?,
        Commands::Post { path, body } => {
            let body: Value = serde_json::from_str(&body)?;
            print_response(ctx.api.post_json(&path, body).await?)?;
        }
        Commands::SendOtp { email } => print_json(&ctx.accounts.send_otp(&email).await?),
        Commands::ResetPassword {
            email,
            otp,
            password,
        } => {
            let reset = PasswordReset {
                email,
                otp,
                password,
            };
            print_json(&ctx.accounts.reset_password(&reset).await?);
        }
        Commands::Register {
            email,
            password,
            first_name,
            last_name,
            phone,
        } => {
            let registration = CustomerRegistration {
                email,
                password,
                first_name,
                last_name,
                phone,
                extra: Map::new(),
            };
            print_json(&ctx.accounts.register_customer(&registration).await?);
        }
        Commands::Activate { token } => {
            print_json(&ctx.accounts.activate_account(&token).await?)
        }
        Commands::Version => {}
    }
    Ok(())
}

fn context(cli: &Cli) -> Result<AuthContext> {
    let mut config = ClientConfig::from_env()?;
    if let Some(base) = &cli.api_base {
        config = config.with_api_base(base)?;
    }

    let path = cli
        .session_file
        .clone()
        .unwrap_or_else(FileStorage::default_path);
    info!(session_file = %path.display(), api_base = %config.api_base, "using session");

    let observer = SessionObserver::new();
    let storage = Arc::new(FileStorage::new(path).with_observer(observer.clone()));
    let navigator = Arc::new(MemoryNavigator::new(config.routes.landing_route()));
    Ok(AuthContext::with_reqwest(config, storage, observer, navigator)?)
}

/// Session facts plus the guard's verdict for `route`.
pub fn status_report(ctx: &AuthContext, route: &str) -> Value {
    let decision = ctx.guard.on_route_change(route);
    let (verdict, redirect_to) = match decision {
        GuardDecision::Render => ("render", None),
        GuardDecision::Redirect(to) => ("redirect", Some(to)),
    };
    json!({
        "authenticated": ctx.validator.is_authenticated(),
        "is_staff": ctx.validator.is_staff(),
        "expires_at": ctx.store.expiry().map(|at| format_expiry(&at)),
        "access_expired": ctx.validator.is_access_expired(),
        "refresh_expired": ctx.validator.is_refresh_expired(),
        "user": ctx.store.user().and_then(|u| u.email().map(str::to_string)),
        "route": route,
        "decision": verdict,
        "redirect_to": redirect_to,
    })
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

fn print_response(response: HttpResponse) -> Result<()> {
    info!(status = response.status.as_u16(), "response");
    match response.json::<Value>() {
        Ok(body) => print_json(&body),
        Err(_) => println!("{}", response.text()),
    }
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::Status {
            status: response.status.as_u16(),
        })
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "paydash", version, about = "Paydash merchant dashboard client")]
pub struct Cli {
    /// Session file (defaults to `<data dir>/paydash/session.json`).
    #[arg(long, global = true, env = "PAYDASH_SESSION_FILE")]
    pub session_file: Option<PathBuf>,

    /// Backend base URL.
    #[arg(long, global = true, env = "PAYDASH_API_BASE")]
    pub api_base: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in and store the session.
    Login {
        email: String,
        #[arg(long, env = "PAYDASH_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Clear the stored session.
    Logout,

    /// Show the stored session and what the guard would do on a route.
    Status {
        /// Route to evaluate.
        #[arg(long, default_value = "/dashboard")]
        route: String,
    },

    /// Rotate the token pair now.
    Refresh,

    /// Authenticated GET; prints the response body.
    Get { path: String },

    /// Authenticated POST of a JSON body; prints the response body.
    Post { path: String, body: String },

    /// Request a password-reset code by e-mail.
    SendOtp { email: String },

    /// Set a new password with a code from `send-otp`.
    ResetPassword {
        email: String,
        #[arg(long)]
        otp: String,
        #[arg(long, env = "PAYDASH_NEW_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Register a customer account.
    Register {
        email: String,
        #[arg(long, env = "PAYDASH_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Activate an account with the token from the activation e-mail.
    Activate { token: String },

    /// Print version information.
    Version,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_login_with_global_flags() {
        let cli = Cli::try_parse_from([
            "paydash",
            "login",
            "ops@example.com",
            "--password",
            "secret",
            "--session-file",
            "/tmp/session.json",
        ])
        .unwrap();
        assert_eq!(cli.session_file, Some(PathBuf::from("/tmp/session.json")));
        match cli.command {
            Commands::Login { email, password } => {
                assert_eq!(email, "ops@example.com");
                assert_eq!(password, "secret");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn status_defaults_to_landing_route() {
        let cli = Cli::try_parse_from(["paydash", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { route } if route == "/dashboard"));
    }

    #[test]
    fn post_takes_path_and_body() {
        let payload = r#"{"amount":10}"#;
        let cli = Cli::try_parse_from(["paydash", "post", "api/v1/payouts", payload]).unwrap();
        match cli.command {
            Commands::Post { path, body } => {
                assert_eq!(path, "api/v1/payouts");
                assert_eq!(body, payload);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

//! Maps validated CLI arguments to an action.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{codes, jwks, tokens, ARG_DSN, ARG_PORT};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .filter(|dsn| !dsn.trim().is_empty())
        .cloned();

    let token_opts = tokens::Options::parse(matches)?;
    let code_opts = codes::Options::parse(matches);
    let jwks_opts = jwks::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        dsn,
        jwt_private_key_path: token_opts.jwt_private_key_path,
        jwt_key_id: token_opts.jwt_key_id,
        jwt_retired_public_keys: token_opts.jwt_retired_public_keys,
        issuer: token_opts.issuer,
        audience: token_opts.audience,
        access_token_ttl_seconds: token_opts.access_token_ttl_seconds,
        refresh_token_ttl_seconds: token_opts.refresh_token_ttl_seconds,
        session_ttl_seconds: token_opts.session_ttl_seconds,
        frontend_base_url: token_opts.frontend_base_url,
        iam_encryption_key: token_opts.iam_encryption_key,
        otp_ttl_seconds: code_opts.otp_ttl_seconds,
        otp_max_per_window: code_opts.otp_max_per_window,
        code_window_seconds: code_opts.window_seconds,
        email_token_ttl_seconds: code_opts.email_token_ttl_seconds,
        email_max_per_window: code_opts.email_max_per_window,
        jwks_url: jwks_opts.url,
        jwks_ttl_seconds: jwks_opts.ttl_seconds,
        jwks_refresh_per_minute: jwks_opts.refresh_per_minute,
    }))
}

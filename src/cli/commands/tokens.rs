use anyhow::{Context, Result};
use clap::{builder::ValueParser, Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_JWT_PRIVATE_KEY_PATH: &str = "jwt-private-key-path";
pub const ARG_JWT_KEY_ID: &str = "jwt-key-id";
pub const ARG_JWT_RETIRED_PUBLIC_KEY: &str = "jwt-retired-public-key";
pub const ARG_ISSUER: &str = "issuer";
pub const ARG_AUDIENCE: &str = "audience";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_IAM_ENCRYPTION_KEY: &str = "iam-encryption-key";

/// A public key still published after its private half stopped signing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetiredKey {
    pub kid: String,
    pub path: String,
}

fn parse_retired_key(value: &str) -> Result<RetiredKey, String> {
    match value.trim().split_once('=') {
        Some((kid, path)) if !kid.trim().is_empty() && !path.trim().is_empty() => Ok(RetiredKey {
            kid: kid.trim().to_string(),
            path: path.trim().to_string(),
        }),
        _ => Err(format!("expected KID=PATH, got {value:?}")),
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_PRIVATE_KEY_PATH)
                .long(ARG_JWT_PRIVATE_KEY_PATH)
                .help("Path to the RSA private key (PEM or DER) used to sign access tokens")
                .env("GATEHOUSE_JWT_PRIVATE_KEY_PATH")
                .required(true),
        )
        .arg(
            Arg::new(ARG_JWT_KEY_ID)
                .long(ARG_JWT_KEY_ID)
                .help("Key ID published in the JWKS and stamped on tokens")
                .env("GATEHOUSE_JWT_KEY_ID")
                .default_value("gatehouse-1"),
        )
        .arg(
            Arg::new(ARG_JWT_RETIRED_PUBLIC_KEY)
                .long(ARG_JWT_RETIRED_PUBLIC_KEY)
                .help("Previous signing key kept in the JWKS, as KID=PATH to its public key (repeatable)")
                .env("GATEHOUSE_JWT_RETIRED_PUBLIC_KEYS")
                .action(ArgAction::Append)
                .value_delimiter(',')
                .value_parser(ValueParser::from(parse_retired_key)),
        )
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Issuer (iss) of access tokens")
                .env("GATEHOUSE_ISSUER")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_AUDIENCE)
                .long(ARG_AUDIENCE)
                .help("Audience required on bearer tokens presented to this service")
                .env("GATEHOUSE_AUDIENCE"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("GATEHOUSE_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token lifetime in seconds")
                .env("GATEHOUSE_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Session cookie TTL in seconds")
                .env("GATEHOUSE_SESSION_TTL_SECONDS")
                .default_value("43200")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL used for the login page, CORS and email links")
                .env("GATEHOUSE_FRONTEND_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_IAM_ENCRYPTION_KEY)
                .long(ARG_IAM_ENCRYPTION_KEY)
                .help("Base64 32-byte key encrypting provider client secrets at rest")
                .env("GATEHOUSE_IAM_ENCRYPTION_KEY")
                .hide_env_values(true)
                .required(true),
        )
}

#[derive(Debug)]
pub struct Options {
    pub jwt_private_key_path: String,
    pub jwt_key_id: String,
    pub jwt_retired_public_keys: Vec<RetiredKey>,
    pub issuer: String,
    pub audience: Option<String>,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub session_ttl_seconds: u64,
    pub frontend_base_url: String,
    pub iam_encryption_key: SecretString,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let string = |id: &str| matches.get_one::<String>(id).cloned();
        let seconds = |id: &str| matches.get_one::<u64>(id).copied();

        Ok(Self {
            jwt_private_key_path: string(ARG_JWT_PRIVATE_KEY_PATH)
                .context("missing required argument: --jwt-private-key-path")?,
            jwt_key_id: string(ARG_JWT_KEY_ID).unwrap_or_else(|| "gatehouse-1".to_string()),
            jwt_retired_public_keys: matches
                .get_many::<RetiredKey>(ARG_JWT_RETIRED_PUBLIC_KEY)
                .map(|keys| keys.cloned().collect())
                .unwrap_or_default(),
            issuer: string(ARG_ISSUER).unwrap_or_else(|| "http://localhost:8080".to_string()),
            audience: string(ARG_AUDIENCE),
            access_token_ttl_seconds: seconds(ARG_ACCESS_TOKEN_TTL).unwrap_or(900),
            refresh_token_ttl_seconds: seconds(ARG_REFRESH_TOKEN_TTL).unwrap_or(2_592_000),
            session_ttl_seconds: seconds(ARG_SESSION_TTL).unwrap_or(43_200),
            frontend_base_url: string(ARG_FRONTEND_BASE_URL)
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            iam_encryption_key: string(ARG_IAM_ENCRYPTION_KEY)
                .map(SecretString::from)
                .context("missing required argument: --iam-encryption-key")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_keys_from_flags_and_env() {
        assert!(parse_retired_key("old.pem").is_err());
        assert!(parse_retired_key("=old.pem").is_err());

        let with_required = |extra: &[&str]| {
            let mut args = vec!["gatehouse"];
            args.extend_from_slice(extra);
            crate::cli::commands::new().get_matches_from(args)
        };
        temp_env::with_vars(
            [
                ("GATEHOUSE_JWT_PRIVATE_KEY_PATH", Some("/etc/gatehouse/jwt.pem")),
                (
                    "GATEHOUSE_IAM_ENCRYPTION_KEY",
                    Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
                ),
                ("GATEHOUSE_JWT_RETIRED_PUBLIC_KEYS", None),
            ],
            || {
                let matches = with_required(&[
                    "--jwt-retired-public-key",
                    "2024=/keys/2024.pub",
                    "--jwt-retired-public-key",
                    "2023 = /keys/2023.pub",
                ]);
                let options = Options::parse(&matches).unwrap();
                assert_eq!(
                    options.jwt_retired_public_keys,
                    vec![
                        RetiredKey {
                            kid: "2024".to_string(),
                            path: "/keys/2024.pub".to_string(),
                        },
                        RetiredKey {
                            kid: "2023".to_string(),
                            path: "/keys/2023.pub".to_string(),
                        },
                    ]
                );

                let options = Options::parse(&with_required(&[])).unwrap();
                assert!(options.jwt_retired_public_keys.is_empty());
            },
        );
        temp_env::with_vars(
            [
                ("GATEHOUSE_JWT_PRIVATE_KEY_PATH", Some("/etc/gatehouse/jwt.pem")),
                (
                    "GATEHOUSE_IAM_ENCRYPTION_KEY",
                    Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
                ),
                (
                    "GATEHOUSE_JWT_RETIRED_PUBLIC_KEYS",
                    Some("a=/keys/a.pub,b=/keys/b.pub"),
                ),
            ],
            || {
                let options = Options::parse(&with_required(&[])).unwrap();
                let kids: Vec<&str> = options
                    .jwt_retired_public_keys
                    .iter()
                    .map(|key| key.kid.as_str())
                    .collect();
                assert_eq!(kids, ["a", "b"]);
            },
        );
    }
}

use clap::{Arg, ArgMatches, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("jwks-url")
                .long("jwks-url")
                .help("Remote JWKS for bearer verification (defaults to the local signing key)")
                .env("GATEHOUSE_JWKS_URL"),
        )
        .arg(
            Arg::new("jwks-ttl-seconds")
                .long("jwks-ttl-seconds")
                .help("How long a fetched key set is trusted, in seconds")
                .env("GATEHOUSE_JWKS_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("jwks-refresh-per-minute")
                .long("jwks-refresh-per-minute")
                .help("Maximum forced key set refreshes per minute")
                .env("GATEHOUSE_JWKS_REFRESH_PER_MINUTE")
                .default_value("3")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub url: Option<String>,
    pub ttl_seconds: u64,
    pub refresh_per_minute: usize,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            url: matches.get_one::<String>("jwks-url").cloned(),
            ttl_seconds: matches.get_one::<u64>("jwks-ttl-seconds").copied().unwrap_or(300),
            refresh_per_minute: matches
                .get_one::<usize>("jwks-refresh-per-minute")
                .copied()
                .unwrap_or(3),
        }
    }
}

use clap::{Arg, ArgMatches, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("otp-ttl-seconds")
                .long("otp-ttl-seconds")
                .help("Login code lifetime in seconds")
                .env("GATEHOUSE_OTP_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("otp-max-per-window")
                .long("otp-max-per-window")
                .help("Login codes a user may request per window")
                .env("GATEHOUSE_OTP_MAX_PER_WINDOW")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("otp-window-seconds")
                .long("otp-window-seconds")
                .help("Sliding window for the code issuance limit, in seconds")
                .env("GATEHOUSE_OTP_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-token-ttl-seconds")
                .long("email-token-ttl-seconds")
                .help("Email verification link lifetime in seconds")
                .env("GATEHOUSE_EMAIL_TOKEN_TTL_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-max-per-window")
                .long("email-max-per-window")
                .help("Verification emails a user may request per window")
                .env("GATEHOUSE_EMAIL_MAX_PER_WINDOW")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub otp_ttl_seconds: u64,
    pub otp_max_per_window: u32,
    pub window_seconds: u64,
    pub email_token_ttl_seconds: u64,
    pub email_max_per_window: u32,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            otp_ttl_seconds: matches.get_one::<u64>("otp-ttl-seconds").copied().unwrap_or(300),
            otp_max_per_window: matches
                .get_one::<u32>("otp-max-per-window")
                .copied()
                .unwrap_or(3),
            window_seconds: matches
                .get_one::<u64>("otp-window-seconds")
                .copied()
                .unwrap_or(900),
            email_token_ttl_seconds: matches
                .get_one::<u64>("email-token-ttl-seconds")
                .copied()
                .unwrap_or(1800),
            email_max_per_window: matches
                .get_one::<u32>("email-max-per-window")
                .copied()
                .unwrap_or(3),
        }
    }
}

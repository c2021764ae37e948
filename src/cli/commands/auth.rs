use clap::{Arg, ArgAction, Command};

pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_ACCESS_TTL: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL: &str = "refresh-ttl-seconds";
pub const ARG_RESET_TTL: &str = "reset-token-ttl-seconds";
pub const ARG_VERIFICATION_TTL: &str = "verification-token-ttl-seconds";
pub const ARG_OTP_TTL: &str = "otp-ttl-seconds";
pub const ARG_MAX_LOGIN_ATTEMPTS: &str = "max-login-attempts";
pub const ARG_MAX_IP_ATTEMPTS: &str = "max-ip-attempts";
pub const ARG_LOGIN_WINDOW: &str = "login-window-seconds";
pub const ARG_MEMORY_RATE_LIMIT: &str = "memory-rate-limit";
pub const ARG_STORE_TIMEOUT: &str = "store-timeout-seconds";
pub const ARG_PRUNE_INTERVAL: &str = "prune-interval-seconds";
pub const ARG_MAIL_WEBHOOK_URL: &str = "mail-webhook-url";
pub const ARG_TRUST_FORWARDED_FOR: &str = "trust-forwarded-for";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_rate_limit_args(command);
    with_delivery_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token lifetime in seconds")
                .env("CREDO_ACCESS_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token lifetime in seconds")
                .env("CREDO_REFRESH_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RESET_TTL)
                .long(ARG_RESET_TTL)
                .help("Password reset link lifetime in seconds")
                .env("CREDO_RESET_TOKEN_TTL_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_VERIFICATION_TTL)
                .long(ARG_VERIFICATION_TTL)
                .help("Email verification link lifetime in seconds")
                .env("CREDO_VERIFICATION_TOKEN_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_OTP_TTL)
                .long(ARG_OTP_TTL)
                .help("One-time code lifetime in seconds")
                .env("CREDO_OTP_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_LOGIN_ATTEMPTS)
                .long(ARG_MAX_LOGIN_ATTEMPTS)
                .help("Failed logins per identifier before refusing")
                .env("CREDO_MAX_LOGIN_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_IP_ATTEMPTS)
                .long(ARG_MAX_IP_ATTEMPTS)
                .help("Failed logins per client IP before refusing")
                .env("CREDO_MAX_IP_ATTEMPTS")
                .default_value("20")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_WINDOW)
                .long(ARG_LOGIN_WINDOW)
                .help("Sliding window for failed logins in seconds")
                .env("CREDO_LOGIN_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MEMORY_RATE_LIMIT)
                .long(ARG_MEMORY_RATE_LIMIT)
                .help("Count failed logins in process memory instead of the database")
                .env("CREDO_MEMORY_RATE_LIMIT")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_TRUST_FORWARDED_FOR)
                .long(ARG_TRUST_FORWARDED_FOR)
                .help("Take client addresses from X-Forwarded-For (only behind a trusted proxy)")
                .env("CREDO_TRUST_FORWARDED_FOR")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_STORE_TIMEOUT)
                .long(ARG_STORE_TIMEOUT)
                .help("Deadline for a single store call in seconds")
                .env("CREDO_STORE_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_PRUNE_INTERVAL)
                .long(ARG_PRUNE_INTERVAL)
                .help("How often expired tokens and attempts are deleted, in seconds")
                .env("CREDO_PRUNE_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_delivery_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL used for verification and reset links")
                .env("CREDO_FRONTEND_BASE_URL")
                .default_value("http://localhost:3000"),
        )
        .arg(
            Arg::new(ARG_MAIL_WEBHOOK_URL)
                .long(ARG_MAIL_WEBHOOK_URL)
                .help("Endpoint receiving outbound emails as JSON (default: log only)")
                .env("CREDO_MAIL_WEBHOOK_URL"),
        )
}

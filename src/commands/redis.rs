//! Typed arguments for `redis-cli`.
//!
//! Output is requested in `--raw` form so replies parse as plain lines. The
//! password is forwarded as `REDISCLI_AUTH`.

use crate::command::AdminCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisCommand {
    /// Unix time of the last successful save
    LastSave,
    /// Start a background RDB save
    BgSave,
    /// Iterate keys matching a glob pattern (one key per line)
    Scan { pattern: String },
    /// Remaining TTL: `-1` no expiry, `-2` missing key
    Ttl { key: String },
    Expire { key: String, seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCliArgs {
    pub password: Option<String>,
    pub command: RedisCommand,
}

impl RedisCliArgs {
    pub fn new(password: Option<String>, command: RedisCommand) -> Self {
        Self { password, command }
    }
}

impl AdminCommand for RedisCliArgs {
    fn program(&self) -> &'static str {
        "redis-cli"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["--raw".to_string()];
        match &self.command {
            RedisCommand::LastSave => args.push("LASTSAVE".to_string()),
            RedisCommand::BgSave => args.push("BGSAVE".to_string()),
            RedisCommand::Scan { pattern } => {
                args.extend(["--scan".to_string(), "--pattern".to_string(), pattern.clone()]);
            }
            RedisCommand::Ttl { key } => args.extend(["TTL".to_string(), key.clone()]),
            RedisCommand::Expire { key, seconds } => {
                args.extend(["EXPIRE".to_string(), key.clone(), seconds.to_string()]);
            }
        }
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.password
            .iter()
            .map(|p| ("REDISCLI_AUTH".to_string(), p.clone()))
            .collect()
    }
}

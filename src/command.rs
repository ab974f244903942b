//! Type-safe administrative command contracts.
//!
//! Backends are driven exclusively through administrative tools that live
//! inside their containers (`pg_dump`, `psql`, `redis-cli`, `tar`, `find`,
//! `curl`). Instead of raw string vectors, each tool invocation is a struct
//! implementing [`AdminCommand`], so the argv a backend sees is decided in
//! one place and can be unit-tested without a container.
//!
//! # Design Goals
//!
//! 1. **Single Source of Truth**: the struct definition IS the contract.
//! 2. **Secrets stay out of argv**: credentials travel as environment
//!    variables, which never show up in `ps` output or logs.
//! 3. **Validated identifiers**: table names, key patterns and paths are
//!    checked when configuration loads, so rendering never fails.

/// Trait for typed administrative command arguments.
///
/// # Contract
///
/// - `program()`: executable name inside the container
/// - `to_cli_args()`: arguments exactly as the tool expects them
/// - `get_env_vars()`: environment the tool needs (credentials)
pub trait AdminCommand {
    fn program(&self) -> &'static str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Loggable form: program and arguments, never environment values
    fn describe(&self) -> String {
        let args = self.to_cli_args();
        if args.is_empty() {
            self.program().to_string()
        } else {
            format!("{} {}", self.program(), args.join(" "))
        }
    }
}

//! Typed arguments for `curl` against a backend's local admin API.

use strum::{Display, EnumString};

use crate::command::AdminCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

/// Silent request that fails on HTTP errors and prints the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurlArgs {
    pub method: HttpMethod,
    pub url: String,
}

impl CurlArgs {
    pub fn new(method: HttpMethod, base: &str, path: &str) -> Self {
        Self {
            method,
            url: format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/')),
        }
    }
}

impl AdminCommand for CurlArgs {
    fn program(&self) -> &'static str {
        "curl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-sS".to_string(),
            "--fail".to_string(),
            "-X".to_string(),
            self.method.to_string(),
            self.url.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_and_argv() {
        let curl = CurlArgs::new(HttpMethod::Post, "http://localhost:6333/", "/collections/docs/snapshots");
        assert_eq!(
            curl.to_cli_args(),
            vec!["-sS", "--fail", "-X", "POST", "http://localhost:6333/collections/docs/snapshots"]
        );
        assert_eq!(curl.describe(), "curl -sS --fail -X POST http://localhost:6333/collections/docs/snapshots");
    }
}

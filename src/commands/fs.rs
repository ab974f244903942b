//! Typed arguments for in-container filesystem tools.
//!
//! | Struct        | Program | Purpose                                  |
//! |---------------|---------|------------------------------------------|
//! | `TarArgs`     | `tar`   | stream an uncompressed archive to stdout |
//! | `CatArgs`     | `cat`   | stream one file to stdout                |
//! | `ListDirArgs` | `ls`    | names in a directory, one per line       |
//! | `FindArgs`    | `find`  | files with modification times            |
//! | `RemoveArgs`  | `rm`    | delete files                             |

use crate::command::AdminCommand;

/// `find -printf` format: epoch seconds (fractional), tab, path
pub const MTIME_AND_PATH: &str = "%T@\\t%p\\n";

/// `tar -C <directory> -cf - [--exclude=..] <members>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarArgs {
    pub directory: String,
    pub members: Vec<String>,
    pub excludes: Vec<String>,
}

impl TarArgs {
    /// Whole-directory archive
    pub fn directory(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            members: vec![".".to_string()],
            excludes: Vec::new(),
        }
    }

    pub fn excluding(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }
}

impl AdminCommand for TarArgs {
    fn program(&self) -> &'static str {
        "tar"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "-C".to_string(),
            self.directory.clone(),
            "-cf".to_string(),
            "-".to_string(),
        ];
        args.extend(self.excludes.iter().map(|e| format!("--exclude={}", e)));
        args.extend(self.members.iter().cloned());
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatArgs {
    pub path: String,
}

impl AdminCommand for CatArgs {
    fn program(&self) -> &'static str {
        "cat"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.path.clone()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDirArgs {
    pub path: String,
}

impl AdminCommand for ListDirArgs {
    fn program(&self) -> &'static str {
        "ls"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-1A".to_string(), self.path.clone()]
    }
}

/// Regular files below `root` printed as [`MTIME_AND_PATH`] lines.
///
/// With `path_patterns` set, only files matching one of the `-path` globs
/// are printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindArgs {
    pub root: String,
    pub min_depth: Option<u32>,
    pub path_patterns: Vec<String>,
}

impl FindArgs {
    pub fn files(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            min_depth: None,
            path_patterns: Vec::new(),
        }
    }
}

impl AdminCommand for FindArgs {
    fn program(&self) -> &'static str {
        "find"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![self.root.clone()];
        if let Some(depth) = self.min_depth {
            args.extend(["-mindepth".to_string(), depth.to_string()]);
        }
        args.extend(["-type".to_string(), "f".to_string()]);
        if !self.path_patterns.is_empty() {
            args.push("(".to_string());
            for (i, pattern) in self.path_patterns.iter().enumerate() {
                if i > 0 {
                    args.push("-o".to_string());
                }
                args.extend(["-path".to_string(), pattern.clone()]);
            }
            args.push(")".to_string());
        }
        args.extend(["-printf".to_string(), MTIME_AND_PATH.to_string()]);
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveArgs {
    pub paths: Vec<String>,
}

impl AdminCommand for RemoveArgs {
    fn program(&self) -> &'static str {
        "rm"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-f".to_string(), "--".to_string()];
        args.extend(self.paths.iter().cloned());
        args
    }
}

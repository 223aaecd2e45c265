//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and scripted stand-ins for
//! the control-plane server.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Uses the test writer so output is captured per test.
    ///
    /// ```bash
    /// RUST_LOG=studio_rpc=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer() // Ensures logs don't interfere with test output
                .with_target(true) // Include module paths in logs
                .with_thread_ids(true) // Include thread IDs for async debugging
                .compact() // Use compact format for test readability
                .try_init()
                .ok(); // Ignore errors if already initialized by another test
        });
    }
}

/// Shell scripts that play the control-plane server in process-level tests
#[cfg(test)]
pub mod scripts {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Answers every request line with `{"jsonrpc":"2.0","id":N,"result":"ok"}`
    pub const RESPONDER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\).*/\1/p')
  [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":"ok"}\n' "$id"
done
"#;

    /// Prints its working directory to stderr, then behaves like `RESPONDER`
    pub const PWD_REPORTER: &str = r#"#!/bin/sh
pwd >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\).*/\1/p')
  [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":"ok"}\n' "$id"
done
"#;

    /// Temporary directory holding executable scripts, removed on drop
    pub struct ScriptDir {
        dir: TempDir,
    }

    impl ScriptDir {
        pub fn new() -> io::Result<Self> {
            Ok(Self {
                dir: TempDir::new()?,
            })
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        /// Write `body` to `name` and mark it executable
        pub fn write_script(&self, name: &str, body: &str) -> io::Result<PathBuf> {
            let path = self.dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, body)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
            }

            Ok(path)
        }
    }

    /// Quote a path for a command line, escaping embedded quotes
    pub fn quoted(path: &Path) -> String {
        format!("\"{}\"", path.display().to_string().replace('"', "\\\""))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::io::command::CommandLine;

        #[test]
        fn test_script_is_executable_and_resolvable() {
            let scripts = ScriptDir::new().unwrap();
            let path = scripts
                .write_script("with space/server.sh", RESPONDER)
                .unwrap();

            let command = CommandLine::parse(&format!("{} --stdio", quoted(&path))).unwrap();
            assert!(path.starts_with(scripts.path()));
            assert_eq!(command.program, path.display().to_string());
            assert_eq!(command.resolve_program().unwrap(), path);
        }
    }
}

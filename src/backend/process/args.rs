//! Server command line construction.

use std::path::{Path, PathBuf};

use crate::world::WorldSpec;

pub(super) const SERVER_JAR: &str = "HytaleServer.jar";
const AOT_CACHE: &str = "HytaleServer.aot";

/// Resolved locations for one world's server files.
#[derive(Debug, Clone)]
pub(super) struct ServerPaths {
    pub server_dir: PathBuf,
    pub assets: PathBuf,
}

impl ServerPaths {
    pub fn jar(&self) -> PathBuf {
        self.server_dir.join(SERVER_JAR)
    }

    fn aot_cache(&self) -> PathBuf {
        self.server_dir.join(AOT_CACHE)
    }
}

/// Build the `java` argument vector for a world.
///
/// The AOT cache flag is only added when the cache file exists on disk.
pub(super) fn server_args(spec: &WorldSpec, paths: &ServerPaths, bind_host: &str) -> Vec<String> {
    let mut args = vec![
        format!("-Xms{}", spec.memory.half()),
        format!("-Xmx{}", spec.memory),
    ];

    if spec.process.aot_cache {
        let aot = paths.aot_cache();
        if aot.is_file() {
            args.push(format!("-XX:AOTCache={}", aot.display()));
        }
    }

    args.extend([
        "-jar".to_string(),
        display(&paths.jar()),
        "--assets".to_string(),
        display(&paths.assets),
        "--bind".to_string(),
        format!("{bind_host}:{}", spec.port),
        "--auth-mode".to_string(),
        spec.process.auth_mode.as_str().to_string(),
    ]);

    if spec.process.disable_sentry {
        args.push("--disable-sentry".to_string());
    }

    if let Some(backup) = &spec.process.backup {
        args.push("--backup".to_string());
        if let Some(dir) = &backup.dir {
            args.push("--backup-dir".to_string());
            args.push(display(dir));
        }
        args.push("--backup-frequency".to_string());
        args.push(backup.frequency_minutes.to_string());
    }

    args
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

use anyhow::{Result, anyhow};
use directories::{BaseDirs, UserDirs};
use std::{fs, path::PathBuf};

/// `$XDG_RUNTIME_DIR`, falling back to `~/.local/run`.
pub fn runtime_dir() -> Result<PathBuf> {
    let dir = match BaseDirs::new().and_then(|b| b.runtime_dir().map(|p| p.to_path_buf())) {
        Some(d) => d,
        None => {
            let user = UserDirs::new().ok_or_else(|| anyhow!("cannot determine home directory"))?;
            user.home_dir().join(".local").join("run")
        }
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("tiltwipe.sock"))
}

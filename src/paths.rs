//! Layout of the session store:
//!
//! ```text
//! <home>/tmp/
//! ├── {projectHash}/
//! │   └── chats/
//! │       ├── session-<...>.json
//! │       └── session-<...>.json
//! ```

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CHATS_DIR_NAME: &str = "chats";
const SESSION_FILE_PREFIX: &str = "session-";
const SESSION_FILE_SUFFIX: &str = ".json";

pub fn is_session_file_name(name: &OsStr) -> bool {
    name.to_str().is_some_and(|name| {
        name.starts_with(SESSION_FILE_PREFIX) && name.ends_with(SESSION_FILE_SUFFIX)
    })
}

/// Every `<root>/<hash>/chats` directory that currently exists.
pub fn chats_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = fs::read_dir(root) else {
        return Vec::new();
    };

    read_dir
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| entry.path().join(CHATS_DIR_NAME))
        .filter(|chats| chats.exists())
        .collect()
}

/// The chats directory of a newly seen project directory, if it has one yet.
pub fn probe_chats_dir(project_dir: &Path) -> Option<PathBuf> {
    let chats = project_dir.join(CHATS_DIR_NAME);
    chats.is_dir().then_some(chats)
}

/// Session files directly inside a chats directory.
pub fn read_session_files(chats_dir: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(fs::read_dir(chats_dir)?
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter(|entry| is_session_file_name(&entry.file_name()))
        .map(|entry| entry.path())
        .collect())
}

/// [`read_session_files`], listing an unreadable directory as empty.
pub fn list_session_files(chats_dir: &Path) -> Vec<PathBuf> {
    read_session_files(chats_dir).unwrap_or_default()
}

/// True when `path` names a session file inside `chats_dir`.
pub fn is_session_file_in(chats_dir: &Path, path: &Path) -> bool {
    path.parent() == Some(chats_dir) && path.file_name().is_some_and(is_session_file_name)
}

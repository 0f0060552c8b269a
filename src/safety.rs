//! C1: safety classification of executables and configuration files.
//!
//! Ported from `safety_check`/`daemon_path_is_safe` in the original
//! `libslack` `daemon(1)`: a path is safe iff no directory component
//! (following symlinks) and no final file is group- or world-writable.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

const DEFAULT_ROOT_PATH: &str = "/bin:/usr/bin";
const DEFAULT_USER_PATH: &str = ":/bin:/usr/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Unsafe(String),
}

fn group_or_world_writable(meta: &fs::Metadata) -> bool {
    meta.permissions().mode() & 0o022 != 0
}

/// Checks that every component of `path` (after resolving symlinks) and the
/// final entry itself are not group- or world-writable.
pub fn path_is_safe(path: &Path) -> io::Result<Verdict> {
    let resolved = fs::canonicalize(path)?;

    // Check the file/dir itself, then walk up through every ancestor.
    let meta = fs::metadata(&resolved)?;
    if group_or_world_writable(&meta) {
        return Ok(Verdict::Unsafe(format!(
            "{} is group- or world-writable",
            resolved.display()
        )));
    }

    let mut cur = resolved.as_path();
    while let Some(parent) = cur.parent() {
        let meta = fs::metadata(parent)?;
        if group_or_world_writable(&meta) {
            return Ok(Verdict::Unsafe(format!(
                "{} is group- or world-writable",
                parent.display()
            )));
        }
        cur = parent;
        if parent.parent().is_none() {
            break;
        }
    }

    Ok(Verdict::Safe)
}

fn default_path(euid: u32) -> &'static str {
    if euid == 0 {
        DEFAULT_ROOT_PATH
    } else {
        DEFAULT_USER_PATH
    }
}

/// Reads up to 256 bytes of `path` and, if it begins with `#!`, returns the
/// interpreter token (and, if the interpreter is `/usr/bin/env`, the command
/// word that follows it).
fn shebang_interpreter(path: &Path) -> io::Result<Option<(String, Option<String>)>> {
    use std::io::Read;

    let mut buf = [0u8; 256];
    let mut file = fs::File::open(path)?;
    let n = file.read(&mut buf)?;
    if n < 2 || &buf[0..2] != b"#!" {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf[2..n]);
    let line_end = text.find(['\n']).unwrap_or(text.len());
    let line = &text[..line_end];
    let mut words = line.split_whitespace();
    let interpreter = match words.next() {
        Some(w) => w.to_string(),
        None => return Ok(None),
    };
    if interpreter == "/usr/bin/env" {
        Ok(Some((interpreter, words.next().map(|s| s.to_string()))))
    } else {
        Ok(Some((interpreter, None)))
    }
}

/// Searches `$PATH` (falling back to the hard-coded default) for an
/// executable named `cmd`, applying the same `EACCES`-continues,
/// `ENOEXEC`-stops semantics as the coprocess launcher's own search so that
/// safety classification agrees with what will actually be exec'd.
pub fn search_path(cmd: &str, euid: u32) -> io::Result<Option<PathBuf>> {
    let path_var = std::env::var("PATH").unwrap_or_else(|_| default_path(euid).to_string());
    for dir in path_var.split(':') {
        let candidate = if dir.is_empty() {
            PathBuf::from(".").join(cmd)
        } else {
            PathBuf::from(dir).join(cmd)
        };
        match fs::metadata(&candidate) {
            Ok(meta) if meta.permissions().mode() & 0o111 != 0 => return Ok(Some(candidate)),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) if e.raw_os_error() == Some(libc::EACCES) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Full safety check for an executable: path safety plus, for scripts,
/// interpreter safety (recursively, through `/usr/bin/env`).
pub fn is_safe_executable(cmd: &str, euid: u32) -> io::Result<Verdict> {
    let resolved: PathBuf = if cmd.contains('/') {
        PathBuf::from(cmd)
    } else {
        match search_path(cmd, euid)? {
            Some(p) => p,
            None => return Ok(Verdict::Unsafe(format!("{cmd}: not found on $PATH"))),
        }
    };

    match path_is_safe(&resolved)? {
        Verdict::Unsafe(reason) => return Ok(Verdict::Unsafe(reason)),
        Verdict::Safe => {}
    }

    if let Some((interpreter, env_cmd)) = shebang_interpreter(&resolved)? {
        match path_is_safe(Path::new(&interpreter))? {
            Verdict::Unsafe(reason) => return Ok(Verdict::Unsafe(reason)),
            Verdict::Safe => {}
        }
        if let Some(env_cmd) = env_cmd {
            match is_safe_executable(&env_cmd, euid)? {
                Verdict::Unsafe(reason) => return Ok(Verdict::Unsafe(reason)),
                Verdict::Safe => {}
            }
        }
    }

    Ok(Verdict::Safe)
}

/// Whether safety enforcement applies at all, per spec.md §4.1: enforced
/// when real uid is 0 and `--unsafe` was not passed, or when `--safe` was
/// passed explicitly.
pub fn enforcement_applies(real_uid: u32, unsafe_flag: bool, safe_flag: bool) -> bool {
    (real_uid == 0 && !unsafe_flag) || safe_flag
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;

    #[test]
    fn world_writable_file_is_unsafe() {
        let dir = std::env::temp_dir().join(format!("daemon-safety-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("x");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o777)).unwrap();
        match path_is_safe(&file).unwrap() {
            Verdict::Unsafe(_) => (),
            Verdict::Safe => panic!("expected unsafe"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn private_file_is_safe() {
        let dir = std::env::temp_dir().join(format!("daemon-safety-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        let file = dir.join("y");
        std::fs::write(&file, b"ok").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(path_is_safe(&file).unwrap(), Verdict::Safe);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn enforcement_rules() {
        assert!(enforcement_applies(0, false, false));
        assert!(!enforcement_applies(0, true, false));
        assert!(!enforcement_applies(1000, false, false));
        assert!(enforcement_applies(1000, false, true));
    }
}

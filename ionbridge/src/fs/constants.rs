//! The platform's open-flag and mode constant table.
//!
//! Clients of the IPC surface cannot include platform headers, so the
//! service exposes the conventional `O_*`/`S_*`/`*_OK` integers by name.

use serde_json::{Map, Value};

/// Name → value pairs for every constant the platform defines.
pub fn constants() -> Vec<(&'static str, i64)> {
    let mut table: Vec<(&'static str, i64)> = vec![
        ("O_RDONLY", libc::O_RDONLY as i64),
        ("O_WRONLY", libc::O_WRONLY as i64),
        ("O_RDWR", libc::O_RDWR as i64),
        ("O_APPEND", libc::O_APPEND as i64),
        ("O_CLOEXEC", libc::O_CLOEXEC as i64),
        ("O_CREAT", libc::O_CREAT as i64),
        ("O_DIRECTORY", libc::O_DIRECTORY as i64),
        ("O_EXCL", libc::O_EXCL as i64),
        ("O_NOCTTY", libc::O_NOCTTY as i64),
        ("O_NOFOLLOW", libc::O_NOFOLLOW as i64),
        ("O_NONBLOCK", libc::O_NONBLOCK as i64),
        ("O_NDELAY", libc::O_NDELAY as i64),
        ("O_SYNC", libc::O_SYNC as i64),
        ("O_TRUNC", libc::O_TRUNC as i64),
        ("S_IFMT", libc::S_IFMT as i64),
        ("S_IFREG", libc::S_IFREG as i64),
        ("S_IFDIR", libc::S_IFDIR as i64),
        ("S_IFCHR", libc::S_IFCHR as i64),
        ("S_IFBLK", libc::S_IFBLK as i64),
        ("S_IFIFO", libc::S_IFIFO as i64),
        ("S_IFLNK", libc::S_IFLNK as i64),
        ("S_IFSOCK", libc::S_IFSOCK as i64),
        ("S_IRWXU", libc::S_IRWXU as i64),
        ("S_IRUSR", libc::S_IRUSR as i64),
        ("S_IWUSR", libc::S_IWUSR as i64),
        ("S_IXUSR", libc::S_IXUSR as i64),
        ("S_IRWXG", libc::S_IRWXG as i64),
        ("S_IRGRP", libc::S_IRGRP as i64),
        ("S_IWGRP", libc::S_IWGRP as i64),
        ("S_IXGRP", libc::S_IXGRP as i64),
        ("S_IRWXO", libc::S_IRWXO as i64),
        ("S_IROTH", libc::S_IROTH as i64),
        ("S_IWOTH", libc::S_IWOTH as i64),
        ("S_IXOTH", libc::S_IXOTH as i64),
        ("F_OK", libc::F_OK as i64),
        ("R_OK", libc::R_OK as i64),
        ("W_OK", libc::W_OK as i64),
        ("X_OK", libc::X_OK as i64),
    ];

    #[cfg(target_os = "linux")]
    table.extend_from_slice(&[
        ("O_DIRECT", libc::O_DIRECT as i64),
        ("O_DSYNC", libc::O_DSYNC as i64),
        ("O_NOATIME", libc::O_NOATIME as i64),
        ("O_PATH", libc::O_PATH as i64),
        ("O_TMPFILE", libc::O_TMPFILE as i64),
    ]);

    table
}

/// The constant table as a JSON object.
pub fn constants_json() -> Value {
    let mut map = Map::new();
    for (name, value) in constants() {
        map.insert(name.to_string(), Value::from(value));
    }
    Value::Object(map)
}

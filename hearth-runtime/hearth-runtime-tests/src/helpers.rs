use lazy_static::lazy_static;
use std::io::Write;
use std::sync::RwLock;
use tempfile::NamedTempFile;

lazy_static! {
    static ref EXCLUSIVE_TEST: RwLock<()> = RwLock::default();
}

/// Run a test non-exclusively with other `test_nonex` tests.
#[allow(dead_code)]
pub fn test_nonex<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    // ignore poisoning left behind by a failed test
    let lock = EXCLUSIVE_TEST.read().unwrap_or_else(|e| e.into_inner());
    let r = f();
    drop(lock);
    r
}

/// Run a test exclusively, so that no other `test_nonex` or `test_ex` tests will run concurrently.
///
/// This function _must_ wrap any tests that use `fork`.
#[allow(dead_code)]
pub fn test_ex<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let lock = EXCLUSIVE_TEST.write().unwrap_or_else(|e| e.into_inner());
    let r = f();
    drop(lock);
    r
}

/// Write `source` to a fresh temporary file. The file is removed when the handle is dropped.
pub fn script_file(source: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("hearth-script")
        .suffix(".hs")
        .tempfile()
        .expect("can create a script file");
    file.write_all(source.as_bytes())
        .expect("can write the script file");
    file.flush().expect("can flush the script file");
    file
}

/// Shared libraries that exist on most Linux systems but are not extension images.
pub fn system_library() -> Option<&'static str> {
    const CANDIDATES: &[&str] = &[
        "/lib/x86_64-linux-gnu/libc.so.6",
        "/usr/lib/x86_64-linux-gnu/libc.so.6",
        "/lib/aarch64-linux-gnu/libc.so.6",
        "/usr/lib/aarch64-linux-gnu/libc.so.6",
        "/lib64/libc.so.6",
        "/usr/lib64/libc.so.6",
        "/usr/lib/libc.so.6",
    ];
    CANDIDATES
        .iter()
        .copied()
        .find(|p| std::path::Path::new(p).exists())
}

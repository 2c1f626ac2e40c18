//! Test support for paths that end the process.

use std::{
    env,
    process::{Command, Output},
};

const ISOLATED_TEST: &str = "UTHREAD_RT_ISOLATED_TEST";

/// Runs the test `name` alone in a child copy of the test binary.
///
/// In the parent this returns the child's output. In the child it runs `body`
/// and returns `None`; `body` is expected to end the process itself.
pub(crate) fn isolated(name: &str, body: impl FnOnce()) -> Option<Output> {
    if env::var_os(ISOLATED_TEST).is_some_and(|test| test == name) {
        body();
        return None;
    }

    let exe = env::current_exe().expect("test binary should be locatable");
    let output = Command::new(exe)
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(ISOLATED_TEST, name)
        .output()
        .expect("child test run should start");
    Some(output)
}

/// The child's standard output, lossily decoded.
pub(crate) fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

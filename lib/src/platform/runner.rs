//! The `Runner` capability: every external-process invocation in the
//! engine goes through here, never `std::process::Command` directly,
//! so tests can substitute a scripted recorder.

use std::fmt::Debug;

use anyhow::Result;

use crate::task::Task;

/// Runs external commands. `run` is the common case; `run_with_env`
/// injects extra environment variables (used for hook scripts);
/// `run_quiet` is `run` with stdout discarded. Cancellation of
/// long-running children (OCI pulls) is checked by the caller between
/// polling points, not by the runner itself.
pub(crate) trait Runner: Debug {
    fn run(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;

    fn run_with_env(
        &self,
        description: &str,
        cmd: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<Vec<u8>>;

    /// Run to completion, discarding stdout.
    fn run_quiet(&self, description: &str, cmd: &str, args: &[&str]) -> Result<()> {
        self.run(description, cmd, args).map(|_| ())
    }
}

/// The production implementation: each call becomes one [`Task`].
#[derive(Debug, Default)]
pub(crate) struct ProdRunner;

impl Runner for ProdRunner {
    fn run(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        Task::new(description, cmd).args(args).read_bytes()
    }

    fn run_with_env(
        &self,
        description: &str,
        cmd: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<Vec<u8>> {
        let mut task = Task::new(description, cmd).args(args);
        for (k, v) in env {
            task = task.env(k, v);
        }
        task.read_bytes()
    }
}

/// Bridges the engine's [`Runner`] to the narrower contract
/// `slate-blockdev` expects, so the disk partitioner can be exercised
/// against the same recording fake as everything else.
impl slate_blockdev::Runner for ProdRunner {
    fn run_capture(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        Runner::run(self, description, cmd, args)
    }
}

#[cfg(test)]
mod test_runner {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// A single scripted response: matched against the command name
    /// only (tests don't usually care about exact argv), returning
    /// either a canned stdout or a canned failure.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedCall {
        pub(crate) program: String,
        pub(crate) result: std::result::Result<Vec<u8>, String>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct TestRunner {
        script: RefCell<VecDeque<ScriptedCall>>,
        pub(crate) calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl TestRunner {
        pub(crate) fn push_ok(&self, program: &str, stdout: impl Into<Vec<u8>>) {
            self.script.borrow_mut().push_back(ScriptedCall {
                program: program.to_string(),
                result: Ok(stdout.into()),
            });
        }

        pub(crate) fn push_err(&self, program: &str, message: &str) {
            self.script.borrow_mut().push_back(ScriptedCall {
                program: program.to_string(),
                result: Err(message.to_string()),
            });
        }
    }

    impl Runner for TestRunner {
        fn run(&self, _description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
            self.calls
                .borrow_mut()
                .push((cmd.to_string(), args.iter().map(|s| s.to_string()).collect()));
            let next = self.script.borrow_mut().pop_front();
            match next {
                Some(call) if call.program == cmd => call.result.map_err(|e| anyhow::anyhow!(e)),
                Some(call) => {
                    anyhow::bail!("expected scripted call to {}, got {cmd}", call.program)
                }
                None => Ok(Vec::new()),
            }
        }

        fn run_with_env(
            &self,
            description: &str,
            cmd: &str,
            args: &[&str],
            _env: &[(&str, &str)],
        ) -> Result<Vec<u8>> {
            self.run(description, cmd, args)
        }
    }

    impl slate_blockdev::Runner for TestRunner {
        fn run_capture(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
            Runner::run(self, description, cmd, args)
        }
    }

    #[test]
    fn test_scripted_success() {
        let r = TestRunner::default();
        r.push_ok("lsblk", "[]");
        let out = Runner::run(&r, "listing", "lsblk", &["-J"]).unwrap();
        assert_eq!(out, b"[]");
        assert_eq!(r.calls.borrow().len(), 1);
    }

    #[test]
    fn test_scripted_failure() {
        let r = TestRunner::default();
        r.push_err("mkfs.ext4", "device busy");
        assert!(Runner::run(&r, "formatting", "mkfs.ext4", &["/dev/x"]).is_err());
    }
}

#[cfg(test)]
pub(crate) use test_runner::TestRunner;

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("{program} exited with status {code}")]
    Failed { program: String, code: i32 },
}

/// Run an external tool and return its stdout. The child is killed if it is
/// still running after `timeout`.
pub async fn run_async(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    let spawn_error = |source| CommandError::Spawn {
        program: program.to_string(),
        source,
    };
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| CommandError::TimedOut {
            program: program.to_string(),
            timeout,
        })?
        .map_err(spawn_error)?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            code: output.status.code().unwrap_or(-1),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Blocking form of [`run_async`] for synchronous callers.
///
/// Reuses the surrounding multi-thread runtime when there is one (the daemon
/// calls this from `spawn_blocking`), otherwise drives a throwaway
/// current-thread runtime. Must not be called from async code.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    if let Ok(handle) = Handle::try_current() {
        if handle.runtime_flavor() == RuntimeFlavor::MultiThread {
            return handle.block_on(run_async(program, args, timeout));
        }
    }
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;
    runtime.block_on(run_async(program, args, timeout))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run_with_timeout("sh", &["-c", "echo hello"], Duration::from_secs(5)).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn large_output_does_not_stall() {
        let out = run_with_timeout(
            "sh",
            &["-c", "head -c 200000 /dev/zero | tr '\\0' a"],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.len(), 200_000);
    }

    #[test]
    fn reports_missing_program() {
        let err = run_with_timeout("definitely-not-a-real-tool", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = run_with_timeout("sh", &["-c", "exit 3"], Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, CommandError::Failed { code: 3, .. }));
    }

    #[test]
    fn kills_slow_programs() {
        let started = Instant::now();
        let err = run_with_timeout("sh", &["-c", "sleep 5"], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn async_runner_times_out() {
        let started = Instant::now();
        let err = run_async("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn blocking_runner_reuses_multi_thread_runtime() {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        let out = runtime
            .block_on(async move {
                tokio::task::spawn_blocking(move || {
                    assert_eq!(handle.runtime_flavor(), RuntimeFlavor::MultiThread);
                    run_with_timeout("sh", &["-c", "echo shared"], Duration::from_secs(5))
                })
                .await
            })
            .unwrap()
            .unwrap();
        assert_eq!(out.trim(), "shared");
    }
}

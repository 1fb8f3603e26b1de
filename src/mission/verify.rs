//! Verification subprocess.
//!
//! The operator's verify command runs under `sh -c` in the lead's working
//! directory. Pass iff it launches and exits zero; captured stdout and
//! stderr are concatenated with a newline and trimmed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Wall-clock deadline on one verification run.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Cap on captured output, per stream.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Result of one verification run.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub output: String,
}

/// Run the verify command to completion or deadline.
pub async fn run_verify(command: &str, cwd: &Path) -> VerifyOutcome {
    let mut shell = tokio::process::Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match shell.spawn() {
        Ok(child) => child,
        Err(error) => {
            return VerifyOutcome {
                passed: false,
                output: format!("failed to launch verify command: {error}"),
            };
        }
    };

    match tokio::time::timeout(VERIFY_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = capped_lossy(&output.stdout);
            let stderr = capped_lossy(&output.stderr);
            VerifyOutcome {
                passed: output.status.success(),
                output: format!("{stdout}\n{stderr}").trim().to_string(),
            }
        }
        Ok(Err(error)) => VerifyOutcome {
            passed: false,
            output: format!("failed to capture verify output: {error}"),
        },
        // Dropping the wait future kills the child via kill_on_drop.
        Err(_) => VerifyOutcome {
            passed: false,
            output: format!("verify command exceeded {VERIFY_TIMEOUT:?}"),
        },
    }
}

fn capped_lossy(bytes: &[u8]) -> String {
    let capped = &bytes[..bytes.len().min(MAX_CAPTURE_BYTES)];
    String::from_utf8_lossy(capped).into_owned()
}

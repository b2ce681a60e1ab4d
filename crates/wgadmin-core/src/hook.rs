//! Lifecycle hook scripts (`PreUp`, `PostUp`, `PreDown`, `PostDown`).

use std::fmt;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, TunnelError};

/// Placeholder replaced by the live interface name.
pub const INTERFACE_PLACEHOLDER: &str = "%i";

/// Environment variable carrying the live interface name.
pub const INTERFACE_ENV: &str = "WIREGUARD_INTERFACE";

/// Lifecycle point a hook runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookStage {
    /// Before the device is created.
    PreUp,
    /// After the tunnel is configured.
    PostUp,
    /// Before teardown.
    PreDown,
    /// After teardown.
    PostDown,
}

impl HookStage {
    /// All stages in file order.
    pub const ALL: [Self; 4] = [Self::PreUp, Self::PostUp, Self::PreDown, Self::PostDown];

    /// True for the stages whose failure aborts a start.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::PreUp | Self::PostUp)
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreUp => f.write_str("PreUp"),
            Self::PostUp => f.write_str("PostUp"),
            Self::PreDown => f.write_str("PreDown"),
            Self::PostDown => f.write_str("PostDown"),
        }
    }
}

/// Replaces every `%i` in `script` with `interface`.
#[must_use]
pub fn substitute_interface(script: &str, interface: &str) -> String {
    script.replace(INTERFACE_PLACEHOLDER, interface)
}

/// Runs hook scripts through a shell.
#[derive(Debug, Clone)]
pub struct HookRunner {
    shell: String,
}

impl HookRunner {
    /// Creates a runner that invokes scripts as `<shell> -c <script>`.
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }

    /// Runs `script` for `stage` against `interface`.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Hook` if the shell cannot be spawned or the
    /// script exits non-zero.
    pub async fn run(&self, stage: HookStage, script: &str, interface: &str) -> Result<()> {
        let command = substitute_interface(script, interface);
        info!(interface = %interface, stage = %stage, "running hook");
        debug!(command = %command, "hook command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&command)
            .env(INTERFACE_ENV, interface)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TunnelError::hook(stage, format!("failed to spawn {}: {e}", self.shell)))?;

        if !output.stdout.is_empty() {
            debug!(stage = %stage, stdout = %String::from_utf8_lossy(&output.stdout).trim_end(), "hook output");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::hook(
                stage,
                format!("{}: {}", output.status, stderr.trim_end()),
            ));
        }
        Ok(())
    }
}

impl Default for HookRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_substituted_everywhere() {
        assert_eq!(
            substitute_interface("ip link set %i up && echo %i", "wg7"),
            "ip link set wg7 up && echo wg7"
        );
    }

    #[test]
    fn stage_display_matches_file_keys() {
        let names: Vec<String> = HookStage::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["PreUp", "PostUp", "PreDown", "PostDown"]);
    }

    #[test]
    fn only_up_stages_are_fatal() {
        assert!(HookStage::PreUp.is_fatal());
        assert!(HookStage::PostUp.is_fatal());
        assert!(!HookStage::PreDown.is_fatal());
        assert!(!HookStage::PostDown.is_fatal());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_sees_interface_in_env_and_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");
        let script = format!("echo \"%i $WIREGUARD_INTERFACE\" > {}", out.display());
        HookRunner::default()
            .run(HookStage::PostUp, &script, "wg3")
            .await
            .expect("hook runs");
        let written = std::fs::read_to_string(out).expect("read");
        assert_eq!(written.trim(), "wg3 wg3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_hook_error() {
        let err = HookRunner::default()
            .run(HookStage::PreUp, "echo boom >&2; exit 3", "wg0")
            .await
            .expect_err("should fail");
        match err {
            TunnelError::Hook { stage, reason } => {
                assert_eq!(stage, HookStage::PreUp);
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_shell_is_hook_error() {
        let err = HookRunner::new("/nonexistent/shell")
            .run(HookStage::PostDown, "true", "wg0")
            .await
            .expect_err("should fail");
        assert!(matches!(err, TunnelError::Hook { stage: HookStage::PostDown, .. }));
    }
}

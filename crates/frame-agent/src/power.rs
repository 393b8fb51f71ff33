use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use shell_command::{CommandRunner, shell_runner};
use tracing::{debug, warn};

use crate::screensaver::PowerAction;

/// How the screen is switched. Either part may be omitted but not both.
#[derive(Debug, Clone, Default)]
pub struct PowerPlan {
    pub relay: Option<RelayPulse>,
    pub on_command: Option<String>,
    pub off_command: Option<String>,
}

/// Momentary relay wired across the monitor's power button. Every pulse
/// toggles the monitor, so the same pulse serves both directions.
#[derive(Debug, Clone)]
pub struct RelayPulse {
    pub value_path: PathBuf,
    pub pulse: Duration,
}

#[derive(Debug, Clone)]
pub struct PowerReport {
    pub action: PowerAction,
    pub relay: Option<RelayExecution>,
    pub commands: Vec<CommandExecution>,
}

impl PowerReport {
    pub fn success(&self) -> bool {
        self.relay.as_ref().is_some_and(|r| r.success) || self.commands.iter().any(|c| c.success)
    }
}

#[derive(Debug, Clone)]
pub struct RelayExecution {
    pub path: PathBuf,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandExecution {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

#[derive(Clone)]
pub struct PowerSwitch {
    plan: Arc<PowerPlan>,
    runner: CommandRunner,
}

impl fmt::Debug for PowerSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerSwitch")
            .field("plan", &self.plan)
            .finish()
    }
}

impl PowerSwitch {
    pub fn new(plan: PowerPlan) -> Result<Self> {
        Self::with_runner(plan, shell_runner())
    }

    pub fn with_runner(plan: PowerPlan, runner: CommandRunner) -> Result<Self> {
        if plan.relay.is_none() && plan.on_command.is_none() && plan.off_command.is_none() {
            bail!("screen power needs a relay or at least one command");
        }
        for command in [&plan.on_command, &plan.off_command].into_iter().flatten() {
            if command.trim().is_empty() {
                bail!("screen power commands must not be blank");
            }
        }
        Ok(Self {
            plan: Arc::new(plan),
            runner,
        })
    }

    /// Switches the screen. Blocks for the relay pulse and any command.
    pub fn apply(&self, action: PowerAction) -> PowerReport {
        let relay = self.plan.relay.as_ref().map(|relay| relay.pulse_once());
        let command = match action {
            PowerAction::On => self.plan.on_command.as_deref(),
            PowerAction::Off => self.plan.off_command.as_deref(),
        };
        let commands = command
            .map(|command| vec![self.run(action, command)])
            .unwrap_or_default();
        PowerReport {
            action,
            relay,
            commands,
        }
    }

    fn run(&self, action: PowerAction, command: &str) -> CommandExecution {
        match (self.runner)(command) {
            Ok(output) => {
                let success = output.status.success();
                if success {
                    debug!(?action, command, stdout = output.stdout, "screen command succeeded");
                } else {
                    warn!(
                        ?action,
                        command,
                        exit_code = ?output.status.code(),
                        stderr = output.stderr,
                        "screen command failed"
                    );
                }
                CommandExecution {
                    command: command.to_string(),
                    success,
                    exit_code: output.status.code(),
                    stderr: output.stderr,
                }
            }
            Err(err) => {
                warn!(?action, command, error = %err, "failed to run screen command");
                CommandExecution {
                    command: command.to_string(),
                    success: false,
                    exit_code: None,
                    stderr: err.to_string(),
                }
            }
        }
    }
}

impl RelayPulse {
    fn pulse_once(&self) -> RelayExecution {
        let result = fs::write(&self.value_path, "1").and_then(|()| {
            thread::sleep(self.pulse);
            fs::write(&self.value_path, "0")
        });
        match result {
            Ok(()) => {
                debug!(path = %self.value_path.display(), pulse = ?self.pulse, "pulsed relay");
                RelayExecution {
                    path: self.value_path.clone(),
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                warn!(path = %self.value_path.display(), error = %err, "failed to pulse relay");
                // leave the relay released even if the pulse failed halfway
                let _ = fs::write(&self.value_path, "0");
                RelayExecution {
                    path: self.value_path.clone(),
                    success: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shell_command::CommandOutput;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    fn status(code: i32) -> ExitStatus {
        ExitStatus::from_raw((code & 0xff) << 8)
    }

    #[derive(Clone, Default)]
    struct StubRunner {
        calls: Arc<Mutex<Vec<String>>>,
        exit_code: i32,
    }

    impl StubRunner {
        fn failing(exit_code: i32) -> Self {
            Self {
                exit_code,
                ..Self::default()
            }
        }

        fn into_runner(self) -> CommandRunner {
            Arc::new(move |command: &str| {
                self.calls.lock().unwrap().push(command.to_string());
                Ok(CommandOutput {
                    status: status(self.exit_code),
                    stdout: String::new(),
                    stderr: if self.exit_code == 0 {
                        String::new()
                    } else {
                        "no display".to_string()
                    },
                })
            })
        }
    }

    #[test]
    fn plan_needs_a_mechanism() {
        assert!(PowerSwitch::new(PowerPlan::default()).is_err());
        let blank = PowerPlan {
            on_command: Some("  ".into()),
            ..PowerPlan::default()
        };
        assert!(PowerSwitch::new(blank).is_err());
    }

    #[test]
    fn runs_the_command_for_each_direction() {
        let stub = StubRunner::default();
        let calls = stub.calls.clone();
        let switch = PowerSwitch::with_runner(
            PowerPlan {
                relay: None,
                on_command: Some("vcgencmd display_power 1".into()),
                off_command: Some("vcgencmd display_power 0".into()),
            },
            stub.into_runner(),
        )
        .unwrap();

        assert!(switch.apply(PowerAction::Off).success());
        assert!(switch.apply(PowerAction::On).success());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["vcgencmd display_power 0", "vcgencmd display_power 1"]
        );
    }

    #[test]
    fn failed_command_is_reported() {
        let switch = PowerSwitch::with_runner(
            PowerPlan {
                relay: None,
                on_command: None,
                off_command: Some("wlr-randr --off".into()),
            },
            StubRunner::failing(3).into_runner(),
        )
        .unwrap();
        let report = switch.apply(PowerAction::Off);
        assert!(!report.success());
        assert_eq!(report.commands[0].exit_code, Some(3));
        assert_eq!(report.commands[0].stderr, "no display");

        // nothing configured for this direction
        let report = switch.apply(PowerAction::On);
        assert!(report.commands.is_empty());
        assert!(!report.success());
    }

    #[test]
    fn relay_pulse_ends_released() {
        let dir = tempfile::tempdir().unwrap();
        let value_path = dir.path().join("value");
        let switch = PowerSwitch::with_runner(
            PowerPlan {
                relay: Some(RelayPulse {
                    value_path: value_path.clone(),
                    pulse: Duration::from_millis(1),
                }),
                ..PowerPlan::default()
            },
            StubRunner::default().into_runner(),
        )
        .unwrap();
        let report = switch.apply(PowerAction::Off);
        assert!(report.success());
        assert_eq!(fs::read_to_string(&value_path).unwrap(), "0");
    }

    #[test]
    fn missing_gpio_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let switch = PowerSwitch::with_runner(
            PowerPlan {
                relay: Some(RelayPulse {
                    value_path: dir.path().join("missing/value"),
                    pulse: Duration::from_millis(1),
                }),
                ..PowerPlan::default()
            },
            StubRunner::default().into_runner(),
        )
        .unwrap();
        let report = switch.apply(PowerAction::On);
        assert!(!report.success());
        assert!(report.relay.unwrap().error.is_some());
    }
}

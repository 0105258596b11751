//! Command executor: the dispatch table from command type to handler.
//!
//! Handlers return an outcome, never an error; failures travel back to
//! the hub as a non-zero exit code with a human-readable message.

use std::path::PathBuf;

use bollard::Docker;
use tracing::warn;

mod docker;
mod stacks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub error: String,
}

impl CommandOutcome {
    pub fn ok(output: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            output: Vec::new(),
            error: error.into(),
        }
    }
}

pub struct CommandExecutor {
    docker: Option<Docker>,
    stacks_dir: PathBuf,
}

impl CommandExecutor {
    /// Connects to the local Docker daemon; a missing daemon is not fatal,
    /// docker commands just report it until the agent restarts.
    pub fn new(stacks_dir: PathBuf) -> Self {
        let docker = match Docker::connect_with_defaults() {
            Ok(docker) => Some(docker),
            Err(err) => {
                warn!(?err, "docker is not available, container commands will fail");
                None
            }
        };
        Self { docker, stacks_dir }
    }

    pub fn with_docker(docker: Option<Docker>, stacks_dir: PathBuf) -> Self {
        Self { docker, stacks_dir }
    }

    pub async fn execute(&self, command_type: &str, args: &[String]) -> CommandOutcome {
        match command_type {
            "docker_ps" | "docker_inspect" | "docker_logs" | "docker_stats" | "docker_start"
            | "docker_stop" | "docker_rm" | "docker_exec" | "docker_run"
            | "docker_update_restart" => {
                let Some(docker) = &self.docker else {
                    return CommandOutcome::failure("docker client not initialized");
                };
                match command_type {
                    "docker_ps" => docker::ps(docker).await,
                    "docker_inspect" => docker::inspect(docker, args).await,
                    "docker_logs" => docker::logs(docker, args).await,
                    "docker_stats" => docker::stats(docker, args).await,
                    "docker_start" => docker::start(docker, args).await,
                    "docker_stop" => docker::stop(docker, args).await,
                    "docker_rm" => docker::remove(docker, args).await,
                    "docker_exec" => docker::exec(docker, args).await,
                    "docker_run" => docker::run(docker, args).await,
                    "docker_update_restart" => docker::update_restart(docker, args).await,
                    _ => unreachable!(),
                }
            }
            "stack_up" => stacks::up(&self.stacks_dir, args).await,
            "stack_down" => stacks::down(&self.stacks_dir, args).await,
            "stack_ls" => stacks::ls().await,
            // Rename state lives at the hub; the agent only echoes it.
            "node_rename" => match args.first() {
                Some(name) => CommandOutcome::ok(name.as_bytes().to_vec()),
                None => CommandOutcome::failure("name required"),
            },
            _ => CommandOutcome::failure("unknown command type"),
        }
    }
}

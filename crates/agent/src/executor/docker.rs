//! Container-runtime handlers. Inputs arrive as positional `args`;
//! outputs are JSON for list/inspect/stats and plain text otherwise.

use std::collections::HashMap;

use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, ContainerUpdateBody, HostConfig, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptionsBuilder,
    StopContainerOptions,
};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use uuid::Uuid;

use super::CommandOutcome;

fn require_container_id(args: &[String]) -> Result<&str, CommandOutcome> {
    match args.first().map(|s| s.trim()) {
        Some(id) if !id.is_empty() => Ok(args[0].as_str()),
        _ => Err(CommandOutcome::failure("container id required")),
    }
}

pub(super) async fn ps(docker: &Docker) -> CommandOutcome {
    let containers = match docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            ..Default::default()
        }))
        .await
    {
        Ok(containers) => containers,
        Err(err) => return CommandOutcome::failure(err.to_string()),
    };

    match serde_json::to_vec(&containers) {
        Ok(json) => CommandOutcome::ok(json),
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

pub(super) async fn inspect(docker: &Docker, args: &[String]) -> CommandOutcome {
    let id = match require_container_id(args) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match docker
        .inspect_container(id, None::<InspectContainerOptions>)
        .await
    {
        Ok(details) => match serde_json::to_vec(&details) {
            Ok(json) => CommandOutcome::ok(json),
            Err(err) => CommandOutcome::failure(err.to_string()),
        },
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

pub(super) async fn logs(docker: &Docker, args: &[String]) -> CommandOutcome {
    let id = match require_container_id(args) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };

    let mut stream = docker.logs(
        id,
        Some(LogsOptions {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        }),
    );

    let mut output = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(log) => output.extend_from_slice(&log.into_bytes()),
            Err(err) => return CommandOutcome::failure(err.to_string()),
        }
    }
    CommandOutcome::ok(output)
}

pub(super) async fn stats(docker: &Docker, args: &[String]) -> CommandOutcome {
    let id = match require_container_id(args) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };

    let mut stream = docker
        .stats(
            id,
            Some(
                StatsOptionsBuilder::default()
                    .stream(false)
                    .one_shot(true)
                    .build(),
            ),
        )
        .take(1);

    match stream.try_next().await {
        Ok(Some(stats)) => match serde_json::to_vec(&stats) {
            Ok(json) => CommandOutcome::ok(json),
            Err(err) => CommandOutcome::failure(err.to_string()),
        },
        Ok(None) => CommandOutcome::failure("no stats returned"),
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

pub(super) async fn start(docker: &Docker, args: &[String]) -> CommandOutcome {
    let id = match require_container_id(args) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match docker
        .start_container(id, None::<StartContainerOptions>)
        .await
    {
        Ok(()) => CommandOutcome::ok(&b"started"[..]),
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

pub(super) async fn stop(docker: &Docker, args: &[String]) -> CommandOutcome {
    let id = match require_container_id(args) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match docker
        .stop_container(
            id,
            Some(StopContainerOptions {
                signal: None,
                t: Some(10),
            }),
        )
        .await
    {
        Ok(()) => CommandOutcome::ok(&b"stopped"[..]),
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

pub(super) async fn remove(docker: &Docker, args: &[String]) -> CommandOutcome {
    let id = match require_container_id(args) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                v: false,
                force: true,
                link: false,
            }),
        )
        .await
    {
        Ok(()) => CommandOutcome::ok(&b"removed"[..]),
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

pub(super) async fn exec(docker: &Docker, args: &[String]) -> CommandOutcome {
    if args.len() < 2 {
        return CommandOutcome::failure("container id and command required");
    }
    let container_id = &args[0];
    let command = args[1..].to_vec();

    let created = match docker
        .create_exec(
            container_id,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(command),
                ..Default::default()
            },
        )
        .await
    {
        Ok(created) => created,
        Err(err) => return CommandOutcome::failure(err.to_string()),
    };

    let started = match docker.start_exec(&created.id, None::<StartExecOptions>).await {
        Ok(started) => started,
        Err(err) => return CommandOutcome::failure(err.to_string()),
    };

    let mut output = String::new();
    if let StartExecResults::Attached {
        output: mut stream, ..
    } = started
    {
        loop {
            match stream.try_next().await {
                Ok(Some(log)) => output.push_str(&log.to_string()),
                Ok(None) => break,
                Err(err) => return CommandOutcome::failure(err.to_string()),
            }
        }
    }

    let exit_code = match docker.inspect_exec(&created.id).await {
        Ok(inspect) => inspect.exit_code.unwrap_or_default(),
        Err(err) => return CommandOutcome::failure(err.to_string()),
    };

    CommandOutcome {
        exit_code: exit_code as i32,
        output: output.into_bytes(),
        error: String::new(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    ports: Vec<RunPort>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    restart_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunPort {
    host: String,
    container: String,
}

pub(super) async fn run(docker: &Docker, args: &[String]) -> CommandOutcome {
    let Some(raw) = args.first() else {
        return CommandOutcome::failure("config json required");
    };

    // A bare image name is accepted in place of the config document.
    let config = serde_json::from_str::<RunConfig>(raw).unwrap_or_else(|_| RunConfig {
        image: raw.clone(),
        ..Default::default()
    });
    if config.image.trim().is_empty() {
        return CommandOutcome::failure("image name required");
    }

    let mut pull = docker.create_image(
        Some(CreateImageOptions {
            from_image: Some(config.image.clone()),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(progress) = pull.next().await {
        if let Err(err) = progress {
            return CommandOutcome::failure(format!("pull error: {err}"));
        }
    }

    let mut port_bindings: PortMap = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for port in &config.ports {
        let key = format!("{}/tcp", port.container);
        exposed_ports.entry(key.clone()).or_default();
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host.clone()),
            }]),
        );
    }

    let restart_policy = config
        .restart_policy
        .as_deref()
        .and_then(parse_restart_policy)
        .map(|name| RestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        });

    let host_config = HostConfig {
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        restart_policy,
        ..Default::default()
    };

    let body = ContainerCreateBody {
        image: Some(config.image.clone()),
        env: if config.env.is_empty() {
            None
        } else {
            Some(config.env.clone())
        },
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        host_config: Some(host_config),
        ..Default::default()
    };

    let name = if config.name.trim().is_empty() {
        format!("quay-{}", Uuid::new_v4())
    } else {
        config.name.clone()
    };
    let created = match docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(name),
                platform: String::new(),
            }),
            body,
        )
        .await
    {
        Ok(created) => created,
        Err(err) => return CommandOutcome::failure(format!("create error: {err}")),
    };

    match docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
    {
        Ok(()) => CommandOutcome::ok(created.id.into_bytes()),
        Err(err) => CommandOutcome::failure(format!("start error: {err}")),
    }
}

pub(super) async fn update_restart(docker: &Docker, args: &[String]) -> CommandOutcome {
    if args.len() < 2 {
        return CommandOutcome::failure("container id and restart policy required");
    }
    let Some(name) = parse_restart_policy(&args[1]) else {
        return CommandOutcome::failure(format!("unknown restart policy {}", args[1]));
    };

    let update = ContainerUpdateBody {
        restart_policy: Some(RestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };
    match docker.update_container(&args[0], update).await {
        Ok(_) => CommandOutcome::ok(&b"updated"[..]),
        Err(err) => CommandOutcome::failure(err.to_string()),
    }
}

fn parse_restart_policy(raw: &str) -> Option<RestartPolicyNameEnum> {
    match raw.trim() {
        "no" => Some(RestartPolicyNameEnum::NO),
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_config_parses_the_full_document() {
        let raw = r#"{
            "image": "nginx:1.25",
            "name": "web",
            "ports": [{"host": "8080", "container": "80"}],
            "env": ["A=1"],
            "restart_policy": "always"
        }"#;
        let config: RunConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.image, "nginx:1.25");
        assert_eq!(config.name, "web");
        assert_eq!(config.ports.len(), 1);
        assert_eq!(config.ports[0].container, "80");
        assert_eq!(config.env, vec!["A=1"]);
        assert_eq!(config.restart_policy.as_deref(), Some("always"));
    }

    #[test]
    fn parse_restart_policy_covers_the_docker_vocabulary() {
        assert_eq!(parse_restart_policy("no"), Some(RestartPolicyNameEnum::NO));
        assert_eq!(
            parse_restart_policy(" always "),
            Some(RestartPolicyNameEnum::ALWAYS)
        );
        assert_eq!(
            parse_restart_policy("on-failure"),
            Some(RestartPolicyNameEnum::ON_FAILURE)
        );
        assert_eq!(
            parse_restart_policy("unless-stopped"),
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(parse_restart_policy("sometimes"), None);
    }

    #[test]
    fn require_container_id_rejects_blank_args() {
        assert!(require_container_id(&[]).is_err());
        assert!(require_container_id(&["  ".to_string()]).is_err());
        assert!(require_container_id(&["c1".to_string()]).is_ok());
    }
}

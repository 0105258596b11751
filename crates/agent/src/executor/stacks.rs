//! Compose stack handlers. Each stack is a subdirectory under the
//! configured stacks directory holding one `docker-compose.yml`; the file
//! is written atomically before the compose tool sees it.

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;

use super::CommandOutcome;

fn validate_stack_name(name: &str) -> Result<&str, CommandOutcome> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CommandOutcome::failure("stack name required"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CommandOutcome::failure(
            "stack name may only contain alphanumerics, '-' and '_'",
        ));
    }
    Ok(name)
}

async fn write_compose_file(
    stacks_dir: &Path,
    name: &str,
    content: &str,
) -> anyhow::Result<PathBuf> {
    let dir = stacks_dir.join(name);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join("docker-compose.yml");
    let tmp = dir.join("docker-compose.yml.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}

fn combined_outcome(output: Output) -> CommandOutcome {
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    if output.status.success() {
        CommandOutcome::ok(combined)
    } else {
        CommandOutcome {
            exit_code: output.status.code().unwrap_or(1),
            output: combined,
            error: "docker compose failed".to_string(),
        }
    }
}

async fn compose(args: &[&str]) -> CommandOutcome {
    match Command::new("docker").arg("compose").args(args).output().await {
        Ok(output) => combined_outcome(output),
        Err(err) => CommandOutcome::failure(format!("failed to run docker compose: {err}")),
    }
}

pub(super) async fn up(stacks_dir: &Path, args: &[String]) -> CommandOutcome {
    if args.len() < 2 {
        return CommandOutcome::failure("stack name and content required");
    }
    let name = match validate_stack_name(&args[0]) {
        Ok(name) => name,
        Err(outcome) => return outcome,
    };

    let path = match write_compose_file(stacks_dir, name, &args[1]).await {
        Ok(path) => path,
        Err(err) => return CommandOutcome::failure(format!("failed to write compose file: {err}")),
    };

    let file = path.display().to_string();
    compose(&["-p", name, "-f", file.as_str(), "up", "-d"]).await
}

pub(super) async fn down(stacks_dir: &Path, args: &[String]) -> CommandOutcome {
    let Some(raw) = args.first() else {
        return CommandOutcome::failure("stack name required");
    };
    let name = match validate_stack_name(raw) {
        Ok(name) => name,
        Err(outcome) => return outcome,
    };

    let path = stacks_dir.join(name).join("docker-compose.yml");
    if path.exists() {
        let file = path.display().to_string();
        compose(&["-p", name, "-f", file.as_str(), "down"]).await
    } else {
        compose(&["-p", name, "down"]).await
    }
}

pub(super) async fn ls() -> CommandOutcome {
    compose(&["ls", "--format", "json"]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_names_reject_path_traversal() {
        assert!(validate_stack_name("web").is_ok());
        assert!(validate_stack_name("web_2-prod").is_ok());
        assert!(validate_stack_name("").is_err());
        assert!(validate_stack_name("../etc").is_err());
        assert!(validate_stack_name("a/b").is_err());
        assert!(validate_stack_name("a b").is_err());
    }

    #[tokio::test]
    async fn compose_file_is_written_atomically_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_compose_file(dir.path(), "web", "services: {}\n")
            .await
            .expect("write");
        assert_eq!(path, dir.path().join("web/docker-compose.yml"));
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "services: {}\n"
        );
        assert!(!dir.path().join("web/docker-compose.yml.tmp").exists());

        // Rewrites replace the previous content.
        write_compose_file(dir.path(), "web", "services:\n  app: {}\n")
            .await
            .expect("rewrite");
        assert!(std::fs::read_to_string(&path)
            .expect("read")
            .contains("app"));
    }

    #[tokio::test]
    async fn up_requires_name_and_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = up(dir.path(), &["web".to_string()]).await;
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.error, "stack name and content required");
    }
}

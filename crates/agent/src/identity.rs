use std::path::Path;

use anyhow::Context;
use uuid::Uuid;

/// Read the node id from `path`, generating and persisting a fresh UUID
/// on first run. The file holds the bare id in plain text and is the
/// host's stable identity across reconnects and agent upgrades.
pub fn load_or_create_node_id(path: &Path) -> anyhow::Result<String> {
    if let Ok(content) = std::fs::read_to_string(path) {
        let id = content.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create state directory")?;
    }
    std::fs::write(path, &id).context("write node id file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(id)
}

/// Host fingerprint; advisory only, the hub treats it as opaque.
pub fn machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_once_and_reuses_the_stored_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node_id");

        let first = load_or_create_node_id(&path).expect("create");
        Uuid::parse_str(&first).expect("valid uuid");

        let second = load_or_create_node_id(&path).expect("reload");
        assert_eq!(first, second);
    }

    #[test]
    fn blank_file_is_replaced_with_a_fresh_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node_id");
        std::fs::write(&path, "  \n").expect("write");

        let id = load_or_create_node_id(&path).expect("create");
        assert!(!id.trim().is_empty());
        assert_eq!(std::fs::read_to_string(&path).expect("read"), id);
    }

    #[test]
    fn surrounding_whitespace_is_trimmed_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node_id");
        std::fs::write(&path, "  abc-123  \n").expect("write");
        assert_eq!(load_or_create_node_id(&path).expect("read"), "abc-123");
    }
}

//! Agent enrollment.
//!
//! Agents ship without credentials. On first boot the agent generates a
//! keypair, presents the public key and a pairing code to the orchestrator,
//! and waits for operator approval. Approval installs the key under the
//! restricted tunnel user, limited to exactly the two forwards the control
//! channel needs; nothing else is reachable even with the key.

use anyhow::Context;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const KEY_FILE_NAME: &str = "vma_enrollment";

/// The agent's enrollment keypair on disk.
pub struct EnrollmentKeys {
    pub private_key_path: PathBuf,
    pub public_key: String,
}

impl EnrollmentKeys {
    /// Loads the keypair, generating one on first boot. Key generation is
    /// delegated to ssh-keygen so the key format matches what sshd expects
    /// on the orchestrator side.
    pub fn ensure(key_dir: &str) -> anyhow::Result<Self> {
        let dir = Path::new(key_dir);
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating key directory {}", key_dir))?;

        let private_key_path = dir.join(KEY_FILE_NAME);
        let public_key_path = dir.join(format!("{}.pub", KEY_FILE_NAME));

        if !private_key_path.exists() {
            let status = Command::new("ssh-keygen")
                .args(["-t", "ed25519", "-N", "", "-C", "vma-enrollment", "-f"])
                .arg(&private_key_path)
                .status()
                .context("running ssh-keygen")?;
            if !status.success() {
                anyhow::bail!("ssh-keygen exited with {}", status);
            }
        }

        let public_key = std::fs::read_to_string(&public_key_path)
            .with_context(|| format!("reading {}", public_key_path.display()))?
            .trim()
            .to_string();

        Ok(Self {
            private_key_path,
            public_key,
        })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// SHA-256 over the key body, hex, truncated for display. Stable across the
/// comment field so re-reading the same key file enrolls as the same agent.
pub fn fingerprint(public_key: &str) -> String {
    let body = public_key.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(body.as_bytes());
    hex::encode(&digest[..16])
}

/// Short code the operator compares between the agent console and the
/// approval UI before trusting the key.
pub fn generate_pairing_code() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

/// One authorized_keys line for an approved agent: no shell, no agent or
/// X11 forwarding, and port forwarding constrained to exactly the
/// orchestrator API forward and the agent API reverse listener.
pub fn render_authorized_key_line(
    public_key: &str,
    orchestrator_port: u16,
    remote_forward_port: u16,
) -> String {
    format!(
        "restrict,port-forwarding,permitopen=\"127.0.0.1:{}\",permitlisten=\"127.0.0.1:{}\" {}",
        orchestrator_port, remote_forward_port, public_key
    )
}

/// Installs an approved key, replacing any previous line for the same key
/// body. The write is atomic (temp file + rename) because sshd may read the
/// file at any moment.
pub fn install_authorized_key(
    authorized_keys_path: &str,
    public_key: &str,
    orchestrator_port: u16,
    remote_forward_port: u16,
) -> anyhow::Result<()> {
    let path = Path::new(authorized_keys_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let target_fingerprint = fingerprint(public_key);

    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line_matches_key(line, &target_fingerprint))
        .map(str::to_string)
        .collect();
    lines.push(render_authorized_key_line(
        public_key,
        orchestrator_port,
        remote_forward_port,
    ));

    write_atomically(path, &(lines.join("\n") + "\n"))
}

/// Removes a revoked agent's key. Missing is success.
pub fn remove_authorized_key(authorized_keys_path: &str, public_key: &str) -> anyhow::Result<()> {
    let path = Path::new(authorized_keys_path);
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("reading authorized_keys"),
    };

    let target_fingerprint = fingerprint(public_key);
    let remaining: Vec<&str> = existing
        .lines()
        .filter(|line| !line_matches_key(line, &target_fingerprint))
        .collect();

    write_atomically(path, &(remaining.join("\n") + "\n"))
}

fn line_matches_key(line: &str, target_fingerprint: &str) -> bool {
    // The options prefix varies; match on the key body's fingerprint
    line.split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .any(|pair| {
            pair[0].starts_with("ssh-") && fingerprint(&pair.join(" ")) == *target_fingerprint
        })
}

fn write_atomically(path: &Path, content: &str) -> anyhow::Result<()> {
    let staging = path.with_extension("staging");
    std::fs::write(&staging, content).context("writing authorized_keys staging file")?;
    std::fs::rename(&staging, path).context("renaming authorized_keys into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPwAuLYsvDRmYKbZkTEPMmGSed7z9vLw9PJbj7rbdBrQ vma-enrollment";

    #[test]
    fn fingerprint_ignores_the_comment_field() {
        let renamed = KEY.replace("vma-enrollment", "some-other-comment");
        assert_eq!(fingerprint(KEY), fingerprint(&renamed));
    }

    #[test]
    fn pairing_codes_are_eight_chars() {
        let code = generate_pairing_code();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn authorized_line_restricts_to_the_two_forwards() {
        let line = render_authorized_key_line(KEY, 8082, 9081);
        assert!(line.starts_with("restrict,port-forwarding,"));
        assert!(line.contains("permitopen=\"127.0.0.1:8082\""));
        assert!(line.contains("permitlisten=\"127.0.0.1:9081\""));
        assert!(line.ends_with(KEY));
    }

    #[test]
    fn install_replaces_rather_than_duplicates() {
        let dir = std::env::temp_dir().join(format!("enroll-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("authorized_keys");
        let path_str = path.to_str().unwrap();

        install_authorized_key(path_str, KEY, 8082, 9081).unwrap();
        install_authorized_key(path_str, KEY, 8082, 9081).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);

        remove_authorized_key(path_str, KEY).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim().is_empty());
    }
}

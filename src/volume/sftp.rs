use std::path::Path;

use super::config::SftpConfig;
use crate::error::{MountError, Result};
use crate::mount::guard::CredentialDir;
use crate::secrets::SecretResolver;
use crate::util::command::CommandSpec;

pub fn fs_type_matches(fs_type: &str) -> bool {
    fs_type == "fuse.sshfs"
}

pub fn mount_command(
    cfg: &SftpConfig,
    path: &Path,
    creds: &CredentialDir,
    secrets: &dyn SecretResolver,
) -> Result<CommandSpec> {
    let mut options = vec![
        "reconnect".to_string(),
        "ServerAliveInterval=15".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ];

    if let Some(key) = secrets.resolve_optional(cfg.private_key.as_deref())? {
        let mut key = key;
        if !key.ends_with('\n') {
            key.push('\n');
        }
        let key_file = creds.write("ssh-key", &key)?;
        options.push(format!("IdentityFile={}", key_file.display()));
    }

    match (&cfg.known_hosts, cfg.skip_host_key_check) {
        (_, true) => {
            options.push("StrictHostKeyChecking=no".to_string());
            options.push("UserKnownHostsFile=/dev/null".to_string());
        }
        (Some(known_hosts), false) => {
            let file = creds.write("known_hosts", known_hosts)?;
            options.push("StrictHostKeyChecking=yes".to_string());
            options.push(format!("UserKnownHostsFile={}", file.display()));
        }
        (None, false) => {
            return Err(MountError::InvalidOptions(
                "knownHosts is required unless skipHostKeyCheck is set".to_string(),
            )
            .into())
        }
    }

    let password = secrets.resolve_optional(cfg.password.as_deref())?;
    if password.is_some() {
        options.push("password_stdin".to_string());
    }
    if cfg.read_only {
        options.push("ro".to_string());
    }

    let mut cmd = CommandSpec::new("sshfs")
        .arg(format!("{}@{}:{}", cfg.username, cfg.host, cfg.path))
        .arg(path.to_string_lossy())
        .arg("-p")
        .arg(cfg.port.to_string())
        .arg("-o")
        .arg(options.join(","));
    if let Some(password) = password {
        cmd = cmd.stdin(format!("{}\n", password));
    }
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::DefaultSecretResolver;
    use tempfile::TempDir;

    fn cfg() -> SftpConfig {
        SftpConfig {
            host: "backup.example".to_string(),
            port: 22,
            username: "bob".to_string(),
            password: Some("pw".to_string()),
            private_key: None,
            path: "/srv".to_string(),
            known_hosts: Some("backup.example ssh-ed25519 AAAA".to_string()),
            skip_host_key_check: false,
            read_only: true,
        }
    }

    #[test]
    fn password_goes_through_stdin() {
        let dir = TempDir::new().expect("tempdir");
        let creds = CredentialDir::create(dir.path().join("c")).expect("creds");
        let resolver = DefaultSecretResolver::new(dir.path().to_path_buf());
        let cmd = mount_command(&cfg(), Path::new("/v"), &creds, &resolver).expect("cmd");
        assert_eq!(cmd.args[0], "bob@backup.example:/srv");
        assert_eq!(cmd.stdin.as_deref(), Some("pw\n"));
        let options = cmd.args.last().unwrap();
        assert!(options.contains("password_stdin"));
        assert!(options.contains("StrictHostKeyChecking=yes"));
        assert!(!options.contains("pw,"));
        assert!(creds.path().join("known_hosts").exists());
    }

    #[test]
    fn host_key_policy_is_required() {
        let dir = TempDir::new().expect("tempdir");
        let creds = CredentialDir::create(dir.path().join("c")).expect("creds");
        let resolver = DefaultSecretResolver::new(dir.path().to_path_buf());
        let mut cfg = cfg();
        cfg.known_hosts = None;
        assert!(mount_command(&cfg, Path::new("/v"), &creds, &resolver).is_err());
    }
}

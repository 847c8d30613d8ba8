use std::path::Path;

use super::config::WebdavConfig;
use crate::error::Result;
use crate::mount::guard::CredentialDir;
use crate::mount::ops::mount_command as os_mount;
use crate::secrets::SecretResolver;
use crate::util::command::CommandSpec;

pub fn fs_type_matches(fs_type: &str) -> bool {
    fs_type == "davfs" || fs_type == "fuse" || fs_type == "fuse.davfs"
}

pub fn url(cfg: &WebdavConfig) -> String {
    let scheme = if cfg.ssl { "https" } else { "http" };
    let path = if cfg.path.starts_with('/') {
        cfg.path.clone()
    } else {
        format!("/{}", cfg.path)
    };
    match cfg.port {
        Some(port) => format!("{}://{}:{}{}", scheme, cfg.server, port, path),
        None => format!("{}://{}{}", scheme, cfg.server, path),
    }
}

/// davfs2 reads credentials from a secrets file named by a private config
/// file handed over with `conf=`.
pub fn mount_command(
    cfg: &WebdavConfig,
    path: &Path,
    creds: &CredentialDir,
    secrets: &dyn SecretResolver,
) -> Result<CommandSpec> {
    let url = url(cfg);
    let mut options = Vec::new();
    if let Some(username) = secrets.resolve_optional(cfg.username.as_deref())? {
        let password = secrets
            .resolve_optional(cfg.password.as_deref())?
            .unwrap_or_default();
        let secrets_file = creds.write(
            "davfs-secrets",
            &format!("{} \"{}\" \"{}\"\n", url, escape(&username), escape(&password)),
        )?;
        let conf = creds.write(
            "davfs2.conf",
            &format!("secrets {}\nuse_locks 0\n", secrets_file.display()),
        )?;
        options.push(format!("conf={}", conf.display()));
    }
    if let Some(uid) = cfg.uid {
        options.push(format!("uid={}", uid));
    }
    if let Some(gid) = cfg.gid {
        options.push(format!("gid={}", gid));
    }
    if cfg.read_only {
        options.push("ro".to_string());
    }
    Ok(os_mount("davfs", &url, path, &options))
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::DefaultSecretResolver;
    use tempfile::TempDir;

    fn cfg() -> WebdavConfig {
        WebdavConfig {
            server: "dav.example".to_string(),
            path: "remote.php/webdav".to_string(),
            port: Some(8443),
            ssl: true,
            username: Some("carol".to_string()),
            password: Some("pa\"ss".to_string()),
            uid: None,
            gid: None,
            read_only: true,
        }
    }

    #[test]
    fn builds_url_and_secrets() {
        let dir = TempDir::new().expect("tempdir");
        let creds = CredentialDir::create(dir.path().join("c")).expect("creds");
        let resolver = DefaultSecretResolver::new(dir.path().to_path_buf());
        let cmd = mount_command(&cfg(), Path::new("/v"), &creds, &resolver).expect("cmd");
        assert_eq!(url(&cfg()), "https://dav.example:8443/remote.php/webdav");
        assert_eq!(cmd.args[1], "davfs");
        assert!(cmd.args[3].starts_with("conf="));
        assert!(cmd.args[3].ends_with(",ro"));
        let secrets = std::fs::read_to_string(creds.path().join("davfs-secrets")).unwrap();
        assert!(secrets.contains("\"pa\\\"ss\""));
    }
}

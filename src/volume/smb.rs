use std::path::Path;

use super::config::SmbConfig;
use crate::error::Result;
use crate::mount::guard::CredentialDir;
use crate::mount::ops::mount_command as os_mount;
use crate::secrets::SecretResolver;
use crate::util::command::CommandSpec;

pub fn fs_type_matches(fs_type: &str) -> bool {
    fs_type == "cifs" || fs_type == "smb3"
}

/// Credentials go to a 0600 file passed as `credentials=` so passwords with
/// commas survive and never show up in the process list.
pub fn mount_command(
    cfg: &SmbConfig,
    path: &Path,
    creds: &CredentialDir,
    secrets: &dyn SecretResolver,
) -> Result<CommandSpec> {
    let mut options = Vec::new();
    match secrets.resolve_optional(cfg.username.as_deref())? {
        Some(username) => {
            let password = secrets
                .resolve_optional(cfg.password.as_deref())?
                .unwrap_or_default();
            let mut contents = format!("username={}\npassword={}\n", username, password);
            if let Some(domain) = &cfg.domain {
                contents.push_str(&format!("domain={}\n", domain));
            }
            let file = creds.write("smb-credentials", &contents)?;
            options.push(format!("credentials={}", file.display()));
        }
        None => options.push("guest".to_string()),
    }
    options.push(format!("vers={}", cfg.version));
    options.push(format!("port={}", cfg.port));
    if let Some(uid) = cfg.uid {
        options.push(format!("uid={}", uid));
    }
    if let Some(gid) = cfg.gid {
        options.push(format!("gid={}", gid));
    }
    if cfg.read_only {
        options.push("ro".to_string());
    }
    let source = format!("//{}/{}", cfg.server, cfg.share);
    Ok(os_mount("cifs", &source, path, &options))
}

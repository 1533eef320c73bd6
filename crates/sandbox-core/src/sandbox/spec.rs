//! Container settings for one execution.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::languages::{LanguageRuntime, SCRATCH_DIR};
use crate::runtime::ContainerSpec;
use crate::security::SecurityProfile;

pub const SANDBOX_USER: &str = "sandbox";

/// Merge a language runtime, the security profile and the caller's payload.
pub fn build_container_spec(
    language: &LanguageRuntime,
    security: &SecurityProfile,
    code: &str,
    stdin: &str,
    tmpfs_size_mb: u32,
) -> ContainerSpec {
    let scratch_exec = if language.executable_scratch { "exec" } else { "noexec" };

    let mut tmpfs = BTreeMap::new();
    tmpfs.insert(
        "/tmp".to_string(),
        format!("rw,noexec,nosuid,size={}m", tmpfs_size_mb),
    );
    tmpfs.insert(
        SCRATCH_DIR.to_string(),
        format!("rw,{},nosuid,size={}m", scratch_exec, tmpfs_size_mb),
    );

    ContainerSpec {
        name: format!("sandbox-{}", Uuid::new_v4()),
        image: language.image.clone(),
        cmd: language.build_command(code),
        env: language.build_env(code),
        stdin: (!stdin.is_empty()).then(|| stdin.to_string()),
        user: SANDBOX_USER.to_string(),
        working_dir: SCRATCH_DIR.to_string(),
        network_disabled: true,
        readonly_rootfs: true,
        cap_drop: vec!["ALL".to_string()],
        security_opt: security.security_opt.clone(),
        limits: security.limits.clone(),
        tmpfs,
    }
}

//! Security policy applied to every sandboxed container
//!
//! Everything here is a pure function of configuration. The process count and
//! descriptor ceilings are constants and never depend on the request, so a
//! caller cannot widen them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Memory ceiling used when the configured limit does not parse.
pub const DEFAULT_MEMORY_BYTES: i64 = 128 * 1024 * 1024;

pub const PIDS_LIMIT: i64 = 64;
pub const NOFILE_SOFT: i64 = 256;
pub const NOFILE_HARD: i64 = 512;
pub const NPROC_SOFT: i64 = 32;
pub const NPROC_HARD: i64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

/// Per-container resource ceilings, in the units the engine expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub ulimits: Vec<Ulimit>,
}

impl ResourceLimits {
    pub fn file_descriptor_limits(&self) -> Option<&Ulimit> {
        self.ulimits.iter().find(|u| u.name == "nofile")
    }
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)([kmg])$").expect("static regex"))
}

/// Parse `<integer><k|m|g>` into bytes. Anything else yields 128 MiB.
pub fn parse_memory_limit(limit: &str) -> i64 {
    let lowered = limit.to_lowercase();
    let Some(caps) = memory_pattern().captures(&lowered) else {
        return DEFAULT_MEMORY_BYTES;
    };

    let multiplier: i64 = match &caps[2] {
        "k" => 1024,
        "m" => 1024 * 1024,
        _ => 1024 * 1024 * 1024,
    };

    caps[1]
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .unwrap_or(DEFAULT_MEMORY_BYTES)
}

/// Whether `limit` is in the `<integer><k|m|g>` form rather than the fallback.
pub fn is_memory_limit(limit: &str) -> bool {
    memory_pattern().is_match(&limit.to_lowercase())
}

pub fn compute_resource_limits(memory_limit: &str, cpu_limit_cores: f64) -> ResourceLimits {
    let memory_bytes = parse_memory_limit(memory_limit);
    ResourceLimits {
        memory_bytes,
        // swap capped at the RAM ceiling, i.e. no extra swap headroom
        memory_swap_bytes: memory_bytes,
        nano_cpus: (cpu_limit_cores * 1e9).round() as i64,
        pids_limit: PIDS_LIMIT,
        ulimits: vec![
            Ulimit {
                name: "nofile",
                soft: NOFILE_SOFT,
                hard: NOFILE_HARD,
            },
            Ulimit {
                name: "nproc",
                soft: NPROC_SOFT,
                hard: NPROC_HARD,
            },
        ],
    }
}

/// Docker/OCI seccomp profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeccompProfile {
    pub default_action: String,
    pub architectures: Vec<String>,
    pub syscalls: Vec<SyscallRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: String,
}

impl SeccompProfile {
    pub fn allows(&self, syscall: &str) -> bool {
        self.syscalls
            .iter()
            .any(|rule| rule.action == "SCMP_ACT_ALLOW" && rule.names.iter().any(|n| n == syscall))
    }
}

/// Syscalls needed for process startup, file I/O, socket probing, signals and timers.
pub const ALLOWED_SYSCALLS: &[&str] = &[
    "accept", "accept4", "access", "arch_prctl", "bind", "brk",
    "chmod", "chown", "clock_getres", "clock_gettime", "clock_nanosleep",
    "close", "connect", "dup", "dup2", "dup3", "epoll_create", "epoll_create1",
    "epoll_ctl", "epoll_pwait", "epoll_wait", "eventfd", "eventfd2",
    "execve", "exit", "exit_group", "faccessat", "fadvise64", "fallocate",
    "fchdir", "fchmod", "fchmodat", "fchown", "fchownat", "fcntl",
    "fdatasync", "flock", "fstat", "fstatfs", "fsync", "ftruncate",
    "futex", "getcwd", "getdents", "getdents64", "getegid", "geteuid",
    "getgid", "getgroups", "getitimer", "getpeername", "getpgid", "getpgrp",
    "getpid", "getppid", "getpriority", "getrandom", "getresgid", "getresuid",
    "getrlimit", "getrusage", "getsid", "getsockname", "getsockopt",
    "gettid", "gettimeofday", "getuid", "getxattr", "inotify_add_watch",
    "inotify_init", "inotify_init1", "inotify_rm_watch", "io_cancel",
    "ioctl", "io_destroy", "io_getevents", "ioprio_get", "ioprio_set",
    "io_setup", "io_submit", "lchown", "lgetxattr", "link", "linkat",
    "listen", "listxattr", "llistxattr", "lseek", "lstat", "madvise",
    "memfd_create", "mkdir", "mkdirat", "mmap", "mprotect", "mremap",
    "munmap", "nanosleep", "newfstatat", "open", "openat", "pause",
    "pipe", "pipe2", "poll", "ppoll", "prctl", "pread64", "preadv",
    "prlimit64", "pselect6", "pwrite64", "pwritev", "read", "readlink",
    "readlinkat", "readv", "recvfrom", "recvmmsg", "recvmsg", "rename",
    "renameat", "renameat2", "restart_syscall", "rmdir", "rt_sigaction",
    "rt_sigpending", "rt_sigprocmask", "rt_sigqueueinfo", "rt_sigreturn",
    "rt_sigsuspend", "rt_sigtimedwait", "sched_getaffinity", "sched_getattr",
    "sched_getparam", "sched_get_priority_max", "sched_get_priority_min",
    "sched_getscheduler", "sched_setaffinity", "sched_setattr", "sched_setparam",
    "sched_setscheduler", "sched_yield", "seccomp", "select", "semctl",
    "semget", "semop", "semtimedop", "sendfile", "sendmmsg", "sendmsg",
    "sendto", "setfsgid", "setfsuid", "setgid", "setgroups", "setitimer",
    "setpgid", "setpriority", "setregid", "setresgid", "setresuid",
    "setreuid", "setrlimit", "setsid", "setsockopt", "set_tid_address",
    "setuid", "setxattr", "shmat", "shmctl", "shmdt", "shmget",
    "shutdown", "sigaltstack", "socket", "socketpair", "splice",
    "stat", "statfs", "symlink", "symlinkat", "sync", "sync_file_range",
    "syncfs", "sysinfo", "tee", "tgkill", "time", "timer_create",
    "timer_delete", "timerfd_create", "timerfd_gettime", "timerfd_settime",
    "timer_getoverrun", "timer_gettime", "timer_settime", "times",
    "tkill", "truncate", "umask", "uname", "unlink", "unlinkat",
    "utime", "utimensat", "utimes", "vfork", "wait4", "waitid",
    "write", "writev",
];

/// Default-deny profile: anything not listed fails with an errno.
pub fn seccomp_profile() -> SeccompProfile {
    SeccompProfile {
        default_action: "SCMP_ACT_ERRNO".to_string(),
        architectures: ["SCMP_ARCH_X86_64", "SCMP_ARCH_X86", "SCMP_ARCH_X32"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        syscalls: vec![SyscallRule {
            names: ALLOWED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            action: "SCMP_ACT_ALLOW".to_string(),
        }],
    }
}

/// Hardening flags passed as `SecurityOpt`.
pub fn security_options() -> Vec<String> {
    vec![
        "no-new-privileges:true".to_string(),
        "seccomp=default".to_string(),
        "apparmor=docker-default".to_string(),
    ]
}

/// Hardening flags with the allow-list profile inlined instead of the engine default.
pub fn security_options_with_profile(profile: &SeccompProfile) -> Result<Vec<String>, serde_json::Error> {
    let inline = serde_json::to_string(profile)?;
    Ok(vec![
        "no-new-privileges:true".to_string(),
        format!("seccomp={}", inline),
        "apparmor=docker-default".to_string(),
    ])
}

/// Everything a container needs from the security layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityProfile {
    pub security_opt: Vec<String>,
    pub limits: ResourceLimits,
}

impl SecurityProfile {
    pub fn new(memory_limit: &str, cpu_limit_cores: f64) -> Self {
        Self {
            security_opt: security_options(),
            limits: compute_resource_limits(memory_limit, cpu_limit_cores),
        }
    }

    pub fn with_inline_seccomp(mut self) -> Result<Self, serde_json::Error> {
        self.security_opt = security_options_with_profile(&seccomp_profile())?;
        Ok(self)
    }
}
